/// Version string baked in at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
