pub mod layer;
pub mod policy;
pub mod puller;
pub mod reference;
pub mod registry;

pub use puller::{ImagePuller, PullResult};
pub use reference::ImageReference;
pub use registry::RegistryClient;
