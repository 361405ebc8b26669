use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

// Constants for hardcoded values

/// Image-config label naming the subtree that holds catalog metadata.
pub const CONFIG_DIR_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Label the admission defaulter keeps equal to the record name.
pub const METADATA_NAME_LABEL: &str = "olm.operatorframework.io/metadata.name";

/// Finalizer that blocks record deletion until served content is cleaned up.
pub const CATALOG_FINALIZER: &str = "catalogd.operatorframework.io/delete-server-cache";

/// Responses at or above this many bytes are gzipped when the client
/// accepts it (just under one typical MTU).
pub const COMPRESSION_THRESHOLD: u64 = 1400;

/// Manifest Accept header for the registry v2 API.
/// Order: manifest list (Docker), image index (OCI), then single-platform manifests.
pub const MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Default registry token expiry when the token endpoint does not say (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Safety margin subtracted from token expiry (30 seconds)
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Work queue retry backoff base and cap.
pub const BACKOFF_BASE_MS: u64 = 500;
pub const BACKOFF_MAX_SECS: u64 = 300;

/// HTTP server timeouts: reading request headers, reading the rest of a
/// request, and writing a response (catalog responses can be large).
pub const SERVER_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(3);
pub const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const SERVER_WRITE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Namespace used when discovery fails and no flag is given.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "olmv1-system";

/// In-cluster file naming the namespace the process runs in.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// URL prefix all served catalog content lives under.
pub const CATALOGS_URL_PREFIX: &str = "/catalogs";

fn default_layer_concurrency() -> usize {
    6
}

fn default_worker_count() -> usize {
    8
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Runtime configuration assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for caches: unpack tree, pull staging, served content.
    pub cache_dir: PathBuf,
    /// Address the catalog content server binds to.
    pub catalogs_addr: String,
    /// Address probes bind to.
    pub probe_addr: String,
    /// Host (and optional port) advertised in status contentURL.
    pub external_address: String,
    pub system_namespace: String,
    pub gc_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Concurrent layer downloads per pull.
    pub layer_concurrency: usize,
    /// Parallel reconcile workers (serialized per catalog).
    pub worker_count: usize,
    /// Serve catalogs over TLS with this certificate/key pair.
    pub tls: Option<TlsPaths>,
    /// Extra CA certificates trusted when talking to registries.
    pub ca_certs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Config {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Config {
            cache_dir: cache_dir.into(),
            catalogs_addr: "0.0.0.0:8443".to_string(),
            probe_addr: "0.0.0.0:8081".to_string(),
            external_address: "localhost:8443".to_string(),
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            gc_interval: default_gc_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            layer_concurrency: default_layer_concurrency(),
            worker_count: default_worker_count(),
            tls: None,
            ca_certs_dir: None,
        }
    }

    /// Root of the unpack cache: `{cache_dir}/unpack/{catalog}/{digest}`.
    pub fn unpack_root(&self) -> PathBuf {
        self.cache_dir.join("unpack")
    }

    /// Root of served content: `{cache_dir}/catalogs/{catalog}/…`.
    pub fn served_root(&self) -> PathBuf {
        self.cache_dir.join("catalogs")
    }

    /// Staging area for per-pull OCI layouts and the credential bundle.
    pub fn tmp_root(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// Base URL advertised for served catalogs.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.external_address, CATALOGS_URL_PREFIX)
    }
}

/// Discover the system namespace: explicit flag wins, then the in-cluster
/// service account file, then the hard-coded default.
pub fn discover_system_namespace(flag: &str) -> String {
    if !flag.is_empty() {
        return flag.to_string();
    }
    match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => DEFAULT_SYSTEM_NAMESPACE.to_string(),
    }
}

/// Parse a duration string of the form `300ms`, `10s`, `5m`, `1h`, `24h`,
/// including compound forms like `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }
    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let mut unit = c.to_string();
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let value: f64 = num
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration {:?}", s)))?;
        num.clear();
        let unit_secs = match unit.as_str() {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(Error::Config(format!("invalid duration unit {:?} in {:?}", unit, s))),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    if !num.is_empty() {
        return Err(Error::Config(format!("duration {:?} is missing a unit", s)));
    }
    Ok(total)
}

/// Render a duration back into the `5m`/`90s`/`100ms` wire form.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// Serde adapter for optional duration-string fields (`pollInterval: "5m"`).
pub mod duration_string_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&super::format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        match raw {
            Some(s) => super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Validate a `<namespace>/<name>` pull-secret identifier.
pub fn parse_namespaced_name(s: &str) -> Result<(String, String)> {
    let mut parts = s.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err(Error::Config(format!(
            "global pull secret {:?} is not in the format <namespace>/<name>",
            s
        ))),
    }
}

/// Ensure the directories the service owns exist.
pub fn ensure_layout(config: &Config) -> Result<()> {
    for dir in [
        config.unpack_root(),
        config.served_root(),
        config.tmp_root(),
    ] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Config(format!("failed to create directory {}: {}", dir.display(), e)))?;
    }
    Ok(())
}

pub fn exponential_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms).min(Duration::from_secs(BACKOFF_MAX_SECS))
}
