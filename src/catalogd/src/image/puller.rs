//! The image puller: desired reference in, unpacked catalog directory out.
//!
//! Resolution, download, and unpack are arranged so that every exit path
//! leaves the cache consistent: staging directories are temp-scoped, the
//! final directory appears only through an atomic rename, and concurrent
//! pulls of the same digest converge on one surviving directory.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::UnpackCache;
use crate::config::CONFIG_DIR_LABEL;
use crate::error::{Error, Result};
use crate::image::layer::apply_layer;
use crate::image::policy::SignaturePolicy;
use crate::image::reference::ImageReference;
use crate::image::registry::RegistryClient;

pub struct ImagePuller {
    cache: UnpackCache,
    registry: Arc<RegistryClient>,
    /// Parent directory for per-pull staging layouts.
    staging_root: PathBuf,
    layer_concurrency: usize,
}

/// Outcome of a pull. `polled` records whether content was actually
/// pulled, which is what drives the `lastPollAttempt` timestamp; resolving
/// a tag that still points at cached content moves nothing, and a
/// digest-pinned catalog that was already unpacked never talks to the
/// registry at all.
#[derive(Debug, Clone)]
pub struct PullResult {
    /// Canonical `registry/repo@sha256:…`.
    pub resolved_reference: String,
    /// Digest hex, without the `sha256:` prefix.
    pub digest_hex: String,
    pub unpack_dir: PathBuf,
    pub polled: bool,
    /// True when this pull created the unpack directory (as opposed to
    /// finding it already present).
    pub unpacked: bool,
}

impl ImagePuller {
    pub fn new(
        cache: UnpackCache,
        registry: Arc<RegistryClient>,
        staging_root: PathBuf,
        layer_concurrency: usize,
    ) -> Self {
        ImagePuller {
            cache,
            registry,
            staging_root,
            layer_concurrency: layer_concurrency.max(1),
        }
    }

    pub async fn pull(&self, catalog: &str, raw_reference: &str) -> Result<PullResult> {
        let reference = ImageReference::parse(raw_reference)?;

        // A pinned digest that is already unpacked needs no network at all.
        if let Some(digest_hex) = reference.digest_hex() {
            if self.cache.exists(catalog, digest_hex) {
                tracing::debug!(catalog = %catalog, digest = %digest_hex, "image already unpacked");
                return Ok(PullResult {
                    resolved_reference: reference.to_string(),
                    digest_hex: digest_hex.to_string(),
                    unpack_dir: self.cache.path(catalog, digest_hex),
                    polled: false,
                    unpacked: false,
                });
            }
        }

        let digest = self.registry.resolve_digest(&reference).await?;
        let digest_hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::Registry(format!("unexpected digest format {:?}", digest)))?
            .to_string();
        let resolved_reference = reference.canonical(&digest);

        // Existence short-circuit after resolution: the tag still points at
        // a cached digest, so nothing is pulled and no timestamp moves.
        if self.cache.exists(catalog, &digest_hex) {
            tracing::debug!(catalog = %catalog, digest = %digest_hex, "resolved digest already unpacked");
            return Ok(PullResult {
                resolved_reference,
                digest_hex: digest_hex.clone(),
                unpack_dir: self.cache.path(catalog, &digest_hex),
                polled: false,
                unpacked: false,
            });
        }

        let policy = SignaturePolicy::load()?;
        policy.check(&resolved_reference)?;

        self.pull_and_unpack(catalog, &reference, &digest, &digest_hex)
            .await?;

        let unpack_dir = self.cache.publish(catalog, &digest_hex).await?;
        tracing::info!(
            catalog = %catalog,
            image = %resolved_reference,
            path = %unpack_dir.display(),
            "unpacked catalog image"
        );

        // Superseded digests are garbage now. Failing to prune is not fatal.
        if let Err(e) = self.cache.prune_siblings(catalog, &digest_hex).await {
            tracing::warn!(catalog = %catalog, error = %e, "failed to prune old unpack directories");
        }

        Ok(PullResult {
            resolved_reference,
            digest_hex,
            unpack_dir,
            polled: true,
            unpacked: true,
        })
    }

    /// Download all layers into a per-pull staging layout, then apply them
    /// in manifest order into the cache's staging directory.
    async fn pull_and_unpack(
        &self,
        catalog: &str,
        reference: &ImageReference,
        digest: &str,
        digest_hex: &str,
    ) -> Result<()> {
        let manifest = self.registry.fetch_manifest(reference, digest).await?;

        let config_digest = manifest
            .get("config")
            .and_then(|c| c.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| {
                Error::Registry(format!("manifest for {} has no config digest", reference))
            })?;
        let config = self.registry.fetch_json_blob(reference, config_digest).await?;
        let subtree = catalog_subtree(&config).ok_or_else(|| {
            Error::Unrecoverable(format!(
                "catalog image {} is missing the required label {:?}",
                reference, CONFIG_DIR_LABEL
            ))
        })?;

        let layer_digests = layer_digests(&manifest)?;
        tracing::debug!(
            catalog = %catalog,
            layers = layer_digests.len(),
            subtree = %subtree,
            "pulling catalog image layers"
        );

        // Per-pull staging layout; removed on every exit path by the
        // tempdir guard.
        tokio::fs::create_dir_all(&self.staging_root).await?;
        let layout = tempfile::Builder::new()
            .prefix("layout-")
            .tempdir_in(&self.staging_root)
            .map_err(|e| Error::Cache(format!("failed to create staging layout: {}", e)))?;

        // Fetch every layer concurrently, bounded by the semaphore.
        let semaphore = Arc::new(Semaphore::new(self.layer_concurrency));
        let mut handles = Vec::new();
        for layer_digest in &layer_digests {
            let registry = self.registry.clone();
            let reference = reference.clone();
            let layer_digest = layer_digest.clone();
            let dest = layout.path().join(layer_digest.replace(':', "-"));
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                registry
                    .download_blob(&reference, &layer_digest, &dest)
                    .await
                    .map(|_| dest)
            }));
        }

        let mut layer_paths = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for result in future::join_all(handles).await {
            match result {
                Ok(Ok(path)) => layer_paths.push(path),
                Ok(Err(e)) => first_error = first_error.or(Some(e)),
                Err(e) => {
                    first_error =
                        first_error.or(Some(Error::Registry(format!("layer task panicked: {}", e))))
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Apply in manifest order into `{digest}.tmp`. Any per-layer error
        // discards the whole staging directory.
        let staging = self.cache.staging_path(catalog, digest_hex);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        for (index, layer_path) in layer_paths.iter().enumerate() {
            let layer_path = layer_path.clone();
            let staging_dir = staging.clone();
            let subtree = subtree.clone();
            let applied = tokio::task::spawn_blocking(move || {
                apply_layer(&layer_path, &staging_dir, &subtree)
            })
            .await
            .map_err(|e| Error::Cache(format!("layer apply task panicked: {}", e)))?;

            if let Err(e) = applied {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
            tracing::debug!(catalog = %catalog, layer = index, "applied layer");
        }

        Ok(())
    }
}

/// The subtree holding catalog metadata, named by the image-config label.
/// Only the base name matters for the tar filter.
fn catalog_subtree(config: &Value) -> Option<String> {
    let label = config
        .get("config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.get(CONFIG_DIR_LABEL))
        .and_then(|v| v.as_str())?;
    let base = label.trim_matches('/').split('/').next_back()?;
    if base.is_empty() {
        return None;
    }
    Some(base.to_string())
}

fn layer_digests(manifest: &Value) -> Result<Vec<String>> {
    let layers = manifest
        .get("layers")
        .and_then(|l| l.as_array())
        .ok_or_else(|| Error::Registry("manifest has no layers array".to_string()))?;
    layers
        .iter()
        .map(|layer| {
            layer
                .get("digest")
                .and_then(|d| d.as_str())
                .map(|d| d.to_string())
                .ok_or_else(|| Error::Registry("manifest layer has no digest".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subtree_comes_from_config_label() {
        let config = json!({
            "config": {"Labels": {CONFIG_DIR_LABEL: "/configs"}}
        });
        assert_eq!(catalog_subtree(&config).as_deref(), Some("configs"));

        let nested = json!({
            "config": {"Labels": {CONFIG_DIR_LABEL: "/var/lib/catalog"}}
        });
        assert_eq!(catalog_subtree(&nested).as_deref(), Some("catalog"));

        let missing = json!({"config": {"Labels": {}}});
        assert_eq!(catalog_subtree(&missing), None);
    }

    #[test]
    fn layer_digests_follow_manifest_order() {
        let manifest = json!({
            "layers": [
                {"digest": "sha256:aaa"},
                {"digest": "sha256:bbb"},
            ]
        });
        assert_eq!(
            layer_digests(&manifest).unwrap(),
            vec!["sha256:aaa".to_string(), "sha256:bbb".to_string()]
        );
        assert!(layer_digests(&json!({})).is_err());
    }
}
