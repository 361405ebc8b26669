//! Unpack cache: the `{unpack_root}/{catalog}/{digest}` filesystem
//! discipline. Holds no in-memory state; every operation is a plain
//! filesystem action, and publish is a single atomic rename so concurrent
//! pulls and the garbage collector can race it safely.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct UnpackCache {
    root: PathBuf,
}

impl UnpackCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Cache(format!("failed to create unpack root: {}", e)))?;
        Ok(UnpackCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of an unpacked digest.
    pub fn path(&self, catalog: &str, digest_hex: &str) -> PathBuf {
        self.root.join(catalog).join(digest_hex)
    }

    /// Staging directory the puller fills before publishing.
    pub fn staging_path(&self, catalog: &str, digest_hex: &str) -> PathBuf {
        self.root.join(catalog).join(format!("{}.tmp", digest_hex))
    }

    /// True when the digest is already unpacked (and is a directory).
    pub fn exists(&self, catalog: &str, digest_hex: &str) -> bool {
        self.path(catalog, digest_hex).is_dir()
    }

    /// Commit a staged unpack: rename `{digest}.tmp` onto `{digest}`. If a
    /// concurrent pull already published the same digest, the staging
    /// directory is discarded and the existing directory wins.
    pub async fn publish(&self, catalog: &str, digest_hex: &str) -> Result<PathBuf> {
        let staging = self.staging_path(catalog, digest_hex);
        let target = self.path(catalog, digest_hex);
        match tokio::fs::rename(&staging, &target).await {
            Ok(()) => Ok(target),
            Err(_) if target.is_dir() => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                Ok(target)
            }
            Err(e) => Err(Error::Cache(format!(
                "failed to publish unpack directory {}: {}",
                target.display(),
                e
            ))),
        }
    }

    /// Remove every sibling of `keep_digest` under the catalog, including
    /// stale `.tmp` staging directories. Idempotent; racing removals of the
    /// same sibling are not an error.
    pub async fn prune_siblings(&self, catalog: &str, keep_digest: &str) -> Result<()> {
        let catalog_dir = self.root.join(catalog);
        let mut entries = match tokio::fs::read_dir(&catalog_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str() == Some(keep_digest) {
                continue;
            }
            let path = entry.path();
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::Cache(format!(
                        "failed to prune {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop everything cached for a catalog.
    pub async fn remove(&self, catalog: &str) -> Result<()> {
        let path = self.root.join(catalog);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Delete(format!(
                "failed to remove unpack cache for catalog {}: {}",
                catalog, e
            ))),
        }
    }

    /// Names of catalogs currently present in the cache.
    pub async fn catalogs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
