//! Content store: owns the served root, converts unpacked catalogs into
//! their canonical serialization on disk, and publishes them behind an
//! `all.json` symlink with a single atomic rename.
//!
//! Layout per catalog:
//!
//! ```text
//! {served_root}/{catalog}/{digest_hex}.jsonl   content file
//! {served_root}/{catalog}/all.json             symlink -> current content file
//! ```
//!
//! A crash between writing the content file and renaming the symlink leaves
//! the previous content served and the new file orphaned; orphans are
//! reaped on the next successful store.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::serializer;

pub const SERVED_FILE: &str = "all.json";

#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("failed to create served root: {}", e)))?;
        Ok(LocalDirStorage {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_dir(&self, catalog: &str) -> PathBuf {
        self.root.join(catalog)
    }

    fn served_link(&self, catalog: &str) -> PathBuf {
        self.catalog_dir(catalog).join(SERVED_FILE)
    }

    fn content_file_name(digest_hex: &str) -> String {
        format!("{}.jsonl", digest_hex)
    }

    /// Serialize `unpack_dir` and publish it as the catalog's served
    /// content. Serialization and fsync happen on a blocking thread; the
    /// publish itself is one symlink rename, and the previous content file
    /// is unlinked only after the rename lands.
    pub async fn store(&self, catalog: &str, digest_hex: &str, unpack_dir: &Path) -> Result<()> {
        let catalog_dir = self.catalog_dir(catalog);
        tokio::fs::create_dir_all(&catalog_dir).await?;

        let content_name = Self::content_file_name(digest_hex);
        let content_path = catalog_dir.join(&content_name);
        let link_path = self.served_link(catalog);

        let previous_target = tokio::fs::read_link(&link_path)
            .await
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_os_string()));

        let unpack_dir = unpack_dir.to_path_buf();
        let write_path = content_path.clone();
        let metas = tokio::task::spawn_blocking(move || -> Result<u64> {
            let file = std::fs::File::create(&write_path)?;
            let mut writer = std::io::BufWriter::new(file);
            let metas = serializer::write_catalog(&unpack_dir, &mut writer)?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| Error::Storage(format!("failed to flush content file: {}", e)))?
                .sync_all()?;
            Ok(metas)
        })
        .await
        .map_err(|e| Error::Storage(format!("serializer task panicked: {}", e)))??;

        // Publish: write the symlink at a temp name, rename over all.json.
        let tmp_link = catalog_dir.join(format!(".{}.tmp", SERVED_FILE));
        let _ = tokio::fs::remove_file(&tmp_link).await;
        symlink(&content_name, &tmp_link)?;
        tokio::fs::rename(&tmp_link, &link_path)
            .await
            .map_err(|e| Error::Storage(format!("failed to publish catalog content: {}", e)))?;

        tracing::info!(
            catalog = %catalog,
            digest = %digest_hex,
            metas = metas,
            "published catalog content"
        );

        // The rename landed; the old target and any orphans are dead now.
        if let Some(previous) = previous_target {
            if previous != content_name.as_str() {
                let _ = tokio::fs::remove_file(catalog_dir.join(previous)).await;
            }
        }
        self.reap_orphans(&catalog_dir, &content_name).await;
        Ok(())
    }

    /// Remove content files no symlink points at (left behind by a crash
    /// between write and publish).
    async fn reap_orphans(&self, catalog_dir: &Path, current: &str) {
        let Ok(mut entries) = tokio::fs::read_dir(catalog_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == SERVED_FILE || name == current || !name.ends_with(".jsonl") {
                continue;
            }
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }

    /// True when the catalog has published content.
    pub fn exists(&self, catalog: &str) -> bool {
        self.served_link(catalog)
            .metadata()
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Digest hex of the currently served content, from the symlink target.
    pub fn current_digest(&self, catalog: &str) -> Option<String> {
        let target = std::fs::read_link(self.served_link(catalog)).ok()?;
        let name = target.file_name()?.to_str()?;
        name.strip_suffix(".jsonl").map(|d| d.to_string())
    }

    /// Drop everything served for the catalog.
    pub async fn delete(&self, catalog: &str) -> Result<()> {
        let dir = self.catalog_dir(catalog);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Delete(format!(
                "failed to delete served content for catalog {}: {}",
                catalog, e
            ))),
        }
    }

    /// Absolute URL the catalog's content is served at.
    pub fn url(&self, catalog: &str) -> String {
        format!("{}/{}/{}", self.base_url, catalog, SERVED_FILE)
    }
}

#[cfg(unix)]
fn symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| Error::Storage(format!("failed to create symlink {}: {}", link.display(), e)))
}

#[cfg(not(unix))]
fn symlink(_target: &str, _link: &Path) -> Result<()> {
    Err(Error::Storage(
        "symlink publish is only supported on unix".to_string(),
    ))
}
