//! Credential bridge: mirrors the designated pull-secret onto disk in
//! docker-config format. The bridge exists because the registry client
//! resolves authentication from a file path, not from in-memory values;
//! the watched secret is the source of truth and every change is written
//! atomically so the puller never reads a torn config.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};

pub struct CredentialBridge {
    path: PathBuf,
}

impl CredentialBridge {
    /// The bundle lives at `{tmp_root}/auth-{pid}.json`; the pid keeps
    /// concurrent processes sharing a tmp root apart. The file is not
    /// created until a secret arrives.
    pub fn new(tmp_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(tmp_root)?;
        let path = tmp_root.join(format!("auth-{}.json", std::process::id()));
        Ok(CredentialBridge { path })
    }

    /// Path the registry client reads. Readers tolerate absence.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and atomically write a docker-config payload.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let parsed: Value = serde_json::from_slice(payload).map_err(|e| {
            Error::Config(format!("pull secret is not valid docker-config JSON: {}", e))
        })?;
        if !parsed.get("auths").map(|a| a.is_object()).unwrap_or(false) {
            return Err(Error::Config(
                "pull secret is missing the docker-config auths object".to_string(),
            ));
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::info!(path = %self.path.display(), "updated credential bundle");
        Ok(())
    }

    /// Remove the bundle; subsequent pulls run unauthenticated.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mirror the secret feed until it closes or shutdown flips. Each
    /// change is applied before `on_change` fires so pulls triggered by the
    /// notification see the new bundle.
    pub async fn run<F>(
        &self,
        mut secrets: watch::Receiver<Option<Vec<u8>>>,
        on_change: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn(),
    {
        loop {
            let current = secrets.borrow_and_update().clone();
            match current {
                Some(payload) => {
                    if let Err(e) = self.write(&payload).await {
                        tracing::error!(error = %e, "failed to write credential bundle");
                    } else {
                        on_change();
                    }
                }
                None => {
                    if let Err(e) = self.clear().await {
                        tracing::error!(error = %e, "failed to remove credential bundle");
                    }
                }
            }

            tokio::select! {
                changed = secrets.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        if let Err(e) = self.clear().await {
            tracing::warn!(error = %e, "failed to remove credential bundle on shutdown");
        }
    }
}
