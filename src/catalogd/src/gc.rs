//! Garbage collection of the unpack cache. Runs at startup and on a fixed
//! interval, independent of the reconciler: any cached catalog directory
//! whose owning record no longer exists is removed. Reconciler-initiated
//! removals are idempotent and the criterion here is strictly "no owning
//! record", so racing the reconciler is safe.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::UnpackCache;
use crate::error::Result;
use crate::record::RecordStore;

/// One sweep. Returns the number of catalog directories removed.
pub async fn collect_once(store: &Arc<dyn RecordStore>, cache: &UnpackCache) -> Result<usize> {
    let live: HashSet<String> = store
        .list()
        .await?
        .into_iter()
        .map(|record| record.metadata.name)
        .collect();

    let mut removed = 0usize;
    for catalog in cache.catalogs().await? {
        if live.contains(&catalog) {
            continue;
        }
        match cache.remove(&catalog).await {
            Ok(()) => {
                tracing::info!(catalog = %catalog, "garbage collected orphaned unpack directory");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(catalog = %catalog, error = %e, "failed to garbage collect unpack directory");
            }
        }
    }
    Ok(removed)
}

/// Sweep loop: once at startup, then every `interval` until shutdown.
pub async fn run(
    store: Arc<dyn RecordStore>,
    cache: UnpackCache,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match collect_once(&store, &cache).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed = removed, "unpack cache garbage collection complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "unpack cache garbage collection failed");
                    }
                }
            }
            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
        }
    }
}
