//! Garbage collector tests: only unpack directories without an owning
//! record are removed, and surviving records keep every digest directory.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use catalogd::gc::collect_once;
use catalogd::record::{
    CatalogRecord, CatalogSource, CatalogSpec, CatalogStatus, ImageSource, Metadata,
};
use catalogd::{InMemoryRecordStore, RecordStore, UnpackCache};

fn record(name: &str) -> CatalogRecord {
    CatalogRecord {
        metadata: Metadata {
            name: name.to_string(),
            ..Metadata::default()
        },
        spec: CatalogSpec {
            source: CatalogSource::Image {
                image: ImageSource {
                    reference: "registry.test/cat:v1".to_string(),
                    poll_interval: None,
                },
            },
            priority: 0,
        },
        status: CatalogStatus::default(),
    }
}

fn seed_unpack_dir(cache: &UnpackCache, catalog: &str, digest: &str) {
    let dir = cache.path(catalog, digest);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("catalog.json"), "{}").unwrap();
}

#[tokio::test]
async fn removes_only_orphaned_catalogs() {
    let temp = TempDir::new().unwrap();
    let cache = UnpackCache::new(temp.path().join("unpack")).unwrap();
    let store = Arc::new(InMemoryRecordStore::new());
    store.apply(record("c1")).unwrap();

    seed_unpack_dir(&cache, "c1", "aaa");
    seed_unpack_dir(&cache, "c1", "bbb");
    seed_unpack_dir(&cache, "c2", "ccc");

    let record_store: Arc<dyn RecordStore> = store.clone();
    let removed = collect_once(&record_store, &cache).await.unwrap();
    assert_eq!(removed, 1);

    // Surviving record keeps every digest directory, untouched.
    assert!(cache.path("c1", "aaa").join("catalog.json").is_file());
    assert!(cache.path("c1", "bbb").join("catalog.json").is_file());
    assert!(!temp.path().join("unpack/c2").exists());

    // The surviving set is a subset of record names.
    assert_eq!(cache.catalogs().await.unwrap(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn empty_cache_and_empty_store_are_fine() {
    let temp = TempDir::new().unwrap();
    let cache = UnpackCache::new(temp.path().join("unpack")).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());

    assert_eq!(collect_once(&store, &cache).await.unwrap(), 0);

    // With no records at all, everything in the cache is an orphan.
    seed_unpack_dir(&cache, "stale", "ddd");
    assert_eq!(collect_once(&store, &cache).await.unwrap(), 1);
    assert!(cache.catalogs().await.unwrap().is_empty());
}

#[tokio::test]
async fn gc_loop_runs_on_startup() {
    let temp = TempDir::new().unwrap();
    let cache = UnpackCache::new(temp.path().join("unpack")).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    seed_unpack_dir(&cache, "stale", "eee");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(catalogd::gc::run(
        store,
        cache.clone(),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    // The first sweep happens immediately, not after the first interval.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cache.catalogs().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("startup garbage collection did not run");

    shutdown_tx.send(true).unwrap();
    let _ = handle.await;
}
