//! Content store and HTTP serving contract tests: atomic symlink publish,
//! ETag round-trips, the gzip threshold, and the 404 surface.

mod support;

use std::io::Read;
use std::sync::Arc;

use tempfile::TempDir;

use catalogd::server;
use catalogd::LocalDirStorage;

/// Write an unpack-directory fixture holding the given catalog files.
fn unpack_fixture(temp: &TempDir, files: &[(&str, String)]) -> std::path::PathBuf {
    let dir = temp.path().join("unpacked");
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
    dir
}

fn storage(temp: &TempDir) -> Arc<LocalDirStorage> {
    Arc::new(
        LocalDirStorage::new(temp.path().join("served"), "http://test-addr/catalogs").unwrap(),
    )
}

/// Bind the catalog router on an ephemeral port and return its base URL.
async fn serve(storage: Arc<LocalDirStorage>) -> String {
    let app = server::catalogs_router(storage);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn store_publishes_behind_symlink() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let unpack = unpack_fixture(
        &temp,
        &[("package.json", support::package_json("cockroachdb"))],
    );

    assert!(!store.exists("test-catalog"));
    store.store("test-catalog", "aaa111", &unpack).await.unwrap();

    assert!(store.exists("test-catalog"));
    assert_eq!(store.current_digest("test-catalog").as_deref(), Some("aaa111"));
    assert_eq!(
        store.url("test-catalog"),
        "http://test-addr/catalogs/test-catalog/all.json"
    );

    let catalog_dir = store.catalog_dir("test-catalog");
    let link = std::fs::read_link(catalog_dir.join("all.json")).unwrap();
    assert_eq!(link, std::path::PathBuf::from("aaa111.jsonl"));
    let body = std::fs::read_to_string(catalog_dir.join("all.json")).unwrap();
    assert_eq!(body, support::package_jsonl("cockroachdb"));
}

#[tokio::test]
async fn store_replaces_old_content_and_reaps_orphans() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let unpack = unpack_fixture(&temp, &[("package.json", support::package_json("one"))]);
    store.store("c", "aaa", &unpack).await.unwrap();

    // An orphan left by a crash between write and publish.
    let catalog_dir = store.catalog_dir("c");
    std::fs::write(catalog_dir.join("dead.jsonl"), b"orphan").unwrap();

    let unpack2 = {
        let dir = temp.path().join("unpacked2");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), support::package_json("two")).unwrap();
        dir
    };
    store.store("c", "bbb", &unpack2).await.unwrap();

    assert_eq!(store.current_digest("c").as_deref(), Some("bbb"));
    let mut names: Vec<_> = std::fs::read_dir(&catalog_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["all.json", "bbb.jsonl"]);
}

#[tokio::test]
async fn delete_removes_served_content() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let unpack = unpack_fixture(&temp, &[("package.json", support::package_json("gone"))]);
    store.store("c", "aaa", &unpack).await.unwrap();

    store.delete("c").await.unwrap();
    assert!(!store.exists("c"));
    assert!(!store.catalog_dir("c").exists());

    // Deleting a catalog that was never stored is not an error.
    store.delete("never-stored").await.unwrap();
}

#[tokio::test]
async fn serves_404_outside_catalog_files() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    std::fs::create_dir_all(store.catalog_dir("test-catalog")).unwrap();
    let base = serve(store.clone()).await;
    let client = reqwest::Client::new();

    for path in [
        "/",
        "/catalogs/",
        "/catalogs/test-catalog/",
        "/test-catalog/foo.txt",
        "/catalogs/test-catalog/non-existent.txt",
        "/catalogs/../etc/passwd",
    ] {
        let response = client.get(format!("{}{}", base, path)).send().await.unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::NOT_FOUND,
            "expected 404 for {}",
            path
        );
    }

    // Regular files under the served root are reachable beneath /catalogs/.
    std::fs::write(store.root().join("foo.txt"), b"bar").unwrap();
    std::fs::write(store.catalog_dir("test-catalog").join("foo.txt"), b"bar").unwrap();
    for path in ["/catalogs/foo.txt", "/catalogs/test-catalog/foo.txt"] {
        let response = client.get(format!("{}{}", base, path)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"bar");
    }
}

#[tokio::test]
async fn etag_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let unpack = unpack_fixture(&temp, &[("package.json", support::package_json("etag"))]);
    store.store("c", "abc123", &unpack).await.unwrap();
    let base = serve(store).await;
    let client = reqwest::Client::new();
    let url = format!("{}/catalogs/c/all.json", base);

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let etag = response.headers()["etag"].to_str().unwrap().to_string();
    assert_eq!(etag, "abc123");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), support::package_jsonl("etag").as_bytes());

    // Matching If-None-Match: 304, same ETag, empty body.
    let response = client
        .get(&url)
        .header("If-None-Match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()["etag"].to_str().unwrap(), etag);
    assert!(response.bytes().await.unwrap().is_empty());

    // Non-matching If-None-Match: full body again.
    let response = client
        .get(&url)
        .header("If-None-Match", "not-the-etag")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        support::package_jsonl("etag").as_bytes()
    );
}

/// A catalog big enough to clear the 1400-byte compression threshold.
fn large_fixture(temp: &TempDir) -> (std::path::PathBuf, String) {
    let mut source = String::new();
    let mut expected = String::new();
    for i in 0..30 {
        let name = format!("package-{:02}", i);
        source.push_str(&support::package_json(&name));
        expected.push_str(&support::package_jsonl(&name));
    }
    assert!(expected.len() > 1400);
    (unpack_fixture(temp, &[("catalog.json", source)]), expected)
}

#[tokio::test]
async fn gzips_large_bodies_when_accepted() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let (unpack, expected) = large_fixture(&temp);
    store.store("c", "big", &unpack).await.unwrap();
    let base = serve(store).await;
    let url = format!("{}/catalogs/c/all.json", base);
    let client = reqwest::Client::new();

    let response = client
        .get(&url)
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    assert_eq!(response.headers()["etag"], "big");

    let compressed = response.bytes().await.unwrap();
    let mut decoded = String::new();
    flate2::read::GzDecoder::new(compressed.as_ref())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, expected);
}

#[tokio::test]
async fn does_not_gzip_without_accept_encoding() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let (unpack, expected) = large_fixture(&temp);
    store.store("c", "big", &unpack).await.unwrap();
    let base = serve(store).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/catalogs/c/all.json", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.bytes().await.unwrap().as_ref(), expected.as_bytes());
}

#[tokio::test]
async fn does_not_gzip_small_bodies() {
    let temp = TempDir::new().unwrap();
    let store = storage(&temp);
    let unpack = unpack_fixture(&temp, &[("package.json", support::package_json("small"))]);
    store.store("c", "small", &unpack).await.unwrap();
    let base = serve(store).await;
    let client = reqwest::Client::new();

    let expected = support::package_jsonl("small");
    assert!(expected.len() < 1400);
    let response = client
        .get(format!("{}/catalogs/c/all.json", base))
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.bytes().await.unwrap().as_ref(), expected.as_bytes());
}
