//! Credential bridge tests: atomic mirror of the pull-secret feed, payload
//! validation, and cleanup on shutdown.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use catalogd::secrets::CredentialBridge;

const DOCKER_CONFIG: &str =
    r#"{"auths":{"registry.test":{"auth":"dXNlcjpwYXNzd29yZA=="}}}"#;

#[tokio::test]
async fn writes_and_clears_the_bundle() {
    let temp = TempDir::new().unwrap();
    let bridge = CredentialBridge::new(temp.path()).unwrap();

    // No secret yet: the file is absent and readers must cope.
    assert!(!bridge.path().exists());

    bridge.write(DOCKER_CONFIG.as_bytes()).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(bridge.path()).unwrap(),
        DOCKER_CONFIG
    );

    bridge.clear().await.unwrap();
    assert!(!bridge.path().exists());
    // Clearing twice is fine.
    bridge.clear().await.unwrap();
}

#[tokio::test]
async fn rejects_payloads_that_are_not_docker_config() {
    let temp = TempDir::new().unwrap();
    let bridge = CredentialBridge::new(temp.path()).unwrap();

    assert!(bridge.write(b"not json").await.is_err());
    assert!(bridge.write(b"{\"no-auths\":{}}").await.is_err());
    assert!(!bridge.path().exists());
}

#[tokio::test]
async fn mirrors_the_secret_feed_until_shutdown() {
    let temp = TempDir::new().unwrap();
    let bridge = CredentialBridge::new(temp.path()).unwrap();
    let path = bridge.path().to_path_buf();

    let (secret_tx, secret_rx) = watch::channel::<Option<Vec<u8>>>(None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (change_tx, mut change_rx) = tokio::sync::mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        bridge
            .run(secret_rx, move || change_tx.send(()).unwrap(), shutdown_rx)
            .await;
    });

    secret_tx
        .send(Some(DOCKER_CONFIG.as_bytes().to_vec()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
        .await
        .expect("no change notification")
        .unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), DOCKER_CONFIG);

    // Secret removal takes the bundle with it.
    secret_tx.send(None).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bundle was not removed");

    // Shutdown removes the bundle even when a secret is still present.
    secret_tx
        .send(Some(DOCKER_CONFIG.as_bytes().to_vec()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
        .await
        .expect("no change notification")
        .unwrap();
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("bridge did not stop")
        .unwrap();
    assert!(!path.exists());
}
