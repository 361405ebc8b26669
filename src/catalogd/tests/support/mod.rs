//! Shared test support: an in-process registry speaking just enough of the
//! v2 API for the puller, plus helpers for building catalog image fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

pub const CONFIG_DIR_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

#[derive(Default)]
struct MockState {
    /// digest -> blob bytes
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// tag or digest -> manifest bytes
    manifests: Mutex<HashMap<String, Vec<u8>>>,
    fail: Mutex<bool>,
}

pub struct MockRegistry {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/v2/", get(|| async { "{}" }))
            .route("/v2/*rest", get(serve_v2))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockRegistry { addr, state }
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Make every manifest/blob request fail with a 500 until reset.
    pub fn set_failing(&self, fail: bool) {
        *self.state.fail.lock().unwrap() = fail;
    }

    /// Publish a catalog image whose single layer holds `files` under the
    /// `configs/` subtree. Returns the manifest digest (`sha256:<hex>`).
    pub fn publish_catalog<S: AsRef<str>>(&self, tag: &str, files: &[(&str, S)]) -> String {
        let layer = build_layer_targz(files);
        let layer_digest = digest_of(&layer);

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Labels": { CONFIG_DIR_LABEL: "/configs" }
            }
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = digest_of(&config_bytes);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = digest_of(&manifest_bytes);

        let mut blobs = self.state.blobs.lock().unwrap();
        blobs.insert(layer_digest, layer);
        blobs.insert(config_digest, config_bytes);
        drop(blobs);

        let mut manifests = self.state.manifests.lock().unwrap();
        manifests.insert(tag.to_string(), manifest_bytes.clone());
        manifests.insert(manifest_digest.clone(), manifest_bytes);

        manifest_digest
    }
}

async fn serve_v2(State(state): State<Arc<MockState>>, uri: Uri) -> axum::response::Response {
    if *state.fail.lock().unwrap() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "registry down").into_response();
    }

    let path = uri.path().to_string();
    if let Some(idx) = path.rfind("/manifests/") {
        let reference = path[idx + "/manifests/".len()..].to_string();
        let manifests = state.manifests.lock().unwrap();
        match manifests.get(&reference) {
            Some(bytes) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    "Docker-Content-Digest",
                    digest_of(bytes).parse().unwrap(),
                );
                headers.insert(
                    "Content-Type",
                    "application/vnd.oci.image.manifest.v1+json".parse().unwrap(),
                );
                (StatusCode::OK, headers, bytes.clone()).into_response()
            }
            None => (StatusCode::NOT_FOUND, "manifest unknown").into_response(),
        }
    } else if let Some(idx) = path.rfind("/blobs/") {
        let digest = path[idx + "/blobs/".len()..].to_string();
        let blobs = state.blobs.lock().unwrap();
        match blobs.get(&digest) {
            Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
            None => (StatusCode::NOT_FOUND, "blob unknown").into_response(),
        }
    } else {
        (StatusCode::BAD_REQUEST, "invalid v2 path").into_response()
    }
}

/// Gzipped tar layer with every file placed under `configs/`.
pub fn build_layer_targz<S: AsRef<str>>(files: &[(&str, S)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let content = content.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("configs/{}", name),
                content.as_bytes(),
            )
            .unwrap();
    }
    let encoder = builder.into_inner().unwrap();
    encoder.finish().unwrap()
}

pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// A small FBC package meta as a pretty-printed JSON document; the
/// serializer must compact it onto one line with sorted keys.
pub fn package_json(name: &str) -> String {
    format!(
        "{{\n  \"schema\": \"olm.package\",\n  \"name\": \"{}\",\n  \"defaultChannel\": \"stable\"\n}}\n",
        name
    )
}

/// Canonical serialization of [`package_json`].
pub fn package_jsonl(name: &str) -> String {
    format!(
        "{{\"defaultChannel\":\"stable\",\"name\":\"{}\",\"schema\":\"olm.package\"}}\n",
        name
    )
}
