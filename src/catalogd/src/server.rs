//! HTTP surface for served catalog content.
//!
//! The serving contract is bit-level because clients cache aggressively:
//! the ETag is the digest taken from the `all.json` symlink target,
//! `If-None-Match` short-circuits to 304, and bodies at or over the
//! compression threshold are gzipped as a stream when the client accepts
//! it. Directory listings and paths outside `/catalogs/` are 404.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_compression::tokio::bufread::GzipEncoder;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tower::ServiceBuilder;
use tower_http::map_request_body::MapRequestBodyLayer;
use tower_http::timeout::{
    RequestBodyTimeoutLayer, ResponseBodyTimeoutLayer, TimeoutBody, TimeoutLayer,
};

use crate::config::{
    TlsPaths, CATALOGS_URL_PREFIX, COMPRESSION_THRESHOLD, SERVER_READ_HEADER_TIMEOUT,
    SERVER_READ_TIMEOUT, SERVER_WRITE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::storage::LocalDirStorage;

pub fn catalogs_router(storage: Arc<LocalDirStorage>) -> Router {
    Router::new()
        .route(
            &format!("{}/*path", CATALOGS_URL_PREFIX),
            get(serve_content),
        )
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(storage)
}

/// Liveness/readiness probes, bound separately from the content server.
pub fn probe_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "ok") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "ok") }))
}

async fn serve_content(
    State(storage): State<Arc<LocalDirStorage>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request_path = uri.path();
    let relative = match sanitize_request_path(request_path) {
        Some(relative) => relative,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let full_path = storage.root().join(&relative);

    // Directory listings are never served.
    let metadata = match tokio::fs::metadata(&full_path).await {
        Ok(m) if m.is_file() => m,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };

    // The ETag is the digest encoded in the symlink target's file name.
    let etag = tokio::fs::read_link(&full_path)
        .await
        .ok()
        .and_then(|target| {
            target
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(|s| s.to_string())
        });

    if let Some(etag) = &etag {
        let matched = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().trim_matches('"') == etag)
            .unwrap_or(false);
        if matched {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            if let Ok(value) = HeaderValue::from_str(etag) {
                response.headers_mut().insert(header::ETAG, value);
            }
            return response;
        }
    }

    let file = match tokio::fs::File::open(&full_path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %full_path.display(), error = %e, "failed to open served file");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&full_path)),
    );
    if let Some(etag) = &etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            response_headers.insert(header::ETAG, value);
        }
    }

    // Stream the compressed body; never buffer the full response.
    if metadata.len() >= COMPRESSION_THRESHOLD && accepts_gzip(&headers) {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let encoder = GzipEncoder::new(BufReader::new(file));
        let body = Body::from_stream(ReaderStream::new(encoder));
        return (StatusCode::OK, response_headers, body).into_response();
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    let body = Body::from_stream(ReaderStream::new(file));
    (StatusCode::OK, response_headers, body).into_response()
}

/// Strip the `/catalogs/` prefix and reject anything that could walk out
/// of the served root.
fn sanitize_request_path(request_path: &str) -> Option<PathBuf> {
    let rest = request_path.strip_prefix(CATALOGS_URL_PREFIX)?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|enc| enc.trim().split(';').next() == Some("gzip"))
        })
        .unwrap_or(false)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("jsonl") => "application/jsonl",
        Some("yaml") | Some("yml") => "application/yaml",
        _ => "application/octet-stream",
    }
}

/// Serve `router` on `addr` until the shutdown signal flips, then drain
/// connections for at most `shutdown_timeout`.
///
/// Every server carries the same timeout bounds: request headers must
/// arrive within 3s (enforced at the connection layer), request bodies
/// read within 5s, and responses finish writing within 5 minutes.
pub async fn serve(
    addr: &str,
    router: Router,
    tls: Option<TlsPaths>,
    mut shutdown: watch::Receiver<bool>,
    shutdown_timeout: Duration,
) -> Result<()> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address {:?}: {}", addr, e)))?;

    // Innermost to outermost: bound handler execution and body writes at
    // the write timeout, then bound request body reads. The request-side
    // stack maps the timeout-wrapped body back to the plain body type the
    // routes expect.
    let router = router
        .layer(TimeoutLayer::new(SERVER_WRITE_TIMEOUT))
        .layer(ResponseBodyTimeoutLayer::new(SERVER_WRITE_TIMEOUT))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyTimeoutLayer::new(SERVER_READ_TIMEOUT))
                .layer(MapRequestBodyLayer::new(|body: TimeoutBody<Body>| {
                    Body::new(body)
                })),
        );
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        // A closed channel means the sender is gone; shut down either way.
        let _ = shutdown.wait_for(|stop| *stop).await;
        shutdown_handle.graceful_shutdown(Some(shutdown_timeout));
    });

    match tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(|e| Error::Config(format!("failed to load TLS configuration: {}", e)))?;
            tracing::info!(addr = %addr, "serving catalogs over HTTPS");
            let mut server = axum_server::bind_rustls(addr, rustls).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(Some(SERVER_READ_HEADER_TIMEOUT));
            server
                .serve(router.into_make_service())
                .await
                .map_err(|e| Error::Config(format!("catalog server failed: {}", e)))
        }
        None => {
            tracing::info!(addr = %addr, "serving catalogs over HTTP");
            let mut server = axum_server::bind(addr).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(Some(SERVER_READ_HEADER_TIMEOUT));
            server
                .serve(router.into_make_service())
                .await
                .map_err(|e| Error::Config(format!("catalog server failed: {}", e)))
        }
    }
}
