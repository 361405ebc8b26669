//! Docker registry v2 client used by the image puller. One reqwest client
//! serves every registry; per-pull authentication material comes from the
//! credential bundle file maintained by the credential bridge, read lazily
//! so secret rotation is picked up without restarting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::config::{
    DEFAULT_TOKEN_EXPIRY_SECS, MANIFEST_ACCEPT_HEADER, TOKEN_EXPIRY_SAFETY_MARGIN_SECS,
};
use crate::error::{Error, Result};
use crate::image::reference::ImageReference;

#[derive(Default)]
pub struct TokenCache {
    tokens: HashMap<String, CachedToken>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl TokenCache {
    fn get(&self, key: &str) -> Option<String> {
        self.tokens.get(key).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    fn insert(&mut self, key: String, token: String, expires_in_seconds: Option<u64>) {
        let expires_in = expires_in_seconds.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS));
        self.tokens.insert(key, CachedToken { token, expires_at });
        self.tokens
            .retain(|_, cached| cached.expires_at > Instant::now());
    }
}

pub struct RegistryClient {
    client: Client,
    token_cache: RwLock<TokenCache>,
    /// docker-config file maintained by the credential bridge. Read per
    /// request; absence means unauthenticated pulls.
    auth_file: PathBuf,
}

/// Default request timeout; large blob downloads can be slow.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

impl RegistryClient {
    pub fn new(auth_file: PathBuf, ca_certs_dir: Option<&Path>) -> Result<Self> {
        Self::with_timeout(auth_file, ca_certs_dir, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        auth_file: PathBuf,
        ca_certs_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10));

        if let Some(dir) = ca_certs_dir {
            for cert in load_ca_certificates(dir)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(RegistryClient {
            client: builder.build()?,
            token_cache: RwLock::new(TokenCache::default()),
            auth_file,
        })
    }

    fn registry_base(&self, registry: &str) -> String {
        // docker.io's API lives on a different host than its name
        if registry == "docker.io" {
            "https://registry-1.docker.io".to_string()
        } else if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
            format!("http://{}", registry)
        } else {
            format!("https://{}", registry)
        }
    }

    /// Resolve a reference to its manifest digest (`sha256:<hex>`). Digest
    /// references resolve to themselves without touching the network.
    pub async fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let url = self.manifest_url(reference);
        let response = self
            .send(Method::HEAD, &url, reference, Some(MANIFEST_ACCEPT_HEADER))
            .await?;
        if response.status().is_success() {
            if let Some(digest) = response
                .headers()
                .get("docker-content-digest")
                .and_then(|v| v.to_str().ok())
            {
                return Ok(digest.to_string());
            }
        }

        // HEAD gave no digest header; fall back to hashing the manifest body.
        let response = self
            .send(Method::GET, &url, reference, Some(MANIFEST_ACCEPT_HEADER))
            .await?;
        let response = check_status("resolve manifest", reference, response)?;
        if let Some(digest) = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            return Ok(digest.to_string());
        }
        let body = response.bytes().await?;
        Ok(format!("sha256:{:x}", Sha256::digest(&body)))
    }

    /// Fetch the manifest named by `digest`. Image indexes are resolved to
    /// the linux manifest for the running architecture, falling back to the
    /// first listed platform.
    pub async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Value> {
        let manifest = self.fetch_manifest_raw(reference, digest).await?;
        let media_type = manifest
            .get("mediaType")
            .and_then(|m| m.as_str())
            .unwrap_or("");
        if !media_type.contains("manifest.list") && !media_type.contains("index") {
            return Ok(manifest);
        }

        let manifests = manifest
            .get("manifests")
            .and_then(|m| m.as_array())
            .ok_or_else(|| {
                Error::Registry(format!(
                    "image index {} has no manifests array",
                    reference
                ))
            })?;
        let platform_digest = select_platform_manifest(manifests).ok_or_else(|| {
            Error::Registry(format!(
                "image index {} lists no usable platform manifest",
                reference
            ))
        })?;
        tracing::debug!(
            image = %reference,
            digest = %platform_digest,
            "resolved image index to platform manifest"
        );
        self.fetch_manifest_raw(reference, &platform_digest).await
    }

    async fn fetch_manifest_raw(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
    ) -> Result<Value> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_base(&reference.registry),
            reference.repository,
            manifest_ref
        );
        let response = self
            .send(Method::GET, &url, reference, Some(MANIFEST_ACCEPT_HEADER))
            .await?;
        let response = check_status("fetch manifest", reference, response)?;
        Ok(response.json::<Value>().await?)
    }

    /// Fetch and parse a JSON blob (the image config).
    pub async fn fetch_json_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Value> {
        let url = self.blob_url(reference, digest);
        let response = self.send(Method::GET, &url, reference, None).await?;
        let response = check_status("fetch config blob", reference, response)?;
        Ok(response.json::<Value>().await?)
    }

    /// Stream a blob to `dest`, verifying its digest on the way down.
    /// Written through a temp file and renamed, so a partial download never
    /// looks like a finished one.
    pub async fn download_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64> {
        let url = self.blob_url(reference, digest);
        let response = self.send(Method::GET, &url, reference, None).await?;
        let mut response = check_status("fetch blob", reference, response)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        let actual = format!("sha256:{:x}", hasher.finalize());
        if actual != digest {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::Registry(format!(
                "blob digest mismatch for {}: expected {}, got {}",
                reference, digest, actual
            )));
        }
        tokio::fs::rename(&temp_path, dest).await?;
        Ok(written)
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_base(&reference.registry),
            reference.repository,
            reference.manifest_reference()
        )
    }

    fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.registry_base(&reference.registry),
            reference.repository,
            digest
        )
    }

    /// Send a request, transparently handling the registry token challenge:
    /// on 401, parse `WWW-Authenticate`, obtain a pull token (with basic
    /// credentials from the bundle when available), and retry once.
    async fn send(
        &self,
        method: Method,
        url: &str,
        reference: &ImageReference,
        accept: Option<&str>,
    ) -> Result<Response> {
        let response = self.request(method.clone(), url, accept, None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let www_auth = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        let Some(www_auth) = www_auth else {
            return Ok(response);
        };

        match self.fetch_token(&www_auth, reference).await? {
            Some(token) => {
                let retried = self.request(method, url, accept, Some(token)).await?;
                Ok(retried)
            }
            None => Ok(response),
        }
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        token: Option<String>,
    ) -> Result<Response> {
        let mut request = self.client.request(method, url);
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// OCI distribution token flow: realm + service + scope from the
    /// challenge header, basic credentials from the docker-config bundle.
    async fn fetch_token(
        &self,
        www_auth: &str,
        reference: &ImageReference,
    ) -> Result<Option<String>> {
        let challenge = parse_www_authenticate(www_auth);
        let Some(realm) = challenge.realm else {
            tracing::warn!(header = %www_auth, "no realm in WWW-Authenticate header");
            return Ok(None);
        };

        let scope = challenge
            .scope
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        let mut token_url = format!("{}?scope={}", realm, scope);
        if let Some(service) = &challenge.service {
            token_url.push_str(&format!("&service={}", service));
        }

        {
            let cache = self.token_cache.read().await;
            if let Some(token) = cache.get(&token_url) {
                return Ok(Some(token));
            }
        }

        let mut request = self.client.get(&token_url);
        if let Some((username, password)) = self.credential_for(&reference.registry) {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "token endpoint {} returned {}",
                token_url,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        // Docker Hub uses "token", some registries use "access_token"
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .or_else(|| body.get("access_token").and_then(|t| t.as_str()))
            .map(|t| t.to_string());

        if let Some(token) = &token {
            let expires_in = body.get("expires_in").and_then(|v| v.as_u64());
            let mut cache = self.token_cache.write().await;
            cache.insert(token_url, token.clone(), expires_in);
        }
        Ok(token)
    }

    /// Basic credentials for `registry` from the bundle file. The file may
    /// legitimately be absent (no pull secret configured), in which case
    /// pulls run unauthenticated.
    fn credential_for(&self, registry: &str) -> Option<(String, String)> {
        let raw = std::fs::read(&self.auth_file).ok()?;
        let config: Value = serde_json::from_slice(&raw).ok()?;
        let auths = config.get("auths")?.as_object()?;
        let entry = auths
            .get(registry)
            .or_else(|| auths.get(&format!("https://{}", registry)))?;

        if let Some(encoded) = entry.get("auth").and_then(|a| a.as_str()) {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some((username.to_string(), password.to_string()));
        }

        let username = entry.get("username")?.as_str()?;
        let password = entry.get("password")?.as_str()?;
        Some((username.to_string(), password.to_string()))
    }
}

struct AuthChallenge {
    realm: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
fn parse_www_authenticate(www_auth: &str) -> AuthChallenge {
    let mut challenge = AuthChallenge {
        realm: None,
        service: None,
        scope: None,
    };
    let auth_str = www_auth.strip_prefix("Bearer ").unwrap_or(www_auth);
    for part in auth_str.split(',') {
        let part = part.trim();
        let unquote = |s: &str, prefix: &str| {
            s.strip_prefix(prefix)
                .map(|v| v.trim_matches('"').to_string())
        };
        if let Some(v) = unquote(part, "realm=") {
            challenge.realm = Some(v);
        } else if let Some(v) = unquote(part, "service=") {
            challenge.service = Some(v);
        } else if let Some(v) = unquote(part, "scope=") {
            challenge.scope = Some(v);
        }
    }
    challenge
}

fn check_status(
    action: &str,
    reference: &ImageReference,
    response: Response,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = format!("failed to {} for {}: HTTP {}", action, reference, status);
    if status == StatusCode::NOT_FOUND || status == StatusCode::UNAUTHORIZED {
        // A missing image or a rejected credential will not fix itself.
        Err(Error::Unrecoverable(message))
    } else {
        Err(Error::Registry(message))
    }
}

/// Pick the manifest for linux on the running architecture; fall back to
/// the first entry so single-platform indexes still resolve.
fn select_platform_manifest(manifests: &[Value]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    let matches_platform = |m: &Value| {
        m.get("platform")
            .map(|p| {
                p.get("os").and_then(|os| os.as_str()) == Some("linux")
                    && p.get("architecture").and_then(|a| a.as_str()) == Some(arch)
            })
            .unwrap_or(false)
    };
    manifests
        .iter()
        .find(|m| matches_platform(m))
        .or_else(|| manifests.first())
        .and_then(|m| m.get("digest").and_then(|d| d.as_str()))
        .map(|d| d.to_string())
}

fn load_ca_certificates(dir: &Path) -> Result<Vec<reqwest::Certificate>> {
    let mut certs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let pem = std::fs::read(&path)?;
        match reqwest::Certificate::from_pem(&pem) {
            Ok(cert) => certs.push(cert),
            Err(e) => {
                return Err(Error::Config(format!(
                    "invalid CA certificate {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(certs)
}
