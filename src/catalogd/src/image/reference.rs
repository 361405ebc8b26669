use std::fmt;

use crate::error::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";

/// A parsed image reference. Exactly one of `tag` / `digest` is set after
/// parsing; a digest reference is already canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    /// Full digest, `sha256:<hex>`.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse `registry/repo:tag`, `registry/repo@sha256:…`, or a bare
    /// `repo[:tag]` which defaults to docker.io/library.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Unrecoverable("empty image reference".to_string()));
        }

        let (name, tag, digest) = if let Some(at_idx) = raw.find('@') {
            let digest = &raw[at_idx + 1..];
            if !is_valid_digest(digest) {
                return Err(Error::Unrecoverable(format!(
                    "invalid digest in image reference {:?}",
                    raw
                )));
            }
            (&raw[..at_idx], None, Some(digest.to_string()))
        } else if let Some(colon_idx) = rfind_tag_separator(raw) {
            (
                &raw[..colon_idx],
                Some(raw[colon_idx + 1..].to_string()),
                None,
            )
        } else {
            (raw, Some("latest".to_string()), None)
        };

        if name.is_empty() {
            return Err(Error::Unrecoverable(format!(
                "invalid image reference {:?}",
                raw
            )));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
                return Err(Error::Unrecoverable(format!(
                    "invalid tag in image reference {:?}",
                    raw
                )));
            }
        }

        let (registry, repository) = split_repository(name);
        if repository.is_empty() {
            return Err(Error::Unrecoverable(format!(
                "invalid repository in image reference {:?}",
                raw
            )));
        }

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, no tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Hex component of the digest, if pinned.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix("sha256:"))
    }

    /// Canonical `registry/repo@sha256:…` for a resolved digest.
    pub fn canonical(&self, digest: &str) -> String {
        format!("{}@{}", self.name(), digest)
    }

    /// Tag or digest, whichever names the manifest on the registry API.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => write!(f, "{}@{}", self.name(), digest),
            (None, Some(tag)) => write!(f, "{}:{}", self.name(), tag),
            (None, None) => write!(f, "{}", self.name()),
        }
    }
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Find the `:` that separates a tag, if any. A colon followed by a path
/// separator later in the string is a registry port, not a tag.
fn rfind_tag_separator(raw: &str) -> Option<usize> {
    let colon_idx = raw.rfind(':')?;
    if raw[colon_idx + 1..].contains('/') {
        return None;
    }
    Some(colon_idx)
}

/// Split `name` into registry and repository. The first component is a
/// registry host only if it looks like one (contains a dot, a colon, or is
/// `localhost`); otherwise the whole name is a docker.io repository.
fn split_repository(name: &str) -> (String, String) {
    if let Some(slash_idx) = name.find('/') {
        let first = &name[..slash_idx];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), name[slash_idx + 1..].to_string());
        }
        return (DEFAULT_REGISTRY.to_string(), name.to_string());
    }
    (DEFAULT_REGISTRY.to_string(), format!("library/{}", name))
}
