//! Image signature policy. Pulls honor the container policy file from its
//! standard locations; with no policy on disk the puller falls back to
//! accepting anything, matching the behavior of registries without
//! signature enforcement.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

const POLICY_PATHS: &[&str] = &[
    "/etc/containers/policy.json",
    "/usr/share/containers/policy.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    AcceptAnything,
    Reject,
}

#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    default: PolicyDecision,
}

#[derive(Deserialize)]
struct PolicyFile {
    default: Vec<PolicyRequirement>,
}

#[derive(Deserialize)]
struct PolicyRequirement {
    #[serde(rename = "type")]
    requirement_type: String,
}

impl SignaturePolicy {
    /// Load the policy from the standard locations. A missing file yields
    /// the accept-anything fallback; a file that exists but cannot be
    /// honored is an unrecoverable policy fault.
    pub fn load() -> Result<Self> {
        for path in POLICY_PATHS {
            let path = Path::new(path);
            if path.exists() {
                return Self::load_from(path);
            }
        }
        tracing::debug!("no signature policy found, using insecure accept-anything policy");
        Ok(SignaturePolicy {
            default: PolicyDecision::AcceptAnything,
        })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            Error::Unrecoverable(format!(
                "failed to read signature policy {}: {}",
                path.display(),
                e
            ))
        })?;
        let parsed: PolicyFile = serde_json::from_slice(&raw).map_err(|e| {
            Error::Unrecoverable(format!(
                "invalid signature policy {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut default = PolicyDecision::Reject;
        for requirement in &parsed.default {
            match requirement.requirement_type.as_str() {
                "insecureAcceptAnything" => default = PolicyDecision::AcceptAnything,
                "reject" => default = PolicyDecision::Reject,
                other => {
                    return Err(Error::Unrecoverable(format!(
                        "signature policy {} requires unsupported verification {:?}",
                        path.display(),
                        other
                    )))
                }
            }
        }
        Ok(SignaturePolicy { default })
    }

    /// Check whether the policy allows pulling the given reference.
    pub fn check(&self, reference: &str) -> Result<()> {
        match self.default {
            PolicyDecision::AcceptAnything => Ok(()),
            PolicyDecision::Reject => Err(Error::Unrecoverable(format!(
                "signature policy rejects image {}",
                reference
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_policy(content: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn insecure_accept_anything_allows_pulls() {
        let file = write_policy(r#"{"default":[{"type":"insecureAcceptAnything"}]}"#);
        let policy = SignaturePolicy::load_from(file.path()).unwrap();
        assert!(policy.check("registry.test/cat:v1").is_ok());
    }

    #[test]
    fn reject_policy_blocks_pulls() {
        let file = write_policy(r#"{"default":[{"type":"reject"}]}"#);
        let policy = SignaturePolicy::load_from(file.path()).unwrap();
        let err = policy.check("registry.test/cat:v1").unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn unsupported_requirements_are_a_policy_fault() {
        let file = write_policy(r#"{"default":[{"type":"signedBy","keyType":"GPGKeys"}]}"#);
        let err = SignaturePolicy::load_from(file.path()).unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn malformed_policy_is_a_policy_fault() {
        let file = write_policy("not json");
        assert!(SignaturePolicy::load_from(file.path()).is_err());
    }
}
