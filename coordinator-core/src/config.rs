use std::path::PathBuf;

use crate::error::CoordinatorError;
use crate::types::VerificationSoftware;

/// Default sentinel printed by the verification tooling on success. Kept as
/// configuration because it couples to an external tool's output format.
pub const DEFAULT_VM_SUCCESS_SENTINEL: &str = "ZKey Ok!";

/// Environment-derived configuration for the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Email domain granting the coordinator role.
    pub coordinator_email_domain: String,
    /// Lifetime of presigned URLs, seconds.
    pub presign_expiration_secs: u64,
    /// Suffix appended to a ceremony prefix to form its bucket name.
    pub bucket_postfix: String,
    /// Region forwarded to cloud-backed blob stores; the local store ignores it.
    pub aws_region: Option<String>,
    /// Recorded verbatim in every contribution document.
    pub verifier_software: VerificationSoftware,
    /// Transcript substring that marks a VM-side verification as valid.
    pub vm_success_sentinel: String,
    /// Root directory for verification scratch downloads.
    pub scratch_root: PathBuf,
}

impl CoordinatorConfig {
    /// Build from process environment. Missing required variables are
    /// configuration errors; optional ones fall back to documented defaults.
    pub fn from_env() -> Result<Self, CoordinatorError> {
        Ok(Self {
            coordinator_email_domain: require("COORDINATOR_EMAIL_DOMAIN")?,
            presign_expiration_secs: require("PRESIGN_EXPIRATION_SECONDS")?
                .parse()
                .map_err(|_| {
                    CoordinatorError::Configuration(
                        "PRESIGN_EXPIRATION_SECONDS must be an integer".to_string(),
                    )
                })?,
            bucket_postfix: require("BUCKET_POSTFIX")?,
            aws_region: std::env::var("AWS_REGION").ok(),
            verifier_software: VerificationSoftware {
                name: optional("VERIFIER_SOFTWARE_NAME", "snarkjs"),
                version: optional("VERIFIER_SOFTWARE_VERSION", "unknown"),
                commit_hash: optional("VERIFIER_SOFTWARE_COMMIT_HASH", "unknown"),
            },
            vm_success_sentinel: optional("VM_SUCCESS_SENTINEL", DEFAULT_VM_SUCCESS_SENTINEL),
            scratch_root: PathBuf::from(optional("SCRATCH_ROOT", "/tmp/coordinator-scratch")),
        })
    }
}

fn require(name: &str) -> Result<String, CoordinatorError> {
    std::env::var(name)
        .map_err(|_| CoordinatorError::Configuration(format!("missing env variable {name}")))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            coordinator_email_domain: "example.org".into(),
            presign_expiration_secs: 900,
            bucket_postfix: "-ph2".into(),
            aws_region: None,
            verifier_software: VerificationSoftware {
                name: "snarkjs".into(),
                version: "0.7.0".into(),
                commit_hash: "deadbeef".into(),
            },
            vm_success_sentinel: DEFAULT_VM_SUCCESS_SENTINEL.into(),
            scratch_root: PathBuf::from("/tmp/scratch"),
        }
    }

    #[test]
    fn sentinel_default_matches_tooling_output() {
        assert_eq!(test_config().vm_success_sentinel, "ZKey Ok!");
    }
}
