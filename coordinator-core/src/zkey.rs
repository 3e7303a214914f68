//! Phase-2 zkey verification primitive.
//!
//! The actual cryptographic check lives in external tooling; the Verifier
//! only needs a yes/no plus a transcript file. The production implementation
//! shells out to the configured verifier binary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CoordinatorError;

/// Seam for the `verifyFromInit(genesis, pot, last)` primitive. The
/// implementation writes a human-readable transcript to `transcript_path`.
#[async_trait]
pub trait ZkeyVerifier: Send + Sync {
    async fn verify_from_init(
        &self,
        genesis_zkey: &Path,
        pot: &Path,
        last_zkey: &Path,
        transcript_path: &Path,
    ) -> Result<bool, CoordinatorError>;
}

/// Runs the verifier binary (`<program> zkey verify <genesis> <pot> <last>`)
/// and captures combined stdout/stderr as the transcript. A non-zero exit
/// status means the contribution chain does not check out.
pub struct CliZkeyVerifier {
    program: PathBuf,
}

impl CliZkeyVerifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ZkeyVerifier for CliZkeyVerifier {
    async fn verify_from_init(
        &self,
        genesis_zkey: &Path,
        pot: &Path,
        last_zkey: &Path,
        transcript_path: &Path,
    ) -> Result<bool, CoordinatorError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("zkey")
            .arg("verify")
            .arg(genesis_zkey)
            .arg(pot)
            .arg(last_zkey)
            .output()
            .await
            .map_err(|e| {
                CoordinatorError::StorageFailure(format!(
                    "failed to spawn verifier {}: {e}",
                    self.program.display()
                ))
            })?;

        let mut transcript = output.stdout;
        transcript.extend_from_slice(&output.stderr);
        tokio::fs::write(transcript_path, &transcript)
            .await
            .map_err(|e| {
                CoordinatorError::StorageFailure(format!("failed to write transcript: {e}"))
            })?;

        Ok(output.status.success())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// Fixed-verdict verifier that writes a canned transcript.
    pub struct FakeZkeyVerifier {
        pub valid: bool,
        pub transcript: String,
    }

    #[async_trait]
    impl ZkeyVerifier for FakeZkeyVerifier {
        async fn verify_from_init(
            &self,
            _genesis_zkey: &Path,
            _pot: &Path,
            _last_zkey: &Path,
            transcript_path: &Path,
        ) -> Result<bool, CoordinatorError> {
            tokio::fs::write(transcript_path, self.transcript.as_bytes())
                .await
                .map_err(|e| CoordinatorError::StorageFailure(e.to_string()))?;
            Ok(self.valid)
        }
    }
}
