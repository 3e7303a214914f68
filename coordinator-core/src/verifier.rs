//! Contribution verification pipeline.
//!
//! Invoked by the contributing client once its upload is complete (the
//! client has already advanced to VERIFYING). Dispatches on the circuit's
//! verification mechanism: LOCAL runs the zkey primitive in-process against
//! downloaded artifacts, VM drives a transient compute instance and reads
//! its transcript back. Both paths share the record-writing tail: one batch
//! creates the contribution document and, outside finalization, updates the
//! circuit's counters and rolling averages under the compare-and-set guard.
//! If the participant was evicted mid-verification, that guard rejects the
//! write and the call surfaces a precondition failure instead of corrupting
//! the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blake2::{Blake2b512, Digest};
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::blob_store::BlobStore;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::store::{CeremonyStore, WriteBatch, WriteOp};
use crate::types::*;
use crate::vm_executor::{VmCommandStatus, VmExecutor};
use crate::zkey::ZkeyVerifier;

/// Poll attempts for the VM to reach running state.
const VM_RUNNING_RETRIES: u32 = 5;

/// Interval between VM polls.
const VM_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Typed input of `verifyContribution`.
#[derive(Clone, Debug)]
pub struct VerifyRequest {
    pub ceremony_id: String,
    pub circuit_id: String,
    pub bucket_name: String,
    /// Contributor or coordinator identifier, recorded in logs only.
    pub identifier: String,
}

/// Typed result of `verifyContribution`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub full_contribution_time_ms: i64,
    pub verify_time_ms: i64,
}

struct Verdict {
    valid: bool,
    files: Option<ContributionFiles>,
}

pub struct Verifier {
    store: Arc<dyn CeremonyStore>,
    blob: Arc<dyn BlobStore>,
    vm: Arc<dyn VmExecutor>,
    zkey: Arc<dyn ZkeyVerifier>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    ansi: Regex,
    hex64: Regex,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn CeremonyStore>,
        blob: Arc<dyn BlobStore>,
        vm: Arc<dyn VmExecutor>,
        zkey: Arc<dyn ZkeyVerifier>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            blob,
            vm,
            zkey,
            clock,
            config,
            ansi: Regex::new("\x1b\\[[0-9;]*m").expect("static pattern"),
            hex64: Regex::new("[0-9a-fA-F]{64}").expect("static pattern"),
        }
    }

    /// Execute the full verification pipeline for the caller's pending
    /// contribution on the target circuit.
    pub async fn verify_contribution(
        &self,
        caller: &CallerIdentity,
        req: &VerifyRequest,
    ) -> Result<VerifyOutcome, CoordinatorError> {
        let started = self.clock.now_ms();

        let ceremony = self
            .store
            .ceremony(&req.ceremony_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("ceremonies/{}", req.ceremony_id)))?;
        let circuit = self
            .store
            .circuit(&req.ceremony_id, &req.circuit_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("circuits/{}", req.circuit_id)))?;
        let participant = self
            .store
            .participant(&req.ceremony_id, &caller.user_id)
            .await?
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!("participants/{}", caller.user_id))
            })?;

        let finalizing = caller.is_coordinator()
            && ceremony.state == CeremonyState::Closed
            && participant.status == ParticipantStatus::Finalizing;

        if !finalizing {
            if circuit.waiting_queue.current_contributor != caller.user_id {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "{} is not the current contributor of circuit {}",
                    caller.user_id, circuit.id
                )));
            }
            if participant.status != ParticipantStatus::Contributing
                || participant.contribution_step != ContributionStep::Verifying
            {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "participant {} is {} (step {}), expected CONTRIBUTING/VERIFYING",
                    participant.user_id, participant.status, participant.contribution_step
                )));
            }
        }

        let Some((_, pending)) = participant.pending_contribution() else {
            return Err(CoordinatorError::NoPendingContribution(
                caller.user_id.clone(),
            ));
        };
        let pending = pending.clone();

        let last_index = if finalizing {
            FINAL_ZKEY_INDEX.to_string()
        } else {
            zkey_index(circuit.waiting_queue.next_zkey_index())
        };

        info!(
            ceremony_id = %req.ceremony_id,
            circuit_id = %circuit.id,
            identifier = %req.identifier,
            zkey_index = %last_index,
            finalizing,
            "verifying contribution"
        );

        let verdict = match &circuit.verification {
            VerificationMechanism::Local => {
                self.verify_local(&circuit, &req.bucket_name, &last_index, &caller.user_id)
                    .await?
            }
            VerificationMechanism::Vm { instance_id } => {
                self.verify_on_vm(&circuit, &req.bucket_name, &last_index, instance_id)
                    .await?
            }
        };

        let finished = self.clock.now_ms();
        let timings = ContributionTimings {
            contribution_computation: pending.computation_time_ms,
            full_contribution: (participant.verification_started_at
                - participant.contribution_started_at)
                .max(0),
            verify_cloud_function: finished - started,
        };

        let contribution = Contribution {
            id: Uuid::now_v7().to_string(),
            ceremony_id: req.ceremony_id.clone(),
            circuit_id: circuit.id.clone(),
            participant_id: caller.user_id.clone(),
            zkey_index: last_index,
            valid: verdict.valid,
            contribution_hash: pending.hash.clone(),
            timings,
            verification_software: self.config.verifier_software.clone(),
            files: verdict.files,
            beacon: None,
            created_at: finished,
        };

        let mut batch = WriteBatch::new().with(WriteOp::CreateContribution(contribution));
        if !finalizing {
            let mut updated = circuit.clone();
            if verdict.valid {
                let avg = &mut updated.avg_timings;
                avg.contribution_computation =
                    AvgTimings::fold(avg.contribution_computation, timings.contribution_computation);
                avg.full_contribution =
                    AvgTimings::fold(avg.full_contribution, timings.full_contribution);
                avg.verify_cloud_function =
                    AvgTimings::fold(avg.verify_cloud_function, timings.verify_cloud_function);
                updated.waiting_queue.completed_contributions += 1;
            } else {
                updated.waiting_queue.failed_contributions += 1;
            }
            batch.push(WriteOp::UpdateCircuit {
                circuit: updated,
                expected_last_updated: Some(circuit.last_updated),
            });
        }
        self.store.commit(batch).await?;

        Ok(VerifyOutcome {
            valid: verdict.valid,
            full_contribution_time_ms: timings.full_contribution,
            verify_time_ms: timings.verify_cloud_function,
        })
    }

    // ── LOCAL path ──

    async fn verify_local(
        &self,
        circuit: &Circuit,
        bucket: &str,
        last_index: &str,
        user_id: &str,
    ) -> Result<Verdict, CoordinatorError> {
        // Unique per (circuit, participant) so concurrent verifications on
        // different circuits never collide.
        let scratch: PathBuf = self
            .config
            .scratch_root
            .join(format!("{}_{}", circuit.id, user_id));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| CoordinatorError::StorageFailure(format!("scratch dir: {e}")))?;

        let last_zkey_path = circuit.zkey_storage_path(last_index);
        let pot_local = scratch.join(&circuit.pot_filename);
        let genesis_local = scratch.join(&circuit.genesis_zkey_filename);
        let last_local = scratch.join(circuit.zkey_filename(last_index));

        self.blob
            .download_to_file(bucket, &circuit.pot_storage_path(), &pot_local)
            .await?;
        self.blob
            .download_to_file(bucket, &circuit.genesis_zkey_storage_path(), &genesis_local)
            .await?;
        self.blob
            .download_to_file(bucket, &last_zkey_path, &last_local)
            .await?;

        let transcript_filename = circuit.transcript_filename(last_index);
        let transcript_local = scratch.join(&transcript_filename);

        let valid = self
            .zkey
            .verify_from_init(&genesis_local, &pot_local, &last_local, &transcript_local)
            .await?;

        let verdict = if valid {
            let zkey_bytes = tokio::fs::read(&last_local)
                .await
                .map_err(|e| CoordinatorError::StorageFailure(format!("read zkey: {e}")))?;
            let transcript_bytes = tokio::fs::read(&transcript_local)
                .await
                .map_err(|e| CoordinatorError::StorageFailure(format!("read transcript: {e}")))?;

            let transcript_storage_path = circuit.transcript_storage_path(&transcript_filename);
            self.blob
                .put_object(bucket, &transcript_storage_path, &transcript_bytes, true)
                .await?;

            Verdict {
                valid: true,
                files: Some(ContributionFiles {
                    zkey_filename: circuit.zkey_filename(last_index),
                    zkey_storage_path: last_zkey_path,
                    zkey_blake2b_hash: blake2b_hex(&zkey_bytes),
                    transcript_filename,
                    transcript_storage_path,
                    transcript_blake2b_hash: blake2b_hex(&transcript_bytes),
                    ..ContributionFiles::default()
                }),
            }
        } else {
            self.reclaim_invalid_zkey(bucket, &last_zkey_path).await;
            Verdict {
                valid: false,
                files: None,
            }
        };

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(scratch = %scratch.display(), error = %e, "failed to clean scratch dir");
        }
        Ok(verdict)
    }

    // ── VM path ──

    async fn verify_on_vm(
        &self,
        circuit: &Circuit,
        bucket: &str,
        last_index: &str,
        instance_id: &str,
    ) -> Result<Verdict, CoordinatorError> {
        self.vm
            .start_instance(instance_id)
            .await
            .map_err(|e| CoordinatorError::VmUnavailable(e.to_string()))?;

        let mut running = false;
        for _ in 0..VM_RUNNING_RETRIES {
            if self
                .vm
                .is_running(instance_id)
                .await
                .map_err(|e| CoordinatorError::VmUnavailable(e.to_string()))?
            {
                running = true;
                break;
            }
            self.clock.sleep(VM_POLL_INTERVAL).await;
        }
        if !running {
            self.stop_vm(instance_id).await;
            return Err(CoordinatorError::VmUnavailable(format!(
                "instance {instance_id} not running after {VM_RUNNING_RETRIES} polls"
            )));
        }

        let last_zkey_path = circuit.zkey_storage_path(last_index);
        let transcript_filename = circuit.transcript_filename(last_index);
        let transcript_storage_path = circuit.transcript_storage_path(&transcript_filename);
        let command =
            vm_verification_command(bucket, &last_zkey_path, &transcript_storage_path);

        let command_id = match self.vm.run_command(instance_id, &command).await {
            Ok(id) => id,
            Err(e) => {
                self.stop_vm(instance_id).await;
                return Err(CoordinatorError::VmCommandAborted(e.to_string()));
            }
        };

        loop {
            self.clock.sleep(VM_POLL_INTERVAL).await;
            let status = match self.vm.command_status(&command_id).await {
                Ok(s) => s,
                Err(e) => {
                    self.stop_vm(instance_id).await;
                    return Err(CoordinatorError::VmCommandAborted(e.to_string()));
                }
            };
            match status {
                VmCommandStatus::Success => break,
                s if s.is_running() => continue,
                s => {
                    self.stop_vm(instance_id).await;
                    return Err(CoordinatorError::VmCommandAborted(format!(
                        "command {command_id} ended with status {s}"
                    )));
                }
            }
        }

        // The VM uploaded its transcript to the well-known path.
        let transcript = self
            .blob
            .get_object(bucket, &transcript_storage_path)
            .await?;
        let transcript_text = String::from_utf8_lossy(&transcript);
        let valid = transcript_text.contains(&self.config.vm_success_sentinel);

        let stripped = self.ansi.replace_all(&transcript_text, "").into_owned();
        self.blob
            .put_object(bucket, &transcript_storage_path, stripped.as_bytes(), true)
            .await?;

        let verdict = if valid {
            let stdout = match self.vm.command_output(&command_id).await {
                Ok(out) => out,
                Err(e) => {
                    self.stop_vm(instance_id).await;
                    return Err(CoordinatorError::VmCommandAborted(e.to_string()));
                }
            };
            let zkey_hash = self
                .hex64
                .find(&stdout)
                .map(|m| m.as_str().to_lowercase())
                .ok_or_else(|| {
                    CoordinatorError::VmCommandAborted(format!(
                        "command {command_id} output carries no zkey hash"
                    ))
                })?;

            Verdict {
                valid: true,
                files: Some(ContributionFiles {
                    zkey_filename: circuit.zkey_filename(last_index),
                    zkey_storage_path: last_zkey_path,
                    zkey_blake2b_hash: zkey_hash,
                    transcript_filename,
                    transcript_storage_path,
                    transcript_blake2b_hash: blake2b_hex(stripped.as_bytes()),
                    ..ContributionFiles::default()
                }),
            }
        } else {
            self.reclaim_invalid_zkey(bucket, &last_zkey_path).await;
            Verdict {
                valid: false,
                files: None,
            }
        };

        self.stop_vm(instance_id).await;
        Ok(verdict)
    }

    // ── shared helpers ──

    async fn reclaim_invalid_zkey(&self, bucket: &str, key: &str) {
        if let Err(e) = self.blob.delete_object(bucket, key).await {
            warn!(bucket, key, error = %e, "failed to delete invalid zkey");
        }
    }

    async fn stop_vm(&self, instance_id: &str) {
        if let Err(e) = self.vm.stop_instance(instance_id).await {
            warn!(instance_id, error = %e, "failed to stop verification VM");
        }
    }
}

/// Shell command the verification VM runs: downloads the zkey, verifies it
/// and uploads the transcript to the given path.
fn vm_verification_command(bucket: &str, zkey_path: &str, transcript_path: &str) -> String {
    format!("verify-contribution {bucket} {zkey_path} {transcript_path}")
}

/// Blake2b-512 hex digest used for every artifact hash in the system.
pub(crate) fn blake2b_hex(bytes: &[u8]) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
