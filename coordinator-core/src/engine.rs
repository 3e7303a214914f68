//! Coordinator engine.
//!
//! Top-level facade wiring the store, blob store and verifier together; the
//! gRPC handlers delegate here. Every operation guards its preconditions
//! before any external side effect and writes through conditional updates,
//! so replays converge on the participant's terminal observable state.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::auth::CallerIdentity;
use crate::blob_store::{BlobStore, CompletedPart, ObjectMetadata};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::fsm;
use crate::store::{CeremonyStore, WriteBatch, WriteOp};
use crate::types::*;
use crate::verifier::{blake2b_hex, Verifier, VerifyOutcome, VerifyRequest};

/// Read-only queue snapshot for one circuit.
#[derive(Clone, Debug)]
pub struct CircuitQueueStatus {
    pub circuit_id: String,
    pub sequence_position: u32,
    pub current_contributor: String,
    pub queued: u32,
    pub completed_contributions: u32,
    pub failed_contributions: u32,
}

/// Read-only ceremony inspection.
#[derive(Clone, Debug)]
pub struct CeremonyStatus {
    pub ceremony_id: String,
    pub state: CeremonyState,
    pub circuits: Vec<CircuitQueueStatus>,
}

pub struct CeremonyEngine {
    store: Arc<dyn CeremonyStore>,
    blob: Arc<dyn BlobStore>,
    verifier: Arc<Verifier>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl CeremonyEngine {
    pub fn new(
        store: Arc<dyn CeremonyStore>,
        blob: Arc<dyn BlobStore>,
        verifier: Arc<Verifier>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            blob,
            verifier,
            clock,
            config,
        }
    }

    // ── loading helpers ──

    async fn load_ceremony(&self, ceremony_id: &str) -> Result<Ceremony, CoordinatorError> {
        self.store
            .ceremony(ceremony_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("ceremonies/{ceremony_id}")))
    }

    async fn load_open_ceremony(&self, ceremony_id: &str) -> Result<Ceremony, CoordinatorError> {
        let ceremony = self.load_ceremony(ceremony_id).await?;
        if ceremony.state != CeremonyState::Opened {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "ceremony {ceremony_id} is {}, expected OPENED",
                ceremony.state
            )));
        }
        Ok(ceremony)
    }

    async fn load_participant(
        &self,
        ceremony_id: &str,
        user_id: &str,
    ) -> Result<Participant, CoordinatorError> {
        self.store
            .participant(ceremony_id, user_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("participants/{user_id}")))
    }

    async fn write_participant(
        &self,
        participant: Participant,
        guard: Timestamp,
    ) -> Result<(), CoordinatorError> {
        self.store
            .commit(WriteBatch::new().with(WriteOp::UpdateParticipant {
                participant,
                expected_last_updated: Some(guard),
            }))
            .await?;
        Ok(())
    }

    // ── participant lifecycle ──

    /// Admit the caller into an opened ceremony, or re-admit them after a
    /// timeout. Returns whether they are (still) able to contribute.
    /// Calling twice is a no-op.
    pub async fn admit_participant(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<bool, CoordinatorError> {
        self.load_open_ceremony(ceremony_id).await?;

        let Some(participant) = self.store.participant(ceremony_id, &caller.user_id).await? else {
            self.store
                .commit(
                    WriteBatch::new().with(WriteOp::CreateParticipant(Participant::admitted(
                        &caller.user_id,
                        ceremony_id,
                    ))),
                )
                .await?;
            info!(ceremony_id, user_id = %caller.user_id, "participant admitted");
            return Ok(true);
        };

        match participant.status {
            ParticipantStatus::Timedout => {
                let now = self.clock.now_ms();
                let timeouts = self.store.timeouts(ceremony_id, &caller.user_id).await?;
                if timeouts.iter().any(|t| t.end_date >= now) {
                    return Ok(false);
                }
                let mut revived = participant.clone();
                let guard = revived.last_updated;
                fsm::exhume(&mut revived)?;
                self.write_participant(revived, guard).await?;
                info!(ceremony_id, user_id = %caller.user_id, "participant exhumed");
                Ok(true)
            }
            ParticipantStatus::Done | ParticipantStatus::Finalized => Ok(false),
            _ => Ok(true),
        }
    }

    /// WAITING(progress 0) or CONTRIBUTED(COMPLETED) → READY on the next
    /// circuit. The Scheduler picks the READY participant up from the feed.
    pub async fn advance_to_next_circuit(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<u32, CoordinatorError> {
        self.load_open_ceremony(ceremony_id).await?;
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        fsm::advance_to_next_circuit(&mut participant)?;
        let progress = participant.contribution_progress;
        self.write_participant(participant, guard).await?;
        Ok(progress)
    }

    /// Advance the contribution step by exactly one.
    pub async fn advance_step(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<ContributionStep, CoordinatorError> {
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        let step = fsm::advance_step(&mut participant, self.clock.now_ms())?;
        self.write_participant(participant, guard).await?;
        Ok(step)
    }

    /// Append the pending contribution entry (hash + computation time) the
    /// refresh handler will later bind to the contribution document.
    pub async fn store_permanent_contribution_record(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        hash: &str,
        computation_time_ms: i64,
    ) -> Result<(), CoordinatorError> {
        if hash.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "contribution hash must not be empty".to_string(),
            ));
        }
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;

        let computing = participant.status == ParticipantStatus::Contributing
            && participant.contribution_step == ContributionStep::Computing;
        let finalizing =
            caller.is_coordinator() && participant.status == ParticipantStatus::Finalizing;
        if !computing && !finalizing {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} is {} (step {}), expected CONTRIBUTING/COMPUTING or FINALIZING",
                participant.user_id, participant.status, participant.contribution_step
            )));
        }
        if participant.pending_contribution().is_some() {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} already has a pending contribution entry",
                participant.user_id
            )));
        }

        participant.contributions.push(ContributionEntry {
            hash: hash.to_string(),
            computation_time_ms,
            doc_ref: None,
        });
        participant.temp_data_mut().contribution_computation_time = Some(computation_time_ms);
        self.write_participant(participant, guard).await?;
        Ok(())
    }

    /// Persist the multipart upload id of the zkey being uploaded.
    pub async fn store_multipart_upload_id(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        upload_id: &str,
    ) -> Result<(), CoordinatorError> {
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        self.ensure_uploading(caller, &participant)?;

        let temp = participant.temp_data_mut();
        temp.upload_id = Some(upload_id.to_string());
        temp.chunks.clear();
        self.write_participant(participant, guard).await?;
        Ok(())
    }

    /// Record one uploaded chunk for upload resumption.
    pub async fn store_uploaded_chunk(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        chunk: ChunkRecord,
    ) -> Result<(), CoordinatorError> {
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        self.ensure_uploading(caller, &participant)?;

        participant.temp_data_mut().chunks.push(chunk);
        self.write_participant(participant, guard).await?;
        Ok(())
    }

    fn ensure_uploading(
        &self,
        caller: &CallerIdentity,
        participant: &Participant,
    ) -> Result<(), CoordinatorError> {
        let uploading = participant.status == ParticipantStatus::Contributing
            && participant.contribution_step == ContributionStep::Uploading;
        let finalizing =
            caller.is_coordinator() && participant.status == ParticipantStatus::Finalizing;
        if uploading || finalizing {
            Ok(())
        } else {
            Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} is {} (step {}), expected CONTRIBUTING/UPLOADING",
                participant.user_id, participant.status, participant.contribution_step
            )))
        }
    }

    /// Run the verification pipeline for the caller's pending contribution.
    pub async fn verify_contribution(
        &self,
        caller: &CallerIdentity,
        req: &VerifyRequest,
    ) -> Result<VerifyOutcome, CoordinatorError> {
        self.verifier.verify_contribution(caller, req).await
    }

    /// EXHUMED → READY; the Scheduler re-enrolls (or re-promotes) from there.
    pub async fn resume_after_timeout_expiration(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<(), CoordinatorError> {
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        fsm::resume_from_exhumed(&mut participant)?;
        self.write_participant(participant, guard).await?;
        Ok(())
    }

    // ── finalization ──

    fn ensure_coordinator(&self, caller: &CallerIdentity) -> Result<(), CoordinatorError> {
        if caller.is_coordinator() {
            Ok(())
        } else {
            Err(CoordinatorError::PermissionDenied(format!(
                "{} lacks the coordinator role",
                caller.user_id
            )))
        }
    }

    async fn load_closed_ceremony(&self, ceremony_id: &str) -> Result<Ceremony, CoordinatorError> {
        let ceremony = self.load_ceremony(ceremony_id).await?;
        if ceremony.state != CeremonyState::Closed {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "ceremony {ceremony_id} is {}, expected CLOSED",
                ceremony.state
            )));
        }
        Ok(ceremony)
    }

    /// DONE → FINALIZING for the coordinator once the ceremony closed and
    /// every circuit has been contributed to.
    pub async fn prepare_for_finalization(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.ensure_coordinator(caller)?;
        self.load_closed_ceremony(ceremony_id).await?;

        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let guard = participant.last_updated;
        let circuit_count = self.store.circuits(ceremony_id).await?.len() as u32;
        if participant.contribution_progress != circuit_count {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} contributed to {}/{} circuits",
                participant.user_id, participant.contribution_progress, circuit_count
            )));
        }
        fsm::prepare_finalization(&mut participant)?;
        self.write_participant(participant, guard).await?;
        info!(ceremony_id, user_id = %caller.user_id, "finalization prepared");
        Ok(())
    }

    /// Bind the beacon and the verification-key / verifier-contract artifact
    /// hashes to the circuit's final contribution. Returns the beacon hash.
    pub async fn finalize_circuit(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        circuit_id: &str,
        bucket_name: &str,
        beacon_value: &str,
    ) -> Result<String, CoordinatorError> {
        self.ensure_coordinator(caller)?;
        if beacon_value.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "beacon value must not be empty".to_string(),
            ));
        }
        self.load_closed_ceremony(ceremony_id).await?;
        let participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        if participant.status != ParticipantStatus::Finalizing {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} is {}, expected FINALIZING",
                participant.user_id, participant.status
            )));
        }

        let circuit = self
            .store
            .circuit(ceremony_id, circuit_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("circuits/{circuit_id}")))?;
        let mut contribution = self
            .store
            .contributions(ceremony_id, circuit_id)
            .await?
            .into_iter()
            .find(|c| c.zkey_index == FINAL_ZKEY_INDEX)
            .ok_or_else(|| {
                CoordinatorError::FailedPrecondition(format!(
                    "circuit {circuit_id} has no final contribution"
                ))
            })?;

        let vkey_filename = format!("{}_vkey.json", circuit.prefix);
        let contract_filename = format!("{}_verifier.sol", circuit.prefix);
        let vkey_path = circuit.verification_key_storage_path(&vkey_filename);
        let contract_path = circuit.verifier_contract_storage_path(&contract_filename);

        let vkey_bytes = self.blob.get_object(bucket_name, &vkey_path).await?;
        let contract_bytes = self.blob.get_object(bucket_name, &contract_path).await?;

        let files = contribution.files.get_or_insert_with(ContributionFiles::default);
        files.verification_key_filename = Some(vkey_filename);
        files.verification_key_storage_path = Some(vkey_path);
        files.verification_key_blake2b_hash = Some(blake2b_hex(&vkey_bytes));
        files.verifier_contract_filename = Some(contract_filename);
        files.verifier_contract_storage_path = Some(contract_path);
        files.verifier_contract_blake2b_hash = Some(blake2b_hex(&contract_bytes));

        let beacon_hash = sha256_hex(beacon_value.as_bytes());
        contribution.beacon = Some(Beacon {
            value: beacon_value.to_string(),
            hash: beacon_hash.clone(),
        });

        self.store
            .commit(WriteBatch::new().with(WriteOp::UpdateContribution(contribution)))
            .await?;
        info!(ceremony_id, circuit_id, "circuit finalized");
        Ok(beacon_hash)
    }

    /// CLOSED → FINALIZED once every circuit carries a valid final
    /// contribution; the coordinator's participant follows FINALIZING →
    /// FINALIZED in the same batch.
    pub async fn finalize_ceremony(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.ensure_coordinator(caller)?;
        let ceremony = self.load_closed_ceremony(ceremony_id).await?;
        let ceremony_guard = ceremony.last_updated;
        let mut participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        let participant_guard = participant.last_updated;

        for circuit in self.store.circuits(ceremony_id).await? {
            let finalized = self
                .store
                .contributions(ceremony_id, &circuit.id)
                .await?
                .iter()
                .any(|c| c.zkey_index == FINAL_ZKEY_INDEX && c.valid);
            if !finalized {
                return Err(CoordinatorError::FailedPrecondition(format!(
                    "circuit {} has no valid final contribution",
                    circuit.id
                )));
            }
        }

        fsm::finalize(&mut participant)?;
        let mut finalized = ceremony;
        finalized.state = CeremonyState::Finalized;

        self.store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::UpdateCeremony {
                        ceremony: finalized,
                        expected_last_updated: Some(ceremony_guard),
                    })
                    .with(WriteOp::UpdateParticipant {
                        participant,
                        expected_last_updated: Some(participant_guard),
                    }),
            )
            .await?;
        info!(ceremony_id, "ceremony finalized");
        Ok(())
    }

    // ── storage facade ──

    /// Ceremony bound to the bucket under the postfix convention.
    async fn ceremony_for_bucket(&self, bucket: &str) -> Result<Ceremony, CoordinatorError> {
        let prefix = bucket
            .strip_suffix(&self.config.bucket_postfix)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                CoordinatorError::PermissionDenied(format!(
                    "bucket {bucket} is not bound to a ceremony"
                ))
            })?;
        self.store
            .ceremony_by_prefix(prefix)
            .await?
            .ok_or_else(|| {
                CoordinatorError::PermissionDenied(format!(
                    "bucket {bucket} is not bound to a ceremony"
                ))
            })
    }

    pub async fn create_bucket(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
    ) -> Result<(), CoordinatorError> {
        self.ensure_coordinator(caller)?;
        self.blob.create_bucket(bucket).await?;
        Ok(())
    }

    pub async fn head_object(
        &self,
        _caller: &CallerIdentity,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, CoordinatorError> {
        Ok(self.blob.head_object(bucket, key).await?)
    }

    pub async fn presign_get(
        &self,
        _caller: &CallerIdentity,
        bucket: &str,
        key: &str,
    ) -> Result<String, CoordinatorError> {
        self.ceremony_for_bucket(bucket).await?;
        Ok(self
            .blob
            .presign_get(bucket, key, self.config.presign_expiration_secs)
            .await?)
    }

    /// Verify the caller may upload to the object key, then open the upload.
    /// For participants the key must be the next zkey of the circuit they
    /// are currently contributing to.
    pub async fn start_multipart_upload(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<String, CoordinatorError> {
        let ceremony = self.ceremony_for_bucket(bucket).await?;
        if ceremony.id != ceremony_id {
            return Err(CoordinatorError::InvalidArgument(format!(
                "bucket {bucket} does not belong to ceremony {ceremony_id}"
            )));
        }
        self.ensure_upload_key_allowed(caller, ceremony_id, key).await?;
        Ok(self.blob.start_multipart_upload(bucket, key).await?)
    }

    pub async fn presign_parts(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: u32,
    ) -> Result<Vec<String>, CoordinatorError> {
        if parts == 0 {
            return Err(CoordinatorError::InvalidArgument(
                "parts must be positive".to_string(),
            ));
        }
        self.ceremony_for_bucket(bucket).await?;
        self.ensure_upload_key_allowed(caller, ceremony_id, key).await?;
        Ok(self
            .blob
            .presign_upload_parts(bucket, key, upload_id, parts, self.config.presign_expiration_secs)
            .await?)
    }

    pub async fn complete_multipart_upload(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), CoordinatorError> {
        self.ceremony_for_bucket(bucket).await?;
        self.ensure_upload_key_allowed(caller, ceremony_id, key).await?;
        self.blob
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await?;
        Ok(())
    }

    /// Participants may only touch the next zkey of their current circuit;
    /// the finalizing coordinator is trusted with the `final` artifacts.
    async fn ensure_upload_key_allowed(
        &self,
        caller: &CallerIdentity,
        ceremony_id: &str,
        key: &str,
    ) -> Result<(), CoordinatorError> {
        let participant = self.load_participant(ceremony_id, &caller.user_id).await?;
        if caller.is_coordinator() && participant.status == ParticipantStatus::Finalizing {
            return Ok(());
        }
        if participant.status != ParticipantStatus::Contributing {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "participant {} is {}, expected CONTRIBUTING",
                participant.user_id, participant.status
            )));
        }
        let circuit = self
            .store
            .circuit_at_position(ceremony_id, participant.contribution_progress)
            .await?
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!(
                    "no circuit at position {}",
                    participant.contribution_progress
                ))
            })?;
        if circuit.waiting_queue.current_contributor != caller.user_id {
            return Err(CoordinatorError::FailedPrecondition(format!(
                "{} is not the current contributor of circuit {}",
                caller.user_id, circuit.id
            )));
        }
        let expected =
            circuit.zkey_storage_path(&zkey_index(circuit.waiting_queue.next_zkey_index()));
        if key != expected {
            return Err(CoordinatorError::InvalidArgument(format!(
                "object key {key} does not match the expected next zkey {expected}"
            )));
        }
        Ok(())
    }

    // ── inspection ──

    pub async fn ceremony_status(
        &self,
        ceremony_id: &str,
    ) -> Result<CeremonyStatus, CoordinatorError> {
        let ceremony = self.load_ceremony(ceremony_id).await?;
        let circuits = self
            .store
            .circuits(ceremony_id)
            .await?
            .into_iter()
            .map(|c| CircuitQueueStatus {
                circuit_id: c.id,
                sequence_position: c.sequence_position,
                current_contributor: c.waiting_queue.current_contributor,
                queued: c.waiting_queue.contributors.len() as u32,
                completed_contributions: c.waiting_queue.completed_contributions,
                failed_contributions: c.waiting_queue.failed_contributions,
            })
            .collect();
        Ok(CeremonyStatus {
            ceremony_id: ceremony.id,
            state: ceremony.state,
            circuits,
        })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
