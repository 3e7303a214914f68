use std::sync::Arc;

use tonic::{Request, Response, Status};

use coordinator_core::auth::{role_for_email, CallerIdentity};
use coordinator_core::blob_store::CompletedPart;
use coordinator_core::config::CoordinatorConfig;
use coordinator_core::engine::CeremonyEngine;
use coordinator_core::types::ChunkRecord;
use coordinator_core::verifier::VerifyRequest;
use coordinator_core::CoordinatorError;

pub mod proto {
    tonic::include_proto!("coordinator.v1");
}

use proto::coordinator_server::Coordinator;
use proto::*;

pub struct CoordinatorService {
    pub engine: Arc<CeremonyEngine>,
    pub config: CoordinatorConfig,
}

/// Map a core error kind onto its gRPC status code.
fn to_status(e: CoordinatorError) -> Status {
    match e {
        CoordinatorError::Unauthenticated => Status::unauthenticated(e.to_string()),
        CoordinatorError::PermissionDenied(_) => Status::permission_denied(e.to_string()),
        CoordinatorError::InvalidArgument(_) => Status::invalid_argument(e.to_string()),
        CoordinatorError::FailedPrecondition(_) | CoordinatorError::NoPendingContribution(_) => {
            Status::failed_precondition(e.to_string())
        }
        CoordinatorError::NotFound(_) => Status::not_found(e.to_string()),
        CoordinatorError::VmUnavailable(_) => Status::unavailable(e.to_string()),
        CoordinatorError::VmCommandAborted(_) => Status::aborted(e.to_string()),
        CoordinatorError::Configuration(_) | CoordinatorError::StorageFailure(_) => {
            Status::internal(e.to_string())
        }
    }
}

impl CoordinatorService {
    /// Caller identity from request metadata. Identity issuance happens at
    /// the edge; here we only read the authenticated headers.
    #[allow(clippy::result_large_err)]
    fn caller<T>(&self, request: &Request<T>) -> Result<CallerIdentity, Status> {
        let metadata = request.metadata();
        let user_id = metadata
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Status::unauthenticated("no caller identity"))?
            .to_string();
        let email = metadata
            .get("x-user-email")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let role = role_for_email(&email, &self.config.coordinator_email_domain);
        Ok(CallerIdentity {
            user_id,
            email,
            role,
        })
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn admit_participant(
        &self,
        request: Request<AdmitParticipantRequest>,
    ) -> Result<Response<AdmitParticipantResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let can_contribute = self
            .engine
            .admit_participant(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(AdmitParticipantResponse { can_contribute }))
    }

    async fn advance_to_next_circuit(
        &self,
        request: Request<AdvanceToNextCircuitRequest>,
    ) -> Result<Response<AdvanceToNextCircuitResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let contribution_progress = self
            .engine
            .advance_to_next_circuit(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(AdvanceToNextCircuitResponse {
            contribution_progress,
        }))
    }

    async fn advance_step(
        &self,
        request: Request<AdvanceStepRequest>,
    ) -> Result<Response<AdvanceStepResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let step = self
            .engine
            .advance_step(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(AdvanceStepResponse {
            contribution_step: step.as_str().to_string(),
        }))
    }

    async fn store_permanent_contribution_record(
        &self,
        request: Request<StorePermanentContributionRecordRequest>,
    ) -> Result<Response<StorePermanentContributionRecordResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .store_permanent_contribution_record(
                &caller,
                &req.ceremony_id,
                &req.contribution_hash,
                req.computation_time_ms,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(StorePermanentContributionRecordResponse {}))
    }

    async fn store_multipart_upload_id(
        &self,
        request: Request<StoreMultipartUploadIdRequest>,
    ) -> Result<Response<StoreMultipartUploadIdResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .store_multipart_upload_id(&caller, &req.ceremony_id, &req.upload_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(StoreMultipartUploadIdResponse {}))
    }

    async fn store_uploaded_chunk(
        &self,
        request: Request<StoreUploadedChunkRequest>,
    ) -> Result<Response<StoreUploadedChunkResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .store_uploaded_chunk(
                &caller,
                &req.ceremony_id,
                ChunkRecord {
                    e_tag: req.e_tag,
                    part_number: req.part_number,
                },
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(StoreUploadedChunkResponse {}))
    }

    async fn verify_contribution(
        &self,
        request: Request<VerifyContributionRequest>,
    ) -> Result<Response<VerifyContributionResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let outcome = self
            .engine
            .verify_contribution(
                &caller,
                &VerifyRequest {
                    ceremony_id: req.ceremony_id,
                    circuit_id: req.circuit_id,
                    bucket_name: req.bucket_name,
                    identifier: req.identifier,
                },
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(VerifyContributionResponse {
            valid: outcome.valid,
            full_contribution_time_ms: outcome.full_contribution_time_ms,
            verify_time_ms: outcome.verify_time_ms,
        }))
    }

    async fn resume_after_timeout_expiration(
        &self,
        request: Request<ResumeAfterTimeoutExpirationRequest>,
    ) -> Result<Response<ResumeAfterTimeoutExpirationResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .resume_after_timeout_expiration(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(ResumeAfterTimeoutExpirationResponse {}))
    }

    async fn prepare_for_finalization(
        &self,
        request: Request<PrepareForFinalizationRequest>,
    ) -> Result<Response<PrepareForFinalizationResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .prepare_for_finalization(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PrepareForFinalizationResponse {}))
    }

    async fn finalize_circuit(
        &self,
        request: Request<FinalizeCircuitRequest>,
    ) -> Result<Response<FinalizeCircuitResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let beacon_hash = self
            .engine
            .finalize_circuit(
                &caller,
                &req.ceremony_id,
                &req.circuit_id,
                &req.bucket_name,
                &req.beacon_value,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(FinalizeCircuitResponse { beacon_hash }))
    }

    async fn finalize_ceremony(
        &self,
        request: Request<FinalizeCeremonyRequest>,
    ) -> Result<Response<FinalizeCeremonyResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .finalize_ceremony(&caller, &req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(FinalizeCeremonyResponse {}))
    }

    async fn create_bucket(
        &self,
        request: Request<CreateBucketRequest>,
    ) -> Result<Response<CreateBucketResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        self.engine
            .create_bucket(&caller, &req.bucket_name)
            .await
            .map_err(to_status)?;
        Ok(Response::new(CreateBucketResponse {}))
    }

    async fn head_object(
        &self,
        request: Request<HeadObjectRequest>,
    ) -> Result<Response<HeadObjectResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let metadata = self
            .engine
            .head_object(&caller, &req.bucket_name, &req.object_key)
            .await
            .map_err(to_status)?;
        Ok(Response::new(HeadObjectResponse {
            exists: metadata.is_some(),
            size_bytes: metadata.map(|m| m.size).unwrap_or(0),
        }))
    }

    async fn presign_get(
        &self,
        request: Request<PresignGetRequest>,
    ) -> Result<Response<PresignGetResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let url = self
            .engine
            .presign_get(&caller, &req.bucket_name, &req.object_key)
            .await
            .map_err(to_status)?;
        Ok(Response::new(PresignGetResponse { url }))
    }

    async fn start_multipart_upload(
        &self,
        request: Request<StartMultipartUploadRequest>,
    ) -> Result<Response<StartMultipartUploadResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let upload_id = self
            .engine
            .start_multipart_upload(&caller, &req.ceremony_id, &req.bucket_name, &req.object_key)
            .await
            .map_err(to_status)?;
        Ok(Response::new(StartMultipartUploadResponse { upload_id }))
    }

    async fn presign_parts(
        &self,
        request: Request<PresignPartsRequest>,
    ) -> Result<Response<PresignPartsResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let urls = self
            .engine
            .presign_parts(
                &caller,
                &req.ceremony_id,
                &req.bucket_name,
                &req.object_key,
                &req.upload_id,
                req.parts,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(PresignPartsResponse { urls }))
    }

    async fn complete_multipart_upload(
        &self,
        request: Request<CompleteMultipartUploadRequest>,
    ) -> Result<Response<CompleteMultipartUploadResponse>, Status> {
        let caller = self.caller(&request)?;
        let req = request.into_inner();
        let parts: Vec<CompletedPart> = req
            .parts
            .into_iter()
            .map(|p| CompletedPart {
                e_tag: p.e_tag,
                part_number: p.part_number,
            })
            .collect();
        self.engine
            .complete_multipart_upload(
                &caller,
                &req.ceremony_id,
                &req.bucket_name,
                &req.object_key,
                &req.upload_id,
                &parts,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(CompleteMultipartUploadResponse {}))
    }

    async fn get_ceremony_status(
        &self,
        request: Request<GetCeremonyStatusRequest>,
    ) -> Result<Response<GetCeremonyStatusResponse>, Status> {
        let _caller = self.caller(&request)?;
        let req = request.into_inner();
        let status = self
            .engine
            .ceremony_status(&req.ceremony_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(GetCeremonyStatusResponse {
            state: status.state.as_str().to_string(),
            circuits: status
                .circuits
                .into_iter()
                .map(|c| CircuitQueueStatus {
                    circuit_id: c.circuit_id,
                    sequence_position: c.sequence_position,
                    current_contributor: c.current_contributor,
                    queued: c.queued,
                    completed_contributions: c.completed_contributions,
                    failed_contributions: c.failed_contributions,
                })
                .collect(),
        }))
    }
}
