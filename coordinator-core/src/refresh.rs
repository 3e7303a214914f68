//! Post-verification refresh.
//!
//! Change handler on contribution creation: links the new document into the
//! participant's pending contribution entry and completes the participant's
//! circuit (CONTRIBUTED, or DONE after the last one). The resulting
//! participant change is what triggers the Scheduler's completion branch.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::error::{CoordinatorError, StoreError};
use crate::fsm;
use crate::store::{CeremonyStore, ContributionCreated, WriteBatch, WriteOp};
use crate::types::ParticipantStatus;

const MAX_CAS_ATTEMPTS: u32 = 3;

pub struct RefreshHandler {
    store: Arc<dyn CeremonyStore>,
}

impl RefreshHandler {
    pub fn new(store: Arc<dyn CeremonyStore>) -> Self {
        Self { store }
    }

    /// Bind the contribution back to its participant. Redeliveries find no
    /// pending entry and are skipped.
    pub async fn handle(&self, event: &ContributionCreated) -> Result<(), CoordinatorError> {
        let contribution = &event.contribution;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(mut participant) = self
                .store
                .participant(&contribution.ceremony_id, &contribution.participant_id)
                .await?
            else {
                warn!(
                    participant_id = %contribution.participant_id,
                    "contribution for unknown participant, skipping"
                );
                return Ok(());
            };
            let guard = participant.last_updated;

            let Some((idx, _)) = participant.pending_contribution() else {
                // Already linked by an earlier delivery.
                return Ok(());
            };
            participant.contributions[idx].doc_ref = Some(contribution.id.clone());

            if participant.status != ParticipantStatus::Finalizing {
                let circuit_count = self.store.circuits(&contribution.ceremony_id).await?.len();
                fsm::complete_contribution(&mut participant, circuit_count as u32)?;
            }

            let batch = WriteBatch::new().with(WriteOp::UpdateParticipant {
                participant: participant.clone(),
                expected_last_updated: Some(guard),
            });
            match self.store.commit(batch).await {
                Ok(()) => {
                    info!(
                        participant_id = %contribution.participant_id,
                        contribution_id = %contribution.id,
                        status = %participant.status,
                        "contribution linked"
                    );
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt < MAX_CAS_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Drain the contribution feed until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("refresh handler started");
        let mut feed = self.store.watch_contributions();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = feed.recv() => match msg {
                    Ok(event) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!(
                                contribution_id = %event.contribution.id,
                                error = %e,
                                "refresh handler skipped contribution"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "contribution feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        info!("refresh handler shut down");
    }
}
