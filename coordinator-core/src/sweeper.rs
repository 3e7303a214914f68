//! Timeout sweeper.
//!
//! Periodic scan over every open ceremony: detects current contributors
//! whose step progress stalled past the computed deadline, evicts them from
//! the queue, marks them TIMEDOUT and records the penalty window. Runs in
//! parallel with client calls; a lost compare-and-set race is simply retried
//! on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CoordinatorError;
use crate::fsm;
use crate::queue::{self, ParticipantIntent};
use crate::store::{CeremonyStore, WriteBatch, WriteOp};
use crate::types::*;

const MINUTE_MS: i64 = 60_000;

/// Hard ceiling on a single verification, minutes.
const VERIFICATION_WINDOW_MINUTES: i64 = 59;

pub struct TimeoutSweeper {
    store: Arc<dyn CeremonyStore>,
    clock: Arc<dyn Clock>,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn CeremonyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// One full pass. Returns the number of evictions performed.
    pub async fn sweep(&self) -> Result<usize, CoordinatorError> {
        let now = self.clock.now_ms();
        let mut evicted = 0;

        for ceremony in self.store.ceremonies_in_state(CeremonyState::Opened).await? {
            if ceremony.end_date < now {
                continue;
            }
            for circuit in self.store.circuits(&ceremony.id).await? {
                if !circuit.waiting_queue.has_current() {
                    continue;
                }
                match self.sweep_circuit(&ceremony, &circuit, now).await {
                    Ok(true) => evicted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // Leave the circuit for the next tick.
                        warn!(
                            ceremony_id = %ceremony.id,
                            circuit_id = %circuit.id,
                            error = %e,
                            "sweep skipped circuit"
                        );
                    }
                }
            }
        }
        Ok(evicted)
    }

    async fn sweep_circuit(
        &self,
        ceremony: &Ceremony,
        circuit: &Circuit,
        now: Timestamp,
    ) -> Result<bool, CoordinatorError> {
        let user_id = circuit.waiting_queue.current_contributor.clone();
        let Some(participant) = self.store.participant(&ceremony.id, &user_id).await? else {
            warn!(user_id = %user_id, "current contributor without participant doc");
            return Ok(false);
        };

        // The very first contribution of a DYNAMIC circuit has no baseline
        // to derive a deadline from.
        if ceremony.timeout_type == TimeoutType::Dynamic
            && circuit.avg_timings.is_unset()
            && circuit.waiting_queue.completed_contributions == 0
        {
            return Ok(false);
        }

        let contribution_deadline = match ceremony.timeout_type {
            TimeoutType::Fixed => {
                participant.contribution_started_at
                    + circuit.fixed_time_window_minutes * MINUTE_MS
            }
            TimeoutType::Dynamic => {
                let avg = circuit.avg_timings.full_contribution;
                participant.contribution_started_at
                    + avg
                    + avg * circuit.dynamic_threshold_pct / 100
            }
        };

        let kind = match participant.contribution_step {
            ContributionStep::Downloading
            | ContributionStep::Computing
            | ContributionStep::Uploading
                if now > contribution_deadline =>
            {
                TimeoutKind::BlockingContribution
            }
            ContributionStep::Verifying if participant.verification_started_at > 0 => {
                let verification_deadline = participant.verification_started_at
                    + VERIFICATION_WINDOW_MINUTES * MINUTE_MS;
                if now > verification_deadline {
                    TimeoutKind::BlockingVerification
                } else {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        };

        self.evict(ceremony, circuit, &participant, kind, now).await?;
        Ok(true)
    }

    async fn evict(
        &self,
        ceremony: &Ceremony,
        circuit: &Circuit,
        participant: &Participant,
        kind: TimeoutKind,
        now: Timestamp,
    ) -> Result<(), CoordinatorError> {
        let update = queue::evict_head(&circuit.waiting_queue)?;

        let mut batch = WriteBatch::new();
        let mut updated = circuit.clone();
        updated.waiting_queue = update.queue;
        batch.push(WriteOp::UpdateCircuit {
            circuit: updated,
            expected_last_updated: Some(circuit.last_updated),
        });

        let mut evicted = participant.clone();
        let guard = evicted.last_updated;
        fsm::mark_timed_out(&mut evicted)?;
        batch.push(WriteOp::UpdateParticipant {
            participant: evicted,
            expected_last_updated: Some(guard),
        });

        batch.push(WriteOp::CreateTimeout(TimeoutRecord {
            id: Uuid::now_v7().to_string(),
            ceremony_id: ceremony.id.clone(),
            participant_id: participant.user_id.clone(),
            kind,
            start_date: now,
            end_date: now + ceremony.penalty_minutes * MINUTE_MS,
        }));

        for intent in &update.intents {
            if let ParticipantIntent::Promote { user_id } = intent {
                let mut next = self
                    .store
                    .participant(&ceremony.id, user_id)
                    .await?
                    .ok_or_else(|| CoordinatorError::NotFound(format!("participants/{user_id}")))?;
                let next_guard = next.last_updated;
                fsm::promote(&mut next, now)?;
                batch.push(WriteOp::UpdateParticipant {
                    participant: next,
                    expected_last_updated: Some(next_guard),
                });
            }
        }

        self.store.commit(batch).await?;
        info!(
            ceremony_id = %ceremony.id,
            circuit_id = %circuit.id,
            user_id = %participant.user_id,
            kind = ?kind,
            "evicted stalled contributor"
        );
        Ok(())
    }

    /// Run `sweep` on a fixed cadence until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, interval: Duration) {
        info!("timeout sweeper started");
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
                _ = self.clock.sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
        info!("timeout sweeper shut down");
    }
}
