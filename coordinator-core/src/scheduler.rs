//! Contribution scheduler.
//!
//! Reacts to participant document changes: enrolls newcomers into circuit
//! queues, promotes waiters when the head finishes, and re-admits
//! contributors returning from a timeout. Queue state and the implied
//! participant updates are committed in a single conditional batch, so no
//! observer ever sees a queue that disagrees with the participants it
//! coordinates.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoordinatorError, StoreError};
use crate::fsm;
use crate::queue::{self, ParticipantIntent, QueueUpdate};
use crate::store::{CeremonyStore, ParticipantChange, WriteBatch, WriteOp};
use crate::types::{Participant, ParticipantStatus, ContributionStep};

/// Bounded retries for batches that lose the circuit compare-and-set race.
const MAX_CAS_ATTEMPTS: u32 = 3;

enum Classification {
    /// READY participant entering (or re-entering) the circuit at the given
    /// sequence position.
    Admission { position: u32 },
    /// Verified contribution or terminal DONE: pop the head of the circuit
    /// at the given sequence position.
    Completion { position: u32 },
    None,
}

pub struct Scheduler {
    store: Arc<dyn CeremonyStore>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn CeremonyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Process one observed participant change. Peripheral inconsistencies
    /// (missing circuit, stale redelivery) are logged and skipped so the
    /// feed never cascades redeliveries.
    pub async fn handle(&self, change: &ParticipantChange) -> Result<(), CoordinatorError> {
        match Self::classify(change) {
            Classification::Admission { position } => {
                self.admit(&change.after, position).await
            }
            Classification::Completion { position } => {
                self.complete(&change.after, position).await
            }
            Classification::None => Ok(()),
        }
    }

    fn classify(change: &ParticipantChange) -> Classification {
        let after = &change.after;
        let before = change.before.as_ref();

        // No-op change: nothing to coordinate.
        if let Some(b) = before {
            if b.status == after.status
                && b.contribution_step == after.contribution_step
                && b.contribution_progress == after.contribution_progress
            {
                return Classification::None;
            }
        }

        let prev_progress = before.map(|b| b.contribution_progress).unwrap_or(0);
        let prev_status = before.map(|b| b.status);

        // Admission for contribution: a fresh READY, a READY at unchanged
        // progress (resume after timeout), or a READY one circuit further
        // along (advancing between circuits).
        if after.status == ParticipantStatus::Ready {
            let admission = prev_progress == 0
                || prev_progress == after.contribution_progress
                || (after.contribution_progress == prev_progress + 1
                    && after.contribution_progress != 1);
            if admission {
                return Classification::Admission {
                    position: after.contribution_progress,
                };
            }
        }

        // Completion: verified contribution (CONTRIBUTING/VERIFYING →
        // CONTRIBUTED/COMPLETED at the same progress) or first arrival at
        // DONE.
        if let Some(b) = before {
            let verified = b.status == ParticipantStatus::Contributing
                && b.contribution_step == ContributionStep::Verifying
                && after.status == ParticipantStatus::Contributed
                && after.contribution_step == ContributionStep::Completed
                && b.contribution_progress == after.contribution_progress;
            let done = after.status == ParticipantStatus::Done
                && prev_status != Some(ParticipantStatus::Done);
            if verified || done {
                return Classification::Completion {
                    position: b.contribution_progress,
                };
            }
        }

        Classification::None
    }

    async fn admit(&self, participant: &Participant, position: u32) -> Result<(), CoordinatorError> {
        let user_id = participant.user_id.clone();
        self.apply_with_retry(&participant.ceremony_id, position, move |queue| {
            if queue.current_contributor == user_id {
                // Head slot survived the timeout: re-promote in place.
                queue::resume_after_timeout(queue, &user_id).map(Some)
            } else {
                Ok(Some(queue::enroll(queue, &user_id)))
            }
        })
        .await
    }

    async fn complete(
        &self,
        participant: &Participant,
        position: u32,
    ) -> Result<(), CoordinatorError> {
        let user_id = participant.user_id.clone();
        self.apply_with_retry(&participant.ceremony_id, position, move |queue| {
            if queue.current_contributor != user_id {
                // Redelivered event for a head that was already popped.
                debug!(user_id = %user_id, "completion for a non-head participant, skipping");
                return Ok(None);
            }
            queue::complete_head(queue).map(Some)
        })
        .await
    }

    /// Load the circuit, run the queue transformation, and commit the new
    /// queue plus every implied participant update in one guarded batch.
    /// Losing the compare-and-set race re-reads and retries.
    async fn apply_with_retry<F>(
        &self,
        ceremony_id: &str,
        position: u32,
        transform: F,
    ) -> Result<(), CoordinatorError>
    where
        F: Fn(&crate::types::WaitingQueue) -> Result<Option<QueueUpdate>, CoordinatorError>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(circuit) = self
                .store
                .circuit_at_position(ceremony_id, position)
                .await?
            else {
                warn!(ceremony_id, position, "no circuit at position, skipping");
                return Ok(());
            };

            let Some(update) = transform(&circuit.waiting_queue)? else {
                return Ok(());
            };
            if update.queue == circuit.waiting_queue && update.intents.is_empty() {
                return Ok(());
            }

            let mut batch = WriteBatch::new();
            let mut updated = circuit.clone();
            updated.waiting_queue = update.queue.clone();
            batch.push(WriteOp::UpdateCircuit {
                circuit: updated,
                expected_last_updated: Some(circuit.last_updated),
            });

            self.stage_intents(ceremony_id, &update.intents, &mut batch)
                .await?;

            match self.store.commit(batch).await {
                Ok(()) => {
                    info!(
                        ceremony_id,
                        circuit_id = %circuit.id,
                        current = %update.queue.current_contributor,
                        queued = update.queue.contributors.len(),
                        "queue updated"
                    );
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(ceremony_id, position, attempt, "lost queue race, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("retry loop always returns");
    }

    async fn stage_intents(
        &self,
        ceremony_id: &str,
        intents: &[ParticipantIntent],
        batch: &mut WriteBatch,
    ) -> Result<(), CoordinatorError> {
        let now = self.clock.now_ms();
        for intent in intents {
            let user_id = match intent {
                ParticipantIntent::Promote { user_id } | ParticipantIntent::Wait { user_id } => {
                    user_id
                }
            };
            let mut p = self
                .store
                .participant(ceremony_id, user_id)
                .await?
                .ok_or_else(|| {
                    CoordinatorError::NotFound(format!("participants/{user_id}"))
                })?;
            let guard = p.last_updated;
            match intent {
                ParticipantIntent::Promote { .. } => fsm::promote(&mut p, now)?,
                ParticipantIntent::Wait { .. } => fsm::queue_behind(&mut p)?,
            }
            batch.push(WriteOp::UpdateParticipant {
                participant: p,
                expected_last_updated: Some(guard),
            });
        }
        Ok(())
    }

    /// Drain the participant feed until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut feed = self.store.watch_participants();
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
                    Ok(change) => {
                        if let Err(e) = self.handle(&change).await {
                            warn!(user_id = %change.after.user_id, error = %e, "scheduler skipped change");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "participant feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        info!("scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_memory::MemoryStore;
    use crate::types::*;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        scheduler: Scheduler,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let scheduler = Scheduler::new(store.clone(), clock.clone());

        let ceremony = Ceremony {
            id: "c1".into(),
            title: "Ceremony".into(),
            prefix: "cer".into(),
            start_date: 0,
            end_date: 100_000_000,
            state: CeremonyState::Opened,
            timeout_type: TimeoutType::Fixed,
            penalty_minutes: 5,
            coordinator_id: "coord".into(),
            last_updated: 0,
        };
        let circuit = Circuit {
            id: "k1".into(),
            ceremony_id: "c1".into(),
            prefix: "mul".into(),
            sequence_position: 1,
            avg_timings: AvgTimings::default(),
            waiting_queue: WaitingQueue::default(),
            verification: VerificationMechanism::Local,
            dynamic_threshold_pct: 0,
            fixed_time_window_minutes: 30,
            pot_filename: "pot.ptau".into(),
            genesis_zkey_filename: "mul_00000.zkey".into(),
            last_updated: 0,
        };
        store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::CreateCeremony(ceremony))
                    .with(WriteOp::CreateCircuit(circuit)),
            )
            .await
            .unwrap();

        Fixture {
            store,
            clock,
            scheduler,
        }
    }

    async fn create_ready(f: &Fixture, user: &str, progress: u32) -> Participant {
        let mut p = Participant::admitted(user, "c1");
        p.status = ParticipantStatus::Ready;
        p.contribution_progress = progress;
        f.store
            .commit(WriteBatch::new().with(WriteOp::CreateParticipant(p.clone())))
            .await
            .unwrap();
        f.store.participant("c1", user).await.unwrap().unwrap()
    }

    fn ready_change(before: Option<Participant>, after: Participant) -> ParticipantChange {
        ParticipantChange { before, after }
    }

    #[tokio::test]
    async fn first_admission_promotes_into_empty_queue() {
        let f = fixture().await;
        let waiting = Participant::admitted("alice", "c1");
        let ready = create_ready(&f, "alice", 1).await;
        f.clock.set(2_000);

        f.scheduler
            .handle(&ready_change(Some(waiting), ready))
            .await
            .unwrap();

        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert_eq!(circuit.waiting_queue.contributors, vec!["alice"]);
        assert_eq!(circuit.waiting_queue.current_contributor, "alice");

        let alice = f.store.participant("c1", "alice").await.unwrap().unwrap();
        assert_eq!(alice.status, ParticipantStatus::Contributing);
        assert_eq!(alice.contribution_step, ContributionStep::Downloading);
        assert_eq!(alice.contribution_started_at, 2_000);
    }

    #[tokio::test]
    async fn second_admission_waits_behind_the_head() {
        let f = fixture().await;
        let alice_waiting = Participant::admitted("alice", "c1");
        let alice_ready = create_ready(&f, "alice", 1).await;
        f.scheduler
            .handle(&ready_change(Some(alice_waiting), alice_ready))
            .await
            .unwrap();

        let bob_waiting = Participant::admitted("bob", "c1");
        let bob_ready = create_ready(&f, "bob", 1).await;
        f.scheduler
            .handle(&ready_change(Some(bob_waiting), bob_ready))
            .await
            .unwrap();

        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert_eq!(circuit.waiting_queue.contributors, vec!["alice", "bob"]);
        assert_eq!(circuit.waiting_queue.current_contributor, "alice");

        let bob = f.store.participant("c1", "bob").await.unwrap().unwrap();
        assert_eq!(bob.status, ParticipantStatus::Waiting);
    }

    #[tokio::test]
    async fn completion_pops_head_and_promotes_next() {
        let f = fixture().await;
        // Alice contributing at head, Bob waiting behind.
        let alice_waiting = Participant::admitted("alice", "c1");
        let alice_ready = create_ready(&f, "alice", 1).await;
        f.scheduler
            .handle(&ready_change(Some(alice_waiting), alice_ready))
            .await
            .unwrap();
        let bob_waiting = Participant::admitted("bob", "c1");
        let bob_ready = create_ready(&f, "bob", 1).await;
        f.scheduler
            .handle(&ready_change(Some(bob_waiting), bob_ready))
            .await
            .unwrap();

        // Alice finishes verification: CONTRIBUTING/VERIFYING → DONE.
        let mut before = f.store.participant("c1", "alice").await.unwrap().unwrap();
        before.contribution_step = ContributionStep::Verifying;
        let mut after = before.clone();
        after.status = ParticipantStatus::Done;
        after.contribution_step = ContributionStep::Completed;

        f.scheduler
            .handle(&ready_change(Some(before), after))
            .await
            .unwrap();

        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert_eq!(circuit.waiting_queue.contributors, vec!["bob"]);
        assert_eq!(circuit.waiting_queue.current_contributor, "bob");

        let bob = f.store.participant("c1", "bob").await.unwrap().unwrap();
        assert_eq!(bob.status, ParticipantStatus::Contributing);
        assert_eq!(bob.contribution_step, ContributionStep::Downloading);
    }

    #[tokio::test]
    async fn resume_re_promotes_a_surviving_head() {
        let f = fixture().await;

        // Carol holds the head slot although her participant doc fell back
        // to READY at unchanged progress (timeout round trip).
        let mut circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        circuit.waiting_queue.contributors = vec!["carol".into()];
        circuit.waiting_queue.current_contributor = "carol".into();
        f.store
            .commit(WriteBatch::new().with(WriteOp::UpdateCircuit {
                circuit,
                expected_last_updated: None,
            }))
            .await
            .unwrap();

        let carol = create_ready(&f, "carol", 1).await;
        let mut exhumed = carol.clone();
        exhumed.status = ParticipantStatus::Exhumed;

        f.scheduler
            .handle(&ready_change(Some(exhumed), carol))
            .await
            .unwrap();

        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        // Queue unchanged, participant promoted in place.
        assert_eq!(circuit.waiting_queue.contributors, vec!["carol"]);
        assert_eq!(circuit.waiting_queue.current_contributor, "carol");
        let carol = f.store.participant("c1", "carol").await.unwrap().unwrap();
        assert_eq!(carol.status, ParticipantStatus::Contributing);
    }

    #[tokio::test]
    async fn evicted_participant_re_enrolls_at_the_tail() {
        let f = fixture().await;

        // Dave took the head after Carol's eviction; Carol comes back READY.
        let mut circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        circuit.waiting_queue.contributors = vec!["dave".into()];
        circuit.waiting_queue.current_contributor = "dave".into();
        f.store
            .commit(WriteBatch::new().with(WriteOp::UpdateCircuit {
                circuit,
                expected_last_updated: None,
            }))
            .await
            .unwrap();

        let carol = create_ready(&f, "carol", 1).await;
        let mut exhumed = carol.clone();
        exhumed.status = ParticipantStatus::Exhumed;

        f.scheduler
            .handle(&ready_change(Some(exhumed), carol))
            .await
            .unwrap();

        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert_eq!(circuit.waiting_queue.contributors, vec!["dave", "carol"]);
        assert_eq!(circuit.waiting_queue.current_contributor, "dave");
        let carol = f.store.participant("c1", "carol").await.unwrap().unwrap();
        assert_eq!(carol.status, ParticipantStatus::Waiting);
    }

    #[tokio::test]
    async fn no_op_changes_are_skipped() {
        let f = fixture().await;
        let p = create_ready(&f, "alice", 1).await;
        // Identical before/after: the queue must stay untouched.
        f.scheduler
            .handle(&ready_change(Some(p.clone()), p))
            .await
            .unwrap();
        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert!(circuit.waiting_queue.contributors.is_empty());
    }

    #[tokio::test]
    async fn completion_for_non_head_is_skipped() {
        let f = fixture().await;
        let mut before = create_ready(&f, "mallory", 1).await;
        before.status = ParticipantStatus::Contributing;
        before.contribution_step = ContributionStep::Verifying;
        let mut after = before.clone();
        after.status = ParticipantStatus::Contributed;
        after.contribution_step = ContributionStep::Completed;

        // Mallory is not the current contributor: nothing happens.
        f.scheduler
            .handle(&ready_change(Some(before), after))
            .await
            .unwrap();
        let circuit = f.store.circuit("c1", "k1").await.unwrap().unwrap();
        assert_eq!(circuit.waiting_queue.failed_contributions, 0);
        assert!(!circuit.waiting_queue.has_current());
    }
}
