use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::types::*;

/// `(before, after)` snapshot delivered on the participant change feed.
/// Delivery is at-least-once; handlers must tolerate replays.
#[derive(Clone, Debug)]
pub struct ParticipantChange {
    pub before: Option<Participant>,
    pub after: Participant,
}

/// Event delivered on the contribution change feed when a document is created.
#[derive(Clone, Debug)]
pub struct ContributionCreated {
    pub contribution: Contribution,
}

/// One operation of an atomic batch. Updates may carry a compare-and-set
/// guard on the target's `last_updated`.
#[derive(Clone, Debug)]
pub enum WriteOp {
    CreateCeremony(Ceremony),
    UpdateCeremony {
        ceremony: Ceremony,
        expected_last_updated: Option<Timestamp>,
    },
    CreateCircuit(Circuit),
    UpdateCircuit {
        circuit: Circuit,
        expected_last_updated: Option<Timestamp>,
    },
    CreateParticipant(Participant),
    UpdateParticipant {
        participant: Participant,
        expected_last_updated: Option<Timestamp>,
    },
    CreateContribution(Contribution),
    /// Unconditional; only the finalization flow rewrites a contribution,
    /// and it is serialized by the coordinator role.
    UpdateContribution(Contribution),
    CreateTimeout(TimeoutRecord),
}

/// Ordered set of operations committed atomically: either every op applies
/// or none does.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Linearizable document store for one coordinator deployment.
///
/// Reads are point-in-time snapshots. `commit` applies a whole batch under a
/// single linearization point; conditional updates compare the stored
/// `last_updated` and fail the entire batch with [`StoreError::Conflict`] on
/// mismatch. The store stamps `last_updated` on every applied write.
#[async_trait]
pub trait CeremonyStore: Send + Sync {
    async fn ceremony(&self, ceremony_id: &str) -> Result<Option<Ceremony>, StoreError>;
    async fn ceremony_by_prefix(&self, prefix: &str) -> Result<Option<Ceremony>, StoreError>;
    async fn ceremonies_in_state(&self, state: CeremonyState) -> Result<Vec<Ceremony>, StoreError>;

    async fn circuit(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Option<Circuit>, StoreError>;
    /// All circuits of a ceremony, ordered by sequence position.
    async fn circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>, StoreError>;
    async fn circuit_at_position(
        &self,
        ceremony_id: &str,
        position: u32,
    ) -> Result<Option<Circuit>, StoreError>;

    async fn participant(
        &self,
        ceremony_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, StoreError>;

    /// Contributions of a circuit in creation order.
    async fn contributions(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Vec<Contribution>, StoreError>;

    async fn timeouts(
        &self,
        ceremony_id: &str,
        participant_id: &str,
    ) -> Result<Vec<TimeoutRecord>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn watch_participants(&self) -> broadcast::Receiver<ParticipantChange>;
    fn watch_contributions(&self) -> broadcast::Receiver<ContributionCreated>;
}
