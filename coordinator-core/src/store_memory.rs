use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::*;
use crate::types::*;

const FEED_CAPACITY: usize = 256;

struct Inner {
    ceremonies: HashMap<String, Ceremony>,
    /// ceremony_id → circuit_id → circuit
    circuits: HashMap<String, BTreeMap<String, Circuit>>,
    /// ceremony_id → user_id → participant
    participants: HashMap<String, BTreeMap<String, Participant>>,
    /// (ceremony_id, circuit_id) → contributions in creation order
    contributions: HashMap<(String, String), Vec<Contribution>>,
    /// (ceremony_id, participant_id) → timeout records
    timeouts: HashMap<(String, String), Vec<TimeoutRecord>>,
}

/// In-memory implementation of [`CeremonyStore`].
///
/// A single `RwLock` write section is the linearization point: every batch
/// validates all compare-and-set guards before applying anything, so a
/// failing guard leaves all targets untouched. Change-feed events are
/// broadcast after the lock is released.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
    participant_tx: broadcast::Sender<ParticipantChange>,
    contribution_tx: broadcast::Sender<ContributionCreated>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (participant_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (contribution_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                ceremonies: HashMap::new(),
                circuits: HashMap::new(),
                participants: HashMap::new(),
                contributions: HashMap::new(),
                timeouts: HashMap::new(),
            }),
            clock,
            participant_tx,
            contribution_tx,
        }
    }
}

fn check_cas(
    collection: &'static str,
    id: &str,
    current: Timestamp,
    expected: Option<Timestamp>,
) -> Result<(), StoreError> {
    match expected {
        Some(e) if e != current => Err(StoreError::Conflict {
            collection,
            id: id.to_string(),
            expected: e,
            found: current,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl CeremonyStore for MemoryStore {
    async fn ceremony(&self, ceremony_id: &str) -> Result<Option<Ceremony>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.ceremonies.get(ceremony_id).cloned())
    }

    async fn ceremony_by_prefix(&self, prefix: &str) -> Result<Option<Ceremony>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.ceremonies.values().find(|c| c.prefix == prefix).cloned())
    }

    async fn ceremonies_in_state(&self, state: CeremonyState) -> Result<Vec<Ceremony>, StoreError> {
        let r = self.inner.read().await;
        let mut out: Vec<Ceremony> = r
            .ceremonies
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn circuit(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Option<Circuit>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.circuits
            .get(ceremony_id)
            .and_then(|m| m.get(circuit_id))
            .cloned())
    }

    async fn circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>, StoreError> {
        let r = self.inner.read().await;
        let mut out: Vec<Circuit> = r
            .circuits
            .get(ceremony_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|c| c.sequence_position);
        Ok(out)
    }

    async fn circuit_at_position(
        &self,
        ceremony_id: &str,
        position: u32,
    ) -> Result<Option<Circuit>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.circuits
            .get(ceremony_id)
            .and_then(|m| m.values().find(|c| c.sequence_position == position))
            .cloned())
    }

    async fn participant(
        &self,
        ceremony_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.participants
            .get(ceremony_id)
            .and_then(|m| m.get(user_id))
            .cloned())
    }

    async fn contributions(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
    ) -> Result<Vec<Contribution>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.contributions
            .get(&(ceremony_id.to_string(), circuit_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn timeouts(
        &self,
        ceremony_id: &str,
        participant_id: &str,
    ) -> Result<Vec<TimeoutRecord>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.timeouts
            .get(&(ceremony_id.to_string(), participant_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut participant_events = Vec::new();
        let mut contribution_events = Vec::new();

        {
            let mut w = self.inner.write().await;

            // Validate every guard before touching anything.
            for op in &batch.ops {
                match op {
                    WriteOp::CreateCeremony(c) => {
                        if w.ceremonies.contains_key(&c.id) {
                            return Err(StoreError::AlreadyExists {
                                collection: "ceremonies",
                                id: c.id.clone(),
                            });
                        }
                    }
                    WriteOp::UpdateCeremony {
                        ceremony,
                        expected_last_updated,
                    } => {
                        let current = w.ceremonies.get(&ceremony.id).ok_or_else(|| {
                            StoreError::NotFound {
                                collection: "ceremonies",
                                id: ceremony.id.clone(),
                            }
                        })?;
                        check_cas(
                            "ceremonies",
                            &ceremony.id,
                            current.last_updated,
                            *expected_last_updated,
                        )?;
                    }
                    WriteOp::CreateCircuit(c) => {
                        let exists = w
                            .circuits
                            .get(&c.ceremony_id)
                            .is_some_and(|m| m.contains_key(&c.id));
                        if exists {
                            return Err(StoreError::AlreadyExists {
                                collection: "circuits",
                                id: c.id.clone(),
                            });
                        }
                    }
                    WriteOp::UpdateCircuit {
                        circuit,
                        expected_last_updated,
                    } => {
                        let current = w
                            .circuits
                            .get(&circuit.ceremony_id)
                            .and_then(|m| m.get(&circuit.id))
                            .ok_or_else(|| StoreError::NotFound {
                                collection: "circuits",
                                id: circuit.id.clone(),
                            })?;
                        check_cas(
                            "circuits",
                            &circuit.id,
                            current.last_updated,
                            *expected_last_updated,
                        )?;
                    }
                    WriteOp::CreateParticipant(p) => {
                        let exists = w
                            .participants
                            .get(&p.ceremony_id)
                            .is_some_and(|m| m.contains_key(&p.user_id));
                        if exists {
                            return Err(StoreError::AlreadyExists {
                                collection: "participants",
                                id: p.user_id.clone(),
                            });
                        }
                    }
                    WriteOp::UpdateParticipant {
                        participant,
                        expected_last_updated,
                    } => {
                        let current = w
                            .participants
                            .get(&participant.ceremony_id)
                            .and_then(|m| m.get(&participant.user_id))
                            .ok_or_else(|| StoreError::NotFound {
                                collection: "participants",
                                id: participant.user_id.clone(),
                            })?;
                        check_cas(
                            "participants",
                            &participant.user_id,
                            current.last_updated,
                            *expected_last_updated,
                        )?;
                    }
                    WriteOp::CreateContribution(_) | WriteOp::CreateTimeout(_) => {}
                    WriteOp::UpdateContribution(c) => {
                        let key = (c.ceremony_id.clone(), c.circuit_id.clone());
                        let exists = w
                            .contributions
                            .get(&key)
                            .is_some_and(|v| v.iter().any(|e| e.id == c.id));
                        if !exists {
                            return Err(StoreError::NotFound {
                                collection: "contributions",
                                id: c.id.clone(),
                            });
                        }
                    }
                }
            }

            // Apply.
            for op in batch.ops {
                match op {
                    WriteOp::CreateCeremony(mut c) | WriteOp::UpdateCeremony { ceremony: mut c, .. } => {
                        c.last_updated = now;
                        w.ceremonies.insert(c.id.clone(), c);
                    }
                    WriteOp::CreateCircuit(mut c) | WriteOp::UpdateCircuit { circuit: mut c, .. } => {
                        c.last_updated = now;
                        w.circuits
                            .entry(c.ceremony_id.clone())
                            .or_default()
                            .insert(c.id.clone(), c);
                    }
                    WriteOp::CreateParticipant(mut p) => {
                        p.last_updated = now;
                        participant_events.push(ParticipantChange {
                            before: None,
                            after: p.clone(),
                        });
                        w.participants
                            .entry(p.ceremony_id.clone())
                            .or_default()
                            .insert(p.user_id.clone(), p);
                    }
                    WriteOp::UpdateParticipant {
                        participant: mut p, ..
                    } => {
                        p.last_updated = now;
                        let before = w
                            .participants
                            .get(&p.ceremony_id)
                            .and_then(|m| m.get(&p.user_id))
                            .cloned();
                        participant_events.push(ParticipantChange {
                            before,
                            after: p.clone(),
                        });
                        w.participants
                            .entry(p.ceremony_id.clone())
                            .or_default()
                            .insert(p.user_id.clone(), p);
                    }
                    WriteOp::CreateContribution(c) => {
                        contribution_events.push(ContributionCreated {
                            contribution: c.clone(),
                        });
                        w.contributions
                            .entry((c.ceremony_id.clone(), c.circuit_id.clone()))
                            .or_default()
                            .push(c);
                    }
                    WriteOp::UpdateContribution(c) => {
                        let key = (c.ceremony_id.clone(), c.circuit_id.clone());
                        if let Some(list) = w.contributions.get_mut(&key) {
                            if let Some(slot) = list.iter_mut().find(|e| e.id == c.id) {
                                *slot = c;
                            }
                        }
                    }
                    WriteOp::CreateTimeout(t) => {
                        w.timeouts
                            .entry((t.ceremony_id.clone(), t.participant_id.clone()))
                            .or_default()
                            .push(t);
                    }
                }
            }
        }

        // Feed delivery outside the lock; no receivers is fine.
        for ev in participant_events {
            let _ = self.participant_tx.send(ev);
        }
        for ev in contribution_events {
            let _ = self.contribution_tx.send(ev);
        }
        Ok(())
    }

    fn watch_participants(&self) -> broadcast::Receiver<ParticipantChange> {
        self.participant_tx.subscribe()
    }

    fn watch_contributions(&self) -> broadcast::Receiver<ContributionCreated> {
        self.contribution_tx.subscribe()
    }
}
