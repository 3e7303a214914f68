//! Integration tests: exercise the full contribution lifecycle through the
//! engine facade, with the scheduler and refresh handlers pumped
//! deterministically off the store's change feeds.
//!
//! The gRPC handlers are thin wrappers around `CeremonyEngine`, so driving
//! the engine over `MemoryStore` + `LocalBlobStore` validates the full
//! stack: admission → queueing → step protocol → verification → refresh →
//! queue advancement, plus the timeout-and-penalty round trip.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};

use coordinator_core::auth::{CallerIdentity, Role};
use coordinator_core::blob_store::{BlobStore, CompletedPart, LocalBlobStore};
use coordinator_core::clock::ManualClock;
use coordinator_core::config::CoordinatorConfig;
use coordinator_core::engine::CeremonyEngine;
use coordinator_core::refresh::RefreshHandler;
use coordinator_core::scheduler::Scheduler;
use coordinator_core::store::{
    CeremonyStore, ContributionCreated, ParticipantChange, WriteBatch, WriteOp,
};
use coordinator_core::store_memory::MemoryStore;
use coordinator_core::sweeper::TimeoutSweeper;
use coordinator_core::types::*;
use coordinator_core::verifier::{Verifier, VerifyOutcome, VerifyRequest};
use coordinator_core::vm_executor::DisabledVmExecutor;
use coordinator_core::zkey::CliZkeyVerifier;

const BUCKET: &str = "cer-ph2";
const MINUTE_MS: i64 = 60_000;

struct Fixture {
    engine: CeremonyEngine,
    store: Arc<MemoryStore>,
    blob: Arc<LocalBlobStore>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    refresh: RefreshHandler,
    sweeper: TimeoutSweeper,
    participant_rx: broadcast::Receiver<ParticipantChange>,
    contribution_rx: broadcast::Receiver<ContributionCreated>,
    _dirs: (TempDir, TempDir),
}

impl Fixture {
    /// Drain both change feeds until quiescent, exactly as the spawned
    /// handler loops would.
    async fn pump(&mut self) {
        loop {
            let mut progressed = false;
            loop {
                match self.participant_rx.try_recv() {
                    Ok(change) => {
                        self.scheduler.handle(&change).await.unwrap();
                        progressed = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    Err(TryRecvError::Lagged(_)) => progressed = true,
                }
            }
            loop {
                match self.contribution_rx.try_recv() {
                    Ok(event) => {
                        self.refresh.handle(&event).await.unwrap();
                        progressed = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    Err(TryRecvError::Lagged(_)) => progressed = true,
                }
            }
            if !progressed {
                break;
            }
        }
    }

    async fn circuit(&self, id: &str) -> Circuit {
        self.store.circuit("c1", id).await.unwrap().unwrap()
    }

    async fn participant(&self, user: &str) -> Participant {
        self.store.participant("c1", user).await.unwrap().unwrap()
    }
}

/// `verifier_exits_ok = false` makes every zkey verification fail, which is
/// all the CLI seam needs to model an invalid contribution.
async fn fixture(circuits: u32, window_minutes: i64, verifier_exits_ok: bool) -> Fixture {
    let clock = Arc::new(ManualClock::at(0));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let participant_rx = store.watch_participants();
    let contribution_rx = store.watch_contributions();

    let blob_dir = TempDir::new().unwrap();
    let scratch_dir = TempDir::new().unwrap();
    let blob = Arc::new(LocalBlobStore::new(blob_dir.path()));
    blob.create_bucket(BUCKET).await.unwrap();

    let config = CoordinatorConfig {
        coordinator_email_domain: "example.org".into(),
        presign_expiration_secs: 900,
        bucket_postfix: "-ph2".into(),
        aws_region: None,
        verifier_software: VerificationSoftware {
            name: "snarkjs".into(),
            version: "0.7.0".into(),
            commit_hash: "deadbeef".into(),
        },
        vm_success_sentinel: "ZKey Ok!".into(),
        scratch_root: scratch_dir.path().to_path_buf(),
    };

    let program = if verifier_exits_ok { "/bin/true" } else { "/bin/false" };
    let verifier = Arc::new(Verifier::new(
        store.clone(),
        blob.clone(),
        Arc::new(DisabledVmExecutor),
        Arc::new(CliZkeyVerifier::new(program)),
        clock.clone(),
        config.clone(),
    ));
    let engine = CeremonyEngine::new(
        store.clone(),
        blob.clone(),
        verifier,
        clock.clone(),
        config,
    );

    let mut batch = WriteBatch::new().with(WriteOp::CreateCeremony(Ceremony {
        id: "c1".into(),
        title: "Test ceremony".into(),
        prefix: "cer".into(),
        start_date: 0,
        end_date: 1_000_000 * MINUTE_MS,
        state: CeremonyState::Opened,
        timeout_type: TimeoutType::Fixed,
        penalty_minutes: 10,
        coordinator_id: "coord".into(),
        last_updated: 0,
    }));
    for i in 1..=circuits {
        batch.push(WriteOp::CreateCircuit(Circuit {
            id: format!("k{i}"),
            ceremony_id: "c1".into(),
            prefix: format!("mul{i}"),
            sequence_position: i,
            avg_timings: AvgTimings::default(),
            waiting_queue: WaitingQueue::default(),
            verification: VerificationMechanism::Local,
            dynamic_threshold_pct: 0,
            fixed_time_window_minutes: window_minutes,
            pot_filename: "pot12_final.ptau".into(),
            genesis_zkey_filename: format!("mul{i}_00000.zkey"),
            last_updated: 0,
        }));
    }
    store.commit(batch).await.unwrap();

    // Seed the artifacts every verification downloads.
    blob.put_object(BUCKET, "pot/pot12_final.ptau", b"tau", false)
        .await
        .unwrap();
    for i in 1..=circuits {
        blob.put_object(
            BUCKET,
            &format!("circuits/mul{i}/zkeys/mul{i}_00000.zkey"),
            b"genesis",
            false,
        )
        .await
        .unwrap();
    }

    Fixture {
        engine,
        scheduler: Scheduler::new(store.clone(), clock.clone()),
        refresh: RefreshHandler::new(store.clone()),
        sweeper: TimeoutSweeper::new(store.clone(), clock.clone()),
        store,
        blob,
        clock,
        participant_rx,
        contribution_rx,
        _dirs: (blob_dir, scratch_dir),
    }
}

fn caller(user: &str) -> CallerIdentity {
    CallerIdentity {
        user_id: user.into(),
        email: format!("{user}@gmail.com"),
        role: Role::Participant,
    }
}

/// Admit + advance, then pump so the scheduler reacts.
async fn join_ceremony(f: &mut Fixture, user: &str) {
    assert!(f.engine.admit_participant(&caller(user), "c1").await.unwrap());
    f.pump().await;
    f.engine
        .advance_to_next_circuit(&caller(user), "c1")
        .await
        .unwrap();
    f.pump().await;
}

/// Drive the head contributor through COMPUTING → UPLOADING (via the
/// multipart facade) → VERIFYING, then verify.
async fn contribute(f: &mut Fixture, user: &str, hash: &str) -> VerifyOutcome {
    let me = caller(user);
    let participant = f.participant(user).await;
    assert_eq!(participant.status, ParticipantStatus::Contributing);
    let circuit = f
        .store
        .circuit_at_position("c1", participant.contribution_progress)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        f.engine.advance_step(&me, "c1").await.unwrap(),
        ContributionStep::Computing
    );
    f.engine
        .store_permanent_contribution_record(&me, "c1", hash, 2 * MINUTE_MS)
        .await
        .unwrap();
    assert_eq!(
        f.engine.advance_step(&me, "c1").await.unwrap(),
        ContributionStep::Uploading
    );

    // Upload the new zkey through the multipart facade, the way a real
    // client drives the presigned part URLs.
    let key = circuit.zkey_storage_path(&zkey_index(circuit.waiting_queue.next_zkey_index()));
    let upload_id = f
        .engine
        .start_multipart_upload(&me, "c1", BUCKET, &key)
        .await
        .unwrap();
    f.engine
        .store_multipart_upload_id(&me, "c1", &upload_id)
        .await
        .unwrap();
    let e_tag = f
        .blob
        .upload_part(BUCKET, &key, &upload_id, 1, format!("zkey by {user}").as_bytes())
        .await
        .unwrap();
    f.engine
        .store_uploaded_chunk(
            &me,
            "c1",
            ChunkRecord {
                e_tag: e_tag.clone(),
                part_number: 1,
            },
        )
        .await
        .unwrap();
    f.engine
        .complete_multipart_upload(
            &me,
            "c1",
            BUCKET,
            &key,
            &upload_id,
            &[CompletedPart { e_tag, part_number: 1 }],
        )
        .await
        .unwrap();

    assert_eq!(
        f.engine.advance_step(&me, "c1").await.unwrap(),
        ContributionStep::Verifying
    );
    f.pump().await;

    let outcome = f
        .engine
        .verify_contribution(
            &me,
            &VerifyRequest {
                ceremony_id: "c1".into(),
                circuit_id: circuit.id.clone(),
                bucket_name: BUCKET.into(),
                identifier: user.into(),
            },
        )
        .await
        .unwrap();
    f.pump().await;
    outcome
}

// ─── S1: lone first contributor, happy path ───────────────────

#[tokio::test]
async fn lone_contributor_full_lifecycle() {
    let mut f = fixture(1, 30, true).await;

    join_ceremony(&mut f, "alice").await;
    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.contributors, vec!["alice"]);
    assert_eq!(circuit.waiting_queue.current_contributor, "alice");
    let alice = f.participant("alice").await;
    assert_eq!(alice.status, ParticipantStatus::Contributing);
    assert_eq!(alice.contribution_step, ContributionStep::Downloading);

    let outcome = contribute(&mut f, "alice", "H1").await;
    assert!(outcome.valid);

    let contributions = f.store.contributions("c1", "k1").await.unwrap();
    assert_eq!(contributions.len(), 1);
    assert_eq!(contributions[0].zkey_index, "00001");
    assert!(contributions[0].valid);
    assert_eq!(contributions[0].contribution_hash, "H1");
    assert!(contributions[0].files.is_some());

    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.completed_contributions, 1);
    assert!(circuit.waiting_queue.contributors.is_empty());
    assert!(!circuit.waiting_queue.has_current());

    let alice = f.participant("alice").await;
    assert_eq!(alice.status, ParticipantStatus::Done);
    assert_eq!(alice.contribution_step, ContributionStep::Completed);
    assert!(alice.temp_contribution_data.is_none());
    assert!(alice.contributions[0].doc_ref.is_some());
}

// ─── S2: second contributor queued, then promoted ─────────────

#[tokio::test]
async fn second_contributor_waits_then_takes_the_slot() {
    let mut f = fixture(1, 30, true).await;

    join_ceremony(&mut f, "alice").await;
    join_ceremony(&mut f, "bob").await;

    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.contributors, vec!["alice", "bob"]);
    assert_eq!(circuit.waiting_queue.current_contributor, "alice");
    assert_eq!(f.participant("bob").await.status, ParticipantStatus::Waiting);

    contribute(&mut f, "alice", "H1").await;

    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.contributors, vec!["bob"]);
    assert_eq!(circuit.waiting_queue.current_contributor, "bob");
    assert_eq!(circuit.waiting_queue.completed_contributions, 1);
    let bob = f.participant("bob").await;
    assert_eq!(bob.status, ParticipantStatus::Contributing);
    assert_eq!(bob.contribution_step, ContributionStep::Downloading);

    // Bob's chain lands at index 00002.
    contribute(&mut f, "bob", "H2").await;
    let contributions = f.store.contributions("c1", "k1").await.unwrap();
    let indices: Vec<&str> = contributions.iter().map(|c| c.zkey_index.as_str()).collect();
    assert_eq!(indices, vec!["00001", "00002"]);
}

// ─── S3 + S6: timeout, penalty, resume ────────────────────────

#[tokio::test]
async fn stalled_contributor_is_evicted_and_resumes_after_penalty() {
    let mut f = fixture(1, 5, true).await;

    join_ceremony(&mut f, "carol").await;
    join_ceremony(&mut f, "dave").await;

    // Six minutes in, one past the 5-minute window.
    f.clock.set(6 * MINUTE_MS);
    assert_eq!(f.sweeper.sweep().await.unwrap(), 1);
    f.pump().await;

    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.failed_contributions, 1);
    assert_eq!(circuit.waiting_queue.contributors, vec!["dave"]);
    assert_eq!(circuit.waiting_queue.current_contributor, "dave");
    assert_eq!(f.participant("carol").await.status, ParticipantStatus::Timedout);
    assert_eq!(f.participant("dave").await.status, ParticipantStatus::Contributing);

    let timeouts = f.store.timeouts("c1", "carol").await.unwrap();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].kind, TimeoutKind::BlockingContribution);
    let penalty_end = 6 * MINUTE_MS + 10 * MINUTE_MS;
    assert_eq!(timeouts[0].end_date, penalty_end);

    // While the penalty is live, admission reports she cannot contribute.
    f.clock.set(penalty_end - 1);
    assert!(!f.engine.admit_participant(&caller("carol"), "c1").await.unwrap());
    f.pump().await;
    assert_eq!(f.participant("carol").await.status, ParticipantStatus::Timedout);

    // Once it expires she is exhumed, resumes, and re-enrolls at the tail.
    f.clock.set(penalty_end + 1);
    assert!(f.engine.admit_participant(&caller("carol"), "c1").await.unwrap());
    f.pump().await;
    assert_eq!(f.participant("carol").await.status, ParticipantStatus::Exhumed);

    f.engine
        .resume_after_timeout_expiration(&caller("carol"), "c1")
        .await
        .unwrap();
    f.pump().await;

    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.contributors, vec!["dave", "carol"]);
    assert_eq!(circuit.waiting_queue.current_contributor, "dave");
    assert_eq!(f.participant("carol").await.status, ParticipantStatus::Waiting);
}

// ─── S4: invalid contribution ─────────────────────────────────

#[tokio::test]
async fn invalid_contribution_is_reclaimed_and_counted() {
    let mut f = fixture(2, 30, false).await;

    join_ceremony(&mut f, "alice").await;
    let outcome = contribute(&mut f, "alice", "H1").await;
    assert!(!outcome.valid);

    let contributions = f.store.contributions("c1", "k1").await.unwrap();
    assert_eq!(contributions.len(), 1);
    assert!(!contributions[0].valid);
    assert!(contributions[0].files.is_none());

    // Uploaded zkey deleted; counters and averages reflect the failure.
    assert!(f
        .blob
        .head_object(BUCKET, "circuits/mul1/zkeys/mul1_00001.zkey")
        .await
        .unwrap()
        .is_none());
    let circuit = f.circuit("k1").await;
    assert_eq!(circuit.waiting_queue.completed_contributions, 0);
    assert_eq!(circuit.waiting_queue.failed_contributions, 1);
    assert!(circuit.avg_timings.is_unset());

    // The refresh handler still completes the participant's circuit.
    let alice = f.participant("alice").await;
    assert_eq!(alice.status, ParticipantStatus::Contributed);
    assert_eq!(alice.contribution_step, ContributionStep::Completed);
}

// ─── Multi-circuit progression ────────────────────────────────

#[tokio::test]
async fn participant_advances_across_circuits_to_done() {
    let mut f = fixture(2, 30, true).await;

    join_ceremony(&mut f, "alice").await;
    contribute(&mut f, "alice", "H1").await;

    let alice = f.participant("alice").await;
    assert_eq!(alice.status, ParticipantStatus::Contributed);
    assert_eq!(alice.contribution_progress, 1);

    // Next circuit.
    f.engine
        .advance_to_next_circuit(&caller("alice"), "c1")
        .await
        .unwrap();
    f.pump().await;
    let k2 = f.circuit("k2").await;
    assert_eq!(k2.waiting_queue.current_contributor, "alice");

    contribute(&mut f, "alice", "H2").await;
    let alice = f.participant("alice").await;
    assert_eq!(alice.status, ParticipantStatus::Done);
    assert_eq!(alice.contribution_progress, 2);
    assert_eq!(alice.contributions.len(), 2);
    assert!(alice.contributions.iter().all(|c| c.doc_ref.is_some()));
}

// ─── Idempotence and replay laws ──────────────────────────────

#[tokio::test]
async fn verify_replay_reports_no_pending_contribution() {
    let mut f = fixture(1, 30, true).await;
    join_ceremony(&mut f, "alice").await;
    contribute(&mut f, "alice", "H1").await;

    let err = f
        .engine
        .verify_contribution(
            &caller("alice"),
            &VerifyRequest {
                ceremony_id: "c1".into(),
                circuit_id: "k1".into(),
                bucket_name: BUCKET.into(),
                identifier: "alice".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        coordinator_core::CoordinatorError::NoPendingContribution(_)
    ));
}

#[tokio::test]
async fn queue_invariants_hold_under_interleaving() {
    let mut f = fixture(1, 30, true).await;
    for user in ["alice", "bob", "carol"] {
        join_ceremony(&mut f, user).await;
        let queue = f.circuit("k1").await.waiting_queue;
        // Head is always the current contributor, no duplicates.
        assert_eq!(queue.current_contributor, queue.contributors[0]);
        let mut unique = queue.contributors.clone();
        unique.dedup();
        assert_eq!(unique, queue.contributors);
    }

    contribute(&mut f, "alice", "H1").await;
    let queue = f.circuit("k1").await.waiting_queue;
    assert_eq!(queue.contributors, vec!["bob", "carol"]);
    assert_eq!(queue.current_contributor, "bob");
}

#[tokio::test]
async fn advance_step_past_completion_is_rejected() {
    let mut f = fixture(1, 30, true).await;
    join_ceremony(&mut f, "alice").await;

    for expected in [
        ContributionStep::Computing,
        ContributionStep::Uploading,
        ContributionStep::Verifying,
        ContributionStep::Completed,
    ] {
        assert_eq!(f.engine.advance_step(&caller("alice"), "c1").await.unwrap(), expected);
    }
    assert!(f.engine.advance_step(&caller("alice"), "c1").await.is_err());
}
