use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Zkey index of the finalization artifact.
pub const FINAL_ZKEY_INDEX: &str = "final";

/// Zkey index of the genesis artifact.
pub const GENESIS_ZKEY_INDEX: &str = "00000";

/// Format a contribution sequence number as a five-digit zero-padded index.
pub fn zkey_index(n: u32) -> String {
    format!("{:05}", n)
}

// ─── Ceremony ─────────────────────────────────────────────────

/// Ceremony lifecycle. State only ever moves forward along this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyState {
    Scheduled,
    Opened,
    Closed,
    Finalized,
}

impl CeremonyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Opened => "OPENED",
            Self::Closed => "CLOSED",
            Self::Finalized => "FINALIZED",
        }
    }

    /// Position along the monotonic lifecycle order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Opened => 1,
            Self::Closed => 2,
            Self::Finalized => 3,
        }
    }
}

impl std::fmt::Display for CeremonyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How contribution deadlines are computed for circuits of this ceremony.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutType {
    Fixed,
    Dynamic,
}

/// A scheduled, bounded-time collective computation producing a proving key
/// set through a chain of contributions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ceremony {
    pub id: String,
    pub title: String,
    /// Also the blob-key namespace for this ceremony's bucket.
    pub prefix: String,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
    pub state: CeremonyState,
    pub timeout_type: TimeoutType,
    pub penalty_minutes: i64,
    pub coordinator_id: String,
    pub last_updated: Timestamp,
}

impl Ceremony {
    /// Bucket bound to this ceremony under the configured postfix convention.
    pub fn bucket_name(&self, postfix: &str) -> String {
        format!("{}{}", self.prefix, postfix)
    }
}

// ─── Circuit ──────────────────────────────────────────────────

/// Rolling per-circuit timing means (ms). Zero means "no sample yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvgTimings {
    pub contribution_computation: i64,
    pub full_contribution: i64,
    pub verify_cloud_function: i64,
}

impl AvgTimings {
    /// Two-sample trailing mean: the first sample replaces the zero
    /// placeholder, every later sample is averaged with the previous mean
    /// only. NOT a mean over all contributions; the observable timings of
    /// the deployed system follow this exact formula.
    pub fn fold(avg: i64, sample: i64) -> i64 {
        if avg == 0 {
            sample
        } else {
            (avg + sample) / 2
        }
    }

    pub fn is_unset(&self) -> bool {
        self.contribution_computation == 0
            && self.full_contribution == 0
            && self.verify_cloud_function == 0
    }
}

/// How a circuit's contributions are verified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum VerificationMechanism {
    Local,
    Vm { instance_id: String },
}

/// Per-circuit FIFO of participants eligible to contribute. The head is the
/// current contributor; an empty string means no one holds the slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingQueue {
    pub contributors: Vec<String>,
    pub current_contributor: String,
    pub completed_contributions: u32,
    pub failed_contributions: u32,
}

impl WaitingQueue {
    pub fn has_current(&self) -> bool {
        !self.current_contributor.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.contributors.iter().any(|c| c == user_id)
    }

    /// Index of the next zkey to be produced on this circuit.
    pub fn next_zkey_index(&self) -> u32 {
        self.completed_contributions + 1
    }
}

/// One logical program within a ceremony, with its own contribution chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Circuit {
    pub id: String,
    pub ceremony_id: String,
    pub prefix: String,
    /// 1..N, contiguous within the ceremony.
    pub sequence_position: u32,
    pub avg_timings: AvgTimings,
    pub waiting_queue: WaitingQueue,
    pub verification: VerificationMechanism,
    /// DYNAMIC timeouts: tolerated percentage over the average full
    /// contribution before the contributor is considered stalled.
    pub dynamic_threshold_pct: i64,
    /// FIXED timeouts: allowed contribution window in minutes.
    pub fixed_time_window_minutes: i64,
    pub pot_filename: String,
    pub genesis_zkey_filename: String,
    pub last_updated: Timestamp,
}

impl Circuit {
    pub fn zkey_filename(&self, index: &str) -> String {
        format!("{}_{}.zkey", self.prefix, index)
    }

    pub fn zkey_storage_path(&self, index: &str) -> String {
        format!("circuits/{}/zkeys/{}", self.prefix, self.zkey_filename(index))
    }

    pub fn transcript_filename(&self, index: &str) -> String {
        format!("{}_{}_verification_transcript.log", self.prefix, index)
    }

    pub fn transcript_storage_path(&self, filename: &str) -> String {
        format!("circuits/{}/transcripts/{}", self.prefix, filename)
    }

    pub fn verification_key_storage_path(&self, filename: &str) -> String {
        format!("circuits/{}/verification_key/{}", self.prefix, filename)
    }

    pub fn verifier_contract_storage_path(&self, filename: &str) -> String {
        format!("circuits/{}/verifier_contract/{}", self.prefix, filename)
    }

    pub fn pot_storage_path(&self) -> String {
        format!("pot/{}", self.pot_filename)
    }

    pub fn genesis_zkey_storage_path(&self) -> String {
        format!("circuits/{}/zkeys/{}", self.prefix, self.genesis_zkey_filename)
    }
}

// ─── Participant ──────────────────────────────────────────────

/// Participant flow state across the whole ceremony.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Waiting,
    Ready,
    Contributing,
    Contributed,
    Done,
    Timedout,
    Exhumed,
    Finalizing,
    Finalized,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Contributing => "CONTRIBUTING",
            Self::Contributed => "CONTRIBUTED",
            Self::Done => "DONE",
            Self::Timedout => "TIMEDOUT",
            Self::Exhumed => "EXHUMED",
            Self::Finalizing => "FINALIZING",
            Self::Finalized => "FINALIZED",
        }
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-state of an active contribution. Only meaningful while the participant
/// is CONTRIBUTING or CONTRIBUTED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStep {
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Completed,
}

impl ContributionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => "DOWNLOADING",
            Self::Computing => "COMPUTING",
            Self::Uploading => "UPLOADING",
            Self::Verifying => "VERIFYING",
            Self::Completed => "COMPLETED",
        }
    }

    /// The step after this one, if any. COMPLETED is terminal.
    pub fn next(&self) -> Option<ContributionStep> {
        match self {
            Self::Downloading => Some(Self::Computing),
            Self::Computing => Some(Self::Uploading),
            Self::Uploading => Some(Self::Verifying),
            Self::Verifying => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl std::fmt::Display for ContributionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a participant's contribution history. `doc_ref` is filled in
/// by the post-verification refresh once the contribution document exists;
/// at most one entry may be pending (without a `doc_ref`) at any time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEntry {
    pub hash: String,
    pub computation_time_ms: i64,
    pub doc_ref: Option<String>,
}

/// Part record of a resumable multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub e_tag: String,
    pub part_number: u32,
}

/// Scratch data accumulated while a contribution is in flight. Cleared by the
/// refresh handler when the contribution completes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempContributionData {
    pub contribution_computation_time: Option<i64>,
    pub upload_id: Option<String>,
    pub chunks: Vec<ChunkRecord>,
}

/// Participant document. The id equals the authenticated user id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub ceremony_id: String,
    pub status: ParticipantStatus,
    pub contribution_step: ContributionStep,
    /// Circuits fully contributed so far; doubles as the 1-based sequence
    /// position of the next circuit while READY/CONTRIBUTING. Monotonic.
    pub contribution_progress: u32,
    pub contribution_started_at: Timestamp,
    /// 0 while unset.
    pub verification_started_at: Timestamp,
    pub contributions: Vec<ContributionEntry>,
    pub temp_contribution_data: Option<TempContributionData>,
    pub last_updated: Timestamp,
}

impl Participant {
    /// Fresh participant in the admission state.
    pub fn admitted(user_id: &str, ceremony_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ceremony_id: ceremony_id.to_string(),
            status: ParticipantStatus::Waiting,
            contribution_step: ContributionStep::Downloading,
            contribution_progress: 0,
            contribution_started_at: 0,
            verification_started_at: 0,
            contributions: Vec::new(),
            temp_contribution_data: None,
            last_updated: 0,
        }
    }

    /// The unique contribution entry still awaiting its document reference.
    pub fn pending_contribution(&self) -> Option<(usize, &ContributionEntry)> {
        self.contributions
            .iter()
            .enumerate()
            .find(|(_, e)| e.doc_ref.is_none())
    }

    pub fn temp_data_mut(&mut self) -> &mut TempContributionData {
        self.temp_contribution_data
            .get_or_insert_with(TempContributionData::default)
    }
}

// ─── Contribution ─────────────────────────────────────────────

/// Wall-clock timings recorded with a contribution (ms).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionTimings {
    pub contribution_computation: i64,
    pub full_contribution: i64,
    pub verify_cloud_function: i64,
}

/// Identity of the software that performed the verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSoftware {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
}

/// Artifact locations and Blake2b-512 hashes of a valid contribution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionFiles {
    pub zkey_filename: String,
    pub zkey_storage_path: String,
    pub zkey_blake2b_hash: String,
    pub transcript_filename: String,
    pub transcript_storage_path: String,
    pub transcript_blake2b_hash: String,
    /// Appended during finalization only.
    pub verification_key_filename: Option<String>,
    pub verification_key_storage_path: Option<String>,
    pub verification_key_blake2b_hash: Option<String>,
    /// Appended during finalization only.
    pub verifier_contract_filename: Option<String>,
    pub verifier_contract_storage_path: Option<String>,
    pub verifier_contract_blake2b_hash: Option<String>,
}

/// Beacon applied to the final contribution of a circuit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub value: String,
    /// SHA-256 hex of the value.
    pub hash: String,
}

/// One participant's transformation of the previous zkey into the next.
/// Immutable after creation, except that finalization appends the verifier
/// contract and verification key references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub ceremony_id: String,
    pub circuit_id: String,
    pub participant_id: String,
    /// Five-digit zero-padded index, or `final`.
    pub zkey_index: String,
    pub valid: bool,
    /// Contribution hash as reported by the participant.
    pub contribution_hash: String,
    pub timings: ContributionTimings,
    pub verification_software: VerificationSoftware,
    pub files: Option<ContributionFiles>,
    pub beacon: Option<Beacon>,
    pub created_at: Timestamp,
}

// ─── Timeout ──────────────────────────────────────────────────

/// What the evicted contributor was blocking on when the deadline passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutKind {
    BlockingContribution,
    BlockingVerification,
}

/// Penalty window applied to an evicted contributor. The participant is in a
/// live timeout while any of their records has `end_date >= now`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub id: String,
    pub ceremony_id: String,
    pub participant_id: String,
    pub kind: TimeoutKind,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
}
