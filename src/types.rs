// =============================================================================
// Domain Records — Meridian Coordinator Node
// =============================================================================
//
// Every persisted record the coordinator works with lives here: feed data,
// prediction lifecycle rows (input → prediction → score), per-model
// snapshots, leaderboards, checkpoints and the on-chain emission payload.
//
// Challenge-defined payloads (`inference_output`, `result_summary`, …) are
// opaque JSON maps validated at the boundary; the lifecycle columns around
// them are fully typed.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Opaque JSON-bag payload. `serde_json`'s default map is ordered by key,
/// which the canonical snapshot hash relies on.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Feed data
// =============================================================================

/// Kind of market-data record a feed can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Tick,
    Candle,
    Depth,
    Funding,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Tick => "tick",
            FeedKind::Candle => "candle",
            FeedKind::Depth => "depth",
            FeedKind::Funding => "funding",
        }
    }

    pub fn parse(raw: &str) -> Option<FeedKind> {
        match raw.trim().to_lowercase().as_str() {
            "tick" => Some(FeedKind::Tick),
            "candle" => Some(FeedKind::Candle),
            "depth" => Some(FeedKind::Depth),
            "funding" => Some(FeedKind::Funding),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for FeedKind {
    fn default() -> Self {
        FeedKind::Candle
    }
}

/// The four dimensions that identify a feed series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedScope {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
}

impl FeedScope {
    pub fn new(source: &str, subject: &str, kind: FeedKind, granularity: &str) -> Self {
        Self {
            source: source.to_string(),
            subject: subject.to_string(),
            kind,
            granularity: granularity.to_string(),
        }
    }

    /// Stable key used for watermark rows: `source:subject:kind:granularity`.
    pub fn watermark_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.source, self.subject, self.kind, self.granularity
        )
    }
}

impl std::fmt::Display for FeedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.source, self.subject, self.kind, self.granularity
        )
    }
}

/// A single market-data record in canonical shape. Identity is the SHA-1 of
/// the scope dimensions plus the event timestamp, so re-ingesting the same
/// event overwrites in place instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
    pub ts_event: DateTime<Utc>,
    pub ts_ingested: DateTime<Utc>,
    pub values: JsonMap,
    pub meta: JsonMap,
}

impl FeedRecord {
    /// Deterministic row identity:
    /// `sha1("source|subject|kind|granularity|ts_event(RFC 3339)")`.
    pub fn identity(&self) -> String {
        let fingerprint = format!(
            "{}|{}|{}|{}|{}",
            self.source,
            self.subject,
            self.kind,
            self.granularity,
            self.ts_event.to_rfc3339()
        );
        let mut hasher = Sha1::new();
        hasher.update(fingerprint.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn scope(&self) -> FeedScope {
        FeedScope {
            source: self.source.clone(),
            subject: self.subject.clone(),
            kind: self.kind,
            granularity: self.granularity.clone(),
        }
    }
}

/// Per-scope ingestion watermark: the newest event timestamp already stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedIngestionState {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub meta: JsonMap,
    pub updated_at: DateTime<Utc>,
}

impl FeedIngestionState {
    pub fn scope(&self) -> FeedScope {
        FeedScope {
            source: self.source.clone(),
            subject: self.subject.clone(),
            kind: self.kind,
            granularity: self.granularity.clone(),
        }
    }
}

// =============================================================================
// Backfill jobs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    /// A job still occupying the single active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, BackfillStatus::Pending | BackfillStatus::Running)
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Running => "running",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        })
    }
}

/// Persisted progress of one historical backfill run. At most one job may be
/// pending or running at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: String,
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub cursor_ts: DateTime<Utc>,
    pub records_written: u64,
    pub pages_fetched: u64,
    pub status: BackfillStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillJob {
    /// Fraction of the requested window the cursor has covered, 0–100.
    pub fn progress_pct(&self) -> f64 {
        let total = (self.end_ts - self.start_ts).num_seconds();
        if total <= 0 {
            return 100.0;
        }
        let done = (self.cursor_ts - self.start_ts).num_seconds().max(0);
        ((done as f64 / total as f64) * 100.0).min(100.0)
    }
}

// =============================================================================
// Scheduled prediction configs
// =============================================================================

/// Scheduling envelope for a prediction config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Seconds between predict dispatches for this config. Minimum 1.
    #[serde(default = "default_prediction_interval")]
    pub prediction_interval_seconds: u64,
    /// Seconds after dispatch before ground truth may be resolved. When
    /// absent, the scope's `horizon_seconds` applies.
    #[serde(default)]
    pub resolve_after_seconds: Option<u64>,
}

fn default_prediction_interval() -> u64 {
    60
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            prediction_interval_seconds: default_prediction_interval(),
            resolve_after_seconds: None,
        }
    }
}

/// One active scheduled-prediction config. The dispatcher iterates these in
/// `order` and fans out a predict call whenever a config comes due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPredictionConfig {
    pub id: String,
    pub scope_key: String,
    #[serde(default)]
    pub scope_template: JsonMap,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub meta: JsonMap,
}

fn default_active() -> bool {
    true
}

// =============================================================================
// Prediction lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputStatus {
    Received,
    Resolved,
}

impl std::fmt::Display for InputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InputStatus::Received => "RECEIVED",
            InputStatus::Resolved => "RESOLVED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredictionStatus {
    /// Awaiting ground truth.
    Pending,
    /// Scored against resolved actuals.
    Scored,
    /// Output failed validation or the runner reported an error.
    Failed,
    /// A known model did not respond in the dispatch cycle.
    Absent,
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PredictionStatus::Pending => "PENDING",
            PredictionStatus::Scored => "SCORED",
            PredictionStatus::Failed => "FAILED",
            PredictionStatus::Absent => "ABSENT",
        })
    }
}

/// A data point handed to the models. Actuals are filled in once the horizon
/// passes and the ground-truth resolver succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    pub raw_data: JsonMap,
    pub actuals: Option<JsonMap>,
    pub status: InputStatus,
    pub scope: JsonMap,
    pub received_at: DateTime<Utc>,
    pub resolvable_at: Option<DateTime<Utc>>,
    pub meta: JsonMap,
}

/// What a model predicted for one input under one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub input_id: String,
    pub model_id: String,
    pub prediction_config_id: Option<String>,
    pub scope_key: String,
    pub scope: JsonMap,
    pub status: PredictionStatus,
    pub exec_time_ms: f64,
    pub inference_output: JsonMap,
    pub meta: JsonMap,
    pub performed_at: DateTime<Utc>,
    pub resolvable_at: Option<DateTime<Utc>>,
}

/// Scoring result for a prediction. `result["value"]` is the canonical
/// scalar used by aggregation and ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: String,
    pub prediction_id: String,
    pub result: JsonMap,
    pub success: bool,
    pub failed_reason: Option<String>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreRecord {
    /// Shortcut to the primary score scalar.
    pub fn value(&self) -> Option<f64> {
        self.result.get("value").and_then(|v| v.as_f64())
    }
}

/// A competitor's model, registered when it first answers a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub player_id: String,
    pub player_name: String,
    pub deployment_identifier: String,
    #[serde(default)]
    pub overall_score: JsonMap,
    #[serde(default)]
    pub scores_by_scope: Vec<JsonMap>,
    #[serde(default)]
    pub meta: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Snapshots & leaderboard
// =============================================================================

/// Immutable per-model, per-cycle summary of score + metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub model_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub prediction_count: u64,
    pub result_summary: JsonMap,
    #[serde(default)]
    pub meta: JsonMap,
    pub created_at: DateTime<Utc>,
    /// Canonical SHA-256 of the snapshot content, set when the snapshot is
    /// committed to a merkle cycle.
    pub content_hash: Option<String>,
}

/// Ranking block inside a leaderboard entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingScore {
    pub key: String,
    pub value: f64,
    pub direction: String,
    #[serde(default)]
    pub tie_breakers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardScore {
    pub metrics: JsonMap,
    pub ranking: RankingScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub model_id: String,
    pub score: LeaderboardScore,
    pub rank: u32,
    pub model_name: Option<String>,
    pub cruncher_name: Option<String>,
}

/// Append-only ranked list. The latest row by `created_at` is canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
    #[serde(default)]
    pub meta: JsonMap,
}

// =============================================================================
// Merkle rows
// =============================================================================

/// One committed score cycle: a mini-tree over the cycle's snapshots, chained
/// to the previous cycle's root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleCycle {
    pub id: String,
    pub previous_cycle_id: Option<String>,
    pub previous_cycle_root: Option<String>,
    pub snapshots_root: String,
    pub chained_root: String,
    pub snapshot_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Persisted merkle tree node. Exactly one of `cycle_id` / `checkpoint_id`
/// is set, depending on which tree owns the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleNodeRow {
    pub id: String,
    pub cycle_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub level: u32,
    pub position: u32,
    pub hash: String,
    pub left_child_id: Option<String>,
    pub right_child_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub snapshot_content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Checkpoints & emission
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckpointStatus {
    Pending,
    Submitted,
    Claimable,
    Paid,
}

impl CheckpointStatus {
    pub fn parse(raw: &str) -> Option<CheckpointStatus> {
        match raw.trim().to_uppercase().as_str() {
            "PENDING" => Some(CheckpointStatus::Pending),
            "SUBMITTED" => Some(CheckpointStatus::Submitted),
            "CLAIMABLE" => Some(CheckpointStatus::Claimable),
            "PAID" => Some(CheckpointStatus::Paid),
            _ => None,
        }
    }

    /// The only legal next status in the settlement lattice.
    pub fn next(&self) -> Option<CheckpointStatus> {
        match self {
            CheckpointStatus::Pending => Some(CheckpointStatus::Submitted),
            CheckpointStatus::Submitted => Some(CheckpointStatus::Claimable),
            CheckpointStatus::Claimable => Some(CheckpointStatus::Paid),
            CheckpointStatus::Paid => None,
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CheckpointStatus::Pending => "PENDING",
            CheckpointStatus::Submitted => "SUBMITTED",
            CheckpointStatus::Claimable => "CLAIMABLE",
            CheckpointStatus::Paid => "PAID",
        })
    }
}

/// Fixed-point denominator: `1_000_000_000` represents 100%.
pub const FRAC_64_MULTIPLIER: i64 = 1_000_000_000;

/// Convert a percentage (0–100) to fixed-point shares.
pub fn pct_to_frac64(pct: f64) -> i64 {
    ((pct / 100.0) * FRAC_64_MULTIPLIER as f64) as i64
}

/// On-chain cruncher reward. `reward_pct` is fixed-point; the sum over all
/// cruncher rewards in one emission must equal [`FRAC_64_MULTIPLIER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CruncherReward {
    pub cruncher_index: usize,
    pub reward_pct: i64,
}

/// On-chain provider reward (compute or data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReward {
    pub provider: String,
    pub reward_pct: i64,
}

/// Protocol-format emission payload for on-chain submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionCheckpoint {
    pub crunch: String,
    pub cruncher_rewards: Vec<CruncherReward>,
    pub compute_provider_rewards: Vec<ProviderReward>,
    pub data_provider_rewards: Vec<ProviderReward>,
}

/// Periodic roll-up of snapshots into an on-chain payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub entries: Vec<EmissionCheckpoint>,
    #[serde(default)]
    pub meta: JsonMap,
    pub merkle_root: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================
