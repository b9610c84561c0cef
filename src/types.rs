//! Shared data structures for the well-data reporting pipeline
//!
//! Every stage hands an immutable, typed result to the next: raw records
//! from the API client, validated [`WellRecord`]s, grouped [`AggregateRow`]s,
//! a single [`ReportArtifact`], and one [`DeliveryAttempt`] per recipient.
//! [`PipelineRunState`] is the only mutable structure and lives for exactly
//! one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Raw Records (pre-validation)
// ============================================================================

/// Where a raw record entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSource {
    /// Bounded point-in-time snapshot query
    Snapshot,
    /// Persistent event-stream subscription
    Stream,
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSource::Snapshot => write!(f, "snapshot"),
            RecordSource::Stream => write!(f, "stream"),
        }
    }
}

/// One observation as received from the well-data service, before any
/// validation. Channel values are kept as raw JSON so the validator, not
/// the decoder, decides what is malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Well (job) identifier as reported by the server
    pub well_id: String,

    /// Timestamp string as reported by the server (RFC 3339 expected)
    pub timestamp: String,

    /// Channel name → raw value
    pub channels: BTreeMap<String, serde_json::Value>,

    /// Ingestion tag
    pub source: RecordSource,
}

// ============================================================================
// Validated Records
// ============================================================================

/// One validated observation for one well at one timestamp.
///
/// Immutable once constructed. `(well_id, timestamp)` is unique within a
/// single pipeline run; the run loop rejects duplicates before they reach
/// aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellRecord {
    pub well_id: String,
    pub timestamp: DateTime<Utc>,
    /// Channel name → measurement, all values finite
    pub channels: BTreeMap<String, f64>,
    pub source: RecordSource,
}

impl WellRecord {
    /// Uniqueness key for duplicate detection within one run.
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.well_id.clone(), self.timestamp)
    }
}

/// Why a raw record was rejected by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Well identifier missing or empty
    MissingWellId,
    /// Timestamp field missing or empty
    MissingTimestamp,
    /// Timestamp present but not parseable
    UnparseableTimestamp { raw: String },
    /// Channel value is not a number
    NonNumericValue { channel: String },
    /// Channel value is NaN or infinite
    NonFiniteValue { channel: String },
    /// Channel value outside configured physical bounds
    OutOfBounds {
        channel: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// A required channel is absent
    MissingChannel { channel: String },
    /// Same (well, timestamp) already accepted this run
    DuplicateKey,
}

impl RejectReason {
    /// Short stable code for logs and the run summary.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingWellId => "missing_well_id",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::UnparseableTimestamp { .. } => "unparseable_timestamp",
            RejectReason::NonNumericValue { .. } => "non_numeric_value",
            RejectReason::NonFiniteValue { .. } => "non_finite_value",
            RejectReason::OutOfBounds { .. } => "out_of_bounds",
            RejectReason::MissingChannel { .. } => "missing_channel",
            RejectReason::DuplicateKey => "duplicate_key",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingWellId => write!(f, "well identifier missing"),
            RejectReason::MissingTimestamp => write!(f, "timestamp missing"),
            RejectReason::UnparseableTimestamp { raw } => {
                write!(f, "timestamp not parseable: '{raw}'")
            }
            RejectReason::NonNumericValue { channel } => {
                write!(f, "channel '{channel}' is not numeric")
            }
            RejectReason::NonFiniteValue { channel } => {
                write!(f, "channel '{channel}' is NaN or infinite")
            }
            RejectReason::OutOfBounds {
                channel,
                value,
                min,
                max,
            } => write!(
                f,
                "channel '{channel}' value {value} outside bounds {min}..={max}"
            ),
            RejectReason::MissingChannel { channel } => {
                write!(f, "required channel '{channel}' absent")
            }
            RejectReason::DuplicateKey => write!(f, "duplicate (well, timestamp) key"),
        }
    }
}

/// Outcome of validating one raw record: an accepted [`WellRecord`] or a
/// rejection reason, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Accepted(WellRecord),
    Rejected {
        well_id: String,
        reason: RejectReason,
    },
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted(_))
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Statistics for one channel within one (well, time bucket) group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// One report row: a (well, time bucket) group with per-channel statistics.
///
/// Every input traces back to a validated [`WellRecord`]. Channels with no
/// samples in the bucket are simply absent, never interpolated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub well_id: String,
    /// Inclusive start of the time bucket
    pub bucket_start: DateTime<Utc>,
    pub channels: BTreeMap<String, ChannelStats>,
}

// ============================================================================
// Report Artifact
// ============================================================================

/// The spreadsheet produced by one run, written exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct ReportArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sheet_name: String,
    /// Data rows written (excludes header and footer)
    pub data_rows: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Delivery Audit
// ============================================================================

/// Outcome of one notification dispatch. Append-only; retained in the run
/// state for audit.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub recipient: String,
    pub succeeded: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

// ============================================================================
// Run State
// ============================================================================

/// Terminal status of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Report written and all notifications delivered
    Success,
    /// Report written but at least one notification failed
    Partial,
    /// A required stage could not produce its output
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pipeline stage, for progress logging and failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Authenticate,
    Ingest,
    Validate,
    Aggregate,
    WriteReport,
    Notify,
    Done,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStage::Authenticate => write!(f, "authenticate"),
            RunStage::Ingest => write!(f, "ingest"),
            RunStage::Validate => write!(f, "validate"),
            RunStage::Aggregate => write!(f, "aggregate"),
            RunStage::WriteReport => write!(f, "write_report"),
            RunStage::Notify => write!(f, "notify"),
            RunStage::Done => write!(f, "done"),
        }
    }
}

/// Transient state for exactly one `run_once()` invocation.
///
/// Created at entrypoint invocation, destroyed when the run completes.
/// Never persisted across invocations except through the log summary.
#[derive(Debug, Clone)]
pub struct PipelineRunState {
    pub stage: RunStage,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Raw records received from the API
    pub fetched: u64,
    /// Records that passed validation
    pub accepted: u64,
    /// Records rejected, with per-reason-code breakdown
    pub rejected: u64,
    pub reject_reasons: BTreeMap<&'static str, u64>,
    pub report: Option<ReportArtifact>,
    pub delivery_attempts: Vec<DeliveryAttempt>,
    /// Human-readable cause when `status` is `Failed`
    pub failure: Option<String>,
}

impl PipelineRunState {
    pub fn new() -> Self {
        Self {
            stage: RunStage::Authenticate,
            status: RunStatus::Success,
            started_at: Utc::now(),
            fetched: 0,
            accepted: 0,
            rejected: 0,
            reject_reasons: BTreeMap::new(),
            report: None,
            delivery_attempts: Vec::new(),
            failure: None,
        }
    }

    pub fn enter_stage(&mut self, stage: RunStage) {
        self.stage = stage;
        tracing::debug!(stage = %stage, "entering pipeline stage");
    }

    pub fn record_rejection(&mut self, reason: &RejectReason) {
        self.rejected += 1;
        *self.reject_reasons.entry(reason.code()).or_insert(0) += 1;
    }

    /// Mark the run failed at the current stage. The first failure wins.
    pub fn fail(&mut self, cause: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(cause.into());
        }
        self.status = RunStatus::Failed;
    }

    /// Downgrade a successful run to partial (e.g. notification failure).
    /// A failed run stays failed.
    pub fn mark_partial(&mut self) {
        if self.status == RunStatus::Success {
            self.status = RunStatus::Partial;
        }
    }

    /// Log the structured run summary. Called on every terminal path so
    /// operators can diagnose without re-running.
    pub fn log_summary(&self) {
        let elapsed_secs = (Utc::now() - self.started_at).num_seconds();
        tracing::info!(
            status = %self.status,
            stage = %self.stage,
            fetched = self.fetched,
            accepted = self.accepted,
            rejected = self.rejected,
            reject_reasons = ?self.reject_reasons,
            report = ?self.report.as_ref().map(|r| r.path.display().to_string()),
            deliveries_ok = self.delivery_attempts.iter().filter(|a| a.succeeded).count(),
            deliveries_failed = self.delivery_attempts.iter().filter(|a| !a.succeeded).count(),
            failure = ?self.failure,
            elapsed_secs,
            "pipeline run summary"
        );
    }
}

impl Default for PipelineRunState {
    fn default() -> Self {
        Self::new()
    }
}
