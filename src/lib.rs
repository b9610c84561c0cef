//! Scheduled well-production reporting pipeline
//!
//! One invocation is one run: pull well observations from the data
//! service (bounded snapshot or event-stream subscription), validate and
//! aggregate them, write a spreadsheet report, and deliver it by email.
//! Failures in any required stage fail the run; delivery failures degrade
//! it to partial because the report is already on disk.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod lockfile;
pub mod notify;
pub mod report;
pub mod retry;
pub mod run;
pub mod types;
pub mod validator;

// Re-export the pipeline surface
pub use config::{ConfigError, Settings};
pub use run::run_once;
pub use types::{
    AggregateRow, ChannelStats, DeliveryAttempt, PipelineRunState, RawRecord, RejectReason,
    ReportArtifact, RunStage, RunStatus, ValidationResult, WellRecord,
};

// Re-export the service client
pub use api::{ApiError, TimeWindow, WellDataClient};
