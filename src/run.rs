//! Pipeline orchestration
//!
//! One invocation of `run_once` is one complete pipeline pass:
//! authenticate, ingest (snapshot or stream), validate, aggregate, write
//! the report, notify. Stages that cannot produce their output fail the
//! run; notification failures only downgrade it to partial, because the
//! report is already on disk.

use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::aggregate;
use crate::api::{ApiError, TimeWindow, WellDataClient};
use crate::config::Settings;
use crate::notify::Notifier;
use crate::report::{artifact_path, build_layout, write_report, ReportWriteError, Stat};
use crate::retry::RetryPolicy;
use crate::types::{
    DeliveryAttempt, PipelineRunState, RawRecord, RejectReason, RunStage, ValidationResult,
    WellRecord,
};
use crate::validator;

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Report(#[from] ReportWriteError),
}

/// Execute one complete pipeline pass and return its terminal state.
///
/// Never panics and never returns early without a summary: every outcome,
/// including failure, ends in [`PipelineRunState::log_summary`].
pub async fn run_once(settings: &Settings, shutdown: CancellationToken) -> PipelineRunState {
    let mut state = PipelineRunState::new();
    if let Err(e) = run_stages(settings, shutdown, &mut state).await {
        warn!(stage = %state.stage, error = %e, "pipeline run failed");
        state.fail(e.to_string());
    }
    state.log_summary();
    state
}

async fn run_stages(
    settings: &Settings,
    shutdown: CancellationToken,
    state: &mut PipelineRunState,
) -> Result<(), RunError> {
    let retry = RetryPolicy::new(&settings.retry);

    state.enter_stage(RunStage::Authenticate);
    let mut client = WellDataClient::new(&settings.api)?;
    let token = retry.run("authenticate", || client.request_token()).await?;
    client.set_token(token);

    state.enter_stage(RunStage::Ingest);
    let raw = if settings.window.stream {
        ingest_stream(&client, settings, retry, &shutdown).await?
    } else {
        let window = TimeWindow::resolve(&settings.window, Utc::now());
        retry
            .run("snapshot", || {
                client.fetch_snapshot(&window, &settings.window.channels)
            })
            .await?
    };
    state.fetched = raw.len() as u64;
    info!(fetched = state.fetched, "ingest complete");

    state.enter_stage(RunStage::Validate);
    let accepted = screen_records(&raw, settings, state);
    state.accepted = accepted.len() as u64;
    info!(
        accepted = state.accepted,
        rejected = state.rejected,
        "validation complete"
    );

    state.enter_stage(RunStage::Aggregate);
    let rows = aggregate(&accepted, &settings.aggregation);
    info!(rows = rows.len(), "aggregation complete");

    state.enter_stage(RunStage::WriteReport);
    let stats = Stat::from_config(&settings.aggregation.stats);
    let layout = build_layout(&rows, state.accepted, state.rejected, &stats);
    let generated_at = Utc::now();
    let path = artifact_path(&settings.report, generated_at.date_naive());
    let artifact = write_report(&layout, &path, generated_at, state.accepted, state.rejected)?;
    state.report = Some(artifact.clone());

    state.enter_stage(RunStage::Notify);
    dispatch_notifications(settings, retry, &artifact, state).await;

    state.enter_stage(RunStage::Done);
    Ok(())
}

/// Dispatch the finished report. Delivery failures degrade the run to
/// partial, never fail it: the artifact is already on disk.
async fn dispatch_notifications(
    settings: &Settings,
    retry: RetryPolicy,
    artifact: &crate::types::ReportArtifact,
    state: &mut PipelineRunState,
) {
    if !settings.email.enabled || settings.email.recipients.is_empty() {
        info!("email dispatch disabled, report kept on disk");
        return;
    }

    match Notifier::new(&settings.email, retry) {
        Ok(notifier) => {
            let attempts = notifier
                .dispatch_report(&settings.email.recipients, artifact)
                .await;
            if attempts.iter().any(|a| !a.succeeded) {
                state.mark_partial();
            }
            state.delivery_attempts = attempts;
        }
        Err(e) => {
            warn!(error = %e, "notifier unavailable");
            let message = e.to_string();
            for recipient in &settings.email.recipients {
                state.delivery_attempts.push(DeliveryAttempt {
                    recipient: recipient.clone(),
                    succeeded: false,
                    error: Some(message.clone()),
                    attempted_at: Utc::now(),
                });
            }
            state.mark_partial();
        }
    }
}

/// Collect records from the event stream until the server closes it, the
/// collection window elapses, or shutdown is requested.
async fn ingest_stream(
    client: &WellDataClient,
    settings: &Settings,
    retry: RetryPolicy,
    shutdown: &CancellationToken,
) -> Result<Vec<RawRecord>, ApiError> {
    let cancel = shutdown.child_token();
    let read_timeout = Duration::from_secs(settings.window.stream_read_timeout_secs);
    let mut stream = retry
        .run("stream_subscribe", || {
            client.subscribe_stream(read_timeout, cancel.clone())
        })
        .await?;

    let deadline = tokio::time::sleep(Duration::from_secs(settings.window.stream_max_secs));
    tokio::pin!(deadline);
    let mut deadline_hit = false;

    let mut records = Vec::new();
    loop {
        tokio::select! {
            () = &mut deadline, if !deadline_hit => {
                deadline_hit = true;
                info!(
                    max_secs = settings.window.stream_max_secs,
                    records = records.len(),
                    "stream collection window elapsed"
                );
                cancel.cancel();
            }
            next = stream.next_record() => match next? {
                Some(record) => records.push(record),
                None => break,
            }
        }
    }
    Ok(records)
}

/// Validate every raw record and drop duplicate (well, timestamp) keys,
/// first occurrence wins. Rejections are counted into the run state.
fn screen_records(
    raw: &[RawRecord],
    settings: &Settings,
    state: &mut PipelineRunState,
) -> Vec<WellRecord> {
    let mut seen = BTreeSet::new();
    let mut accepted = Vec::with_capacity(raw.len());

    for record in raw {
        match validator::validate(record, &settings.validation) {
            ValidationResult::Accepted(rec) => {
                if seen.insert(rec.key()) {
                    accepted.push(rec);
                } else {
                    warn!(
                        well = %rec.well_id,
                        timestamp = %rec.timestamp,
                        "duplicate record key, keeping first occurrence"
                    );
                    state.record_rejection(&RejectReason::DuplicateKey);
                }
            }
            ValidationResult::Rejected { well_id, reason } => {
                warn!(
                    well = %well_id,
                    code = reason.code(),
                    reason = %reason,
                    "record rejected"
                );
                state.record_rejection(&reason);
            }
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordSource, ReportArtifact, RunStatus};
    use serde_json::json;
    use std::path::Path;

    fn raw(well: &str, ts: &str, channels: &[(&str, serde_json::Value)]) -> RawRecord {
        RawRecord {
            well_id: well.to_string(),
            timestamp: ts.to_string(),
            channels: channels
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            source: RecordSource::Snapshot,
        }
    }

    #[test]
    fn test_screen_counts_rejections_and_keeps_good_records() {
        let settings = Settings::default();
        let mut state = PipelineRunState::new();
        let records = vec![
            raw("JOB-1", "2026-08-24T06:00:00Z", &[("HookLoad", json!(245.5))]),
            raw("JOB-1", "2026-08-24T06:01:00Z", &[("Volume", json!(-5.0))]),
            raw("JOB-2", "2026-08-24T06:00:00Z", &[("HookLoad", json!(100.0))]),
        ];

        let accepted = screen_records(&records, &settings, &mut state);
        assert_eq!(accepted.len(), 2);
        assert_eq!(state.rejected, 1);
        assert_eq!(state.reject_reasons.get("out_of_bounds"), Some(&1));
        // Status is untouched by rejections alone.
        assert_eq!(state.status, RunStatus::Success);
    }

    #[test]
    fn test_screen_drops_duplicate_keys_first_wins() {
        let settings = Settings::default();
        let mut state = PipelineRunState::new();
        let records = vec![
            raw("JOB-1", "2026-08-24T06:00:00Z", &[("HookLoad", json!(100.0))]),
            raw("JOB-1", "2026-08-24T06:00:00Z", &[("HookLoad", json!(999.0))]),
        ];

        let accepted = screen_records(&records, &settings, &mut state);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].channels.get("HookLoad"), Some(&100.0));
        assert_eq!(state.reject_reasons.get("duplicate_key"), Some(&1));
    }

    fn artifact_at(path: &Path) -> ReportArtifact {
        ReportArtifact {
            path: path.to_path_buf(),
            size_bytes: 8,
            sheet_name: "RAE Report".to_string(),
            data_rows: 1,
            accepted: 1,
            rejected: 0,
            generated_at: Utc::now(),
        }
    }

    fn email_enabled(settings: &mut Settings) {
        settings.email.enabled = true;
        // Nothing listens on the discard port, so sends fail fast.
        settings.email.smtp_host = "127.0.0.1".to_string();
        settings.email.smtp_port = 9;
        settings.email.from = "reports@example.com".to_string();
        settings.email.recipients = vec!["ops@example.com".to_string()];
    }

    #[tokio::test]
    async fn test_delivery_failure_degrades_run_to_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RAE Report 2026-08-24.xlsx");
        std::fs::write(&path, b"workbook").unwrap();

        let mut settings = Settings::default();
        email_enabled(&mut settings);
        let artifact = artifact_at(&path);
        let mut state = PipelineRunState::new();
        state.report = Some(artifact.clone());

        dispatch_notifications(&settings, RetryPolicy::immediate(1), &artifact, &mut state).await;

        assert_eq!(state.status, RunStatus::Partial);
        assert_eq!(state.delivery_attempts.len(), 1);
        assert!(!state.delivery_attempts[0].succeeded);
        assert!(state.delivery_attempts[0].error.is_some());
        // The artifact is untouched by the delivery failure.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unusable_notifier_records_failed_attempt_per_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RAE Report 2026-08-24.xlsx");
        std::fs::write(&path, b"workbook").unwrap();

        let mut settings = Settings::default();
        email_enabled(&mut settings);
        settings.email.from = "not an address".to_string();
        settings.email.recipients =
            vec!["a@example.com".to_string(), "b@example.com".to_string()];

        let artifact = artifact_at(&path);
        let mut state = PipelineRunState::new();

        dispatch_notifications(&settings, RetryPolicy::immediate(1), &artifact, &mut state).await;

        assert_eq!(state.status, RunStatus::Partial);
        assert_eq!(state.delivery_attempts.len(), 2);
        assert!(state.delivery_attempts.iter().all(|a| !a.succeeded));
    }

    #[tokio::test]
    async fn test_disabled_email_leaves_run_successful() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RAE Report 2026-08-24.xlsx");
        std::fs::write(&path, b"workbook").unwrap();

        let mut settings = Settings::default();
        settings.email.enabled = false;
        let artifact = artifact_at(&path);
        let mut state = PipelineRunState::new();

        dispatch_notifications(&settings, RetryPolicy::immediate(1), &artifact, &mut state).await;

        assert_eq!(state.status, RunStatus::Success);
        assert!(state.delivery_attempts.is_empty());
    }

    #[test]
    fn test_same_timestamp_different_wells_is_not_a_duplicate() {
        let settings = Settings::default();
        let mut state = PipelineRunState::new();
        let records = vec![
            raw("JOB-1", "2026-08-24T06:00:00Z", &[("HookLoad", json!(1.0))]),
            raw("JOB-2", "2026-08-24T06:00:00Z", &[("HookLoad", json!(2.0))]),
        ];

        let accepted = screen_records(&records, &settings, &mut state);
        assert_eq!(accepted.len(), 2);
        assert_eq!(state.rejected, 0);
    }
}
