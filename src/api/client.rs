//! HTTP client for the well-data service
//!
//! Authentication issues a token from HTTP basic credentials plus an
//! `ApplicationID` header; every later request carries the token in a
//! `Token` header. Snapshot queries POST a time-range payload and decode
//! the column-oriented `timeRecords` response into row-shaped raw records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stream::EventStream;
use super::ApiError;
use crate::config::{ApiSettings, WindowSettings};
use crate::types::{RawRecord, RecordSource};

/// Bounded time window for a snapshot query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Resolve the window from settings: explicit `from`/`to` when set,
    /// otherwise `[now - lookback, now]`.
    pub fn resolve(window: &WindowSettings, now: DateTime<Utc>) -> Self {
        match (&window.from, &window.to) {
            (Some(from), Some(to)) => {
                let from = crate::validator::parse_timestamp(from);
                let to = crate::validator::parse_timestamp(to);
                if let (Some(from), Some(to)) = (from, to) {
                    return Self { from, to };
                }
                // Settings validation already rejected unparseable bounds;
                // falling through keeps this total.
                Self::lookback(window.lookback_hours, now)
            }
            _ => Self::lookback(window.lookback_hours, now),
        }
    }

    fn lookback(hours: u64, now: DateTime<Utc>) -> Self {
        Self {
            from: now - chrono::Duration::hours(hours as i64),
            to: now,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// POST body for the snapshot query.
#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    #[serde(rename = "fromTime")]
    from_time: String,
    #[serde(rename = "toTime")]
    to_time: String,
    /// Channel allow-list; empty means all channels with data
    attributes: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    attributes: Vec<AttributeRef>,
    #[serde(default, rename = "timeRecords")]
    time_records: Vec<TimeRecord>,
}

#[derive(Debug, Deserialize)]
struct AttributeRef {
    #[serde(default)]
    id: String,
}

/// One server-side time record: values are `[attribute index, value]`
/// pairs against the response's `attributes` table.
#[derive(Debug, Deserialize)]
struct TimeRecord {
    #[serde(default, rename = "wellId")]
    well_id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    values: Vec<(usize, serde_json::Value)>,
}

// ============================================================================
// Client
// ============================================================================

/// Authenticated client for the well-data service.
pub struct WellDataClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    username: String,
    password: String,
    token: Option<String>,
}

impl WellDataClient {
    pub fn new(api: &ApiSettings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .build()
            .map_err(|e| ApiError::permanent(format!("failed to build HTTP client: {e}"), None))?;

        Ok(Self {
            http,
            base_url: api.endpoint.trim_end_matches('/').to_string(),
            app_id: api.app_id.clone(),
            username: api.username.clone(),
            password: api.password.clone(),
            token: None,
        })
    }

    /// Fetch an auth token. 401/403 responses are permanent failures.
    /// Takes `&self` so it composes with the retry layer; install the
    /// result with [`Self::set_token`].
    pub async fn request_token(&self) -> Result<String, ApiError> {
        let url = format!("{}/tokens/token", self.base_url);
        debug!(url = %url, "requesting auth token");

        let response = self
            .http
            .get(&url)
            .header("ApplicationID", &self.app_id)
            .header("accept", "application/json")
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e, "token request"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(
                status,
                "token request",
                retry_after_hint(&response),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::permanent(format!("token response decode: {e}"), None))?;
        info!("authenticated against well-data service");
        Ok(body.token)
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn token(&self) -> Result<&str, ApiError> {
        self.token
            .as_deref()
            .ok_or_else(|| ApiError::permanent("client not authenticated", None))
    }

    /// Synchronous pull of all records in a bounded time window.
    pub async fn fetch_snapshot(
        &self,
        window: &TimeWindow,
        channels: &[String],
    ) -> Result<Vec<RawRecord>, ApiError> {
        let url = format!("{}/data/time", self.base_url);
        let payload = SnapshotRequest {
            from_time: window.from.to_rfc3339(),
            to_time: window.to.to_rfc3339(),
            attributes: channels,
        };
        debug!(url = %url, from = %payload.from_time, to = %payload.to_time, "snapshot query");

        let response = self
            .http
            .post(&url)
            .header("Token", self.token()?)
            .header("accept", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e, "snapshot query"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(
                status,
                "snapshot query",
                retry_after_hint(&response),
            ));
        }

        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| ApiError::permanent(format!("snapshot response decode: {e}"), None))?;

        let records = decode_snapshot(body);
        info!(records = records.len(), "snapshot fetched");
        Ok(records)
    }

    /// Open a persistent event-stream subscription. The returned stream is
    /// lazy: records are produced as [`EventStream::next_record`] is polled,
    /// and the sequence ends when the server closes the connection or
    /// `cancel` is triggered.
    pub async fn subscribe_stream(
        &self,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<EventStream, ApiError> {
        let url = format!("{}/data/time/realtime", self.base_url);
        debug!(url = %url, "opening event-stream subscription");

        let response = self
            .http
            .get(&url)
            .header("Token", self.token()?)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e, "stream subscribe"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(
                status,
                "stream subscribe",
                retry_after_hint(&response),
            ));
        }

        info!("event-stream subscription established");
        Ok(EventStream::new(response, read_timeout, cancel))
    }
}

/// Parse a `Retry-After` header (delay-seconds form) if present.
fn retry_after_hint(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pivot the column-oriented snapshot response into one raw record per
/// (well, timestamp). Out-of-range indices are skipped; the validator
/// deals with everything else.
fn decode_snapshot(body: SnapshotResponse) -> Vec<RawRecord> {
    let attribute_ids: Vec<String> = body.attributes.into_iter().map(|a| a.id).collect();

    body.time_records
        .into_iter()
        .map(|record| {
            let mut channels = BTreeMap::new();
            for (index, value) in record.values {
                if let Some(id) = attribute_ids.get(index) {
                    channels.insert(id.clone(), value);
                }
            }
            RawRecord {
                well_id: record.well_id,
                timestamp: record.timestamp,
                channels,
                source: RecordSource::Snapshot,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_snapshot_maps_indices_to_attribute_ids() {
        let body: SnapshotResponse = serde_json::from_str(
            r#"{
                "attributes": [{"id": "HookLoad"}, {"id": "PumpPressure"}],
                "timeRecords": [
                    {
                        "wellId": "JOB-1",
                        "timestamp": "2026-08-24T06:00:00Z",
                        "values": [[0, 245.5], [1, 2800.0]]
                    },
                    {
                        "wellId": "JOB-2",
                        "timestamp": "2026-08-24T06:00:00Z",
                        "values": [[1, 1900.0], [7, 1.0]]
                    }
                ]
            }"#,
        )
        .unwrap();

        let records = decode_snapshot(body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].well_id, "JOB-1");
        assert_eq!(records[0].channels.len(), 2);
        assert_eq!(
            records[0].channels.get("HookLoad").and_then(|v| v.as_f64()),
            Some(245.5)
        );
        // index 7 has no attribute: dropped, not an error
        assert_eq!(records[1].channels.len(), 1);
        assert_eq!(records[1].source, RecordSource::Snapshot);
    }

    #[test]
    fn test_decode_snapshot_keeps_malformed_values_for_validator() {
        let body: SnapshotResponse = serde_json::from_str(
            r#"{
                "attributes": [{"id": "Volume"}],
                "timeRecords": [
                    {"wellId": "JOB-1", "timestamp": "", "values": [[0, "n/a"]]}
                ]
            }"#,
        )
        .unwrap();

        let records = decode_snapshot(body);
        assert_eq!(records.len(), 1);
        assert!(records[0].channels.get("Volume").is_some_and(|v| v.is_string()));
    }

    #[test]
    fn test_window_resolution() {
        let now = DateTime::parse_from_rfc3339("2026-08-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut settings = WindowSettings::default();
        settings.lookback_hours = 6;
        let window = TimeWindow::resolve(&settings, now);
        assert_eq!(window.to, now);
        assert_eq!(window.to - window.from, chrono::Duration::hours(6));

        settings.from = Some("2026-08-24T06:05:17Z".to_string());
        settings.to = Some("2026-08-24T06:06:17Z".to_string());
        let window = TimeWindow::resolve(&settings, now);
        assert_eq!(window.to - window.from, chrono::Duration::seconds(60));
    }
}
