//! Event-stream subscription consumer
//!
//! The service pushes incremental updates over a persistent connection as
//! server-sent events. A `header` event announces the channel table, then
//! each `update` event carries one timestamped set of `[index, value]`
//! pairs:
//!
//! ```text
//! event: header
//! data: {"WellId":"JOB-1","Tags":[{"Name":"HookLoad"},{"Name":"PumpPressure"}]}
//!
//! event: update
//! data: {"Timestamp":"2026-08-24T06:00:00Z","Values":[[0,245.5],[1,2800.0]]}
//! ```
//!
//! The stream is a cancellable lazy sequence: records are produced only as
//! [`EventStream::next_record`] is polled. Every read is bounded by a
//! timeout so a stalled upstream surfaces as a transient failure instead of
//! blocking the run forever.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::types::{RawRecord, RecordSource};

type ByteChunks = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

#[derive(Debug, Deserialize)]
struct HeaderEvent {
    #[serde(default, rename = "WellId")]
    well_id: String,
    #[serde(default, rename = "Tags")]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(default, rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct UpdateEvent {
    #[serde(default, rename = "Timestamp")]
    timestamp: String,
    #[serde(default, rename = "WellId")]
    well_id: Option<String>,
    #[serde(default, rename = "Values")]
    values: Vec<(usize, serde_json::Value)>,
}

/// Lazy, cancellable sequence of raw records over one event-stream
/// connection.
pub struct EventStream {
    chunks: ByteChunks,
    /// Undelivered bytes carried across chunk boundaries
    buffer: String,
    /// Channel table from the last `header` event
    channels: Vec<String>,
    /// Well identity from the last `header` event
    well_id: String,
    /// Name of the last `event:` line seen
    last_event: Option<String>,
    read_timeout: Duration,
    cancel: CancellationToken,
    done: bool,
    records_received: u64,
}

impl EventStream {
    pub(super) fn new(
        response: reqwest::Response,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self::from_chunks(chunks, read_timeout, cancel)
    }

    fn from_chunks(chunks: ByteChunks, read_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            chunks,
            buffer: String::new(),
            channels: Vec::new(),
            well_id: String::new(),
            last_event: None,
            read_timeout,
            cancel,
            done: false,
            records_received: 0,
        }
    }

    /// Produce the next raw record.
    ///
    /// Returns `Ok(None)` when the server closes the connection or the
    /// stream is cancelled; a read exceeding the timeout is a transient
    /// failure.
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, ApiError> {
        loop {
            if self.done {
                return Ok(None);
            }

            // Drain complete lines already buffered before reading more.
            while let Some(line) = self.take_line() {
                if let Some(record) = self.handle_line(&line) {
                    self.records_received += 1;
                    return Ok(Some(record));
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(records = self.records_received, "event stream cancelled");
                    self.done = true;
                    return Ok(None);
                }
                read = tokio::time::timeout(self.read_timeout, self.chunks.next()) => {
                    match read {
                        Err(_) => {
                            return Err(ApiError::transient(format!(
                                "stream read timeout after {}s",
                                self.read_timeout.as_secs()
                            )));
                        }
                        Ok(None) => {
                            info!(records = self.records_received, "event stream closed by server");
                            self.done = true;
                            return Ok(None);
                        }
                        Ok(Some(Err(e))) => {
                            return Err(ApiError::from_transport(&e, "stream read"));
                        }
                        Ok(Some(Ok(bytes))) => {
                            self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        }
                    }
                }
            }
        }
    }

    /// Close the subscription. Idempotent; further reads return `None`.
    pub fn close(&mut self) {
        if !self.done {
            debug!(records = self.records_received, "closing event stream");
        }
        self.done = true;
    }

    /// Pop one complete line from the buffer, if present.
    fn take_line(&mut self) -> Option<String> {
        let newline = self.buffer.find('\n')?;
        let line: String = self.buffer.drain(..=newline).collect();
        Some(line.trim_end_matches(['\n', '\r']).to_string())
    }

    /// Process one SSE line; returns a record when an update completes.
    fn handle_line(&mut self, line: &str) -> Option<RawRecord> {
        if line.is_empty() {
            // Frame separator
            return None;
        }
        if let Some(event) = line.strip_prefix("event: ") {
            self.last_event = Some(event.trim().to_string());
            return None;
        }
        let data = line.strip_prefix("data: ")?;

        match self.last_event.as_deref() {
            Some("header") => {
                match serde_json::from_str::<HeaderEvent>(data) {
                    Ok(header) => {
                        self.channels = header.tags.into_iter().map(|t| t.name).collect();
                        self.well_id = header.well_id;
                        debug!(channels = self.channels.len(), well = %self.well_id, "stream header received");
                    }
                    Err(e) => warn!(error = %e, "unparseable stream header, keeping previous channel table"),
                }
                None
            }
            Some("update") => match serde_json::from_str::<UpdateEvent>(data) {
                Ok(update) => Some(self.build_record(update)),
                Err(e) => {
                    warn!(error = %e, "unparseable stream update, skipping frame");
                    None
                }
            },
            _ => None,
        }
    }

    fn build_record(&self, update: UpdateEvent) -> RawRecord {
        let mut channels = BTreeMap::new();
        for (index, value) in update.values {
            if let Some(name) = self.channels.get(index) {
                channels.insert(name.clone(), value);
            }
        }
        RawRecord {
            well_id: update.well_id.unwrap_or_else(|| self.well_id.clone()),
            timestamp: update.timestamp,
            channels,
            source: RecordSource::Stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn stream_of(frames: Vec<&str>) -> ByteChunks {
        stream::iter(
            frames
                .into_iter()
                .map(|f| Ok(f.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn test_stream(frames: Vec<&str>) -> EventStream {
        EventStream::from_chunks(
            stream_of(frames),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    const HEADER: &str = "event: header\ndata: {\"WellId\":\"JOB-1\",\"Tags\":[{\"Name\":\"HookLoad\"},{\"Name\":\"PumpPressure\"}]}\n\n";

    #[tokio::test]
    async fn test_header_then_update_yields_record() {
        let update = "event: update\ndata: {\"Timestamp\":\"2026-08-24T06:00:00Z\",\"Values\":[[0,245.5],[1,2800.0]]}\n\n";
        let mut stream = test_stream(vec![HEADER, update]);

        let record = stream.next_record().await.unwrap().unwrap();
        assert_eq!(record.well_id, "JOB-1");
        assert_eq!(record.source, RecordSource::Stream);
        assert_eq!(
            record.channels.get("HookLoad").and_then(|v| v.as_f64()),
            Some(245.5)
        );

        // Server closes after the single update
        assert!(stream.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frames_split_across_chunk_boundaries() {
        // The update frame arrives in three arbitrary pieces.
        let mut stream = test_stream(vec![
            HEADER,
            "event: up",
            "date\ndata: {\"Timestamp\":\"2026-08-24T06:00:01Z\",\"Valu",
            "es\":[[1,1900.0]]}\n\n",
        ]);

        let record = stream.next_record().await.unwrap().unwrap();
        assert_eq!(
            record.channels.get("PumpPressure").and_then(|v| v.as_f64()),
            Some(1900.0)
        );
        assert!(record.channels.get("HookLoad").is_none());
    }

    #[tokio::test]
    async fn test_unknown_value_index_is_dropped() {
        let update =
            "event: update\ndata: {\"Timestamp\":\"2026-08-24T06:00:02Z\",\"Values\":[[9,1.0],[0,10.0]]}\n\n";
        let mut stream = test_stream(vec![HEADER, update]);

        let record = stream.next_record().await.unwrap().unwrap();
        assert_eq!(record.channels.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_update_is_skipped_not_fatal() {
        let bad = "event: update\ndata: {not json}\n\n";
        let good =
            "event: update\ndata: {\"Timestamp\":\"2026-08-24T06:00:03Z\",\"Values\":[[0,1.0]]}\n\n";
        let mut stream = test_stream(vec![HEADER, bad, good]);

        let record = stream.next_record().await.unwrap().unwrap();
        assert_eq!(record.timestamp, "2026-08-24T06:00:03Z");
    }

    #[tokio::test]
    async fn test_cancellation_ends_sequence() {
        let cancel = CancellationToken::new();
        // Pending forever: no frames, so the reader must wake on cancel.
        let mut stream = EventStream::from_chunks(
            stream::pending().boxed(),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(stream.next_record().await.unwrap().is_none());
        // And the stream stays closed.
        assert!(stream.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_timeout_is_transient() {
        let mut stream = EventStream::from_chunks(
            stream::pending().boxed(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        let err = stream.next_record().await.unwrap_err();
        assert!(matches!(err, ApiError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_update_before_header_is_ignored() {
        let orphan =
            "event: update\ndata: {\"Timestamp\":\"2026-08-24T06:00:00Z\",\"Values\":[[0,1.0]]}\n\n";
        let mut stream = test_stream(vec![orphan]);
        // No channel table yet: indices resolve against an empty table, so
        // the record comes out with no channels for the validator to judge.
        let record = stream.next_record().await.unwrap().unwrap();
        assert!(record.channels.is_empty());
    }
}
