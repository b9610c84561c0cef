//! Time-bucket aggregation
//!
//! Groups validated records by (well, time bucket) and computes per-channel
//! statistics. Grouping is key-based, so out-of-order arrival changes
//! nothing; the output ordering (ascending well identifier, then bucket
//! start) is deterministic for reproducible reports. A channel with no
//! samples in a bucket stays absent, never interpolated.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::config::AggregationSettings;
use crate::types::{AggregateRow, ChannelStats, WellRecord};

/// Running accumulator for one channel in one bucket.
#[derive(Debug, Clone)]
struct Accumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn finish(self) -> ChannelStats {
        ChannelStats {
            count: self.count,
            sum: self.sum,
            mean: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
        }
    }
}

/// Floor a timestamp to its bucket start.
fn bucket_start(timestamp: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let secs = timestamp.timestamp().div_euclid(bucket_secs) * bucket_secs;
    // Any i64 multiple of a positive bucket width is representable.
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(timestamp)
}

/// Aggregate validated records into report rows.
pub fn aggregate(records: &[WellRecord], settings: &AggregationSettings) -> Vec<AggregateRow> {
    // BTreeMap keys give the required (well asc, bucket asc) ordering.
    let mut groups: BTreeMap<(String, DateTime<Utc>), BTreeMap<String, Accumulator>> =
        BTreeMap::new();

    for record in records {
        let key = (
            record.well_id.clone(),
            bucket_start(record.timestamp, settings.bucket_secs),
        );
        let channels = groups.entry(key).or_default();
        for (name, &value) in &record.channels {
            channels
                .entry(name.clone())
                .and_modify(|acc| acc.push(value))
                .or_insert_with(|| Accumulator::new(value));
        }
    }

    groups
        .into_iter()
        .map(|((well_id, bucket_start), channels)| AggregateRow {
            well_id,
            bucket_start,
            channels: channels
                .into_iter()
                .map(|(name, acc)| (name, acc.finish()))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordSource;

    fn record(well: &str, ts: &str, channels: &[(&str, f64)]) -> WellRecord {
        WellRecord {
            well_id: well.to_string(),
            timestamp: DateTime::parse_from_rfc3339(ts)
                .unwrap()
                .with_timezone(&Utc),
            channels: channels
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            source: RecordSource::Snapshot,
        }
    }

    fn hourly() -> AggregationSettings {
        AggregationSettings {
            bucket_secs: 3_600,
            stats: vec!["mean".to_string(), "min".to_string(), "max".to_string()],
        }
    }

    #[test]
    fn test_one_row_per_well_and_bucket() {
        let records = vec![
            record("JOB-1", "2026-08-24T06:10:00Z", &[("HookLoad", 100.0)]),
            record("JOB-1", "2026-08-24T06:50:00Z", &[("HookLoad", 200.0)]),
            record("JOB-1", "2026-08-24T07:10:00Z", &[("HookLoad", 300.0)]),
            record("JOB-2", "2026-08-24T06:20:00Z", &[("HookLoad", 50.0)]),
        ];
        let rows = aggregate(&records, &hourly());
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.well_id, "JOB-1");
        assert_eq!(first.bucket_start.to_rfc3339(), "2026-08-24T06:00:00+00:00");
        let stats = first.channels.get("HookLoad").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum, 300.0);
        assert_eq!(stats.mean, 150.0);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 200.0);
    }

    #[test]
    fn test_order_independence() {
        let mut records = vec![
            record("JOB-2", "2026-08-24T06:20:00Z", &[("HookLoad", 50.0)]),
            record("JOB-1", "2026-08-24T06:50:00Z", &[("HookLoad", 200.0)]),
            record("JOB-1", "2026-08-24T07:10:00Z", &[("HookLoad", 300.0)]),
            record("JOB-1", "2026-08-24T06:10:00Z", &[("HookLoad", 100.0)]),
        ];
        let shuffled = aggregate(&records, &hourly());
        records.reverse();
        let reversed = aggregate(&records, &hourly());
        assert_eq!(shuffled, reversed);
    }

    #[test]
    fn test_output_sorted_by_well_then_bucket() {
        let records = vec![
            record("JOB-9", "2026-08-24T06:00:00Z", &[("V", 1.0)]),
            record("JOB-1", "2026-08-24T08:00:00Z", &[("V", 1.0)]),
            record("JOB-1", "2026-08-24T06:00:00Z", &[("V", 1.0)]),
        ];
        let rows = aggregate(&records, &hourly());
        let keys: Vec<(&str, String)> = rows
            .iter()
            .map(|r| (r.well_id.as_str(), r.bucket_start.to_rfc3339()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("JOB-1", "2026-08-24T06:00:00+00:00".to_string()),
                ("JOB-1", "2026-08-24T08:00:00+00:00".to_string()),
                ("JOB-9", "2026-08-24T06:00:00+00:00".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_channel_stays_absent() {
        let records = vec![
            record("JOB-1", "2026-08-24T06:00:00Z", &[("HookLoad", 100.0)]),
            record(
                "JOB-1",
                "2026-08-24T07:00:00Z",
                &[("HookLoad", 120.0), ("PumpPressure", 2800.0)],
            ),
        ];
        let rows = aggregate(&records, &hourly());
        assert_eq!(rows.len(), 2);
        assert!(rows[0].channels.get("PumpPressure").is_none());
        assert!(rows[1].channels.get("PumpPressure").is_some());
    }

    #[test]
    fn test_single_sample_stats() {
        let records = vec![record("JOB-1", "2026-08-24T06:30:00Z", &[("V", 42.0)])];
        let rows = aggregate(&records, &hourly());
        let stats = rows[0].channels.get("V").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.mean, 42.0);
        assert_eq!(stats.min, 42.0);
        assert_eq!(stats.max, 42.0);
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        assert!(aggregate(&[], &hourly()).is_empty());
    }

    #[test]
    fn test_bucket_floor_before_epoch_and_odd_widths() {
        let settings = AggregationSettings {
            bucket_secs: 600,
            stats: vec!["mean".to_string()],
        };
        let records = vec![record("JOB-1", "1969-12-31T23:55:00Z", &[("V", 1.0)])];
        let rows = aggregate(&records, &settings);
        // div_euclid floors toward negative infinity, so pre-epoch
        // timestamps land in the bucket that starts before them.
        assert_eq!(rows[0].bucket_start.to_rfc3339(), "1969-12-31T23:50:00+00:00");
    }
}
