//! Record validation
//!
//! A fixed schema applied to every raw record before it can reach
//! aggregation: identity fields present, timestamp parseable, every value
//! numeric and finite, and measurements inside their configured physical
//! bounds. Validation is pure (no I/O, no clock reads), so the same raw
//! record always yields the same outcome.
//!
//! Rejections are never silent: each carries a [`RejectReason`] that the
//! run loop counts into the summary.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;

use crate::config::ValidationSettings;
use crate::types::{RawRecord, RejectReason, ValidationResult, WellRecord};

/// Parse a record timestamp. Accepts RFC 3339 and the bare
/// `YYYY-MM-DDTHH:MM:SS` form the service uses in places, which is taken
/// as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// Validate one raw record against the configured schema.
pub fn validate(raw: &RawRecord, rules: &ValidationSettings) -> ValidationResult {
    let reject = |reason: RejectReason| ValidationResult::Rejected {
        well_id: raw.well_id.clone(),
        reason,
    };

    if raw.well_id.trim().is_empty() {
        return reject(RejectReason::MissingWellId);
    }
    if raw.timestamp.trim().is_empty() {
        return reject(RejectReason::MissingTimestamp);
    }
    let Some(timestamp) = parse_timestamp(&raw.timestamp) else {
        return reject(RejectReason::UnparseableTimestamp {
            raw: raw.timestamp.clone(),
        });
    };

    let mut channels = BTreeMap::new();
    for (name, value) in &raw.channels {
        // Explicit nulls mean "no sample"; the channel is simply absent.
        if value.is_null() {
            continue;
        }
        let Some(number) = value.as_f64() else {
            return reject(RejectReason::NonNumericValue {
                channel: name.clone(),
            });
        };
        if !number.is_finite() {
            return reject(RejectReason::NonFiniteValue {
                channel: name.clone(),
            });
        }
        if let Some(bounds) = rules.bounds.get(name) {
            if number < bounds.min || number > bounds.max {
                return reject(RejectReason::OutOfBounds {
                    channel: name.clone(),
                    value: number,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }
        channels.insert(name.clone(), number);
    }

    for required in &rules.required_channels {
        if !channels.contains_key(required) {
            return reject(RejectReason::MissingChannel {
                channel: required.clone(),
            });
        }
    }

    ValidationResult::Accepted(WellRecord {
        well_id: raw.well_id.clone(),
        timestamp,
        channels,
        source: raw.source,
    })
}
