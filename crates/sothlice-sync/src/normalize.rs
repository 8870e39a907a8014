//! Raw Jira issue payload -> canonical [`TicketRecord`].
//!
//! Timestamp policy: remote timestamps are parsed from RFC 3339 or the Jira
//! form (`2024-03-01T09:15:00.000+0000`) and re-expressed in one fixed
//! reference offset. `processed` is stamped in the same offset. Keep the
//! offset identical between runs so stored watermarks stay comparable.
//!
//! All three timestamps are truncated to microseconds, the precision of a
//! Postgres `TIMESTAMPTZ`. A watermark that carried nanoseconds would read
//! back smaller than the remote value and look newer on every run.

use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use serde_json::Value as JsonValue;
use sothlice_core::{RunContext, TicketRecord};
use thiserror::Error;
use tracing::{debug, warn};

const JIRA_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Sub-second digits a stored timestamp keeps.
const STORED_SUBSEC_DIGITS: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("{}: missing required field `{field}`", display_key(.key))]
    MissingField {
        key: Option<String>,
        field: &'static str,
    },
    #[error("{}: malformed field `{field}`: {reason}", display_key(.key))]
    Malformed {
        key: Option<String>,
        field: &'static str,
        reason: String,
    },
}

impl NormalizationError {
    pub fn key(&self) -> Option<&str> {
        match self {
            NormalizationError::MissingField { key, .. } | NormalizationError::Malformed { key, .. } => {
                key.as_deref()
            }
        }
    }
}

fn display_key(key: &Option<String>) -> &str {
    key.as_deref().unwrap_or("<no key>")
}

pub fn parse_remote_timestamp(value: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).or_else(|_| DateTime::parse_from_str(value, JIRA_TIMESTAMP_FORMAT))
}

#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    reference_offset: FixedOffset,
    fixed_now: Option<DateTime<Utc>>,
}

/// Records that survived normalization, plus the ones that were dropped.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<TicketRecord>,
    pub rejected: Vec<NormalizationError>,
}

impl RecordNormalizer {
    pub fn new(reference_offset: FixedOffset) -> Self {
        Self {
            reference_offset,
            fixed_now: None,
        }
    }

    /// Pin the `processed` clock (tests and replays).
    pub fn with_fixed_clock(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    pub fn reference_offset(&self) -> FixedOffset {
        self.reference_offset
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.fixed_now
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.reference_offset)
            .trunc_subsecs(STORED_SUBSEC_DIGITS)
    }

    pub fn normalize(&self, raw: &JsonValue) -> Result<TicketRecord, NormalizationError> {
        let key = match raw.get("key") {
            None | Some(JsonValue::Null) => {
                return Err(NormalizationError::MissingField { key: None, field: "key" })
            }
            Some(JsonValue::String(k)) if !k.trim().is_empty() => k.clone(),
            Some(other) => {
                return Err(NormalizationError::Malformed {
                    key: None,
                    field: "key",
                    reason: format!("expected a non-empty string, got {other}"),
                })
            }
        };

        let issue_type = required_str(raw, &key, "/fields/issuetype/name", "type.name")?;
        let status = required_str(raw, &key, "/fields/status/name", "status.name")?;
        let summary = required_str(raw, &key, "/fields/summary", "summary")?;
        let created = self.required_timestamp(raw, &key, "/fields/created", "created")?;
        let updated = self.required_timestamp(raw, &key, "/fields/updated", "updated")?;

        let description = match raw.pointer("/fields/description") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        };

        let assignee = match raw.pointer("/fields/assignee") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(name)) => Some(name.clone()),
            Some(other) => other
                .get("displayName")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
        };

        Ok(TicketRecord {
            key,
            issue_type: issue_type.to_string(),
            status: status.to_string(),
            summary: summary.to_string(),
            description,
            created,
            updated,
            assignee,
            processed: self.now(),
        })
    }

    /// Normalize a fetched batch. Failing records are logged and dropped; order
    /// of the survivors matches the input.
    pub fn normalize_batch(&self, ctx: &RunContext, raws: &[JsonValue]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in raws {
            match self.normalize(raw) {
                Ok(record) => batch.records.push(record),
                Err(err) => {
                    warn!(run_id = %ctx.run_id, key = err.key().unwrap_or("<no key>"), error = %err, "dropping record");
                    batch.rejected.push(err);
                }
            }
        }
        debug!(
            run_id = %ctx.run_id,
            normalized = batch.records.len(),
            rejected = batch.rejected.len(),
            "normalized batch"
        );
        batch
    }

    fn required_timestamp(
        &self,
        raw: &JsonValue,
        key: &str,
        pointer: &str,
        field: &'static str,
    ) -> Result<DateTime<FixedOffset>, NormalizationError> {
        let text = required_str(raw, key, pointer, field)?;
        parse_remote_timestamp(text)
            .map(|ts| {
                ts.with_timezone(&self.reference_offset)
                    .trunc_subsecs(STORED_SUBSEC_DIGITS)
            })
            .map_err(|err| NormalizationError::Malformed {
                key: Some(key.to_string()),
                field,
                reason: format!("unparseable timestamp {text:?}: {err}"),
            })
    }
}

fn required_str<'a>(
    raw: &'a JsonValue,
    key: &str,
    pointer: &str,
    field: &'static str,
) -> Result<&'a str, NormalizationError> {
    match raw.pointer(pointer) {
        None | Some(JsonValue::Null) => Err(NormalizationError::MissingField {
            key: Some(key.to_string()),
            field,
        }),
        Some(JsonValue::String(s)) => Ok(s.as_str()),
        Some(other) => Err(NormalizationError::Malformed {
            key: Some(key.to_string()),
            field,
            reason: format!("expected a string, got {other}"),
        }),
    }
}
