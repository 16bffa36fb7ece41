//! Document - one persisted record.
//!
//! `TigerStyle`: Identity and timestamps are typed; everything else is
//! free-form JSON.
//!
//! On the wire and on disk a document is a flat JSON object:
//!
//! ```json
//! { "id": "1735689600000-k3j9x0a1b", "createdAt": "2025-01-01T00:00:00.000Z",
//!   "updatedAt": "2025-01-01T00:00:00.000Z", "title": "Rust in 5 minutes" }
//! ```

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::EMBEDDED_ID_SUFFIX_CHARS_COUNT;
use crate::dst::DeterministicRng;
use crate::error::{StorageError, StorageResult};

/// Application fields of a document.
pub type Fields = serde_json::Map<String, Value>;

/// Reserved field: document id.
pub const FIELD_ID: &str = "id";
/// Reserved field: creation timestamp.
pub const FIELD_CREATED_AT: &str = "createdAt";
/// Reserved field: last update timestamp.
pub const FIELD_UPDATED_AT: &str = "updatedAt";

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

// =============================================================================
// Document
// =============================================================================

/// A persisted record with a unique id, immutable `createdAt` and a
/// monotonically refreshed `updatedAt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Backend-unique id
    pub id: String,
    /// Creation time, never changes after create
    #[serde(rename = "createdAt", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Last update time
    #[serde(rename = "updatedAt", with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    /// Application fields
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    /// Build a document for `create`.
    ///
    /// Keeps a caller-supplied string `id` and RFC 3339 `createdAt`;
    /// otherwise generates the id with `generate_id` and stamps `now`.
    /// `updatedAt` is always `now`.
    ///
    /// # Errors
    /// Returns `Validation` if `id` is not a string or `createdAt` is not a
    /// valid timestamp.
    pub fn from_input(
        mut fields: Fields,
        now: DateTime<Utc>,
        generate_id: impl FnOnce() -> String,
    ) -> StorageResult<Self> {
        let id = match fields.remove(FIELD_ID) {
            Some(Value::String(id)) if !id.is_empty() => id,
            None | Some(Value::Null) | Some(Value::String(_)) => generate_id(),
            Some(other) => {
                return Err(StorageError::validation(format!(
                    "id must be a string, got {other}"
                )))
            }
        };

        let created_at = match fields.remove(FIELD_CREATED_AT) {
            Some(Value::String(raw)) => parse_timestamp(&raw)?,
            None | Some(Value::Null) => now,
            Some(other) => {
                return Err(StorageError::validation(format!(
                    "createdAt must be an RFC 3339 string, got {other}"
                )))
            }
        };
        fields.remove(FIELD_UPDATED_AT);

        // Postcondition
        assert!(!id.is_empty(), "document id must not be empty");

        Ok(Self {
            id,
            created_at,
            updated_at: now,
            fields,
        })
    }

    /// Shallow-merge `patch` over the document and refresh `updatedAt`.
    ///
    /// Reserved keys in the patch are ignored.
    pub fn apply_patch(&mut self, patch: Fields, now: DateTime<Utc>) {
        for (key, value) in patch {
            if is_reserved(&key) {
                continue;
            }
            self.fields.insert(key, value);
        }
        let previous = self.updated_at;
        self.updated_at = now.max(previous);

        // Postcondition
        assert!(self.updated_at >= previous, "updatedAt must not go back");
    }

    /// Read a field, treating `id` and the timestamps as fields.
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            FIELD_ID => Some(Cow::Owned(Value::String(self.id.clone()))),
            FIELD_CREATED_AT => Some(Cow::Owned(Value::String(format_timestamp(
                &self.created_at,
            )))),
            FIELD_UPDATED_AT => Some(Cow::Owned(Value::String(format_timestamp(
                &self.updated_at,
            )))),
            other => self.fields.get(other).map(Cow::Borrowed),
        }
    }

    /// Flatten into a single JSON object (id, timestamps and fields).
    #[must_use]
    pub fn to_item(&self) -> Fields {
        let mut item = Fields::new();
        item.insert(FIELD_ID.to_string(), Value::String(self.id.clone()));
        item.insert(
            FIELD_CREATED_AT.to_string(),
            Value::String(format_timestamp(&self.created_at)),
        );
        item.insert(
            FIELD_UPDATED_AT.to_string(),
            Value::String(format_timestamp(&self.updated_at)),
        );
        for (key, value) in &self.fields {
            item.insert(key.clone(), value.clone());
        }
        item
    }

    /// Parse a flat JSON object produced by [`Document::to_item`].
    ///
    /// # Errors
    /// Returns `Serialization` if the object lacks id or timestamps.
    pub fn from_item(item: Fields) -> StorageResult<Self> {
        serde_json::from_value(Value::Object(item))
            .map_err(|e| StorageError::serialization(format!("invalid document: {e}")))
    }
}

/// Whether a key is managed by the store rather than the caller.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    matches!(key, FIELD_ID | FIELD_CREATED_AT | FIELD_UPDATED_AT)
}

// =============================================================================
// Time and Ids
// =============================================================================

/// Current time truncated to millisecond precision.
///
/// Persisted timestamps carry milliseconds, so in-memory values do too.
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Format a timestamp as RFC 3339 with milliseconds and `Z`.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns `Validation` on malformed input.
pub fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc).trunc_subsecs(3))
        .map_err(|e| StorageError::validation(format!("invalid timestamp '{raw}': {e}")))
}

/// Time-based id: `<unix-millis>-<random base36 suffix>`.
pub fn time_based_id(now: DateTime<Utc>, rng: &mut DeterministicRng) -> String {
    let mut id = format!("{}-", now.timestamp_millis());
    for _ in 0..EMBEDDED_ID_SUFFIX_CHARS_COUNT {
        id.push(char::from(*rng.choose(BASE36_ALPHABET)));
    }

    // Postcondition
    assert!(id.len() > EMBEDDED_ID_SUFFIX_CHARS_COUNT, "id must carry suffix");
    id
}

/// Random UUID v4 id.
#[must_use]
pub fn uuid_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
