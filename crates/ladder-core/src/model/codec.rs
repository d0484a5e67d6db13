//! Lenient decoding of stored blobs and remote documents.
//!
//! Stored data may come from older builds or be hand-edited, so decoding
//! never fails as a whole: a bad blob is an empty tree, a bad record is
//! dropped or defaulted field by field.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::model::task::{Forest, Level, Task, TaskRecord};
use crate::tree;

/// Title given to stored records whose title is missing or blank.
pub const UNTITLED: &str = "Untitled goal";

/// Why a remote document could not be turned into a [`TaskRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("document body is not an object")]
    NotAnObject,
    #[error("document has no usable id")]
    MissingId,
    #[error("document field '{0}' is missing or not a string")]
    MissingField(&'static str),
    #[error("unknown level '{0}'")]
    BadLevel(String),
}

// ---------------------------------------------------------------------------
// Local blobs
// ---------------------------------------------------------------------------

/// Decode the local task-tree blob. Anything but a JSON array is an empty tree.
#[must_use]
pub fn decode_tree(blob: &str, now: DateTime<Utc>) -> Forest {
    match serde_json::from_str::<Value>(blob) {
        Ok(Value::Array(items)) => normalize_roots(&items, now),
        Ok(other) => {
            tracing::warn!(kind = json_kind(&other), "stored task blob is not an array");
            Forest::new()
        }
        Err(err) => {
            tracing::warn!(error = %err, "stored task blob is not valid JSON");
            Forest::new()
        }
    }
}

/// Decode a history blob: an array of tree snapshots, oldest first.
///
/// Entries that are not arrays are dropped; each surviving entry is
/// normalized like a task-tree blob.
#[must_use]
pub fn decode_history(blob: &str, now: DateTime<Utc>) -> Vec<Forest> {
    match serde_json::from_str::<Value>(blob) {
        Ok(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| match entry {
                Value::Array(items) => Some(normalize_roots(items, now)),
                _ => None,
            })
            .collect(),
        Ok(_) | Err(_) => {
            tracing::warn!("stored history blob is malformed, starting with empty history");
            Vec::new()
        }
    }
}

/// Serialize a tree as nested records.
///
/// # Errors
///
/// Returns the serializer error; in practice this does not happen for
/// well-formed tasks.
pub fn encode_tree(tree: &Forest) -> serde_json::Result<String> {
    serde_json::to_string(tree)
}

/// Serialize history snapshots, oldest first.
///
/// # Errors
///
/// Returns the serializer error.
pub fn encode_history<'a, I>(snapshots: I) -> serde_json::Result<String>
where
    I: IntoIterator<Item = &'a Forest>,
{
    let entries: Vec<&Forest> = snapshots.into_iter().collect();
    serde_json::to_string(&entries)
}

fn normalize_roots(items: &[Value], now: DateTime<Utc>) -> Forest {
    let mut seen = HashSet::new();
    let roots: Forest = items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| normalize(item, 0, position, None, now, &mut seen))
        .collect();
    tree::reorder(&roots)
}

fn normalize(
    item: &Value,
    depth: usize,
    position: usize,
    parent_id: Option<&str>,
    now: DateTime<Utc>,
    seen: &mut HashSet<String>,
) -> Option<Task> {
    let Value::Object(raw) = item else {
        tracing::debug!(depth, "dropping non-object task record");
        return None;
    };

    let id = non_blank(raw, "id").map_or_else(|| restored_id(raw, parent_id, position), str::to_string);
    if !seen.insert(id.clone()) {
        tracing::debug!(task_id = %id, "dropping duplicate task record");
        return None;
    }

    let expected = Level::ALL.get(depth).copied().unwrap_or(Level::Action);
    let level = raw
        .get("level")
        .and_then(Value::as_str)
        .and_then(|text| text.parse::<Level>().ok());
    if level.is_some_and(|level| level != expected) {
        tracing::debug!(task_id = %id, depth, "coercing stored level to its depth");
    }

    let children = match (expected, raw.get("children")) {
        (Level::Action, _) | (_, None) => Forest::new(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .enumerate()
            .filter_map(|(position, child)| normalize(child, depth + 1, position, Some(&id), now, seen))
            .collect(),
        (_, Some(_)) => Forest::new(),
    };

    Some(Task {
        title: non_blank(raw, "title").unwrap_or(UNTITLED).to_string(),
        description: non_blank(raw, "description").map(str::to_string),
        completed: raw.get("completed").and_then(Value::as_bool).unwrap_or(false),
        level: expected,
        parent_id: parent_id.map(str::to_string),
        children,
        order: 0,
        created_at: timestamp(raw, "createdAt").unwrap_or(now),
        updated_at: timestamp(raw, "updatedAt"),
        id,
    })
}

// ---------------------------------------------------------------------------
// Remote documents
// ---------------------------------------------------------------------------

/// Decode one remote document into a flat record.
///
/// The document id wins over any `id` field in the body. Optional fields
/// that do not parse are treated as absent.
///
/// # Errors
///
/// Returns a [`RecordError`] when the body is not an object, has no id, no
/// string title, or an unknown level.
pub fn decode_record(doc_id: &str, data: &Value) -> Result<TaskRecord, RecordError> {
    let Value::Object(raw) = data else {
        return Err(RecordError::NotAnObject);
    };

    let id = if doc_id.trim().is_empty() {
        non_blank(raw, "id").ok_or(RecordError::MissingId)?
    } else {
        doc_id
    };
    let title = raw
        .get("title")
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField("title"))?;
    let level_text = raw
        .get("level")
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField("level"))?;
    let level = level_text
        .parse::<Level>()
        .map_err(|_| RecordError::BadLevel(level_text.to_string()))?;

    Ok(TaskRecord {
        id: id.to_string(),
        title: title.to_string(),
        description: non_blank(raw, "description").map(str::to_string),
        completed: raw.get("completed").and_then(Value::as_bool).unwrap_or(false),
        level,
        parent_id: non_blank(raw, "parentId").map(str::to_string),
        order: raw
            .get("order")
            .and_then(Value::as_u64)
            .and_then(|order| usize::try_from(order).ok()),
        created_at: timestamp(raw, "createdAt"),
        updated_at: timestamp(raw, "updatedAt"),
    })
}

/// Body of the remote document for `record`.
///
/// # Errors
///
/// Returns the serializer error.
pub fn encode_record(record: &TaskRecord) -> serde_json::Result<Value> {
    serde_json::to_value(record)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Id for a stored record that has none. Derived from where the record sits
/// and when it was created, so every decode of the same blob agrees.
fn restored_id(raw: &Map<String, Value>, parent_id: Option<&str>, position: usize) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let created = raw.get("createdAt").map(Value::to_string).unwrap_or_default();
    let key = format!("{}/{position}/{created}", parent_id.unwrap_or(""));
    let hash = key
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME));
    format!("task-{hash:016x}")
}

fn non_blank<'a>(raw: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn timestamp(raw: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    raw.get(key)
        .and_then(Value::as_str)
        .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok())
        .map(|at| at.with_timezone(&Utc))
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
