//! Path-addressed extraction over untyped JSON bodies
//!
//! Sync envelopes and endpoint responses are held as [`serde_json::Value`]
//! and never deserialized into fixed structs: the server is allowed to grow
//! its response shape without breaking the harness. Fields the harness does
//! depend on are pulled out with dotted lookup paths, e.g.
//! `rooms.join.<room id>.timeline.events`.
//!
//! Room IDs contain `.` (and may contain `*`), so any identifier embedded in
//! a path must be escaped with [`escape_key`] first. A backslash in a path
//! makes the following character literal. Paths address object keys only;
//! arrays are iterated by the caller, not indexed from the path.

use serde_json::Value;

use crate::error::{Error, Result};

/// Largest body/element dump carried inside an error or failure message.
const SNIPPET_MAX: usize = 1024;

/// Escapes `.` and `*` in `key` so it can be embedded in a lookup path.
///
/// This is a hard requirement for room IDs: `!foo.bar:server` addresses the
/// nested key `bar:server` unless escaped.
pub fn escape_key(key: &str) -> String {
    key.replace('.', "\\.").replace('*', "\\*")
}

/// Splits a lookup path into segments, honouring backslash escapes.
fn path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '.' => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

/// Resolves a dotted lookup path against a JSON value.
///
/// Returns `None` as soon as a segment is missing or the value under
/// traversal is not an object.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path_segments(path) {
        current = current.as_object()?.get(&segment)?;
    }
    Some(current)
}

/// Extracts the non-empty string under `key`.
///
/// Absence and presence-with-the-wrong-shape are distinct failures: a body of
/// `{}` yields [`Error::MissingField`] while `{"next_batch": 5}` yields
/// [`Error::WrongFieldType`]. An empty string is treated as wrong-shaped too,
/// since no Matrix field the harness reads is meaningfully empty.
pub fn field_str(body: &Value, key: &str) -> Result<String> {
    let value = lookup(body, key).ok_or_else(|| Error::MissingField {
        key: key.to_owned(),
        body: snippet(&body.to_string()),
    })?;
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_owned()),
        _ => Err(Error::WrongFieldType {
            key: key.to_owned(),
            expected: "string",
            body: snippet(&body.to_string()),
        }),
    }
}

/// Extracts the array under `key`, projected to strings.
///
/// The container is checked strictly (absent and non-array are errors), but
/// the projection is permissive: a non-string element becomes an empty
/// string rather than failing the whole extraction.
pub fn field_str_array(body: &Value, key: &str) -> Result<Vec<String>> {
    let value = lookup(body, key).ok_or_else(|| Error::MissingField {
        key: key.to_owned(),
        body: snippet(&body.to_string()),
    })?;
    let arr = value.as_array().ok_or_else(|| Error::WrongFieldType {
        key: key.to_owned(),
        expected: "array",
        body: snippet(&body.to_string()),
    })?;
    Ok(arr
        .iter()
        .map(|v| v.as_str().unwrap_or("").to_owned())
        .collect())
}

/// Permissive string read at a lookup path, for use inside event checks.
///
/// Absent keys and non-string values yield `""`, which never equals a real
/// identifier, so membership checks can compare directly without unwrapping.
pub fn str_at<'a>(value: &'a Value, path: &str) -> &'a str {
    lookup(value, path).and_then(Value::as_str).unwrap_or("")
}

/// Truncates `s` for inclusion in diagnostics.
pub(crate) fn snippet(s: &str) -> String {
    if s.len() <= SNIPPET_MAX {
        return s.to_owned();
    }
    let mut end = SNIPPET_MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
