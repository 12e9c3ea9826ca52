//! Hash-chain digests for the provenance DAG.
//!
//! These functions are the only producers of revision, edge, fan-out and
//! status digests. Each one hashes a canonical JSON document so the same
//! logical input always yields the same 64-char lowercase hex digest.

use crate::canonical::{canonical_value, to_canonical_bytes};
use crate::error::{CoreError, CoreResult};
use crate::hash::Digest;
use crate::time::Timestamp;
use serde_json::{Map, Value, json};
use std::path::Path;

/// Hash a YAML plan document
///
/// # Errors
///
/// `Io` if the file cannot be read, `Parse` if it is not valid YAML
pub fn plan_hash(path: impl AsRef<Path>) -> CoreResult<Digest> {
    yaml_file_hash(path.as_ref())
}

/// Hash a YAML design-of-experiments file
///
/// # Errors
///
/// `Io` if the file cannot be read, `Parse` if it is not valid YAML
pub fn design_hash(path: impl AsRef<Path>) -> CoreResult<Digest> {
    yaml_file_hash(path.as_ref())
}

/// Hash a YAML document held in memory
///
/// # Errors
///
/// `Parse` if the text is not valid YAML or has non-string keys
pub fn yaml_hash(text: &str) -> CoreResult<Digest> {
    let value: Value = serde_yaml::from_str(text)?;
    hash_canonical(&value)
}

fn yaml_file_hash(path: &Path) -> CoreResult<Digest> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    yaml_hash(&text)
}

/// Hash a task payload
///
/// # Errors
///
/// `Parse` if the payload is not a JSON object
pub fn payload_hash(payload: &Value) -> CoreResult<Digest> {
    match payload {
        Value::Object(map) => payload_map_hash(map),
        other => Err(CoreError::Parse {
            message: format!("payload must be a mapping, got {}", kind_of(other)),
        }),
    }
}

/// Hash a payload already known to be a mapping
///
/// # Errors
///
/// Never fails for well-formed maps; kept fallible for symmetry
pub fn payload_map_hash(map: &Map<String, Value>) -> CoreResult<Digest> {
    hash_canonical(map)
}

/// Revision digest chaining a payload onto its parent revision
#[must_use]
pub fn revision_hash(parent: Option<&Digest>, payload_hash: &Digest) -> Digest {
    let doc = json!({
        "parent": parent.map(Digest::to_hex),
        "payload": payload_hash.to_hex(),
    });
    digest_value(&doc)
}

/// Digest of one lineage edge
#[must_use]
pub fn edge_hash(
    parent_rev: &Digest,
    child_payload_hash: &Digest,
    operator_id: &str,
    branch_tag: Option<&str>,
) -> Digest {
    let doc = json!([
        parent_rev.to_hex(),
        child_payload_hash.to_hex(),
        operator_id,
        branch_tag,
    ]);
    digest_value(&doc)
}

/// Root digest of a fan-out; independent of edge order
#[must_use]
pub fn fanout_root_hash(edge_hashes: &[Digest]) -> Digest {
    let mut hexes: Vec<String> = edge_hashes.iter().map(Digest::to_hex).collect();
    hexes.sort_unstable();
    digest_value(&Value::from(hexes))
}

/// Content id of a binary artefact
#[must_use]
pub fn artefact_cid(bytes: &[u8]) -> Digest {
    Digest::compute(bytes)
}

/// Digest of one status transition
#[must_use]
pub fn status_hash(rev_hash: &Digest, status: &str, timestamp: &Timestamp) -> Digest {
    let doc = json!([rev_hash.to_hex(), status, timestamp.to_rfc3339()]);
    digest_value(&doc)
}

fn hash_canonical<T: serde::Serialize + ?Sized>(value: &T) -> CoreResult<Digest> {
    Ok(Digest::compute(&to_canonical_bytes(value)?))
}

fn digest_value(value: &Value) -> Digest {
    Digest::compute(canonical_value(value).as_bytes())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "mapping",
    }
}
