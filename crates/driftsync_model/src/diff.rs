//! Field-level payload diff and merge.

use crate::error::{ModelError, ModelResult};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

fn as_object(value: &Value) -> ModelResult<&Map<String, Value>> {
    value.as_object().ok_or(ModelError::PayloadNotObject)
}

/// Returns the field names whose values differ between two payloads.
///
/// The result covers fields present in either payload and is sorted, so the
/// same pair of payloads always yields the same sequence.
pub fn changed_fields(a: &Value, b: &Value) -> ModelResult<Vec<String>> {
    let a = as_object(a)?;
    let b = as_object(b)?;

    let mut fields = BTreeSet::new();
    for (key, value) in a {
        if b.get(key) != Some(value) {
            fields.insert(key.clone());
        }
    }
    for key in b.keys() {
        if !a.contains_key(key) {
            fields.insert(key.clone());
        }
    }
    Ok(fields.into_iter().collect())
}

/// Merges two payloads with disjoint change sets.
///
/// The merged payload takes the local value for every field in
/// `local_changed` (including local deletions of a field) and the remote
/// value for all others.
pub fn merge_payloads(
    local: &Value,
    remote: &Value,
    local_changed: &[String],
) -> ModelResult<Value> {
    let local = as_object(local)?;
    let mut merged = as_object(remote)?.clone();

    for field in local_changed {
        match local.get(field) {
            Some(value) => {
                merged.insert(field.clone(), value.clone());
            }
            None => {
                merged.remove(field);
            }
        }
    }
    Ok(Value::Object(merged))
}
