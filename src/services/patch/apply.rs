//! Server-side patch semantics for unstructured objects
//!
//! - JSON patch (RFC 6902) operations `add`, `remove`, `replace`, `move`, `copy`, `test`
//! - JSON merge patch (RFC 7386)
//! - Strategic merge patch: a merge patch where lists of objects are merged by
//!   their `name` key and `$patch: delete` removes an entry

use serde_json::{Map, Value};

use crate::domain::error::PatchError;
use crate::domain::models::PatchType;

const MERGE_KEY: &str = "name";
const DIRECTIVE: &str = "$patch";

/// Applies the encoded patch to a copy of `target`
pub fn apply_patch(target: &Value, patch_type: PatchType, data: &str) -> Result<Value, PatchError> {
    let apply_error = |message: String| PatchError::Apply {
        patch_type: patch_type.as_str().to_string(),
        message,
    };
    let patch: Value = serde_json::from_str(data).map_err(|e| apply_error(e.to_string()))?;

    let mut result = target.clone();
    match patch_type {
        PatchType::Json => {
            let ops = patch
                .as_array()
                .ok_or_else(|| apply_error("patch must be an array of operations".to_string()))?;
            json_patch(&mut result, ops).map_err(apply_error)?;
        }
        PatchType::Merge => merge_patch(&mut result, &patch),
        PatchType::Strategic => {
            match patch {
                Value::Null => {}
                Value::Object(_) => strategic_merge(&mut result, &patch),
                _ => return Err(apply_error("patch must be an object".to_string())),
            }
        }
    }
    Ok(result)
}

/// RFC 7386 merge: objects merge recursively, `null` deletes, everything else replaces
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Merge patch that merges lists of named objects element-wise
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if patch.get(DIRECTIVE).and_then(Value::as_str) == Some("replace") {
        let mut replacement = patch.clone();
        replacement.remove(DIRECTIVE);
        *target = Value::Object(replacement);
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };

    for (key, value) in patch {
        if key == DIRECTIVE {
            continue;
        }
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Array(items) if is_named_list(items) => {
                let existing = target.entry(key.clone()).or_insert_with(|| Value::Array(Vec::new()));
                if !existing.is_array() {
                    *existing = Value::Array(Vec::new());
                }
                if let Value::Array(current) = existing {
                    merge_named_list(current, items);
                }
            }
            Value::Object(_) => {
                strategic_merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|item| item.get(MERGE_KEY).is_some_and(Value::is_string))
}

fn merge_named_list(current: &mut Vec<Value>, patch: &[Value]) {
    for item in patch {
        let name = item.get(MERGE_KEY);
        let position = current.iter().position(|c| c.get(MERGE_KEY) == name);
        let delete = item.get(DIRECTIVE).and_then(Value::as_str) == Some("delete");
        match (position, delete) {
            (Some(i), true) => {
                current.remove(i);
            }
            (None, true) => {}
            (Some(i), false) => strategic_merge(&mut current[i], item),
            (None, false) => {
                let mut added = Value::Null;
                strategic_merge(&mut added, item);
                current.push(added);
            }
        }
    }
}

/// Applies RFC 6902 operations in order; the target is left untouched on failure
pub fn json_patch(target: &mut Value, ops: &[Value]) -> Result<(), String> {
    let mut working = target.clone();
    for op in ops {
        let kind = op
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| "operation is missing \"op\"".to_string())?;
        let path = op
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{kind} operation is missing \"path\""))?;
        let value = || {
            op.get("value")
                .cloned()
                .ok_or_else(|| format!("{kind} operation is missing \"value\""))
        };
        let from = || {
            op.get("from")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{kind} operation is missing \"from\""))
        };

        match kind {
            "add" => add(&mut working, path, value()?)?,
            "remove" => {
                remove(&mut working, path)?;
            }
            "replace" => {
                remove(&mut working, path)?;
                add(&mut working, path, value()?)?;
            }
            "move" => {
                let from = from()?;
                if path.starts_with(&format!("{from}/")) {
                    return Err(format!("cannot move {from} into its own child {path}"));
                }
                let moved = remove(&mut working, from)?;
                add(&mut working, path, moved)?;
            }
            "copy" => {
                let from = from()?;
                let copied = working
                    .pointer(from)
                    .cloned()
                    .ok_or_else(|| format!("path {from} does not exist"))?;
                add(&mut working, path, copied)?;
            }
            "test" => {
                if working.pointer(path) != Some(&value()?) {
                    return Err(format!("test failed for path {path}"));
                }
            }
            other => return Err(format!("unknown operation {other:?}")),
        }
    }
    *target = working;
    Ok(())
}

fn split_pointer(path: &str) -> Result<(&str, String), String> {
    if path.is_empty() {
        return Ok(("", String::new()));
    }
    let (parent, last) = path
        .rsplit_once('/')
        .ok_or_else(|| format!("invalid path {path:?}"))?;
    Ok((parent, last.replace("~1", "/").replace("~0", "~")))
}

fn add(target: &mut Value, path: &str, value: Value) -> Result<(), String> {
    if path.is_empty() {
        *target = value;
        return Ok(());
    }
    let (parent, key) = split_pointer(path)?;
    let container = target
        .pointer_mut(parent)
        .ok_or_else(|| format!("path {parent} does not exist"))?;
    match container {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = key.parse().map_err(|_| format!("invalid array index {key:?}"))?;
            if index > items.len() {
                return Err(format!("array index {index} out of bounds"));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(format!("path {parent} is not a container")),
    }
}

fn remove(target: &mut Value, path: &str) -> Result<Value, String> {
    let (parent, key) = split_pointer(path)?;
    let container = target
        .pointer_mut(parent)
        .ok_or_else(|| format!("path {parent} does not exist"))?;
    match container {
        Value::Object(map) => map
            .remove(&key)
            .ok_or_else(|| format!("path {path} does not exist")),
        Value::Array(items) => {
            let index: usize = key.parse().map_err(|_| format!("invalid array index {key:?}"))?;
            if index >= items.len() {
                return Err(format!("array index {index} out of bounds"));
            }
            Ok(items.remove(index))
        }
        _ => Err(format!("path {parent} is not a container")),
    }
}
