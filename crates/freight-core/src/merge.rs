//! Cargo merge strategies.

use serde_json::Value;

use crate::types::{Cargo, MergeMode};

/// Fold `mutation` into `target` according to `mode`.
///
/// Only object mutations carry keys; any other value (including `null`)
/// leaves `target` untouched.
pub fn merge_into(target: &mut Cargo, mutation: &Value, mode: MergeMode) {
    let Value::Object(patch) = mutation else {
        return;
    };
    match mode {
        MergeMode::Shallow => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        MergeMode::Deep => deep_merge_map(target, patch),
    }
}

/// Return `base` with `mutation` folded in.
pub fn merged(base: &Cargo, mutation: &Value, mode: MergeMode) -> Cargo {
    let mut out = base.clone();
    merge_into(&mut out, mutation, mode);
    out
}

fn deep_merge_map(target: &mut Cargo, patch: &Cargo) {
    for (key, value) in patch {
        match target.get_mut(key) {
            Some(existing) => deep_merge_value(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn deep_merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => deep_merge_map(t, p),
        // Arrays merge position by position; extra patch elements are appended.
        (Value::Array(t), Value::Array(p)) => {
            for (i, item) in p.iter().enumerate() {
                match t.get_mut(i) {
                    Some(existing) => deep_merge_value(existing, item),
                    None => t.push(item.clone()),
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}
