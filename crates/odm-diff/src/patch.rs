//! Field-level patch operations.

use crate::flatten::FlatDoc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single operation against one dotted document path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    /// Replace or create the value at the path.
    Set(Value),
    /// Remove the path; removing a group path removes every leaf beneath it.
    Delete,
}

/// A sparse field-level update: dotted path to operation.
///
/// Applying a patch to the flattened "before" snapshot it was computed from
/// yields the flattened "after" snapshot, field for field.
pub type Patch = BTreeMap<String, FieldOp>;

/// Apply a patch to a flattened document, field-level update semantics:
/// paths not named by the patch are left untouched.
pub fn apply_patch(flat: &FlatDoc, patch: &Patch) -> FlatDoc {
    let mut out = flat.clone();
    for (path, op) in patch {
        // Either way the path's old subtree is gone: setting a value at a
        // path replaces whatever group used to live there.
        let prefix = format!("{path}.");
        out.retain(|leaf, _| !leaf.starts_with(&prefix));
        match op {
            FieldOp::Set(value) => {
                out.insert(path.clone(), value.clone());
            }
            FieldOp::Delete => {
                out.remove(path);
            }
        }
    }
    out
}
