//! Minimal patch computation between two flattened snapshots.
//!
//! The patch is built in four passes over the flattened inputs:
//!
//! 1. paths in `before`: changed value -> replacement, missing -> deletion,
//!    remembering the deleted path's parent group,
//! 2. remembered groups with no surviving leaf in `after` collapse their
//!    individual leaf deletions into a single group deletion,
//! 3. paths only in `after` -> additions,
//! 4. empty or whitespace-only paths are dropped.

use crate::flatten::{flatten, FlatDoc};
use crate::patch::{FieldOp, Patch};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

/// Telemetry for one diff computation. Observability only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DiffReport {
    /// Paths present only in `after`.
    pub adds: usize,
    /// Paths present in both with differing values.
    pub modifies: usize,
    /// Deletions in the final patch; a collapsed group counts once.
    pub deletes: usize,
    /// Groups whose leaf deletions were collapsed into one.
    pub collapsed_groups: usize,
    /// Leaf count of the flattened `before` snapshot.
    pub before_leaves: usize,
    /// Leaf count of the flattened `after` snapshot.
    pub after_leaves: usize,
}

impl DiffReport {
    /// Fraction of fields left untouched: `1 - |patch| / max(|before|, |after|)`.
    pub fn efficiency(&self) -> f64 {
        let span = self.before_leaves.max(self.after_leaves);
        if span == 0 {
            return 1.0;
        }
        let ops = self.adds + self.modifies + self.deletes;
        1.0 - ops as f64 / span as f64
    }
}

/// Diff two nested mappings. See [`diff_flat`].
pub fn diff(before: &Map<String, Value>, after: &Map<String, Value>) -> Patch {
    diff_with_report(before, after).0
}

/// Diff two nested mappings, also returning telemetry.
pub fn diff_with_report(
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) -> (Patch, DiffReport) {
    diff_flat_with_report(&flatten(before), &flatten(after))
}

/// Diff two flattened snapshots into a minimal field-level patch.
pub fn diff_flat(before: &FlatDoc, after: &FlatDoc) -> Patch {
    diff_flat_with_report(before, after).0
}

/// Diff two flattened snapshots, also returning telemetry.
pub fn diff_flat_with_report(before: &FlatDoc, after: &FlatDoc) -> (Patch, DiffReport) {
    let mut patch = Patch::new();
    let mut removal_check = BTreeSet::new();

    for (path, old) in before {
        match after.get(path) {
            Some(new) if new != old => {
                debug!(path, "field modified");
                patch.insert(path.clone(), FieldOp::Set(new.clone()));
            }
            Some(_) => {}
            None => {
                debug!(path, "field deleted");
                patch.insert(path.clone(), FieldOp::Delete);
                if let Some((group, _)) = path.rsplit_once('.') {
                    removal_check.insert(group.to_string());
                }
            }
        }
    }

    let mut collapsed_groups = 0;
    for group in &removal_check {
        let prefix = format!("{group}.");
        let survives = after.keys().any(|path| path.starts_with(&prefix));
        if !survives {
            debug!(group, "group collapsed into single deletion");
            patch.retain(|path, op| !(*op == FieldOp::Delete && path.starts_with(&prefix)));
            patch.insert(group.clone(), FieldOp::Delete);
            collapsed_groups += 1;
        }
    }

    for (path, value) in after {
        if !before.contains_key(path) {
            debug!(path, "field added");
            patch.insert(path.clone(), FieldOp::Set(value.clone()));
        }
    }

    patch.retain(|path, _| !path.trim().is_empty());

    let mut report = DiffReport {
        collapsed_groups,
        before_leaves: before.len(),
        after_leaves: after.len(),
        ..DiffReport::default()
    };
    for (path, op) in &patch {
        match op {
            FieldOp::Set(_) if before.contains_key(path) => report.modifies += 1,
            FieldOp::Set(_) => report.adds += 1,
            FieldOp::Delete => report.deletes += 1,
        }
    }

    (patch, report)
}
