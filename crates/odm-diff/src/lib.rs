//! Flat-path differ for nested documents.
//!
//! Nested documents (string-keyed mappings whose values are scalars, lists or
//! further mappings) are flattened into dotted-path leaf mappings, and two
//! flattened snapshots are compared to produce a minimal field-level patch:
//! per-path replacements, per-path deletions, and collapsed group deletions
//! when every leaf under a parent disappears at once.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use odm_diff::{diff, FieldOp};
//!
//! let before = json!({"user": {"name": "ada", "age": 36}});
//! let after = json!({"user": {"name": "ada", "age": 37}});
//!
//! let patch = diff(before.as_object().unwrap(), after.as_object().unwrap());
//! assert_eq!(patch.len(), 1);
//! assert_eq!(patch.get("user.age"), Some(&FieldOp::Set(json!(37))));
//! ```

pub mod diff;
pub mod flatten;
pub mod patch;

pub use diff::{diff, diff_flat, diff_flat_with_report, diff_with_report, DiffReport};
pub use flatten::{flatten, unflatten, FlatDoc};
pub use patch::{apply_patch, FieldOp, Patch};
