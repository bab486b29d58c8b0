//! Document conversion and capability traits.

use odm_diff::Patch;
use serde_json::{Map, Value};

/// Millisecond wall-clock marker identifying a session's own pushes.
///
/// Not a vector clock: it only distinguishes "an echo of our own write" from
/// "a genuine foreign write" in the remote change feed.
pub type PushStamp = i64;

/// Conversion between an application value and its nested field mapping,
/// plus the optional push-history capability.
///
/// `from_fields` of an empty mapping must produce a valid default instance;
/// `to_fields` followed by `from_fields` must round-trip the value.
///
/// Types that support history keep their last push stamp inside the value
/// (and therefore inside the serialized fields, so it travels through the
/// store and comes back in remote echoes). Types without history leave the
/// two stamp methods at their defaults and never trigger conflict
/// reconciliation.
pub trait MirrorDoc: Clone + Send + Sync + 'static {
    fn to_fields(&self) -> Map<String, Value>;

    fn from_fields(fields: &Map<String, Value>) -> Self;

    /// Last-push marker carried by this value, if the type supports history.
    fn push_stamp(&self) -> Option<PushStamp> {
        None
    }

    /// Record a new push marker. No-op for types without history support.
    fn record_push_stamp(&mut self, _stamp: PushStamp) {}
}

/// Reversible transform applied to payloads crossing the store boundary.
///
/// `compress` sees outgoing patches (flat path -> op mappings); `expand`
/// sees incoming nested snapshots. The differ always operates on the
/// expanded shape, so the codec is transparent to diff computation.
pub trait PayloadCodec: Send + Sync + 'static {
    fn compress(&self, patch: Patch) -> Patch;

    fn expand(&self, fields: Map<String, Value>) -> Map<String, Value>;
}

/// Codec that passes payloads through unchanged.
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {
    fn compress(&self, patch: Patch) -> Patch {
        patch
    }

    fn expand(&self, fields: Map<String, Value>) -> Map<String, Value> {
        fields
    }
}
