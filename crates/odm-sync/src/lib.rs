//! Optimistic document mirror.
//!
//! Keeps a local, optimistically-updated view of one remote structured
//! document in step with an abstract key-path document store, minimizing
//! write volume with field-level patches and two independent leaky throttles
//! (near-instant local feedback, slower durable writes), and merging foreign
//! writes that race an in-flight push via double-diffing.
//!
//! Modules:
//!
//! - [`session`] - the per-document mirror controller
//! - [`store`] - the abstract document store contract and an in-memory store
//! - [`doc`] - document conversion and capability traits
//! - [`feed`] - replay-latest broadcast of the session's current value
//! - [`error`] - error types

pub mod doc;
pub mod error;
pub mod feed;
pub mod session;
pub mod store;

pub use doc::{IdentityCodec, MirrorDoc, PayloadCodec, PushStamp};
pub use error::{Result, SyncError};
pub use feed::{ValueFeed, ValueStream};
pub use session::{MirrorSession, SessionConfig, SessionConfigBuilder};
pub use store::{DocumentStore, MemoryStore, RemoteEvent, StoreError};

// Vocabulary types appearing in the public trait signatures.
pub use odm_diff::{FieldOp, Patch};
pub use odm_throttle::ThrottleRegistry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::doc::{MirrorDoc, PayloadCodec};
    pub use crate::error::SyncError;
    pub use crate::session::{MirrorSession, SessionConfig};
    pub use crate::store::{DocumentStore, MemoryStore, RemoteEvent};
}
