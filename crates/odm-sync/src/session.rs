//! Per-document mirror session.
//!
//! A session owns one remote document's replication state machine. Local
//! edits are published to the value feed after a short feedback cooldown
//! (instant perceived latency, no store traffic), and written to the store
//! as a minimal field-level patch after a longer phasing cooldown (respects
//! the store's sustained write-rate limits). The two throttles are keyed
//! independently per document, so sessions never contend with each other.
//!
//! A foreign write observed while one of our pushes is still outstanding is
//! reconciled by double-diffing: their change is computed against the
//! snapshot taken right before our push began, then replayed on top of the
//! document state we intended, their fields winning on overlap.

use crate::doc::{IdentityCodec, MirrorDoc, PayloadCodec, PushStamp};
use crate::error::SyncError;
use crate::feed::{ValueFeed, ValueStream};
use crate::store::{DocumentStore, RemoteEvent};
use odm_diff::{apply_patch, diff, diff_with_report, flatten, unflatten};
use odm_throttle::{Action, ActionResult, BoxFuture, ThrottleRegistry};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing configuration for a mirror session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Cooldown of the feedback throttle: how quickly local edits reach the
    /// value feed. Near-zero by default.
    pub feedback_cooldown: Duration,
    /// Cooldown of the phasing throttle: how quickly local edits are durably
    /// written to the store.
    pub phasing_cooldown: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            feedback_cooldown: Duration::from_millis(100),
            phasing_cooldown: Duration::from_secs(2),
        }
    }
}

/// Builder for session configuration.
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn feedback_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.feedback_cooldown = cooldown;
        self
    }

    pub fn phasing_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.phasing_cooldown = cooldown;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct MirrorState<T> {
    /// Local authoritative value; present from `open` on.
    latest: Option<T>,
    /// Last raw remote mapping observed (expanded shape).
    last_live: Option<Map<String, Value>>,
    /// Snapshot of `last_live` taken the instant a full push begins.
    last_live_before_push: Option<Map<String, Value>>,
    /// Stamp of our most recently issued push.
    push_stamp: Option<PushStamp>,
    /// Stamp of our most recent push confirmed applied.
    completed_push_stamp: Option<PushStamp>,
    mirroring: bool,
}

impl<T> Default for MirrorState<T> {
    fn default() -> Self {
        Self {
            latest: None,
            last_live: None,
            last_live_before_push: None,
            push_stamp: None,
            completed_push_stamp: None,
            mirroring: false,
        }
    }
}

/// Controller mirroring one remote document into a live local value.
///
/// Cloning a session is cheap; clones share the same underlying state.
pub struct MirrorSession<T: MirrorDoc, S: DocumentStore> {
    inner: Arc<Inner<T, S>>,
}

impl<T: MirrorDoc, S: DocumentStore> Clone for MirrorSession<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: MirrorDoc, S: DocumentStore> {
    path: String,
    store: Arc<S>,
    throttles: ThrottleRegistry,
    codec: Arc<dyn PayloadCodec>,
    config: SessionConfig,
    state: RwLock<MirrorState<T>>,
    feed: ValueFeed<T>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: MirrorDoc, S: DocumentStore> MirrorSession<T, S> {
    /// Create a session bound to `path` with an identity codec and its own
    /// throttle registry.
    pub fn new(path: impl Into<String>, store: Arc<S>, config: SessionConfig) -> Self {
        Self::with_collaborators(
            path,
            store,
            config,
            Arc::new(IdentityCodec),
            ThrottleRegistry::new(),
        )
    }

    /// Create a session with an explicit payload codec and throttle registry
    /// (the registry may be shared across sessions; keys are namespaced per
    /// document path).
    pub fn with_collaborators(
        path: impl Into<String>,
        store: Arc<S>,
        config: SessionConfig,
        codec: Arc<dyn PayloadCodec>,
        throttles: ThrottleRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                store,
                throttles,
                codec,
                config,
                state: RwLock::new(MirrorState::default()),
                feed: ValueFeed::new(16),
                listener: Mutex::new(None),
            }),
        }
    }

    /// The document path this session mirrors.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Begin mirroring: seed the local value from an empty mapping and start
    /// listening to the store's change feed. At most once per session; a
    /// second call warns and has no effect.
    pub async fn open(&self) {
        {
            let mut state = self.inner.state.write();
            if state.mirroring {
                warn!(path = %self.inner.path, "session already open");
                return;
            }
            state.mirroring = true;
            state.latest = Some(T::from_fields(&Map::new()));
        }
        let mut events = self.inner.store.subscribe(&self.inner.path).await;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                Arc::clone(&inner).on_remote_event(event).await;
            }
        });
        *self.inner.listener.lock() = Some(handle);
        debug!(path = %self.inner.path, "session opened");
    }

    /// Stop mirroring. Pending feedback and phasing work is flushed (not
    /// dropped) before the change feed is torn down and the value feed is
    /// closed. Closing a closed or never-opened session is a no-op.
    pub async fn close(&self) {
        let was_open = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut state.mirroring, false)
        };
        if !was_open {
            return;
        }
        self.inner.throttles.flush(&self.inner.feedback_key()).await;
        self.inner.throttles.flush(&self.inner.phasing_key()).await;
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        self.inner.feed.close();
        debug!(path = %self.inner.path, "session closed");
    }

    /// Push a new local value.
    ///
    /// With `force` the full push happens immediately, bypassing both
    /// throttles. Otherwise the push is feedback-throttled and this resolves
    /// when the trailing feedback fires. Pushing never fails the caller;
    /// store errors are logged on their way to eventual consistency. On a
    /// session that is not open (never opened, or already closed) this is a
    /// logged no-op.
    pub async fn push(&self, value: T, force: bool) {
        Arc::clone(&self.inner).push_value(value, force).await;
    }

    /// Mutate the current local value in place and push the result.
    ///
    /// On a session that is not open this is a logged no-op: the mutation is
    /// lost for this call, not queued.
    pub async fn push_with<F>(&self, mutator: F, force: bool)
    where
        F: FnOnce(&mut T),
    {
        let value = {
            let mut state = self.inner.state.write();
            if !state.mirroring {
                warn!(path = %self.inner.path, "session not open, dropping push");
                return;
            }
            match state.latest.as_mut() {
                None => {
                    warn!(path = %self.inner.path, "no local value yet, skipping push");
                    return;
                }
                Some(latest) => {
                    mutator(latest);
                    latest.clone()
                }
            }
        };
        self.push(value, force).await;
    }

    /// Current local value, if any.
    pub fn latest(&self) -> Option<T> {
        self.inner.state.read().latest.clone()
    }

    /// Current local value, or the first one to arrive on the feed.
    pub async fn wait_for_first(&self) -> Result<T, SyncError> {
        if let Some(value) = self.latest() {
            return Ok(value);
        }
        let mut stream = self.subscribe();
        stream.recv().await.ok_or(SyncError::Closed)
    }

    /// Subscribe to the live value feed (replays the latest value first).
    pub fn subscribe(&self) -> ValueStream<T> {
        self.inner.feed.subscribe()
    }
}

impl<T: MirrorDoc, S: DocumentStore> Inner<T, S> {
    fn feedback_key(&self) -> String {
        format!("feedback:{}", self.path)
    }

    fn phasing_key(&self) -> String {
        format!("phasing:{}", self.path)
    }

    async fn push_value(self: Arc<Self>, mut value: T, force: bool) {
        // Wall-clock millis, nudged monotonic so pushes issued within the
        // same millisecond still get distinct stamps.
        let mut stamp = chrono::Utc::now().timestamp_millis();
        {
            let mut state = self.state.write();
            if !state.mirroring {
                warn!(path = %self.path, "session not open, dropping push");
                return;
            }
            if let Some(prev) = state.push_stamp {
                if stamp <= prev {
                    stamp = prev + 1;
                }
            }
            value.record_push_stamp(stamp);
            if let Some(recorded) = value.push_stamp() {
                state.push_stamp = Some(recorded);
            }
        }

        if force {
            // Feedback still precedes persistence on the forced path.
            self.publish_feedback(&value);
            if let Err(e) = Arc::clone(&self).push_full(value).await {
                error!(path = %self.path, error = %e, "forced push failed");
            }
            return;
        }

        let inner = Arc::clone(&self);
        let action: Action = Box::new(move || -> BoxFuture<'static, ActionResult> {
            Box::pin(async move {
                inner.push_feedback(value).await;
                Ok(())
            })
        });
        self.throttles
            .run(&self.feedback_key(), self.config.feedback_cooldown, action)
            .await;
    }

    fn publish_feedback(&self, value: &T) {
        self.state.write().latest = Some(value.clone());
        self.feed.publish(value.clone());
    }

    /// Instant feedback: publish locally, then schedule the durable push.
    async fn push_feedback(self: Arc<Self>, value: T) {
        self.publish_feedback(&value);
        let inner = Arc::clone(&self);
        let action: Action = Box::new(move || -> BoxFuture<'static, ActionResult> {
            Box::pin(async move { inner.push_full(value).await.map_err(Into::into) })
        });
        // Scheduled, not awaited; completion is the phasing throttle's
        // business.
        drop(
            self.throttles
                .run(&self.phasing_key(), self.config.phasing_cooldown, action),
        );
    }

    /// Durable push: diff against the last remote snapshot and write the
    /// patch. Skipped with a warning when no snapshot exists yet.
    async fn push_full(self: Arc<Self>, value: T) -> Result<(), SyncError> {
        let baseline = {
            let mut state = self.state.write();
            match state.last_live.clone() {
                None => {
                    warn!(path = %self.path, "no remote snapshot yet, skipping full push");
                    return Ok(());
                }
                Some(live) => {
                    state.last_live_before_push = Some(live.clone());
                    live
                }
            }
        };

        let (patch, report) = diff_with_report(&baseline, &value.to_fields());
        if patch.is_empty() {
            debug!(path = %self.path, "nothing to push");
            return Ok(());
        }
        info!(
            path = %self.path,
            sets = report.adds + report.modifies,
            deletes = report.deletes,
            collapsed = report.collapsed_groups,
            efficiency = report.efficiency(),
            "pushing field-level update"
        );

        let patch = self.codec.compress(patch);
        self.store.update(&self.path, patch).await?;

        if let Some(stamp) = value.push_stamp() {
            self.state.write().completed_push_stamp = Some(stamp);
        }
        Ok(())
    }

    async fn on_remote_event(self: Arc<Self>, event: RemoteEvent) {
        let data = match event.data {
            Some(data) if event.exists => data,
            _ => {
                debug!(path = %self.path, "remote document missing, ignoring");
                return;
            }
        };
        let data = self.codec.expand(data);
        self.state.write().last_live = Some(data.clone());
        let observed = T::from_fields(&data);

        let foreign_during_push = match observed.push_stamp() {
            Some(stamp) => {
                let state = self.state.read();
                state.push_stamp > state.completed_push_stamp
                    && state.push_stamp != Some(stamp)
                    && state.completed_push_stamp != Some(stamp)
            }
            None => false,
        };

        if foreign_during_push {
            info!(path = %self.path, "foreign write raced an in-flight push, merging");
            let (before_push, our_future) = {
                let state = self.state.read();
                (
                    state.last_live_before_push.clone().unwrap_or_default(),
                    state
                        .latest
                        .as_ref()
                        .map(|value| value.to_fields())
                        .unwrap_or_default(),
                )
            };
            // Their change, expressed against the snapshot we took right
            // before our push began, replayed on top of what we intended.
            let their_diff = diff(&before_push, &data);
            let merged_flat = apply_patch(&flatten(&our_future), &their_diff);
            let merged = T::from_fields(&unflatten(&merged_flat));

            // A stale scheduled push must not fire with pre-merge data.
            self.throttles.cancel(&self.phasing_key());
            Arc::clone(&self).push_value(merged, true).await;

            // The observed value, not the merged one: the merged push's own
            // echo reconciles the feed.
            self.state.write().latest = Some(observed);
        } else {
            self.state.write().latest = Some(observed.clone());
            self.feed.publish(observed);
        }
    }
}
