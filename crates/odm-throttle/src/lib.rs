//! Keyed leaky throttling for deferred, coalesced async work.
//!
//! Each string key owns an independent cooldown window. The first call on an
//! idle key opens a window and parks its action; further calls inside the
//! window replace the parked action. When the cooldown elapses, the most
//! recently parked action executes exactly once (the guaranteed "leaky"
//! trailing execution) and every caller that landed in the window resolves.
//!
//! A window can also be flushed (execute the parked action now) or cancelled
//! (drop it without running). Either way parked callers resolve; nothing a
//! caller awaits can be left hanging.
//!
//! Action failures are caught at the callback boundary and logged; they are
//! never propagated to callers.

pub use futures::future::BoxFuture;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Result type produced by throttled actions.
pub type ActionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A deferred unit of work.
pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, ActionResult> + Send>;

struct KeyState {
    /// Ties the window to its timer; a stale timer finds a different epoch
    /// and backs off.
    epoch: u64,
    pending: Option<Action>,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Registry of per-key leaky throttles.
///
/// Cheaply cloneable; clones share the same keyed state. Scope one registry
/// per subsystem instead of holding a process-wide global so tests and
/// sessions stay independent.
#[derive(Clone, Default)]
pub struct ThrottleRegistry {
    keys: Arc<Mutex<HashMap<String, KeyState>>>,
    epochs: Arc<AtomicU64>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` under `key` with the given cooldown.
    ///
    /// The action (or a later replacement) runs when the key's current window
    /// elapses. The registration happens before this returns; the returned
    /// future resolves once the window's trailing action has executed (or the
    /// window was flushed or cancelled) and may be dropped by callers that do
    /// not care to wait.
    pub fn run(
        &self,
        key: &str,
        cooldown: Duration,
        action: Action,
    ) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut keys = self.keys.lock();
            match keys.get_mut(key) {
                Some(state) => {
                    debug!(key, "coalescing into open window");
                    state.pending = Some(action);
                    state.waiters.push(tx);
                }
                None => {
                    let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
                    debug!(key, ?cooldown, "opening window");
                    keys.insert(
                        key.to_string(),
                        KeyState {
                            epoch,
                            pending: Some(action),
                            waiters: vec![tx],
                        },
                    );
                    let registry = self.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(cooldown).await;
                        registry.fire(&key, epoch).await;
                    });
                }
            }
        }
        async move {
            let _ = rx.await;
        }
    }

    /// Execute the pending trailing action for `key` immediately, cancelling
    /// its timer. No-op for idle keys.
    pub async fn flush(&self, key: &str) {
        let state = self.keys.lock().remove(key);
        if let Some(state) = state {
            debug!(key, "flushing window");
            Self::execute(key, state).await;
        }
    }

    /// Drop the pending action for `key` without running it. Parked callers
    /// still resolve.
    pub fn cancel(&self, key: &str) {
        let state = self.keys.lock().remove(key);
        if let Some(state) = state {
            debug!(key, "cancelling window");
            for waiter in state.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// True if `key` currently has an open window.
    pub fn is_pending(&self, key: &str) -> bool {
        self.keys.lock().contains_key(key)
    }

    async fn fire(&self, key: &str, epoch: u64) {
        let state = {
            let mut keys = self.keys.lock();
            match keys.get(key) {
                Some(state) if state.epoch == epoch => keys.remove(key),
                _ => None,
            }
        };
        if let Some(state) = state {
            Self::execute(key, state).await;
        }
    }

    async fn execute(key: &str, state: KeyState) {
        if let Some(action) = state.pending {
            if let Err(e) = action().await {
                error!(key, error = %e, "throttled action failed");
            }
        }
        for waiter in state.waiters {
            let _ = waiter.send(());
        }
    }
}
