//! End-to-end mirroring scenarios against the in-memory store.

use odm_sync::{
    MemoryStore, MirrorDoc, MirrorSession, Patch, PayloadCodec, PushStamp, SessionConfig,
    ThrottleRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Counter {
    n: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    m: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_push: Option<i64>,
}

impl MirrorDoc for Counter {
    fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    fn from_fields(fields: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(fields.clone())).unwrap_or_default()
    }

    fn push_stamp(&self) -> Option<PushStamp> {
        self.last_push
    }

    fn record_push_stamp(&mut self, stamp: PushStamp) {
        self.last_push = Some(stamp);
    }
}

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn config(feedback_ms: u64, phasing_ms: u64) -> SessionConfig {
    SessionConfig {
        feedback_cooldown: Duration::from_millis(feedback_ms),
        phasing_cooldown: Duration::from_millis(phasing_ms),
    }
}

/// Let the session's listener task drain queued store events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn feedback_reaches_the_feed_before_any_store_write() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 5}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(50, 2_000));
    session.open().await;

    let mut stream = session.subscribe();
    assert_eq!(stream.recv().await.map(|c| c.n), Some(5));

    session.push_with(|c| c.n = 6, false).await;

    // The feed saw the edit, the store did not.
    assert_eq!(stream.recv().await.map(|c| c.n), Some(6));
    assert_eq!(store.writes(), 0);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(store.writes(), 1);
    assert_eq!(store.document("docs/a").unwrap()["n"], json!(6));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn rapid_pushes_coalesce_into_one_store_write() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 0}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(50, 500));
    session.open().await;
    settle().await;

    tokio::join!(
        session.push_with(|c| c.n = 1, false),
        session.push_with(|c| c.n = 2, false),
        session.push_with(|c| c.n = 3, false),
    );

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(store.writes(), 1);
    assert_eq!(store.document("docs/a").unwrap()["n"], json!(3));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn foreign_write_during_in_flight_push_is_double_diff_merged() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 5}))).await;

    // Phasing long enough that the second push stays outstanding.
    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 60_000));
    session.open().await;
    settle().await;

    // A completed forced push establishes the pre-push snapshot and the
    // completed stamp.
    let seeded = session.latest().unwrap();
    session.push(seeded, true).await;
    settle().await;
    assert_eq!(store.writes(), 1);

    // Our edit: n = 6. Pushing resolves once feedback has fired, leaving the
    // full push parked in the phasing window, far in the future.
    session.push_with(|c| c.n = 6, false).await;
    settle().await;
    assert_eq!(store.writes(), 1);

    // Foreign writer, based on the old remote state, adds m = 1.
    store
        .put("docs/a", obj(json!({"n": 5, "m": 1, "last_push": 999})))
        .await;
    settle().await;

    // Merged push: ours preserved (n = 6), theirs applied on top (m = 1).
    let doc = store.document("docs/a").unwrap();
    assert_eq!(doc["n"], json!(6));
    assert_eq!(doc["m"], json!(1));
    assert_eq!(store.writes(), 2);

    // The cancelled phasing window must never fire a stale push.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(store.writes(), 2);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_flushes_pending_work_instead_of_dropping_it() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 0}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10_000, 10_000));
    session.open().await;
    settle().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.push_with(|c| c.n = 9, false).await })
    };
    settle().await;
    assert_eq!(store.writes(), 0);

    session.close().await;
    pending.await.unwrap();

    assert_eq!(store.writes(), 1);
    assert_eq!(store.document("docs/a").unwrap()["n"], json!(9));
}

#[tokio::test(start_paused = true)]
async fn unopened_session_push_is_a_silent_no_op() {
    let store = Arc::new(MemoryStore::new());
    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 10));

    session.push_with(|c| c.n = 1, false).await;

    assert_eq!(store.writes(), 0);
    assert!(session.latest().is_none());
}

#[tokio::test(start_paused = true)]
async fn push_without_remote_snapshot_skips_the_store_write() {
    let store = Arc::new(MemoryStore::new());
    // No document at the path: the snapshot event reports absent, so the
    // session never has a diff baseline.
    let session =
        MirrorSession::<Counter, _>::new("docs/ghost", Arc::clone(&store), config(10, 20));
    session.open().await;
    settle().await;

    session.push_with(|c| c.n = 1, false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.writes(), 0);
    // The local edit still went through the feed.
    assert_eq!(session.latest().map(|c| c.n), Some(1));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn own_echo_is_published_without_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 1}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 20));
    session.open().await;

    let mut stream = session.subscribe();
    assert_eq!(stream.recv().await.map(|c| c.n), Some(1));

    session.push_with(|c| c.n = 2, false).await;
    assert_eq!(stream.recv().await.map(|c| c.n), Some(2));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.writes(), 1);

    // The echo of our own write comes back stamped with our stamp and is
    // published as-is; no further writes happen.
    let echoed = stream.recv().await.unwrap();
    assert_eq!(echoed.n, 2);
    assert!(echoed.last_push.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.writes(), 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn late_subscribers_get_the_latest_value_replayed() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 4}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 20));
    session.open().await;
    settle().await;

    let mut late = session.subscribe();
    assert_eq!(late.recv().await.map(|c| c.n), Some(4));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn sessions_on_different_documents_do_not_contend() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 0}))).await;
    store.put("docs/b", obj(json!({"n": 0}))).await;

    let a = MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 50));
    let b = MirrorSession::<Counter, _>::new("docs/b", Arc::clone(&store), config(10, 50));
    a.open().await;
    b.open().await;
    settle().await;

    tokio::join!(
        a.push_with(|c| c.n = 1, false),
        b.push_with(|c| c.n = 2, false),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.document("docs/a").unwrap()["n"], json!(1));
    assert_eq!(store.document("docs/b").unwrap()["n"], json!(2));
    assert_eq!(store.writes(), 2);

    a.close().await;
    b.close().await;
}

#[tokio::test(start_paused = true)]
async fn closed_session_drops_pushes() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 5}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 20));
    session.open().await;
    settle().await;
    session.close().await;
    assert_eq!(store.writes(), 0);

    // Neither the throttled nor the forced path may touch the store again.
    session.push_with(|c| c.n = 42, false).await;
    session.push(Counter { n: 42, ..Counter::default() }, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.writes(), 0);
    assert_eq!(session.latest().map(|c| c.n), Some(5));
    assert_eq!(store.document("docs/a").unwrap()["n"], json!(5));
}

/// Packs every path segment behind an `x_` prefix on the way out and strips
/// it on the way in, so the stored shape differs from what sessions see.
struct PrefixCodec;

fn strip_key_prefix(fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| {
            let key = key.strip_prefix("x_").map(str::to_string).unwrap_or(key);
            let value = match value {
                Value::Object(inner) => Value::Object(strip_key_prefix(inner)),
                other => other,
            };
            (key, value)
        })
        .collect()
}

impl PayloadCodec for PrefixCodec {
    fn compress(&self, patch: Patch) -> Patch {
        patch
            .into_iter()
            .map(|(path, op)| {
                let packed = path
                    .split('.')
                    .map(|segment| format!("x_{segment}"))
                    .collect::<Vec<_>>()
                    .join(".");
                (packed, op)
            })
            .collect()
    }

    fn expand(&self, fields: Map<String, Value>) -> Map<String, Value> {
        strip_key_prefix(fields)
    }
}

#[tokio::test(start_paused = true)]
async fn codec_is_transparent_to_diffing() {
    let store = Arc::new(MemoryStore::new());
    // The store holds the packed shape; the session only ever sees it
    // expanded.
    store.put("docs/a", obj(json!({"x_n": 5}))).await;

    let session = MirrorSession::<Counter, _>::with_collaborators(
        "docs/a",
        Arc::clone(&store),
        config(10, 20),
        Arc::new(PrefixCodec),
        ThrottleRegistry::new(),
    );
    session.open().await;
    settle().await;
    assert_eq!(session.latest().map(|c| c.n), Some(5));

    session.push_with(|c| c.n = 6, false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.writes(), 1);

    // The patch was diffed on the expanded shape and written out packed.
    let doc = store.document("docs/a").unwrap();
    assert_eq!(doc["x_n"], json!(6));
    assert!(doc.contains_key("x_last_push"));
    assert!(!doc.contains_key("n"));

    // The echo came back expanded and was recognized as our own; no
    // reconciliation write follows.
    assert_eq!(session.latest().map(|c| c.n), Some(6));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.writes(), 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_remote_document_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    store.put("docs/a", obj(json!({"n": 3}))).await;

    let session =
        MirrorSession::<Counter, _>::new("docs/a", Arc::clone(&store), config(10, 20));
    session.open().await;
    settle().await;
    assert_eq!(session.latest().map(|c| c.n), Some(3));

    store.remove("docs/a").await;
    settle().await;

    // Session keeps its last known local value.
    assert_eq!(session.latest().map(|c| c.n), Some(3));

    session.close().await;
}
