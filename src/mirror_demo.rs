use odm_sync::{MemoryStore, MirrorDoc, MirrorSession, PushStamp, SessionConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statistics collected while driving a mirror session
#[derive(Clone, Debug)]
pub struct MirrorDemoStats {
    pub documents: usize,
    pub local_edits: usize,
    pub store_writes: u64,
    pub total_time: Duration,
}

impl MirrorDemoStats {
    pub fn print(&self) {
        let amplification = self.store_writes as f64 / self.local_edits.max(1) as f64;
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Mirror Demo Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Documents:                 {:>30} ║", self.documents);
        println!("║  Local Edits:               {:>30} ║", self.local_edits);
        println!("║  Store Writes:              {:>30} ║", self.store_writes);
        println!(
            "║  Writes per Edit:           {:>30} ║",
            format!("{:.3}", amplification)
        );
        println!(
            "║  Total Time:                {:>29}s ║",
            format!("{:.3}", self.total_time.as_secs_f64())
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scoreboard {
    pub player: String,
    pub score: i64,
    pub streak: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_push: Option<i64>,
}

impl MirrorDoc for Scoreboard {
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

fn demo_config() -> SessionConfig {
    SessionConfig {
        feedback_cooldown: Duration::from_millis(20),
        phasing_cooldown: Duration::from_millis(300),
    }
}

fn seed(player: &str) -> Map<String, Value> {
    json!({"player": player, "score": 0, "streak": 0})
        .as_object()
        .cloned()
        .unwrap_or_default()
}

/// Burst of rapid local edits against one document: the feedback throttle
/// keeps the stream instant while the phasing throttle collapses the burst
/// into very few store writes.
pub async fn demo_rapid_edits(edits: usize) -> MirrorDemoStats {
    let store = Arc::new(MemoryStore::new());
    store.put("boards/alice", seed("alice")).await;

    let session = MirrorSession::<Scoreboard, _>::new(
        "boards/alice",
        Arc::clone(&store),
        demo_config(),
    );
    session.open().await;

    let mut rng = StdRng::from_entropy();
    let start = Instant::now();
    for _ in 0..edits {
        let bump = rng.gen_range(1..10);
        session
            .push_with(
                |board| {
                    board.score += bump;
                    board.streak += 1;
                },
                false,
            )
            .await;
    }

    // Let the trailing phasing window drain.
    tokio::time::sleep(Duration::from_millis(400)).await;
    session.close().await;

    MirrorDemoStats {
        documents: 1,
        local_edits: edits,
        store_writes: store.writes(),
        total_time: start.elapsed(),
    }
}

/// Sessions on different documents share a store but never contend: each
/// document has its own pair of throttle keys.
pub async fn demo_many_documents(documents: usize, edits_per_doc: usize) -> MirrorDemoStats {
    let store = Arc::new(MemoryStore::new());
    let start = Instant::now();

    let mut handles = Vec::new();
    for i in 0..documents {
        let path = format!("boards/player-{i}");
        store.put(&path, seed(&format!("player-{i}"))).await;
        let session =
            MirrorSession::<Scoreboard, _>::new(path, Arc::clone(&store), demo_config());
        handles.push(tokio::spawn(async move {
            session.open().await;
            for _ in 0..edits_per_doc {
                session.push_with(|board| board.score += 1, false).await;
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            session.close().await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    MirrorDemoStats {
        documents,
        local_edits: documents * edits_per_doc,
        store_writes: store.writes(),
        total_time: start.elapsed(),
    }
}

/// A foreign write racing an in-flight push: the session double-diffs the
/// remote change and replays it on top of its own intended state.
pub async fn demo_conflict_merge() {
    let store = Arc::new(MemoryStore::new());
    store.put("boards/shared", seed("shared")).await;

    let session = MirrorSession::<Scoreboard, _>::new(
        "boards/shared",
        Arc::clone(&store),
        SessionConfig {
            feedback_cooldown: Duration::from_millis(10),
            phasing_cooldown: Duration::from_secs(30),
        },
    );
    session.open().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Establish a completed push, then leave a second one outstanding.
    if let Some(board) = session.latest() {
        session.push(board, true).await;
    }
    session.push_with(|board| board.score = 10, false).await;

    // Foreign writer, unaware of the outstanding push, bumps the streak.
    store
        .put(
            "boards/shared",
            json!({"player": "shared", "score": 0, "streak": 7, "last_push": 1})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let merged = store.document("boards/shared").unwrap_or_default();
    println!("  merged document: {}", Value::Object(merged.clone()));
    println!(
        "  ours kept (score={}), theirs applied (streak={})",
        merged.get("score").cloned().unwrap_or(Value::Null),
        merged.get("streak").cloned().unwrap_or(Value::Null),
    );

    session.close().await;
}
