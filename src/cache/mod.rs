//! Call-Caching Index (spec.md §4.C)
//!
//! A content-addressable lookaside on top of the Call state machine:
//! before dispatching a Call, `call::CallRunner` fingerprints it and
//! asks a [`CacheIndex`] whether an equivalent Call has already
//! succeeded. Shaped after `durable::persistence::store::WorkflowEventStore`
//! — an async trait over a dedicated `*Error` enum — narrowed to the two
//! operations this index needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::CallKey;

/// Content fingerprint of a Call: hash of task body + resolved inputs +
/// (if containerized) the docker image digest. Two Calls with the same
/// fingerprint are considered equivalent for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Compute a fingerprint from its constituent parts. Callers pass
    /// already-canonicalized (e.g. sorted-key JSON) representations so
    /// that semantically identical inputs always hash identically.
    pub fn compute(task_body: &str, resolved_inputs_json: &str, image_digest: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(task_body.as_bytes());
        hasher.update(b"\0");
        hasher.update(resolved_inputs_json.as_bytes());
        hasher.update(b"\0");
        hasher.update(image_digest.unwrap_or("").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

/// Hit strategies per spec.md §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitStrategy {
    /// Don't copy; verify the original outputs still exist and point at
    /// them directly. A placeholder file is written explaining the
    /// indirection.
    UseOriginal,
    /// Physically materialize each output and detritus file into the
    /// new call root.
    CopyOutputs,
}

/// One candidate prior Call a cache lookup returned, in the engine's
/// preferred order for trying it. Stale candidates (source files since
/// deleted) are skipped; the engine falls through to the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorResult {
    pub call_key: CallKey,
    pub call_root: String,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub detritus_paths: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl PriorResult {
    /// Total order over candidates: most-recent first, call key as a
    /// deterministic tiebreaker for same-instant recordings (Open
    /// Question #2, see DESIGN.md).
    pub fn preference_key(&self) -> (std::cmp::Reverse<chrono::DateTime<chrono::Utc>>, &CallKey) {
        (std::cmp::Reverse(self.created_at), &self.call_key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheIndexError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// The Call-Caching Index contract (spec.md §4.C).
#[async_trait]
pub trait CacheIndex: Send + Sync + 'static {
    /// Candidates for `fingerprint`, most-recent first. Empty means no
    /// cache hit is possible.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Vec<PriorResult>, CacheIndexError>;

    /// Record a freshly-succeeded Call so future lookups can find it.
    async fn record(&self, fingerprint: Fingerprint, result: PriorResult) -> Result<(), CacheIndexError>;
}

/// In-memory index, used by tests and by the in-memory persistence
/// adapter. Keeps all candidates ever recorded for a fingerprint; real
/// deployments back this with the Postgres persistence adapter instead.
#[derive(Default)]
pub struct InMemoryCacheIndex {
    entries: dashmap::DashMap<Fingerprint, Vec<PriorResult>>,
}

impl InMemoryCacheIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheIndex for InMemoryCacheIndex {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Vec<PriorResult>, CacheIndexError> {
        let mut candidates = self
            .entries
            .get(fingerprint)
            .map(|v| v.clone())
            .unwrap_or_default();
        candidates.sort_by(|a, b| a.preference_key().cmp(&b.preference_key()));
        Ok(candidates)
    }

    async fn record(&self, fingerprint: Fingerprint, result: PriorResult) -> Result<(), CacheIndexError> {
        self.entries.entry(fingerprint).or_default().push(result);
        Ok(())
    }
}

/// Verify a `UseOriginal` hit is still live, tolerating stale entries
/// (spec.md §4.C: "the engine must tolerate stale hits ... by falling
/// through to the next candidate"). Returns the first candidate whose
/// outputs still exist.
pub async fn first_live_candidate<'a>(
    io: &dyn crate::io::IoCapability,
    candidates: &'a [PriorResult],
) -> Option<&'a PriorResult> {
    live_candidates(io, candidates).await.into_iter().next()
}

/// All candidates (in the input order, which is already the engine's
/// preference order) whose declared outputs still exist. The caller
/// tries these in order, falling through on a backend copy failure too.
pub async fn live_candidates<'a>(
    io: &dyn crate::io::IoCapability,
    candidates: &'a [PriorResult],
) -> Vec<&'a PriorResult> {
    let mut live = Vec::new();
    for candidate in candidates {
        let mut all_exist = true;
        for path in candidate.outputs.values().filter_map(|v| v.as_str()) {
            let handle = crate::io::PathHandle::new(path.to_string());
            if !io.exists(&handle).await.unwrap_or(false) {
                all_exist = false;
                break;
            }
        }
        if all_exist {
            live.push(candidate);
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowId;

    fn make_result(call_key: CallKey, created_at: chrono::DateTime<chrono::Utc>) -> PriorResult {
        PriorResult {
            call_key,
            call_root: "/tmp/call-root".into(),
            outputs: serde_json::Map::new(),
            detritus_paths: vec![],
            created_at,
        }
    }

    #[test]
    fn fingerprint_is_stable_for_same_inputs() {
        let a = Fingerprint::compute("echo hi", "{}", None);
        let b = Fingerprint::compute("echo hi", "{}", None);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_image_digest() {
        let a = Fingerprint::compute("echo hi", "{}", Some("sha256:aaa"));
        let b = Fingerprint::compute("echo hi", "{}", Some("sha256:bbb"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn lookup_orders_most_recent_first() {
        let index = InMemoryCacheIndex::new();
        let wf = WorkflowId::new();
        let fp = Fingerprint::compute("t", "{}", None);
        let older = make_result(
            CallKey::first_attempt(wf, "t", None),
            chrono::Utc::now() - chrono::Duration::seconds(60),
        );
        let newer = make_result(
            CallKey::first_attempt(wf, "t", None),
            chrono::Utc::now(),
        );
        index.record(fp.clone(), older.clone()).await.unwrap();
        index.record(fp.clone(), newer).await.unwrap();

        let candidates = index.lookup(&fp).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].created_at > candidates[1].created_at);
    }

    #[tokio::test]
    async fn stale_hit_falls_through() {
        use crate::io::LocalIo;

        let io = LocalIo;
        let mut stale = make_result(
            CallKey::first_attempt(WorkflowId::new(), "t", None),
            chrono::Utc::now(),
        );
        stale
            .outputs
            .insert("out".into(), serde_json::Value::String("/nonexistent/path".into()));

        let dir = std::env::temp_dir().join(format!("cache-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let live_path = dir.join("out.txt");
        std::fs::write(&live_path, b"hi").unwrap();
        let mut live = make_result(
            CallKey::first_attempt(WorkflowId::new(), "t", None),
            chrono::Utc::now() - chrono::Duration::seconds(5),
        );
        live.outputs.insert(
            "out".into(),
            serde_json::Value::String(live_path.to_string_lossy().to_string()),
        );

        let candidates = vec![stale, live];
        let winner = first_live_candidate(&io, &candidates).await.unwrap();
        assert_eq!(
            winner.outputs.get("out").unwrap().as_str().unwrap(),
            live_path.to_string_lossy()
        );
    }
}
