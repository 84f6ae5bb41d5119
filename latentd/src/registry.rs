//! Live sessions hosted by the daemon.
//!
//! Each session has one worker task draining its queue. Intake never touches
//! the session lock: a small gate mirrors the mode and stamps each queued
//! event with the mode generation it was accepted under. Every mode change
//! bumps the generation and drains the queue, and the worker discards any
//! event whose stamp is stale. The worker holds the session lock only to
//! admit and to apply; the fetch runs with the lock released.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use latent_live::mode::ModeTransition;
use latent_live::results::ResultsStore;
use latent_live::storage;
use latent_live::{ExplorerConfig, LiveError, LiveSession, LiveUpdate, SessionSnapshot};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::paths::AppPaths;
use crate::queue::LiveQueue;

const SHARDS: usize = 16;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0}")]
    InvalidSession(String),
    #[error("no snapshot for session at {0}")]
    NoSnapshot(PathBuf),
    #[error("snapshot I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to an envelope handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Session paused; the event was discarded.
    Ignored,
    /// Queued for the worker; `evicted` if an older event made room.
    Queued { evicted: bool },
}

/// A queued envelope and the mode generation it was accepted under.
#[derive(Debug, Clone)]
pub struct Stamped {
    generation: u64,
    envelope: Value,
}

/// Mode as seen by intake, plus counts not yet folded into the session.
#[derive(Debug, Default)]
struct Gate {
    generation: u64,
    live: bool,
    ignored: u64,
    overflowed: u64,
}

pub struct SessionHandle {
    id: String,
    session: Mutex<LiveSession>,
    gate: std::sync::Mutex<Gate>,
    queue: LiveQueue<Stamped>,
}

impl SessionHandle {
    fn new(id: String, config: Arc<ExplorerConfig>) -> Self {
        let capacity = config.queue_capacity();
        Self {
            id,
            session: Mutex::new(LiveSession::new(config)),
            gate: std::sync::Mutex::new(Gate::default()),
            queue: LiveQueue::new(capacity),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, Gate> {
        match self.gate.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn generation(&self) -> u64 {
        self.gate().generation
    }

    /// Lock the session, folding in anything intake counted meanwhile.
    pub async fn lock(&self) -> MutexGuard<'_, LiveSession> {
        let mut s = self.session.lock().await;
        let (ignored, overflowed) = {
            let mut g = self.gate();
            (
                std::mem::take(&mut g.ignored),
                std::mem::take(&mut g.overflowed),
            )
        };
        if ignored > 0 {
            s.record_ignored(ignored);
        }
        if overflowed > 0 {
            s.record_overflow(overflowed);
        }
        s
    }

    /// Events arriving while paused are ignored here rather than queued.
    pub fn enqueue(&self, envelope: Value) -> Enqueued {
        let mut g = self.gate();
        if !g.live {
            g.ignored += 1;
            debug!(session = %self.id, "live event ignored while paused");
            return Enqueued::Ignored;
        }
        let stamped = Stamped {
            generation: g.generation,
            envelope,
        };
        let evicted = self.queue.push(stamped).is_some();
        if evicted {
            g.overflowed += 1;
        }
        Enqueued::Queued { evicted }
    }

    pub async fn toggle_live(&self) -> ModeTransition {
        let mut s = self.lock().await;
        let t = s.toggle_live();
        self.publish(&mut s);
        t
    }

    pub async fn reset(&self) {
        let mut s = self.lock().await;
        s.reset();
        self.publish(&mut s);
        info!(session = %self.id, "session reset");
    }

    pub async fn restore(&self, snapshot: SessionSnapshot) {
        let mut s = self.lock().await;
        s.restore(snapshot);
        self.publish(&mut s);
    }

    /// Start a new mode generation. Queued events belong to the old one and
    /// are discarded. Must be called with the session locked.
    fn publish(&self, s: &mut LiveSession) {
        let discarded = {
            let mut g = self.gate();
            g.generation += 1;
            g.live = s.is_live();
            self.queue.clear()
        };
        if discarded > 0 {
            s.record_ignored(discarded as u64);
        }
    }
}

/// Gate, fetch on the blocking pool under `timeout`, then merge. The session
/// lock is released during the fetch; an event whose mode generation has
/// passed by either side of it is ignored.
pub async fn process_envelope(
    handle: &SessionHandle,
    store: &Arc<dyn ResultsStore>,
    timeout: Duration,
    item: Stamped,
) -> Option<LiveUpdate> {
    let (event, key) = {
        let mut s = handle.lock().await;
        if handle.generation() != item.generation {
            s.record_ignored(1);
            return Some(LiveUpdate::Ignored);
        }
        let event = match s.admit(&item.envelope) {
            Ok(Some(event)) => event,
            Ok(None) => return Some(LiveUpdate::Ignored),
            Err(_) => return None,
        };
        let key = s.result_key(&event);
        (event, key)
    };

    let fetch = {
        let store = Arc::clone(store);
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.get_result(&key))
    };
    let fetched = time::timeout(timeout, fetch).await;

    let mut s = handle.lock().await;
    if handle.generation() != item.generation {
        debug!(session = %handle.id, key = %key, "mode changed during fetch");
        s.record_ignored(1);
        return Some(LiveUpdate::Ignored);
    }
    let result = match fetched {
        Ok(Ok(Ok(result))) => result,
        Ok(Ok(Err(e))) => {
            s.record_drop(&e);
            return None;
        }
        Ok(Err(join)) => {
            s.record_drop(&LiveError::Store(format!("fetch task failed: {join}")));
            return None;
        }
        Err(_) => {
            s.record_drop(&LiveError::Timeout {
                key,
                after: timeout,
            });
            return None;
        }
    };

    let update = s.apply_result(&event, &result);
    info!(session = %handle.id, "{}", update.summary());
    Some(update)
}

async fn run_worker(
    handle: Arc<SessionHandle>,
    store: Arc<dyn ResultsStore>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    debug!(session = %handle.id, "live worker started");
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = handle.queue.pop() => item,
        };
        process_envelope(&handle, &store, timeout, item).await;
    }
    debug!(session = %handle.id, "live worker stopped");
}

pub struct Registry {
    config: Arc<ExplorerConfig>,
    store: Arc<dyn ResultsStore>,
    paths: AppPaths,
    shards: Vec<std::sync::Mutex<HashMap<String, Arc<SessionHandle>>>>,
    cancel: CancellationToken,
}

impl Registry {
    pub fn new(
        config: Arc<ExplorerConfig>,
        store: Arc<dyn ResultsStore>,
        paths: AppPaths,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let shards = (0..SHARDS)
            .map(|_| std::sync::Mutex::new(HashMap::new()))
            .collect();
        Arc::new(Self {
            config,
            store,
            paths,
            shards,
            cancel,
        })
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn shard(&self, id: &str) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionHandle>>> {
        let mut h = DefaultHasher::new();
        id.hash(&mut h);
        let idx = (h.finish() as usize) % self.shards.len();
        match self.shards[idx].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a session, creating it (and its worker) on first use.
    pub fn get_or_create(&self, id: &str) -> Result<Arc<SessionHandle>, DaemonError> {
        crate::paths::validate_session_id(id).map_err(DaemonError::InvalidSession)?;
        let mut shard = self.shard(id);
        if let Some(handle) = shard.get(id) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(SessionHandle::new(id.to_string(), Arc::clone(&self.config)));
        shard.insert(id.to_string(), Arc::clone(&handle));
        drop(shard);

        tokio::spawn(run_worker(
            Arc::clone(&handle),
            Arc::clone(&self.store),
            self.config.fetch_timeout(),
            self.cancel.child_token(),
        ));
        info!(session = id, "session created");
        Ok(handle)
    }

    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = match shard.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            out.extend(guard.values().cloned());
        }
        out
    }

    pub async fn save(&self, handle: &SessionHandle) -> Result<PathBuf, DaemonError> {
        let path = self
            .paths
            .session_file(&handle.id)
            .map_err(DaemonError::InvalidSession)?;
        let snapshot = handle.lock().await.snapshot();
        let io = |source| DaemonError::Io {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(io)?;
        let mut w = BufWriter::new(file);
        storage::write_snapshot(&mut w, &snapshot).map_err(io)?;
        w.flush().map_err(io)?;
        info!(session = %handle.id, "session saved to {:?}", path);
        Ok(path)
    }

    pub async fn load(&self, handle: &SessionHandle) -> Result<PathBuf, DaemonError> {
        let path = self
            .paths
            .session_file(&handle.id)
            .map_err(DaemonError::InvalidSession)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaemonError::NoSnapshot(path))
            }
            Err(source) => return Err(DaemonError::Io { path, source }),
        };
        let snapshot: SessionSnapshot =
            storage::read_snapshot(&mut BufReader::new(file)).map_err(|source| DaemonError::Io {
                path: path.clone(),
                source,
            })?;
        handle.restore(snapshot).await;
        info!(session = %handle.id, "session loaded from {:?}", path);
        Ok(path)
    }

    /// Save every session; returns how many were saved.
    pub async fn save_all(&self) -> Result<usize, DaemonError> {
        let sessions = self.sessions();
        let mut first_err = None;
        let mut saved = 0;
        for handle in &sessions {
            match self.save(handle).await {
                Ok(_) => saved += 1,
                Err(e) => {
                    error!(session = %handle.id, "save failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latent_live::live::{encode_envelope, LiveEvent};
    use latent_live::results::{
        DimRedResult, IoParameters, LatentMatrix, MemoryResultsStore, ModelParameters, ResultKey,
        ResultMetadata,
    };

    struct SlowStore(Duration);

    impl ResultsStore for SlowStore {
        fn get_result(&self, key: &ResultKey) -> Result<DimRedResult, LiveError> {
            std::thread::sleep(self.0);
            Err(LiveError::Lookup(key.clone()))
        }
    }

    fn config() -> Arc<ExplorerConfig> {
        Arc::new(ExplorerConfig {
            user: "u".to_string(),
            live_queue_capacity: 2,
            ..ExplorerConfig::default()
        })
    }

    fn result(uri: &str) -> DimRedResult {
        DimRedResult {
            metadata: ResultMetadata {
                io_parameters: IoParameters {
                    root_uri: Some("root".to_string()),
                    data_uris: vec![uri.to_string()],
                },
                model_parameters: ModelParameters {
                    n_components: Some(2),
                },
            },
            content: LatentMatrix::from_rows(vec![vec![1.0, 2.0]]).unwrap(),
        }
    }

    fn envelope(flow: &str) -> Value {
        encode_envelope(&LiveEvent {
            flow_id: flow.to_string(),
            project_name: "p".to_string(),
        })
    }

    async fn next(handle: &SessionHandle) -> Stamped {
        time::timeout(Duration::from_secs(2), handle.queue.pop())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn paused_session_ignores_and_full_queue_evicts() {
        let handle = SessionHandle::new("s".to_string(), config());
        assert_eq!(handle.enqueue(envelope("f0")), Enqueued::Ignored);
        assert_eq!(handle.queued(), 0);

        handle.toggle_live().await;
        for f in ["f1", "f2"] {
            assert_eq!(
                handle.enqueue(envelope(f)),
                Enqueued::Queued { evicted: false }
            );
        }
        assert_eq!(
            handle.enqueue(envelope("f3")),
            Enqueued::Queued { evicted: true }
        );
        let counters = handle.lock().await.counters();
        assert_eq!(counters.ignored, 1);
        assert_eq!(counters.dropped, 1);
        assert_eq!(next(&handle).await.envelope, envelope("f2"));
    }

    #[tokio::test]
    async fn pause_then_reenter_discards_stale_events() {
        let mem = MemoryResultsStore::new();
        mem.insert(ResultKey::new("u", "p", "f1"), result("d1"));
        let store: Arc<dyn ResultsStore> = Arc::new(mem);
        let handle = SessionHandle::new("s".to_string(), config());
        handle.toggle_live().await;
        handle.enqueue(envelope("f1"));
        handle.enqueue(envelope("f1"));
        // The worker has already taken the first one.
        let in_flight = next(&handle).await;

        handle.toggle_live().await;
        let t = handle.toggle_live().await;
        assert!(t.entered_live());
        assert_eq!(handle.queued(), 0);

        let out = process_envelope(&handle, &store, Duration::from_secs(5), in_flight).await;
        assert_eq!(out, Some(LiveUpdate::Ignored));
        {
            let s = handle.lock().await;
            assert!(s.project().datasets.is_empty());
            assert_eq!(s.scatter().point_count(), 0);
            assert_eq!(s.counters().ignored, 2);
        }

        handle.enqueue(envelope("f1"));
        let fresh = next(&handle).await;
        let out = process_envelope(&handle, &store, Duration::from_secs(5), fresh).await;
        assert!(matches!(out, Some(LiveUpdate::Applied { .. })));
        assert_eq!(handle.lock().await.project().datasets.len(), 1);
    }

    #[tokio::test]
    async fn reset_discards_queued_events() {
        let handle = SessionHandle::new("s".to_string(), config());
        handle.toggle_live().await;
        handle.enqueue(envelope("f1"));
        handle.enqueue(envelope("f2"));
        handle.reset().await;
        assert_eq!(handle.queued(), 0);
        assert_eq!(handle.enqueue(envelope("f3")), Enqueued::Ignored);
    }

    #[tokio::test]
    async fn enqueue_does_not_wait_for_session_lock() {
        let handle = SessionHandle::new("s".to_string(), config());
        handle.toggle_live().await;
        let guard = handle.lock().await;
        assert_eq!(
            handle.enqueue(envelope("f1")),
            Enqueued::Queued { evicted: false }
        );
        drop(guard);
        assert_eq!(handle.queued(), 1);
    }

    #[tokio::test]
    async fn slow_fetch_leaves_session_unlocked() {
        let store: Arc<dyn ResultsStore> = Arc::new(SlowStore(Duration::from_millis(300)));
        let handle = Arc::new(SessionHandle::new("s".to_string(), config()));
        handle.toggle_live().await;
        handle.enqueue(envelope("f1"));
        let item = next(&handle).await;

        let worker = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                process_envelope(&handle, &store, Duration::from_secs(5), item).await
            })
        };
        time::sleep(Duration::from_millis(50)).await;
        let view = time::timeout(Duration::from_millis(100), handle.lock()).await;
        assert!(view.is_ok());
        drop(view);

        assert!(worker.await.unwrap().is_none());
        assert_eq!(handle.lock().await.counters().dropped, 1);
    }

    #[tokio::test]
    async fn process_applies_fetched_result() {
        let mem = MemoryResultsStore::new();
        mem.insert(ResultKey::new("u", "p", "f1"), result("d1"));
        let store: Arc<dyn ResultsStore> = Arc::new(mem);
        let handle = SessionHandle::new("s".to_string(), config());
        handle.toggle_live().await;
        handle.enqueue(envelope("f1"));
        let item = next(&handle).await;

        let update = process_envelope(&handle, &store, Duration::from_secs(5), item)
            .await
            .unwrap();
        assert!(matches!(update, LiveUpdate::Applied { .. }));
        let s = handle.lock().await;
        assert_eq!(s.project().datasets.len(), 1);
        assert_eq!(s.scatter().point_count(), 1);
    }

    #[tokio::test]
    async fn slow_fetch_times_out_and_drops() {
        let store: Arc<dyn ResultsStore> = Arc::new(SlowStore(Duration::from_millis(300)));
        let handle = SessionHandle::new("s".to_string(), config());
        handle.toggle_live().await;
        handle.enqueue(envelope("f1"));
        let item = next(&handle).await;

        let out = process_envelope(&handle, &store, Duration::from_millis(20), item).await;
        assert!(out.is_none());
        let s = handle.lock().await;
        assert_eq!(s.counters().dropped, 1);
        assert!(s.project().datasets.is_empty());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path()).unwrap();
        let mem = MemoryResultsStore::new();
        mem.insert(ResultKey::new("u", "p", "f1"), result("d1"));
        let store: Arc<dyn ResultsStore> = Arc::new(mem);
        let registry = Registry::new(config(), Arc::clone(&store), paths, CancellationToken::new());

        let handle = registry.get_or_create("beam").unwrap();
        handle.toggle_live().await;
        let item = Stamped {
            generation: handle.generation(),
            envelope: envelope("f1"),
        };
        process_envelope(&handle, &store, Duration::from_secs(5), item).await;
        assert_eq!(registry.save_all().await.unwrap(), 1);

        handle.reset().await;
        assert!(!handle.lock().await.is_live());
        assert_eq!(handle.enqueue(envelope("f1")), Enqueued::Ignored);
        registry.load(&handle).await.unwrap();
        let s = handle.lock().await;
        assert!(s.is_live());
        assert_eq!(s.project().datasets[0].uri, "d1");
        drop(s);
        // Intake follows the restored mode.
        assert!(matches!(handle.enqueue(envelope("f9")), Enqueued::Queued { .. }));

        let other = registry.get_or_create("never-saved").unwrap();
        assert!(matches!(
            registry.load(&other).await,
            Err(DaemonError::NoSnapshot(_))
        ));
        assert!(registry.get_or_create("../x").is_err());
        registry.cancel_token().cancel();
    }
}
