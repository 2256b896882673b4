//! Sync Engine (§4.J): orchestrates A-I behind a session lifecycle,
//! routes watcher/remote events into a persisted operation queue, and
//! runs a worker pool that executes each operation and calls the
//! manifest manager to mutate the remote tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{BlockStore, Crypto, DirectoryManager};
use crate::conflict::{strategy_for, ConflictHistory, ConflictStrategyKind};
use crate::error::{EngineError, EngineResult};
use crate::manifest_manager::ManifestUpdateManager;
use crate::model::{
    ManifestOpKind, ManifestUpdateRequest, OperationKind, OperationStatus, SessionProgress, SessionStatus,
    SyncOperation, TransactionOperation,
};
use crate::remote_monitor::{RemoteEvent, RemoteEventKind, RemoteMonitor, MonitoredRoot};
use crate::scanner::DirectoryScanner;
use crate::security::PathSecurity;
use crate::state_store::SharedStateStore;
use crate::stats::EngineStats;
use crate::watcher::{FileWatcher, WatchEvent, WatchEventKind};

const OPERATION_QUEUE_CAPACITY: usize = 100;
const MAX_RETRIES_DEFAULT: u32 = 3;

pub struct SessionRoots {
    pub session_id: String,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub manifest_cid: String,
}

struct Session {
    roots: SessionRoots,
    status: RwLock<SessionStatus>,
    progress: RwLock<SessionProgress>,
    watcher: Mutex<Option<FileWatcher>>,
}

/// Everything the engine needs from the outside world, gathered in one
/// place so `Engine::new` takes a single bundle instead of five loose
/// trait objects.
pub struct EngineCollaborators {
    pub block_store: Arc<dyn BlockStore>,
    pub dir_manager: Arc<dyn DirectoryManager>,
    pub crypto: Arc<dyn Crypto>,
    pub path_security: Arc<dyn PathSecurity>,
}

pub struct Engine {
    collaborators: EngineCollaborators,
    state_store: SharedStateStore,
    manifest_manager: Arc<ManifestUpdateManager>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    conflict_strategy: ConflictStrategyKind,
    conflict_history: Mutex<ConflictHistory>,
    stats: Arc<EngineStats>,
    op_tx: mpsc::Sender<SyncOperation>,
    op_rx: Mutex<mpsc::Receiver<SyncOperation>>,
    max_retries: u32,
    master_key: Vec<u8>,
    token: CancellationToken,
}

impl Engine {
    pub fn new(
        collaborators: EngineCollaborators,
        state_store: SharedStateStore,
        conflict_strategy: ConflictStrategyKind,
        master_key: Vec<u8>,
    ) -> Arc<Self> {
        let manifest_manager = Arc::new(ManifestUpdateManager::new(collaborators.dir_manager.clone(), state_store.clone()));
        let (op_tx, op_rx) = mpsc::channel(OPERATION_QUEUE_CAPACITY);
        Arc::new(Engine {
            collaborators,
            state_store,
            manifest_manager,
            sessions: RwLock::new(HashMap::new()),
            conflict_strategy,
            conflict_history: Mutex::new(ConflictHistory::default()),
            stats: Arc::new(EngineStats::default()),
            op_tx,
            op_rx: Mutex::new(op_rx),
            max_retries: MAX_RETRIES_DEFAULT,
            master_key,
            token: CancellationToken::new(),
        })
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn manifest_manager(&self) -> Arc<ManifestUpdateManager> {
        self.manifest_manager.clone()
    }

    /// Register a session and begin watching its local root. Does not
    /// perform the initial scan; call [`Engine::start_sync`] for that.
    pub async fn add_session(self: &Arc<Self>, roots: SessionRoots) -> EngineResult<()> {
        self.collaborators.path_security.validate_session_id(&roots.session_id)?;

        let (watcher, mut watch_events, mut watch_errors) =
            FileWatcher::start(vec![roots.local_root.clone()], crate::filters::WatchFilters::empty(), true)?;

        let session = Arc::new(Session {
            roots,
            status: RwLock::new(SessionStatus::Idle),
            progress: RwLock::new(SessionProgress::default()),
            watcher: Mutex::new(Some(watcher)),
        });

        self.sessions.write().await.insert(session.roots.session_id.clone(), session.clone());
        self.stats.active_sessions.fetch_add(1, Ordering::Relaxed);

        let engine = self.clone();
        let session_id = session.roots.session_id.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(event) = watch_events.recv() => {
                        engine.stats.total_events.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = engine.route_local_event(&session_id, event).await {
                            crate::logging::error_kv("failed to route local event", &[("session", &session_id), ("error", &err.to_string())]);
                        }
                    }
                    Some(err) = watch_errors.recv() => {
                        engine.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                        crate::logging::error_kv("watcher error", &[("session", &session_id), ("error", &err.to_string())]);
                    }
                    else => break,
                }
            }
        });

        Ok(())
    }

    pub async fn remove_session(&self, session_id: &str) -> EngineResult<()> {
        if let Some(session) = self.sessions.write().await.remove(session_id) {
            self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
            // Drop the watcher handle explicitly so its inotify/FSEvents
            // subscription tears down as soon as the session is gone,
            // not whenever the last Arc<Session> happens to be dropped.
            session.watcher.lock().await.take();
        }
        Ok(())
    }

    pub async fn pause_session(&self, session_id: &str) -> EngineResult<()> {
        self.set_status(session_id, SessionStatus::Paused).await
    }

    pub async fn resume_session(&self, session_id: &str) -> EngineResult<()> {
        self.set_status(session_id, SessionStatus::Idle).await
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> EngineResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| EngineError::corrupt_state(format!("unknown session {session_id}")))?;
        *session.status.write().await = status;
        Ok(())
    }

    pub async fn session_status(&self, session_id: &str) -> EngineResult<(SessionStatus, SessionProgress)> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| EngineError::corrupt_state(format!("unknown session {session_id}")))?;
        Ok((*session.status.read().await, session.progress.read().await.clone()))
    }

    /// Run an initial scan against persisted prior state, enqueue the
    /// resulting operations, and flip the session through
    /// `syncing -> idle` once the initial batch has been dispatched.
    pub async fn start_sync(&self, session_id: &str) -> EngineResult<usize> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| EngineError::corrupt_state(format!("unknown session {session_id}")))?.clone();
        drop(sessions);

        *session.status.write().await = SessionStatus::Syncing;
        {
            let mut progress = session.progress.write().await;
            progress.start_time = Some(chrono::Utc::now());
        }

        let prior = self.state_store.load(session_id).await?;
        let local_snapshot = DirectoryScanner::scan_local(&session.roots.local_root, true);

        let comparator = crate::comparator::StateComparator::default();
        let changes = comparator.compare(&prior.snapshot, &local_snapshot);
        let ops = DirectoryScanner::generate_sync_operations(&changes);

        {
            let mut progress = session.progress.write().await;
            progress.total += ops.len() as u64;
        }

        for op in &ops {
            self.state_store
                .commit(session_id, op_nanos(op), vec![TransactionOperation::AddPendingOp { op: op.clone() }])
                .await?;
            if self.op_tx.send(op.clone()).await.is_err() {
                return Err(EngineError::queue_full("operation queue"));
            }
        }

        *session.status.write().await = SessionStatus::Idle;
        Ok(ops.len())
    }

    async fn route_local_event(&self, session_id: &str, event: WatchEvent) -> EngineResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| EngineError::corrupt_state(format!("unknown session {session_id}")))?.clone();
        drop(sessions);

        if *session.status.read().await == SessionStatus::Paused {
            return Ok(());
        }

        let rel = event
            .path
            .strip_prefix(&session.roots.local_root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| event.path.to_string_lossy().to_string());

        let kind = match event.kind {
            WatchEventKind::FileCreated | WatchEventKind::FileModified => OperationKind::Upload,
            WatchEventKind::FileDeleted => OperationKind::Delete,
            WatchEventKind::DirCreated => OperationKind::CreateDir,
            WatchEventKind::DirDeleted => OperationKind::DeleteDir,
        };

        let op = SyncOperation::new(kind, rel.clone(), rel);
        self.state_store
            .commit(session_id, op_nanos(&op), vec![TransactionOperation::AddPendingOp { op: op.clone() }])
            .await?;
        self.op_tx.send(op).await.map_err(|_| EngineError::queue_full("operation queue"))
    }

    /// Route a remote-monitor event the same way, translating the remote
    /// path into the mirrored operation kind table from §4.J.
    pub async fn route_remote_event(&self, event: RemoteEvent) -> EngineResult<()> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(&event.session_id).cloned() else {
            return Ok(());
        };
        drop(sessions);

        if *session.status.read().await == SessionStatus::Paused {
            return Ok(());
        }

        let is_dir = event.metadata.as_ref().map(|m| m.is_dir).unwrap_or(false);
        let kind = match (event.kind, is_dir) {
            (RemoteEventKind::Created, false) | (RemoteEventKind::Modified, false) => OperationKind::Download,
            (RemoteEventKind::Deleted, false) => OperationKind::Delete,
            (RemoteEventKind::Created, true) | (RemoteEventKind::Modified, true) => OperationKind::CreateDir,
            (RemoteEventKind::Deleted, true) => OperationKind::DeleteDir,
        };

        let op = SyncOperation::new(kind, event.path.clone(), event.path);
        self.state_store
            .commit(&event.session_id, op_nanos(&op), vec![TransactionOperation::AddPendingOp { op: op.clone() }])
            .await?;
        self.op_tx.send(op).await.map_err(|_| EngineError::queue_full("operation queue"))
    }

    /// Spawn `worker_count` operation-executor tasks sharing the single
    /// queue receiver behind a mutex (§5: N operation-executor tasks).
    pub fn spawn_workers(self: &Arc<Self>, worker_count: usize) {
        for _ in 0..worker_count {
            let engine = self.clone();
            tokio::spawn(async move { engine.worker_loop().await });
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let op = {
                let mut rx = self.op_rx.lock().await;
                tokio::select! {
                    _ = self.token.cancelled() => None,
                    op = rx.recv() => op,
                }
            };
            let Some(op) = op else { break };
            self.execute_operation(op).await;
        }
    }

    async fn execute_operation(&self, mut op: SyncOperation) {
        let session_id = find_owning_session(&self.sessions, &op).await;
        let Some(session_id) = session_id else {
            return;
        };

        op.status = OperationStatus::Running;
        let result = self.apply_operation(&session_id, &op).await;

        match result {
            Ok(()) => {
                op.status = OperationStatus::Completed;
                let _ = self
                    .state_store
                    .commit(&session_id, op_nanos(&op), vec![TransactionOperation::RemovePendingOp { op_id: op.id.clone() }])
                    .await;
                self.record_history(&session_id, &op, None).await;
            }
            Err(err) if err.is_retryable() && op.retry_count < self.max_retries => {
                op.retry_count += 1;
                op.last_error = Some(err.to_string());
                let backoff = Duration::from_secs(op.retry_count as u64);
                tokio::time::sleep(backoff).await;
                let _ = self.op_tx.send(op).await;
            }
            Err(err) => {
                op.status = OperationStatus::Failed;
                op.last_error = Some(err.to_string());
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
                crate::logging::error_kv("operation failed permanently", &[("op", &op.id), ("error", &err.to_string())]);
                self.record_history(&session_id, &op, Some(err.to_string())).await;
            }
        }
    }

    /// Append a [`HistoryEntry`] for a terminal (completed or permanently
    /// failed) operation; best-effort, since a history write failing should
    /// never undo work the operation itself already did.
    async fn record_history(&self, session_id: &str, op: &SyncOperation, detail: Option<String>) {
        let entry = crate::model::HistoryEntry {
            timestamp: chrono::Utc::now(),
            operation_id: op.id.clone(),
            kind: op.kind,
            status: op.status,
            detail,
        };
        if let Err(err) = self.state_store.add_to_history(session_id, entry).await {
            crate::logging::error_kv("failed to record history entry", &[("op", &op.id), ("error", &err.to_string())]);
        }
    }

    async fn apply_operation(&self, session_id: &str, op: &SyncOperation) -> EngineResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| EngineError::corrupt_state("unknown session"))?.clone();
        drop(sessions);

        let local_path = self
            .collaborators
            .path_security
            .validate_path_in_bounds(Path::new(&op.local_path), &session.roots.local_root)?;

        match op.kind {
            OperationKind::Upload => self.upload(session_id, &session.roots.remote_root, &local_path, &op.remote_path).await,
            OperationKind::Download => self.download(session_id, &local_path, &op.remote_path).await,
            OperationKind::Delete => self.remove_remote_entry(session_id, &session.roots.remote_root, &op.remote_path).await,
            OperationKind::DeleteDir => self.remove_remote_entry(session_id, &session.roots.remote_root, &op.remote_path).await,
            OperationKind::CreateDir => {
                tokio::fs::create_dir_all(&local_path).await.map_err(EngineError::io)?;
                Ok(())
            }
            OperationKind::Move => {
                // No dedicated remote-rename primitive on the DirectoryManager
                // collaborator, so a move is carried out as remove-old then
                // add-new rather than silently succeeding without touching
                // the manifest (`local_path` here names the old path, kept
                // in `op.local_path`; `op.remote_path` names the new one).
                let new_local_path = self
                    .collaborators
                    .path_security
                    .validate_path_in_bounds(Path::new(&op.remote_path), &session.roots.local_root)?;
                self.remove_remote_entry(session_id, &session.roots.remote_root, &op.local_path).await?;
                self.upload(session_id, &session.roots.remote_root, &new_local_path, &op.remote_path).await
            }
        }
    }

    async fn upload(&self, session_id: &str, remote_root: &str, local_path: &Path, remote_path: &str) -> EngineResult<()> {
        let mut file = std::fs::File::open(local_path).map_err(EngineError::io)?;
        let cid = self.collaborators.block_store.put(&mut file).await?;
        let meta = std::fs::metadata(local_path).map_err(EngineError::io)?;

        let dir_path = parent_path(remote_path);
        let key = self.collaborators.crypto.derive_directory_key(&self.master_key, &dir_path);
        let name = base_name(remote_path);
        let encrypted_name = self.collaborators.crypto.encrypt_filename(&name, &key);

        let request = ManifestUpdateRequest {
            session_id: session_id.to_string(),
            directory_path: dir_path.clone(),
            kind: ManifestOpKind::Add,
            entry: Some(crate::model::DirectoryEntryInput {
                encrypted_name: encrypted_name.clone(),
                cid,
                is_dir: false,
                size: meta.len(),
                modified: chrono::Utc::now(),
            }),
            prior_cid: None,
            new_cid: None,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        };
        let outcome = self.manifest_manager.apply(request).await?;
        self.manifest_manager
            .propagate_to_ancestors(session_id, remote_root, &dir_path, outcome.new_cid, encrypted_name)
            .await
    }

    async fn download(&self, session_id: &str, local_path: &Path, remote_path: &str) -> EngineResult<()> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(EngineError::io)?;
        }

        let state = self.state_store.load(session_id).await?;
        let meta = state
            .snapshot
            .remote
            .get(remote_path)
            .ok_or_else(|| EngineError::corrupt_state(format!("no remote metadata for {remote_path}")))?;
        let cid = meta.content_cid.clone().unwrap_or_else(|| meta.descriptor_cid.clone());

        let mut reader = self.collaborators.block_store.get(&cid).await?;
        let local_path = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> EngineResult<()> {
            let mut file = std::fs::File::create(&local_path).map_err(EngineError::io)?;
            std::io::copy(&mut reader, &mut file).map_err(EngineError::io)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::fatal(e.to_string()))??;
        Ok(())
    }

    async fn remove_remote_entry(&self, session_id: &str, remote_root: &str, remote_path: &str) -> EngineResult<()> {
        let dir_path = parent_path(remote_path);
        let key = self.collaborators.crypto.derive_directory_key(&self.master_key, &dir_path);
        let name = base_name(remote_path);
        let encrypted_name = self.collaborators.crypto.encrypt_filename(&name, &key);

        let request = ManifestUpdateRequest {
            session_id: session_id.to_string(),
            directory_path: dir_path.clone(),
            kind: ManifestOpKind::Remove,
            entry: Some(crate::model::DirectoryEntryInput {
                encrypted_name: encrypted_name.clone(),
                cid: String::new(),
                is_dir: false,
                size: 0,
                modified: chrono::Utc::now(),
            }),
            prior_cid: None,
            new_cid: None,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        };
        let outcome = self.manifest_manager.apply(request).await?;
        self.manifest_manager
            .propagate_to_ancestors(session_id, remote_root, &dir_path, outcome.new_cid, encrypted_name)
            .await
    }

    /// Resolve a conflict using the engine's configured strategy, record
    /// it in the bounded history, and return the chosen result.
    pub async fn resolve_conflict(&self, conflict: crate::model::Conflict) -> crate::model::ConflictResult {
        let strategy = strategy_for(self.conflict_strategy);
        let result = strategy.resolve(&conflict);
        self.stats.total_conflicts.fetch_add(1, Ordering::Relaxed);
        self.conflict_history.lock().await.record(conflict, &result);
        result
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn remote_monitor_roots(&self) -> Vec<MonitoredRoot> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| MonitoredRoot {
                session_id: s.roots.session_id.clone(),
                remote_root: s.roots.remote_root.clone(),
                manifest_cid: s.roots.manifest_cid.clone(),
            })
            .collect()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Find the session whose local or remote root the operation's path lies
/// strictly under. Returns `None` (never an arbitrary fallback session) for
/// a path that matches no session, so the caller drops it rather than
/// applying it against the wrong root.
async fn find_owning_session(sessions: &RwLock<HashMap<String, Arc<Session>>>, op: &SyncOperation) -> Option<String> {
    let sessions = sessions.read().await;
    sessions
        .values()
        .find(|s| {
            Path::new(&op.local_path).starts_with(&s.roots.local_root) || op.remote_path.starts_with(&s.roots.remote_root)
        })
        .map(|s| s.roots.session_id.clone())
}

fn op_nanos(op: &SyncOperation) -> u128 {
    op.created_at.timestamp_nanos_opt().unwrap_or(0) as u128
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Helper exposed for callers wiring the remote monitor's output into the
/// engine's routing without the monitor needing to know about `Engine`.
pub async fn drive_remote_events(engine: Arc<Engine>, mut rx: mpsc::Receiver<RemoteEvent>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Err(err) = engine.route_remote_event(event).await {
                    crate::logging::error_kv("failed to route remote event", &[("error", &err.to_string())]);
                }
            }
        }
    }
}

/// Wire the remote monitor's long-lived poll loop to `engine`'s current
/// session roots, refreshing the monitored-root list periodically and
/// routing every emitted event back through the engine.
pub fn spawn_remote_monitor<F>(
    engine: Arc<Engine>,
    monitor: Arc<RemoteMonitor<F>>,
    token: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>>
where
    F: Fn(&[u8]) -> EngineResult<String> + Send + Sync + 'static,
{
    let (tx, rx) = crate::remote_monitor::event_channel();
    let roots = Arc::new(RwLock::new(Vec::new()));
    let roots_for_refresh = roots.clone();
    let engine_for_refresh = engine.clone();
    let refresh_token = token.clone();
    let refresh_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = refresh_token.cancelled() => break,
                _ = ticker.tick() => {
                    *roots_for_refresh.write().await = engine_for_refresh.remote_monitor_roots().await;
                }
            }
        }
    });

    let poll_token = token.clone();
    let poll_handle = tokio::spawn(async move { monitor.run(roots, tx, poll_token).await });
    let drive_handle = tokio::spawn(drive_remote_events(engine, rx, token));

    vec![refresh_handle, poll_handle, drive_handle]
}
