//! Manifest Update Manager (§4.I): applies a single logical mutation to
//! one directory's manifest, then propagates the resulting CID up to
//! every ancestor. Per-directory serialization uses the same
//! `RwLock<HashMap<PathBuf, Arc<Mutex<_>>>>` lock-map idiom this
//! codebase's own hotlink session table uses for per-path exclusivity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::collaborators::{DirectoryEntry, DirectoryManager, EntryType, RequestContext};
use crate::error::{EngineError, EngineResult};
use crate::model::{ManifestOpKind, ManifestUpdateRequest};
use crate::state_store::SharedStateStore;
use crate::stats::DurationStats;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 4; // 3 retries + 1 initial attempt

#[derive(Default)]
pub struct ManifestManagerStats {
    pub total_requests: AtomicU64,
    pub successful_updates: AtomicU64,
    pub failed_updates: AtomicU64,
    pub retry_count: AtomicU64,
    pub last_update_unix_ms: AtomicI64,
    pub update_duration: DurationStats,
}

pub struct ManifestUpdateManager {
    dir_manager: Arc<dyn DirectoryManager>,
    state_store: SharedStateStore,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    stats: Arc<ManifestManagerStats>,
}

pub struct ManifestUpdateOutcome {
    pub new_cid: String,
}

impl ManifestUpdateManager {
    pub fn new(dir_manager: Arc<dyn DirectoryManager>, state_store: SharedStateStore) -> Self {
        ManifestUpdateManager {
            dir_manager,
            state_store,
            locks: RwLock::new(HashMap::new()),
            stats: Arc::new(ManifestManagerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ManifestManagerStats> {
        self.stats.clone()
    }

    async fn lock_for(&self, directory_path: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(directory_path) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(directory_path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Apply one request with linear-backoff retry, holding the
    /// directory's lock only across the mutation itself (§5: locks never
    /// span an unrelated I/O wait beyond the current directory).
    pub async fn apply(&self, request: ManifestUpdateRequest) -> EngineResult<ManifestUpdateOutcome> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let lock = self.lock_for(&request.directory_path).await;
        let started = Instant::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let _guard = lock.lock().await;
            match self.apply_once(&request).await {
                Ok(outcome) => {
                    self.stats.successful_updates.fetch_add(1, Ordering::Relaxed);
                    self.stats.update_duration.record_ms(started.elapsed().as_millis() as u64);
                    self.stats.last_update_unix_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    drop(_guard);
                    self.stats.retry_count.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(BASE_BACKOFF * attempt).await;
                    continue;
                }
                Err(err) => {
                    self.stats.failed_updates.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }
    }

    async fn apply_once(&self, request: &ManifestUpdateRequest) -> EngineResult<ManifestUpdateOutcome> {
        let ctx = RequestContext::default();
        let state = self.state_store.load(&request.session_id).await?;
        let current_cid = state
            .snapshot
            .remote
            .get(&request.directory_path)
            .map(|m| m.descriptor_cid.clone())
            .or_else(|| request.prior_cid.clone())
            .unwrap_or_default();

        let mut manifest = if current_cid.is_empty() {
            Default::default()
        } else {
            self.dir_manager.retrieve_manifest(&ctx, &request.directory_path, &current_cid).await?
        };

        match request.kind {
            ManifestOpKind::Add => {
                let Some(entry) = &request.entry else {
                    return Err(EngineError::corrupt_state("add request missing entry"));
                };
                manifest.add_entry(DirectoryEntry {
                    encrypted_name: entry.encrypted_name.clone(),
                    cid: entry.cid.clone(),
                    entry_type: if entry.is_dir { EntryType::Directory } else { EntryType::File },
                    size: entry.size,
                    modified: entry.modified,
                });
            }
            ManifestOpKind::Update => {
                let Some(entry) = &request.entry else {
                    return Err(EngineError::corrupt_state("update request missing entry"));
                };
                let ok = manifest.update_entry(
                    &entry.encrypted_name,
                    DirectoryEntry {
                        encrypted_name: entry.encrypted_name.clone(),
                        cid: entry.cid.clone(),
                        entry_type: if entry.is_dir { EntryType::Directory } else { EntryType::File },
                        size: entry.size,
                        modified: entry.modified,
                    },
                );
                if !ok {
                    return Err(EngineError::corrupt_state(format!(
                        "update target missing in manifest for {}",
                        request.directory_path
                    )));
                }
            }
            ManifestOpKind::Remove => {
                let Some(entry) = &request.entry else {
                    return Err(EngineError::corrupt_state("remove request missing entry"));
                };
                if !manifest.remove_entry(&entry.encrypted_name) {
                    return Err(EngineError::corrupt_state(format!(
                        "remove target missing in manifest for {}",
                        request.directory_path
                    )));
                }
            }
        }

        let new_cid = self.dir_manager.store_manifest(&ctx, &request.directory_path, &manifest).await?;

        let nanos = request.timestamp.timestamp_nanos_opt().unwrap_or(0) as u128;
        self.state_store
            .commit(
                &request.session_id,
                nanos,
                vec![crate::model::TransactionOperation::UpdateRemoteSnapshot {
                    path: request.directory_path.clone(),
                    metadata: crate::model::RemoteMetadata {
                        path: request.directory_path.clone(),
                        descriptor_cid: new_cid.clone(),
                        content_cid: None,
                        size: 0,
                        modified: chrono::Utc::now(),
                        is_dir: true,
                        last_sync: Some(chrono::Utc::now()),
                        version: state.snapshot.remote.get(&request.directory_path).map(|m| m.version + 1).unwrap_or(1),
                    },
                }],
            )
            .await?;

        Ok(ManifestUpdateOutcome { new_cid })
    }

    /// Walk from `dir_path`'s parent up to `remote_root`, submitting an
    /// `update` request at each level to replace the child's CID,
    /// threading the freshly-produced CID upward one hop at a time.
    pub async fn propagate_to_ancestors(
        &self,
        session_id: &str,
        remote_root: &str,
        dir_path: &str,
        mut new_cid: String,
        child_encrypted_name: Vec<u8>,
    ) -> EngineResult<()> {
        let mut current = parent_of(dir_path);
        let mut child_name = child_encrypted_name;

        while let Some(parent) = current {
            if parent.len() < remote_root.len() {
                break;
            }
            let request = ManifestUpdateRequest {
                session_id: session_id.to_string(),
                directory_path: parent.clone(),
                kind: ManifestOpKind::Update,
                entry: Some(crate::model::DirectoryEntryInput {
                    encrypted_name: child_name.clone(),
                    cid: new_cid.clone(),
                    is_dir: true,
                    size: 0,
                    modified: chrono::Utc::now(),
                }),
                prior_cid: None,
                new_cid: None,
                timestamp: chrono::Utc::now(),
                retry_count: 0,
            };
            let outcome = self.apply(request).await?;
            new_cid = outcome.new_cid;
            child_name = base_name(&parent).into_bytes();
            if parent == remote_root {
                break;
            }
            current = parent_of(&parent);
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> Option<String> {
    match path.rfind('/') {
        Some(idx) => Some(path[..idx].to_string()),
        None if path.is_empty() => None,
        None => Some(String::new()),
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

pub fn request_channel(capacity: usize) -> (mpsc::Sender<ManifestUpdateRequest>, mpsc::Receiver<ManifestUpdateRequest>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DirectoryManifest;
    use crate::model::DirectoryEntryInput;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeDirManager {
        store: StdMutex<HashMap<String, DirectoryManifest>>,
        next_cid: StdMutex<u64>,
    }

    impl FakeDirManager {
        fn new() -> Self {
            FakeDirManager {
                store: StdMutex::new(HashMap::new()),
                next_cid: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl DirectoryManager for FakeDirManager {
        async fn retrieve_manifest(&self, _ctx: &RequestContext, _path: &str, cid: &str) -> EngineResult<DirectoryManifest> {
            Ok(self.store.lock().unwrap().get(cid).cloned().unwrap_or_default())
        }
        async fn store_manifest(&self, _ctx: &RequestContext, _path: &str, manifest: &DirectoryManifest) -> EngineResult<String> {
            let mut n = self.next_cid.lock().unwrap();
            *n += 1;
            let cid = format!("cid-{n}");
            self.store.lock().unwrap().insert(cid.clone(), manifest.clone());
            Ok(cid)
        }
    }

    #[tokio::test]
    async fn add_entry_creates_manifest_and_updates_snapshot() {
        let dir_manager: Arc<dyn DirectoryManager> = Arc::new(FakeDirManager::new());
        let tmp = std::env::temp_dir().join("syncore-manifest-manager-add");
        let _ = std::fs::remove_dir_all(&tmp);
        let store = Arc::new(crate::state_store::StateStore::new(&tmp));
        store.recover().await.unwrap();

        let manager = ManifestUpdateManager::new(dir_manager, store.clone());
        let request = ManifestUpdateRequest {
            session_id: "s1".into(),
            directory_path: "docs".into(),
            kind: ManifestOpKind::Add,
            entry: Some(DirectoryEntryInput {
                encrypted_name: b"a.txt".to_vec(),
                cid: "content-cid".into(),
                is_dir: false,
                size: 5,
                modified: chrono::Utc::now(),
            }),
            prior_cid: None,
            new_cid: None,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        };

        let outcome = manager.apply(request).await.unwrap();
        assert_eq!(outcome.new_cid, "cid-1");

        let state = store.load("s1").await.unwrap();
        assert_eq!(state.snapshot.remote.get("docs").unwrap().descriptor_cid, "cid-1");
    }

    #[tokio::test]
    async fn update_missing_entry_fails() {
        let dir_manager: Arc<dyn DirectoryManager> = Arc::new(FakeDirManager::new());
        let tmp = std::env::temp_dir().join("syncore-manifest-manager-update-missing");
        let _ = std::fs::remove_dir_all(&tmp);
        let store = Arc::new(crate::state_store::StateStore::new(&tmp));
        store.recover().await.unwrap();

        let manager = ManifestUpdateManager::new(dir_manager, store);
        let request = ManifestUpdateRequest {
            session_id: "s1".into(),
            directory_path: "docs".into(),
            kind: ManifestOpKind::Update,
            entry: Some(DirectoryEntryInput {
                encrypted_name: b"missing.txt".to_vec(),
                cid: "content-cid".into(),
                is_dir: false,
                size: 5,
                modified: chrono::Utc::now(),
            }),
            prior_cid: None,
            new_cid: None,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
        };

        let err = manager.apply(request).await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptState { .. }));
    }
}
