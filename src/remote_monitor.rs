//! Remote Change Monitor (§4.H): periodically re-retrieves every
//! monitored manifest tree and diffs it against the previous snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collaborators::DirectoryManager;
use crate::error::EngineResult;
use crate::model::RemoteMetadata;
use crate::scanner::DirectoryScanner;

const EVENTS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub session_id: String,
    pub path: String,
    pub kind: RemoteEventKind,
    pub metadata: Option<RemoteMetadata>,
}

#[derive(Debug, Clone)]
pub struct MonitoredRoot {
    pub session_id: String,
    pub remote_root: String,
    pub manifest_cid: String,
}

#[derive(Debug, Default)]
pub struct RemoteMonitorStats {
    pub total_checks: AtomicU64,
    pub total_paths: AtomicU64,
    pub last_check_unix_ms: AtomicI64,
}

pub struct RemoteMonitor<F> {
    dir_manager: Arc<dyn DirectoryManager>,
    decrypt_name: F,
    poll_interval: Duration,
    previous: RwLock<HashMap<String, HashMap<String, RemoteMetadata>>>,
    stats: Arc<RemoteMonitorStats>,
}

impl<F> RemoteMonitor<F>
where
    F: Fn(&[u8]) -> EngineResult<String> + Send + Sync + 'static,
{
    pub fn new(dir_manager: Arc<dyn DirectoryManager>, decrypt_name: F, poll_interval: Duration) -> Self {
        RemoteMonitor {
            dir_manager,
            decrypt_name,
            poll_interval,
            previous: RwLock::new(HashMap::new()),
            stats: Arc::new(RemoteMonitorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RemoteMonitorStats> {
        self.stats.clone()
    }

    /// One round against every root in `roots`, emitting events for
    /// anything that changed since the last round.
    pub async fn force_check(&self, roots: &[MonitoredRoot], out: &mpsc::Sender<RemoteEvent>) -> EngineResult<()> {
        for root in roots {
            self.check_one(root, out).await?;
        }
        self.stats.total_checks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_check_unix_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    async fn check_one(&self, root: &MonitoredRoot, out: &mpsc::Sender<RemoteEvent>) -> EngineResult<()> {
        let snapshot = DirectoryScanner::scan_remote(
            self.dir_manager.as_ref(),
            &root.remote_root,
            &root.manifest_cid,
            &self.decrypt_name,
        )
        .await?;

        let mut previous = self.previous.write().await;
        let prior = previous.remove(&root.session_id).unwrap_or_default();

        for (path, meta) in &snapshot.remote {
            let kind = match prior.get(path) {
                None => Some(RemoteEventKind::Created),
                Some(old) if remote_differs(old, meta) => Some(RemoteEventKind::Modified),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = out
                    .send(RemoteEvent {
                        session_id: root.session_id.clone(),
                        path: path.clone(),
                        kind,
                        metadata: Some(meta.clone()),
                    })
                    .await;
            }
        }
        for (path, meta) in &prior {
            if !snapshot.remote.contains_key(path) {
                let _ = out
                    .send(RemoteEvent {
                        session_id: root.session_id.clone(),
                        path: path.clone(),
                        kind: RemoteEventKind::Deleted,
                        metadata: Some(meta.clone()),
                    })
                    .await;
            }
        }

        self.stats.total_paths.fetch_add(snapshot.remote.len() as u64, Ordering::Relaxed);
        previous.insert(root.session_id.clone(), snapshot.remote);
        Ok(())
    }

    /// Long-lived poll loop (§5: "one long-lived remote-poller loop per
    /// polling interval"). Runs until `token` is cancelled.
    pub async fn run(
        self: Arc<Self>,
        roots: Arc<RwLock<Vec<MonitoredRoot>>>,
        out: mpsc::Sender<RemoteEvent>,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot_roots = roots.read().await.clone();
                    if let Err(err) = self.force_check(&snapshot_roots, &out).await {
                        crate::logging::error_kv("remote monitor check failed", &[("error", &err.to_string())]);
                    }
                }
            }
        }
    }
}

fn remote_differs(old: &RemoteMetadata, new: &RemoteMetadata) -> bool {
    old.descriptor_cid != new.descriptor_cid || old.size != new.size || old.modified != new.modified || old.is_dir != new.is_dir
}

pub fn event_channel() -> (mpsc::Sender<RemoteEvent>, mpsc::Receiver<RemoteEvent>) {
    mpsc::channel(EVENTS_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{DirectoryManifest, RequestContext};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeDirManager {
        manifests: StdMutex<HashMap<String, DirectoryManifest>>,
    }

    #[async_trait]
    impl DirectoryManager for FakeDirManager {
        async fn retrieve_manifest(&self, _ctx: &RequestContext, _path: &str, cid: &str) -> EngineResult<DirectoryManifest> {
            Ok(self.manifests.lock().unwrap().get(cid).cloned().unwrap_or_default())
        }
        async fn store_manifest(&self, _ctx: &RequestContext, _path: &str, _manifest: &DirectoryManifest) -> EngineResult<String> {
            unimplemented!("not exercised by remote monitor tests")
        }
    }

    fn identity_decrypt(bytes: &[u8]) -> EngineResult<String> {
        Ok(String::from_utf8_lossy(bytes).to_string())
    }

    #[tokio::test]
    async fn first_round_reports_every_entry_as_created() {
        use crate::collaborators::{DirectoryEntry, EntryType};

        let mut manifests = HashMap::new();
        manifests.insert(
            "root-cid".to_string(),
            DirectoryManifest {
                entries: vec![DirectoryEntry {
                    encrypted_name: b"a.txt".to_vec(),
                    cid: "cid-a".into(),
                    entry_type: EntryType::File,
                    size: 10,
                    modified: chrono::Utc::now(),
                }],
                modified: None,
            },
        );
        let dir_manager: Arc<dyn DirectoryManager> = Arc::new(FakeDirManager {
            manifests: StdMutex::new(manifests),
        });

        let monitor = RemoteMonitor::new(dir_manager, identity_decrypt, Duration::from_secs(30));
        let (tx, mut rx) = event_channel();
        let root = MonitoredRoot {
            session_id: "s1".into(),
            remote_root: String::new(),
            manifest_cid: "root-cid".into(),
        };
        monitor.force_check(&[root], &tx).await.unwrap();
        drop(tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, RemoteEventKind::Created);
        assert_eq!(event.path, "a.txt");
    }
}
