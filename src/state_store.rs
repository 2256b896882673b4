//! Transactional state store (§4.E): JSON-per-session persistence backed
//! by a write-ahead log of [`Transaction`]s, crash recovery, and a
//! dirty-set write-back cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::model::{SyncState, Transaction, TransactionOperation, TransactionStatus};
use crate::security;

pub struct StateStore {
    root: PathBuf,
    cache: RwLock<std::collections::HashMap<String, SyncState>>,
    dirty: RwLock<HashSet<String>>,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateStore {
            root: root.into(),
            cache: RwLock::new(std::collections::HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        security::state_file_for_session(&self.root, session_id)
    }

    fn wal_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    fn wal_file(&self, tx: &Transaction) -> PathBuf {
        self.wal_dir().join(format!("{}.json", tx.id))
    }

    /// Ensure the store's on-disk layout exists and roll back any
    /// transaction left `Pending` by a crash, per §4.E's at-most-once
    /// recovery contract.
    pub async fn recover(&self) -> EngineResult<Vec<String>> {
        tokio::fs::create_dir_all(&self.root).await.map_err(EngineError::io)?;
        tokio::fs::create_dir_all(self.wal_dir()).await.map_err(EngineError::io)?;

        let mut rolled_back = Vec::new();
        let mut entries = tokio::fs::read_dir(self.wal_dir()).await.map_err(EngineError::io)?;
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path).await.map_err(EngineError::io)?;
            let tx: Transaction = serde_json::from_slice(&data)?;
            if tx.status == TransactionStatus::Pending {
                rolled_back.push(tx.id.clone());
                tokio::fs::remove_file(&path).await.map_err(EngineError::io)?;
            }
        }
        Ok(rolled_back)
    }

    pub async fn load(&self, session_id: &str) -> EngineResult<SyncState> {
        security::is_valid_session_id(session_id)
            .then_some(())
            .ok_or_else(|| EngineError::security_violation(format!("invalid session id: {session_id:?}")))?;

        if let Some(state) = self.cache.read().await.get(session_id) {
            return Ok(state.clone());
        }

        let path = self.session_file(session_id);
        let state = if path.exists() {
            let data = tokio::fs::read(&path).await.map_err(EngineError::io)?;
            serde_json::from_slice(&data)?
        } else {
            SyncState::default()
        };
        self.cache.write().await.insert(session_id.to_string(), state.clone());
        Ok(state)
    }

    /// Apply `ops` to `session_id`'s state inside a logged transaction,
    /// following §4.E's durability order exactly: write the WAL entry
    /// `Pending`, apply the mutation, persist the resulting state to disk,
    /// only then flip the WAL entry to `Committed` and delete it. A crash
    /// at any point before the state file is written still has the
    /// `Pending` WAL entry to roll back on [`StateStore::recover`]; a crash
    /// after it is written has already-durable state, so deleting the WAL
    /// entry never races a not-yet-persisted mutation.
    pub async fn commit(&self, session_id: &str, nanos: u128, ops: Vec<TransactionOperation>) -> EngineResult<Transaction> {
        security::is_valid_session_id(session_id)
            .then_some(())
            .ok_or_else(|| EngineError::security_violation(format!("invalid session id: {session_id:?}")))?;

        let mut tx = Transaction::new(session_id, nanos);
        tx.operations = ops;
        self.write_wal(&tx).await?;

        let mut state = self.load(session_id).await?;
        for op in &tx.operations {
            apply_operation(&mut state, op);
        }

        self.persist_session(session_id, &state).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(session_id.to_string(), state);
        }
        self.dirty.write().await.remove(session_id);

        tx.status = TransactionStatus::Committed;
        tx.committed_at = Some(chrono::Utc::now());
        self.write_wal(&tx).await?;
        tokio::fs::remove_file(self.wal_file(&tx)).await.map_err(EngineError::io)?;

        Ok(tx)
    }

    pub async fn rollback(&self, mut tx: Transaction) -> EngineResult<()> {
        tx.status = TransactionStatus::RolledBack;
        tx.rolled_back_at = Some(chrono::Utc::now());
        let path = self.wal_file(&tx);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(EngineError::io)?;
        }
        Ok(())
    }

    async fn write_wal(&self, tx: &Transaction) -> EngineResult<()> {
        tokio::fs::create_dir_all(self.wal_dir()).await.map_err(EngineError::io)?;
        let data = serde_json::to_vec_pretty(tx)?;
        let path = self.wal_file(tx);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await.map_err(EngineError::io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(EngineError::io)?;
        Ok(())
    }

    /// Flush every still-dirty session's cached state to its JSON file.
    /// Ordinary commits already persist synchronously (see `commit`), so in
    /// steady state this drains nothing; it exists as a catch-all for any
    /// future direct cache mutation that doesn't go through `commit`.
    pub async fn flush(&self) -> EngineResult<usize> {
        let dirty: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };
        let n = dirty.len();
        for session_id in dirty {
            let state = self.cache.read().await.get(&session_id).cloned();
            let Some(state) = state else { continue };
            self.persist_session(&session_id, &state).await?;
        }
        Ok(n)
    }

    /// Atomic (temp-then-rename) write of `state` to `session_id`'s file,
    /// matching this crate's config writer.
    async fn persist_session(&self, session_id: &str, state: &SyncState) -> EngineResult<()> {
        let path = self.session_file(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(EngineError::io)?;
        }
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await.map_err(EngineError::io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(EngineError::io)?;
        Ok(())
    }

    fn check_session_id(session_id: &str) -> EngineResult<()> {
        security::is_valid_session_id(session_id)
            .then_some(())
            .ok_or_else(|| EngineError::security_violation(format!("invalid session id: {session_id:?}")))
    }

    /// Every session id with persisted state on disk (§4.E `list()`).
    pub async fn list(&self) -> EngineResult<Vec<String>> {
        tokio::fs::create_dir_all(&self.root).await.map_err(EngineError::io)?;
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(EngineError::io)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem != "invalid" {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Drop a session's cached and persisted state entirely (§4.E `delete()`).
    pub async fn delete(&self, session_id: &str) -> EngineResult<()> {
        Self::check_session_id(session_id)?;
        self.cache.write().await.remove(session_id);
        self.dirty.write().await.remove(session_id);
        let path = self.session_file(session_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(EngineError::io)?;
        }
        Ok(())
    }

    /// Stamp `session_id`'s `last_sync` and persist immediately (§4.E
    /// `update_last_sync()`).
    pub async fn update_last_sync(&self, session_id: &str, timestamp: chrono::DateTime<chrono::Utc>) -> EngineResult<()> {
        let mut state = self.load(session_id).await?;
        state.last_sync = Some(timestamp);
        self.persist_session(session_id, &state).await?;
        self.cache.write().await.insert(session_id.to_string(), state);
        self.dirty.write().await.remove(session_id);
        Ok(())
    }

    /// Append one entry to the bounded sync-history ring and persist (§4.E
    /// `add_to_history()`); without this the ring in §3/§4.E is never
    /// populated outside of tests that poke `SyncState` directly.
    pub async fn add_to_history(&self, session_id: &str, entry: crate::model::HistoryEntry) -> EngineResult<()> {
        let mut state = self.load(session_id).await?;
        state.push_history(entry);
        self.persist_session(session_id, &state).await?;
        self.cache.write().await.insert(session_id.to_string(), state);
        self.dirty.write().await.remove(session_id);
        Ok(())
    }

    /// Replace `session_id`'s snapshot wholesale and persist (§4.E
    /// `update_snapshot()`), used after a full rescan rather than an
    /// incremental diff.
    pub async fn update_snapshot(&self, session_id: &str, snapshot: crate::model::StateSnapshot) -> EngineResult<()> {
        let mut state = self.load(session_id).await?;
        state.snapshot = snapshot;
        self.persist_session(session_id, &state).await?;
        self.cache.write().await.insert(session_id.to_string(), state);
        self.dirty.write().await.remove(session_id);
        Ok(())
    }

    /// Create and persist a fresh, empty `SyncState` for a session that has
    /// never been seen before (§4.E `create_initial()`). Fails if state
    /// already exists on disk, since re-initializing would silently
    /// discard it.
    pub async fn create_initial(&self, session_id: &str) -> EngineResult<SyncState> {
        Self::check_session_id(session_id)?;
        if let Some(state) = self.cache.read().await.get(session_id) {
            return Ok(state.clone());
        }
        let path = self.session_file(session_id);
        if path.exists() {
            return Err(EngineError::corrupt_state(format!(
                "session {session_id} already has persisted state"
            )));
        }
        let state = SyncState::default();
        self.persist_session(session_id, &state).await?;
        self.cache.write().await.insert(session_id.to_string(), state.clone());
        Ok(state)
    }

    /// Force-persist the currently cached state for `session_id` outside
    /// the normal commit path (§4.E `explicit_save()`).
    pub async fn explicit_save(&self, session_id: &str) -> EngineResult<()> {
        Self::check_session_id(session_id)?;
        let state = self.cache.read().await.get(session_id).cloned();
        let Some(state) = state else {
            return Err(EngineError::corrupt_state(format!("no cached state for session {session_id}")));
        };
        self.persist_session(session_id, &state).await?;
        self.dirty.write().await.remove(session_id);
        Ok(())
    }

    /// Consistency check from §4.E: history stays within its bound, every
    /// local/remote path is non-empty, every non-directory local file
    /// carries a checksum, every remote entry carries a descriptor CID, and
    /// every pending op has an id and at least one of local/remote path.
    /// Sizes are `u64` so "non-negative" is already enforced by the type.
    pub async fn validate(&self, session_id: &str) -> EngineResult<()> {
        let state = self.load(session_id).await?;

        if state.history.len() > crate::model::MAX_HISTORY {
            return Err(EngineError::corrupt_state("history exceeds MAX_HISTORY"));
        }

        for (path, meta) in &state.snapshot.local {
            if path.is_empty() {
                return Err(EngineError::corrupt_state("local snapshot contains an empty path"));
            }
            if !meta.is_dir && meta.checksum.is_empty() {
                return Err(EngineError::corrupt_state(format!("local file {path} is missing a checksum")));
            }
        }

        for (path, meta) in &state.snapshot.remote {
            if path.is_empty() {
                return Err(EngineError::corrupt_state("remote snapshot contains an empty path"));
            }
            if meta.descriptor_cid.is_empty() {
                return Err(EngineError::corrupt_state(format!("remote entry {path} is missing a descriptor cid")));
            }
        }

        for op in &state.pending_ops {
            if op.id.is_empty() {
                return Err(EngineError::corrupt_state("pending op missing an id"));
            }
            if op.local_path.is_empty() && op.remote_path.is_empty() {
                return Err(EngineError::corrupt_state(format!(
                    "pending op {} has no local or remote path",
                    op.id
                )));
            }
        }

        Ok(())
    }
}

fn apply_operation(state: &mut SyncState, op: &TransactionOperation) {
    match op {
        TransactionOperation::UpdateLocalSnapshot { path, metadata } => {
            state.snapshot.local.insert(path.clone(), metadata.clone());
        }
        TransactionOperation::UpdateRemoteSnapshot { path, metadata } => {
            state.snapshot.remote.insert(path.clone(), metadata.clone());
        }
        TransactionOperation::DeleteLocalSnapshot { path } => {
            state.snapshot.local.remove(path);
        }
        TransactionOperation::DeleteRemoteSnapshot { path } => {
            state.snapshot.remote.remove(path);
        }
        TransactionOperation::AddPendingOp { op } => {
            state.pending_ops.push(op.clone());
        }
        TransactionOperation::RemovePendingOp { op_id } => {
            state.pending_ops.retain(|o| &o.id != op_id);
        }
    }
}

/// Shared handle, cheap to clone, suitable for wiring into the engine and
/// its worker tasks.
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileMetadata;

    fn tmp_root(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("syncore-state-store-{name}"));
        let _ = std::fs::remove_dir_all(&p);
        p
    }

    #[tokio::test]
    async fn commit_updates_cached_and_persisted_state() {
        let root = tmp_root("commit");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let meta = FileMetadata {
            path: "a.txt".into(),
            size: 5,
            modified: chrono::Utc::now(),
            is_dir: false,
            checksum: String::new(),
            permissions: 0,
            inode: 0,
            device: 0,
        };
        store
            .commit(
                "session1",
                1,
                vec![TransactionOperation::UpdateLocalSnapshot {
                    path: "a.txt".into(),
                    metadata: meta.clone(),
                }],
            )
            .await
            .unwrap();

        let state = store.load("session1").await.unwrap();
        assert_eq!(state.snapshot.local.get("a.txt"), Some(&meta));

        store.flush().await.unwrap();
        let path = store.session_file("session1");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn invalid_session_id_is_rejected() {
        let root = tmp_root("invalid-session");
        let store = StateStore::new(&root);
        let err = store.load("../escape").await.unwrap_err();
        assert!(matches!(err, EngineError::SecurityViolation { .. }));
    }

    #[tokio::test]
    async fn recover_rolls_back_pending_wal_entries() {
        let root = tmp_root("recover");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let mut tx = Transaction::new("session1", 99);
        tx.operations = vec![TransactionOperation::DeleteLocalSnapshot { path: "x".into() }];
        store.write_wal(&tx).await.unwrap();

        let rolled_back = store.recover().await.unwrap();
        assert_eq!(rolled_back, vec![tx.id]);
        assert!(!store.wal_file(&tx).exists());
    }

    #[tokio::test]
    async fn remove_pending_op_deletes_by_id() {
        let root = tmp_root("remove-pending");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let op = crate::model::SyncOperation::new(crate::model::OperationKind::Upload, "a", "a");
        let op_id = op.id.clone();
        store
            .commit("session1", 1, vec![TransactionOperation::AddPendingOp { op }])
            .await
            .unwrap();
        store
            .commit("session1", 2, vec![TransactionOperation::RemovePendingOp { op_id }])
            .await
            .unwrap();

        let state = store.load("session1").await.unwrap();
        assert!(state.pending_ops.is_empty());
    }

    #[tokio::test]
    async fn list_and_delete_round_trip() {
        let root = tmp_root("list-delete");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        store.create_initial("session1").await.unwrap();
        store.create_initial("session2").await.unwrap();
        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["session1".to_string(), "session2".to_string()]);

        store.delete("session1").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["session2".to_string()]);
        assert!(!store.session_file("session1").exists());
    }

    #[tokio::test]
    async fn create_initial_rejects_existing_session() {
        let root = tmp_root("create-initial-twice");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        store.create_initial("session1").await.unwrap();
        // A second store instance has no cache hit, so this exercises the
        // on-disk existence check rather than the in-memory short-circuit.
        let store2 = StateStore::new(&root);
        let err = store2.create_initial("session1").await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn add_to_history_populates_ring_and_persists() {
        let root = tmp_root("add-history");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let entry = crate::model::HistoryEntry {
            timestamp: chrono::Utc::now(),
            operation_id: "op1".into(),
            kind: crate::model::OperationKind::Upload,
            status: crate::model::OperationStatus::Completed,
            detail: None,
        };
        store.add_to_history("session1", entry).await.unwrap();

        let reloaded = StateStore::new(&root).load("session1").await.unwrap();
        assert_eq!(reloaded.history.len(), 1);
        assert_eq!(reloaded.history[0].operation_id, "op1");
    }

    #[tokio::test]
    async fn validate_passes_for_well_formed_state() {
        let root = tmp_root("validate-ok");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();
        store.create_initial("session1").await.unwrap();
        store.validate("session1").await.unwrap();
    }

    #[tokio::test]
    async fn validate_rejects_file_without_checksum() {
        let root = tmp_root("validate-missing-checksum");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let meta = FileMetadata {
            path: "a.txt".into(),
            size: 5,
            modified: chrono::Utc::now(),
            is_dir: false,
            checksum: String::new(),
            permissions: 0,
            inode: 0,
            device: 0,
        };
        store
            .commit(
                "session1",
                1,
                vec![TransactionOperation::UpdateLocalSnapshot {
                    path: "a.txt".into(),
                    metadata: meta,
                }],
            )
            .await
            .unwrap();

        let err = store.validate("session1").await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn validate_rejects_pending_op_without_paths() {
        let root = tmp_root("validate-bad-op");
        let store = StateStore::new(&root);
        store.recover().await.unwrap();

        let mut op = crate::model::SyncOperation::new(crate::model::OperationKind::Upload, "", "");
        op.local_path.clear();
        op.remote_path.clear();
        store
            .commit("session1", 1, vec![TransactionOperation::AddPendingOp { op }])
            .await
            .unwrap();

        let err = store.validate("session1").await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptState { .. }));
    }
}
