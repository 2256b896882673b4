//! Core data model: §3 entities shared by every component.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local filesystem entry, produced by the checksum & metadata gatherer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
    /// SHA-256 hex digest. Empty for directories or when checksumming was skipped.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub inode: u64,
    #[serde(default)]
    pub device: u64,
}

impl FileMetadata {
    pub fn new_dir(path: impl Into<String>, modified: DateTime<Utc>) -> Self {
        FileMetadata {
            path: path.into(),
            size: 0,
            modified,
            is_dir: true,
            checksum: String::new(),
            permissions: 0,
            inode: 0,
            device: 0,
        }
    }
}

/// Remote manifest entry, produced by the directory scanner from a DirectoryManifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub path: String,
    pub descriptor_cid: String,
    #[serde(default)]
    pub content_cid: Option<String>,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

/// A pair of metadata maps captured at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub local: HashMap<String, FileMetadata>,
    pub remote: HashMap<String, RemoteMetadata>,
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl StateSnapshot {
    pub fn new(local: HashMap<String, FileMetadata>, remote: HashMap<String, RemoteMetadata>) -> Self {
        StateSnapshot {
            local,
            remote,
            captured_at: Some(Utc::now()),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    CreateDir,
    DeleteDir,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub remote_path: String,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(kind: OperationKind, local_path: impl Into<String>, remote_path: impl Into<String>) -> Self {
        SyncOperation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            created_at: Utc::now(),
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Syncing,
    Conflict,
    Error,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub current_op: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// The persisted, per-session state owned exclusively by the state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub snapshot: StateSnapshot,
    #[serde(default)]
    pub manifest_cid: String,
    #[serde(default)]
    pub pending_ops: Vec<SyncOperation>,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub const MAX_HISTORY: usize = 1000;

impl SyncState {
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncSession {
    pub session_id: String,
    pub local_root: std::path::PathBuf,
    pub remote_root: String,
    pub manifest_cid: String,
    pub state: SyncState,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub progress: SessionProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    BothModified,
    DeletedLocal,
    DeletedRemote,
    TypeChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictAction {
    UseLocal,
    UseRemote,
    PromptUser,
    Rename,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub path: String,
    pub local: Option<FileMetadata>,
    pub remote: Option<RemoteMetadata>,
    pub kind: ConflictKind,
    #[serde(default)]
    pub resolution: Option<ConflictAction>,
    pub timestamp: DateTime<Utc>,
}

impl Conflict {
    pub fn new(path: impl Into<String>, kind: ConflictKind, local: Option<FileMetadata>, remote: Option<RemoteMetadata>) -> Self {
        Conflict {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            local,
            remote,
            kind,
            resolution: None,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of running a conflict through a [`crate::conflict::ConflictStrategy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResult {
    pub action: ConflictAction,
    /// Populated only for `action == Rename`: the two sibling paths created.
    #[serde(default)]
    pub renamed_paths: Option<(String, String)>,
    /// Populated only for `action == PromptUser`.
    #[serde(default)]
    pub prompt: Option<ConflictPrompt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPrompt {
    pub path: String,
    pub kind: ConflictKind,
    pub local: Option<FileMetadata>,
    pub remote: Option<RemoteMetadata>,
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransactionOperation {
    UpdateLocalSnapshot { path: String, metadata: FileMetadata },
    UpdateRemoteSnapshot { path: String, metadata: RemoteMetadata },
    DeleteLocalSnapshot { path: String },
    DeleteRemoteSnapshot { path: String },
    AddPendingOp { op: SyncOperation },
    RemovePendingOp { op_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub session_id: String,
    pub operations: Vec<TransactionOperation>,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(session_id: impl Into<String>, nanos: u128) -> Self {
        let session_id = session_id.into();
        Transaction {
            id: format!("tx_{session_id}_{nanos}"),
            session_id,
            operations: Vec::new(),
            status: TransactionStatus::Pending,
            started_at: Utc::now(),
            committed_at: None,
            rolled_back_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestOpKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntryInput {
    pub encrypted_name: Vec<u8>,
    pub cid: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestUpdateRequest {
    pub session_id: String,
    pub directory_path: String,
    pub kind: ManifestOpKind,
    pub entry: Option<DirectoryEntryInput>,
    #[serde(default)]
    pub prior_cid: Option<String>,
    #[serde(default)]
    pub new_cid: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveCandidate {
    pub old_path: String,
    pub new_path: String,
    pub confidence: f64,
    pub reason: String,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Create,
    Delete,
    Modify,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedChange {
    pub path: String,
    pub kind: ChangeKind,
    /// For `Move`, the path this entry moved from.
    #[serde(default)]
    pub moved_from: Option<String>,
    pub is_local: bool,
    #[serde(default)]
    pub local: Option<FileMetadata>,
    #[serde(default)]
    pub remote: Option<RemoteMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_metadata_round_trips_through_json() {
        let m = FileMetadata {
            path: "a/b.txt".into(),
            size: 42,
            modified: Utc::now(),
            is_dir: false,
            checksum: "abc123".into(),
            permissions: 0o644,
            inode: 7,
            device: 3,
        };
        let encoded = serde_json::to_string(&m).unwrap();
        let decoded: FileMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let mut state = SyncState::default();
        for i in 0..(MAX_HISTORY + 10) {
            state.push_history(HistoryEntry {
                timestamp: Utc::now(),
                operation_id: i.to_string(),
                kind: OperationKind::Upload,
                status: OperationStatus::Completed,
                detail: None,
            });
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history.front().unwrap().operation_id, "10");
    }
}
