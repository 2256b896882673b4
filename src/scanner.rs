//! Directory Scanner (§4.B): builds a [`StateSnapshot`] from the local
//! filesystem and from the remote manifest tree, then turns a diff into
//! an ordered list of [`SyncOperation`]s.

use std::path::Path;

use crate::checksum::gather_directory_metadata;
use crate::collaborators::{DirectoryManager, EntryType, RequestContext};
use crate::error::EngineResult;
use crate::model::{DetectedChange, ChangeKind, OperationKind, RemoteMetadata, StateSnapshot, SyncOperation};

pub struct ScanResult {
    pub snapshot: StateSnapshot,
}

pub struct DirectoryScanner;

impl DirectoryScanner {
    pub fn scan_local(root: &Path, want_checksum: bool) -> StateSnapshot {
        let local = gather_directory_metadata(root, want_checksum);
        StateSnapshot::new(local, Default::default())
    }

    /// Recursively descend the remote directory-manifest tree rooted at
    /// `root_cid`, decrypting each entry's name with `decrypt_name` and
    /// collecting a flat path -> [`RemoteMetadata`] map.
    pub async fn scan_remote(
        dir_manager: &dyn DirectoryManager,
        root_path: &str,
        root_cid: &str,
        decrypt_name: &dyn Fn(&[u8]) -> EngineResult<String>,
    ) -> EngineResult<StateSnapshot> {
        let ctx = RequestContext::default();
        let mut remote = std::collections::HashMap::new();
        let mut stack = vec![(root_path.to_string(), root_cid.to_string())];

        while let Some((path, cid)) = stack.pop() {
            let manifest = dir_manager.retrieve_manifest(&ctx, &path, &cid).await?;
            for entry in manifest.entries {
                let name = decrypt_name(&entry.encrypted_name)?;
                let child_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
                let is_dir = entry.entry_type == EntryType::Directory;
                remote.insert(
                    child_path.clone(),
                    RemoteMetadata {
                        path: child_path.clone(),
                        descriptor_cid: entry.cid.clone(),
                        content_cid: if is_dir { None } else { Some(entry.cid.clone()) },
                        size: entry.size,
                        modified: entry.modified,
                        is_dir,
                        last_sync: None,
                        version: 0,
                    },
                );
                if is_dir {
                    stack.push((child_path, entry.cid));
                }
            }
        }

        Ok(StateSnapshot::new(Default::default(), remote))
    }

    /// A baseline scan with an empty prior snapshot, used on first run for
    /// a session with no persisted state.
    pub fn initial_scan(root: &Path, want_checksum: bool) -> ScanResult {
        ScanResult {
            snapshot: Self::scan_local(root, want_checksum),
        }
    }

    /// Turn a change list into operations in the strict order §4.B
    /// requires: directory creates first (so children have somewhere to
    /// land), then file-level operations, then deletes last (so a
    /// rename-as-delete+create never races the delete ahead of its
    /// matching create).
    pub fn generate_sync_operations(changes: &[DetectedChange]) -> Vec<SyncOperation> {
        let mut dir_creates = Vec::new();
        let mut file_ops = Vec::new();
        let mut deletes = Vec::new();

        for change in changes {
            match change.kind {
                ChangeKind::Create if is_dir_change(change) => {
                    dir_creates.push(make_op(OperationKind::CreateDir, change));
                }
                ChangeKind::Create | ChangeKind::Modify => {
                    let kind = if change.is_local { OperationKind::Upload } else { OperationKind::Download };
                    file_ops.push(make_op(kind, change));
                }
                ChangeKind::Move => {
                    file_ops.push(make_op(OperationKind::Move, change));
                }
                ChangeKind::Delete => {
                    let kind = if is_dir_change(change) { OperationKind::DeleteDir } else { OperationKind::Delete };
                    deletes.push(make_op(kind, change));
                }
            }
        }

        dir_creates.into_iter().chain(file_ops).chain(deletes).collect()
    }
}

fn is_dir_change(change: &DetectedChange) -> bool {
    change.local.as_ref().map(|m| m.is_dir).or(change.remote.as_ref().map(|m| m.is_dir)).unwrap_or(false)
}

fn make_op(kind: OperationKind, change: &DetectedChange) -> SyncOperation {
    let mut op = SyncOperation::new(kind, change.path.clone(), change.path.clone());
    if let Some(from) = &change.moved_from {
        op.local_path = from.clone();
        op.remote_path = change.path.clone();
    }
    op
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileMetadata;
    use std::fs;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("syncore-scanner-{name}-{nanos}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scan_local_finds_files_and_dirs() {
        let dir = temp_dir("scan");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), b"hi").unwrap();
        let snap = DirectoryScanner::scan_local(&dir, true);
        assert!(snap.local.contains_key("a.txt"));
        assert!(snap.local.contains_key("sub"));
    }

    #[test]
    fn operations_order_dirs_before_files_before_deletes() {
        let changes = vec![
            DetectedChange {
                path: "old.txt".into(),
                kind: ChangeKind::Delete,
                moved_from: None,
                is_local: true,
                local: Some(dir_meta("old.txt", false)),
                remote: None,
            },
            DetectedChange {
                path: "new.txt".into(),
                kind: ChangeKind::Create,
                moved_from: None,
                is_local: true,
                local: Some(dir_meta("new.txt", false)),
                remote: None,
            },
            DetectedChange {
                path: "newdir".into(),
                kind: ChangeKind::Create,
                moved_from: None,
                is_local: true,
                local: Some(dir_meta("newdir", true)),
                remote: None,
            },
        ];
        let ops = DirectoryScanner::generate_sync_operations(&changes);
        assert_eq!(ops[0].kind, OperationKind::CreateDir);
        assert_eq!(ops[1].kind, OperationKind::Upload);
        assert_eq!(ops[2].kind, OperationKind::Delete);
    }

    fn dir_meta(path: &str, is_dir: bool) -> FileMetadata {
        FileMetadata {
            path: path.into(),
            size: 0,
            modified: chrono::Utc::now(),
            is_dir,
            checksum: String::new(),
            permissions: 0,
            inode: 0,
            device: 0,
        }
    }
}
