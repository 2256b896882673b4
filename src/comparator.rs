//! State Comparator (§4.C): diffs two snapshots into an ordered change
//! list, folds in move detection, and classifies cross-side conflicts.

use crate::model::{ChangeKind, Conflict, ConflictKind, DetectedChange, StateSnapshot};
use crate::move_detector::MoveDetector;

pub struct StateComparator {
    move_detector: MoveDetector,
}

impl Default for StateComparator {
    fn default() -> Self {
        StateComparator {
            move_detector: MoveDetector::default(),
        }
    }
}

impl StateComparator {
    pub fn new(move_detector: MoveDetector) -> Self {
        StateComparator { move_detector }
    }

    pub fn compare(&self, old: &StateSnapshot, new: &StateSnapshot) -> Vec<DetectedChange> {
        let mut changes = Vec::new();

        for (path, new_meta) in &new.local {
            match old.local.get(path) {
                None => changes.push(DetectedChange {
                    path: path.clone(),
                    kind: ChangeKind::Create,
                    moved_from: None,
                    is_local: true,
                    local: Some(new_meta.clone()),
                    remote: None,
                }),
                Some(old_meta) => {
                    if local_differs(old_meta, new_meta) {
                        changes.push(DetectedChange {
                            path: path.clone(),
                            kind: ChangeKind::Modify,
                            moved_from: None,
                            is_local: true,
                            local: Some(new_meta.clone()),
                            remote: None,
                        });
                    }
                }
            }
        }
        for (path, old_meta) in &old.local {
            if !new.local.contains_key(path) {
                changes.push(DetectedChange {
                    path: path.clone(),
                    kind: ChangeKind::Delete,
                    moved_from: None,
                    is_local: true,
                    local: Some(old_meta.clone()),
                    remote: None,
                });
            }
        }

        for (path, new_meta) in &new.remote {
            match old.remote.get(path) {
                None => changes.push(DetectedChange {
                    path: path.clone(),
                    kind: ChangeKind::Create,
                    moved_from: None,
                    is_local: false,
                    local: None,
                    remote: Some(new_meta.clone()),
                }),
                Some(old_meta) => {
                    if remote_differs(old_meta, new_meta) {
                        changes.push(DetectedChange {
                            path: path.clone(),
                            kind: ChangeKind::Modify,
                            moved_from: None,
                            is_local: false,
                            local: None,
                            remote: Some(new_meta.clone()),
                        });
                    }
                }
            }
        }
        for (path, old_meta) in &old.remote {
            if !new.remote.contains_key(path) {
                changes.push(DetectedChange {
                    path: path.clone(),
                    kind: ChangeKind::Delete,
                    moved_from: None,
                    is_local: false,
                    local: None,
                    remote: Some(old_meta.clone()),
                });
            }
        }

        for candidate in self.move_detector.detect(old, new) {
            changes.push(DetectedChange {
                path: candidate.new_path.clone(),
                kind: ChangeKind::Move,
                moved_from: Some(candidate.old_path),
                is_local: candidate.is_local,
                local: new.local.get(&candidate.new_path).cloned(),
                remote: new.remote.get(&candidate.new_path).cloned(),
            });
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    /// Cross-reference a local change list against a remote change list,
    /// emitting a Conflict for every path that appears in both with
    /// incompatible intents.
    pub fn detect_conflicts(&self, local_changes: &[DetectedChange], remote_changes: &[DetectedChange]) -> Vec<Conflict> {
        let mut out = Vec::new();
        for l in local_changes {
            let Some(r) = remote_changes.iter().find(|r| r.path == l.path) else {
                continue;
            };
            let kind = match (l.kind, r.kind) {
                (ChangeKind::Modify, ChangeKind::Modify) => ConflictKind::BothModified,
                (ChangeKind::Delete, ChangeKind::Modify) => ConflictKind::DeletedLocal,
                (ChangeKind::Modify, ChangeKind::Delete) => ConflictKind::DeletedRemote,
                (ChangeKind::Create, ChangeKind::Create)
                | (ChangeKind::Create, ChangeKind::Modify)
                | (ChangeKind::Modify, ChangeKind::Create) => {
                    if type_mismatch(l, r) {
                        ConflictKind::TypeChanged
                    } else {
                        ConflictKind::BothModified
                    }
                }
                _ => continue,
            };
            out.push(Conflict::new(l.path.clone(), kind, l.local.clone(), r.remote.clone()));
        }
        out
    }
}

fn type_mismatch(l: &DetectedChange, r: &DetectedChange) -> bool {
    match (&l.local, &r.remote) {
        (Some(local), Some(remote)) => local.is_dir != remote.is_dir,
        _ => false,
    }
}

fn local_differs(old: &crate::model::FileMetadata, new: &crate::model::FileMetadata) -> bool {
    old.size != new.size
        || old.modified != new.modified
        || (!old.checksum.is_empty() && !new.checksum.is_empty() && old.checksum != new.checksum)
        || old.permissions != new.permissions
}

fn remote_differs(old: &crate::model::RemoteMetadata, new: &crate::model::RemoteMetadata) -> bool {
    old.descriptor_cid != new.descriptor_cid
        || old.content_cid != new.content_cid
        || old.version != new.version
        || old.size != new.size
        || old.modified != new.modified
}
