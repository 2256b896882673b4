//! Move Detector (§4.D): correlates deletes/creates within the same side
//! into MoveCandidates via inode/checksum/CID/name-similarity signals.

use std::collections::HashSet;

use crate::model::{FileMetadata, MoveCandidate, RemoteMetadata, StateSnapshot};

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.7;

pub struct MoveDetector {
    min_confidence: f64,
}

impl Default for MoveDetector {
    fn default() -> Self {
        MoveDetector {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl MoveDetector {
    pub fn new(min_confidence: f64) -> Self {
        MoveDetector { min_confidence }
    }

    /// Find move candidates between `old` and `new`, local and remote sides
    /// considered independently. Result is sorted by confidence descending.
    pub fn detect(&self, old: &StateSnapshot, new: &StateSnapshot) -> Vec<MoveCandidate> {
        let mut candidates = Vec::new();
        candidates.extend(self.detect_local(old, new));
        candidates.extend(self.detect_remote(old, new));
        candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
        candidates
    }

    fn detect_local(&self, old: &StateSnapshot, new: &StateSnapshot) -> Vec<MoveCandidate> {
        let deleted: Vec<&FileMetadata> = old
            .local
            .iter()
            .filter(|(path, _)| !new.local.contains_key(*path))
            .map(|(_, m)| m)
            .collect();
        let created: Vec<&FileMetadata> = new
            .local
            .iter()
            .filter(|(path, _)| !old.local.contains_key(*path))
            .map(|(_, m)| m)
            .collect();

        let mut used_new: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for d in &deleted {
            let mut best: Option<(f64, String, &FileMetadata)> = None;
            for c in &created {
                if used_new.contains(&c.path) {
                    continue;
                }
                let (score, reason) = local_confidence(d, c);
                if score >= self.min_confidence {
                    if best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true) {
                        best = Some((score, reason, c));
                    }
                }
            }
            if let Some((confidence, reason, c)) = best {
                used_new.insert(c.path.clone());
                out.push(MoveCandidate {
                    old_path: d.path.clone(),
                    new_path: c.path.clone(),
                    confidence,
                    reason,
                    is_local: true,
                });
            }
        }
        out
    }

    fn detect_remote(&self, old: &StateSnapshot, new: &StateSnapshot) -> Vec<MoveCandidate> {
        let deleted: Vec<&RemoteMetadata> = old
            .remote
            .iter()
            .filter(|(path, _)| !new.remote.contains_key(*path))
            .map(|(_, m)| m)
            .collect();
        let created: Vec<&RemoteMetadata> = new
            .remote
            .iter()
            .filter(|(path, _)| !old.remote.contains_key(*path))
            .map(|(_, m)| m)
            .collect();

        let mut used_new: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for d in &deleted {
            let mut best: Option<(f64, String, &RemoteMetadata)> = None;
            for c in &created {
                if used_new.contains(&c.path) {
                    continue;
                }
                let (score, reason) = remote_confidence(d, c);
                if score >= self.min_confidence
                    && best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true)
                {
                    best = Some((score, reason, c));
                }
            }
            if let Some((confidence, reason, c)) = best {
                used_new.insert(c.path.clone());
                out.push(MoveCandidate {
                    old_path: d.path.clone(),
                    new_path: c.path.clone(),
                    confidence,
                    reason,
                    is_local: false,
                });
            }
        }
        out
    }
}

fn local_confidence(old: &FileMetadata, new: &FileMetadata) -> (f64, String) {
    let mut reasons = Vec::new();

    if old.inode != 0 && old.device != 0 && old.inode == new.inode && old.device == new.device {
        return (1.0, "identical inode+device".to_string());
    }

    let mut score = 0.0f64;
    if !old.checksum.is_empty() && old.checksum == new.checksum && old.size > 0 {
        score += 0.8;
        reasons.push("identical checksum");
    }
    if old.size == new.size && old.modified == new.modified && old.modified.timestamp() != 0 {
        score += 0.4;
        reasons.push("identical size+mtime");
    }
    let sim = filename_similarity(&base_name(&old.path), &base_name(&new.path));
    if sim > 0.0 {
        score += sim * 0.3;
        reasons.push("name similarity");
    }
    if old.is_dir == new.is_dir {
        score += 0.1;
        reasons.push("same type");
    }
    if old.permissions == new.permissions {
        score += 0.1;
        reasons.push("same permissions");
    }

    (score.min(1.0), reasons.join(", "))
}

fn remote_confidence(old: &RemoteMetadata, new: &RemoteMetadata) -> (f64, String) {
    let mut reasons = Vec::new();

    if !old.descriptor_cid.is_empty() && old.descriptor_cid == new.descriptor_cid {
        return (1.0, "identical descriptor CID".to_string());
    }

    let mut score = 0.0f64;
    if old.content_cid.is_some() && old.content_cid == new.content_cid {
        score += 0.9;
        reasons.push("identical content CID");
    }
    if old.size == new.size && old.modified == new.modified && old.modified.timestamp() != 0 {
        score += 0.5;
        reasons.push("identical size+mtime");
    }
    let sim = filename_similarity(&base_name(&old.path), &base_name(&new.path));
    if sim > 0.0 {
        score += sim * 0.3;
        reasons.push("name similarity");
    }
    if old.is_dir == new.is_dir {
        score += 0.1;
        reasons.push("same type");
    }

    (score.min(1.0), reasons.join(", "))
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Exact base-name match → 1.0; otherwise case-insensitive Levenshtein
/// distance normalized by the longer string's length.
fn filename_similarity(a: &str, b: &str) -> f64 {
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let dist = levenshtein(&a, &b);
    1.0 - (dist as f64 / max_len as f64)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut prev = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let tmp = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev
            } else {
                1 + prev.min(row[j]).min(row[j - 1])
            };
            prev = tmp;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn local_meta(path: &str, inode: u64, checksum: &str) -> FileMetadata {
        FileMetadata {
            path: path.to_string(),
            size: 100,
            modified: Utc::now(),
            is_dir: false,
            checksum: checksum.to_string(),
            permissions: 0o644,
            inode,
            device: if inode == 0 { 0 } else { 1 },
        }
    }

    #[test]
    fn identical_inode_yields_confidence_one() {
        let mut old = StateSnapshot::default();
        let mut new = StateSnapshot::default();
        old.local.insert("old/doc.pdf".into(), local_meta("old/doc.pdf", 7777, "X"));
        new.local.insert("new/doc.pdf".into(), local_meta("new/doc.pdf", 7777, "X"));

        let detector = MoveDetector::default();
        let moves = detector.detect(&old, &new);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].confidence, 1.0);
        assert_eq!(moves[0].old_path, "old/doc.pdf");
        assert_eq!(moves[0].new_path, "new/doc.pdf");
    }

    #[test]
    fn name_similarity_alone_below_threshold_is_not_a_move() {
        let mut old = StateSnapshot::default();
        let mut new = StateSnapshot::default();
        old.local.insert(
            "a/report1.txt".into(),
            FileMetadata {
                checksum: String::new(),
                ..local_meta("a/report1.txt", 0, "")
            },
        );
        new.local.insert(
            "b/totally-different-name.txt".into(),
            FileMetadata {
                size: 999,
                checksum: String::new(),
                ..local_meta("b/totally-different-name.txt", 0, "")
            },
        );

        let detector = MoveDetector::new(0.9);
        let moves = detector.detect(&old, &new);
        assert!(moves.is_empty());
    }

    #[test]
    fn remote_identical_descriptor_cid_yields_confidence_one() {
        let mut old = StateSnapshot::default();
        let mut new = StateSnapshot::default();
        old.remote.insert(
            "old/x.bin".into(),
            RemoteMetadata {
                path: "old/x.bin".into(),
                descriptor_cid: "cid123".into(),
                content_cid: None,
                size: 10,
                modified: Utc::now(),
                is_dir: false,
                last_sync: None,
                version: 1,
            },
        );
        new.remote.insert(
            "new/x.bin".into(),
            RemoteMetadata {
                path: "new/x.bin".into(),
                descriptor_cid: "cid123".into(),
                content_cid: None,
                size: 10,
                modified: Utc::now(),
                is_dir: false,
                last_sync: None,
                version: 2,
            },
        );

        let detector = MoveDetector::default();
        let moves = detector.detect(&old, &new);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].confidence, 1.0);
        assert!(!moves[0].is_local);
    }

    #[test]
    fn filename_similarity_exact_match_is_one() {
        assert_eq!(filename_similarity("Doc.PDF", "doc.pdf"), 1.0);
    }

    #[test]
    fn levenshtein_distance_basic() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("a", "a"), 0);
    }
}
