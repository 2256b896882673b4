//! Conflict resolution (§4.F): pluggable strategies over a detected
//! [`Conflict`], a bounded resolution history, and rename-on-conflict
//! sibling naming grounded in this pack's own conflict-resolution idiom.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{Conflict, ConflictAction, ConflictPrompt, ConflictResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategyKind {
    LocalWins,
    RemoteWins,
    Timestamp,
    Prompt,
    Rename,
}

impl Default for ConflictStrategyKind {
    fn default() -> Self {
        ConflictStrategyKind::Timestamp
    }
}

/// Resolves a single [`Conflict`] into a [`ConflictResult`].
///
/// Implementations never touch the filesystem or remote store directly —
/// they decide; the engine carries the decision out.
pub trait ConflictStrategy: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> ConflictResult;
}

pub fn strategy_for(kind: ConflictStrategyKind) -> Box<dyn ConflictStrategy> {
    match kind {
        ConflictStrategyKind::LocalWins => Box::new(LocalWinsStrategy),
        ConflictStrategyKind::RemoteWins => Box::new(RemoteWinsStrategy),
        ConflictStrategyKind::Timestamp => Box::new(TimestampStrategy),
        ConflictStrategyKind::Prompt => Box::new(PromptStrategy),
        ConflictStrategyKind::Rename => Box::new(RenameStrategy),
    }
}

pub struct LocalWinsStrategy;

impl ConflictStrategy for LocalWinsStrategy {
    fn resolve(&self, _conflict: &Conflict) -> ConflictResult {
        ConflictResult {
            action: ConflictAction::UseLocal,
            renamed_paths: None,
            prompt: None,
        }
    }
}

pub struct RemoteWinsStrategy;

impl ConflictStrategy for RemoteWinsStrategy {
    fn resolve(&self, _conflict: &Conflict) -> ConflictResult {
        ConflictResult {
            action: ConflictAction::UseRemote,
            renamed_paths: None,
            prompt: None,
        }
    }
}

/// Newer `modified` timestamp wins; on a tie the larger size wins; if both
/// are exactly equal, remote wins.
pub struct TimestampStrategy;

impl ConflictStrategy for TimestampStrategy {
    fn resolve(&self, conflict: &Conflict) -> ConflictResult {
        let local_modified = conflict.local.as_ref().map(|m| m.modified);
        let remote_modified = conflict.remote.as_ref().map(|m| m.modified);
        let action = match (local_modified, remote_modified) {
            (Some(l), Some(r)) if l > r => ConflictAction::UseLocal,
            (Some(l), Some(r)) if r > l => ConflictAction::UseRemote,
            (Some(_), Some(_)) => {
                let local_size = conflict.local.as_ref().map(|m| m.size).unwrap_or(0);
                let remote_size = conflict.remote.as_ref().map(|m| m.size).unwrap_or(0);
                if local_size > remote_size {
                    ConflictAction::UseLocal
                } else if remote_size > local_size {
                    ConflictAction::UseRemote
                } else {
                    ConflictAction::UseRemote
                }
            }
            (Some(_), None) => ConflictAction::UseLocal,
            (None, Some(_)) => ConflictAction::UseRemote,
            (None, None) => ConflictAction::UseRemote,
        };
        ConflictResult {
            action,
            renamed_paths: None,
            prompt: None,
        }
    }
}

pub struct PromptStrategy;

impl ConflictStrategy for PromptStrategy {
    fn resolve(&self, conflict: &Conflict) -> ConflictResult {
        ConflictResult {
            action: ConflictAction::PromptUser,
            renamed_paths: None,
            prompt: Some(ConflictPrompt {
                path: conflict.path.clone(),
                kind: conflict.kind,
                local: conflict.local.clone(),
                remote: conflict.remote.clone(),
                choices: vec![
                    "use-local".to_string(),
                    "use-remote".to_string(),
                    "rename".to_string(),
                    "skip".to_string(),
                ],
            }),
        }
    }
}

/// Keeps both sides by renaming each onto a `.local.<timestamp>` /
/// `.remote.<timestamp>` sibling instead of picking a winner.
pub struct RenameStrategy;

impl ConflictStrategy for RenameStrategy {
    fn resolve(&self, conflict: &Conflict) -> ConflictResult {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        ConflictResult {
            action: ConflictAction::Rename,
            renamed_paths: Some((
                format!("{}.local.{}", conflict.path, stamp),
                format!("{}.remote.{}", conflict.path, stamp),
            )),
            prompt: None,
        }
    }
}

const MAX_CONFLICT_HISTORY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictStats {
    pub total: u64,
    pub by_action: Vec<(ConflictAction, u64)>,
}

/// Ring buffer of resolved conflicts, bounded to keep memory flat over a
/// long-running session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConflictHistory {
    entries: VecDeque<Conflict>,
}

impl ConflictHistory {
    pub fn record(&mut self, mut conflict: Conflict, result: &ConflictResult) {
        conflict.resolution = Some(result.action);
        self.entries.push_back(conflict);
        while self.entries.len() > MAX_CONFLICT_HISTORY {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Conflict> {
        self.entries.iter()
    }

    pub fn stats(&self) -> ConflictStats {
        let mut counts: Vec<(ConflictAction, u64)> = Vec::new();
        for c in &self.entries {
            let Some(action) = c.resolution else { continue };
            if let Some(entry) = counts.iter_mut().find(|(a, _)| *a == action) {
                entry.1 += 1;
            } else {
                counts.push((action, 1));
            }
        }
        ConflictStats {
            total: self.entries.len() as u64,
            by_action: counts,
        }
    }
}
