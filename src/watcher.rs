//! File Watcher (§4.G): wraps the platform filesystem-notification
//! facility, debounces per path, and applies include/exclude filtering
//! before handing a [`WatchEvent`] to its bounded output channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};
use crate::filters::WatchFilters;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
const EVENTS_CAPACITY: usize = 100;
const ERRORS_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    FileCreated,
    FileModified,
    FileDeleted,
    DirCreated,
    DirDeleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

pub struct FileWatcher {
    _watcher: notify::RecommendedWatcher,
    roots: Arc<Mutex<Vec<PathBuf>>>,
}

impl FileWatcher {
    /// Start watching `roots`. Returns the watcher handle plus its two
    /// bounded output channels (events, errors).
    pub fn start(
        roots: Vec<PathBuf>,
        filters: WatchFilters,
        recursive: bool,
    ) -> EngineResult<(Self, mpsc::Receiver<WatchEvent>, mpsc::Receiver<EngineError>)> {
        let (event_tx, event_rx) = mpsc::channel(EVENTS_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(ERRORS_CAPACITY);

        let debounced: Arc<Mutex<HashMap<PathBuf, (WatchEventKind, tokio::time::Instant)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let roots_shared = Arc::new(Mutex::new(roots.clone()));
        let roots_for_closure = roots_shared.clone();

        let event_tx_for_closure = event_tx.clone();
        let error_tx_for_closure = error_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(e) => e,
                Err(err) => {
                    let _ = error_tx_for_closure.try_send(EngineError::io_msg(err.to_string()));
                    return;
                }
            };
            for path in &event.paths {
                if !within_any_root(path, &roots_for_closure) {
                    continue;
                }
                if !filters.allows(path) {
                    continue;
                }
                let Some(kind) = classify(&event.kind, path) else { continue };
                schedule_emit(&debounced, path.clone(), kind, event_tx_for_closure.clone());
            }
        })
        .map_err(|e| EngineError::io_msg(e.to_string()))?;

        let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        for root in &roots {
            watcher.watch(root, mode).map_err(|e| EngineError::io_msg(e.to_string()))?;
        }

        Ok((
            FileWatcher {
                _watcher: watcher,
                roots: roots_shared,
            },
            event_rx,
            error_rx,
        ))
    }

    /// Extend coverage to a newly-created subdirectory, per §4.G's
    /// "recursively adds every new subdirectory that appears" rule.
    pub fn add_root(&mut self, path: PathBuf) -> EngineResult<()> {
        self._watcher
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|e| EngineError::io_msg(e.to_string()))?;
        self.roots.lock().unwrap().push(path);
        Ok(())
    }
}

fn within_any_root(path: &Path, roots: &Arc<Mutex<Vec<PathBuf>>>) -> bool {
    roots.lock().unwrap().iter().any(|root| path.starts_with(root))
}

fn classify(kind: &EventKind, path: &Path) -> Option<WatchEventKind> {
    let is_dir = path.is_dir();
    match kind {
        EventKind::Create(_) => Some(if is_dir { WatchEventKind::DirCreated } else { WatchEventKind::FileCreated }),
        EventKind::Modify(_) => Some(if is_dir { WatchEventKind::DirCreated } else { WatchEventKind::FileModified }),
        EventKind::Remove(_) => {
            // The path no longer exists, so `is_dir()` can't tell us the
            // original type; callers care mainly that *something* left,
            // and snapshot diffing (§4.C) re-derives the correct kind.
            Some(WatchEventKind::FileDeleted)
        }
        _ => None,
    }
}

/// Collapse a burst of events on the same path into a single emission of
/// the most recent kind, delayed by the debounce window.
fn schedule_emit(
    debounced: &Arc<Mutex<HashMap<PathBuf, (WatchEventKind, tokio::time::Instant)>>>,
    path: PathBuf,
    kind: WatchEventKind,
    event_tx: mpsc::Sender<WatchEvent>,
) {
    let now = tokio::time::Instant::now();
    let mut map = debounced.lock().unwrap();
    map.insert(path.clone(), (kind, now));
    drop(map);

    let debounced = debounced.clone();
    tokio::spawn(async move {
        tokio::time::sleep(DEBOUNCE_WINDOW).await;
        let mut map = debounced.lock().unwrap();
        if let Some((latest_kind, seen_at)) = map.get(&path).copied() {
            if seen_at == now {
                map.remove(&path);
                drop(map);
                let _ = event_tx.try_send(WatchEvent { path, kind: latest_kind });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_create_modify_remove() {
        let dir = std::env::temp_dir();
        assert_eq!(
            classify(&EventKind::Remove(notify::event::RemoveKind::File), &dir),
            Some(WatchEventKind::FileDeleted)
        );
        assert_eq!(classify(&EventKind::Other, &dir), None);
    }

    #[tokio::test]
    async fn watcher_emits_debounced_create_event() {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("syncore-watch-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();

        let (_watcher, mut events, _errors) = FileWatcher::start(vec![dir.clone()], WatchFilters::empty(), true).unwrap();

        std::fs::write(dir.join("a.txt"), b"hi").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
        assert!(received.is_ok(), "expected a debounced event within 2s");
    }
}
