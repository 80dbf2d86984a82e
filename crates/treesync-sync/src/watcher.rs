//! Recursive filesystem watching that feeds the change debouncer

use crate::debounce::{ChangeEvent, ChangeKind};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};
use treesync_types::{Error, Result};

/// Map a notify event kind onto a change kind, `None` for events with no effect on content
pub fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(ChangeKind::Metadata),
        EventKind::Modify(_) => Some(ChangeKind::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Watches app roots and forwards their changes
///
/// Dropping the watcher stops it and drops its sender, which in turn closes
/// the debouncer fed by it.
pub struct TreeWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl TreeWatcher {
    /// Start watching every root recursively, sending changes into `sink`
    pub fn start<I, P>(roots: I, sink: UnboundedSender<ChangeEvent>) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("Watch error: {}", e);
                    return;
                }
            };
            let Some(kind) = map_event_kind(&event.kind) else {
                return;
            };
            for path in event.paths {
                if sink.send(ChangeEvent::new(path, kind)).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| Error::other(format!("Failed to create watcher: {}", e)))?;

        let mut watched = Vec::new();
        for root in roots {
            let root = root.as_ref();
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| Error::read(root, format!("cannot watch: {}", e)))?;
            info!("Watching {}", root.display());
            watched.push(root.to_path_buf());
        }

        Ok(Self {
            _watcher: watcher,
            roots: watched,
        })
    }

    /// Roots being watched
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}
