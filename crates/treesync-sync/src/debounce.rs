//! Debouncing of filesystem change events
//!
//! Editors and installers tend to write a file many times in a row. Rehashing
//! and recompressing on each of those writes is wasted work, so write events
//! are held per path until the path has been quiet for a minimum pass, and
//! only the newest one is delivered. Structural changes such as renames and
//! removals are forwarded at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Capacity of the debouncer's output channel
pub const OUTPUT_CAPACITY: usize = 100;

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A file or directory was created
    Create,
    /// File content was written
    Write,
    /// A file or directory was removed
    Remove,
    /// A file or directory was renamed
    Rename,
    /// Only metadata changed
    Metadata,
}

/// A change observed on one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute path that changed
    pub path: PathBuf,
    /// What happened to it
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Create a change event
    pub fn new<P: Into<PathBuf>>(path: P, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Events the debouncer knows how to coalesce
pub trait Coalesce {
    /// Path the event is about
    fn path(&self) -> &Path;

    /// Whether bursts of this event may be merged into the newest one
    fn coalesces(&self) -> bool;
}

impl Coalesce for ChangeEvent {
    fn path(&self) -> &Path {
        &self.path
    }

    fn coalesces(&self) -> bool {
        self.kind == ChangeKind::Write
    }
}

struct NotifyRecord<E> {
    last_event: Instant,
    pending: E,
}

/// Coalesces write bursts per path into a single delayed event
pub struct ChangeDebouncer;

impl ChangeDebouncer {
    /// Spawn the debouncer task on the current runtime
    ///
    /// A write-class event for a path is delivered once no further write to
    /// that path arrived for `minimal_pass`; the delivery happens on the next
    /// tick after that, ticks being `minimal_pass` apart. Other events are
    /// forwarded immediately.
    ///
    /// Dropping every input sender ends the task and closes the output.
    /// Records that were not yet due at that point are dropped.
    pub fn spawn<E>(minimal_pass: Duration) -> (mpsc::UnboundedSender<E>, mpsc::Receiver<E>)
    where
        E: Coalesce + Send + 'static,
    {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);

        tokio::spawn(run(minimal_pass, input_rx, output_tx));

        (input_tx, output_rx)
    }
}

async fn run<E: Coalesce>(
    minimal_pass: Duration,
    mut input: mpsc::UnboundedReceiver<E>,
    output: mpsc::Sender<E>,
) {
    let mut ticker = time::interval(minimal_pass);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut records: HashMap<PathBuf, NotifyRecord<E>> = HashMap::new();

    loop {
        tokio::select! {
            event = input.recv() => {
                let Some(event) = event else {
                    debug!("Change input closed, dropping {} pending record(s)", records.len());
                    break;
                };

                if event.coalesces() {
                    trace!("Holding write to {}", event.path().display());
                    records.insert(
                        event.path().to_path_buf(),
                        NotifyRecord { last_event: Instant::now(), pending: event },
                    );
                } else if output.send(event).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !flush_due(&mut records, minimal_pass, &output).await {
                    break;
                }
            }
        }
    }
}

/// Deliver every record quiet for longer than `minimal_pass`
///
/// Returns `false` once the receiver is gone.
async fn flush_due<E>(
    records: &mut HashMap<PathBuf, NotifyRecord<E>>,
    minimal_pass: Duration,
    output: &mpsc::Sender<E>,
) -> bool {
    let now = Instant::now();
    let due: Vec<PathBuf> = records
        .iter()
        .filter(|(_, record)| now.duration_since(record.last_event) > minimal_pass)
        .map(|(path, _)| path.clone())
        .collect();

    for path in due {
        if let Some(record) = records.remove(&path) {
            if output.send(record.pending).await.is_err() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    const PASS: Duration = Duration::from_millis(500);

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Tagged {
        path: PathBuf,
        write: bool,
        tag: u32,
    }

    impl Coalesce for Tagged {
        fn path(&self) -> &Path {
            &self.path
        }

        fn coalesces(&self) -> bool {
            self.write
        }
    }

    fn tagged(path: &str, write: bool, tag: u32) -> Tagged {
        Tagged {
            path: PathBuf::from(path),
            write,
            tag,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_burst_delivers_last_event_once() {
        let (tx, mut rx) = ChangeDebouncer::spawn::<Tagged>(PASS);
        let start = Instant::now();

        tx.send(tagged("/p", true, 0)).unwrap();
        sleep(Duration::from_millis(100)).await;
        tx.send(tagged("/p", true, 1)).unwrap();
        sleep(Duration::from_millis(100)).await;
        tx.send(tagged("/p", true, 2)).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tag, 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "delivered after {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1200), "delivered after {:?}", elapsed);

        assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_write_events_pass_through() {
        let (tx, mut rx) = ChangeDebouncer::spawn::<Tagged>(PASS);
        let start = Instant::now();

        tx.send(tagged("/p", true, 0)).unwrap();
        tx.send(tagged("/p", false, 1)).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tag, 1);
        assert!(start.elapsed() < PASS);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.tag, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paths_are_debounced_independently() {
        let (tx, mut rx) = ChangeDebouncer::spawn::<Tagged>(PASS);

        tx.send(tagged("/a", true, 1)).unwrap();
        tx.send(tagged("/b", true, 2)).unwrap();

        let mut tags = vec![rx.recv().await.unwrap().tag, rx.recv().await.unwrap().tag];
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_input_closes_output() {
        let (tx, mut rx) = ChangeDebouncer::spawn::<ChangeEvent>(PASS);

        tx.send(ChangeEvent::new("/p", ChangeKind::Remove)).unwrap();
        tx.send(ChangeEvent::new("/q", ChangeKind::Write)).unwrap();
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(ChangeEvent::new("/p", ChangeKind::Remove))
        );
        // The pending write was not yet due and is dropped
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_only_writes_coalesce() {
        assert!(ChangeEvent::new("/p", ChangeKind::Write).coalesces());
        for kind in [
            ChangeKind::Create,
            ChangeKind::Remove,
            ChangeKind::Rename,
            ChangeKind::Metadata,
        ] {
            assert!(!ChangeEvent::new("/p", kind).coalesces());
        }
    }
}
