//! Change notification for pending keys.
//!
//! Waiters on a pending key receive a one-shot [`Subscription`] that
//! resolves when the key leaves `Pending`. All waiters on one key share a
//! single OS-level watch (inotify on Linux, kqueue on the BSDs) on the
//! pending directory; raw events are coalesced by a background worker that
//! re-queries the key under the store lock and drains the key's resolver
//! list. A periodic sweep stands in for platforms or mounts whose change
//! events are unreliable, and carries the whole load when no watcher could
//! be created at all.
//!
//! Transitions performed by this process resolve waiters directly while the
//! store lock is held; the filesystem watch exists for transitions performed
//! by sibling processes.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use hoard_domain::ContentHash;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::{layout, lock::StoreLock, read_disk_state, BuildOutcome, DiskState, StoreError};

/// Safety net for unreliable change events (network mounts, platforms with
/// neither inotify nor kqueue).
const POLL_INTERVAL: Duration = Duration::from_secs(600);

pub(super) struct Notifier {
    shared: Arc<WatchShared>,
    signal_tx: Sender<RawSignal>,
    worker: Option<thread::JoinHandle<()>>,
}

struct WatchShared {
    root: PathBuf,
    lock: Arc<StoreLock>,
    watches: Mutex<HashMap<ContentHash, KeyWatch>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    next_slot: AtomicU64,
}

struct KeyWatch {
    /// Whether an OS watch is active for the pending directory. When false,
    /// only the periodic sweep covers this key.
    watched: bool,
    resolvers: Vec<(u64, Sender<BuildOutcome>)>,
}

impl KeyWatch {
    fn new() -> Self {
        Self {
            watched: false,
            resolvers: Vec::new(),
        }
    }
}

enum RawSignal {
    Fs(PathBuf),
    Sweep,
    Shutdown,
}

impl Notifier {
    pub(super) fn start(root: PathBuf, lock: Arc<StoreLock>) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel();
        let forward = signal_tx.clone();
        let watcher = RecommendedWatcher::new(
            move |event: notify::Result<notify::Event>| match event {
                Ok(event) => {
                    for path in event.paths {
                        let _ = forward.send(RawSignal::Fs(path));
                    }
                }
                Err(err) => {
                    let _ = forward.send(RawSignal::Sweep);
                    debug!(%err, "filesystem watch error, sweeping all watched keys");
                }
            },
            notify::Config::default(),
        );
        let watcher = match watcher {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(%err, "filesystem watcher unavailable, relying on periodic polling");
                None
            }
        };
        let shared = Arc::new(WatchShared {
            root,
            lock,
            watches: Mutex::new(HashMap::new()),
            watcher: Mutex::new(watcher),
            next_slot: AtomicU64::new(0),
        });
        let worker = thread::spawn({
            let shared = Arc::clone(&shared);
            move || worker_loop(&shared, &signal_rx)
        });
        Self {
            shared,
            signal_tx,
            worker: Some(worker),
        }
    }

    /// Register a waiter for a key that is currently pending. Must be called
    /// with the store lock held so registration is atomic with the state
    /// check that found the key pending.
    pub(super) fn subscribe(&self, hash: &ContentHash) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let slot = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        {
            let mut watches = self.shared.watches.lock().expect("watch table poisoned");
            let entry = watches.entry(*hash).or_insert_with(KeyWatch::new);
            entry.resolvers.push((slot, tx));
            if !entry.watched {
                entry.watched = self.shared.watch_pending_dir(hash);
            }
        }
        Subscription {
            shared: Arc::clone(&self.shared),
            hash: *hash,
            slot,
            outcome: rx,
        }
    }

    /// Resolve every waiter on `hash`. Called by the transition engine while
    /// it still holds the store lock.
    pub(super) fn resolve(&self, hash: &ContentHash, outcome: BuildOutcome) {
        self.shared.resolve(hash, &outcome);
    }

    pub(super) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.signal_tx.send(RawSignal::Shutdown);
        if worker.join().is_err() {
            warn!("store watch worker panicked");
        }
        // Dropping the resolver senders wakes outstanding waiters with a
        // closed-store error; dropping the watcher stops its event source.
        self.shared
            .watches
            .lock()
            .expect("watch table poisoned")
            .clear();
        *self.shared.watcher.lock().expect("watcher poisoned") = None;
    }
}

impl WatchShared {
    fn watch_pending_dir(&self, hash: &ContentHash) -> bool {
        let path = layout::pending_path(&self.root, hash);
        let mut watcher = self.watcher.lock().expect("watcher poisoned");
        let Some(watcher) = watcher.as_mut() else {
            return false;
        };
        match watcher.watch(&path, RecursiveMode::NonRecursive) {
            Ok(()) => true,
            Err(err) => {
                warn!(%hash, %err, "failed to watch pending directory, relying on periodic polling");
                false
            }
        }
    }

    fn unwatch_pending_dir(&self, hash: &ContentHash) {
        let path = layout::pending_path(&self.root, hash);
        let mut watcher = self.watcher.lock().expect("watcher poisoned");
        let Some(watcher) = watcher.as_mut() else {
            return;
        };
        // Removal races with the OS dropping the watch when the directory is
        // renamed away or deleted; failing here is expected.
        if let Err(err) = watcher.unwatch(&path) {
            debug!(%hash, %err, "pending watch already removed");
        }
    }

    fn resolve(&self, hash: &ContentHash, outcome: &BuildOutcome) {
        let entry = {
            self.watches
                .lock()
                .expect("watch table poisoned")
                .remove(hash)
        };
        let Some(entry) = entry else {
            return;
        };
        if entry.watched {
            self.unwatch_pending_dir(hash);
        }
        debug!(%hash, waiters = entry.resolvers.len(), outcome = outcome_tag(outcome), "resolving waiters");
        for (_slot, tx) in entry.resolvers {
            // A waiter may have been dropped since; that is its business.
            let _ = tx.send(outcome.clone());
        }
    }

    /// Drop one waiter's resolver. The last waiter to leave tears the watch
    /// down.
    fn release_slot(&self, hash: &ContentHash, slot: u64) {
        let mut watches = self.watches.lock().expect("watch table poisoned");
        let Some(entry) = watches.get_mut(hash) else {
            return;
        };
        entry.resolvers.retain(|(id, _)| *id != slot);
        if entry.resolvers.is_empty() {
            let watched = entry.watched;
            watches.remove(hash);
            drop(watches);
            if watched {
                self.unwatch_pending_dir(hash);
            }
        }
    }

    fn watched_keys(&self) -> Vec<ContentHash> {
        self.watches
            .lock()
            .expect("watch table poisoned")
            .keys()
            .copied()
            .collect()
    }

    fn keys_for_path(&self, path: &Path) -> Vec<ContentHash> {
        self.watches
            .lock()
            .expect("watch table poisoned")
            .keys()
            .filter(|hash| path.starts_with(layout::pending_path(&self.root, hash)))
            .copied()
            .collect()
    }
}

fn outcome_tag(outcome: &BuildOutcome) -> &'static str {
    match outcome {
        BuildOutcome::Completed(_) => "completed",
        BuildOutcome::Failed => "failed",
    }
}

fn worker_loop(shared: &WatchShared, signals: &Receiver<RawSignal>) {
    let mut next_sweep = Instant::now() + POLL_INTERVAL;
    loop {
        let timeout = next_sweep.saturating_duration_since(Instant::now());
        let first = match signals.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut dirty: HashSet<ContentHash> = HashSet::new();
        let mut sweep = first.is_none();
        let mut shutdown = false;
        if let Some(signal) = first {
            apply_signal(shared, signal, &mut dirty, &mut sweep, &mut shutdown);
        }
        // Coalesce everything already queued before taking the store lock.
        while let Ok(signal) = signals.try_recv() {
            apply_signal(shared, signal, &mut dirty, &mut sweep, &mut shutdown);
        }
        if shutdown {
            return;
        }
        if sweep {
            dirty.extend(shared.watched_keys());
            next_sweep = Instant::now() + POLL_INTERVAL;
        }
        if !dirty.is_empty() {
            settle(shared, &dirty);
        }
    }
}

fn apply_signal(
    shared: &WatchShared,
    signal: RawSignal,
    dirty: &mut HashSet<ContentHash>,
    sweep: &mut bool,
    shutdown: &mut bool,
) {
    match signal {
        RawSignal::Fs(path) => dirty.extend(shared.keys_for_path(&path)),
        RawSignal::Sweep => *sweep = true,
        RawSignal::Shutdown => *shutdown = true,
    }
}

/// Re-query each dirty key under the store lock and resolve the ones that
/// left `Pending`. A key whose completion link turned out corrupted resolves
/// as failed: its content is not going to materialize.
fn settle(shared: &WatchShared, dirty: &HashSet<ContentHash>) {
    let guard = match shared.lock.acquire() {
        Ok(guard) => guard,
        Err(err) => {
            warn!(%err, "failed to take the store lock for watch settlement");
            return;
        }
    };
    for hash in dirty {
        let state = match read_disk_state(&shared.root, hash) {
            Ok(state) => state,
            Err(err) => {
                warn!(%hash, %err, "failed to re-query watched key");
                continue;
            }
        };
        match state {
            DiskState::Pending(_) => {}
            DiskState::Complete(item) => shared.resolve(hash, &BuildOutcome::Completed(item)),
            DiskState::Missing | DiskState::Corrupted { .. } => {
                shared.resolve(hash, &BuildOutcome::Failed);
            }
        }
    }
    drop(guard);
}

/// One-shot handle for a waiter on a pending key.
///
/// Resolves exactly once, with [`BuildOutcome::Completed`] when the key
/// becomes complete or [`BuildOutcome::Failed`] when it goes missing.
/// Dropping an unresolved handle cancels the wait.
pub struct Subscription {
    shared: Arc<WatchShared>,
    hash: ContentHash,
    slot: u64,
    outcome: Receiver<BuildOutcome>,
}

impl Subscription {
    /// The key this handle is waiting on.
    #[must_use]
    pub fn key(&self) -> ContentHash {
        self.hash
    }

    /// Block until the key leaves `Pending`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::Closed`] if the store is shut down before
    /// the key settles.
    pub fn wait(self) -> Result<BuildOutcome> {
        match self.outcome.recv() {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(StoreError::Closed.into()),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("hash", &self.hash)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.release_slot(&self.hash, self.slot);
    }
}
