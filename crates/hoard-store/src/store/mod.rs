use std::{
    env,
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use hoard_domain::ContentHash;
use hoard_hash::{CanonicalTreeHasher, TreeHasher};
use tracing::debug;

mod layout;
mod lock;
mod seal;
mod store_impl;
mod watch;

use layout::{WritableRoot, ITEM_PREFIX};
use lock::StoreLock;
use watch::Notifier;

pub use watch::Subscription;


/// Domain errors surfaced by store transitions. Anything else is a
/// propagated OS error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {0} is not pending")]
    NotPending(ContentHash),
    #[error("key {0} is already pending")]
    AlreadyPending(ContentHash),
    #[error("key {0} is already complete")]
    AlreadyComplete(ContentHash),
    #[error("completion link for key {hash} does not resolve to an item (target {target})")]
    CorruptedLink { hash: ContentHash, target: String },
    #[error("store is closed")]
    Closed,
}

/// State tag for a key, without any path resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Missing,
    Pending,
    Complete,
}

/// A completed, read-only, content-addressed directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Hash of the directory's content; identifies the canonical location.
    pub output_hash: ContentHash,
    /// Canonical location, `<root>/item-<output_hash>`.
    pub path: PathBuf,
}

/// Result of [`ContentStore::lookup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Pending,
    Complete(Item),
}

/// Result of [`ContentStore::lookup_or_wait`]: a pending key additionally
/// yields a one-shot subscription that resolves when the key settles.
#[derive(Debug)]
pub enum LookupOrWait {
    Missing,
    Pending(Subscription),
    Complete(Item),
}

/// Result of [`ContentStore::construct_if_missing`]. `Missing` carries the
/// freshly installed build directory; exactly one concurrent caller gets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Construct {
    Missing(PathBuf),
    Pending,
    Complete(Item),
}

/// Result of [`ContentStore::construct_or_wait`].
#[derive(Debug)]
pub enum ConstructOrWait {
    Missing(PathBuf),
    Pending(Subscription),
    Complete(Item),
}

/// Terminal status a waiter observes for a pending key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed(Item),
    Failed,
}

/// Inventory of the store, one directory read. Ordering is unspecified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreListing {
    pub pending: Vec<ContentHash>,
    pub complete: Vec<ContentHash>,
    pub items: Vec<ContentHash>,
}

/// Handle to a store rooted at a single directory.
///
/// One handle per root per process; the handle owns the cross-process lock
/// descriptor and the watcher subsystem, both released on drop. Operations
/// are blocking and serialized through the store lock; share the handle
/// across threads behind an `Arc`.
pub struct ContentStore {
    root: PathBuf,
    lock: Arc<StoreLock>,
    hasher: Arc<dyn TreeHasher>,
    notifier: Notifier,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .finish()
    }
}

impl ContentStore {
    /// Open (creating if necessary) the store at `root`, or at the default
    /// location when `None` is supplied (`HOARD_STORE_PATH` environment
    /// override, else `~/.hoard/store`).
    ///
    /// # Errors
    ///
    /// Returns an error if the root or its lock file cannot be created.
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        Self::open_with_hasher(root, Arc::new(CanonicalTreeHasher))
    }

    /// Like [`ContentStore::open`], with an explicit tree hasher.
    pub fn open_with_hasher(root: Option<PathBuf>, hasher: Arc<dyn TreeHasher>) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => default_root()?,
        };
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root {}", root.display()))?;
        let lock = {
            // The root may still be sealed from a previous run; the guard
            // restores the resting mode once the lock file exists.
            let _writable = WritableRoot::acquire(&root)?;
            StoreLock::open(&layout::lock_path(&root))?
        };
        let lock = Arc::new(lock);
        let notifier = Notifier::start(root.clone(), Arc::clone(&lock));
        debug!(root = %root.display(), "content store opened");
        Ok(Self {
            root,
            lock,
            hasher,
            notifier,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shut the store down: outstanding subscriptions resolve with an error,
    /// the watcher stops, and the lock descriptor is released. Dropping the
    /// handle does the same; after either, the handle is gone and no further
    /// operations are possible.
    pub fn close(mut self) {
        self.notifier.shutdown();
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        self.notifier.shutdown();
    }
}

fn default_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("HOARD_STORE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs_next::home_dir().context("failed to resolve HOME for the store root")?;
    Ok(home.join(".hoard").join("store"))
}

/// On-disk state of a key, read under the store lock.
#[derive(Clone, Debug)]
pub(crate) enum DiskState {
    Missing,
    Pending(PathBuf),
    Complete(Item),
    /// `complete-<hash>` exists but does not resolve to a parseable item
    /// directory: external corruption or a forcibly removed item.
    Corrupted { target: String },
}

pub(crate) fn read_disk_state(root: &Path, hash: &ContentHash) -> Result<DiskState> {
    let pending = layout::pending_path(root, hash);
    match fs::symlink_metadata(&pending) {
        Ok(meta) if meta.is_dir() => return Ok(DiskState::Pending(pending)),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat {}", pending.display()))
        }
    }

    let link = layout::complete_path(root, hash);
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(DiskState::Missing),
        Err(err) if err.kind() == ErrorKind::InvalidInput => {
            // Present but not a symlink.
            return Ok(DiskState::Corrupted {
                target: "<not a symlink>".to_string(),
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read link {}", link.display()))
        }
    };

    let output = target
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(ITEM_PREFIX))
        .and_then(|encoded| encoded.parse::<ContentHash>().ok());
    let Some(output) = output else {
        return Ok(DiskState::Corrupted {
            target: target.display().to_string(),
        });
    };

    let item_dir = layout::item_path(root, &output);
    match fs::metadata(&item_dir) {
        Ok(meta) if meta.is_dir() => Ok(DiskState::Complete(Item {
            output_hash: output,
            path: item_dir,
        })),
        Ok(_) => Ok(DiskState::Corrupted {
            target: target.display().to_string(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(DiskState::Corrupted {
            target: target.display().to_string(),
        }),
        Err(err) => {
            Err(err).with_context(|| format!("failed to stat item {}", item_dir.display()))
        }
    }
}

/// Best-effort directory fsync after top-level mutations.
fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}
