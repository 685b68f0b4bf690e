//! On-disk naming scheme and the writable-bit protocol for the store root.

#[cfg(unix)]
use std::fs;
use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use hoard_domain::ContentHash;
use tracing::warn;

pub(super) const LOCK_FILE: &str = "lock";
pub(super) const PENDING_PREFIX: &str = "pending-";
pub(super) const COMPLETE_PREFIX: &str = "complete-";
pub(super) const ITEM_PREFIX: &str = "item-";

/// Root mode inside a mutating critical section.
pub(super) const WRITABLE_ROOT_MODE: u32 = 0o755;
/// Root mode at rest: the writable mode with every write bit cleared. The
/// missing owner-write bit is the store's "not mutating" flag.
pub(super) const RESTING_ROOT_MODE: u32 = WRITABLE_ROOT_MODE & !0o222;

pub(super) fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub(super) fn pending_path(root: &Path, hash: &ContentHash) -> PathBuf {
    root.join(format!("{PENDING_PREFIX}{hash}"))
}

pub(super) fn complete_path(root: &Path, hash: &ContentHash) -> PathBuf {
    root.join(format!("{COMPLETE_PREFIX}{hash}"))
}

pub(super) fn item_path(root: &Path, output_hash: &ContentHash) -> PathBuf {
    root.join(format!("{ITEM_PREFIX}{output_hash}"))
}

/// Classification of a top-level store entry name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum StoreEntry {
    Pending(ContentHash),
    Complete(ContentHash),
    Item(ContentHash),
}

/// Strip a known prefix and parse the remainder as a hash. Entries that
/// match neither scheme (the lock file, foreign files) yield `None`.
pub(super) fn classify_entry(name: &str) -> Option<StoreEntry> {
    if let Some(encoded) = name.strip_prefix(PENDING_PREFIX) {
        return encoded.parse().ok().map(StoreEntry::Pending);
    }
    if let Some(encoded) = name.strip_prefix(COMPLETE_PREFIX) {
        return encoded.parse().ok().map(StoreEntry::Complete);
    }
    if let Some(encoded) = name.strip_prefix(ITEM_PREFIX) {
        return encoded.parse().ok().map(StoreEntry::Item);
    }
    None
}

/// Scoped write access to the store root.
///
/// The owner-write bit on the root is off at rest so that nothing outside a
/// store transition can create or remove top-level entries. Acquiring the
/// guard turns it on; dropping the guard restores the resting mode on every
/// exit path, including panics.
#[derive(Debug)]
pub(super) struct WritableRoot<'a> {
    root: &'a Path,
}

impl<'a> WritableRoot<'a> {
    pub(super) fn acquire(root: &'a Path) -> Result<Self> {
        set_dir_mode(root, WRITABLE_ROOT_MODE)
            .with_context(|| format!("failed to make store root {} writable", root.display()))?;
        Ok(Self { root })
    }
}

impl Drop for WritableRoot<'_> {
    fn drop(&mut self) {
        if let Err(err) = set_dir_mode(self.root, RESTING_ROOT_MODE) {
            warn!(root = %self.root.display(), %err, "failed to restore read-only store root");
        }
    }
}

#[cfg(unix)]
pub(super) fn set_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(super) fn set_dir_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Create `complete-<hash>` as a symbolic link to a sibling item directory.
/// The target is relative so the store stays relocatable.
#[cfg(unix)]
pub(super) fn symlink_item(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
pub(super) fn symlink_item(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> ContentHash {
        ContentHash::new([7u8; 32])
    }

    #[test]
    fn paths_use_prefixed_entry_names() {
        let root = Path::new("/store");
        let hash = sample_hash();
        assert_eq!(
            pending_path(root, &hash),
            root.join(format!("pending-{hash}"))
        );
        assert_eq!(
            complete_path(root, &hash),
            root.join(format!("complete-{hash}"))
        );
        assert_eq!(item_path(root, &hash), root.join(format!("item-{hash}")));
    }

    #[test]
    fn classification_round_trips_through_entry_names() {
        let hash = sample_hash();
        assert_eq!(
            classify_entry(&format!("pending-{hash}")),
            Some(StoreEntry::Pending(hash))
        );
        assert_eq!(
            classify_entry(&format!("complete-{hash}")),
            Some(StoreEntry::Complete(hash))
        );
        assert_eq!(
            classify_entry(&format!("item-{hash}")),
            Some(StoreEntry::Item(hash))
        );
    }

    #[test]
    fn classification_rejects_foreign_entries() {
        assert_eq!(classify_entry(LOCK_FILE), None);
        assert_eq!(classify_entry("pending-"), None);
        assert_eq!(classify_entry("pending-!!!not-a-hash"), None);
        assert_eq!(classify_entry("items-are-not-a-prefix"), None);
    }

    #[cfg(unix)]
    #[test]
    fn writable_root_restores_resting_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        set_dir_mode(dir.path(), RESTING_ROOT_MODE).unwrap();
        {
            let _guard = WritableRoot::acquire(dir.path()).unwrap();
            let mode = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, WRITABLE_ROOT_MODE);
        }
        let mode = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, RESTING_ROOT_MODE);
        // Leave the temp dir deletable.
        set_dir_mode(dir.path(), WRITABLE_ROOT_MODE).unwrap();
    }
}
