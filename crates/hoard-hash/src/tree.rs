use std::{
    fs::{self, File},
    io::Read,
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use hoard_domain::{ContentHash, CONTENT_HASH_LEN};
use sha2::{Digest, Sha256};

/// A pure function from a directory tree to a [`ContentHash`].
///
/// Implementations must be deterministic over the tree's entry names and
/// file contents, and must not depend on metadata outside of those (the
/// store relies on this to deduplicate byte-identical outputs).
pub trait TreeHasher: Send + Sync {
    fn hash_tree(&self, root: &Path) -> Result<ContentHash>;
}

/// Default tree hasher: SHA-256 over a canonical traversal.
///
/// Entries are visited in sorted path order without following symlinks. Each
/// entry contributes its kind marker, its normalized relative path, and for
/// regular files the length-prefixed contents; for symlinks the link target.
/// Mode bits do not participate, so toggling the executable bit of a file
/// leaves the hash unchanged.
///
// TODO: fold the executable bit into the entry header once stored items
// preserve modes end to end.
#[derive(Clone, Copy, Debug, Default)]
pub struct CanonicalTreeHasher;

impl TreeHasher for CanonicalTreeHasher {
    fn hash_tree(&self, root: &Path) -> Result<ContentHash> {
        let mut hasher = Sha256::new();
        for entry in walkdir::WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path())) {
            let entry = entry
                .with_context(|| format!("failed to walk tree at {}", root.display()))?;
            let path = entry.path();
            if path == root {
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .context("failed to relativize path")?;
            let rel = normalize_entry_path(rel)?;
            let metadata = fs::symlink_metadata(path)
                .with_context(|| format!("failed to stat {}", path.display()))?;
            let file_type = metadata.file_type();
            if file_type.is_dir() {
                hasher.update(b"d");
                hasher.update(rel.as_bytes());
                hasher.update([0u8]);
            } else if file_type.is_file() {
                hasher.update(b"f");
                hasher.update(rel.as_bytes());
                hasher.update([0u8]);
                hasher.update(metadata.len().to_le_bytes());
                digest_file_contents(&mut hasher, path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(path)
                    .with_context(|| format!("failed to read symlink {}", path.display()))?;
                hasher.update(b"l");
                hasher.update(rel.as_bytes());
                hasher.update([0u8]);
                hasher.update(target.to_string_lossy().as_bytes());
                hasher.update([0u8]);
            }
        }
        let digest: [u8; CONTENT_HASH_LEN] = hasher.finalize().into();
        Ok(ContentHash::new(digest))
    }
}

fn normalize_entry_path(path: &Path) -> Result<String> {
    let normalized = path.to_string_lossy().replace('\\', "/");
    if normalized.is_empty() {
        return Err(anyhow!("tree entry path is empty"));
    }
    Ok(normalized)
}

fn digest_file_contents(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = vec![0_u8; 32 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(())
}
