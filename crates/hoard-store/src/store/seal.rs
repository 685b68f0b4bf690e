//! Sealing: recursive write-permission removal on completed trees, plus the
//! inverse for trees that must be deleted again (dedup discards, forcible
//! item removal).

use std::{fs, io::ErrorKind, path::Path};

use anyhow::{Context, Result};

/// Clear the owner/group/other write bits on `path` and everything below it.
/// Symlinks are skipped; their targets are not touched.
pub(super) fn seal_tree(path: &Path) -> Result<()> {
    remove_write_permissions(path)
        .with_context(|| format!("failed to seal {}", path.display()))?;
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            seal_tree(&entry.path())?;
        }
    }
    Ok(())
}

/// Restore the owner-write bit on `path` and everything below it so the tree
/// can be unlinked again.
pub(super) fn unseal_tree(path: &Path) -> Result<()> {
    restore_write_permissions(path)
        .with_context(|| format!("failed to unseal {}", path.display()))?;
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            unseal_tree(&entry.path())?;
        }
    }
    Ok(())
}

/// Delete a tree that may have been sealed. Missing paths are fine.
pub(super) fn remove_tree(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()))
        }
    }
    unseal_tree(path)?;
    fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))
}

fn remove_write_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let new_mode = mode & !0o222;
        if mode != new_mode {
            perms.set_mode(new_mode);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}

#[cfg_attr(not(unix), allow(clippy::permissions_set_readonly_false))]
fn restore_write_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let new_mode = mode | 0o200;
        if mode != new_mode {
            perms.set_mode(new_mode);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}
