//! Nested store locking.
//!
//! Two locks guard every state read and transition, always acquired in the
//! same order and released in reverse:
//!
//! 1. a process-local mutex serializing threads within this process;
//! 2. an exclusive advisory file lock on `<root>/lock` serializing
//!    cooperating processes.
//!
//! POSIX advisory locks are held per process, so without the outer mutex a
//! second thread would silently "re-acquire" a lock the OS already considers
//! held by us. Acquisition blocks indefinitely; only failure to open the
//! lock file is an error.

use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use fs4::FileExt;

#[derive(Debug)]
pub(super) struct StoreLock {
    thread_gate: Mutex<()>,
    file: File,
}

impl StoreLock {
    pub(super) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open store lock {}", path.display()))?;
        Ok(Self {
            thread_gate: Mutex::new(()),
            file,
        })
    }

    /// Block until both locks are held.
    pub(super) fn acquire(&self) -> Result<StoreLockGuard<'_>> {
        let thread = self.thread_gate.lock().expect("store mutex poisoned");
        self.file
            .lock_exclusive()
            .context("failed to lock the store lock file")?;
        Ok(StoreLockGuard {
            _file: FileUnlock(&self.file),
            _thread: thread,
        })
    }
}

/// Held for the duration of one store operation. Fields drop in declaration
/// order: the file lock is released first, the thread mutex second.
#[derive(Debug)]
pub(super) struct StoreLockGuard<'a> {
    _file: FileUnlock<'a>,
    _thread: MutexGuard<'a, ()>,
}

#[derive(Debug)]
struct FileUnlock<'a>(&'a File);

impl Drop for FileUnlock<'_> {
    fn drop(&mut self) {
        // Releasing can only fail if the descriptor is gone already.
        let _ = self.0.unlock();
    }
}
