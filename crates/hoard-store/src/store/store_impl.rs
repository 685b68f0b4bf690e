// Store transitions (kept out of mod.rs for readability). Every public
// operation here runs entirely under the nested store lock.
use super::*;

fn corrupted(hash: &ContentHash, target: String) -> anyhow::Error {
    StoreError::CorruptedLink {
        hash: *hash,
        target,
    }
    .into()
}

impl ContentStore {
    /// Return the state tag for `hash`, resolving no paths.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::CorruptedLink`] when the completion link does
    /// not resolve to a parseable item directory.
    pub fn query(&self, hash: &ContentHash) -> Result<KeyStatus> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => Ok(KeyStatus::Missing),
            DiskState::Pending(_) => Ok(KeyStatus::Pending),
            DiskState::Complete(_) => Ok(KeyStatus::Complete),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Like [`ContentStore::query`], but a complete key yields its [`Item`].
    pub fn lookup(&self, hash: &ContentHash) -> Result<Lookup> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => Ok(Lookup::Missing),
            DiskState::Pending(_) => Ok(Lookup::Pending),
            DiskState::Complete(item) => Ok(Lookup::Complete(item)),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Like [`ContentStore::lookup`], but a pending key additionally yields a
    /// subscription that resolves when the key settles.
    pub fn lookup_or_wait(&self, hash: &ContentHash) -> Result<LookupOrWait> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => Ok(LookupOrWait::Missing),
            DiskState::Pending(_) => Ok(LookupOrWait::Pending(self.notifier.subscribe(hash))),
            DiskState::Complete(item) => Ok(LookupOrWait::Complete(item)),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Transition `Missing -> Pending`, returning the writable build
    /// directory in which the caller assembles the result.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::AlreadyPending`] or
    /// [`StoreError::AlreadyComplete`] when the key is not missing.
    pub fn mark_pending(&self, hash: &ContentHash) -> Result<PathBuf> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => self.install_pending(hash),
            DiskState::Pending(_) => Err(StoreError::AlreadyPending(*hash).into()),
            DiskState::Complete(_) => Err(StoreError::AlreadyComplete(*hash).into()),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Atomic composite: yield the completed item, observe that somebody else
    /// is already building, or become the single builder. Exactly one of any
    /// number of concurrent callers receives `Construct::Missing`.
    pub fn construct_if_missing(&self, hash: &ContentHash) -> Result<Construct> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => Ok(Construct::Missing(self.install_pending(hash)?)),
            DiskState::Pending(_) => Ok(Construct::Pending),
            DiskState::Complete(item) => Ok(Construct::Complete(item)),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Like [`ContentStore::construct_if_missing`], but an already-pending
    /// key yields a subscription instead of a bare tag.
    pub fn construct_or_wait(&self, hash: &ContentHash) -> Result<ConstructOrWait> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => Ok(ConstructOrWait::Missing(self.install_pending(hash)?)),
            DiskState::Pending(_) => {
                Ok(ConstructOrWait::Pending(self.notifier.subscribe(hash)))
            }
            DiskState::Complete(item) => Ok(ConstructOrWait::Complete(item)),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Transition `Pending -> Complete`: seal the build tree, hash it, move
    /// it to its content-addressed location (or discard it in favour of an
    /// identical item already stored), and install the completion link.
    ///
    /// The hash runs inside the store lock, trading latency for a guarantee
    /// that nobody observes a half-completed key. Sealing or rename failures
    /// leave the pending directory in place so the caller can retry.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotPending`] or
    /// [`StoreError::AlreadyComplete`] when the key is not pending.
    pub fn mark_complete(&self, hash: &ContentHash) -> Result<Item> {
        let _guard = self.lock.acquire()?;
        let build = match read_disk_state(&self.root, hash)? {
            DiskState::Pending(build) => build,
            DiskState::Missing => return Err(StoreError::NotPending(*hash).into()),
            DiskState::Complete(_) => return Err(StoreError::AlreadyComplete(*hash).into()),
            DiskState::Corrupted { target } => return Err(corrupted(hash, target)),
        };

        // Seal first so the content cannot change underneath the digest.
        seal::seal_tree(&build)?;
        let output = self.hasher.hash_tree(&build)?;
        let item_dir = layout::item_path(&self.root, &output);

        let item = {
            let _writable = WritableRoot::acquire(&self.root)?;
            if item_dir.exists() {
                // Identical output already stored; whoever arrived first wins.
                debug!(%hash, item = %output, "deduplicated completed build");
                seal::remove_tree(&build)?;
            } else {
                fs::rename(&build, &item_dir).with_context(|| {
                    format!("failed to install item {}", item_dir.display())
                })?;
            }
            let link = layout::complete_path(&self.root, hash);
            // The target is the sibling entry name, so the link survives a
            // relocation of the whole store.
            let target = PathBuf::from(format!("{ITEM_PREFIX}{output}"));
            layout::symlink_item(&target, &link).with_context(|| {
                format!("failed to link {} -> {}", link.display(), target.display())
            })?;
            Item {
                output_hash: output,
                path: item_dir,
            }
        };
        fsync_dir(&self.root).ok();
        self.notifier
            .resolve(hash, BuildOutcome::Completed(item.clone()));
        debug!(%hash, item = %item.output_hash, "marked complete");
        Ok(item)
    }

    /// Transition `Pending -> Missing`, discarding the build directory.
    /// Waiters on the key resolve as failed.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotPending`] or
    /// [`StoreError::AlreadyComplete`] when the key is not pending.
    pub fn remove_failed(&self, hash: &ContentHash) -> Result<()> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Pending(build) => {
                {
                    let _writable = WritableRoot::acquire(&self.root)?;
                    seal::remove_tree(&build)?;
                }
                fsync_dir(&self.root).ok();
                self.notifier.resolve(hash, BuildOutcome::Failed);
                debug!(%hash, "removed failed build");
                Ok(())
            }
            DiskState::Missing => Err(StoreError::NotPending(*hash).into()),
            DiskState::Complete(_) => Err(StoreError::AlreadyComplete(*hash).into()),
            DiskState::Corrupted { target } => Err(corrupted(hash, target)),
        }
    }

    /// Remove whatever exists for `hash`: a pending build, a completion link
    /// (dangling or not), or nothing. Item directories are left intact, as
    /// they may be shared with other keys. Callers must ensure no other
    /// actor is using the affected subtree.
    pub fn remove_forcibly(&self, hash: &ContentHash) -> Result<()> {
        let _guard = self.lock.acquire()?;
        match read_disk_state(&self.root, hash)? {
            DiskState::Missing => return Ok(()),
            DiskState::Pending(build) => {
                {
                    let _writable = WritableRoot::acquire(&self.root)?;
                    seal::remove_tree(&build)?;
                }
                fsync_dir(&self.root).ok();
                self.notifier.resolve(hash, BuildOutcome::Failed);
            }
            DiskState::Complete(_) | DiskState::Corrupted { .. } => {
                let link = layout::complete_path(&self.root, hash);
                {
                    let _writable = WritableRoot::acquire(&self.root)?;
                    fs::remove_file(&link).with_context(|| {
                        format!("failed to remove completion link {}", link.display())
                    })?;
                }
                fsync_dir(&self.root).ok();
            }
        }
        debug!(%hash, "removed forcibly");
        Ok(())
    }

    /// Remove an item directory outright. Completion links pointing at it
    /// are left dangling; queries through them subsequently fail with
    /// [`StoreError::CorruptedLink`]. Callers must ensure no other actor is
    /// using the item.
    pub fn remove_item_forcibly(&self, item: &Item) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let dir = layout::item_path(&self.root, &item.output_hash);
        {
            let _writable = WritableRoot::acquire(&self.root)?;
            seal::remove_tree(&dir)?;
        }
        fsync_dir(&self.root).ok();
        debug!(item = %item.output_hash, "removed item forcibly");
        Ok(())
    }

    /// Inventory the store with a single directory read.
    pub fn list_all(&self) -> Result<StoreListing> {
        let _guard = self.lock.acquire()?;
        let mut listing = StoreListing::default();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read store root {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match layout::classify_entry(name) {
                Some(layout::StoreEntry::Pending(hash)) => listing.pending.push(hash),
                Some(layout::StoreEntry::Complete(hash)) => listing.complete.push(hash),
                Some(layout::StoreEntry::Item(hash)) => listing.items.push(hash),
                None => {}
            }
        }
        Ok(listing)
    }

    fn install_pending(&self, hash: &ContentHash) -> Result<PathBuf> {
        let build = layout::pending_path(&self.root, hash);
        {
            let _writable = WritableRoot::acquire(&self.root)?;
            fs::create_dir(&build).with_context(|| {
                format!("failed to create pending directory {}", build.display())
            })?;
            layout::set_dir_mode(&build, 0o755)
                .with_context(|| format!("failed to set mode on {}", build.display()))?;
        }
        fsync_dir(&self.root).ok();
        debug!(%hash, "marked pending");
        Ok(build)
    }
}
