//! Item store
//!
//! Composes every container over one engine handle. Opening checks the
//! format stamp first and then opens the remaining containers inside the
//! same transaction, so a store is either fully usable or not opened.
//!
//! Writes go through `commit`: it allocates the next version, hands the
//! caller a `CommitBatch` bound to that version and its transaction, logs
//! the commit record and commits everything at once. A deadlock discards
//! the whole batch and runs it again.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::acl::{Acl, AclContainer};
use crate::commits::{CommitRecord, CommitsContainer};
use crate::config::StoreConfig;
use crate::indexes::{IndexContainer, SkipNode};
use crate::item::{ItemContainer, ItemRevision};
use crate::mvcc::{PurgeCounts, ReadView, Version};
use crate::names::NamesContainer;
use crate::refs::RefContainer;
use crate::storage::{CompactStats, FormatStamp, Store, StoreError, StoreResult, Transaction};
use crate::versions::{VersionContainer, VersionInfo, ViewData, CURRENT_STAMP};

const REPOSITORY: &str = "repository";

#[derive(Debug)]
pub struct ItemStore {
    store: Arc<Store>,
    config: StoreConfig,
    versions: VersionContainer,
    items: ItemContainer,
    refs: RefContainer,
    names: NamesContainer,
    acls: AclContainer,
    indexes: IndexContainer,
    commits: CommitsContainer,
}

impl ItemStore {
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        Self::open_with_stamp(config, CURRENT_STAMP)
    }

    /// Opens the store expecting `stamp` instead of this build's own.
    pub fn open_with_stamp(config: &StoreConfig, stamp: FormatStamp) -> StoreResult<Self> {
        config.validate()?;
        let options = config.to_options();
        let mut store = Store::open(config.path.as_deref(), options)?;
        store.set_cursor_batch(config.cursor_batch);
        let store = Arc::new(store);

        let txn = store.begin()?;
        let opened = (|| -> StoreResult<_> {
            let versions = VersionContainer::open(Arc::clone(&store), Some(&txn), options, stamp)?;
            Ok((
                versions,
                ItemContainer::open(Arc::clone(&store), Some(&txn), options)?,
                RefContainer::open(Arc::clone(&store), Some(&txn), options)?,
                NamesContainer::open(Arc::clone(&store), Some(&txn), options)?,
                AclContainer::open(Arc::clone(&store), Some(&txn), options)?,
                IndexContainer::open(Arc::clone(&store), Some(&txn), options)?,
                CommitsContainer::open(Arc::clone(&store), Some(&txn), options)?,
            ))
        })();
        let (versions, items, refs, names, acls, indexes, commits) = match opened {
            Ok(containers) => {
                txn.commit()?;
                containers
            }
            Err(e) => {
                txn.abort()?;
                return Err(e);
            }
        };

        info!(
            store = %versions.store_uuid(),
            path = ?config.path,
            ram = config.ram,
            "item store opened"
        );
        Ok(Self {
            store,
            config: config.clone(),
            versions,
            items,
            refs,
            names,
            acls,
            indexes,
            commits,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionContainer {
        &self.versions
    }

    pub fn items(&self) -> &ItemContainer {
        &self.items
    }

    pub fn refs(&self) -> &RefContainer {
        &self.refs
    }

    pub fn names(&self) -> &NamesContainer {
        &self.names
    }

    pub fn acls(&self) -> &AclContainer {
        &self.acls
    }

    pub fn indexes(&self) -> &IndexContainer {
        &self.indexes
    }

    pub fn commits(&self) -> &CommitsContainer {
        &self.commits
    }

    /// Latest committed version.
    pub fn version(&self) -> StoreResult<Version> {
        self.versions.get_version(None)
    }

    pub fn version_info(&self) -> StoreResult<VersionInfo> {
        self.versions.get_version_info(None)
    }

    pub fn read_view(&self, version: Version) -> StoreResult<ReadView> {
        self.versions.read_view(None, version)
    }

    /// Member of `collection` linked under `alias` at `version`.
    pub fn resolve_alias(
        &self,
        version: Version,
        collection: &Uuid,
        alias: &str,
    ) -> StoreResult<Option<Uuid>> {
        self.names.read_name(None, version, collection, alias)
    }

    /// Runs `f` against a batch at the next version and commits it.
    ///
    /// Returns the committed version with `f`'s result. A batch that
    /// writes nothing allocates no version and returns the current one.
    pub fn commit<T>(
        &self,
        view_name: Option<&str>,
        mut f: impl FnMut(&mut CommitBatch<'_>) -> StoreResult<T>,
    ) -> StoreResult<(Version, T)> {
        let started = Instant::now();
        let (record, value) = self
            .store
            .write(None, REPOSITORY, |txn| self.apply(txn, view_name, &mut f))?;

        if record.commit_count > 0 {
            info!(
                version = %record.version,
                view = view_name.unwrap_or(""),
                count = record.commit_count,
                bytes = record.view_size,
                duration_ms = started.elapsed().as_millis() as u64,
                "committed"
            );
        }
        Ok((record.version, value))
    }

    fn apply<T>(
        &self,
        txn: &Transaction<'_>,
        view_name: Option<&str>,
        f: &mut impl FnMut(&mut CommitBatch<'_>) -> StoreResult<T>,
    ) -> StoreResult<(CommitRecord, T)> {
        let version = self.versions.next_version(Some(txn))?;
        let mut batch = CommitBatch {
            repo: self,
            txn,
            version,
            count: 0,
            size: 0,
        };
        let value = f(&mut batch)?;
        let (count, size) = (batch.count, batch.size);

        let mut record = CommitRecord::new(version, view_name);
        if count == 0 {
            self.versions.undo_version(Some(txn), version)?;
            record.version = self.versions.get_version(Some(txn))?;
            return Ok((record, value));
        }
        record.commit_count = count;
        record.view_size = size;
        self.commits.log_commit(Some(txn), &record)?;
        Ok((record, value))
    }

    /// Moves the watermark to `watermark` and reclaims every revision no
    /// reader at or above it can see, in one transaction.
    pub fn purge(&self, watermark: Version) -> StoreResult<PurgeReport> {
        let started = Instant::now();
        let report = self.store.write(None, REPOSITORY, |txn| {
            self.versions.set_min_version(Some(txn), watermark)?;
            Ok(PurgeReport {
                watermark,
                items: self.items.purge_items(Some(txn), watermark)?,
                refs: self.refs.purge_refs(Some(txn), watermark)?,
                names: self.names.purge_names(Some(txn), watermark)?,
                acls: self.acls.purge_acls(Some(txn), watermark)?,
                indexes: self.indexes.purge_index(Some(txn), watermark)?,
                views: self.versions.purge_views(Some(txn), watermark)?,
                commits: self.commits.purge_commits(Some(txn), watermark)?,
            })
        })?;
        let total = report.total();
        info!(
            watermark = %watermark,
            scanned = total.scanned,
            removed = total.removed,
            duration_ms = started.elapsed().as_millis() as u64,
            "purge finished"
        );
        Ok(report)
    }

    /// Removes everything written at `version`. Rolling back the latest
    /// version also rewinds the counter.
    pub fn undo(&self, version: Version) -> StoreResult<PurgeCounts> {
        let total = self.store.write(None, REPOSITORY, |txn| {
            let min = self.versions.get_min_version(Some(txn))?;
            if version <= min {
                return Err(StoreError::InvalidArgument(format!(
                    "version {} is at or below the watermark {}",
                    version, min
                )));
            }
            let mut total = PurgeCounts::default();
            total.merge(self.items.undo_items(Some(txn), version)?);
            total.merge(self.refs.undo_refs(Some(txn), version)?);
            total.merge(self.names.undo_names(Some(txn), version)?);
            total.merge(self.acls.undo_acls(Some(txn), version)?);
            total.merge(self.indexes.undo_index(Some(txn), version)?);
            self.commits.undo_commit(Some(txn), version)?;
            self.versions.undo_version(Some(txn), version)?;
            Ok(total)
        })?;
        info!(version = %version, removed = total.removed, "undo finished");
        Ok(total)
    }

    pub fn compact(&self) -> StoreResult<CompactStats> {
        self.store.compact(self.config.compaction_attempts)
    }

    /// Closes every container. Later calls on them fail.
    pub fn close(&self) {
        self.items.close();
        self.refs.close();
        self.names.close();
        self.acls.close();
        self.indexes.close();
        self.commits.close();
        self.versions.close();
        debug!(store = %self.versions.store_uuid(), "item store closed");
    }
}

/// Per-container counts of one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub watermark: Version,
    pub items: PurgeCounts,
    pub refs: PurgeCounts,
    pub names: PurgeCounts,
    pub acls: PurgeCounts,
    pub indexes: PurgeCounts,
    pub views: PurgeCounts,
    pub commits: PurgeCounts,
}

impl PurgeReport {
    pub fn total(&self) -> PurgeCounts {
        let mut total = PurgeCounts::default();
        for counts in [
            self.items,
            self.refs,
            self.names,
            self.acls,
            self.indexes,
            self.views,
            self.commits,
        ] {
            total.merge(counts);
        }
        total
    }
}

/// Writes of one commit, all at the batch's version and inside its
/// transaction.
pub struct CommitBatch<'a> {
    repo: &'a ItemStore,
    txn: &'a Transaction<'a>,
    version: Version,
    count: u32,
    size: u64,
}

impl<'a> CommitBatch<'a> {
    /// The version being committed.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The batch's transaction, for reads that must see its own writes.
    pub fn txn(&self) -> &'a Transaction<'a> {
        self.txn
    }

    fn wrote(&mut self, bytes: usize) {
        self.count += 1;
        self.size += bytes as u64;
    }

    /// Saves `revision` at the batch version.
    pub fn save_item(&mut self, mut revision: ItemRevision) -> StoreResult<()> {
        revision.version = self.version;
        let bytes = self.repo.items.save_item(Some(self.txn), &revision)?;
        self.wrote(bytes);
        Ok(())
    }

    /// Writes a deletion revision for a live item. Returns false when the
    /// item is absent or already deleted.
    pub fn delete_item(&mut self, uuid: &Uuid) -> StoreResult<bool> {
        let Some(live) = self.repo.items.find_item(Some(self.txn), self.version, uuid)? else {
            return Ok(false);
        };
        let bytes = self
            .repo
            .items
            .save_item(Some(self.txn), &ItemRevision::deletion(&live, self.version))?;
        self.wrote(bytes);
        Ok(true)
    }

    /// Appends `member` to `collection`. An alias is also written as a
    /// name of the collection so `ItemStore::resolve_alias` finds it.
    /// Returns false when `member` is already linked.
    pub fn append_ref(&mut self, collection: &Uuid, member: &Uuid, alias: Option<&str>) -> StoreResult<bool> {
        let repo = self.repo;
        if let Some(alias) = alias {
            let bound = repo.names.read_name(Some(self.txn), self.version, collection, alias)?;
            if bound.is_some_and(|other| other != *member) {
                return Err(StoreError::InvalidArgument(format!(
                    "alias {:?} already names another member of {}",
                    alias, collection
                )));
            }
        }
        if !repo
            .refs
            .append_ref(Some(self.txn), collection, self.version, member, alias)?
        {
            return Ok(false);
        }
        if let Some(alias) = alias {
            repo.names
                .write_name(Some(self.txn), self.version, collection, alias, Some(member))?;
        }
        self.wrote(0);
        Ok(true)
    }

    /// Unlinks `member` and drops its alias. Returns false when it was not
    /// linked.
    pub fn remove_ref(&mut self, collection: &Uuid, member: &Uuid) -> StoreResult<bool> {
        let repo = self.repo;
        let Some(link) = repo.refs.load_ref(Some(self.txn), collection, self.version, member)? else {
            return Ok(false);
        };
        if !repo.refs.remove_ref(Some(self.txn), collection, self.version, member)? {
            return Ok(false);
        }
        if let Some(alias) = link.alias.as_deref() {
            if repo.names.read_name(Some(self.txn), self.version, collection, alias)? == Some(*member) {
                repo.names.write_name(Some(self.txn), self.version, collection, alias, None)?;
            }
        }
        self.wrote(0);
        Ok(true)
    }

    pub fn write_name(&mut self, owner: &Uuid, name: &str, target: Option<&Uuid>) -> StoreResult<()> {
        self.repo
            .names
            .write_name(Some(self.txn), self.version, owner, name, target)?;
        self.wrote(0);
        Ok(())
    }

    pub fn write_acl(&mut self, subject: &Uuid, name: Option<&str>, acl: Option<&Acl>) -> StoreResult<()> {
        self.repo
            .acls
            .write_acl(Some(self.txn), self.version, subject, name, acl)?;
        self.wrote(0);
        Ok(())
    }

    pub fn save_index_key(&mut self, index: &Uuid, key: &Uuid, node: &SkipNode) -> StoreResult<()> {
        self.repo
            .indexes
            .save_key(Some(self.txn), index, self.version, key, node)?;
        self.wrote(0);
        Ok(())
    }

    pub fn remove_index_key(&mut self, index: &Uuid, key: &Uuid) -> StoreResult<()> {
        self.repo
            .indexes
            .remove_key(Some(self.txn), index, self.version, key)?;
        self.wrote(0);
        Ok(())
    }

    /// Records view status at the batch version, with the indexes it
    /// creates.
    pub fn set_view_data(&mut self, status: u32, timezone: Option<&str>, new_indexes: &[Uuid]) -> StoreResult<()> {
        let data = ViewData {
            version: self.version,
            status,
            timezone: timezone.map(str::to_string),
            new_indexes: new_indexes.to_vec(),
        };
        self.repo.versions.set_view_data(Some(self.txn), &data)?;
        self.wrote(0);
        Ok(())
    }
}
