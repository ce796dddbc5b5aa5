//! Revision store boundary.
//!
//! The replication core only talks to the object store through the
//! [`RevisionStore`] trait. [`MemoryStore`] keeps everything in a single
//! `RwLock`-protected state and is used by the binary and the tests.
//! [`RevisionCache`] holds head revisions read by clients and must be
//! invalidated whenever content enters the store out-of-band.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};
use crate::types::{
    Branch, BranchId, BranchPoint, ChangedSets, Commit, CommitData, CommitId, CommitInfo,
    LockType, ObjectId, ObjectRevision, PackageUnit, Timestamp,
};

/// Which write path produced a staged commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitOrigin {
    /// Direct commit on an authoritative or local-only branch.
    Local,
    /// Commit already accepted by the primary.
    WriteThrough,
    /// Commit redirected onto a fresh local branch.
    Branching,
    /// Replay of a commit received from the primary.
    Replicator,
    /// Commit replayed by a raw import.
    RawImport,
}

/// A change set ready to be written by [`RevisionStore::apply_commit`].
#[derive(Clone, Debug)]
pub struct StagedCommit {
    /// Target branch.
    pub branch: BranchId,
    /// Changes, with permanent object ids.
    pub data: CommitData,
    /// Producing write path.
    pub origin: CommitOrigin,
}

/// Durable locks of one locking area, persisted with the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArea {
    /// Durable locking id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Branch the area's view looks at.
    pub branch: BranchId,
    /// Held locks.
    pub locks: Vec<(ObjectId, LockType)>,
}

/// A commit as carried in a raw dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommit {
    /// The commit record.
    pub commit: Commit,
    /// Preceding commit time on the exporting store.
    pub previous_timestamp: Timestamp,
    /// The change set.
    pub data: CommitData,
}

/// Store content for a branch-id range and a commit-time range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDump {
    /// Exclusive lower branch bound.
    pub from_branch: i32,
    /// Inclusive upper branch bound.
    pub to_branch: i32,
    /// Exclusive lower commit-time bound.
    pub from_time: u64,
    /// Inclusive upper commit-time bound.
    pub to_time: u64,
    /// Branches created in the range, ascending by id.
    pub branches: Vec<Branch>,
    /// Commits in the range, ascending by timestamp.
    pub commits: Vec<RawCommit>,
    /// The complete package registry.
    pub packages: Vec<PackageUnit>,
    /// The complete set of durable lock areas.
    pub lock_areas: Vec<LockArea>,
}

/// What a raw import actually changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawImportSummary {
    /// Branches created.
    pub branches: usize,
    /// Commits written; already present commits are skipped.
    pub commits: usize,
}

/// The object store consumed by the replication core.
///
/// Implementations must be internally synchronized; every method takes `&self`.
pub trait RevisionStore: Send + Sync {
    /// All branches, ascending by id.
    fn branches(&self) -> Result<Vec<Branch>>;

    /// A branch by id.
    fn branch(&self, id: BranchId) -> Result<Option<Branch>>;

    /// Creates a replicated branch with a fixed id. Idempotent for an
    /// identical branch.
    fn create_branch(
        &self,
        id: BranchId,
        name: &str,
        base: BranchPoint,
        created: Timestamp,
    ) -> Result<Branch>;

    /// Creates a local-only branch with a fresh negative id. Its creation
    /// timestamp is allocated from the commit clock.
    fn create_local_branch(&self, name: &str, base: BranchPoint) -> Result<Branch>;

    /// Drops a local branch that has no commits. Returns whether it existed.
    fn remove_local_branch(&self, id: BranchId) -> Result<bool>;

    /// Highest non-local branch id.
    fn last_branch_id(&self) -> Result<BranchId>;

    /// Time of the latest commit on any branch.
    fn last_commit_time(&self) -> Result<Timestamp>;

    /// Time of the latest commit on a non-local branch.
    fn last_non_local_commit_time(&self) -> Result<Timestamp>;

    /// Allocates a fresh commit timestamp, strictly after every earlier one.
    fn create_commit_timestamp(&self) -> Result<Timestamp>;

    /// Moves the commit clock to at least `ts`.
    fn force_commit_time(&self, ts: Timestamp) -> Result<()>;

    /// Allocates a permanent object id.
    fn allocate_object_id(&self) -> Result<ObjectId>;

    /// Writes a staged commit. `timestamp` overrides clock allocation.
    fn apply_commit(
        &self,
        staged: StagedCommit,
        timestamp: Option<Timestamp>,
        author: &str,
        comment: &str,
    ) -> Result<Commit>;

    /// Whether a commit exists on `branch` at exactly `timestamp`.
    fn has_commit(&self, branch: BranchId, timestamp: Timestamp) -> Result<bool>;

    /// The revision of an object visible at a branch point, falling back to
    /// base branches.
    fn revision(&self, id: ObjectId, at: BranchPoint) -> Result<Option<ObjectRevision>>;

    /// Objects whose head revision on `branch` is contained in `id`.
    fn children(&self, id: ObjectId, branch: BranchId) -> Result<Vec<ObjectId>>;

    /// Non-local commits with `from < timestamp <= to`, ascending.
    fn commit_infos(&self, from: Timestamp, to: Timestamp) -> Result<Vec<CommitInfo>>;

    /// Merged id sets of the commits on `branch` with `from < timestamp <= to`.
    fn change_set(&self, branch: BranchId, from: Timestamp, to: Timestamp)
        -> Result<ChangedSets>;

    /// Exports non-local content in `(from_branch, to_branch]` x `(from_time, to_time]`.
    fn raw_export(
        &self,
        from_branch: BranchId,
        to_branch: BranchId,
        from_time: Timestamp,
        to_time: Timestamp,
    ) -> Result<RawDump>;

    /// Imports a raw dump; replaces the lock areas with the dump's.
    fn raw_import(&self, dump: &RawDump) -> Result<RawImportSummary>;

    /// Persisted durable lock areas.
    fn lock_areas(&self) -> Result<Vec<LockArea>>;

    /// Persists or replaces a lock area.
    fn put_lock_area(&self, area: LockArea) -> Result<()>;

    /// Removes a lock area.
    fn remove_lock_area(&self, id: &str) -> Result<()>;

    /// Reads a persistent property.
    fn property(&self, key: &str) -> Result<Option<String>>;

    /// Writes persistent properties.
    fn set_properties(&self, props: &[(&str, String)]) -> Result<()>;

    /// Removes persistent properties.
    fn remove_properties(&self, keys: &[&str]) -> Result<()>;

    /// Registers package units; returns how many were new.
    fn register_packages(&self, units: &[PackageUnit]) -> Result<usize>;

    /// The package registry.
    fn packages(&self) -> Result<Vec<PackageUnit>>;

    /// True until [`RevisionStore::mark_started`] was called once.
    fn is_first_start(&self) -> Result<bool>;

    /// Records that the store has been activated at least once.
    fn mark_started(&self) -> Result<()>;
}

impl<'s> dyn RevisionStore + 's {
    /// Opens a staging area on `branch`.
    pub fn prepare_commit(&self, branch: BranchId) -> Result<StagingArea<'_>> {
        if self.branch(branch)?.is_none() {
            return Err(ReplError::store(format!("branch {} does not exist", branch)));
        }
        Ok(StagingArea {
            store: self,
            branch,
            data: CommitData::default(),
            origin: CommitOrigin::Local,
        })
    }
}

/// Collects the change set of one commit.
pub struct StagingArea<'a> {
    store: &'a dyn RevisionStore,
    branch: BranchId,
    data: CommitData,
    origin: CommitOrigin,
}

impl<'a> StagingArea<'a> {
    /// Target branch.
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Tags the staged commit with its write path.
    pub fn set_origin(&mut self, origin: CommitOrigin) {
        self.origin = origin;
    }

    /// Stages a change set. Temporary ids of new objects are replaced with
    /// permanent ids; the mapping is returned.
    pub fn stage(&mut self, mut data: CommitData) -> Result<HashMap<ObjectId, ObjectId>> {
        let mut mappings = HashMap::new();
        for rev in &data.new_objects {
            if rev.id.is_temporary() {
                mappings.insert(rev.id, self.store.allocate_object_id()?);
            }
        }
        data.apply_id_mappings(&mappings);
        self.data = data;
        Ok(mappings)
    }

    /// The staged change set.
    pub fn data(&self) -> &CommitData {
        &self.data
    }

    /// Writes the staged change set.
    pub fn commit(
        self,
        timestamp_override: Option<Timestamp>,
        author: &str,
        comment: &str,
    ) -> Result<Commit> {
        let staged = StagedCommit {
            branch: self.branch,
            data: self.data,
            origin: self.origin,
        };
        self.store
            .apply_commit(staged, timestamp_override, author, comment)
    }
}

struct StoredRevision {
    branch: BranchId,
    timestamp: Timestamp,
    /// `None` marks a detachment.
    revision: Option<ObjectRevision>,
}

struct CommitRecord {
    commit: Commit,
    previous_timestamp: Timestamp,
    data: CommitData,
}

struct StoreState {
    branches: BTreeMap<BranchId, Branch>,
    next_local_branch: i32,
    commits: BTreeMap<(Timestamp, BranchId), CommitRecord>,
    objects: HashMap<ObjectId, Vec<StoredRevision>>,
    next_object_id: u64,
    next_commit_id: u64,
    last_issued: Timestamp,
    last_commit_time: Timestamp,
    packages: Vec<PackageUnit>,
    lock_areas: BTreeMap<String, LockArea>,
    properties: BTreeMap<String, String>,
    started: bool,
}

const HEAD: Timestamp = Timestamp::MAX;

impl StoreState {
    fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(BranchId::MAIN, Branch::main());
        Self {
            branches,
            next_local_branch: -1,
            commits: BTreeMap::new(),
            objects: HashMap::new(),
            next_object_id: 1,
            next_commit_id: 1,
            last_issued: Timestamp::UNSPECIFIED,
            last_commit_time: Timestamp::UNSPECIFIED,
            packages: Vec::new(),
            lock_areas: BTreeMap::new(),
            properties: BTreeMap::new(),
            started: false,
        }
    }

    fn issue_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let ts = if now > self.last_issued {
            now
        } else {
            self.last_issued.next()
        };
        self.last_issued = ts;
        ts
    }

    fn is_local_branch(&self, id: BranchId) -> bool {
        id.is_local() || self.branches.get(&id).is_some_and(|b| b.local)
    }

    fn revision_at(&self, id: ObjectId, at: BranchPoint) -> Option<ObjectRevision> {
        let history = self.objects.get(&id)?;
        let mut point = at;
        loop {
            let visible = history
                .iter()
                .filter(|e| e.branch == point.branch && e.timestamp <= point.timestamp)
                .max_by_key(|e| e.timestamp);
            if let Some(entry) = visible {
                return entry.revision.clone();
            }
            if point.branch == BranchId::MAIN {
                return None;
            }
            let base = self.branches.get(&point.branch)?.base;
            point = BranchPoint::new(base.branch, base.timestamp.min(point.timestamp));
        }
    }

    fn apply(
        &mut self,
        staged: StagedCommit,
        timestamp: Option<Timestamp>,
        author: &str,
        comment: &str,
    ) -> Result<Commit> {
        let branch = staged.branch;
        if !self.branches.contains_key(&branch) {
            return Err(ReplError::store(format!("branch {} does not exist", branch)));
        }
        let timestamp = match timestamp {
            Some(ts) => ts,
            None => self.issue_timestamp(),
        };
        if self.commits.contains_key(&(timestamp, branch)) {
            return Err(ReplError::store(format!(
                "commit {} already exists on branch {}",
                timestamp, branch
            )));
        }

        let mut data = staged.data;
        let mut mappings = HashMap::new();
        for rev in &data.new_objects {
            if rev.id.is_temporary() {
                let id = ObjectId::new(self.next_object_id);
                self.next_object_id += 1;
                mappings.insert(rev.id, id);
            } else {
                self.next_object_id = self.next_object_id.max(rev.id.as_u64() + 1);
            }
        }
        data.apply_id_mappings(&mappings);

        let head = BranchPoint::new(branch, HEAD);
        let mut entries = Vec::with_capacity(
            data.new_objects.len() + data.changed_objects.len() + data.detached_objects.len(),
        );
        for delta in &data.changed_objects {
            let previous = self.revision_at(delta.id, head).ok_or_else(|| {
                ReplError::store(format!("object {} not found on branch {}", delta.id, branch))
            })?;
            entries.push((
                delta.id,
                Some(ObjectRevision {
                    id: delta.id,
                    version: delta.version + 1,
                    class: previous.class,
                    container: previous.container,
                    payload: delta.payload.clone(),
                }),
            ));
        }
        for id in &data.detached_objects {
            if self.revision_at(*id, head).is_none() {
                return Err(ReplError::store(format!(
                    "object {} not found on branch {}",
                    id, branch
                )));
            }
            entries.push((*id, None));
        }
        for rev in &data.new_objects {
            entries.push((rev.id, Some(rev.clone())));
        }

        for (id, revision) in entries {
            self.objects.entry(id).or_default().push(StoredRevision {
                branch,
                timestamp,
                revision,
            });
        }
        for unit in &data.new_package_units {
            if !self.packages.iter().any(|p| p.uri == unit.uri) {
                self.packages.push(unit.clone());
            }
        }

        let commit = Commit {
            id: CommitId::new(self.next_commit_id),
            timestamp,
            group_id: self.next_commit_id,
            branch,
            author: author.to_string(),
            comment: comment.to_string(),
        };
        self.next_commit_id += 1;
        let previous_timestamp = self.last_commit_time;
        self.commits.insert(
            (timestamp, branch),
            CommitRecord {
                commit: commit.clone(),
                previous_timestamp,
                data,
            },
        );
        self.last_commit_time = self.last_commit_time.max(timestamp);
        self.last_issued = self.last_issued.max(timestamp);
        Ok(commit)
    }

    fn create_branch(
        &mut self,
        id: BranchId,
        name: &str,
        base: BranchPoint,
        created: Timestamp,
        local: bool,
    ) -> Result<Branch> {
        if let Some(existing) = self.branches.get(&id) {
            if existing.name == name && existing.base == base {
                return Ok(existing.clone());
            }
            return Err(ReplError::store(format!(
                "branch {} already exists as {}",
                id, existing.name
            )));
        }
        if !self.branches.contains_key(&base.branch) {
            return Err(ReplError::store(format!(
                "base branch {} does not exist",
                base.branch
            )));
        }
        let branch = Branch {
            id,
            name: name.to_string(),
            base,
            created,
            local,
        };
        self.branches.insert(id, branch.clone());
        Ok(branch)
    }
}

/// In-memory revision store. Thread-safe via RwLock.
///
/// Does not persist data across process restarts; a clone of the handle
/// shares the same content, which is how tests model a restart.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    /// Creates an empty store containing only MAIN.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::new())),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|e| ReplError::store(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|e| ReplError::store(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionStore for MemoryStore {
    fn branches(&self) -> Result<Vec<Branch>> {
        Ok(self.read()?.branches.values().cloned().collect())
    }

    fn branch(&self, id: BranchId) -> Result<Option<Branch>> {
        Ok(self.read()?.branches.get(&id).cloned())
    }

    fn create_branch(
        &self,
        id: BranchId,
        name: &str,
        base: BranchPoint,
        created: Timestamp,
    ) -> Result<Branch> {
        if id.is_local() {
            return Err(ReplError::store(format!(
                "branch id {} is reserved for local branches",
                id
            )));
        }
        self.write()?.create_branch(id, name, base, created, false)
    }

    fn create_local_branch(&self, name: &str, base: BranchPoint) -> Result<Branch> {
        let mut state = self.write()?;
        let id = BranchId::new(state.next_local_branch);
        let created = state.issue_timestamp();
        let branch = state.create_branch(id, name, base, created, true)?;
        state.next_local_branch -= 1;
        Ok(branch)
    }

    fn remove_local_branch(&self, id: BranchId) -> Result<bool> {
        let mut state = self.write()?;
        if !state.is_local_branch(id) {
            return Err(ReplError::store(format!("branch {} is not local", id)));
        }
        if state.commits.keys().any(|(_, branch)| *branch == id) {
            return Err(ReplError::store(format!("branch {} has commits", id)));
        }
        Ok(state.branches.remove(&id).is_some())
    }

    fn last_branch_id(&self) -> Result<BranchId> {
        let state = self.read()?;
        Ok(state
            .branches
            .keys()
            .filter(|id| !state.is_local_branch(**id))
            .max()
            .copied()
            .unwrap_or(BranchId::MAIN))
    }

    fn last_commit_time(&self) -> Result<Timestamp> {
        Ok(self.read()?.last_commit_time)
    }

    fn last_non_local_commit_time(&self) -> Result<Timestamp> {
        let state = self.read()?;
        Ok(state
            .commits
            .keys()
            .rev()
            .find(|(_, branch)| !state.is_local_branch(*branch))
            .map(|(ts, _)| *ts)
            .unwrap_or(Timestamp::UNSPECIFIED))
    }

    fn create_commit_timestamp(&self) -> Result<Timestamp> {
        Ok(self.write()?.issue_timestamp())
    }

    fn force_commit_time(&self, ts: Timestamp) -> Result<()> {
        let mut state = self.write()?;
        state.last_issued = state.last_issued.max(ts);
        Ok(())
    }

    fn allocate_object_id(&self) -> Result<ObjectId> {
        let mut state = self.write()?;
        let id = ObjectId::new(state.next_object_id);
        state.next_object_id += 1;
        Ok(id)
    }

    fn apply_commit(
        &self,
        staged: StagedCommit,
        timestamp: Option<Timestamp>,
        author: &str,
        comment: &str,
    ) -> Result<Commit> {
        self.write()?.apply(staged, timestamp, author, comment)
    }

    fn has_commit(&self, branch: BranchId, timestamp: Timestamp) -> Result<bool> {
        Ok(self.read()?.commits.contains_key(&(timestamp, branch)))
    }

    fn revision(&self, id: ObjectId, at: BranchPoint) -> Result<Option<ObjectRevision>> {
        Ok(self.read()?.revision_at(id, at))
    }

    fn children(&self, id: ObjectId, branch: BranchId) -> Result<Vec<ObjectId>> {
        let state = self.read()?;
        let head = BranchPoint::new(branch, HEAD);
        let mut children: Vec<ObjectId> = state
            .objects
            .keys()
            .filter(|candidate| {
                state
                    .revision_at(**candidate, head)
                    .is_some_and(|rev| rev.container == Some(id))
            })
            .copied()
            .collect();
        children.sort();
        Ok(children)
    }

    fn commit_infos(&self, from: Timestamp, to: Timestamp) -> Result<Vec<CommitInfo>> {
        let state = self.read()?;
        Ok(state
            .commits
            .iter()
            .filter(|((ts, branch), _)| *ts > from && *ts <= to && !state.is_local_branch(*branch))
            .map(|(_, record)| CommitInfo {
                branch: record.commit.branch,
                timestamp: record.commit.timestamp,
                previous_timestamp: record.previous_timestamp,
                user_id: record.commit.author.clone(),
                comment: record.commit.comment.clone(),
                data: record.data.clone(),
            })
            .collect())
    }

    fn change_set(
        &self,
        branch: BranchId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<ChangedSets> {
        let state = self.read()?;
        let mut sets = ChangedSets::default();
        for ((ts, b), record) in state.commits.iter() {
            if *b == branch && *ts > from && *ts <= to {
                sets.merge(record.data.changed_sets());
            }
        }
        Ok(sets)
    }

    fn raw_export(
        &self,
        from_branch: BranchId,
        to_branch: BranchId,
        from_time: Timestamp,
        to_time: Timestamp,
    ) -> Result<RawDump> {
        let state = self.read()?;
        let branches = state
            .branches
            .values()
            .filter(|b| !b.is_local() && b.id > from_branch && b.id <= to_branch)
            .cloned()
            .collect();
        let commits = state
            .commits
            .iter()
            .filter(|((ts, branch), _)| {
                *ts > from_time && *ts <= to_time && !state.is_local_branch(*branch)
            })
            .map(|(_, record)| RawCommit {
                commit: record.commit.clone(),
                previous_timestamp: record.previous_timestamp,
                data: record.data.clone(),
            })
            .collect();
        Ok(RawDump {
            from_branch: from_branch.as_i32(),
            to_branch: to_branch.as_i32(),
            from_time: from_time.as_u64(),
            to_time: to_time.as_u64(),
            branches,
            commits,
            packages: state.packages.clone(),
            lock_areas: state.lock_areas.values().cloned().collect(),
        })
    }

    fn raw_import(&self, dump: &RawDump) -> Result<RawImportSummary> {
        let mut state = self.write()?;
        let mut summary = RawImportSummary::default();

        for branch in &dump.branches {
            if !state.branches.contains_key(&branch.id) {
                state.create_branch(branch.id, &branch.name, branch.base, branch.created, false)?;
                summary.branches += 1;
            }
        }
        for unit in &dump.packages {
            if !state.packages.iter().any(|p| p.uri == unit.uri) {
                state.packages.push(unit.clone());
            }
        }
        for raw in &dump.commits {
            let key = (raw.commit.timestamp, raw.commit.branch);
            if state.commits.contains_key(&key) {
                continue;
            }
            let staged = StagedCommit {
                branch: raw.commit.branch,
                data: raw.data.clone(),
                origin: CommitOrigin::RawImport,
            };
            state.apply(
                staged,
                Some(raw.commit.timestamp),
                &raw.commit.author,
                &raw.commit.comment,
            )?;
            summary.commits += 1;
        }
        state.lock_areas = dump
            .lock_areas
            .iter()
            .map(|area| (area.id.clone(), area.clone()))
            .collect();
        Ok(summary)
    }

    fn lock_areas(&self) -> Result<Vec<LockArea>> {
        Ok(self.read()?.lock_areas.values().cloned().collect())
    }

    fn put_lock_area(&self, area: LockArea) -> Result<()> {
        self.write()?.lock_areas.insert(area.id.clone(), area);
        Ok(())
    }

    fn remove_lock_area(&self, id: &str) -> Result<()> {
        self.write()?.lock_areas.remove(id);
        Ok(())
    }

    fn property(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.properties.get(key).cloned())
    }

    fn set_properties(&self, props: &[(&str, String)]) -> Result<()> {
        let mut state = self.write()?;
        for (key, value) in props {
            state.properties.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    fn remove_properties(&self, keys: &[&str]) -> Result<()> {
        let mut state = self.write()?;
        for key in keys {
            state.properties.remove(*key);
        }
        Ok(())
    }

    fn register_packages(&self, units: &[PackageUnit]) -> Result<usize> {
        let mut state = self.write()?;
        let mut added = 0;
        for unit in units {
            if !state.packages.iter().any(|p| p.uri == unit.uri) {
                state.packages.push(unit.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    fn packages(&self) -> Result<Vec<PackageUnit>> {
        Ok(self.read()?.packages.clone())
    }

    fn is_first_start(&self) -> Result<bool> {
        Ok(!self.read()?.started)
    }

    fn mark_started(&self) -> Result<()> {
        self.write()?.started = true;
        Ok(())
    }
}

/// Head revisions handed out to readers, keyed by object and branch.
#[derive(Default)]
pub struct RevisionCache {
    revisions: DashMap<(ObjectId, BranchId), ObjectRevision>,
}

impl RevisionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached head revision.
    pub fn get(&self, id: ObjectId, branch: BranchId) -> Option<ObjectRevision> {
        self.revisions.get(&(id, branch)).map(|r| r.value().clone())
    }

    /// Caches a head revision.
    pub fn put(&self, branch: BranchId, revision: ObjectRevision) {
        self.revisions.insert((revision.id, branch), revision);
    }

    /// Drops one cached revision.
    pub fn remove_revision(&self, id: ObjectId, branch: BranchId) -> Option<ObjectRevision> {
        self.revisions.remove(&(id, branch)).map(|(_, rev)| rev)
    }

    /// Drops the cached revisions of `ids` on every branch.
    pub fn remove_objects(&self, ids: &[ObjectId]) -> usize {
        let before = self.revisions.len();
        self.revisions.retain(|(id, _), _| !ids.contains(id));
        before - self.revisions.len()
    }

    /// Snapshot of every cached revision with its branch.
    pub fn current_revisions(&self) -> Vec<(BranchId, ObjectRevision)> {
        self.revisions
            .iter()
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect()
    }

    /// Number of cached revisions.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}
