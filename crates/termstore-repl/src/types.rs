//! Core identifier and value types shared by the replication subsystem.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// User id recorded on commits produced by the repository itself.
pub const SYSTEM_USER_ID: &str = "system";

/// Identifier of a branch. MAIN is 0, replicated branches are positive and
/// local-only branches are negative.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(i32);

impl BranchId {
    /// The MAIN branch.
    pub const MAIN: BranchId = BranchId(0);

    /// Creates a new BranchId from a raw value
    pub fn new(id: i32) -> Self {
        BranchId(id)
    }

    /// Returns the raw value of this branch ID
    pub fn as_i32(&self) -> i32 {
        self.0
    }

    /// Local-only branches are never replicated.
    pub fn is_local(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whole milliseconds of `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Commit timestamp in milliseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Sentinel for "never".
    pub const UNSPECIFIED: Timestamp = Timestamp(0);

    /// The end of time, used to address branch heads.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Creates a new Timestamp from raw milliseconds
    pub const fn new(ms: u64) -> Self {
        Timestamp(ms)
    }

    /// Returns the raw millisecond value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The current wall clock time.
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(ms)
    }

    /// One millisecond earlier, saturating at zero.
    pub fn previous(&self) -> Self {
        Timestamp(self.0.saturating_sub(1))
    }

    /// One millisecond later.
    pub fn next(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stored object. Ids with the high bit set are temporary
/// ids assigned by a client before the store maps them to permanent ids.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    const TEMPORARY_BIT: u64 = 1 << 63;

    /// Creates a permanent object id
    pub fn new(id: u64) -> Self {
        ObjectId(id & !Self::TEMPORARY_BIT)
    }

    /// Creates a temporary object id
    pub fn temporary(n: u64) -> Self {
        ObjectId(n | Self::TEMPORARY_BIT)
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether the store still has to assign a permanent id.
    pub fn is_temporary(&self) -> bool {
        self.0 & Self::TEMPORARY_BIT != 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_temporary() {
            write!(f, "t{}", self.0 & !Self::TEMPORARY_BIT)
        } else {
            write!(f, "o{}", self.0)
        }
    }
}

/// Identifier of a commit record in the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(u64);

impl CommitId {
    /// Creates a new CommitId
    pub fn new(id: u64) -> Self {
        CommitId(id)
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client or replication session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new SessionId
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in the history of a branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchPoint {
    /// The branch.
    pub branch: BranchId,
    /// Time on that branch.
    pub timestamp: Timestamp,
}

impl BranchPoint {
    /// Creates a new branch point.
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }
}

/// A branch of the repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identifier.
    pub id: BranchId,
    /// Full path name, e.g. `MAIN/local-task`.
    pub name: String,
    /// Where the branch forks from its parent. MAIN has no meaningful base.
    pub base: BranchPoint,
    /// When the branch was created.
    pub created: Timestamp,
    /// Local-only branches are never mirrored from or to the primary.
    pub local: bool,
}

impl Branch {
    /// The MAIN branch descriptor.
    pub fn main() -> Self {
        Self {
            id: BranchId::MAIN,
            name: "MAIN".to_string(),
            base: BranchPoint::new(BranchId::MAIN, Timestamp::UNSPECIFIED),
            created: Timestamp::UNSPECIFIED,
            local: false,
        }
    }

    /// Whether the branch is local-only.
    pub fn is_local(&self) -> bool {
        self.local || self.id.is_local()
    }
}

/// A schema unit registered in the package registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUnit {
    /// Namespace URI of the package.
    pub uri: String,
    /// Serialized schema definition.
    pub schema: Vec<u8>,
}

/// A full revision of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRevision {
    /// Object identifier.
    pub id: ObjectId,
    /// Version number, starting at 1.
    pub version: u32,
    /// Schema class name.
    pub class: String,
    /// Containing object, if any.
    pub container: Option<ObjectId>,
    /// Serialized feature values.
    pub payload: Vec<u8>,
}

impl ObjectRevision {
    /// Creates a first-version revision.
    pub fn new(id: ObjectId, class: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            version: 1,
            class: class.into(),
            container: None,
            payload,
        }
    }

    /// Sets the containing object.
    pub fn with_container(mut self, container: ObjectId) -> Self {
        self.container = Some(container);
        self
    }
}

/// A change to an existing object. `version` is the version being changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionDelta {
    /// Object identifier.
    pub id: ObjectId,
    /// Base version the delta applies to.
    pub version: u32,
    /// New serialized feature values.
    pub payload: Vec<u8>,
}

/// Identifier plus version of an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Object identifier.
    pub id: ObjectId,
    /// Object version.
    pub version: u32,
}

/// The change set of one commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    /// Schema units first introduced by the commit.
    pub new_package_units: Vec<PackageUnit>,
    /// Newly attached objects.
    pub new_objects: Vec<ObjectRevision>,
    /// Changes to existing objects.
    pub changed_objects: Vec<RevisionDelta>,
    /// Detached objects.
    pub detached_objects: Vec<ObjectId>,
}

impl CommitData {
    /// True if the commit carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.new_package_units.is_empty()
            && self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.detached_objects.is_empty()
    }

    /// Ids of existing objects the commit modifies or detaches.
    pub fn dirty_ids(&self) -> Vec<ObjectId> {
        self.changed_objects
            .iter()
            .map(|d| d.id)
            .chain(self.detached_objects.iter().copied())
            .collect()
    }

    /// Every object id the commit touches.
    pub fn touched_ids(&self) -> Vec<ObjectId> {
        self.new_objects
            .iter()
            .map(|r| r.id)
            .chain(self.dirty_ids())
            .collect()
    }

    /// The id/version projection published in notifications.
    pub fn changed_sets(&self) -> ChangedSets {
        ChangedSets {
            new_objects: self
                .new_objects
                .iter()
                .map(|r| ObjectKey {
                    id: r.id,
                    version: r.version,
                })
                .collect(),
            changed_objects: self
                .changed_objects
                .iter()
                .map(|d| ObjectKey {
                    id: d.id,
                    version: d.version + 1,
                })
                .collect(),
            detached_objects: self.detached_objects.clone(),
        }
    }

    /// Rewrites temporary ids to the ids assigned by the store.
    pub fn apply_id_mappings(&mut self, mappings: &HashMap<ObjectId, ObjectId>) {
        if mappings.is_empty() {
            return;
        }
        let map = |id: ObjectId| mappings.get(&id).copied().unwrap_or(id);
        for rev in &mut self.new_objects {
            rev.id = map(rev.id);
            rev.container = rev.container.map(map);
        }
        for delta in &mut self.changed_objects {
            delta.id = map(delta.id);
        }
        for id in &mut self.detached_objects {
            *id = map(*id);
        }
    }
}

/// Id sets derived from a commit, as published to local listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedSets {
    /// New objects.
    pub new_objects: Vec<ObjectKey>,
    /// Changed objects with their resulting version.
    pub changed_objects: Vec<ObjectKey>,
    /// Detached objects.
    pub detached_objects: Vec<ObjectId>,
}

impl ChangedSets {
    /// Merges another set into this one, keeping each id once.
    pub fn merge(&mut self, other: ChangedSets) {
        for key in other.new_objects {
            if !self.new_objects.iter().any(|k| k.id == key.id) {
                self.new_objects.push(key);
            }
        }
        for key in other.changed_objects {
            if let Some(existing) = self.changed_objects.iter_mut().find(|k| k.id == key.id) {
                existing.version = existing.version.max(key.version);
            } else if !self.new_objects.iter().any(|k| k.id == key.id) {
                self.changed_objects.push(key);
            }
        }
        for id in other.detached_objects {
            if !self.detached_objects.contains(&id) {
                self.detached_objects.push(id);
            }
        }
    }

    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.detached_objects.is_empty()
    }
}

/// A commit as recorded by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Store-assigned id.
    pub id: CommitId,
    /// Commit timestamp.
    pub timestamp: Timestamp,
    /// Group of commits this one belongs to (its own id unless replayed).
    pub group_id: u64,
    /// Target branch.
    pub branch: BranchId,
    /// Committing user.
    pub author: String,
    /// Commit comment.
    pub comment: String,
}

/// Immutable description of one commit made on the primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Branch the commit was made on.
    pub branch: BranchId,
    /// Primary-assigned timestamp.
    pub timestamp: Timestamp,
    /// Timestamp of the preceding commit on the primary.
    pub previous_timestamp: Timestamp,
    /// Committing user.
    pub user_id: String,
    /// Commit comment.
    pub comment: String,
    /// The change set.
    pub data: CommitData,
}

/// Kind of pessimistic lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Write option: blocks other write options and writes, allows reads.
    WriteOption,
}

/// Whether a lock change acquired or released locks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOperation {
    /// Locks were acquired.
    Lock,
    /// Locks were released.
    Unlock,
}

/// The view holding a lock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// Session the view belongs to.
    pub session: SessionId,
    /// View within the session.
    pub view: u32,
    /// Durable locking area, if durable locking is enabled for the view.
    pub durable_locking_id: Option<String>,
}

impl LockOwner {
    /// Creates a non-durable owner.
    pub fn new(session: SessionId, view: u32) -> Self {
        Self {
            session,
            view,
            durable_locking_id: None,
        }
    }

    /// Enables durable locking under the given area id.
    pub fn with_durable_locking(mut self, area_id: impl Into<String>) -> Self {
        self.durable_locking_id = Some(area_id.into());
        self
    }

    /// Identity used by the lock table; a durable area outlives its session.
    pub fn key(&self) -> String {
        match &self.durable_locking_id {
            Some(area) => format!("area:{}", area),
            None => format!("view:{}:{}", self.session, self.view),
        }
    }
}

/// Resulting lock state of one target after a lock change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// The locked object.
    pub target: ObjectId,
    /// Owner keys holding read locks.
    pub read_owners: Vec<String>,
    /// Owner key holding the write lock.
    pub write_owner: Option<String>,
    /// Owner key holding the write option.
    pub write_option_owner: Option<String>,
}

/// Immutable description of a lock change on the primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChangeInfo {
    /// The view whose locks changed.
    pub owner: LockOwner,
    /// Branch viewed by the owner.
    pub branch: BranchId,
    /// Lock kind.
    pub lock_type: LockType,
    /// Lock or unlock.
    pub operation: LockOperation,
    /// Targets and their resulting state.
    pub lock_states: Vec<LockState>,
    /// When the change happened on the primary.
    pub timestamp: Timestamp,
}

impl LockChangeInfo {
    /// The changed targets.
    pub fn targets(&self) -> Vec<ObjectId> {
        self.lock_states.iter().map(|s| s.target).collect()
    }
}
