//! Contract with the remote primary repository.
//!
//! [`PrimaryClient`] is the narrow RPC surface a replica consumes; any
//! transport can implement it. A [`RemoteSession`] is owned by the
//! replication runner, which publishes the read-only [`SessionLink`] part for
//! write-through commits and lock delegation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{ReplError, Result};
use crate::store::LockArea;
use crate::types::{
    duration_millis, Branch, BranchId, CommitData, CommitInfo, LockChangeInfo, LockType,
    ObjectId, SessionId, Timestamp,
};

/// What the primary pushes for objects a session has cached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassiveUpdateMode {
    /// Only invalidations.
    Invalidations,
    /// Deltas of changed objects.
    Changes,
    /// Changes plus newly attached objects.
    Additions,
}

/// When the primary pushes lock changes to a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockNotificationMode {
    /// Never.
    Off,
    /// Only if the session asked for it per view.
    IfRequiredBySession,
    /// Always.
    Always,
}

/// Subscription options of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Whether passive updates are pushed at all.
    pub passive_update_enabled: bool,
    /// Passive update mode.
    pub passive_update_mode: PassiveUpdateMode,
    /// Lock notification mode.
    pub lock_notification_mode: LockNotificationMode,
}

impl SessionOptions {
    /// Options of a replication session: additions only, all lock changes.
    pub fn replication() -> Self {
        Self {
            passive_update_enabled: true,
            passive_update_mode: PassiveUpdateMode::Additions,
            lock_notification_mode: LockNotificationMode::Always,
        }
    }
}

/// Revision cache flavor reported by a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionCacheKind {
    /// Keeps nothing; every read goes to the primary or the local store.
    Noop,
    /// Caches revisions in memory.
    Caching,
}

/// Facts about the primary returned when a session opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepositoryInfo {
    /// Repository name.
    pub repository_id: String,
    /// Root resource id of the repository.
    pub root_resource_id: String,
    /// Revision cache of the session.
    pub revision_cache: RevisionCacheKind,
    /// Highest branch id on the primary.
    pub last_branch_id: BranchId,
    /// Latest commit time on the primary.
    pub last_commit_time: Timestamp,
}

/// Events pushed by the primary over a session.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEvent {
    /// A branch was created on the primary.
    BranchCreated(Branch),
    /// A commit happened on the primary. `remote` is false for commits
    /// requested through this very session.
    CommitInvalidation {
        /// The commit.
        info: CommitInfo,
        /// Whether another session made the commit.
        remote: bool,
    },
    /// Locks of some view changed on the primary.
    LocksChanged(LockChangeInfo),
    /// The session was closed by the primary or the link dropped.
    SessionDeactivated,
}

/// Monotonic "last update" time of a session.
pub struct UpdateClock {
    tx: watch::Sender<Timestamp>,
}

impl UpdateClock {
    /// Creates a clock starting at `initial`.
    pub fn new(initial: Timestamp) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn current(&self) -> Timestamp {
        *self.tx.borrow()
    }

    /// Moves the clock to `ts` if that is later. Returns whether it moved.
    pub fn advance(&self, ts: Timestamp) -> bool {
        self.tx.send_if_modified(|current| {
            if ts > *current {
                *current = ts;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the clock reaches `ts`.
    pub async fn wait_for(&self, ts: Timestamp, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|current| *current >= ts).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReplError::Shutdown),
            Err(_) => Err(ReplError::LockTimeout {
                msg: format!("update {} (last update {})", ts, self.current()),
                timeout_ms: duration_millis(timeout),
            }),
        }
    }
}

/// The shareable part of a replication session.
pub struct SessionLink {
    id: SessionId,
    options: SessionOptions,
    clock: UpdateClock,
}

impl SessionLink {
    /// Creates a link for session `id`.
    pub fn new(id: SessionId, options: SessionOptions, last_update: Timestamp) -> Self {
        Self {
            id,
            options,
            clock: UpdateClock::new(last_update),
        }
    }

    /// Session id on the primary.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Subscription options.
    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Whether the primary pushes passive updates to this session.
    pub fn is_passive_update_enabled(&self) -> bool {
        self.options.passive_update_enabled
    }

    /// Last update time received over the session.
    pub fn last_update_time(&self) -> Timestamp {
        self.clock.current()
    }

    /// Records an update received over the session.
    pub fn set_last_update_time(&self, ts: Timestamp) -> bool {
        self.clock.advance(ts)
    }

    /// Blocks until the session has seen updates up to `ts`.
    pub async fn wait_for_update(&self, ts: Timestamp, timeout: Duration) -> Result<()> {
        self.clock.wait_for(ts, timeout).await
    }
}

/// A live session with the primary, owned by the runner.
pub struct RemoteSession {
    /// Shareable part.
    pub link: Arc<SessionLink>,
    /// Facts about the primary.
    pub info: RemoteRepositoryInfo,
    /// Pushed events; closes when the session ends.
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
}

/// Bounds of a raw replication. `None` upper bounds mean "latest on the primary".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRange {
    /// Exclusive lower branch bound.
    pub from_branch: BranchId,
    /// Inclusive upper branch bound.
    pub to_branch: Option<BranchId>,
    /// Exclusive lower commit-time bound.
    pub from_time: Timestamp,
    /// Inclusive upper commit-time bound.
    pub to_time: Option<Timestamp>,
}

/// Encoded raw replication stream with its resolved bounds.
#[derive(Clone, Debug)]
pub struct RawReplication {
    /// Inclusive upper branch bound actually exported.
    pub to_branch: BranchId,
    /// Inclusive upper commit-time bound actually exported.
    pub to_time: Timestamp,
    /// Encoded dump.
    pub stream: Bytes,
}

/// Result of an incremental replication.
#[derive(Clone, Debug, Default)]
pub struct ChangeReplication {
    /// Branches created after the lower bound, ascending by id.
    pub branches: Vec<Branch>,
    /// Commits after the lower bound, ascending by timestamp.
    pub commits: Vec<CommitInfo>,
    /// Every durable lock area of the primary.
    pub lock_areas: Vec<LockArea>,
}

/// A write-through commit sent to the primary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitDescriptor {
    /// Session the commit is delegated through.
    pub session: SessionId,
    /// View id; write-through commits use an artificial view 0.
    pub view_id: u32,
    /// Durable locking area of the committing view, so its own locks do not block it.
    pub lock_area: Option<String>,
    /// Target branch.
    pub branch: BranchId,
    /// Committing user.
    pub user_id: String,
    /// Commit comment.
    pub comment: String,
    /// The change set.
    pub data: CommitData,
    /// New objects to lock on the primary after commit.
    pub locks_on_new_objects: Vec<ObjectId>,
    /// Release the committer's locks after commit.
    pub auto_release_locks: bool,
}

/// Outcome of a delegated commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDelegationResult {
    /// Authoritative commit timestamp.
    pub timestamp: Timestamp,
    /// Temporary-to-permanent id mapping for new objects.
    pub id_mappings: HashMap<ObjectId, ObjectId>,
    /// Set when the primary rolled the commit back.
    pub rollback_message: Option<String>,
}

/// A lock request delegated to the primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDelegation {
    /// Durable locking area of the requesting view.
    pub area_id: String,
    /// Objects to lock.
    pub targets: Vec<ObjectId>,
    /// Branch viewed.
    pub branch: BranchId,
    /// Lock kind.
    pub lock_type: LockType,
    /// Also lock contained objects.
    pub recursive: bool,
    /// How long the primary may wait for the locks.
    pub timeout_ms: u64,
}

/// Outcome of a delegated lock request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDelegationResult {
    /// Whether the locks were granted.
    pub successful: bool,
    /// The caller must wait for `required_timestamp` before using the locks.
    pub wait_for_update: bool,
    /// Update time the caller must have seen.
    pub required_timestamp: Timestamp,
}

/// An unlock request delegated to the primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockDelegation {
    /// Durable locking area of the requesting view.
    pub area_id: String,
    /// Branch viewed.
    pub branch: BranchId,
    /// Objects to unlock; `None` unlocks everything held by the area.
    pub targets: Option<Vec<ObjectId>>,
    /// Lock kind; `None` releases every kind.
    pub lock_type: Option<LockType>,
    /// Also unlock contained objects.
    pub recursive: bool,
}

/// RPC surface of a primary repository.
#[async_trait]
pub trait PrimaryClient: Send + Sync {
    /// Opens a session with the given subscription options.
    async fn open_session(&self, options: SessionOptions) -> Result<RemoteSession>;

    /// Exports store content in `range` as an encoded stream.
    async fn replicate_raw(&self, session: SessionId, range: RawRange) -> Result<RawReplication>;

    /// Returns branches, commits and lock areas after the given bounds.
    async fn replicate_changes(
        &self,
        session: SessionId,
        from_branch: BranchId,
        from_time: Timestamp,
    ) -> Result<ChangeReplication>;

    /// Commits on the primary on behalf of a replica.
    async fn commit_delegation(&self, commit: CommitDescriptor) -> Result<CommitDelegationResult>;

    /// Locks on the primary on behalf of a replica view.
    async fn delegate_lock_objects(
        &self,
        session: SessionId,
        request: LockDelegation,
    ) -> Result<LockDelegationResult>;

    /// Unlocks on the primary on behalf of a replica view.
    async fn delegate_unlock_objects(
        &self,
        session: SessionId,
        request: UnlockDelegation,
    ) -> Result<()>;

    /// Ends a session.
    async fn close_session(&self, session: SessionId) -> Result<()>;
}
