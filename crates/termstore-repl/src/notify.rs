//! Local commit and lock notification channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{
    Branch, BranchId, ChangedSets, Commit, CommitId, LockChangeInfo, PackageUnit, SessionId,
    Timestamp,
};

/// Published after every successful commit and raw replay window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitNotification {
    /// Repository that committed.
    pub repository_id: String,
    /// Store commit id.
    pub commit_id: CommitId,
    /// Commit group id.
    pub group_id: u64,
    /// Branch committed to.
    pub branch: BranchId,
    /// Commit timestamp.
    pub timestamp: Timestamp,
    /// Committing user.
    pub author: String,
    /// Commit comment.
    pub comment: String,
    /// Object ids that changed.
    pub changed: ChangedSets,
    /// Package units introduced by the commit.
    pub new_package_units: Vec<PackageUnit>,
    /// Session that requested the commit, if any.
    pub origin_session: Option<SessionId>,
}

/// Everything published on the notification channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A commit was written.
    Commit(CommitNotification),
    /// Locks of one view changed.
    Locks(LockChangeInfo),
    /// The lock table was rebuilt from the store.
    LocksReloaded,
    /// A branch was created.
    BranchCreated(Branch),
}

/// Fan-out of local notifications to any number of subscribers.
pub struct CommitNotifier {
    repository_id: String,
    tx: broadcast::Sender<Notification>,
    published: AtomicU64,
}

impl CommitNotifier {
    /// Creates a channel buffering up to `capacity` notifications per subscriber.
    pub fn new(repository_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            repository_id: repository_id.into(),
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Subscribes to notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of notifications published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn send(&self, notification: Notification) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(notification).is_err() {
            trace!("notification dropped, no subscribers");
        }
    }

    /// Publishes a commit.
    pub fn publish_commit(
        &self,
        commit: &Commit,
        changed: ChangedSets,
        new_package_units: Vec<PackageUnit>,
        origin_session: Option<SessionId>,
    ) {
        self.send(Notification::Commit(CommitNotification {
            repository_id: self.repository_id.clone(),
            commit_id: commit.id,
            group_id: commit.group_id,
            branch: commit.branch,
            timestamp: commit.timestamp,
            author: commit.author.clone(),
            comment: commit.comment.clone(),
            changed,
            new_package_units,
            origin_session,
        }));
    }

    /// Publishes a lock change.
    pub fn publish_locks(&self, info: LockChangeInfo) {
        self.send(Notification::Locks(info));
    }

    /// Publishes that the lock table was reloaded.
    pub fn publish_locks_reloaded(&self) {
        self.send(Notification::LocksReloaded);
    }

    /// Publishes a new branch.
    pub fn publish_branch(&self, branch: Branch) {
        self.send(Notification::BranchCreated(branch));
    }
}
