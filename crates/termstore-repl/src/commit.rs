//! Commit contexts: the four ways a change set reaches the local store.
//!
//! A [`CommitContext`] is built per commit attempt and executed once. Client
//! commits get a context from the role state machine's strategy choice; the
//! replication runner builds [`CommitContext::ReplicatorApply`] directly.
//!
//! Write-through commits hold the read side of the repository commit gate
//! while applying; replicated commits hold the write side, so a replay never
//! interleaves with an in-flight write-through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ReplError, Result};
use crate::primary::{CommitDescriptor, PrimaryClient, SessionLink};
use crate::repository::Repository;
use crate::role::CommitStrategy;
use crate::store::{CommitOrigin, RevisionStore};
use crate::types::{
    Branch, BranchId, BranchPoint, Commit, CommitData, CommitInfo, LockOwner, LockType, ObjectId,
    Timestamp,
};

/// A client commit request.
#[derive(Clone, Debug)]
pub struct CommitRequest {
    /// Target branch.
    pub branch: BranchId,
    /// Committing view.
    pub owner: LockOwner,
    /// Committing user.
    pub user_id: String,
    /// Commit comment.
    pub comment: String,
    /// The change set; new objects may carry temporary ids.
    pub data: CommitData,
    /// Release the view's locks on the branch after commit.
    pub release_locks: bool,
    /// New objects the view write-locks once they are committed.
    pub locks_on_new_objects: Vec<ObjectId>,
}

impl CommitRequest {
    /// Creates a request that keeps the view's locks.
    pub fn new(
        branch: BranchId,
        owner: LockOwner,
        user_id: impl Into<String>,
        comment: impl Into<String>,
        data: CommitData,
    ) -> Self {
        Self {
            branch,
            owner,
            user_id: user_id.into(),
            comment: comment.into(),
            data,
            release_locks: false,
            locks_on_new_objects: Vec::new(),
        }
    }

    /// Releases the view's locks after commit.
    pub fn release_locks(mut self) -> Self {
        self.release_locks = true;
        self
    }

    /// Write-locks `ids`, which name new objects of the change set, after commit.
    pub fn lock_new_objects(mut self, ids: impl IntoIterator<Item = ObjectId>) -> Self {
        self.locks_on_new_objects.extend(ids);
        self
    }
}

/// Which context produced a commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// Direct local commit.
    Local,
    /// Delegated to the primary first.
    WriteThrough,
    /// Redirected onto a new local branch.
    Branching,
    /// Replay of a primary commit.
    ReplicatorApply,
}

/// A successful commit.
#[derive(Clone, Debug)]
pub struct CommittedChange {
    /// The stored commit.
    pub commit: Commit,
    /// Branch the commit landed on; differs from the request for branching commits.
    pub branch: Branch,
    /// Temporary-to-permanent id mapping of new objects.
    pub id_mappings: HashMap<ObjectId, ObjectId>,
    /// Producing context.
    pub kind: ContextKind,
}

/// Direct commit with local timestamp allocation and lock checks.
pub struct LocalCommit {
    /// The request.
    pub request: CommitRequest,
    /// Target branch.
    pub branch: Branch,
}

/// Commit delegated to the primary, then applied with its timestamp.
pub struct WriteThroughCommit {
    /// The request.
    pub request: CommitRequest,
    /// Target branch.
    pub branch: Branch,
    /// Session the commit is delegated through.
    pub link: Arc<SessionLink>,
    /// The primary.
    pub primary: Arc<dyn PrimaryClient>,
}

/// Commit redirected onto a fresh local branch.
pub struct BranchingCommit {
    /// The request.
    pub request: CommitRequest,
    /// Branch the client targeted.
    pub parent: Branch,
    /// Base time of the new branch: the last replicated commit time, so
    /// everything replicated so far is visible on it.
    pub base_time: Timestamp,
}

/// Replay of a commit received from the primary.
pub struct ReplicatorApplyCommit {
    /// The remote commit.
    pub info: CommitInfo,
    /// Replay transaction id.
    pub transaction_id: u64,
}

/// One commit attempt.
pub enum CommitContext {
    /// See [`LocalCommit`].
    Local(LocalCommit),
    /// See [`WriteThroughCommit`].
    WriteThrough(WriteThroughCommit),
    /// See [`BranchingCommit`].
    Branching(BranchingCommit),
    /// See [`ReplicatorApplyCommit`].
    ReplicatorApply(ReplicatorApplyCommit),
}

impl CommitContext {
    /// Picks the context for a client commit.
    pub fn for_request(repo: &Repository, request: CommitRequest) -> Result<Self> {
        let branch = repo
            .store()
            .branch(request.branch)?
            .ok_or_else(|| ReplError::illegal(format!("branch {} does not exist", request.branch)))?;

        let context = match repo.role().select_strategy(&branch)? {
            CommitStrategy::Local => CommitContext::Local(LocalCommit { request, branch }),
            CommitStrategy::Branching => CommitContext::Branching(BranchingCommit {
                request,
                base_time: repo.role().last_replicated_commit_time(),
                parent: branch,
            }),
            CommitStrategy::WriteThrough => {
                let link = repo
                    .session_link()
                    .ok_or_else(|| ReplError::locked("not connected to primary"))?;
                let primary = repo
                    .primary()
                    .ok_or_else(|| ReplError::config("no primary configured"))?;
                CommitContext::WriteThrough(WriteThroughCommit {
                    request,
                    branch,
                    link,
                    primary,
                })
            }
        };
        Ok(context)
    }

    /// Context replaying a commit from the primary.
    pub fn replicated(repo: &Repository, info: CommitInfo) -> Self {
        CommitContext::ReplicatorApply(ReplicatorApplyCommit {
            info,
            transaction_id: repo.role().next_transaction_id(),
        })
    }

    /// Which variant this is.
    pub fn kind(&self) -> ContextKind {
        match self {
            CommitContext::Local(_) => ContextKind::Local,
            CommitContext::WriteThrough(_) => ContextKind::WriteThrough,
            CommitContext::Branching(_) => ContextKind::Branching,
            CommitContext::ReplicatorApply(_) => ContextKind::ReplicatorApply,
        }
    }

    /// Runs the commit. `None` means a replicated commit was skipped.
    pub async fn execute(self, repo: &Repository) -> Result<Option<CommittedChange>> {
        match self {
            CommitContext::Local(ctx) => commit_local(repo, ctx).await.map(Some),
            CommitContext::WriteThrough(ctx) => commit_write_through(repo, ctx).await.map(Some),
            CommitContext::Branching(ctx) => commit_branching(repo, ctx).map(Some),
            CommitContext::ReplicatorApply(ctx) => apply_replicated(repo, ctx).await,
        }
    }
}

/// Checks the change set against the content visible at `at`.
fn validate(repo: &Repository, at: BranchPoint, data: &CommitData) -> Result<()> {
    let store = repo.store();
    for id in data.dirty_ids() {
        if store.revision(id, at)?.is_none() {
            return Err(ReplError::Transaction {
                msg: format!("object {} does not exist on branch {}", id, at.branch),
            });
        }
    }
    let new_ids: HashSet<ObjectId> = data.new_objects.iter().map(|r| r.id).collect();
    for rev in &data.new_objects {
        if let Some(container) = rev.container {
            if !new_ids.contains(&container) && store.revision(container, at)?.is_none() {
                return Err(ReplError::Transaction {
                    msg: format!("container {} of {} does not exist", container, rev.id),
                });
            }
        }
    }
    Ok(())
}

fn finish_client_commit(
    repo: &Repository,
    request: &CommitRequest,
    commit: &Commit,
    changed_ids: &[ObjectId],
    data: &CommitData,
) -> Result<()> {
    repo.cache().remove_objects(changed_ids);
    if request.release_locks {
        repo.unlock_locally(&request.owner, commit.branch, None, None)?;
    }
    repo.notifier().publish_commit(
        commit,
        data.changed_sets(),
        data.new_package_units.clone(),
        Some(request.owner.session),
    );
    Ok(())
}

async fn lock_new_objects(
    repo: &Repository,
    request: &CommitRequest,
    branch: BranchId,
    id_mappings: &HashMap<ObjectId, ObjectId>,
) {
    if request.locks_on_new_objects.is_empty() {
        return;
    }
    let targets: Vec<ObjectId> = request
        .locks_on_new_objects
        .iter()
        .map(|id| id_mappings.get(id).copied().unwrap_or(*id))
        .collect();
    // Fresh objects carry no locks yet, so this never waits.
    if let Err(e) = repo
        .lock_locally(&request.owner, branch, LockType::Write, &targets, Duration::ZERO)
        .await
    {
        warn!(owner = %request.owner.key(), error = %e, "cannot lock new objects");
    }
}

async fn commit_local(repo: &Repository, ctx: LocalCommit) -> Result<CommittedChange> {
    let LocalCommit { request, branch } = ctx;
    validate(repo, BranchPoint::new(branch.id, Timestamp::MAX), &request.data)?;
    let dirty = request.data.dirty_ids();
    if let Some(id) = repo
        .locks()
        .foreign_write_lock(&request.owner.key(), branch.id, &dirty)?
    {
        return Err(ReplError::Transaction {
            msg: format!("object {} is locked by another view", id),
        });
    }

    let mut staging = repo.store().prepare_commit(branch.id)?;
    staging.set_origin(CommitOrigin::Local);
    let id_mappings = staging.stage(request.data.clone())?;
    let data = staging.data().clone();
    let commit = staging.commit(None, &request.user_id, &request.comment)?;

    finish_client_commit(repo, &request, &commit, &dirty, &data)?;
    lock_new_objects(repo, &request, branch.id, &id_mappings).await;
    debug!(branch = %branch.id, timestamp = %commit.timestamp, "local commit");
    Ok(CommittedChange {
        commit,
        branch,
        id_mappings,
        kind: ContextKind::Local,
    })
}

async fn commit_write_through(
    repo: &Repository,
    ctx: WriteThroughCommit,
) -> Result<CommittedChange> {
    let WriteThroughCommit {
        request,
        branch,
        link,
        primary,
    } = ctx;

    let descriptor = CommitDescriptor {
        session: link.id(),
        view_id: 0,
        lock_area: request.owner.durable_locking_id.clone(),
        branch: branch.id,
        user_id: request.user_id.clone(),
        comment: request.comment.clone(),
        data: request.data.clone(),
        locks_on_new_objects: Vec::new(),
        auto_release_locks: request.release_locks,
    };
    let result = primary.commit_delegation(descriptor).await?;
    if let Some(msg) = result.rollback_message {
        warn!(branch = %branch.id, reason = %msg, "write-through commit rolled back by primary");
        return Err(ReplError::Transaction { msg });
    }

    let mut data = request.data.clone();
    data.apply_id_mappings(&result.id_mappings);
    let dirty = data.dirty_ids();
    let commit = {
        let _gate = repo.commit_gate().read().await;
        let mut staging = repo.store().prepare_commit(branch.id)?;
        staging.set_origin(CommitOrigin::WriteThrough);
        staging.stage(data.clone())?;
        staging.commit(Some(result.timestamp), &request.user_id, &request.comment)?
    };

    repo.store().force_commit_time(result.timestamp)?;
    repo.role().advance_replicated_commit_time(result.timestamp);
    link.set_last_update_time(result.timestamp);

    finish_client_commit(repo, &request, &commit, &dirty, &data)?;
    debug!(branch = %branch.id, timestamp = %commit.timestamp, "write-through commit");
    Ok(CommittedChange {
        commit,
        branch,
        id_mappings: result.id_mappings,
        kind: ContextKind::WriteThrough,
    })
}

fn commit_branching(repo: &Repository, ctx: BranchingCommit) -> Result<CommittedChange> {
    let BranchingCommit {
        request,
        parent,
        base_time,
    } = ctx;
    let base = BranchPoint::new(parent.id, base_time);
    validate(repo, base, &request.data)?;

    let store = repo.store();
    let name = format!("{}/Offline-{}", parent.name, Timestamp::now());
    let branch = store.create_local_branch(&name, base)?;
    let (commit, id_mappings, data) = match commit_on_new_branch(store, &branch, &request) {
        Ok(committed) => committed,
        Err(e) => {
            if let Err(cleanup) = store.remove_local_branch(branch.id) {
                warn!(branch = %branch.id, error = %cleanup, "cannot drop unused offline branch");
            }
            return Err(e);
        }
    };

    repo.notifier().publish_branch(branch.clone());
    info!(branch = %branch.id, name = %branch.name, base = %base_time, "created offline branch");
    repo.notifier().publish_commit(
        &commit,
        data.changed_sets(),
        data.new_package_units.clone(),
        Some(request.owner.session),
    );
    Ok(CommittedChange {
        commit,
        branch,
        id_mappings,
        kind: ContextKind::Branching,
    })
}

fn commit_on_new_branch(
    store: &dyn RevisionStore,
    branch: &Branch,
    request: &CommitRequest,
) -> Result<(Commit, HashMap<ObjectId, ObjectId>, CommitData)> {
    let mut staging = store.prepare_commit(branch.id)?;
    staging.set_origin(CommitOrigin::Branching);
    let id_mappings = staging.stage(request.data.clone())?;
    let data = staging.data().clone();
    let commit = staging.commit(Some(branch.created), &request.user_id, &request.comment)?;
    Ok((commit, id_mappings, data))
}

async fn apply_replicated(
    repo: &Repository,
    ctx: ReplicatorApplyCommit,
) -> Result<Option<CommittedChange>> {
    let ReplicatorApplyCommit {
        info,
        transaction_id,
    } = ctx;
    let store = repo.store();

    let branch = match store.branch(info.branch)? {
        Some(b) if b.is_local() => return Ok(None),
        Some(b) => b,
        None if info.branch.is_local() => return Ok(None),
        None => {
            return Err(ReplError::Apply {
                msg: format!("branch {} not replicated yet", info.branch),
            })
        }
    };
    if store.has_commit(branch.id, info.timestamp)? {
        debug!(timestamp = %info.timestamp, "replicated commit already present");
        repo.role().advance_replicated_commit_time(info.timestamp);
        return Ok(None);
    }

    store.register_packages(&info.data.new_package_units)?;
    let dirty = info.data.dirty_ids();
    let commit = {
        let _gate = repo.commit_gate().write().await;
        let mut staging = store.prepare_commit(branch.id)?;
        staging.set_origin(CommitOrigin::Replicator);
        staging.stage(info.data.clone())?;
        staging.commit(Some(info.timestamp), &info.user_id, &info.comment)?
    };

    store.force_commit_time(info.timestamp)?;
    repo.role().advance_replicated_commit_time(info.timestamp);
    repo.cache().remove_objects(&dirty);
    repo.notifier().publish_commit(
        &commit,
        info.data.changed_sets(),
        info.data.new_package_units.clone(),
        None,
    );
    debug!(
        transaction = transaction_id,
        branch = %branch.id,
        timestamp = %info.timestamp,
        "replicated commit applied"
    );
    Ok(Some(CommittedChange {
        commit,
        branch,
        id_mappings: HashMap::new(),
        kind: ContextKind::ReplicatorApply,
    }))
}
