//! Lock and unlock requests of client views.
//!
//! On a primary, or on a local-only branch, locks go straight to the local
//! lock manager. Anywhere else the primary must grant them first; the
//! request carries the view's durable locking area so the primary can
//! recognise the view after a reconnect. When the primary's own lock
//! notification has not reached this replica yet, it asks the caller to wait
//! for a given update time before the lock is applied locally.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{ReplError, Result};
use crate::primary::{LockDelegation, UnlockDelegation};
use crate::repository::{LockGrant, Repository};
use crate::role::{RepositoryState, RepositoryType};
use crate::types::{duration_millis, BranchId, LockOwner, LockState, LockType, ObjectId};

/// A lock request of one view.
#[derive(Clone, Debug)]
pub struct LockRequest {
    /// Requesting view.
    pub owner: LockOwner,
    /// Branch the view looks at.
    pub branch: BranchId,
    /// Lock kind.
    pub lock_type: LockType,
    /// Objects to lock.
    pub targets: Vec<ObjectId>,
    /// Also lock every contained object.
    pub recursive: bool,
    /// How long to wait for the locks.
    pub timeout: Duration,
}

/// An unlock request of one view.
#[derive(Clone, Debug)]
pub struct UnlockRequest {
    /// Requesting view.
    pub owner: LockOwner,
    /// Branch the view looks at.
    pub branch: BranchId,
    /// Lock kind; `None` releases every kind.
    pub lock_type: Option<LockType>,
    /// Objects to unlock; `None` releases everything the view holds.
    pub targets: Option<Vec<ObjectId>>,
    /// Also unlock every contained object.
    pub recursive: bool,
}

/// Result of a lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Locks held.
    Granted(LockGrant),
    /// The primary refused the locks.
    Refused,
}

impl LockOutcome {
    /// Whether the locks were granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted(_))
    }
}

/// Routes lock requests locally or through the primary.
pub struct LockDelegator<'a> {
    repo: &'a Repository,
}

impl<'a> LockDelegator<'a> {
    /// Delegator for `repo`.
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    fn requires_delegation(&self, branch: BranchId) -> Result<bool> {
        if self.repo.role().repository_type() == RepositoryType::Primary || branch.is_local() {
            return Ok(false);
        }
        let local = self
            .repo
            .store()
            .branch(branch)?
            .is_some_and(|b| b.is_local());
        Ok(!local)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.repo.role().state() != RepositoryState::Online {
            return Err(ReplError::locked(
                "cannot lock in a non-local branch when not connected to primary",
            ));
        }
        Ok(())
    }

    fn area_id(owner: &LockOwner) -> Result<String> {
        owner.durable_locking_id.clone().ok_or_else(|| {
            ReplError::config(format!(
                "durable locking is not enabled for view {} of session {}",
                owner.view, owner.session
            ))
        })
    }

    /// Objects contained in `targets`, transitively, plus the targets.
    fn expand(&self, branch: BranchId, targets: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let mut seen: BTreeSet<ObjectId> = targets.iter().copied().collect();
        let mut pending: VecDeque<ObjectId> = targets.iter().copied().collect();
        while let Some(id) = pending.pop_front() {
            for child in self.repo.store().children(id, branch)? {
                if seen.insert(child) {
                    pending.push_back(child);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Locks `request.targets`, delegating to the primary when needed.
    pub async fn lock(&self, request: LockRequest) -> Result<LockOutcome> {
        let local_targets = if request.recursive {
            self.expand(request.branch, &request.targets)?
        } else {
            request.targets.clone()
        };

        if self.requires_delegation(request.branch)? {
            self.ensure_connected()?;
            let area_id = Self::area_id(&request.owner)?;
            let link = self
                .repo
                .session_link()
                .ok_or_else(|| ReplError::locked("not connected to primary"))?;
            let primary = self
                .repo
                .primary()
                .ok_or_else(|| ReplError::config("no primary configured"))?;

            let result = primary
                .delegate_lock_objects(
                    link.id(),
                    LockDelegation {
                        area_id,
                        targets: request.targets.clone(),
                        branch: request.branch,
                        lock_type: request.lock_type,
                        recursive: request.recursive,
                        timeout_ms: duration_millis(request.timeout),
                    },
                )
                .await?;
            if !result.successful {
                debug!(owner = %request.owner.key(), "primary refused locks");
                return Ok(LockOutcome::Refused);
            }
            if result.wait_for_update {
                if !link.is_passive_update_enabled() {
                    error!(
                        session = %link.id(),
                        "primary requested an update wait but passive updates are disabled"
                    );
                    return Err(ReplError::ContractViolation {
                        msg: "waiting for an update requires passive updates".to_string(),
                    });
                }
                debug!(required = %result.required_timestamp, "waiting for primary update");
                link.wait_for_update(result.required_timestamp, request.timeout)
                    .await?;
            }
        }

        let grant = self
            .repo
            .lock_locally(
                &request.owner,
                request.branch,
                request.lock_type,
                &local_targets,
                request.timeout,
            )
            .await?;
        Ok(LockOutcome::Granted(grant))
    }

    /// Unlocks, delegating to the primary when needed. Never waits for updates.
    pub async fn unlock(&self, request: UnlockRequest) -> Result<Vec<LockState>> {
        let local_targets = match (&request.targets, request.recursive) {
            (Some(targets), true) => Some(self.expand(request.branch, targets)?),
            (targets, _) => targets.clone(),
        };

        if self.requires_delegation(request.branch)? {
            self.ensure_connected()?;
            let area_id = Self::area_id(&request.owner)?;
            let link = self
                .repo
                .session_link()
                .ok_or_else(|| ReplError::locked("not connected to primary"))?;
            let primary = self
                .repo
                .primary()
                .ok_or_else(|| ReplError::config("no primary configured"))?;
            primary
                .delegate_unlock_objects(
                    link.id(),
                    UnlockDelegation {
                        area_id,
                        branch: request.branch,
                        targets: request.targets.clone(),
                        lock_type: request.lock_type,
                        recursive: request.recursive,
                    },
                )
                .await?;
        }

        self.repo.unlock_locally(
            &request.owner,
            request.branch,
            request.lock_type,
            local_targets.as_deref(),
        )
    }
}
