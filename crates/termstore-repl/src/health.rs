//! Replication health and the status surface of a repository.

use serde::{Deserialize, Serialize};

use crate::primary::SessionLink;
use crate::role::{RepositoryState, RepositoryType, RoleStateMachine};
use crate::runner::RunnerStatsSnapshot;
use crate::types::{BranchId, SessionId, Timestamp};

/// How well a repository keeps up with its primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ReplicationHealth {
    /// A primary, or a replica receiving live updates.
    Healthy,
    /// Bulk replication in progress.
    CatchingUp,
    /// No session to the primary.
    Disconnected,
    /// The synchronizer stopped on an unrecoverable error.
    Failed {
        /// The error.
        reason: String,
    },
}

impl ReplicationHealth {
    /// Derives health from role, state and the synchronizer's fatal error.
    pub fn evaluate(
        repository_type: RepositoryType,
        state: RepositoryState,
        fatal_error: Option<&str>,
    ) -> Self {
        if repository_type == RepositoryType::Primary {
            return ReplicationHealth::Healthy;
        }
        if let Some(reason) = fatal_error {
            return ReplicationHealth::Failed {
                reason: reason.to_string(),
            };
        }
        match state {
            RepositoryState::Online => ReplicationHealth::Healthy,
            RepositoryState::Syncing => ReplicationHealth::CatchingUp,
            RepositoryState::Offline | RepositoryState::Initial => {
                ReplicationHealth::Disconnected
            }
        }
    }

    /// Whether client reads see current data.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ReplicationHealth::Healthy)
    }
}

/// Snapshot returned by `Repository::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    /// Repository name.
    pub id: String,
    /// Current role.
    pub repository_type: RepositoryType,
    /// Lifecycle state.
    pub state: RepositoryState,
    /// Last branch id materialized from the primary.
    pub last_replicated_branch_id: BranchId,
    /// Time of the last commit replicated from the primary.
    pub last_replicated_commit_time: Timestamp,
    /// Time of the latest local commit.
    pub last_commit_time: Timestamp,
    /// Last replay transaction id.
    pub last_transaction_id: u64,
    /// Queued synchronizer work.
    pub pending_work: usize,
    /// Current replication session.
    pub session: Option<SessionId>,
    /// Last update time seen on the session.
    pub last_update_time: Option<Timestamp>,
    /// Synchronizer counters.
    pub runner: RunnerStatsSnapshot,
    /// Fatal synchronizer error, if any.
    pub fatal_error: Option<String>,
    /// Derived health.
    pub health: ReplicationHealth,
}

impl RepositoryStatus {
    /// Collects a snapshot.
    pub fn new(
        id: &str,
        role: &RoleStateMachine,
        last_commit_time: Timestamp,
        pending_work: usize,
        link: Option<&SessionLink>,
        runner: RunnerStatsSnapshot,
        fatal_error: Option<String>,
    ) -> Self {
        let repository_type = role.repository_type();
        let state = role.state();
        Self {
            id: id.to_string(),
            repository_type,
            state,
            last_replicated_branch_id: role.last_replicated_branch_id(),
            last_replicated_commit_time: role.last_replicated_commit_time(),
            last_commit_time,
            last_transaction_id: role.last_transaction_id(),
            pending_work,
            session: link.map(|l| l.id()),
            last_update_time: link.map(|l| l.last_update_time()),
            runner,
            health: ReplicationHealth::evaluate(repository_type, state, fatal_error.as_deref()),
            fatal_error,
        }
    }
}
