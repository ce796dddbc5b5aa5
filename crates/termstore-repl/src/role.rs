//! Repository role and lifecycle state.
//!
//! The role (primary, backup or clone) decides which commit strategy a write
//! takes; the lifecycle state tracks how far a replica has caught up with its
//! primary. Replication counters only ever move forward.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ReplError, Result};
use crate::types::{Branch, BranchId, Timestamp};

/// Role of a repository instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryType {
    /// The sole write-authoritative instance.
    Primary,
    /// Hot standby that can take over as primary.
    Backup,
    /// Read-mostly replica that may host local-only branches.
    Clone,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepositoryType::Primary => "PRIMARY",
            RepositoryType::Backup => "BACKUP",
            RepositoryType::Clone => "CLONE",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a repository instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    /// Never connected; no root resource known yet.
    Initial,
    /// Not connected to the primary.
    Offline,
    /// Bulk replication in progress.
    Syncing,
    /// Caught up and receiving live updates.
    Online,
}

impl RepositoryState {
    /// Whether a replication session is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, RepositoryState::Syncing | RepositoryState::Online)
    }
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepositoryState::Initial => "INITIAL",
            RepositoryState::Offline => "OFFLINE",
            RepositoryState::Syncing => "SYNCING",
            RepositoryState::Online => "ONLINE",
        };
        f.write_str(s)
    }
}

/// Write path chosen for a client commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Apply directly with local timestamp and locking.
    Local,
    /// Delegate to the primary, then apply with the primary's timestamp.
    WriteThrough,
    /// Redirect onto a new local branch.
    Branching,
}

struct RoleInner {
    repository_type: RepositoryType,
    state: RepositoryState,
    root_resource_id: Option<String>,
}

/// Role, state and replication counters of one repository.
pub struct RoleStateMachine {
    inner: Mutex<RoleInner>,
    state_tx: watch::Sender<RepositoryState>,
    allow_backup_writes: bool,
    last_replicated_branch_id: AtomicI32,
    last_replicated_commit_time: AtomicU64,
    last_transaction_id: AtomicU64,
}

fn is_legal_transition(
    repository_type: RepositoryType,
    from: RepositoryState,
    to: RepositoryState,
) -> bool {
    use RepositoryState::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Initial, Offline) | (Offline, Syncing) | (Syncing, Online) => true,
        (Syncing, Offline) | (Syncing, Initial) | (Online, Offline) => true,
        (Initial, Online) => repository_type == RepositoryType::Primary,
        _ => false,
    }
}

impl RoleStateMachine {
    /// Creates a state machine in `Initial`.
    pub fn new(repository_type: RepositoryType, allow_backup_writes: bool) -> Self {
        let (state_tx, _) = watch::channel(RepositoryState::Initial);
        Self {
            inner: Mutex::new(RoleInner {
                repository_type,
                state: RepositoryState::Initial,
                root_resource_id: None,
            }),
            state_tx,
            allow_backup_writes,
            last_replicated_branch_id: AtomicI32::new(BranchId::MAIN.as_i32()),
            last_replicated_commit_time: AtomicU64::new(0),
            last_transaction_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoleInner> {
        // The guarded data stays consistent across a panicking holder.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current role.
    pub fn repository_type(&self) -> RepositoryType {
        self.lock().repository_type
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RepositoryState {
        self.lock().state
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<RepositoryState> {
        self.state_tx.subscribe()
    }

    /// Moves to `to`, rejecting transitions outside the lifecycle graph.
    /// Returns the previous state.
    pub fn set_state(&self, to: RepositoryState) -> Result<RepositoryState> {
        let mut inner = self.lock();
        let from = inner.state;
        if !is_legal_transition(inner.repository_type, from, to) {
            return Err(ReplError::illegal(format!(
                "{} repository cannot change state from {} to {}",
                inner.repository_type, from, to
            )));
        }
        if from != to {
            inner.state = to;
            self.state_tx.send_replace(to);
            info!(from = %from, to = %to, "repository state changed");
        }
        Ok(from)
    }

    /// State to fall back to when the link to the primary is lost.
    pub fn disconnected_state(&self) -> RepositoryState {
        if self.lock().root_resource_id.is_some() {
            RepositoryState::Offline
        } else {
            RepositoryState::Initial
        }
    }

    /// Root resource id captured at first connect.
    pub fn root_resource_id(&self) -> Option<String> {
        self.lock().root_resource_id.clone()
    }

    /// Captures the root resource id and moves to `Offline`. Only takes
    /// effect while `Initial`; returns whether it did.
    pub fn set_root_resource_id(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.state != RepositoryState::Initial {
            return Ok(false);
        }
        inner.root_resource_id = Some(id.to_string());
        inner.state = RepositoryState::Offline;
        self.state_tx.send_replace(RepositoryState::Offline);
        info!(root = %id, "root resource captured");
        Ok(true)
    }

    /// Initializes the root resource of a primary and puts it online.
    pub fn init_primary_root(&self, id: &str) {
        let mut inner = self.lock();
        if inner.root_resource_id.is_none() {
            inner.root_resource_id = Some(id.to_string());
        }
        inner.state = RepositoryState::Online;
        self.state_tx.send_replace(RepositoryState::Online);
    }

    /// Swaps roles between backup and primary. Returns the previous role.
    ///
    /// A backup becoming primary goes online; a primary becoming backup drops
    /// to offline and has to synchronize. Clones never change role.
    pub fn change_type(&self, to: RepositoryType) -> Result<RepositoryType> {
        let mut inner = self.lock();
        let from = inner.repository_type;
        let state = match (from, to) {
            (a, b) if a == b => return Ok(from),
            (RepositoryType::Backup, RepositoryType::Primary) => RepositoryState::Online,
            (RepositoryType::Primary, RepositoryType::Backup) => {
                if inner.root_resource_id.is_some() {
                    RepositoryState::Offline
                } else {
                    RepositoryState::Initial
                }
            }
            _ => {
                return Err(ReplError::illegal(format!(
                    "cannot change repository type from {} to {}",
                    from, to
                )))
            }
        };
        inner.repository_type = to;
        inner.state = state;
        self.state_tx.send_replace(state);
        info!(from = %from, to = %to, state = %state, "repository type changed");
        Ok(from)
    }

    /// Chooses the write path for a client commit on `branch`.
    pub fn select_strategy(&self, branch: &Branch) -> Result<CommitStrategy> {
        let inner = self.lock();
        if inner.repository_type == RepositoryType::Primary || branch.is_local() {
            return Ok(CommitStrategy::Local);
        }
        let online = inner.state == RepositoryState::Online;
        match inner.repository_type {
            RepositoryType::Clone if !online => Ok(CommitStrategy::Branching),
            RepositoryType::Clone => Ok(CommitStrategy::WriteThrough),
            RepositoryType::Backup if !online => Err(ReplError::locked(format!(
                "backup repository is not connected to primary (state {})",
                inner.state
            ))),
            RepositoryType::Backup if !self.allow_backup_writes => Err(ReplError::illegal(
                "backup repository does not accept writes",
            )),
            _ => Ok(CommitStrategy::WriteThrough),
        }
    }

    /// Whether a commit on `branch` would be accepted right now.
    pub fn can_accept_writes(&self, branch: &Branch) -> bool {
        self.select_strategy(branch).is_ok()
    }

    /// Last branch id materialized from the primary.
    pub fn last_replicated_branch_id(&self) -> BranchId {
        BranchId::new(self.last_replicated_branch_id.load(Ordering::SeqCst))
    }

    /// Advances the replicated branch id; never moves it backwards.
    pub fn advance_replicated_branch_id(&self, id: BranchId) -> BranchId {
        let previous = self
            .last_replicated_branch_id
            .fetch_max(id.as_i32(), Ordering::SeqCst);
        if id.as_i32() > previous {
            debug!(branch = %id, "last replicated branch advanced");
        }
        BranchId::new(previous.max(id.as_i32()))
    }

    /// Time of the last commit replicated from the primary.
    pub fn last_replicated_commit_time(&self) -> Timestamp {
        Timestamp::new(self.last_replicated_commit_time.load(Ordering::SeqCst))
    }

    /// Advances the replicated commit time; never moves it backwards.
    pub fn advance_replicated_commit_time(&self, ts: Timestamp) -> Timestamp {
        let previous = self
            .last_replicated_commit_time
            .fetch_max(ts.as_u64(), Ordering::SeqCst);
        Timestamp::new(previous.max(ts.as_u64()))
    }

    /// Overwrites both counters. Only used while activating.
    pub(crate) fn restore_counters(&self, branch: BranchId, commit_time: Timestamp) {
        self.last_replicated_branch_id
            .store(branch.as_i32(), Ordering::SeqCst);
        self.last_replicated_commit_time
            .store(commit_time.as_u64(), Ordering::SeqCst);
    }

    /// Allocates the id of the next replay transaction.
    pub fn next_transaction_id(&self) -> u64 {
        self.last_transaction_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Id of the last replay transaction.
    pub fn last_transaction_id(&self) -> u64 {
        self.last_transaction_id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BranchPoint;

    fn main_branch() -> Branch {
        Branch::main()
    }

    fn local_branch() -> Branch {
        Branch {
            id: BranchId::new(-1),
            name: "MAIN/local-task".to_string(),
            base: BranchPoint::new(BranchId::MAIN, Timestamp::new(10)),
            created: Timestamp::new(11),
            local: true,
        }
    }

    fn online(machine: &RoleStateMachine) {
        machine.set_root_resource_id("root").unwrap();
        machine.set_state(RepositoryState::Syncing).unwrap();
        machine.set_state(RepositoryState::Online).unwrap();
    }

    mod transitions {
        use super::*;

        #[test]
        fn test_full_cycle() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            assert_eq!(machine.state(), RepositoryState::Initial);
            online(&machine);
            assert_eq!(machine.state(), RepositoryState::Online);
            machine.set_state(RepositoryState::Offline).unwrap();
            machine.set_state(RepositoryState::Syncing).unwrap();
            machine.set_state(RepositoryState::Online).unwrap();
        }

        #[test]
        fn test_illegal_transitions() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            assert!(machine.set_state(RepositoryState::Online).is_err());
            assert!(machine.set_state(RepositoryState::Syncing).is_err());
            online(&machine);
            assert!(machine.set_state(RepositoryState::Syncing).is_err());
            assert!(machine.set_state(RepositoryState::Initial).is_err());
        }

        #[test]
        fn test_primary_goes_online_from_initial() {
            let machine = RoleStateMachine::new(RepositoryType::Primary, false);
            machine.init_primary_root("root");
            assert_eq!(machine.state(), RepositoryState::Online);
            assert_eq!(machine.root_resource_id().as_deref(), Some("root"));
        }

        #[test]
        fn test_root_resource_only_while_initial() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            assert!(machine.set_root_resource_id("first").unwrap());
            assert!(!machine.set_root_resource_id("second").unwrap());
            assert_eq!(machine.root_resource_id().as_deref(), Some("first"));
            assert_eq!(machine.state(), RepositoryState::Offline);
        }

        #[test]
        fn test_disconnected_state() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            assert_eq!(machine.disconnected_state(), RepositoryState::Initial);
            machine.set_root_resource_id("root").unwrap();
            assert_eq!(machine.disconnected_state(), RepositoryState::Offline);
        }

        #[tokio::test]
        async fn test_state_watch_sees_changes() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            let mut rx = machine.subscribe_state();
            machine.set_root_resource_id("root").unwrap();
            rx.changed().await.unwrap();
            assert_eq!(*rx.borrow(), RepositoryState::Offline);
        }
    }

    mod failover {
        use super::*;

        #[test]
        fn test_backup_to_primary_goes_online() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            machine.set_root_resource_id("root").unwrap();
            assert_eq!(
                machine.change_type(RepositoryType::Primary).unwrap(),
                RepositoryType::Backup
            );
            assert_eq!(machine.state(), RepositoryState::Online);
        }

        #[test]
        fn test_primary_to_backup_goes_offline() {
            let machine = RoleStateMachine::new(RepositoryType::Primary, false);
            machine.init_primary_root("root");
            machine.change_type(RepositoryType::Backup).unwrap();
            assert_eq!(machine.state(), RepositoryState::Offline);
            assert_eq!(machine.repository_type(), RepositoryType::Backup);
        }

        #[test]
        fn test_clone_never_becomes_primary() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            assert!(machine.change_type(RepositoryType::Primary).is_err());
            assert_eq!(machine.repository_type(), RepositoryType::Clone);
        }
    }

    mod strategy {
        use super::*;

        #[test]
        fn test_primary_commits_locally() {
            let machine = RoleStateMachine::new(RepositoryType::Primary, false);
            assert_eq!(
                machine.select_strategy(&main_branch()).unwrap(),
                CommitStrategy::Local
            );
        }

        #[test]
        fn test_local_branch_commits_locally_when_offline() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            assert_eq!(
                machine.select_strategy(&local_branch()).unwrap(),
                CommitStrategy::Local
            );
        }

        #[test]
        fn test_offline_clone_branches() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            machine.set_root_resource_id("root").unwrap();
            machine.set_state(RepositoryState::Syncing).unwrap();
            assert_eq!(
                machine.select_strategy(&main_branch()).unwrap(),
                CommitStrategy::Branching
            );
        }

        #[test]
        fn test_online_clone_writes_through() {
            let machine = RoleStateMachine::new(RepositoryType::Clone, false);
            online(&machine);
            assert_eq!(
                machine.select_strategy(&main_branch()).unwrap(),
                CommitStrategy::WriteThrough
            );
        }

        #[test]
        fn test_offline_backup_is_locked() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, true);
            let err = machine.select_strategy(&main_branch()).unwrap_err();
            assert!(matches!(err, ReplError::Locked { .. }));
            assert!(!machine.can_accept_writes(&main_branch()));
        }

        #[test]
        fn test_backup_writes_need_permission() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            online(&machine);
            let err = machine.select_strategy(&main_branch()).unwrap_err();
            assert!(matches!(err, ReplError::IllegalState { .. }));

            let permissive = RoleStateMachine::new(RepositoryType::Backup, true);
            online(&permissive);
            assert_eq!(
                permissive.select_strategy(&main_branch()).unwrap(),
                CommitStrategy::WriteThrough
            );
        }
    }

    mod counters {
        use super::*;

        #[test]
        fn test_counters_never_regress() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            machine.advance_replicated_commit_time(Timestamp::new(100));
            machine.advance_replicated_commit_time(Timestamp::new(95));
            assert_eq!(machine.last_replicated_commit_time(), Timestamp::new(100));
            machine.advance_replicated_branch_id(BranchId::new(4));
            machine.advance_replicated_branch_id(BranchId::new(2));
            assert_eq!(machine.last_replicated_branch_id(), BranchId::new(4));
        }

        #[test]
        fn test_transaction_ids_increase() {
            let machine = RoleStateMachine::new(RepositoryType::Backup, false);
            assert_eq!(machine.next_transaction_id(), 1);
            assert_eq!(machine.next_transaction_id(), 2);
            assert_eq!(machine.last_transaction_id(), 2);
        }
    }
}
