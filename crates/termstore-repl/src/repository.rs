//! A replicated repository instance.
//!
//! [`Repository`] owns everything one instance needs: its role state machine,
//! the revision store and cache, the lock table, the local notification
//! channel and, for backups and clones, the synchronizer that keeps it in
//! step with the primary. Nothing here is process-global; several instances
//! can live side by side, which is how the integration tests pair a primary
//! with its replicas.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::commit::{CommitContext, CommitRequest, CommittedChange};
use crate::config::ReplConfig;
use crate::error::{ReplError, Result};
use crate::health::RepositoryStatus;
use crate::lock_delegate::{LockDelegator, LockOutcome, LockRequest, UnlockRequest};
use crate::locking::LockManager;
use crate::notify::{CommitNotifier, Notification};
use crate::primary::{PrimaryClient, SessionLink};
use crate::queue::WorkQueue;
use crate::raw::{RawCodec, RawReplicationEngine};
use crate::role::{RepositoryType, RoleStateMachine};
use crate::runner::{RunnerStats, Synchronizer, SynchronizerHandle};
use crate::store::{LockArea, RevisionCache, RevisionStore};
use crate::types::{
    Branch, BranchId, BranchPoint, CommitInfo, LockChangeInfo, LockOperation, LockOwner,
    LockState, LockType, ObjectId, ObjectRevision, Timestamp,
};

const PROP_LAST_BRANCH: &str = "repl.last_replicated_branch_id";
const PROP_LAST_COMMIT: &str = "repl.last_replicated_commit_time";
const PROP_GRACEFUL: &str = "repl.graceful_shutdown";
const PROP_ROOT: &str = "repl.root_resource_id";

const NOTIFICATION_CAPACITY: usize = 1024;

/// Locks granted to a view, with the time of the grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockGrant {
    /// Resulting state per target.
    pub states: Vec<LockState>,
    /// Time of the lock change, as published to lock listeners.
    pub timestamp: Timestamp,
}

/// One repository instance.
pub struct Repository {
    me: Weak<Repository>,
    config: ReplConfig,
    role: RoleStateMachine,
    store: Arc<dyn RevisionStore>,
    cache: RevisionCache,
    locks: LockManager,
    notifier: CommitNotifier,
    commit_gate: tokio::sync::RwLock<()>,
    raw: RawReplicationEngine,
    primary: Option<Arc<dyn PrimaryClient>>,
    link: RwLock<Option<Arc<SessionLink>>>,
    queue: Arc<WorkQueue>,
    runner_stats: Arc<RunnerStats>,
    synchronizer: tokio::sync::Mutex<Option<SynchronizerHandle>>,
    fatal_error: Mutex<Option<String>>,
    active: AtomicBool,
}

impl Repository {
    /// Creates an inactive repository over `store`.
    ///
    /// Backups and clones need a `primary` to replicate from.
    pub fn new(
        config: ReplConfig,
        store: Arc<dyn RevisionStore>,
        primary: Option<Arc<dyn PrimaryClient>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let repository_type = config.repository.repository_type;
        if repository_type != RepositoryType::Primary && primary.is_none() {
            return Err(ReplError::config(format!(
                "{} repository {} needs a primary to replicate from",
                repository_type, config.repository.id
            )));
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            role: RoleStateMachine::new(repository_type, config.repository.allow_backup_writes),
            notifier: CommitNotifier::new(config.repository.id.clone(), NOTIFICATION_CAPACITY),
            raw: RawReplicationEngine::new(RawCodec::new(config.raw.clone())),
            config,
            store,
            cache: RevisionCache::new(),
            locks: LockManager::new(),
            commit_gate: tokio::sync::RwLock::new(()),
            primary,
            link: RwLock::new(None),
            queue: Arc::new(WorkQueue::new()),
            runner_stats: Arc::new(RunnerStats::new()),
            synchronizer: tokio::sync::Mutex::new(None),
            fatal_error: Mutex::new(None),
            active: AtomicBool::new(false),
        }))
    }

    /// Repository name.
    pub fn id(&self) -> &str {
        &self.config.repository.id
    }

    /// Configuration the repository was created with.
    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    /// Role and lifecycle state.
    pub fn role(&self) -> &RoleStateMachine {
        &self.role
    }

    /// Backing store.
    pub fn store(&self) -> &dyn RevisionStore {
        self.store.as_ref()
    }

    /// Revision cache handed to readers.
    pub fn cache(&self) -> &RevisionCache {
        &self.cache
    }

    /// Lock table.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Local notification channel.
    pub fn notifier(&self) -> &CommitNotifier {
        &self.notifier
    }

    /// Serializes replayed commits against write-through commits.
    pub fn commit_gate(&self) -> &tokio::sync::RwLock<()> {
        &self.commit_gate
    }

    /// Raw replication engine.
    pub fn raw_engine(&self) -> &RawReplicationEngine {
        &self.raw
    }

    /// Client of the primary, on backups and clones.
    pub fn primary(&self) -> Option<Arc<dyn PrimaryClient>> {
        self.primary.clone()
    }

    /// Link of the current replication session, if one is up.
    pub fn session_link(&self) -> Option<Arc<SessionLink>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_session_link(&self, link: Option<Arc<SessionLink>>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = link;
    }

    /// Work queue of the synchronizer.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub(crate) fn runner_stats(&self) -> &Arc<RunnerStats> {
        &self.runner_stats
    }

    pub(crate) fn record_fatal(&self, err: &ReplError) {
        *self.fatal_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    /// Last fatal synchronizer error, if the synchronizer stopped on one.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether [`Repository::activate`] ran without a matching deactivate.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Starts the repository.
    ///
    /// Restores replication counters persisted by a graceful shutdown, or
    /// falls back to the store's latest branch and commit when the previous
    /// run did not shut down cleanly. Reloads durable locks. A primary goes
    /// online at once; a replica starts synchronizing.
    pub async fn activate(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let store = self.store();

        if store.is_first_start()? {
            store.mark_started()?;
        } else {
            self.restore_counters()?;
        }
        store.remove_properties(&[PROP_GRACEFUL])?;

        let areas = store.lock_areas()?;
        self.locks.reload(&areas)?;

        match self.role.repository_type() {
            RepositoryType::Primary => {
                let root = self.primary_root()?;
                self.role.init_primary_root(&root);
            }
            _ => {
                if let Some(root) = store.property(PROP_ROOT)? {
                    self.role.set_root_resource_id(&root)?;
                }
                self.start_synchronizer().await?;
            }
        }
        info!(
            repository = %self.id(),
            repository_type = %self.role.repository_type(),
            state = %self.role.state(),
            "repository activated"
        );
        Ok(())
    }

    /// Stops synchronizing and persists the replication counters together
    /// with the graceful-shutdown marker.
    pub async fn deactivate(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_synchronizer().await;
        self.store.set_properties(&[
            (
                PROP_LAST_BRANCH,
                self.role.last_replicated_branch_id().as_i32().to_string(),
            ),
            (
                PROP_LAST_COMMIT,
                self.role.last_replicated_commit_time().as_u64().to_string(),
            ),
            (PROP_GRACEFUL, "true".to_string()),
        ])?;
        info!(repository = %self.id(), "repository deactivated");
        Ok(())
    }

    fn restore_counters(&self) -> Result<()> {
        let store = self.store();
        if store.property(PROP_GRACEFUL)?.is_none() {
            let branch = store.last_branch_id()?;
            let time = store.last_non_local_commit_time()?;
            warn!(
                branch = %branch,
                commit_time = %time,
                "previous run did not shut down gracefully, resetting replication counters"
            );
            self.role.restore_counters(branch, time);
            return Ok(());
        }

        let branch = match store.property(PROP_LAST_BRANCH)? {
            Some(v) => BranchId::new(v.parse().map_err(|e| {
                ReplError::store(format!("bad {} property {:?}: {}", PROP_LAST_BRANCH, v, e))
            })?),
            None => BranchId::MAIN,
        };
        let time = match store.property(PROP_LAST_COMMIT)? {
            Some(v) => Timestamp::new(v.parse().map_err(|e| {
                ReplError::store(format!("bad {} property {:?}: {}", PROP_LAST_COMMIT, v, e))
            })?),
            None => Timestamp::UNSPECIFIED,
        };
        debug!(branch = %branch, commit_time = %time, "replication counters restored");
        self.role.restore_counters(branch, time);
        Ok(())
    }

    fn primary_root(&self) -> Result<String> {
        if let Some(root) = self.role.root_resource_id() {
            return Ok(root);
        }
        if let Some(root) = self.store.property(PROP_ROOT)? {
            return Ok(root);
        }
        let root = uuid::Uuid::new_v4().to_string();
        self.store.set_properties(&[(PROP_ROOT, root.clone())])?;
        Ok(root)
    }

    /// Records the primary's root resource id on the first connect.
    pub(crate) fn capture_root_resource(&self, root: &str) -> Result<()> {
        if self.role.set_root_resource_id(root)? {
            self.store.set_properties(&[(PROP_ROOT, root.to_string())])?;
        }
        Ok(())
    }

    async fn start_synchronizer(&self) -> Result<()> {
        if self.role.repository_type() == RepositoryType::Primary {
            return Ok(());
        }
        let primary = self
            .primary
            .clone()
            .ok_or_else(|| ReplError::config("no primary configured"))?;
        let repo = self.me.upgrade().ok_or(ReplError::Shutdown)?;

        let mut slot = self.synchronizer.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        *self.fatal_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *slot = Some(Synchronizer::start(repo, primary));
        Ok(())
    }

    async fn stop_synchronizer(&self) {
        let handle = self.synchronizer.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.queue.clear();
    }

    /// Whether the synchronizer task is running.
    pub async fn is_synchronizing(&self) -> bool {
        self.synchronizer
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Starts synchronizing with the primary. No-op on a primary.
    pub async fn go_online(&self) -> Result<()> {
        self.start_synchronizer().await
    }

    /// Stops synchronizing and drops to the disconnected state.
    pub async fn go_offline(&self) -> Result<()> {
        if self.role.repository_type() == RepositoryType::Primary {
            return Err(ReplError::illegal("a primary repository cannot go offline"));
        }
        self.stop_synchronizer().await;
        self.role.set_state(self.role.disconnected_state())?;
        Ok(())
    }

    /// Fails over between backup and primary. Returns the previous role.
    pub async fn change_type(&self, to: RepositoryType) -> Result<RepositoryType> {
        let from = self.role.repository_type();
        if from == to {
            return Ok(from);
        }
        if to == RepositoryType::Primary {
            if from != RepositoryType::Backup {
                return Err(ReplError::illegal(format!(
                    "cannot change repository type from {} to {}",
                    from, to
                )));
            }
            self.stop_synchronizer().await;
            self.set_session_link(None);
            self.role.change_type(to)?;
            let root = self.primary_root()?;
            self.role.init_primary_root(&root);
        } else {
            if self.primary.is_none() {
                return Err(ReplError::config(format!(
                    "{} repository needs a primary to replicate from",
                    to
                )));
            }
            self.role.change_type(to)?;
            self.start_synchronizer().await?;
        }
        Ok(from)
    }

    /// Commits a client change set along the strategy picked by the role.
    pub async fn commit(&self, request: CommitRequest) -> Result<CommittedChange> {
        CommitContext::for_request(self, request)?
            .execute(self)
            .await?
            .ok_or_else(|| ReplError::illegal("client commit was skipped"))
    }

    /// Replays a commit received from the primary. `None` if it was skipped.
    pub async fn handle_commit_info(&self, info: CommitInfo) -> Result<Option<CommittedChange>> {
        CommitContext::replicated(self, info).execute(self).await
    }

    /// Materializes a branch created on the primary. Returns whether it was new.
    pub fn handle_branch(&self, branch: &Branch) -> Result<bool> {
        if branch.is_local() || branch.id.is_local() {
            return Ok(false);
        }
        let existed = self.store.branch(branch.id)?.is_some();
        if !existed {
            self.store
                .create_branch(branch.id, &branch.name, branch.base, branch.created)?;
        }
        self.role.advance_replicated_branch_id(branch.id);
        if !existed {
            debug!(branch = %branch.id, name = %branch.name, "replicated branch created");
            self.notifier.publish_branch(branch.clone());
        }
        Ok(!existed)
    }

    /// Replays a lock change received from the primary.
    pub fn apply_lock_change(&self, info: &LockChangeInfo) -> Result<()> {
        if info.branch.is_local() {
            return Ok(());
        }
        let targets = info.targets();
        match info.operation {
            LockOperation::Lock => {
                if self
                    .locks
                    .try_lock(&info.owner, info.branch, info.lock_type, &targets)?
                    .is_none()
                {
                    return Err(ReplError::Apply {
                        msg: format!(
                            "{:?} locks of {} conflict with local locks",
                            info.lock_type,
                            info.owner.key()
                        ),
                    });
                }
            }
            LockOperation::Unlock => {
                self.locks
                    .unlock(&info.owner, info.branch, Some(info.lock_type), Some(&targets))?;
            }
        }
        self.persist_area(&info.owner, info.branch)?;
        self.notifier.publish_locks(info.clone());
        Ok(())
    }

    fn persist_area(&self, owner: &LockOwner, branch: BranchId) -> Result<()> {
        let Some(area_id) = &owner.durable_locking_id else {
            return Ok(());
        };
        let locks: Vec<(ObjectId, LockType)> = self
            .locks
            .locks_of(&owner.key())?
            .into_iter()
            .filter(|(b, _, _)| *b == branch)
            .map(|(_, id, lock_type)| (id, lock_type))
            .collect();
        if locks.is_empty() {
            self.store.remove_lock_area(area_id)
        } else {
            self.store.put_lock_area(LockArea {
                id: area_id.clone(),
                user_id: owner.session.to_string(),
                branch,
                locks,
            })
        }
    }

    /// Locks `targets` in the local lock table and publishes the change.
    pub async fn lock_locally(
        &self,
        owner: &LockOwner,
        branch: BranchId,
        lock_type: LockType,
        targets: &[ObjectId],
        timeout: Duration,
    ) -> Result<LockGrant> {
        let states = self
            .locks
            .lock(owner, branch, lock_type, targets, timeout)
            .await?;
        let timestamp = self.store.create_commit_timestamp()?;
        self.persist_area(owner, branch)?;
        self.notifier.publish_locks(LockChangeInfo {
            owner: owner.clone(),
            branch,
            lock_type,
            operation: LockOperation::Lock,
            lock_states: states.clone(),
            timestamp,
        });
        Ok(LockGrant { states, timestamp })
    }

    /// Releases locks of `owner` in the local lock table and publishes the change.
    pub fn unlock_locally(
        &self,
        owner: &LockOwner,
        branch: BranchId,
        lock_type: Option<LockType>,
        targets: Option<&[ObjectId]>,
    ) -> Result<Vec<LockState>> {
        let states = self.locks.unlock(owner, branch, lock_type, targets)?;
        if states.is_empty() {
            return Ok(states);
        }
        self.persist_area(owner, branch)?;
        self.notifier.publish_locks(LockChangeInfo {
            owner: owner.clone(),
            branch,
            lock_type: lock_type.unwrap_or(LockType::Write),
            operation: LockOperation::Unlock,
            lock_states: states.clone(),
            timestamp: self.store.create_commit_timestamp()?,
        });
        Ok(states)
    }

    /// Locks objects for a client view, through the primary when required.
    pub async fn lock(&self, request: LockRequest) -> Result<LockOutcome> {
        LockDelegator::new(self).lock(request).await
    }

    /// Unlocks objects of a client view, through the primary when required.
    pub async fn unlock(&self, request: UnlockRequest) -> Result<Vec<LockState>> {
        LockDelegator::new(self).unlock(request).await
    }

    /// Head revision of `id` on `branch`, served from the cache when possible.
    pub fn read_revision(&self, id: ObjectId, branch: BranchId) -> Result<Option<ObjectRevision>> {
        if let Some(rev) = self.cache.get(id, branch) {
            return Ok(Some(rev));
        }
        let rev = self
            .store
            .revision(id, BranchPoint::new(branch, Timestamp::MAX))?;
        if let Some(rev) = &rev {
            self.cache.put(branch, rev.clone());
        }
        Ok(rev)
    }

    /// Creates a branch. Only a primary hands out shared branch ids.
    pub fn create_branch(&self, name: &str, base: BranchPoint) -> Result<Branch> {
        if self.role.repository_type() != RepositoryType::Primary {
            return Err(ReplError::illegal(format!(
                "{} repository cannot create shared branches",
                self.role.repository_type()
            )));
        }
        let id = BranchId::new(self.store.last_branch_id()?.as_i32() + 1);
        let created = self.store.create_commit_timestamp()?;
        let branch = self.store.create_branch(id, name, base, created)?;
        info!(branch = %branch.id, name = %branch.name, "branch created");
        self.notifier.publish_branch(branch.clone());
        Ok(branch)
    }

    /// Creates a branch that is never replicated.
    pub fn create_local_branch(&self, name: &str, base: BranchPoint) -> Result<Branch> {
        let branch = self.store.create_local_branch(name, base)?;
        self.notifier.publish_branch(branch.clone());
        Ok(branch)
    }

    /// Subscribes to local notifications.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Snapshot of role, counters and synchronizer health.
    pub fn status(&self) -> Result<RepositoryStatus> {
        let link = self.session_link();
        Ok(RepositoryStatus::new(
            self.id(),
            &self.role,
            self.store.last_commit_time()?,
            self.queue.len(),
            link.as_deref(),
            self.runner_stats.snapshot(),
            self.fatal_error(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::role::RepositoryState;
    use crate::store::MemoryStore;
    use crate::types::{CommitData, ObjectRevision, SessionId};

    fn primary_config() -> ReplConfig {
        ReplConfig {
            repository: RepositoryConfig {
                id: "repo1".to_string(),
                repository_type: RepositoryType::Primary,
                allow_backup_writes: false,
            },
            ..Default::default()
        }
    }

    async fn primary_on(store: Arc<MemoryStore>) -> Arc<Repository> {
        let repo = Repository::new(primary_config(), store, None).unwrap();
        repo.activate().await.unwrap();
        repo
    }

    fn owner(session: u64) -> LockOwner {
        LockOwner::new(SessionId::new(session), 1)
    }

    fn new_concept(data: &mut CommitData, id: u64) {
        data.new_objects.push(ObjectRevision::new(
            ObjectId::temporary(id),
            "Concept",
            b"payload".to_vec(),
        ));
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_replica_without_primary_rejected() {
            let mut config = primary_config();
            config.repository.repository_type = RepositoryType::Backup;
            let err = Repository::new(config, Arc::new(MemoryStore::new()), None)
                .err()
                .unwrap();
            assert!(matches!(err, ReplError::Config { .. }));
        }

        #[tokio::test]
        async fn test_primary_goes_online_with_root() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            assert_eq!(repo.role().state(), RepositoryState::Online);
            assert!(repo.role().root_resource_id().is_some());
            assert!(repo.store().property(PROP_ROOT).unwrap().is_some());
        }

        #[tokio::test]
        async fn test_primary_cannot_go_offline() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            assert!(matches!(
                repo.go_offline().await,
                Err(ReplError::IllegalState { .. })
            ));
        }

        #[tokio::test]
        async fn test_graceful_shutdown_restores_counters() {
            let store = Arc::new(MemoryStore::new());
            let repo = primary_on(store.clone()).await;
            repo.role()
                .advance_replicated_commit_time(Timestamp::new(4242));
            repo.role().advance_replicated_branch_id(BranchId::new(3));
            repo.deactivate().await.unwrap();
            assert_eq!(
                store.property(PROP_GRACEFUL).unwrap().as_deref(),
                Some("true")
            );

            let again = primary_on(store.clone()).await;
            assert_eq!(
                again.role().last_replicated_commit_time(),
                Timestamp::new(4242)
            );
            assert_eq!(again.role().last_replicated_branch_id(), BranchId::new(3));
            assert!(store.property(PROP_GRACEFUL).unwrap().is_none());
        }

        #[tokio::test]
        async fn test_crash_resets_counters_to_store() {
            let store = Arc::new(MemoryStore::new());
            let repo = primary_on(store.clone()).await;
            let mut data = CommitData::default();
            new_concept(&mut data, 1);
            repo.commit(CommitRequest::new(BranchId::MAIN, owner(1), "u", "c", data))
                .await
                .unwrap();
            let last = store.last_non_local_commit_time().unwrap();
            // No deactivate: the graceful marker is never written.
            drop(repo);

            let again = primary_on(store).await;
            assert_eq!(again.role().last_replicated_commit_time(), last);
        }
    }

    mod locks {
        use super::*;
        use crate::types::LockState;

        fn change(op: LockOperation, owner: LockOwner, ids: &[u64]) -> LockChangeInfo {
            LockChangeInfo {
                owner,
                branch: BranchId::MAIN,
                lock_type: LockType::Write,
                operation: op,
                lock_states: ids
                    .iter()
                    .map(|id| LockState {
                        target: ObjectId::new(*id),
                        ..Default::default()
                    })
                    .collect(),
                timestamp: Timestamp::new(10),
            }
        }

        #[tokio::test]
        async fn test_durable_lock_persists_area() {
            let store = Arc::new(MemoryStore::new());
            let repo = primary_on(store.clone()).await;
            let owner = owner(1).with_durable_locking("a1");
            let grant = repo
                .lock_locally(
                    &owner,
                    BranchId::MAIN,
                    LockType::Write,
                    &[ObjectId::new(5)],
                    Duration::from_millis(10),
                )
                .await
                .unwrap();
            assert_eq!(grant.states.len(), 1);
            let areas = store.lock_areas().unwrap();
            assert_eq!(areas.len(), 1);
            assert_eq!(areas[0].locks, vec![(ObjectId::new(5), LockType::Write)]);

            repo.unlock_locally(&owner, BranchId::MAIN, None, None)
                .unwrap();
            assert!(store.lock_areas().unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_apply_lock_change_conflict_is_apply_error() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            repo.locks()
                .try_lock(&owner(9), BranchId::MAIN, LockType::Write, &[ObjectId::new(1)])
                .unwrap()
                .unwrap();
            let err = repo
                .apply_lock_change(&change(LockOperation::Lock, owner(2), &[1]))
                .unwrap_err();
            assert!(matches!(err, ReplError::Apply { .. }));
        }

        #[tokio::test]
        async fn test_apply_lock_change_publishes() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let mut rx = repo.subscribe();
            repo.apply_lock_change(&change(LockOperation::Lock, owner(2), &[1, 2]))
                .unwrap();
            assert!(matches!(rx.recv().await.unwrap(), Notification::Locks(_)));
            repo.apply_lock_change(&change(LockOperation::Unlock, owner(2), &[1, 2]))
                .unwrap();
            assert!(repo.locks().is_empty());
        }
    }

    mod branches {
        use super::*;

        #[tokio::test]
        async fn test_primary_branch_ids_increase() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let base = BranchPoint::new(BranchId::MAIN, Timestamp::new(1));
            let a = repo.create_branch("MAIN/a", base).unwrap();
            let b = repo.create_branch("MAIN/b", base).unwrap();
            assert_eq!(a.id, BranchId::new(1));
            assert_eq!(b.id, BranchId::new(2));
        }

        #[tokio::test]
        async fn test_handle_branch_is_idempotent() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let branch = Branch {
                id: BranchId::new(4),
                name: "MAIN/x".to_string(),
                base: BranchPoint::new(BranchId::MAIN, Timestamp::new(1)),
                created: Timestamp::new(2),
                local: false,
            };
            assert!(repo.handle_branch(&branch).unwrap());
            assert!(!repo.handle_branch(&branch).unwrap());
            assert_eq!(repo.role().last_replicated_branch_id(), BranchId::new(4));
        }
    }

    mod commits {
        use super::*;
        use crate::commit::ContextKind;
        use crate::types::RevisionDelta;

        #[tokio::test]
        async fn test_local_commit_maps_ids_and_notifies() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let mut rx = repo.subscribe();
            let mut data = CommitData::default();
            new_concept(&mut data, 1);
            let change = repo
                .commit(CommitRequest::new(BranchId::MAIN, owner(1), "u", "c", data))
                .await
                .unwrap();
            assert_eq!(change.kind, ContextKind::Local);
            let permanent = change.id_mappings[&ObjectId::temporary(1)];
            assert!(!permanent.is_temporary());
            assert!(repo.read_revision(permanent, BranchId::MAIN).unwrap().is_some());
            match rx.recv().await.unwrap() {
                Notification::Commit(n) => assert_eq!(n.timestamp, change.commit.timestamp),
                other => panic!("unexpected {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_local_commit_rejects_foreign_write_lock() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let mut data = CommitData::default();
            new_concept(&mut data, 1);
            let created = repo
                .commit(CommitRequest::new(BranchId::MAIN, owner(1), "u", "c", data))
                .await
                .unwrap();
            let id = created.id_mappings[&ObjectId::temporary(1)];

            repo.lock_locally(
                &owner(2),
                BranchId::MAIN,
                LockType::Write,
                &[id],
                Duration::from_millis(10),
            )
            .await
            .unwrap();

            let change = CommitData {
                changed_objects: vec![RevisionDelta {
                    id,
                    version: 1,
                    payload: b"edited".to_vec(),
                }],
                ..Default::default()
            };
            let err = repo
                .commit(CommitRequest::new(BranchId::MAIN, owner(1), "u", "edit", change))
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Transaction { .. }));
        }

        #[tokio::test]
        async fn test_commit_on_missing_object_fails() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let data = CommitData {
                detached_objects: vec![ObjectId::new(77)],
                ..Default::default()
            };
            let err = repo
                .commit(CommitRequest::new(BranchId::MAIN, owner(1), "u", "c", data))
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Transaction { .. }));
        }

        #[tokio::test]
        async fn test_release_locks_after_commit() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            repo.lock_locally(
                &owner(1),
                BranchId::MAIN,
                LockType::Write,
                &[ObjectId::new(50)],
                Duration::from_millis(10),
            )
            .await
            .unwrap();
            let mut data = CommitData::default();
            new_concept(&mut data, 1);
            repo.commit(
                CommitRequest::new(BranchId::MAIN, owner(1), "u", "c", data).release_locks(),
            )
            .await
            .unwrap();
            assert!(repo.locks().is_empty());
        }

        #[tokio::test]
        async fn test_replicated_commit_is_idempotent() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let mut data = CommitData::default();
            data.new_objects.push(ObjectRevision::new(
                ObjectId::new(900),
                "Concept",
                b"x".to_vec(),
            ));
            let info = CommitInfo {
                branch: BranchId::MAIN,
                timestamp: Timestamp::new(1_000),
                previous_timestamp: Timestamp::UNSPECIFIED,
                user_id: "remote".to_string(),
                comment: "c".to_string(),
                data,
            };
            let first = repo.handle_commit_info(info.clone()).await.unwrap();
            assert_eq!(first.unwrap().kind, ContextKind::ReplicatorApply);
            assert!(repo.handle_commit_info(info).await.unwrap().is_none());
            assert_eq!(
                repo.role().last_replicated_commit_time(),
                Timestamp::new(1_000)
            );
            assert_eq!(repo.role().last_transaction_id(), 2);
        }

        #[tokio::test]
        async fn test_replicated_commit_on_unknown_branch_fails() {
            let repo = primary_on(Arc::new(MemoryStore::new())).await;
            let info = CommitInfo {
                branch: BranchId::new(12),
                timestamp: Timestamp::new(5),
                previous_timestamp: Timestamp::UNSPECIFIED,
                user_id: "remote".to_string(),
                comment: String::new(),
                data: CommitData::default(),
            };
            assert!(matches!(
                repo.handle_commit_info(info).await,
                Err(ReplError::Apply { .. })
            ));
        }
    }
}
