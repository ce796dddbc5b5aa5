//! Shared fixtures for the replication integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use termstore_repl::config::{RawCodecConfig, RepositoryConfig, SyncConfig};
use termstore_repl::primary::{
    ChangeReplication, CommitDelegationResult, CommitDescriptor, LockDelegation,
    LockDelegationResult, PrimaryClient, RawRange, RawReplication, RemoteEvent,
    RemoteRepositoryInfo, RemoteSession, RevisionCacheKind, SessionLink, SessionOptions,
    UnlockDelegation,
};
use termstore_repl::raw::RawCodec;
use termstore_repl::store::{
    LockArea, MemoryStore, RawDump, RawImportSummary, RevisionStore, StagedCommit,
};
use termstore_repl::types::{
    Branch, BranchId, BranchPoint, ChangedSets, Commit, CommitData, CommitInfo, ObjectId,
    ObjectRevision, PackageUnit, SessionId, Timestamp,
};
use termstore_repl::{ReplConfig, ReplError, Repository, RepositoryState, RepositoryType};

/// Configuration with short retry intervals.
pub fn fast_config(repository_type: RepositoryType) -> ReplConfig {
    ReplConfig {
        repository: RepositoryConfig {
            id: "repo1".to_string(),
            repository_type,
            allow_backup_writes: true,
        },
        sync: SyncConfig {
            retry_interval_ms: 30,
            max_recommits: 3,
            recommit_interval_ms: 10,
            ..Default::default()
        },
        raw: RawCodecConfig::default(),
        status_interval_ms: 0,
    }
}

/// Polls `cond` every 5 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until `repo` reaches `state`.
pub async fn wait_for_state(repo: &Repository, state: RepositoryState) {
    let reached = wait_until(Duration::from_secs(5), || repo.role().state() == state).await;
    assert!(
        reached,
        "repository stuck in {} waiting for {}",
        repo.role().state(),
        state
    );
}

/// A new object with a permanent id.
pub fn concept(id: u64) -> ObjectRevision {
    ObjectRevision::new(ObjectId::new(id), "Concept", format!("concept {}", id).into_bytes())
}

/// A replicated commit adding `objects` on `branch`.
pub fn commit_info(branch: BranchId, ts: u64, objects: &[u64]) -> CommitInfo {
    CommitInfo {
        branch,
        timestamp: Timestamp::new(ts),
        previous_timestamp: Timestamp::UNSPECIFIED,
        user_id: "remote".to_string(),
        comment: format!("commit at {}", ts),
        data: CommitData {
            new_objects: objects.iter().map(|id| concept(*id)).collect(),
            ..Default::default()
        },
    }
}

/// Primary double whose answers are set by the test.
pub struct ScriptedPrimary {
    rpc_calls: AtomicUsize,
    replicate_calls: AtomicUsize,
    next_session: AtomicU64,
    next_commit_ts: AtomicU64,
    reachable: AtomicBool,
    hold_replication: watch::Sender<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<RemoteEvent>>>,
    revision_cache: Mutex<RevisionCacheKind>,
    commit_result: Mutex<Option<CommitDelegationResult>>,
    lock_result: Mutex<LockDelegationResult>,
    last_commit: Mutex<Option<CommitDescriptor>>,
    last_lock: Mutex<Option<LockDelegation>>,
}

impl ScriptedPrimary {
    /// Answers every call successfully with empty content.
    pub fn new() -> Arc<Self> {
        let (hold_replication, _) = watch::channel(false);
        Arc::new(Self {
            rpc_calls: AtomicUsize::new(0),
            replicate_calls: AtomicUsize::new(0),
            next_session: AtomicU64::new(100),
            next_commit_ts: AtomicU64::new(10_000),
            reachable: AtomicBool::new(true),
            hold_replication,
            events: Mutex::new(None),
            revision_cache: Mutex::new(RevisionCacheKind::Noop),
            commit_result: Mutex::new(None),
            lock_result: Mutex::new(LockDelegationResult {
                successful: true,
                ..Default::default()
            }),
            last_commit: Mutex::new(None),
            last_lock: Mutex::new(None),
        })
    }

    /// Every RPC made so far.
    pub fn rpc_calls(&self) -> usize {
        self.rpc_calls.load(Ordering::SeqCst)
    }

    /// Raw replications started so far.
    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::SeqCst)
    }

    /// Blocks raw replication until released.
    pub fn hold_replication(&self, hold: bool) {
        self.hold_replication.send_replace(hold);
    }

    /// Fails new sessions with a network error while false.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Revision cache reported by new sessions.
    pub fn set_revision_cache(&self, kind: RevisionCacheKind) {
        *self.revision_cache.lock().unwrap() = kind;
    }

    /// Fixed answer to commit delegations; `None` allocates timestamps.
    pub fn set_commit_result(&self, result: Option<CommitDelegationResult>) {
        *self.commit_result.lock().unwrap() = result;
    }

    /// Fixed answer to lock delegations.
    pub fn set_lock_result(&self, result: LockDelegationResult) {
        *self.lock_result.lock().unwrap() = result;
    }

    /// The latest commit delegation received.
    pub fn last_commit(&self) -> Option<CommitDescriptor> {
        self.last_commit.lock().unwrap().clone()
    }

    /// The latest lock delegation received.
    pub fn last_lock(&self) -> Option<LockDelegation> {
        self.last_lock.lock().unwrap().clone()
    }

    /// Pushes an event to the latest session.
    pub fn send(&self, event: RemoteEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("no session open")
            .send(event)
            .expect("session closed");
    }

    fn call(&self) {
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PrimaryClient for ScriptedPrimary {
    async fn open_session(&self, options: SessionOptions) -> Result<RemoteSession, ReplError> {
        self.call();
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ReplError::Network {
                msg: "connection refused".to_string(),
            });
        }
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(RemoteSession {
            link: Arc::new(SessionLink::new(id, options, Timestamp::UNSPECIFIED)),
            info: RemoteRepositoryInfo {
                repository_id: "repo1".to_string(),
                root_resource_id: "root-1".to_string(),
                revision_cache: *self.revision_cache.lock().unwrap(),
                last_branch_id: BranchId::MAIN,
                last_commit_time: Timestamp::UNSPECIFIED,
            },
            events,
        })
    }

    async fn replicate_raw(
        &self,
        _session: SessionId,
        range: RawRange,
    ) -> Result<RawReplication, ReplError> {
        self.call();
        self.replicate_calls.fetch_add(1, Ordering::SeqCst);
        let mut hold = self.hold_replication.subscribe();
        hold.wait_for(|held| !*held)
            .await
            .map_err(|_| ReplError::Shutdown)?;
        let dump = RawDump {
            from_branch: range.from_branch.as_i32(),
            to_branch: range.from_branch.as_i32(),
            from_time: range.from_time.as_u64(),
            to_time: range.from_time.as_u64(),
            ..Default::default()
        };
        Ok(RawReplication {
            to_branch: range.from_branch,
            to_time: range.from_time,
            stream: RawCodec::default().encode(&dump)?,
        })
    }

    async fn replicate_changes(
        &self,
        _session: SessionId,
        _from_branch: BranchId,
        _from_time: Timestamp,
    ) -> Result<ChangeReplication, ReplError> {
        self.call();
        Ok(ChangeReplication::default())
    }

    async fn commit_delegation(
        &self,
        commit: CommitDescriptor,
    ) -> Result<CommitDelegationResult, ReplError> {
        self.call();
        *self.last_commit.lock().unwrap() = Some(commit);
        if let Some(result) = self.commit_result.lock().unwrap().clone() {
            return Ok(result);
        }
        Ok(CommitDelegationResult {
            timestamp: Timestamp::new(self.next_commit_ts.fetch_add(2, Ordering::SeqCst)),
            id_mappings: HashMap::new(),
            rollback_message: None,
        })
    }

    async fn delegate_lock_objects(
        &self,
        _session: SessionId,
        request: LockDelegation,
    ) -> Result<LockDelegationResult, ReplError> {
        self.call();
        *self.last_lock.lock().unwrap() = Some(request);
        Ok(self.lock_result.lock().unwrap().clone())
    }

    async fn delegate_unlock_objects(
        &self,
        _session: SessionId,
        _request: UnlockDelegation,
    ) -> Result<(), ReplError> {
        self.call();
        Ok(())
    }

    async fn close_session(&self, _session: SessionId) -> Result<(), ReplError> {
        self.call();
        self.events.lock().unwrap().take();
        Ok(())
    }
}

/// Store wrapper recording commit writes and flagging overlapping ones.
pub struct RecordingStore {
    inner: MemoryStore,
    apply_delay: Duration,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    allocations: AtomicUsize,
    applied: Mutex<Vec<(Timestamp, termstore_repl::store::CommitOrigin)>>,
}

impl RecordingStore {
    /// Wraps an empty store; every commit write takes at least `apply_delay`.
    pub fn new(apply_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            apply_delay,
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Commit writes that started while another was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Permanent object ids handed out.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Written commits in write order.
    pub fn applied(&self) -> Vec<(Timestamp, termstore_repl::store::CommitOrigin)> {
        self.applied.lock().unwrap().clone()
    }
}

impl RevisionStore for RecordingStore {
    fn branches(&self) -> Result<Vec<Branch>, ReplError> {
        self.inner.branches()
    }

    fn branch(&self, id: BranchId) -> Result<Option<Branch>, ReplError> {
        self.inner.branch(id)
    }

    fn create_branch(
        &self,
        id: BranchId,
        name: &str,
        base: BranchPoint,
        created: Timestamp,
    ) -> Result<Branch, ReplError> {
        self.inner.create_branch(id, name, base, created)
    }

    fn create_local_branch(&self, name: &str, base: BranchPoint) -> Result<Branch, ReplError> {
        self.inner.create_local_branch(name, base)
    }

    fn remove_local_branch(&self, id: BranchId) -> Result<bool, ReplError> {
        self.inner.remove_local_branch(id)
    }

    fn last_branch_id(&self) -> Result<BranchId, ReplError> {
        self.inner.last_branch_id()
    }

    fn last_commit_time(&self) -> Result<Timestamp, ReplError> {
        self.inner.last_commit_time()
    }

    fn last_non_local_commit_time(&self) -> Result<Timestamp, ReplError> {
        self.inner.last_non_local_commit_time()
    }

    fn create_commit_timestamp(&self) -> Result<Timestamp, ReplError> {
        self.inner.create_commit_timestamp()
    }

    fn force_commit_time(&self, ts: Timestamp) -> Result<(), ReplError> {
        self.inner.force_commit_time(ts)
    }

    fn allocate_object_id(&self) -> Result<ObjectId, ReplError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_object_id()
    }

    fn apply_commit(
        &self,
        staged: StagedCommit,
        timestamp: Option<Timestamp>,
        author: &str,
        comment: &str,
    ) -> Result<Commit, ReplError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(self.apply_delay);
        let origin = staged.origin;
        let result = self.inner.apply_commit(staged, timestamp, author, comment);
        if let Ok(commit) = &result {
            self.applied.lock().unwrap().push((commit.timestamp, origin));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn has_commit(&self, branch: BranchId, timestamp: Timestamp) -> Result<bool, ReplError> {
        self.inner.has_commit(branch, timestamp)
    }

    fn revision(
        &self,
        id: ObjectId,
        at: BranchPoint,
    ) -> Result<Option<ObjectRevision>, ReplError> {
        self.inner.revision(id, at)
    }

    fn children(&self, id: ObjectId, branch: BranchId) -> Result<Vec<ObjectId>, ReplError> {
        self.inner.children(id, branch)
    }

    fn commit_infos(&self, from: Timestamp, to: Timestamp) -> Result<Vec<CommitInfo>, ReplError> {
        self.inner.commit_infos(from, to)
    }

    fn change_set(
        &self,
        branch: BranchId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<ChangedSets, ReplError> {
        self.inner.change_set(branch, from, to)
    }

    fn raw_export(
        &self,
        from_branch: BranchId,
        to_branch: BranchId,
        from_time: Timestamp,
        to_time: Timestamp,
    ) -> Result<RawDump, ReplError> {
        self.inner.raw_export(from_branch, to_branch, from_time, to_time)
    }

    fn raw_import(&self, dump: &RawDump) -> Result<RawImportSummary, ReplError> {
        self.inner.raw_import(dump)
    }

    fn lock_areas(&self) -> Result<Vec<LockArea>, ReplError> {
        self.inner.lock_areas()
    }

    fn put_lock_area(&self, area: LockArea) -> Result<(), ReplError> {
        self.inner.put_lock_area(area)
    }

    fn remove_lock_area(&self, id: &str) -> Result<(), ReplError> {
        self.inner.remove_lock_area(id)
    }

    fn property(&self, key: &str) -> Result<Option<String>, ReplError> {
        self.inner.property(key)
    }

    fn set_properties(&self, props: &[(&str, String)]) -> Result<(), ReplError> {
        self.inner.set_properties(props)
    }

    fn remove_properties(&self, keys: &[&str]) -> Result<(), ReplError> {
        self.inner.remove_properties(keys)
    }

    fn register_packages(&self, units: &[PackageUnit]) -> Result<usize, ReplError> {
        self.inner.register_packages(units)
    }

    fn packages(&self) -> Result<Vec<PackageUnit>, ReplError> {
        self.inner.packages()
    }

    fn is_first_start(&self) -> Result<bool, ReplError> {
        self.inner.is_first_start()
    }

    fn mark_started(&self) -> Result<(), ReplError> {
        self.inner.mark_started()
    }
}
