//! The synchronizer: one task draining the work queue of a replica.
//!
//! Work is handled strictly one item at a time. A failed connect or
//! replicate waits out the retry interval and starts over from a clean queue;
//! a failed commit or lock replay is retried later through the
//! [`RetryScheduler`], up to `max_recommits` times. Retries carry the queue
//! epoch they were scheduled in, so a reconnect discards them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{ReplError, Result};
use crate::listener::RemoteLinkListener;
use crate::primary::{
    PrimaryClient, RawRange, RemoteSession, RevisionCacheKind, SessionLink, SessionOptions,
};
use crate::queue::{WorkItem, WorkQueue};
use crate::repository::Repository;
use crate::role::RepositoryState;
use crate::types::{Branch, CommitInfo, LockChangeInfo};

/// Longest uninterrupted sleep; cancellation is checked in between.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Counters of the synchronizer, kept across restarts.
pub struct RunnerStats {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    replications: AtomicU64,
    replication_failures: AtomicU64,
    branches_applied: AtomicU64,
    commits_applied: AtomicU64,
    commit_retries: AtomicU64,
    commits_dropped: AtomicU64,
    locks_applied: AtomicU64,
    lock_retries: AtomicU64,
    locks_dropped: AtomicU64,
    disconnects: AtomicU64,
}

impl RunnerStats {
    /// All counters at zero.
    pub fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            replications: AtomicU64::new(0),
            replication_failures: AtomicU64::new(0),
            branches_applied: AtomicU64::new(0),
            commits_applied: AtomicU64::new(0),
            commit_retries: AtomicU64::new(0),
            commits_dropped: AtomicU64::new(0),
            locks_applied: AtomicU64::new(0),
            lock_retries: AtomicU64::new(0),
            locks_dropped: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> RunnerStatsSnapshot {
        RunnerStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            replications: self.replications.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
            branches_applied: self.branches_applied.load(Ordering::Relaxed),
            commits_applied: self.commits_applied.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
            commits_dropped: self.commits_dropped.load(Ordering::Relaxed),
            locks_applied: self.locks_applied.load(Ordering::Relaxed),
            lock_retries: self.lock_retries.load(Ordering::Relaxed),
            locks_dropped: self.locks_dropped.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunnerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronizer counters at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatsSnapshot {
    /// Sessions opened.
    pub connects: u64,
    /// Failed session attempts.
    pub connect_failures: u64,
    /// Successful catch-ups.
    pub replications: u64,
    /// Failed catch-ups.
    pub replication_failures: u64,
    /// Remote branches materialized.
    pub branches_applied: u64,
    /// Remote commits replayed.
    pub commits_applied: u64,
    /// Commit replays scheduled for retry.
    pub commit_retries: u64,
    /// Commit replays given up on.
    pub commits_dropped: u64,
    /// Remote lock changes replayed.
    pub locks_applied: u64,
    /// Lock replays scheduled for retry.
    pub lock_retries: u64,
    /// Lock replays given up on.
    pub locks_dropped: u64,
    /// Sessions lost or reset.
    pub disconnects: u64,
}

/// Posts work back into the queue after a delay.
///
/// Shares the synchronizer's cancellation, so pending retries die with it.
#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
}

impl RetryScheduler {
    /// Scheduler feeding `queue` until `cancel` fires.
    pub fn new(queue: Arc<WorkQueue>, cancel: CancellationToken) -> Self {
        Self { queue, cancel }
    }

    /// Enqueues `item` after `delay` unless the queue was cleared meanwhile.
    pub fn schedule(&self, item: WorkItem, delay: Duration) -> JoinHandle<bool> {
        let epoch = self.queue.epoch();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => {
                    let posted = queue.push_if_epoch(item, epoch);
                    if !posted {
                        debug!("retry discarded, queue was reset");
                    }
                    posted
                }
            }
        })
    }
}

/// Handle of a running synchronizer.
pub struct SynchronizerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SynchronizerHandle {
    /// Whether the task has ended, on its own or after [`stop`](Self::stop).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the synchronizer and waits for it to close its session.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "synchronizer task ended abnormally");
        }
    }
}

struct ActiveSession {
    link: Arc<SessionLink>,
    listener_cancel: CancellationToken,
    listener: JoinHandle<()>,
}

/// Keeps a replica in step with its primary.
pub struct Synchronizer {
    repo: Arc<Repository>,
    primary: Arc<dyn PrimaryClient>,
    queue: Arc<WorkQueue>,
    stats: Arc<RunnerStats>,
    config: SyncConfig,
    cancel: CancellationToken,
    retries: RetryScheduler,
    session: Option<ActiveSession>,
    connect_failures: u32,
}

impl Synchronizer {
    /// Resets the queue to a single connect and spawns the runner task.
    pub fn start(repo: Arc<Repository>, primary: Arc<dyn PrimaryClient>) -> SynchronizerHandle {
        let cancel = CancellationToken::new();
        let queue = repo.queue().clone();
        queue.reset_with(WorkItem::Connect { reconnect: false });

        let runner = Synchronizer {
            config: repo.config().sync.clone(),
            stats: repo.runner_stats().clone(),
            retries: RetryScheduler::new(queue.clone(), cancel.clone()),
            queue,
            primary,
            repo,
            cancel: cancel.clone(),
            session: None,
            connect_failures: 0,
        };
        let task = tokio::spawn(runner.run());
        SynchronizerHandle { cancel, task }
    }

    async fn run(mut self) {
        info!(repository = %self.repo.id(), "synchronizer started");
        let cancel = self.cancel.clone();
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.queue.pop() => item,
            };
            debug!(kind = item.kind(), pending = self.queue.len(), "work item");

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ReplError::Shutdown),
                result = self.handle(item) => result,
            };
            match result {
                Ok(()) => {}
                Err(ReplError::Shutdown) => break,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "synchronizer stopped on fatal error");
                    self.repo.record_fatal(&e);
                    break;
                }
                Err(e) => warn!(error = %e, "work item failed"),
            }
        }
        self.close_session().await;
        info!(repository = %self.repo.id(), "synchronizer stopped");
    }

    async fn handle(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Connect { reconnect } => self.connect(reconnect).await,
            WorkItem::Replicate => self.replicate().await,
            WorkItem::BranchCreate(branch) => self.apply_branch(&branch),
            WorkItem::CommitApply { info, attempt } => {
                self.apply_commit(info, attempt).await;
                Ok(())
            }
            WorkItem::LockApply { info, attempt } => {
                self.apply_locks(info, attempt);
                Ok(())
            }
        }
    }

    /// Sleeps `delay` in short slices, failing with `Shutdown` once cancelled.
    async fn pause(&self, delay: Duration) -> Result<()> {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.cancel.is_cancelled() {
                return Err(ReplError::Shutdown);
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        if self.cancel.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        Ok(())
    }

    async fn connect(&mut self, reconnect: bool) -> Result<()> {
        if reconnect {
            RunnerStats::bump(&self.stats.disconnects);
            self.close_session().await;
            let role = self.repo.role();
            role.set_state(role.disconnected_state())?;
        }
        if self.session.is_some() {
            debug!("already connected to primary");
            return Ok(());
        }

        match self.open_session().await {
            Ok(()) => {
                self.connect_failures = 0;
                self.queue.push(WorkItem::Replicate);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.connect_failures = self.connect_failures.saturating_add(1);
                RunnerStats::bump(&self.stats.connect_failures);
                let delay = self.config.retry_delay(self.connect_failures);
                warn!(
                    error = %e,
                    failures = self.connect_failures,
                    retry_ms = delay.as_millis() as u64,
                    "cannot connect to primary"
                );
                self.pause(delay).await?;
                self.queue.reset_with(WorkItem::Connect { reconnect: false });
                Ok(())
            }
        }
    }

    async fn open_session(&mut self) -> Result<()> {
        let RemoteSession { link, info, events } = self
            .primary
            .open_session(SessionOptions::replication())
            .await?;

        let misfit = if info.revision_cache != RevisionCacheKind::Noop {
            Some(format!(
                "replication sessions need a Noop revision cache, primary uses {:?}",
                info.revision_cache
            ))
        } else if info.repository_id != self.repo.id() {
            Some(format!(
                "primary repository is {}, expected {}",
                info.repository_id,
                self.repo.id()
            ))
        } else {
            None
        };
        if let Some(msg) = misfit {
            if let Err(e) = self.primary.close_session(link.id()).await {
                debug!(error = %e, "closing rejected session failed");
            }
            return Err(ReplError::config(msg));
        }

        self.repo.capture_root_resource(&info.root_resource_id)?;
        self.repo.set_session_link(Some(link.clone()));
        let listener_cancel = self.cancel.child_token();
        let listener =
            RemoteLinkListener::new(self.queue.clone()).spawn(events, listener_cancel.clone());
        self.session = Some(ActiveSession {
            link: link.clone(),
            listener_cancel,
            listener,
        });
        RunnerStats::bump(&self.stats.connects);
        info!(
            session = %link.id(),
            primary = %info.repository_id,
            primary_branch = %info.last_branch_id,
            primary_commit = %info.last_commit_time,
            "connected to primary"
        );
        Ok(())
    }

    async fn close_session(&mut self) {
        let Some(active) = self.session.take() else {
            return;
        };
        // Stop the listener first so the closing stream does not queue a reconnect.
        active.listener_cancel.cancel();
        if let Err(e) = active.listener.await {
            warn!(error = %e, "link listener ended abnormally");
        }
        self.repo.set_session_link(None);
        if let Err(e) = self.primary.close_session(active.link.id()).await {
            debug!(session = %active.link.id(), error = %e, "closing session failed");
        }
        debug!(session = %active.link.id(), "session closed");
    }

    async fn replicate(&mut self) -> Result<()> {
        let Some(link) = self.session.as_ref().map(|s| s.link.clone()) else {
            debug!("not connected, skipping replication");
            return Ok(());
        };
        self.repo.role().set_state(RepositoryState::Syncing)?;

        let result = if self.config.raw_replication {
            self.replicate_raw(&link).await
        } else {
            self.replicate_changes(&link).await
        };
        match result {
            Ok(()) => {
                self.repo.role().set_state(RepositoryState::Online)?;
                RunnerStats::bump(&self.stats.replications);
                info!(
                    branch = %self.repo.role().last_replicated_branch_id(),
                    commit_time = %self.repo.role().last_replicated_commit_time(),
                    "replica synchronized"
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                RunnerStats::bump(&self.stats.replication_failures);
                warn!(
                    error = %e,
                    retry_ms = self.config.retry_interval_ms,
                    "replication failed"
                );
                self.pause(self.config.retry_interval()).await?;
                self.queue.reset_with(WorkItem::Connect { reconnect: true });
                Ok(())
            }
        }
    }

    async fn replicate_raw(&self, link: &SessionLink) -> Result<()> {
        let role = self.repo.role();
        let range = RawRange {
            from_branch: role.last_replicated_branch_id(),
            to_branch: None,
            from_time: role.last_replicated_commit_time(),
            to_time: None,
        };
        let replication = self.primary.replicate_raw(link.id(), range).await?;
        self.repo
            .raw_engine()
            .import(&self.repo, &replication)
            .await?;
        link.set_last_update_time(replication.to_time);
        Ok(())
    }

    async fn replicate_changes(&self, link: &SessionLink) -> Result<()> {
        let role = self.repo.role();
        let changes = self
            .primary
            .replicate_changes(
                link.id(),
                role.last_replicated_branch_id(),
                role.last_replicated_commit_time(),
            )
            .await?;

        for branch in &changes.branches {
            self.repo.handle_branch(branch)?;
        }
        let mut last = None;
        let commits = changes.commits.len();
        for info in changes.commits {
            let timestamp = info.timestamp;
            self.repo.handle_commit_info(info).await?;
            last = Some(timestamp);
        }

        let store = self.repo.store();
        for area in store.lock_areas()? {
            store.remove_lock_area(&area.id)?;
        }
        for area in changes.lock_areas {
            store.put_lock_area(area)?;
        }
        self.repo.locks().reload(&store.lock_areas()?)?;
        self.repo.notifier().publish_locks_reloaded();

        if let Some(ts) = last {
            link.set_last_update_time(ts);
        }
        debug!(
            branches = changes.branches.len(),
            commits,
            "incremental replication applied"
        );
        Ok(())
    }

    fn apply_branch(&self, branch: &Branch) -> Result<()> {
        if self.repo.handle_branch(branch)? {
            RunnerStats::bump(&self.stats.branches_applied);
        }
        Ok(())
    }

    async fn apply_commit(&mut self, info: CommitInfo, attempt: u32) {
        let timestamp = info.timestamp;
        match self.repo.handle_commit_info(info.clone()).await {
            Ok(applied) => {
                if applied.is_some() {
                    RunnerStats::bump(&self.stats.commits_applied);
                }
                self.touch_link(timestamp);
            }
            Err(e) => {
                let failures = attempt + 1;
                if self.give_up(failures, &e, "commit") {
                    RunnerStats::bump(&self.stats.commits_dropped);
                    return;
                }
                RunnerStats::bump(&self.stats.commit_retries);
                self.retries.schedule(
                    WorkItem::CommitApply {
                        info,
                        attempt: failures,
                    },
                    self.config.recommit_interval(),
                );
            }
        }
    }

    fn apply_locks(&mut self, info: LockChangeInfo, attempt: u32) {
        match self.repo.apply_lock_change(&info) {
            Ok(()) => {
                RunnerStats::bump(&self.stats.locks_applied);
                self.touch_link(info.timestamp);
            }
            Err(e) => {
                let failures = attempt + 1;
                if self.give_up(failures, &e, "locks") {
                    RunnerStats::bump(&self.stats.locks_dropped);
                    return;
                }
                RunnerStats::bump(&self.stats.lock_retries);
                self.retries.schedule(
                    WorkItem::LockApply {
                        info,
                        attempt: failures,
                    },
                    self.config.recommit_interval(),
                );
            }
        }
    }

    /// Logs a failed replay; true once the retry budget is spent.
    fn give_up(&self, failures: u32, err: &ReplError, kind: &'static str) -> bool {
        if failures > self.config.max_recommits {
            error!(
                kind,
                attempts = failures,
                error = %err,
                "replicated change dropped after repeated failures"
            );
            return true;
        }
        warn!(
            kind,
            attempt = failures,
            error = %err,
            retry_ms = self.config.recommit_interval_ms,
            "replicated change failed, retrying"
        );
        false
    }

    fn touch_link(&self, timestamp: crate::types::Timestamp) {
        if let Some(active) = &self.session {
            active.link.set_last_update_time(timestamp);
        }
    }
}
