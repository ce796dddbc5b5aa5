//! In-process [`PrimaryClient`] backed by a primary [`Repository`].
//!
//! Used by the `ts-repl` binary to run a replica next to its primary in one
//! process, and by tests to drive replication end to end. Commit, lock and
//! branch notifications of the primary are forwarded to every open session
//! as [`RemoteEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commit::CommitRequest;
use crate::error::{ReplError, Result};
use crate::lock_delegate::{LockOutcome, LockRequest, UnlockRequest};
use crate::notify::Notification;
use crate::primary::{
    ChangeReplication, CommitDelegationResult, CommitDescriptor, LockDelegation,
    LockDelegationResult, PrimaryClient, RawRange, RawReplication, RemoteEvent,
    RemoteRepositoryInfo, RemoteSession, RevisionCacheKind, SessionLink, SessionOptions,
    UnlockDelegation,
};
use crate::repository::Repository;
use crate::types::{BranchId, LockOwner, SessionId, Timestamp};

type Sessions = DashMap<SessionId, mpsc::UnboundedSender<RemoteEvent>>;

/// A primary reachable through direct calls.
pub struct LoopbackPrimary {
    primary: Arc<Repository>,
    sessions: Arc<Sessions>,
    next_session: AtomicU64,
    reachable: AtomicBool,
    revision_cache: Mutex<RevisionCacheKind>,
    rollback_next: Mutex<Option<String>>,
    forwarder: JoinHandle<()>,
}

impl LoopbackPrimary {
    /// Wraps `primary` and starts forwarding its notifications.
    pub fn new(primary: Arc<Repository>) -> Arc<Self> {
        let sessions: Arc<Sessions> = Arc::new(DashMap::new());
        let forwarder = tokio::spawn(forward(
            primary.clone(),
            primary.subscribe(),
            sessions.clone(),
        ));
        Arc::new(Self {
            primary,
            sessions,
            next_session: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            revision_cache: Mutex::new(RevisionCacheKind::Noop),
            rollback_next: Mutex::new(None),
            forwarder,
        })
    }

    /// The wrapped primary.
    pub fn repository(&self) -> &Arc<Repository> {
        &self.primary
    }

    /// Makes new calls fail with a network error, or succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Revision cache kind reported to new sessions.
    pub fn set_revision_cache(&self, kind: RevisionCacheKind) {
        *self.revision_cache.lock().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    /// Rolls back the next delegated commit with `message`.
    pub fn rollback_next_commit(&self, message: impl Into<String>) {
        *self.rollback_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Deactivates every open session.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some((_, tx)) = self.sessions.remove(id) {
                if tx.send(RemoteEvent::SessionDeactivated).is_err() {
                    debug!(session = %id, "session already gone before deactivation");
                }
            }
        }
        info!(sessions = ids.len(), "all sessions deactivated");
        ids.len()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReplError::network("primary unreachable"))
        }
    }

    fn ensure_session(&self, session: SessionId) -> Result<()> {
        self.ensure_reachable()?;
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(ReplError::network(format!("session {} is closed", session)))
        }
    }

    fn area_owner(session: SessionId, area_id: &str) -> LockOwner {
        LockOwner::new(session, 0).with_durable_locking(area_id)
    }
}

impl Drop for LoopbackPrimary {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn send_all(sessions: &Sessions, event: impl Fn(SessionId) -> RemoteEvent) {
    let mut closed = Vec::new();
    for entry in sessions.iter() {
        if entry.value().send(event(*entry.key())).is_err() {
            closed.push(*entry.key());
        }
    }
    for id in closed {
        debug!(session = %id, "dropping closed session");
        sessions.remove(&id);
    }
}

async fn forward(
    primary: Arc<Repository>,
    mut notifications: broadcast::Receiver<Notification>,
    sessions: Arc<Sessions>,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "forwarder lagged behind primary notifications");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match notification {
            Notification::Commit(n) if !n.branch.is_local() => {
                let infos = match primary
                    .store()
                    .commit_infos(n.timestamp.previous(), n.timestamp)
                {
                    Ok(infos) => infos,
                    Err(e) => {
                        warn!(error = %e, timestamp = %n.timestamp, "cannot load commit for forwarding");
                        continue;
                    }
                };
                for info in infos.into_iter().filter(|i| i.branch == n.branch) {
                    send_all(&sessions, |sid| RemoteEvent::CommitInvalidation {
                        info: info.clone(),
                        remote: n.origin_session != Some(sid),
                    });
                }
            }
            Notification::Locks(info) if !info.branch.is_local() => {
                send_all(&sessions, |_| RemoteEvent::LocksChanged(info.clone()));
            }
            Notification::BranchCreated(branch) if !branch.is_local() => {
                send_all(&sessions, |_| RemoteEvent::BranchCreated(branch.clone()));
            }
            _ => {}
        }
    }
    debug!("notification forwarder stopped");
}

#[async_trait]
impl PrimaryClient for LoopbackPrimary {
    async fn open_session(&self, options: SessionOptions) -> Result<RemoteSession> {
        self.ensure_reachable()?;
        let store = self.primary.store();
        let info = RemoteRepositoryInfo {
            repository_id: self.primary.id().to_string(),
            root_resource_id: self.primary.role().root_resource_id().unwrap_or_default(),
            revision_cache: *self.revision_cache.lock().unwrap_or_else(|e| e.into_inner()),
            last_branch_id: store.last_branch_id()?,
            last_commit_time: store.last_commit_time()?,
        };
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::unbounded_channel();
        self.sessions.insert(id, tx);
        debug!(session = %id, "session opened");
        Ok(RemoteSession {
            link: Arc::new(SessionLink::new(id, options, Timestamp::UNSPECIFIED)),
            info,
            events,
        })
    }

    async fn replicate_raw(&self, session: SessionId, range: RawRange) -> Result<RawReplication> {
        self.ensure_session(session)?;
        self.primary
            .raw_engine()
            .export(self.primary.store(), range)
    }

    async fn replicate_changes(
        &self,
        session: SessionId,
        from_branch: BranchId,
        from_time: Timestamp,
    ) -> Result<ChangeReplication> {
        self.ensure_session(session)?;
        let store = self.primary.store();
        let mut branches: Vec<_> = store
            .branches()?
            .into_iter()
            .filter(|b| !b.is_local() && b.id > from_branch)
            .collect();
        branches.sort_by_key(|b| b.id);
        let to_time = store.last_non_local_commit_time()?;
        let commits = if to_time > from_time {
            store.commit_infos(from_time, to_time)?
        } else {
            Vec::new()
        };
        Ok(ChangeReplication {
            branches,
            commits,
            lock_areas: store.lock_areas()?,
        })
    }

    async fn commit_delegation(&self, commit: CommitDescriptor) -> Result<CommitDelegationResult> {
        self.ensure_session(commit.session)?;
        let rollback = self
            .rollback_next
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(msg) = rollback {
            return Ok(CommitDelegationResult {
                rollback_message: Some(msg),
                ..Default::default()
            });
        }

        let mut owner = LockOwner::new(commit.session, commit.view_id);
        if let Some(area) = commit.lock_area {
            owner = owner.with_durable_locking(area);
        }
        let mut request = CommitRequest::new(
            commit.branch,
            owner,
            commit.user_id,
            commit.comment,
            commit.data,
        );
        request.release_locks = commit.auto_release_locks;
        request.locks_on_new_objects = commit.locks_on_new_objects;

        match self.primary.commit(request).await {
            Ok(change) => Ok(CommitDelegationResult {
                timestamp: change.commit.timestamp,
                id_mappings: change.id_mappings,
                rollback_message: None,
            }),
            Err(ReplError::Transaction { msg }) => Ok(CommitDelegationResult {
                rollback_message: Some(msg),
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    async fn delegate_lock_objects(
        &self,
        session: SessionId,
        request: LockDelegation,
    ) -> Result<LockDelegationResult> {
        self.ensure_session(session)?;
        let outcome = self
            .primary
            .lock(LockRequest {
                owner: Self::area_owner(session, &request.area_id),
                branch: request.branch,
                lock_type: request.lock_type,
                targets: request.targets,
                recursive: request.recursive,
                timeout: Duration::from_millis(request.timeout_ms),
            })
            .await;
        match outcome {
            Ok(LockOutcome::Granted(grant)) => Ok(LockDelegationResult {
                successful: true,
                wait_for_update: true,
                required_timestamp: grant.timestamp,
            }),
            Ok(LockOutcome::Refused) | Err(ReplError::LockTimeout { .. }) => {
                Ok(LockDelegationResult::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn delegate_unlock_objects(
        &self,
        session: SessionId,
        request: UnlockDelegation,
    ) -> Result<()> {
        self.ensure_session(session)?;
        self.primary
            .unlock(UnlockRequest {
                owner: Self::area_owner(session, &request.area_id),
                branch: request.branch,
                lock_type: request.lock_type,
                targets: request.targets,
                recursive: request.recursive,
            })
            .await?;
        Ok(())
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        if self.sessions.remove(&session).is_some() {
            debug!(session = %session, "session closed");
        }
        Ok(())
    }
}
