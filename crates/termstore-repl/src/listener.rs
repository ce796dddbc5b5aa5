//! Translates events pushed by the primary into queued work.
//!
//! The listener never touches the store; it only enqueues, so everything
//! that changes the replica still runs on the synchronizer task in priority
//! order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::primary::RemoteEvent;
use crate::queue::{WorkItem, WorkQueue};

/// Listener of one replication session.
pub struct RemoteLinkListener {
    queue: Arc<WorkQueue>,
}

impl RemoteLinkListener {
    /// Listener feeding `queue`.
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// Handles one event. Returns false once the session is gone.
    pub fn on_event(&self, event: RemoteEvent) -> bool {
        match event {
            RemoteEvent::BranchCreated(branch) => {
                trace!(branch = %branch.id, "branch event");
                self.queue.push(WorkItem::BranchCreate(branch));
            }
            RemoteEvent::CommitInvalidation { info, remote } => {
                if remote {
                    trace!(timestamp = %info.timestamp, branch = %info.branch, "commit event");
                    self.queue
                        .push(WorkItem::CommitApply { info, attempt: 0 });
                } else {
                    // Our own write-through commit; it was applied on the way out.
                    trace!(timestamp = %info.timestamp, "own commit event ignored");
                }
            }
            RemoteEvent::LocksChanged(info) => {
                trace!(owner = %info.owner.key(), "lock event");
                self.queue.push(WorkItem::LockApply { info, attempt: 0 });
            }
            RemoteEvent::SessionDeactivated => {
                self.disconnected();
                return false;
            }
        }
        true
    }

    fn disconnected(&self) {
        let dropped = self.queue.reset_with(WorkItem::Connect { reconnect: true });
        info!(dropped, "session to primary lost, reconnecting");
    }

    /// Runs the listener until the session ends or `cancel` fires.
    pub fn spawn(
        self,
        mut events: mpsc::UnboundedReceiver<RemoteEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(event) => {
                        if !self.on_event(event) {
                            break;
                        }
                    }
                    None => {
                        self.disconnected();
                        break;
                    }
                }
            }
            debug!("link listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Branch, BranchId, BranchPoint, CommitData, CommitInfo, LockChangeInfo, LockOperation,
        LockOwner, LockType, SessionId, Timestamp,
    };

    fn info(ts: u64) -> CommitInfo {
        CommitInfo {
            branch: BranchId::MAIN,
            timestamp: Timestamp::new(ts),
            previous_timestamp: Timestamp::UNSPECIFIED,
            user_id: "u".to_string(),
            comment: String::new(),
            data: CommitData::default(),
        }
    }

    #[test]
    fn test_remote_commit_enqueued() {
        let queue = Arc::new(WorkQueue::new());
        let listener = RemoteLinkListener::new(queue.clone());
        assert!(listener.on_event(RemoteEvent::CommitInvalidation {
            info: info(7),
            remote: true,
        }));
        assert_eq!(queue.try_pop().map(|i| i.kind()), Some("commit"));
    }

    #[test]
    fn test_own_commit_ignored() {
        let queue = Arc::new(WorkQueue::new());
        let listener = RemoteLinkListener::new(queue.clone());
        listener.on_event(RemoteEvent::CommitInvalidation {
            info: info(7),
            remote: false,
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_branch_and_lock_events_enqueued() {
        let queue = Arc::new(WorkQueue::new());
        let listener = RemoteLinkListener::new(queue.clone());
        listener.on_event(RemoteEvent::LocksChanged(LockChangeInfo {
            owner: LockOwner::new(SessionId::new(1), 1),
            branch: BranchId::MAIN,
            lock_type: LockType::Read,
            operation: LockOperation::Lock,
            lock_states: vec![],
            timestamp: Timestamp::new(3),
        }));
        listener.on_event(RemoteEvent::BranchCreated(Branch {
            id: BranchId::new(1),
            name: "MAIN/b".to_string(),
            base: BranchPoint::new(BranchId::MAIN, Timestamp::new(1)),
            created: Timestamp::new(2),
            local: false,
        }));
        assert_eq!(queue.try_pop().map(|i| i.kind()), Some("branch"));
        assert_eq!(queue.try_pop().map(|i| i.kind()), Some("locks"));
    }

    #[test]
    fn test_deactivation_resets_queue() {
        let queue = Arc::new(WorkQueue::new());
        let listener = RemoteLinkListener::new(queue.clone());
        listener.on_event(RemoteEvent::CommitInvalidation {
            info: info(7),
            remote: true,
        });
        assert!(!listener.on_event(RemoteEvent::SessionDeactivated));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(WorkItem::Connect { reconnect: true }));
    }

    #[tokio::test]
    async fn test_closed_stream_reconnects() {
        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RemoteLinkListener::new(queue.clone()).spawn(rx, CancellationToken::new());
        drop(tx);
        handle.await.unwrap();
        assert_eq!(queue.try_pop(), Some(WorkItem::Connect { reconnect: true }));
    }

    #[tokio::test]
    async fn test_cancel_stops_quietly() {
        let queue = Arc::new(WorkQueue::new());
        let (_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = RemoteLinkListener::new(queue.clone()).spawn(rx, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert!(queue.is_empty());
    }
}
