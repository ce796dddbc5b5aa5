//! Priority-ordered work queue feeding the replication runner.
//!
//! Items pop in ascending `(priority, tiebreaker, insertion sequence)` order,
//! so same-priority commits come out in timestamp order and branches in id
//! order regardless of how they were enqueued.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::{Branch, CommitInfo, LockChangeInfo};

/// Priority of a work item. Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Open the session.
    Connect = 0,
    /// Bulk catch-up.
    Replicate = 1,
    /// Materialize a remote branch.
    Branch = 2,
    /// Apply a remote commit or lock change.
    Apply = 3,
}

/// A unit of runner work.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Open a session to the primary. `reconnect` resets the lifecycle state first.
    Connect {
        /// Whether this follows a lost session.
        reconnect: bool,
    },
    /// Catch up with the primary.
    Replicate,
    /// Create a branch created on the primary.
    BranchCreate(Branch),
    /// Replay a commit made on the primary.
    CommitApply {
        /// The commit.
        info: CommitInfo,
        /// Failed attempts so far.
        attempt: u32,
    },
    /// Replay a lock change made on the primary.
    LockApply {
        /// The lock change.
        info: LockChangeInfo,
        /// Failed attempts so far.
        attempt: u32,
    },
}

impl WorkItem {
    /// Fixed priority per item kind.
    pub fn priority(&self) -> Priority {
        match self {
            WorkItem::Connect { .. } => Priority::Connect,
            WorkItem::Replicate => Priority::Replicate,
            WorkItem::BranchCreate(_) => Priority::Branch,
            WorkItem::CommitApply { .. } | WorkItem::LockApply { .. } => Priority::Apply,
        }
    }

    /// Order among items of equal priority.
    pub fn tiebreaker(&self) -> i64 {
        let clamp = |v: u64| v.min(i64::MAX as u64) as i64;
        match self {
            WorkItem::BranchCreate(branch) => branch.id.as_i32() as i64,
            WorkItem::CommitApply { info, .. } => clamp(info.timestamp.as_u64()),
            WorkItem::LockApply { info, .. } => clamp(info.timestamp.as_u64()),
            _ => 0,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Connect { .. } => "connect",
            WorkItem::Replicate => "replicate",
            WorkItem::BranchCreate(_) => "branch",
            WorkItem::CommitApply { .. } => "commit",
            WorkItem::LockApply { .. } => "locks",
        }
    }
}

struct QueueEntry {
    priority: Priority,
    tiebreaker: i64,
    seq: u64,
    item: WorkItem,
}

impl QueueEntry {
    fn key(&self) -> (Priority, i64, u64) {
        (self.priority, self.tiebreaker, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap pops the greatest, we want the smallest key.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

/// Single-consumer priority queue shared by the listener, the runner and its
/// retry scheduler.
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    epoch: AtomicU64,
    available: Notify,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<QueueEntry>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, item: WorkItem) -> QueueEntry {
        QueueEntry {
            priority: item.priority(),
            tiebreaker: item.tiebreaker(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            item,
        }
    }

    /// Enqueues an item.
    pub fn push(&self, item: WorkItem) {
        let entry = self.entry(item);
        self.heap().push(entry);
        self.available.notify_one();
    }

    /// Enqueues an item only if the queue was not cleared since `epoch`.
    pub fn push_if_epoch(&self, item: WorkItem, epoch: u64) -> bool {
        let mut heap = self.heap();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        let entry = self.entry(item);
        heap.push(entry);
        drop(heap);
        self.available.notify_one();
        true
    }

    /// Dequeues the first item, if any.
    pub fn try_pop(&self) -> Option<WorkItem> {
        self.heap().pop().map(|e| e.item)
    }

    /// Waits for and dequeues the first item.
    pub async fn pop(&self) -> WorkItem {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Drops every pending item and starts a new epoch. Returns the number dropped.
    pub fn clear(&self) -> usize {
        let mut heap = self.heap();
        let dropped = heap.len();
        heap.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        dropped
    }

    /// Atomically clears the queue and enqueues `item`.
    pub fn reset_with(&self, item: WorkItem) -> usize {
        let mut heap = self.heap();
        let dropped = heap.len();
        heap.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let entry = self.entry(item);
        heap.push(entry);
        drop(heap);
        self.available.notify_one();
        dropped
    }

    /// Current epoch; bumped by every clear.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.heap().len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
