#![warn(missing_docs)]

//! Termstore replication subsystem: primary/backup/clone roles, write-through and offline-branch commits, lock delegation, bulk and incremental catch-up

pub mod commit;
pub mod config;
pub mod error;
pub mod health;
pub mod listener;
pub mod lock_delegate;
pub mod locking;
pub mod loopback;
pub mod notify;
pub mod primary;
pub mod queue;
pub mod raw;
pub mod repository;
pub mod role;
pub mod runner;
pub mod store;
pub mod types;

pub use commit::{CommitRequest, CommittedChange, ContextKind};
pub use config::ReplConfig;
pub use error::{ReplError, Result};
pub use health::{ReplicationHealth, RepositoryStatus};
pub use lock_delegate::{LockOutcome, LockRequest, UnlockRequest};
pub use loopback::LoopbackPrimary;
pub use primary::PrimaryClient;
pub use repository::Repository;
pub use role::{RepositoryState, RepositoryType};
pub use store::{MemoryStore, RevisionStore};
