//! Local pessimistic lock table.
//!
//! Locks are held per object and branch by a lock owner key (see
//! [`LockOwner::key`]). Durable owners survive session loss and are
//! persisted as lock areas; the table can be rebuilt from those areas after
//! a bulk replication.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ReplError, Result};
use crate::store::LockArea;
use crate::types::{duration_millis, BranchId, LockOwner, LockState, LockType, ObjectId};

#[derive(Default, Clone, Debug)]
struct TargetLocks {
    read: BTreeSet<String>,
    write: Option<String>,
    write_option: Option<String>,
}

impl TargetLocks {
    fn conflicts(&self, owner: &str, lock_type: LockType) -> bool {
        let foreign = |holder: &Option<String>| holder.as_deref().is_some_and(|h| h != owner);
        match lock_type {
            LockType::Read => foreign(&self.write),
            LockType::Write => {
                self.read.iter().any(|h| h != owner)
                    || foreign(&self.write)
                    || foreign(&self.write_option)
            }
            LockType::WriteOption => foreign(&self.write) || foreign(&self.write_option),
        }
    }

    fn grant(&mut self, owner: &str, lock_type: LockType) {
        match lock_type {
            LockType::Read => {
                self.read.insert(owner.to_string());
            }
            LockType::Write => self.write = Some(owner.to_string()),
            LockType::WriteOption => self.write_option = Some(owner.to_string()),
        }
    }

    fn release(&mut self, owner: &str, lock_type: Option<LockType>) -> bool {
        let mut released = false;
        if matches!(lock_type, None | Some(LockType::Read)) {
            released |= self.read.remove(owner);
        }
        if matches!(lock_type, None | Some(LockType::Write)) && self.write.as_deref() == Some(owner)
        {
            self.write = None;
            released = true;
        }
        if matches!(lock_type, None | Some(LockType::WriteOption))
            && self.write_option.as_deref() == Some(owner)
        {
            self.write_option = None;
            released = true;
        }
        released
    }

    fn held_by(&self, owner: &str) -> Vec<LockType> {
        let mut held = Vec::new();
        if self.read.contains(owner) {
            held.push(LockType::Read);
        }
        if self.write.as_deref() == Some(owner) {
            held.push(LockType::Write);
        }
        if self.write_option.as_deref() == Some(owner) {
            held.push(LockType::WriteOption);
        }
        held
    }

    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_none() && self.write_option.is_none()
    }

    fn state(&self, target: ObjectId) -> LockState {
        LockState {
            target,
            read_owners: self.read.iter().cloned().collect(),
            write_owner: self.write.clone(),
            write_option_owner: self.write_option.clone(),
        }
    }
}

fn poisoned<T>(e: PoisonError<T>) -> ReplError {
    ReplError::IllegalState {
        msg: format!("lock table poisoned: {}", e),
    }
}

/// Manages per-object read, write and write-option locks.
pub struct LockManager {
    locks: RwLock<HashMap<(ObjectId, BranchId), TargetLocks>>,
    released: Notify,
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Grants all of `targets` to `owner` or none of them.
    pub fn try_lock(
        &self,
        owner: &LockOwner,
        branch: BranchId,
        lock_type: LockType,
        targets: &[ObjectId],
    ) -> Result<Option<Vec<LockState>>> {
        let key = owner.key();
        let mut locks = self.locks.write().map_err(poisoned)?;
        let blocked = targets.iter().any(|id| {
            locks
                .get(&(*id, branch))
                .is_some_and(|t| t.conflicts(&key, lock_type))
        });
        if blocked {
            return Ok(None);
        }
        let states = targets
            .iter()
            .map(|id| {
                let entry = locks.entry((*id, branch)).or_default();
                entry.grant(&key, lock_type);
                entry.state(*id)
            })
            .collect();
        Ok(Some(states))
    }

    /// Waits up to `timeout` for all of `targets` to become available.
    pub async fn lock(
        &self,
        owner: &LockOwner,
        branch: BranchId,
        lock_type: LockType,
        targets: &[ObjectId],
        timeout: Duration,
    ) -> Result<Vec<LockState>> {
        // No deadline when the timeout does not fit the clock.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(states) = self.try_lock(owner, branch, lock_type, targets)? {
                debug!(owner = %owner.key(), branch = %branch, count = targets.len(), "locked");
                return Ok(states);
            }
            let timed_out = match deadline {
                Some(deadline) => {
                    Instant::now() >= deadline
                        || tokio::time::timeout_at(deadline, notified).await.is_err()
                }
                None => {
                    notified.await;
                    false
                }
            };
            if timed_out {
                return Err(ReplError::LockTimeout {
                    msg: format!("{:?} lock on {} objects", lock_type, targets.len()),
                    timeout_ms: duration_millis(timeout),
                });
            }
        }
    }

    /// Releases locks of `owner`. `None` releases every lock type, and every
    /// target on `branch` when `targets` is `None`.
    pub fn unlock(
        &self,
        owner: &LockOwner,
        branch: BranchId,
        lock_type: Option<LockType>,
        targets: Option<&[ObjectId]>,
    ) -> Result<Vec<LockState>> {
        let key = owner.key();
        let mut locks = self.locks.write().map_err(poisoned)?;
        let ids: Vec<ObjectId> = match targets {
            Some(targets) => targets.to_vec(),
            None => locks
                .iter()
                .filter(|((_, b), t)| *b == branch && !t.held_by(&key).is_empty())
                .map(|((id, _), _)| *id)
                .collect(),
        };
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = locks.get_mut(&(id, branch)) {
                if entry.release(&key, lock_type) {
                    states.push(entry.state(id));
                }
                if entry.is_empty() {
                    locks.remove(&(id, branch));
                }
            }
        }
        drop(locks);
        self.released.notify_waiters();
        Ok(states)
    }

    /// Releases every lock held under `owner_key`.
    pub fn release_all(&self, owner_key: &str) -> Result<usize> {
        let mut locks = self.locks.write().map_err(poisoned)?;
        let mut released = 0;
        for entry in locks.values_mut() {
            if entry.release(owner_key, None) {
                released += 1;
            }
        }
        locks.retain(|_, t| !t.is_empty());
        drop(locks);
        self.released.notify_waiters();
        Ok(released)
    }

    /// Current state of each target.
    pub fn lock_states(&self, branch: BranchId, targets: &[ObjectId]) -> Result<Vec<LockState>> {
        let locks = self.locks.read().map_err(poisoned)?;
        Ok(targets
            .iter()
            .map(|id| {
                locks
                    .get(&(*id, branch))
                    .map(|t| t.state(*id))
                    .unwrap_or_else(|| LockState {
                        target: *id,
                        ..Default::default()
                    })
            })
            .collect())
    }

    /// First target write-locked or write-optioned by someone else.
    pub fn foreign_write_lock(
        &self,
        owner_key: &str,
        branch: BranchId,
        targets: &[ObjectId],
    ) -> Result<Option<ObjectId>> {
        let locks = self.locks.read().map_err(poisoned)?;
        Ok(targets.iter().copied().find(|id| {
            locks.get(&(*id, branch)).is_some_and(|t| {
                let foreign = |h: &Option<String>| h.as_deref().is_some_and(|h| h != owner_key);
                foreign(&t.write) || foreign(&t.write_option)
            })
        }))
    }

    /// Locks held under `owner_key`, for persisting a durable area.
    pub fn locks_of(&self, owner_key: &str) -> Result<Vec<(BranchId, ObjectId, LockType)>> {
        let locks = self.locks.read().map_err(poisoned)?;
        let mut held: Vec<(BranchId, ObjectId, LockType)> = locks
            .iter()
            .flat_map(|((id, branch), t)| {
                t.held_by(owner_key)
                    .into_iter()
                    .map(move |lock_type| (*branch, *id, lock_type))
            })
            .collect();
        held.sort_by_key(|(branch, id, _)| (*branch, *id));
        Ok(held)
    }

    /// Replaces every durable lock with the content of `areas`.
    pub fn reload(&self, areas: &[LockArea]) -> Result<usize> {
        let mut locks = self.locks.write().map_err(poisoned)?;
        for entry in locks.values_mut() {
            entry.read.retain(|h| !h.starts_with("area:"));
            if entry.write.as_deref().is_some_and(|h| h.starts_with("area:")) {
                entry.write = None;
            }
            if entry
                .write_option
                .as_deref()
                .is_some_and(|h| h.starts_with("area:"))
            {
                entry.write_option = None;
            }
        }
        locks.retain(|_, t| !t.is_empty());

        let mut loaded = 0;
        for area in areas {
            let key = format!("area:{}", area.id);
            for (id, lock_type) in &area.locks {
                locks
                    .entry((*id, area.branch))
                    .or_default()
                    .grant(&key, *lock_type);
                loaded += 1;
            }
        }
        drop(locks);
        self.released.notify_waiters();
        debug!(areas = areas.len(), locks = loaded, "lock table reloaded");
        Ok(loaded)
    }

    /// Number of locked targets.
    pub fn len(&self) -> usize {
        self.locks.read().map(|l| l.len()).unwrap_or(0)
    }

    /// True if nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use std::sync::Arc;

    fn owner(session: u64) -> LockOwner {
        LockOwner::new(SessionId::new(session), 1)
    }

    fn ids(raw: &[u64]) -> Vec<ObjectId> {
        raw.iter().map(|i| ObjectId::new(*i)).collect()
    }

    #[test]
    fn test_read_locks_share() {
        let mgr = LockManager::new();
        let targets = ids(&[1]);
        assert!(mgr
            .try_lock(&owner(1), BranchId::MAIN, LockType::Read, &targets)
            .unwrap()
            .is_some());
        let states = mgr
            .try_lock(&owner(2), BranchId::MAIN, LockType::Read, &targets)
            .unwrap()
            .unwrap();
        assert_eq!(states[0].read_owners.len(), 2);
    }

    #[test]
    fn test_write_excludes_others() {
        let mgr = LockManager::new();
        let targets = ids(&[1, 2]);
        mgr.try_lock(&owner(1), BranchId::MAIN, LockType::Write, &targets)
            .unwrap()
            .unwrap();
        assert!(mgr
            .try_lock(&owner(2), BranchId::MAIN, LockType::Read, &ids(&[2, 3]))
            .unwrap()
            .is_none());
        assert_eq!(
            mgr.lock_states(BranchId::MAIN, &ids(&[3])).unwrap()[0],
            LockState {
                target: ObjectId::new(3),
                ..Default::default()
            }
        );
        assert!(mgr
            .try_lock(&owner(1), BranchId::MAIN, LockType::Read, &targets)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_branches_are_independent() {
        let mgr = LockManager::new();
        let targets = ids(&[1]);
        mgr.try_lock(&owner(1), BranchId::MAIN, LockType::Write, &targets)
            .unwrap()
            .unwrap();
        assert!(mgr
            .try_lock(&owner(2), BranchId::new(2), LockType::Write, &targets)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_write_option_allows_reads() {
        let mgr = LockManager::new();
        let targets = ids(&[1]);
        mgr.try_lock(&owner(1), BranchId::MAIN, LockType::WriteOption, &targets)
            .unwrap()
            .unwrap();
        assert!(mgr
            .try_lock(&owner(2), BranchId::MAIN, LockType::Read, &targets)
            .unwrap()
            .is_some());
        assert!(mgr
            .try_lock(&owner(3), BranchId::MAIN, LockType::WriteOption, &targets)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unlock_all_on_branch() {
        let mgr = LockManager::new();
        let o = owner(1);
        mgr.try_lock(&o, BranchId::MAIN, LockType::Write, &ids(&[1, 2]))
            .unwrap()
            .unwrap();
        let released = mgr.unlock(&o, BranchId::MAIN, None, None).unwrap();
        assert_eq!(released.len(), 2);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_foreign_write_lock() {
        let mgr = LockManager::new();
        let o = owner(1);
        mgr.try_lock(&o, BranchId::MAIN, LockType::Write, &ids(&[5]))
            .unwrap()
            .unwrap();
        assert_eq!(
            mgr.foreign_write_lock(&owner(2).key(), BranchId::MAIN, &ids(&[4, 5]))
                .unwrap(),
            Some(ObjectId::new(5))
        );
        assert_eq!(
            mgr.foreign_write_lock(&o.key(), BranchId::MAIN, &ids(&[5]))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_reload_replaces_durable_locks_only() {
        let mgr = LockManager::new();
        let durable = owner(1).with_durable_locking("a1");
        mgr.try_lock(&durable, BranchId::MAIN, LockType::Write, &ids(&[1]))
            .unwrap()
            .unwrap();
        mgr.try_lock(&owner(2), BranchId::MAIN, LockType::Read, &ids(&[9]))
            .unwrap()
            .unwrap();

        let loaded = mgr
            .reload(&[LockArea {
                id: "a2".to_string(),
                user_id: "u".to_string(),
                branch: BranchId::MAIN,
                locks: vec![(ObjectId::new(3), LockType::Write)],
            }])
            .unwrap();
        assert_eq!(loaded, 1);
        assert!(mgr.locks_of("area:a1").unwrap().is_empty());
        assert_eq!(
            mgr.locks_of("area:a2").unwrap(),
            vec![(BranchId::MAIN, ObjectId::new(3), LockType::Write)]
        );
        assert_eq!(mgr.locks_of(&owner(2).key()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let mgr = Arc::new(LockManager::new());
        let holder = owner(1);
        mgr.try_lock(&holder, BranchId::MAIN, LockType::Write, &ids(&[1]))
            .unwrap()
            .unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.lock(
                    &owner(2),
                    BranchId::MAIN,
                    LockType::Write,
                    &ids(&[1]),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.unlock(&holder, BranchId::MAIN, None, None).unwrap();
        let states = waiter.await.unwrap().unwrap();
        assert_eq!(states[0].write_owner, Some(owner(2).key()));
    }

    #[tokio::test]
    async fn test_unbounded_wait_ends_on_release() {
        let mgr = Arc::new(LockManager::new());
        let holder = owner(1);
        mgr.try_lock(&holder, BranchId::MAIN, LockType::Write, &ids(&[1]))
            .unwrap()
            .unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.lock(&owner(2), BranchId::MAIN, LockType::Write, &ids(&[1]), Duration::MAX)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        mgr.unlock(&holder, BranchId::MAIN, None, None).unwrap();
        let states = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(states[0].write_owner, Some(owner(2).key()));
    }

    #[tokio::test]
    async fn test_lock_times_out() {
        let mgr = LockManager::new();
        mgr.try_lock(&owner(1), BranchId::MAIN, LockType::Write, &ids(&[1]))
            .unwrap()
            .unwrap();
        let err = mgr
            .lock(
                &owner(2),
                BranchId::MAIN,
                LockType::Read,
                &ids(&[1]),
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::LockTimeout { timeout_ms: 30, .. }));
    }
}
