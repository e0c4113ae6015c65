//! Lock sets declared by sync tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical lock on one of the two stores.
///
/// Declaration order is acquisition priority: local write first, `None` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncLock {
    LocalWrite,
    LocalRead,
    RemoteWrite,
    RemoteRead,
    None,
}

impl SyncLock {
    const ALL: [SyncLock; 5] = [
        SyncLock::LocalWrite,
        SyncLock::LocalRead,
        SyncLock::RemoteWrite,
        SyncLock::RemoteRead,
        SyncLock::None,
    ];

    fn bit(self) -> u8 {
        match self {
            SyncLock::LocalWrite => 0b0_0001,
            SyncLock::LocalRead => 0b0_0010,
            SyncLock::RemoteWrite => 0b0_0100,
            SyncLock::RemoteRead => 0b0_1000,
            SyncLock::None => 0b1_0000,
        }
    }
}

/// Normalized set of locks a task acquires atomically.
///
/// A write lock subsumes the read lock of the same store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockSet(u8);

impl LockSet {
    pub const NONE: LockSet = LockSet(0b1_0000);

    pub fn new(locks: &[SyncLock]) -> Self {
        let mut bits = 0u8;
        for lock in locks {
            bits |= lock.bit();
        }
        if bits & SyncLock::LocalWrite.bit() != 0 {
            bits &= !SyncLock::LocalRead.bit();
        }
        if bits & SyncLock::RemoteWrite.bit() != 0 {
            bits &= !SyncLock::RemoteRead.bit();
        }
        // `None` only survives when nothing else was requested
        if bits & !SyncLock::None.bit() != 0 {
            bits &= !SyncLock::None.bit();
        }
        if bits == 0 {
            bits = SyncLock::None.bit();
        }
        LockSet(bits)
    }

    pub fn contains(&self, lock: SyncLock) -> bool {
        self.0 & lock.bit() != 0
    }

    /// Locks in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = SyncLock> + '_ {
        SyncLock::ALL.into_iter().filter(|lock| self.contains(*lock))
    }

    fn touches_local(&self) -> bool {
        self.contains(SyncLock::LocalWrite) || self.contains(SyncLock::LocalRead)
    }

    fn touches_remote(&self) -> bool {
        self.contains(SyncLock::RemoteWrite) || self.contains(SyncLock::RemoteRead)
    }

    /// Two sets conflict when either writes a store the other touches.
    pub fn conflicts_with(&self, other: &LockSet) -> bool {
        let local = (self.contains(SyncLock::LocalWrite) && other.touches_local())
            || (other.contains(SyncLock::LocalWrite) && self.touches_local());
        let remote = (self.contains(SyncLock::RemoteWrite) && other.touches_remote())
            || (other.contains(SyncLock::RemoteWrite) && self.touches_remote());
        local || remote
    }
}

impl fmt::Debug for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl From<SyncLock> for LockSet {
    fn from(lock: SyncLock) -> Self {
        LockSet::new(&[lock])
    }
}

impl<const N: usize> From<[SyncLock; N]> for LockSet {
    fn from(locks: [SyncLock; N]) -> Self {
        LockSet::new(&locks)
    }
}

impl From<&[SyncLock]> for LockSet {
    fn from(locks: &[SyncLock]) -> Self {
        LockSet::new(locks)
    }
}

/// Locks currently held by running tasks.
#[derive(Debug, Default)]
pub(crate) struct HeldLocks {
    local_readers: usize,
    local_writer: bool,
    remote_readers: usize,
    remote_writer: bool,
}

impl HeldLocks {
    pub(crate) fn admits(&self, set: &LockSet) -> bool {
        let local_ok = if set.contains(SyncLock::LocalWrite) {
            !self.local_writer && self.local_readers == 0
        } else if set.contains(SyncLock::LocalRead) {
            !self.local_writer
        } else {
            true
        };
        let remote_ok = if set.contains(SyncLock::RemoteWrite) {
            !self.remote_writer && self.remote_readers == 0
        } else if set.contains(SyncLock::RemoteRead) {
            !self.remote_writer
        } else {
            true
        };
        local_ok && remote_ok
    }

    pub(crate) fn acquire(&mut self, set: &LockSet) {
        if set.contains(SyncLock::LocalWrite) {
            self.local_writer = true;
        } else if set.contains(SyncLock::LocalRead) {
            self.local_readers += 1;
        }
        if set.contains(SyncLock::RemoteWrite) {
            self.remote_writer = true;
        } else if set.contains(SyncLock::RemoteRead) {
            self.remote_readers += 1;
        }
    }

    pub(crate) fn release(&mut self, set: &LockSet) {
        if set.contains(SyncLock::LocalWrite) {
            self.local_writer = false;
        } else if set.contains(SyncLock::LocalRead) {
            self.local_readers = self.local_readers.saturating_sub(1);
        }
        if set.contains(SyncLock::RemoteWrite) {
            self.remote_writer = false;
        } else if set.contains(SyncLock::RemoteRead) {
            self.remote_readers = self.remote_readers.saturating_sub(1);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.local_writer
            && !self.remote_writer
            && self.local_readers == 0
            && self.remote_readers == 0
    }
}
