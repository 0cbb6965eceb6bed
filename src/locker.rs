// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use crate::bucket::BucketId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key space of the lock registry: whole buckets, or one file within a
/// bucket. The composite file key serializes writers of the same file while
/// leaving the rest of the bucket readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Bucket(BucketId),
    File(BucketId, String),
}

pub type ReadGuard = tokio::sync::OwnedRwLockReadGuard<()>;
pub type WriteGuard = tokio::sync::OwnedRwLockWriteGuard<()>;

/// Process-wide registry of per-key reader/writer locks.
///
/// A key's lock is created on first use and kept for the lifetime of the
/// registry. Acquisition awaits until the lock is free; abandoning the
/// future (e.g. under `tokio::time::timeout`) leaves the lock untouched.
/// Guards release on drop. Acquisition is FIFO-fair, so neither side
/// starves. Not reentrant: a task holding a write guard must not acquire
/// the same key again.
#[derive(Debug, Default)]
pub struct Locker {
    locks: DashMap<LockKey, Arc<RwLock<()>>>,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, key: LockKey) -> ReadGuard {
        self.lock_for(key).read_owned().await
    }

    pub async fn write(&self, key: LockKey) -> WriteGuard {
        self.lock_for(key).write_owned().await
    }

    fn lock_for(&self, key: LockKey) -> Arc<RwLock<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}
