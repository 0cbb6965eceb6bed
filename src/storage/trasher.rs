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

use super::{io_err, StorageError};
use crate::bucket::{BucketId, BucketMeta};
use crate::config::TrasherConfig;
use async_trait::async_trait;
use chrono::Utc;
use crossbeam_queue::SegQueue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// The two storage operations the trasher needs.
#[async_trait]
pub trait TrashStore: Send + Sync + 'static {
    async fn get_bucket_meta(&self, id: &BucketId) -> Result<BucketMeta, StorageError>;
    async fn remove_bucket(&self, id: &BucketId) -> Result<(), StorageError>;
}

/// Unbounded FIFO of collected bucket ids shared between the collector and
/// the removal workers. Dequeue never blocks.
#[derive(Debug, Default)]
struct TrashQueue {
    inner: SegQueue<BucketId>,
}

impl TrashQueue {
    fn enqueue(&self, id: BucketId) {
        self.inner.push(id);
    }

    fn dequeue(&self) -> Option<BucketId> {
        self.inner.pop()
    }
}

/// Background garbage collector for expired buckets.
///
/// One collector periodically scans every shard directory and enqueues
/// buckets whose trash deadline has passed; N workers drain the queue and
/// remove them. Workers may race on the same id, which is safe because
/// removal is idempotent. `stop` signals every loop and waits for it to
/// exit, so no background activity survives shutdown.
pub struct Trasher {
    cfg: TrasherConfig,
    queue: Arc<TrashQueue>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Trasher {
    pub fn new(cfg: TrasherConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cfg,
            queue: Arc::new(TrashQueue::default()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self, store: Arc<dyn TrashStore>, storage_dir: PathBuf) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(collector_loop(
            store.clone(),
            storage_dir,
            self.queue.clone(),
            Duration::from_secs(self.cfg.collector_iterations_delay),
            self.shutdown_tx.subscribe(),
        )));

        for _ in 0..self.cfg.workers {
            tasks.push(tokio::spawn(worker_loop(
                store.clone(),
                self.queue.clone(),
                Duration::from_secs(self.cfg.worker_iterations_delay),
                self.shutdown_tx.subscribe(),
            )));
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

async fn collector_loop(
    store: Arc<dyn TrashStore>,
    storage_dir: PathBuf,
    queue: Arc<TrashQueue>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = collect(store.as_ref(), &storage_dir, &queue, &shutdown).await {
            tracing::error!("trash collection failed: {e}");
        }
    }
}

async fn collect(
    store: &dyn TrashStore,
    storage_dir: &Path,
    queue: &TrashQueue,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), StorageError> {
    let mut shards = tokio::fs::read_dir(storage_dir)
        .await
        .map_err(|e| io_err("read storage directory", e))?;

    while let Some(shard) = shards
        .next_entry()
        .await
        .map_err(|e| io_err("read storage directory", e))?
    {
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Err(e) = collect_shard(store, &shard.path(), queue, shutdown).await {
            tracing::error!(shard = %shard.path().display(), "failed to scan shard: {e}");
        }
    }

    Ok(())
}

async fn collect_shard(
    store: &dyn TrashStore,
    shard_dir: &Path,
    queue: &TrashQueue,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), StorageError> {
    let mut buckets = tokio::fs::read_dir(shard_dir)
        .await
        .map_err(|e| io_err("read shard directory", e))?;

    while let Some(entry) = buckets
        .next_entry()
        .await
        .map_err(|e| io_err("read shard directory", e))?
    {
        if *shutdown.borrow() {
            return Ok(());
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!(entry = %name.to_string_lossy(), "skipping non-bucket entry");
            continue;
        };
        let id = match name.parse::<BucketId>() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(entry = name, "skipping non-bucket entry: {e}");
                continue;
            }
        };

        match store.get_bucket_meta(&id).await {
            Ok(meta) if meta.expired(Utc::now()) => queue.enqueue(id),
            Ok(_) => {}
            Err(e) => tracing::error!(bucket = %id, "failed to load bucket meta: {e}"),
        }
    }

    Ok(())
}

async fn worker_loop(
    store: Arc<dyn TrashStore>,
    queue: Arc<TrashQueue>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(id) = queue.dequeue() else { continue };
        match store.remove_bucket(&id).await {
            Ok(()) => tracing::debug!(bucket = %id, "removed expired bucket"),
            Err(e) => tracing::error!(bucket = %id, "failed to remove bucket: {e}"),
        }
    }
}
