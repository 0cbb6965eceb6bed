//! The storage engine: sharded on-disk layout, transactional staging with
//! commit/abort, per-key locking, download orchestration and the background
//! trasher lifecycle.

pub mod trasher;

use crate::api::client::{Client, ClientError};
use crate::bucket::{BucketId, BucketMeta, ParseIdError};
use crate::config::Config;
use crate::locker::{LockKey, Locker, ReadGuard, WriteGuard};
use crate::tarstream::TarStreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use trasher::{TrashStore, Trasher};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    InvalidId(#[from] ParseIdError),
    #[error("invalid file path: {0}")]
    InvalidPath(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(BucketId),
    #[error("file not found: {file} in bucket {bucket}")]
    FileNotFound { bucket: BucketId, file: String },
    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(BucketId),
    #[error("file already exists: {file} in bucket {bucket}")]
    FileAlreadyExists { bucket: BucketId, file: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error(transparent)]
    Tar(#[from] TarStreamError),
    #[error("decode bucket meta: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Io(String),
}

fn io_err(context: &str, e: std::io::Error) -> StorageError {
    StorageError::Io(format!("{context}: {e}"))
}

impl From<ClientError> for StorageError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Tar(e) => StorageError::Tar(e),
            other => StorageError::Download(other.to_string()),
        }
    }
}

/// Sharded bucket store rooted at `<root_dir>`.
///
/// Buckets live at `<root>/storage/<shard>/<id>/` where `<shard>` is the
/// first two hex characters of the id; reservations are staged under
/// `<root>/tmp/` and published with an atomic rename. A trasher scans the
/// shard directories and removes buckets past their trash deadline.
pub struct Storage {
    core: Arc<StorageCore>,
    trasher: Trasher,
}

impl Storage {
    /// Wipes `tmp/`, creates `storage/` with all 256 shard directories and
    /// starts the trasher.
    pub async fn new(cfg: &Config) -> Result<Self, StorageError> {
        if cfg.trasher.workers == 0 {
            return Err(StorageError::Config(
                "trasher.workers must be at least 1".into(),
            ));
        }

        let root = PathBuf::from(&cfg.root_dir);

        let tmp_dir = root.join("tmp");
        match fs::remove_dir_all(&tmp_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("wipe tmp directory", e)),
        }
        fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| io_err("create tmp directory", e))?;

        let storage_dir = root.join("storage");
        fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| io_err("create storage directory", e))?;
        for byte in 0..=u8::MAX {
            fs::create_dir_all(storage_dir.join(hex::encode([byte])))
                .await
                .map_err(|e| io_err("create shard directory", e))?;
        }

        let core = Arc::new(StorageCore {
            storage_dir: storage_dir.clone(),
            tmp_dir,
            locker: Locker::new(),
        });

        let trasher = Trasher::new(cfg.trasher.clone());
        trasher.start(core.clone(), storage_dir).await;

        Ok(Self { core, trasher })
    }

    /// Stops the trasher and waits for its loops to exit.
    pub async fn shutdown(&self) {
        self.trasher.stop().await;
    }

    /// Read-locks `id` and returns the absolute bucket path. The bucket
    /// stays locked until the guard is dropped.
    pub async fn get_bucket(
        &self,
        id: &BucketId,
    ) -> Result<(PathBuf, BucketGuard), StorageError> {
        self.core.get_bucket(id).await
    }

    /// Read-locks the bucket and the file key, then returns the bucket path
    /// (not the file path). Both locks release when the guard is dropped.
    pub async fn get_file(
        &self,
        id: &BucketId,
        file: &str,
    ) -> Result<(PathBuf, FileGuard), StorageError> {
        self.core.get_file(id, file).await
    }

    /// Write-locks `id` and opens a staged bucket under `tmp/`. The meta
    /// sidecar is written immediately; the caller populates the staging
    /// directory and then commits or aborts.
    pub async fn reserve_bucket(
        &self,
        id: &BucketId,
        trash_time: DateTime<Utc>,
    ) -> Result<BucketReservation, StorageError> {
        self.core.reserve_bucket(id, trash_time).await
    }

    /// Opens a staged single-file write into an existing bucket. The bucket
    /// is read-locked (so it cannot be trashed mid-write) and the file key
    /// is write-locked until commit or abort.
    pub async fn reserve_file(
        &self,
        id: &BucketId,
        file: &str,
    ) -> Result<FileReservation, StorageError> {
        self.core.reserve_file(id, file).await
    }

    /// Fetches a bucket from a peer. A bucket that already exists locally
    /// is a no-op success.
    pub async fn download_bucket(
        &self,
        endpoint: &str,
        id: &BucketId,
        trash_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let reservation = match self.core.reserve_bucket(id, trash_time).await {
            Err(StorageError::BucketAlreadyExists(_)) => return Ok(()),
            other => other?,
        };

        let client = Client::new(endpoint);
        if let Err(e) = client.download_bucket(id, reservation.path()).await {
            let _ = reservation.abort().await;
            return Err(e.into());
        }

        reservation.commit().await
    }

    /// Fetches a single file of a bucket from a peer. A file that already
    /// exists locally is a no-op success.
    pub async fn download_file(
        &self,
        endpoint: &str,
        id: &BucketId,
        file: &str,
    ) -> Result<(), StorageError> {
        let reservation = match self.core.reserve_file(id, file).await {
            Err(StorageError::FileAlreadyExists { .. }) => return Ok(()),
            other => other?,
        };

        let client = Client::new(endpoint);
        if let Err(e) = client.download_file(id, file, reservation.path()).await {
            let _ = reservation.abort().await;
            return Err(e.into());
        }

        reservation.commit().await
    }

    pub async fn get_bucket_meta(&self, id: &BucketId) -> Result<BucketMeta, StorageError> {
        self.core.get_bucket_meta(id).await
    }

    /// Removes a bucket. Removing a bucket that does not exist succeeds.
    pub async fn remove_bucket(&self, id: &BucketId) -> Result<(), StorageError> {
        self.core.remove_bucket(id).await
    }

    /// Extends the bucket's trash deadline by `delta` and rewrites the meta
    /// sidecar. Returns the updated meta.
    pub async fn add_ttl(
        &self,
        id: &BucketId,
        delta: chrono::Duration,
    ) -> Result<BucketMeta, StorageError> {
        self.core.add_ttl(id, delta).await
    }
}

/// Keeps a bucket read-locked; dropping the guard releases the lock.
#[derive(Debug)]
pub struct BucketGuard {
    _lock: ReadGuard,
}

/// Keeps a bucket and one of its files read-locked; dropping releases the
/// file key first, then the bucket.
#[derive(Debug)]
pub struct FileGuard {
    _file: ReadGuard,
    _bucket: ReadGuard,
}

/// An in-flight bucket creation: a write-locked staging directory that
/// becomes visible only through [`BucketReservation::commit`]. Dropping an
/// uncommitted reservation deletes the staging directory.
#[derive(Debug)]
pub struct BucketReservation {
    stage_path: PathBuf,
    final_path: PathBuf,
    lock: Option<WriteGuard>,
}

impl BucketReservation {
    /// Absolute path of the staging directory to populate.
    pub fn path(&self) -> &Path {
        &self.stage_path
    }

    /// Atomically renames the staging directory into its shard, then
    /// releases the write lock. On error the staging directory is cleaned
    /// up and the bucket never becomes visible.
    pub async fn commit(mut self) -> Result<(), StorageError> {
        fs::rename(&self.stage_path, &self.final_path)
            .await
            .map_err(|e| io_err("commit bucket", e))?;
        self.lock.take();
        Ok(())
    }

    /// Deletes the staging directory and releases the write lock.
    pub async fn abort(mut self) -> Result<(), StorageError> {
        let res = fs::remove_dir_all(&self.stage_path).await;
        self.lock.take();
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("abort bucket reservation", e)),
        }
    }
}

impl Drop for BucketReservation {
    fn drop(&mut self) {
        // Neither commit nor abort ran to completion.
        if self.lock.is_some() {
            let _ = std::fs::remove_dir_all(&self.stage_path);
        }
    }
}

/// An in-flight single-file write into an existing bucket. The staged file
/// is materialized under a unique `tmp/` directory and renamed into the
/// bucket on commit.
#[derive(Debug)]
pub struct FileReservation {
    file: String,
    stage_dir: PathBuf,
    final_path: PathBuf,
    file_lock: Option<WriteGuard>,
    bucket_lock: Option<ReadGuard>,
}

impl FileReservation {
    /// Absolute path of the staging directory; the file is expected at
    /// `<stage>/<file>` when committing.
    pub fn path(&self) -> &Path {
        &self.stage_dir
    }

    pub async fn commit(mut self) -> Result<(), StorageError> {
        let staged = self.stage_dir.join(&self.file);
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create file parent directories", e))?;
        }
        fs::rename(&staged, &self.final_path)
            .await
            .map_err(|e| io_err("commit file", e))?;
        let _ = fs::remove_dir_all(&self.stage_dir).await;
        self.file_lock.take();
        self.bucket_lock.take();
        Ok(())
    }

    pub async fn abort(mut self) -> Result<(), StorageError> {
        let res = fs::remove_dir_all(&self.stage_dir).await;
        self.file_lock.take();
        self.bucket_lock.take();
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("abort file reservation", e)),
        }
    }
}

impl Drop for FileReservation {
    fn drop(&mut self) {
        if self.file_lock.is_some() {
            let _ = std::fs::remove_dir_all(&self.stage_dir);
        }
    }
}

pub(crate) struct StorageCore {
    storage_dir: PathBuf,
    tmp_dir: PathBuf,
    locker: Locker,
}

impl StorageCore {
    fn bucket_path(&self, id: &BucketId) -> PathBuf {
        self.storage_dir.join(id.shard()).join(id.to_string())
    }

    async fn get_bucket(&self, id: &BucketId) -> Result<(PathBuf, BucketGuard), StorageError> {
        let lock = self.locker.read(LockKey::Bucket(*id)).await;
        let path = self.bucket_path(id);
        match fs::metadata(&path).await {
            Ok(_) => Ok((path, BucketGuard { _lock: lock })),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(*id))
            }
            Err(e) => Err(io_err("stat bucket", e)),
        }
    }

    async fn get_file(
        &self,
        id: &BucketId,
        file: &str,
    ) -> Result<(PathBuf, FileGuard), StorageError> {
        validate_rel_path(file)?;

        let bucket_lock = self.locker.read(LockKey::Bucket(*id)).await;
        let bucket_path = self.bucket_path(id);
        match fs::metadata(&bucket_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(*id))
            }
            Err(e) => return Err(io_err("stat bucket", e)),
        }

        let file_lock = self
            .locker
            .read(LockKey::File(*id, file.to_string()))
            .await;
        match fs::metadata(bucket_path.join(file)).await {
            Ok(_) => Ok((
                bucket_path,
                FileGuard {
                    _file: file_lock,
                    _bucket: bucket_lock,
                },
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::FileNotFound {
                bucket: *id,
                file: file.to_string(),
            }),
            Err(e) => Err(io_err("stat file", e)),
        }
    }

    async fn reserve_bucket(
        &self,
        id: &BucketId,
        trash_time: DateTime<Utc>,
    ) -> Result<BucketReservation, StorageError> {
        let lock = self.locker.write(LockKey::Bucket(*id)).await;

        let final_path = self.bucket_path(id);
        match fs::metadata(&final_path).await {
            Ok(_) => return Err(StorageError::BucketAlreadyExists(*id)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("stat bucket", e)),
        }

        let reservation = BucketReservation {
            stage_path: self.tmp_dir.join(id.to_string()),
            final_path,
            lock: Some(lock),
        };

        if let Err(e) = stage_bucket(&reservation.stage_path, id, trash_time).await {
            let _ = reservation.abort().await;
            return Err(e);
        }

        Ok(reservation)
    }

    async fn reserve_file(
        &self,
        id: &BucketId,
        file: &str,
    ) -> Result<FileReservation, StorageError> {
        validate_rel_path(file)?;

        let bucket_lock = self.locker.read(LockKey::Bucket(*id)).await;
        let bucket_path = self.bucket_path(id);
        match fs::metadata(&bucket_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(*id))
            }
            Err(e) => return Err(io_err("stat bucket", e)),
        }

        let file_lock = self
            .locker
            .write(LockKey::File(*id, file.to_string()))
            .await;
        let final_path = bucket_path.join(file);
        match fs::metadata(&final_path).await {
            Ok(_) => {
                return Err(StorageError::FileAlreadyExists {
                    bucket: *id,
                    file: file.to_string(),
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("stat file", e)),
        }

        let reservation = FileReservation {
            file: file.to_string(),
            stage_dir: self.tmp_dir.join(format!("{id}_{}", Uuid::new_v4())),
            final_path,
            file_lock: Some(file_lock),
            bucket_lock: Some(bucket_lock),
        };

        let staged = reservation.stage_dir.join(file);
        let parent = staged.parent().unwrap_or(&reservation.stage_dir);
        if let Err(e) = fs::create_dir_all(parent).await {
            let err = io_err("create file staging directory", e);
            let _ = reservation.abort().await;
            return Err(err);
        }

        Ok(reservation)
    }

    async fn get_bucket_meta(&self, id: &BucketId) -> Result<BucketMeta, StorageError> {
        let _lock = self.locker.read(LockKey::Bucket(*id)).await;

        let path = self.bucket_path(id);
        match fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(*id))
            }
            Err(e) => return Err(io_err("stat bucket", e)),
        }

        let bytes = fs::read(path.join(id.meta_file_name()))
            .await
            .map_err(|e| io_err("read bucket meta", e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn remove_bucket(&self, id: &BucketId) -> Result<(), StorageError> {
        let _lock = self.locker.write(LockKey::Bucket(*id)).await;

        match fs::remove_dir_all(self.bucket_path(id)).await {
            Ok(()) => Ok(()),
            // Racing trash workers may have removed it already.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove bucket", e)),
        }
    }

    async fn add_ttl(
        &self,
        id: &BucketId,
        delta: chrono::Duration,
    ) -> Result<BucketMeta, StorageError> {
        let _lock = self.locker.write(LockKey::Bucket(*id)).await;

        let path = self.bucket_path(id);
        match fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(*id))
            }
            Err(e) => return Err(io_err("stat bucket", e)),
        }

        let meta_path = path.join(id.meta_file_name());
        let bytes = fs::read(&meta_path)
            .await
            .map_err(|e| io_err("read bucket meta", e))?;
        let mut meta: BucketMeta = serde_json::from_slice(&bytes)?;
        meta.trash_time = meta.trash_time + delta;

        // fs::write truncates, so a shorter payload leaves no trailing bytes.
        fs::write(&meta_path, serde_json::to_vec(&meta)?)
            .await
            .map_err(|e| io_err("write bucket meta", e))?;

        Ok(meta)
    }
}

#[async_trait]
impl TrashStore for StorageCore {
    async fn get_bucket_meta(&self, id: &BucketId) -> Result<BucketMeta, StorageError> {
        StorageCore::get_bucket_meta(self, id).await
    }

    async fn remove_bucket(&self, id: &BucketId) -> Result<(), StorageError> {
        StorageCore::remove_bucket(self, id).await
    }
}

async fn stage_bucket(
    stage: &Path,
    id: &BucketId,
    trash_time: DateTime<Utc>,
) -> Result<(), StorageError> {
    fs::create_dir_all(stage)
        .await
        .map_err(|e| io_err("create staging directory", e))?;

    let meta = BucketMeta {
        id: *id,
        trash_time,
    };
    fs::write(stage.join(id.meta_file_name()), serde_json::to_vec(&meta)?)
        .await
        .map_err(|e| io_err("write bucket meta", e))?;

    Ok(())
}

fn validate_rel_path(file: &str) -> Result<(), StorageError> {
    let relative = !file.is_empty()
        && Path::new(file)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !relative {
        return Err(StorageError::InvalidPath(format!(
            "{file:?} must be a relative path without . or .. components"
        )));
    }
    Ok(())
}
