//! Bookkeeping of uploaded and annotated files on disk.
//!
//! Uploads land in `<upload_dir>/<name>` and their annotated versions in
//! `<output_dir>/annotated_<name>`. Nothing is ever deleted, a new upload with
//! a known name replaces the previous files.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::protocol::output_file_name;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async lock per filename.
///
/// Requests for the same name are serialized while requests for different
/// names run in parallel. Names differing only in case share a lock, as they
/// name the same file on case-insensitive filesystems. Locks nobody holds or
/// waits for are pruned.
#[derive(Default)]
pub struct NamedLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().await;
            map.retain(|_name, lock| Arc::strong_count(lock) > 1);
            map.entry(name.to_lowercase())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }

    /// Number of names currently tracked.
    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }
}

pub struct Storage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    locks: NamedLocks,
}

impl Storage {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
            locks: NamedLocks::new(),
        }
    }

    /// Create the upload and output directories if they do not exist.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.upload_dir, &self.output_dir] {
            std::fs::create_dir_all(dir)?;
            log::info!("Using directory {}", dir.display());
        }

        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.upload_dir.join(filename)
    }

    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(output_file_name(filename))
    }

    /// Hold exclusive access to the files belonging to `filename`.
    pub async fn lock(&self, filename: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(filename).await
    }

    /// Write an upload to its input path, replacing earlier uploads of that name.
    pub async fn store_upload(&self, filename: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.input_path(filename);
        tokio::fs::write(&path, data).await?;
        log::debug!("Stored {} bytes at {}", data.len(), path.display());

        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_paths() {
        let storage = Storage::new("up", "out");

        assert_eq!(storage.input_path("scan.png"), Path::new("up/scan.png"));
        assert_eq!(
            storage.output_path("scan.png"),
            Path::new("out/annotated_scan.png")
        );
    }

    #[test]
    fn test_create_dirs_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::new(root.path().join("uploads"), root.path().join("outputs"));

        storage.create_dirs().unwrap();
        storage.create_dirs().unwrap();

        assert!(storage.upload_dir().is_dir());
        assert!(storage.output_dir().is_dir());
    }

    #[tokio::test]
    async fn test_uploads_overwrite_and_accumulate() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::new(root.path().join("uploads"), root.path().join("outputs"));
        storage.create_dirs().unwrap();

        let path = storage.store_upload("a.png", b"first").await.unwrap();
        storage.store_upload("b.png", b"other").await.unwrap();
        storage.store_upload("a.png", b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(storage.upload_dir()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_named_locks_serialize_same_name() {
        let locks = NamedLocks::new();

        let guard = locks.lock("a.png").await;

        // Other names are not blocked
        let _other = tokio::time::timeout(Duration::from_millis(100), locks.lock("b.png"))
            .await
            .expect("lock for another name");

        let same = tokio::time::timeout(Duration::from_millis(100), locks.lock("a.png")).await;
        assert!(same.is_err());

        drop(guard);
        let _same = tokio::time::timeout(Duration::from_millis(100), locks.lock("a.png"))
            .await
            .expect("lock after release");
    }

    #[tokio::test]
    async fn test_named_locks_ignore_case() {
        let locks = NamedLocks::new();

        let _guard = locks.lock("Scan.png").await;

        let same = tokio::time::timeout(Duration::from_millis(100), locks.lock("scan.PNG")).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_named_locks_prune_unused_entries() {
        let locks = NamedLocks::new();

        for i in 0..5 {
            let _guard = locks.lock(&format!("{i}.png")).await;
        }
        let _guard = locks.lock("last.png").await;

        assert_eq!(locks.len().await, 1);
    }
}
