//! On-disk file registry keyed by generated file ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use l4d2_bridge_protocol::constants::DEFAULT_MAX_FILE_SIZE;
use l4d2_bridge_transfer::{
    Assembled, ExtensionPolicy, TransferError, checksum_bytes, safe_filename,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::token::generate_file_id;
use crate::{MAX_REGISTRY_ENTRIES, REGISTRY_TTL};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub policy: ExtensionPolicy,
    pub max_file_size: u64,
    pub max_entries: usize,
    pub ttl: Duration,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            policy: ExtensionPolicy::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_entries: MAX_REGISTRY_ENTRIES,
            ttl: REGISTRY_TTL,
        }
    }
}

/// Public description of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug)]
struct Entry {
    meta: FileMeta,
    registered_at: Instant,
    downloads_left: u32,
}

/// Registry of files available on the object channel.
///
/// Bounded by entry count and age; the oldest entries are dropped first.
/// Dropping an entry forgets it but leaves the file on disk. A download
/// that exhausts an entry's budget deletes the file.
#[derive(Debug)]
pub struct FileStore {
    config: StoreConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FileStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn check_name(&self, file_name: &str) -> Result<String, DataChannelError> {
        let name = safe_filename(file_name);
        self.config.policy.check(&name)?;
        Ok(name)
    }

    fn check_size(&self, size: u64) -> Result<(), DataChannelError> {
        if size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                size,
                limit: self.config.max_file_size,
            }
            .into());
        }
        Ok(())
    }

    /// Picks a destination that does not clobber an existing file.
    fn target_path(&self, file_id: &str, name: &str) -> PathBuf {
        let plain = self.config.dir.join(name);
        if plain.exists() {
            self.config.dir.join(format!("{file_id}_{name}"))
        } else {
            plain
        }
    }

    /// Stores in-memory content.
    pub async fn put_bytes(
        &self,
        file_name: &str,
        data: &[u8],
        downloads: u32,
    ) -> Result<FileMeta, DataChannelError> {
        let name = self.check_name(file_name)?;
        self.check_size(data.len() as u64)?;
        tokio::fs::create_dir_all(&self.config.dir).await?;

        let file_id = generate_file_id();
        let path = self.target_path(&file_id, &name);
        tokio::fs::write(&path, data).await?;
        Ok(self.insert(
            FileMeta {
                file_id,
                file_name: name,
                size: data.len() as u64,
                sha256: checksum_bytes(data),
                path,
            },
            downloads,
        ))
    }

    /// Copies a local file into the store.
    pub async fn put_file(
        &self,
        file_name: &str,
        source: &Path,
        downloads: u32,
    ) -> Result<FileMeta, DataChannelError> {
        let file = tokio::fs::File::open(source).await?;
        let stream = tokio_util::io::ReaderStream::new(file);
        self.put_stream(file_name, stream, downloads).await
    }

    /// Streams content to disk, hashing it on the way and enforcing the
    /// size limit as bytes arrive.
    pub async fn put_stream<S, B, E>(
        &self,
        file_name: &str,
        mut stream: S,
        downloads: u32,
    ) -> Result<FileMeta, DataChannelError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let name = self.check_name(file_name)?;
        tokio::fs::create_dir_all(&self.config.dir).await?;

        let file_id = generate_file_id();
        let partial = self.config.dir.join(format!(".{file_id}.upload"));
        let mut out = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        let result: Result<(), DataChannelError> = async {
            while let Some(piece) = stream.next().await {
                let piece = piece.map_err(|e| std::io::Error::other(e.to_string()))?;
                let bytes = piece.as_ref();
                size += bytes.len() as u64;
                self.check_size(size)?;
                hasher.update(bytes);
                out.write_all(bytes).await?;
            }
            out.flush().await?;
            Ok(())
        }
        .await;
        drop(out);

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        if size == 0 {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(DataChannelError::Empty);
        }

        let path = self.target_path(&file_id, &name);
        tokio::fs::rename(&partial, &path).await?;
        let meta = self.insert(
            FileMeta {
                file_id,
                file_name: name,
                size,
                sha256: hex::encode(hasher.finalize()),
                path,
            },
            downloads,
        );
        info!(file_id = %meta.file_id, file = %meta.file_name, size, "file stored");
        Ok(meta)
    }

    /// Moves verified transfer content into the store.
    ///
    /// The digest was already checked by the transfer engine, so only the
    /// name is sanitized here.
    pub async fn adopt(
        &self,
        file_name: &str,
        content: Assembled,
        size: u64,
        sha256: &str,
        downloads: u32,
    ) -> Result<FileMeta, DataChannelError> {
        let name = safe_filename(file_name);
        let file_id = generate_file_id();
        let path = self.target_path(&file_id, &name);
        let dest = path.clone();
        tokio::task::spawn_blocking(move || content.persist_to(&dest))
            .await
            .map_err(std::io::Error::other)??;
        let meta = self.insert(
            FileMeta {
                file_id,
                file_name: name,
                size,
                sha256: sha256.to_string(),
                path,
            },
            downloads,
        );
        debug!(file_id = %meta.file_id, path = %meta.path.display(), "transfer content adopted");
        Ok(meta)
    }

    /// Registers a file that already sits on disk, such as a verified
    /// inbound transfer.
    pub fn register(
        &self,
        file_name: &str,
        path: PathBuf,
        size: u64,
        sha256: &str,
        downloads: u32,
    ) -> FileMeta {
        self.insert(
            FileMeta {
                file_id: generate_file_id(),
                file_name: safe_filename(file_name),
                size,
                sha256: sha256.to_string(),
                path,
            },
            downloads,
        )
    }

    fn insert(&self, meta: FileMeta, downloads: u32) -> FileMeta {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            meta.file_id.clone(),
            Entry {
                meta: meta.clone(),
                registered_at: now,
                downloads_left: downloads.max(1),
            },
        );
        self.evict(&mut entries, now);
        meta
    }

    fn evict(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let ttl = self.config.ttl;
        entries.retain(|id, e| {
            let keep = now.saturating_duration_since(e.registered_at) <= ttl;
            if !keep {
                debug!(file_id = %id, "registry entry expired");
            }
            keep
        });
        if entries.len() > self.config.max_entries {
            let mut by_age: Vec<(Instant, String)> = entries
                .iter()
                .map(|(id, e)| (e.registered_at, id.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - self.config.max_entries;
            for (_, id) in by_age.into_iter().take(excess) {
                entries.remove(&id);
            }
        }
    }

    pub fn get(&self, file_id: &str) -> Option<FileMeta> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        self.evict(&mut entries, now);
        entries.get(file_id).map(|e| e.meta.clone())
    }

    pub fn list(&self) -> Vec<FileMeta> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        self.evict(&mut entries, now);
        let mut files: Vec<FileMeta> = entries.values().map(|e| e.meta.clone()).collect();
        files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        files
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, file_id: &str) -> Option<FileMeta> {
        self.entries
            .lock()
            .unwrap()
            .remove(file_id)
            .map(|e| e.meta)
    }

    /// Opens a file for download and spends one unit of its budget.
    ///
    /// When the budget reaches zero the entry is removed at once and the
    /// file is deleted when the returned [`Download`] is dropped.
    pub async fn open_download(&self, file_id: &str) -> Result<Download, DataChannelError> {
        let (meta, last) = {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            self.evict(&mut entries, now);
            let entry = entries
                .get_mut(file_id)
                .ok_or_else(|| DataChannelError::NotFound(file_id.to_string()))?;
            entry.downloads_left = entry.downloads_left.saturating_sub(1);
            let last = entry.downloads_left == 0;
            let meta = entry.meta.clone();
            if last {
                entries.remove(file_id);
            }
            (meta, last)
        };

        if !meta.path.starts_with(&self.config.dir) {
            warn!(file_id, path = %meta.path.display(), "refusing to serve file outside store");
            return Err(DataChannelError::NotFound(file_id.to_string()));
        }
        let cleanup = last.then(|| RemoveOnDrop {
            file_id: file_id.to_string(),
            path: meta.path.clone(),
        });
        let file = tokio::fs::File::open(&meta.path)
            .await
            .map_err(|_| DataChannelError::NotFound(file_id.to_string()))?;
        Ok(Download {
            meta,
            file,
            cleanup,
        })
    }
}

/// An opened stored file, ready to stream.
#[derive(Debug)]
pub struct Download {
    pub meta: FileMeta,
    pub file: tokio::fs::File,
    /// Present on the last permitted download.
    pub cleanup: Option<RemoveOnDrop>,
}

/// Deletes a served file once the response body holding it is gone.
#[derive(Debug)]
pub struct RemoveOnDrop {
    file_id: String,
    path: PathBuf,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(file_id = %self.file_id, "file served and removed"),
            Err(e) => warn!(file_id = %self.file_id, "failed to remove served file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(StoreConfig::new(dir.path()))
    }

    #[tokio::test]
    async fn put_bytes_registers_and_writes() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let meta = s.put_bytes("map01.vpk", b"vpk data", 1).await.unwrap();
        assert_eq!(meta.file_id.len(), 16);
        assert_eq!(meta.size, 8);
        assert_eq!(meta.sha256, checksum_bytes(b"vpk data"));
        assert_eq!(std::fs::read(&meta.path).unwrap(), b"vpk data");
        assert_eq!(s.get(&meta.file_id), Some(meta));
    }

    #[tokio::test]
    async fn put_rejects_extension_and_size() {
        let dir = TempDir::new().unwrap();
        let s = FileStore::new(StoreConfig {
            max_file_size: 4,
            ..StoreConfig::new(dir.path())
        });
        assert!(matches!(
            s.put_bytes("run.exe", b"x", 1).await,
            Err(DataChannelError::Rejected(TransferError::ExtensionRejected(_)))
        ));
        assert!(matches!(
            s.put_bytes("big.vpk", b"12345", 1).await,
            Err(DataChannelError::Rejected(TransferError::TooLarge { .. }))
        ));
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn stream_over_limit_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let s = FileStore::new(StoreConfig {
            max_file_size: 5,
            ..StoreConfig::new(dir.path())
        });
        let pieces: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(vec![1; 3]), Ok(vec![2; 3])];
        let err = s
            .put_stream("a.vpk", futures_util::stream::iter(pieces), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DataChannelError::Rejected(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn duplicate_names_do_not_clobber() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let a = s.put_bytes("same.vpk", b"one", 1).await.unwrap();
        let b = s.put_bytes("same.vpk", b"two", 1).await.unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(std::fs::read(&a.path).unwrap(), b"one");
    }

    async fn read_all(download: &mut Download) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::new();
        download.file.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn download_is_one_shot() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let meta = s.put_bytes("c1.vpk", b"abc", 1).await.unwrap();
        let mut download = s.open_download(&meta.file_id).await.unwrap();
        assert_eq!(download.meta.file_id, meta.file_id);
        assert!(download.cleanup.is_some());
        assert_eq!(read_all(&mut download).await, b"abc");
        assert!(matches!(
            s.open_download(&meta.file_id).await,
            Err(DataChannelError::NotFound(_))
        ));

        assert!(meta.path.exists());
        drop(download);
        assert!(!meta.path.exists());
    }

    #[tokio::test]
    async fn download_honours_budget() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let meta = s.put_bytes("c2.vpk", b"abc", 2).await.unwrap();
        let first = s.open_download(&meta.file_id).await.unwrap();
        assert!(first.cleanup.is_none());
        drop(first);
        assert!(meta.path.exists());
        let mut second = s.open_download(&meta.file_id).await.unwrap();
        assert_eq!(read_all(&mut second).await, b"abc");
        drop(second);
        assert!(!meta.path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_is_bounded() {
        let dir = TempDir::new().unwrap();
        let s = FileStore::new(StoreConfig {
            max_entries: 3,
            ..StoreConfig::new(dir.path())
        });
        let mut ids = Vec::new();
        for i in 0..5 {
            tokio::time::advance(Duration::from_millis(10)).await;
            let meta = s.register("m.vpk", dir.path().join(format!("{i}")), 1, "00", 1);
            ids.push(meta.file_id);
        }
        assert_eq!(s.len(), 3);
        assert!(s.get(&ids[0]).is_none());
        assert!(s.get(&ids[4]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let meta = s.register("m.vpk", dir.path().join("m.vpk"), 1, "00", 1);
        tokio::time::advance(REGISTRY_TTL).await;
        assert!(s.get(&meta.file_id).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(s.get(&meta.file_id).is_none());
    }

    #[tokio::test]
    async fn download_refuses_paths_outside_store() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let outside = other.path().join("x.vpk");
        std::fs::write(&outside, b"x").unwrap();
        let s = store(&dir);
        let meta = s.register("x.vpk", outside.clone(), 1, "00", 1);
        assert!(s.open_download(&meta.file_id).await.is_err());
        assert!(outside.exists());
    }
}
