//! Blob store
//!
//! Content-addressable file store under `data_dir/blobs`: finished blobs are
//! keyed by their SHA-256 and immutable; identical uploads dedupe to one
//! object. Partial batch outputs live under `partial/` keyed by batch id,
//! are appended a chunk at a time with flush + fsync, and are promoted into
//! the content-addressed area on finalisation. The partial file's line
//! count is the worker's crash-resume point.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Handle to a finished blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    /// Hex SHA-256 of the content; the key inside the store
    pub blob_ref: String,
    pub bytes: u64,
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating its directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("partial"))?;
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    fn object_path(&self, blob_ref: &str) -> PathBuf {
        self.root.join("objects").join(blob_ref)
    }

    fn partial_path(&self, batch_id: &str) -> PathBuf {
        self.root.join("partial").join(format!("{}.jsonl", batch_id))
    }

    /// Begin a streaming write. Bytes are hashed as they arrive; `finish`
    /// moves the temp file to its content address.
    pub async fn writer(&self) -> Result<BlobWriter> {
        let tmp = self
            .root
            .join("tmp")
            .join(uuid::Uuid::new_v4().simple().to_string());
        let file = File::create(&tmp).await?;
        Ok(BlobWriter {
            store: self.clone(),
            tmp,
            file,
            hasher: Sha256::new(),
            bytes: 0,
        })
    }

    /// Convenience for in-memory payloads.
    pub async fn put_bytes(&self, data: &[u8]) -> Result<BlobHandle> {
        let mut w = self.writer().await?;
        w.write_chunk(data).await?;
        w.finish().await
    }

    pub fn exists(&self, blob_ref: &str) -> bool {
        self.object_path(blob_ref).exists()
    }

    /// Open a finished blob for streaming reads.
    pub async fn open_reader(&self, blob_ref: &str) -> Result<File> {
        File::open(self.object_path(blob_ref))
            .await
            .map_err(|_| Error::FileMissing(format!("blob {}", blob_ref)))
    }

    pub async fn read_to_string(&self, blob_ref: &str) -> Result<String> {
        let mut out = String::new();
        self.open_reader(blob_ref).await?.read_to_string(&mut out).await?;
        Ok(out)
    }

    /// Best-effort delete; a missing object is not an error.
    pub async fn delete(&self, blob_ref: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(blob_ref)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Partial outputs
    // ------------------------------------------------------------------

    /// Append result lines for a batch, then flush and fsync so the line
    /// count is a valid resume point even through a crash.
    pub async fn append_partial_lines(&self, batch_id: &str, lines: &[String]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partial_path(batch_id))
            .await?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Open the in-progress partial output for reading (resume recount).
    pub async fn open_partial_reader(&self, batch_id: &str) -> Result<File> {
        File::open(self.partial_path(batch_id))
            .await
            .map_err(|_| Error::FileMissing(format!("partial output for {}", batch_id)))
    }

    /// Lines already durably written for this batch; 0 if no partial exists.
    pub async fn partial_line_count(&self, batch_id: &str) -> Result<u64> {
        let path = self.partial_path(batch_id);
        if !path.exists() {
            return Ok(0);
        }
        count_lines(&path).await
    }

    /// Promote the partial output into the content-addressed area.
    ///
    /// The partial file is left in place: promotion is idempotent, so a
    /// crash between publishing and the job's terminal transition replays
    /// cleanly. Call [`discard_partial`](Self::discard_partial) once the
    /// transition has committed.
    pub async fn promote_partial(&self, batch_id: &str) -> Result<BlobHandle> {
        let path = self.partial_path(batch_id);
        if !path.exists() {
            // A batch can finish with zero written lines (cancel before the
            // first chunk); publish an empty blob for it.
            return self.put_bytes(b"").await;
        }

        let (blob_ref, bytes) = hash_file(&path).await?;
        let dest = self.object_path(&blob_ref);
        if !dest.exists() {
            tokio::fs::copy(&path, &dest).await?;
        }
        Ok(BlobHandle { blob_ref, bytes })
    }

    /// Drop a partial output that will never be promoted.
    pub async fn discard_partial(&self, batch_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.partial_path(batch_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-flight streaming blob write.
pub struct BlobWriter {
    store: BlobStore,
    tmp: PathBuf,
    file: File,
    hasher: Sha256,
    bytes: u64,
}

impl BlobWriter {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        self.file.write_all(data).await?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush, fsync, and move the temp file to its content address.
    pub async fn finish(mut self) -> Result<BlobHandle> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let blob_ref = hex::encode(self.hasher.finalize());
        let dest = self.store.object_path(&blob_ref);
        if dest.exists() {
            tokio::fs::remove_file(&self.tmp).await?;
        } else {
            tokio::fs::rename(&self.tmp, &dest).await?;
        }
        Ok(BlobHandle { blob_ref, bytes: self.bytes })
    }

    /// Abort the write and remove the temp file.
    pub async fn abort(self) -> Result<()> {
        drop(self.file);
        match tokio::fs::remove_file(&self.tmp).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), bytes))
}

async fn count_lines(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut count = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_read_delete() {
        let (store, _dir) = store();
        let handle = store.put_bytes(b"hello world").await.unwrap();
        assert_eq!(handle.bytes, 11);
        assert!(store.exists(&handle.blob_ref));

        let content = store.read_to_string(&handle.blob_ref).await.unwrap();
        assert_eq!(content, "hello world");

        store.delete(&handle.blob_ref).await.unwrap();
        assert!(!store.exists(&handle.blob_ref));
        // Deleting again is fine
        store.delete(&handle.blob_ref).await.unwrap();
    }

    #[tokio::test]
    async fn test_identical_content_dedupes() {
        let (store, _dir) = store();
        let a = store.put_bytes(b"same").await.unwrap();
        let b = store.put_bytes(b"same").await.unwrap();
        assert_eq!(a.blob_ref, b.blob_ref);
    }

    #[tokio::test]
    async fn test_streaming_writer_matches_put_bytes() {
        let (store, _dir) = store();
        let mut w = store.writer().await.unwrap();
        w.write_chunk(b"one ").await.unwrap();
        w.write_chunk(b"two").await.unwrap();
        let streamed = w.finish().await.unwrap();
        let whole = store.put_bytes(b"one two").await.unwrap();
        assert_eq!(streamed.blob_ref, whole.blob_ref);
        assert_eq!(streamed.bytes, 7);
    }

    #[tokio::test]
    async fn test_partial_append_count_promote() {
        let (store, _dir) = store();
        assert_eq!(store.partial_line_count("batch-1").await.unwrap(), 0);

        store
            .append_partial_lines("batch-1", &["{\"a\":1}".into(), "{\"b\":2}".into()])
            .await
            .unwrap();
        assert_eq!(store.partial_line_count("batch-1").await.unwrap(), 2);

        store.append_partial_lines("batch-1", &["{\"c\":3}".into()]).await.unwrap();
        assert_eq!(store.partial_line_count("batch-1").await.unwrap(), 3);

        let handle = store.promote_partial("batch-1").await.unwrap();
        let content = store.read_to_string(&handle.blob_ref).await.unwrap();
        assert_eq!(content.lines().count(), 3);

        // Promotion is idempotent until the partial is discarded
        let again = store.promote_partial("batch-1").await.unwrap();
        assert_eq!(again.blob_ref, handle.blob_ref);

        store.discard_partial("batch-1").await.unwrap();
        assert_eq!(store.partial_line_count("batch-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promote_without_partial_publishes_empty() {
        let (store, _dir) = store();
        let handle = store.promote_partial("batch-none").await.unwrap();
        assert_eq!(handle.bytes, 0);
        assert_eq!(store.read_to_string(&handle.blob_ref).await.unwrap(), "");
    }
}
