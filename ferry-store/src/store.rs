//! Upload persistence: one blob file per upload under `blobs/`, one metadata
//! row per upload in SQLite.
//!
//! Blob writes are atomic: bytes land in a `.part` file that is renamed into
//! place only once fully written, so a crash never leaves a partial blob
//! visible under its final path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ferry_protocol::error::{FerryError, Result};
use ferry_protocol::wire::sha256;
use ferry_protocol::UploadId;
use rusqlite::Connection;
use tokio::io::AsyncWriteExt;

use crate::chunker::ChunkReader;

/// Lifecycle of a stored upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Bytes are being written; not yet visible under the final path.
    Pending,
    /// Fully written and checksummed; available for transfer.
    Stored,
    /// An outbound session is currently streaming this upload.
    Sending,
    /// At least one outbound transfer completed with a verified checksum.
    Sent,
    /// A write or inbound transfer failed; partial bytes kept for diagnostics.
    Failed,
    /// Deleted by the caller. Row kept as a tombstone so delete stays
    /// idempotent for IDs that once existed.
    Deleted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Stored => "stored",
            UploadStatus::Sending => "sending",
            UploadStatus::Sent => "sent",
            UploadStatus::Failed => "failed",
            UploadStatus::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "stored" => Ok(UploadStatus::Stored),
            "sending" => Ok(UploadStatus::Sending),
            "sent" => Ok(UploadStatus::Sent),
            "failed" => Ok(UploadStatus::Failed),
            "deleted" => Ok(UploadStatus::Deleted),
            other => Err(FerryError::Storage(format!("unknown upload status: {other}"))),
        }
    }
}

/// Metadata record for one uploaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub id: UploadId,
    pub filename: String,
    pub storage_path: PathBuf,
    pub size: u64,
    pub sha256: [u8; 32],
    /// Unix seconds at upload time.
    pub upload_time: u64,
    pub user_id: String,
    pub status: UploadStatus,
}

/// Content store rooted at a storage directory.
///
/// Thread-safe: the SQLite connection is behind a `Mutex`, and in-flight
/// receive-side writes are tracked so concurrent writers to the same upload
/// ID fail with `Conflict` instead of racing.
pub struct ContentStore {
    storage_dir: PathBuf,
    conn: Mutex<Connection>,
    in_flight: Mutex<HashSet<UploadId>>,
}

fn sql_err(e: rusqlite::Error) -> FerryError {
    FerryError::Storage(format!("metadata query failed: {e}"))
}

fn io_err(path: &Path, action: &str, e: std::io::Error) -> FerryError {
    FerryError::Storage(format!("failed to {action} {}: {e}", path.display()))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ContentStore {
    /// Open (or create) a content store rooted at `storage_dir`.
    pub fn open(storage_dir: PathBuf) -> Result<Self> {
        let blob_dir = storage_dir.join("blobs");
        std::fs::create_dir_all(&blob_dir).map_err(|e| io_err(&blob_dir, "create", e))?;

        let db_path = storage_dir.join("ferry.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| FerryError::Storage(format!("failed to open {}: {e}", db_path.display())))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                sha256 BLOB NOT NULL,
                upload_time INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL
            );",
        )
        .map_err(sql_err)?;

        tracing::info!(storage_dir = %storage_dir.display(), "content store opened");

        Ok(Self {
            storage_dir,
            conn: Mutex::new(conn),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Final on-disk path for an upload's blob.
    pub fn blob_path(&self, id: &UploadId) -> PathBuf {
        self.storage_dir.join("blobs").join(&id.0)
    }

    fn part_path(&self, id: &UploadId) -> PathBuf {
        self.storage_dir.join("blobs").join(format!("{}.part", id.0))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Persist an uploaded file and return its metadata record.
    ///
    /// Fails with `Storage` on empty input or any disk error. The blob is
    /// written to a `.part` file and renamed into place.
    pub fn store(&self, filename: &str, user_id: &str, bytes: &[u8]) -> Result<FileUpload> {
        if bytes.is_empty() {
            return Err(FerryError::Storage("refusing to store empty upload".into()));
        }

        let id = UploadId::generate();
        let hash = sha256(bytes);
        let part = self.part_path(&id);
        let blob = self.blob_path(&id);

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&part).map_err(|e| io_err(&part, "create", e))?;
            file.write_all(bytes).map_err(|e| io_err(&part, "write", e))?;
            file.sync_all().map_err(|e| io_err(&part, "sync", e))?;
        }
        std::fs::rename(&part, &blob).map_err(|e| io_err(&blob, "rename into", e))?;

        let record = FileUpload {
            id: id.clone(),
            filename: filename.to_string(),
            storage_path: blob,
            size: bytes.len() as u64,
            sha256: hash,
            upload_time: now_unix(),
            user_id: user_id.to_string(),
            status: UploadStatus::Stored,
        };
        self.insert(&record)?;

        tracing::info!(
            upload_id = %id,
            filename,
            size = record.size,
            sha256 = data_encoding::HEXLOWER.encode(&hash),
            "upload stored"
        );
        Ok(record)
    }

    fn insert(&self, record: &FileUpload) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO uploads (id, filename, size, sha256, upload_time, user_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.id.0,
                record.filename,
                record.size as i64,
                record.sha256.as_slice(),
                record.upload_time as i64,
                record.user_id,
                record.status.as_str(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn row_to_upload(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<FileUpload> {
        let id = UploadId(row.get::<_, String>(0)?);
        let hash_vec: Vec<u8> = row.get(3)?;
        let mut hash = [0u8; 32];
        if hash_vec.len() == 32 {
            hash.copy_from_slice(&hash_vec);
        }
        let status = UploadStatus::parse(&row.get::<_, String>(6)?)
            .unwrap_or(UploadStatus::Failed);
        Ok(FileUpload {
            storage_path: self.blob_path(&id),
            id,
            filename: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            sha256: hash,
            upload_time: row.get::<_, i64>(4)? as u64,
            user_id: row.get(5)?,
            status,
        })
    }

    /// Fetch the row for an ID regardless of status. `NotFound` only for IDs
    /// that never existed.
    fn row(&self, id: &UploadId) -> Result<FileUpload> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, filename, size, sha256, upload_time, user_id, status
                     FROM uploads WHERE id = ?1",
            )
            .map_err(sql_err)?;
        let result = stmt.query_row(rusqlite::params![id.0], |r| self.row_to_upload(r));
        match result {
            Ok(upload) => Ok(upload),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(FerryError::NotFound(format!("upload {id}")))
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    /// Metadata for a live upload. Deleted uploads report `NotFound`.
    pub fn metadata(&self, id: &UploadId) -> Result<FileUpload> {
        let record = self.row(id)?;
        if record.status == UploadStatus::Deleted {
            return Err(FerryError::NotFound(format!("upload {id}")));
        }
        Ok(record)
    }

    /// Open a lazy chunked reader over an upload's blob, restartable from any
    /// chunk offset.
    pub async fn reader(&self, id: &UploadId, chunk_size: u32) -> Result<ChunkReader> {
        let record = self.metadata(id)?;
        ChunkReader::open(&record.storage_path, record.size, chunk_size).await
    }

    /// Update the status of an existing upload.
    pub fn set_status(&self, id: &UploadId, status: UploadStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE uploads SET status = ?2 WHERE id = ?1",
                rusqlite::params![id.0, status.as_str()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(FerryError::NotFound(format!("upload {id}")));
        }
        tracing::debug!(upload_id = %id, status = status.as_str(), "upload status updated");
        Ok(())
    }

    /// Delete an upload's blob and tombstone its metadata.
    ///
    /// Idempotent for IDs that once existed; `NotFound` only for IDs that
    /// never did.
    pub fn delete(&self, id: &UploadId) -> Result<()> {
        let record = self.row(id)?;
        if record.status == UploadStatus::Deleted {
            return Ok(());
        }
        for path in [self.blob_path(id), self.part_path(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, "remove", e)),
            }
        }
        self.set_status(id, UploadStatus::Deleted)?;
        tracing::info!(upload_id = %id, "upload deleted");
        Ok(())
    }

    /// List live uploads owned by `user_id`.
    pub fn list(&self, user_id: &str) -> Result<Vec<FileUpload>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, filename, size, sha256, upload_time, user_id, status
                     FROM uploads WHERE user_id = ?1 AND status != 'deleted'
                     ORDER BY upload_time",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(rusqlite::params![user_id], |r| self.row_to_upload(r))
            .map_err(sql_err)?;
        let mut uploads = Vec::new();
        for row in rows {
            uploads.push(row.map_err(sql_err)?);
        }
        Ok(uploads)
    }

    /// Delete live uploads older than `age`. Returns how many were removed.
    pub fn cleanup_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = now_unix().saturating_sub(age.as_secs());
        let old: Vec<UploadId> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT id FROM uploads WHERE upload_time < ?1 AND status != 'deleted'")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(rusqlite::params![cutoff as i64], |r| {
                    r.get::<_, String>(0).map(UploadId)
                })
                .map_err(sql_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)?
        };

        let count = old.len();
        for id in old {
            self.delete(&id)?;
        }
        if count > 0 {
            tracing::info!(count, "old uploads cleaned up");
        }
        Ok(count)
    }

    /// Bytes retained from an earlier interrupted receive of this upload.
    ///
    /// Returns the `.part` file length only when the stored metadata matches
    /// `expected_hash`, so a changed file never resumes onto stale bytes.
    pub fn partial_for_resume(&self, id: &UploadId, expected_hash: [u8; 32]) -> Option<u64> {
        let record = self.row(id).ok()?;
        if record.sha256 != expected_hash || record.status != UploadStatus::Failed {
            return None;
        }
        std::fs::metadata(self.part_path(id)).ok().map(|m| m.len())
    }

    /// Claim an upload ID for an inbound transfer and open its `.part` file.
    ///
    /// Fails with `Conflict` while another writer holds the same ID. The
    /// claim is released when the returned [`ReceiveSlot`] is dropped.
    ///
    /// A non-zero `resume_boundary` truncates the existing `.part` file to
    /// that byte offset and appends from there instead of starting over.
    pub async fn begin_receive(
        &self,
        id: &UploadId,
        filename: &str,
        user_id: &str,
        size: u64,
        file_hash: [u8; 32],
        resume_boundary: u64,
    ) -> Result<ReceiveSlot<'_>> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(id.clone()) {
                return Err(FerryError::Conflict(id.clone()));
            }
        }

        let record = FileUpload {
            id: id.clone(),
            filename: filename.to_string(),
            storage_path: self.blob_path(id),
            size,
            sha256: file_hash,
            upload_time: now_unix(),
            user_id: user_id.to_string(),
            status: UploadStatus::Pending,
        };
        if let Err(e) = self.insert(&record) {
            self.in_flight.lock().unwrap().remove(id);
            return Err(e);
        }

        let part = self.part_path(id);
        let open_result = if resume_boundary > 0 {
            match tokio::fs::OpenOptions::new().write(true).open(&part).await {
                Ok(f) => {
                    if let Err(e) = f.set_len(resume_boundary).await {
                        Err(e)
                    } else {
                        use tokio::io::AsyncSeekExt;
                        let mut f = f;
                        f.seek(std::io::SeekFrom::Start(resume_boundary))
                            .await
                            .map(|_| f)
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::File::create(&part).await
        };
        let file = match open_result {
            Ok(f) => f,
            Err(e) => {
                self.in_flight.lock().unwrap().remove(id);
                return Err(io_err(&part, "open", e));
            }
        };

        tracing::debug!(upload_id = %id, size, resume_boundary, "inbound receive slot opened");
        Ok(ReceiveSlot {
            store: self,
            upload_id: id.clone(),
            part,
            file: Some(file),
            resumed_bytes: resume_boundary,
            committed: false,
        })
    }
}

/// Exclusive write handle for one inbound upload.
///
/// Bytes accumulate in the `.part` file; [`ReceiveSlot::commit`] renames it
/// into place and marks the upload `Stored`. Dropping the slot without
/// committing marks the upload `Failed` and retains the partial bytes for
/// diagnostics.
pub struct ReceiveSlot<'a> {
    store: &'a ContentStore,
    upload_id: UploadId,
    part: PathBuf,
    file: Option<tokio::fs::File>,
    resumed_bytes: u64,
    committed: bool,
}

impl ReceiveSlot<'_> {
    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    /// Bytes kept from an earlier attempt that precede the write position.
    pub fn resumed_bytes(&self) -> u64 {
        self.resumed_bytes
    }

    /// Independent read handle over the resumed prefix, so callers can
    /// re-hash kept bytes. Read exactly [`ReceiveSlot::resumed_bytes`] from it.
    pub async fn resumed_prefix_reader(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(&self.part)
            .await
            .map_err(|e| io_err(&self.part, "open", e))
    }

    /// Append a chunk of bytes to the in-progress blob.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FerryError::Storage("receive slot already closed".into()))?;
        file.write_all(data)
            .await
            .map_err(|e| io_err(&self.part, "write", e))
    }

    /// Finish the write: flush, rename into place, mark `Stored`.
    pub async fn commit(mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| FerryError::Storage("receive slot already closed".into()))?;
        file.flush().await.map_err(|e| io_err(&self.part, "flush", e))?;
        file.sync_all()
            .await
            .map_err(|e| io_err(&self.part, "sync", e))?;
        drop(file);

        let blob = self.store.blob_path(&self.upload_id);
        std::fs::rename(&self.part, &blob).map_err(|e| io_err(&blob, "rename into", e))?;
        self.store.set_status(&self.upload_id, UploadStatus::Stored)?;
        self.committed = true;

        tracing::info!(upload_id = %self.upload_id, "inbound upload committed");
        Ok(())
    }
}

impl Drop for ReceiveSlot<'_> {
    fn drop(&mut self) {
        self.store.in_flight.lock().unwrap().remove(&self.upload_id);
        if !self.committed {
            // Partial bytes stay in the .part file; only the status changes.
            if let Err(e) = self.store.set_status(&self.upload_id, UploadStatus::Failed) {
                tracing::warn!(upload_id = %self.upload_id, error = %e, "failed to mark upload failed");
            }
        }
    }
}
