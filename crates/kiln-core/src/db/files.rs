//! File rows
//!
//! Files are immutable after insertion. Deletion is refused while any
//! non-terminal job still references the file.

use chrono::{DateTime, Utc};

use super::Database;
use crate::error::{Error, Result};
use crate::models::FileRecord;

const TERMINAL: &str = "('completed', 'failed', 'cancelled', 'expired')";

impl Database {
    pub async fn insert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, purpose, filename, bytes, blob_ref, line_count, model, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.purpose)
        .bind(&file.filename)
        .bind(file.bytes)
        .bind(&file.blob_ref)
        .bind(file.line_count)
        .bind(&file.model)
        .bind(file.created_at)
        .bind(file.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let file = sqlx::query_as("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    pub async fn list_files(&self, limit: i64) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as("SELECT * FROM files ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(files)
    }

    /// Delete a file row, refusing while a non-terminal job references it.
    /// Returns the removed record so the caller can drop the blob.
    pub async fn delete_file(&self, id: &str) -> Result<FileRecord> {
        let mut tx = self.pool.begin().await?;

        let file: Option<FileRecord> = sqlx::query_as("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let file = file.ok_or_else(|| Error::not_found(format!("file {}", id)))?;

        let in_use: (i64,) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*) FROM batch_jobs
            WHERE (input_file_id = ? OR output_file_id = ? OR error_file_id = ?)
              AND status NOT IN {}
            "#,
            TERMINAL
        ))
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        if in_use.0 > 0 {
            return Err(Error::FileInUse(format!(
                "file {} is referenced by {} active job(s)",
                id, in_use.0
            )));
        }

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(file)
    }

    /// How many file rows still point at a blob. Blobs are content-addressed
    /// and may be shared; only delete the object when this reaches zero.
    pub async fn files_with_blob_ref(&self, blob_ref: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE blob_ref = ?")
            .bind(blob_ref)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Files past their retention window, for the sweeper.
    pub async fn expired_files(&self, now: DateTime<Utc>) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as(
            "SELECT * FROM files WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_test_db;
    use crate::models::{new_file_id, FilePurpose, FileRecord};
    use chrono::Utc;

    fn file(id: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            purpose: FilePurpose::BatchInput.as_str().to_string(),
            filename: "input.jsonl".to_string(),
            bytes: 42,
            blob_ref: "deadbeef".to_string(),
            line_count: 3,
            model: Some("test-model".to_string()),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let (db, _dir) = open_test_db().await;
        let id = new_file_id();
        db.insert_file(&file(&id)).await.unwrap();

        let got = db.get_file(&id).await.unwrap().unwrap();
        assert_eq!(got.filename, "input.jsonl");
        assert_eq!(got.line_count, 3);

        let removed = db.delete_file(&id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(db.get_file(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (db, _dir) = open_test_db().await;
        let err = db.delete_file("file-nope").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
    }
}
