//! Ports for the external stores (key-value records and preview blobs) and
//! the bundled SQLite/filesystem implementations.
//!
//! Every write either targets a distinct key or is a commutative signed
//! increment, so concurrent workers never need to coordinate except for the
//! one-time counter reset.

use {
    crate::{
        record::{ImageRecord, TagIndexEntry},
        schema,
    },
    async_trait::async_trait,
    futures::FutureExt,
    sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Connection, Row, SqliteConnection},
    std::path::{Path, PathBuf},
    thiserror::Error,
    tokio::{fs, sync::Mutex as AsyncMutex},
};

#[derive(Error, Debug)]
pub enum StoreError {
    /// Short-lived credentials have lapsed; the caller may refresh once and
    /// retry the failed batch.
    #[error("store credentials expired")]
    CredentialsExpired,

    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blob write failed: {0}")]
    Blob(#[from] std::io::Error),
}

/// Key-value store holding primary records, per-tag index entries, and the
/// signed counters derived from them.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup of the current record for (owner, image id).
    async fn get_record(
        &self,
        owner: &str,
        image_id: &str,
    ) -> Result<Option<ImageRecord>, StoreError>;

    /// Batched write of the primary record plus its index entries, superseding
    /// any entries left by a prior processing of the same image.
    async fn put_image(
        &self,
        record: &ImageRecord,
        entries: &[TagIndexEntry],
    ) -> Result<(), StoreError>;

    /// Signed increment against one tag's popularity counter, upserting its
    /// display label.
    async fn add_tag_count(&self, owner: &str, tag: &str, delta: i64) -> Result<(), StoreError>;

    /// Signed increment against the owner's storage/image aggregate.
    async fn add_profile_totals(
        &self,
        owner: &str,
        bytes: i64,
        images: i64,
    ) -> Result<(), StoreError>;

    /// Wipe every tag counter for `owner`. Used at most once per
    /// full-library correction run.
    async fn reset_tag_counts(&self, owner: &str) -> Result<(), StoreError>;

    /// Re-authenticate after [StoreError::CredentialsExpired]. No-op for
    /// stores without short-lived credentials.
    async fn refresh_credentials(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Blob store for preview renditions.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;
}

/// [RecordStore] backed by a single SQLite database.
pub struct SqliteStore {
    conn: AsyncMutex<SqliteConnection>,
}

impl SqliteStore {
    /// Create or reuse the database at `state_file`, applying the schema.
    pub async fn open(state_file: &str) -> Result<Self, StoreError> {
        Self::connect(&format!("sqlite://{}", state_file)).await
    }

    /// An ephemeral in-memory store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> Result<Self, StoreError> {
        let mut conn = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .connect()
            .await?;

        for statement in schema::DDL_STATEMENTS {
            sqlx::query(statement).execute(&mut conn).await?;
        }

        Ok(Self {
            conn: AsyncMutex::new(conn),
        })
    }

    /// Current count for one tag, zero when absent.
    pub async fn tag_count(&self, owner: &str, tag: &str) -> Result<i64, StoreError> {
        Ok(
            sqlx::query("SELECT count FROM tag_counts WHERE owner = ?1 AND tag = ?2")
                .bind(owner)
                .bind(tag)
                .fetch_optional(&mut *self.conn.lock().await)
                .await?
                .map(|row| row.get(0))
                .unwrap_or(0),
        )
    }

    /// The tags currently indexing an image, in sorted order.
    pub async fn indexed_tags(&self, owner: &str, image_id: &str) -> Result<Vec<String>, StoreError> {
        let rows =
            sqlx::query("SELECT tag FROM tag_index WHERE owner = ?1 AND image_id = ?2 ORDER BY tag")
                .bind(owner)
                .bind(image_id)
                .fetch_all(&mut *self.conn.lock().await)
                .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// The owner's (bytes used, image count) aggregate.
    pub async fn profile_totals(&self, owner: &str) -> Result<(i64, i64), StoreError> {
        Ok(
            sqlx::query("SELECT bytes_used, image_count FROM profiles WHERE owner = ?1")
                .bind(owner)
                .fetch_optional(&mut *self.conn.lock().await)
                .await?
                .map(|row| (row.get(0), row.get(1)))
                .unwrap_or((0, 0)),
        )
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_record(
        &self,
        owner: &str,
        image_id: &str,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query("SELECT document FROM images WHERE owner = ?1 AND image_id = ?2")
            .bind(owner)
            .bind(image_id)
            .fetch_optional(&mut *self.conn.lock().await)
            .await?;

        row.map(|row| serde_json::from_str(row.get(0)))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn put_image(
        &self,
        record: &ImageRecord,
        entries: &[TagIndexEntry],
    ) -> Result<(), StoreError> {
        let document = serde_json::to_string(record)?;

        self.conn
            .lock()
            .await
            .transaction(|conn| {
                let owner = record.owner.clone();
                let image_id = record.image_id.clone();
                let entries = entries.to_vec();

                async move {
                    // supersede any entries from a prior processing of this image
                    sqlx::query("DELETE FROM tag_index WHERE owner = ?1 AND image_id = ?2")
                        .bind(&owner)
                        .bind(&image_id)
                        .execute(&mut *conn)
                        .await?;

                    sqlx::query(
                        "INSERT OR REPLACE INTO images (owner, image_id, document) \
                         VALUES (?1, ?2, ?3)",
                    )
                    .bind(&owner)
                    .bind(&image_id)
                    .bind(&document)
                    .execute(&mut *conn)
                    .await?;

                    for entry in &entries {
                        let datetime = entry.capture_time.to_string();

                        sqlx::query(
                            "INSERT OR REPLACE INTO tag_index \
                             (owner, tag, image_id, name, datetime, preview_key) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )
                        .bind(&entry.owner)
                        .bind(&entry.tag)
                        .bind(&entry.image_id)
                        .bind(&entry.name)
                        .bind(datetime)
                        .bind(&entry.preview_key)
                        .execute(&mut *conn)
                        .await?;
                    }

                    Ok::<_, sqlx::Error>(())
                }
                .boxed()
            })
            .await?;

        Ok(())
    }

    async fn add_tag_count(&self, owner: &str, tag: &str, delta: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tag_counts (owner, tag, count, label) VALUES (?1, ?2, ?3, ?2) \
             ON CONFLICT (owner, tag) DO UPDATE SET count = count + ?3, label = ?2",
        )
        .bind(owner)
        .bind(tag)
        .bind(delta)
        .execute(&mut *self.conn.lock().await)
        .await?;

        Ok(())
    }

    async fn add_profile_totals(
        &self,
        owner: &str,
        bytes: i64,
        images: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO profiles (owner, bytes_used, image_count) VALUES (?1, ?2, ?3) \
             ON CONFLICT (owner) DO UPDATE \
             SET bytes_used = bytes_used + ?2, image_count = image_count + ?3",
        )
        .bind(owner)
        .bind(bytes)
        .bind(images)
        .execute(&mut *self.conn.lock().await)
        .await?;

        Ok(())
    }

    async fn reset_tag_counts(&self, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tag_counts WHERE owner = ?1")
            .bind(owner)
            .execute(&mut *self.conn.lock().await)
            .await?;

        Ok(())
    }
}

/// [BlobStore] writing previews under a local directory, mirroring the
/// destination key layout.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), StoreError> {
        let path = self.root.join(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&path, bytes).await?;

        Ok(())
    }
}
