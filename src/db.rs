use crate::error::StoreError;
use crate::models::{FileRecord, NewFile};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type DbConnection = Arc<Mutex<Connection>>;

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, category, filename, sha1_sum, storage_path, size, created_at FROM cloud_files";

/// Metadata for stored blobs plus the layout of the blob directory.
///
/// Cheap to clone; every clone shares one SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: DbConnection,
    base_dir: PathBuf,
}

impl Store {
    /// Open (or create) the database at `db_path` and make sure `base_dir`
    /// exists for blobs.
    pub fn open(db_path: &Path, base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        let conn = Connection::open(db_path)?;
        migrate(&conn)?;

        tracing::info!(
            db = %db_path.display(),
            files = %base_dir.display(),
            "record store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            base_dir,
        })
    }

    /// `<base_dir>/<user_id>/<category>/<sha1_sum>`. No I/O.
    pub fn storage_path(&self, user_id: &str, category: &str, sha1_sum: &str) -> PathBuf {
        self.base_dir.join(user_id).join(category).join(sha1_sum)
    }

    /// Insert the record, or overwrite hash, path, size and timestamp of the
    /// row already holding `(user_id, category, filename)`.
    pub async fn save_record(&self, file: &NewFile<'_>) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();

        self.conn.lock().await.execute(
            "INSERT INTO cloud_files (user_id, category, filename, sha1_sum, storage_path, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, category, filename) DO UPDATE SET
                sha1_sum = excluded.sha1_sum,
                storage_path = excluded.storage_path,
                size = excluded.size,
                created_at = excluded.created_at",
            params![
                file.user_id,
                file.category,
                file.filename,
                file.sha1_sum,
                file.storage_path,
                file.size,
                now
            ],
        )?;

        Ok(())
    }

    /// Look up by content hash. When several filenames in the category share
    /// the hash, the most recently saved one wins.
    pub async fn find_by_identity(
        &self,
        user_id: &str,
        category: &str,
        file_id: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 AND category = ?2 AND sha1_sum = ?3
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );

        let record = self
            .conn
            .lock()
            .await
            .query_row(&sql, params![user_id, category, file_id], row_to_record)
            .optional()?;

        Ok(record)
    }

    pub async fn find_by_filename(
        &self,
        user_id: &str,
        category: &str,
        filename: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND category = ?2 AND filename = ?3");

        let record = self
            .conn
            .lock()
            .await
            .query_row(&sql, params![user_id, category, filename], row_to_record)
            .optional()?;

        Ok(record)
    }

    /// Close the connection. If another clone is still alive the connection
    /// is released when the last one drops instead.
    pub fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.conn) {
            Ok(conn) => conn
                .into_inner()
                .close()
                .map_err(|(_, e)| StoreError::Database(e)),
            Err(_) => {
                tracing::warn!("record store still shared at close");
                Ok(())
            }
        }
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cloud_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            category TEXT NOT NULL,
            filename TEXT NOT NULL,
            sha1_sum TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(user_id, category, filename)
        );
        CREATE INDEX IF NOT EXISTS idx_cloud_files_user_category
            ON cloud_files(user_id, category);",
    )
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: row.get(2)?,
        filename: row.get(3)?,
        sha1_sum: row.get(4)?,
        storage_path: row.get(5)?,
        size: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn open_temp_store(tmp: &TempDir) -> Store {
        Store::open(&tmp.path().join("photobackup.db"), tmp.path().join("files")).unwrap()
    }

    fn new_file<'a>(filename: &'a str, sha1_sum: &'a str, path: &'a str, size: i64) -> NewFile<'a> {
        NewFile {
            user_id: "u1",
            category: "c1",
            filename,
            sha1_sum,
            storage_path: path,
            size,
        }
    }

    async fn row_count(store: &Store) -> i64 {
        store
            .conn
            .lock()
            .await
            .query_row("SELECT COUNT(*) FROM cloud_files", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn open_creates_database_and_blob_dir() {
        let tmp = TempDir::new().unwrap();
        let _store = open_temp_store(&tmp);

        assert!(tmp.path().join("photobackup.db").exists());
        assert!(tmp.path().join("files").is_dir());
    }

    #[test]
    fn reopen_keeps_schema() {
        let tmp = TempDir::new().unwrap();
        open_temp_store(&tmp).close().unwrap();
        open_temp_store(&tmp).close().unwrap();
    }

    #[test]
    fn storage_path_is_partitioned_by_user_and_category() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        let path = store.storage_path("u1", "c1", "abc");
        assert_eq!(path, tmp.path().join("files").join("u1").join("c1").join("abc"));
        assert_eq!(path, store.storage_path("u1", "c1", "abc"));

        assert_ne!(path, store.storage_path("u2", "c1", "abc"));
        assert_ne!(path, store.storage_path("u1", "c2", "abc"));
        assert_ne!(path, store.storage_path("u1", "c1", "abd"));
    }

    #[tokio::test]
    async fn save_then_find_by_hash_and_filename() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        store
            .save_record(&new_file("a.jpg", "h1", "/x/h1", 5))
            .await
            .unwrap();

        let by_hash = store.find_by_identity("u1", "c1", "h1").await.unwrap().unwrap();
        assert_eq!(by_hash.filename, "a.jpg");
        assert_eq!(by_hash.storage_path, "/x/h1");
        assert_eq!(by_hash.size, 5);
        assert!(by_hash.created_at > 0);

        let by_name = store.find_by_filename("u1", "c1", "a.jpg").await.unwrap().unwrap();
        assert_eq!(by_name, by_hash);
    }

    #[tokio::test]
    async fn second_save_for_same_filename_replaces_row() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        store
            .save_record(&new_file("a.jpg", "h1", "/x/h1", 5))
            .await
            .unwrap();
        let first = store.find_by_filename("u1", "c1", "a.jpg").await.unwrap().unwrap();

        store
            .save_record(&new_file("a.jpg", "h2", "/x/h2", 9))
            .await
            .unwrap();

        assert_eq!(row_count(&store).await, 1);
        let second = store.find_by_filename("u1", "c1", "a.jpg").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.sha1_sum, "h2");
        assert_eq!(second.storage_path, "/x/h2");
        assert_eq!(second.size, 9);
        assert!(second.created_at >= first.created_at);

        assert!(store.find_by_identity("u1", "c1", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_saves_for_one_filename_leave_one_row() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let hash = format!("h{i}");
                store
                    .save_record(&new_file("a.jpg", &hash, "/x", i))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn lookups_are_scoped_to_user_and_category() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        store
            .save_record(&new_file("a.jpg", "h1", "/x/h1", 5))
            .await
            .unwrap();

        assert!(store.find_by_identity("u2", "c1", "h1").await.unwrap().is_none());
        assert!(store.find_by_identity("u1", "c2", "h1").await.unwrap().is_none());
        assert!(store.find_by_identity("u1", "c1", "nope").await.unwrap().is_none());
        assert!(store.find_by_filename("u1", "c2", "a.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shared_hash_resolves_to_latest_save() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);

        store
            .save_record(&new_file("a.jpg", "same", "/x/same", 5))
            .await
            .unwrap();
        store
            .save_record(&new_file("copy.jpg", "same", "/x/same", 5))
            .await
            .unwrap();

        let record = store.find_by_identity("u1", "c1", "same").await.unwrap().unwrap();
        assert_eq!(record.filename, "copy.jpg");
    }

    #[tokio::test]
    async fn close_releases_unique_handle() {
        let tmp = TempDir::new().unwrap();
        let store = open_temp_store(&tmp);
        let other = store.clone();

        other.close().unwrap();
        store.close().unwrap();
    }
}
