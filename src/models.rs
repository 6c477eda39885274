use serde::Serialize;

/// One stored file, keyed by `(user_id, category, filename)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: String,
    pub category: String,
    pub filename: String,
    /// Hex SHA-1 supplied by the client. Doubles as the public `fileId`.
    pub sha1_sum: String,
    pub storage_path: String,
    pub size: i64,
    /// Unix seconds of the first save or the latest overwrite.
    pub created_at: i64,
}

/// Fields written by an upload. The store stamps `id` and `created_at`.
#[derive(Debug, Clone, Copy)]
pub struct NewFile<'a> {
    pub user_id: &'a str,
    pub category: &'a str,
    pub filename: &'a str,
    pub sha1_sum: &'a str,
    pub storage_path: &'a str,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "fileId")]
    pub file_id: String,
}
