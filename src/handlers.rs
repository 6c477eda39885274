use crate::db::Store;
use crate::error::{ApiError, Result};
use crate::models::{NewFile, UploadResponse};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use http_body_util::BodyExt;
use serde::Deserialize;
use std::borrow::Cow;
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub fn router(store: Store) -> Router {
    Router::new()
        .route(
            "/api/file/upload",
            put(upload_file).fallback(method_not_allowed),
        )
        .route(
            "/api/file/download",
            get(download_file).fallback(method_not_allowed),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "fileId", default)]
    file_id: Option<String>,
}

/// PUT /api/file/upload
///
/// Headers `userid`, `category`, `sha1sum` and optionally `filename`; the body
/// is the raw file. Responds with `{"fileId": "<sha1sum>"}`.
pub async fn upload_file(
    State(store): State<Store>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>> {
    let user_id = header_str(&headers, "userid");
    let sha1_sum = header_str(&headers, "sha1sum");
    let category = decoded_header(&headers, "category")?;
    let filename = decoded_header(&headers, "filename")?;

    if user_id.is_empty() || category.is_empty() || sha1_sum.is_empty() {
        tracing::warn!(
            user_id,
            category = %category,
            sha1sum = sha1_sum,
            "upload rejected: missing header"
        );
        return Err(ApiError::BadRequest(
            "missing header: userid, category or sha1sum",
        ));
    }
    if ![user_id, category.as_str(), sha1_sum]
        .into_iter()
        .all(is_path_segment)
    {
        tracing::warn!(
            user_id,
            category = %category,
            sha1sum = sha1_sum,
            "upload rejected: header is not a single path segment"
        );
        return Err(ApiError::BadRequest(
            "invalid header: userid, category or sha1sum",
        ));
    }

    let filename = if filename.is_empty() {
        sha1_sum.to_string()
    } else {
        filename
    };

    let storage_path = store.storage_path(user_id, &category, sha1_sum);
    let Some(dir) = storage_path.parent() else {
        tracing::error!(path = %storage_path.display(), "storage path has no parent dir");
        return Err(ApiError::Internal("failed to create storage dir"));
    };
    if let Err(e) = fs::create_dir_all(dir).await {
        tracing::error!(dir = %dir.display(), error = %e, "failed to create storage dir");
        return Err(ApiError::Internal("failed to create storage dir"));
    }

    // Written beside the blob and renamed over it only once complete.
    // Dropping the TempPath removes it.
    let (file, temp_path) = match tempfile::Builder::new()
        .prefix(".upload-")
        .tempfile_in(dir)
    {
        Ok(temp) => temp.into_parts(),
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create file");
            return Err(ApiError::Internal("failed to create file"));
        }
    };

    let size = match write_body(fs::File::from_std(file), body).await {
        Ok(size) => size,
        Err(e) => {
            tracing::error!(path = %storage_path.display(), error = %e, "failed to write file");
            return Err(ApiError::Internal("failed to write file"));
        }
    };

    let existed = fs::try_exists(&storage_path).await.unwrap_or(true);
    if let Err(e) = temp_path.persist(&storage_path) {
        tracing::error!(
            path = %storage_path.display(),
            error = %e.error,
            "failed to move file into place"
        );
        return Err(ApiError::Internal("failed to write file"));
    }

    let storage_path_str = storage_path.to_string_lossy();

    match store.find_by_filename(user_id, &category, &filename).await {
        Ok(Some(previous)) if previous.storage_path != storage_path_str => {
            tracing::info!(
                user_id,
                category = %category,
                filename = %filename,
                previous = %previous.sha1_sum,
                previous_saved_at = previous.created_at,
                "overwrite leaves previous blob on disk"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "could not look up previous record");
        }
    }

    let record = NewFile {
        user_id,
        category: &category,
        filename: &filename,
        sha1_sum,
        storage_path: &storage_path_str,
        size,
    };
    if let Err(e) = store.save_record(&record).await {
        // A blob that was already there may back another record.
        if !existed {
            remove_blob(&storage_path).await;
        }
        tracing::error!(
            user_id,
            category = %category,
            filename = %filename,
            error = %e,
            "failed to save record"
        );
        return Err(ApiError::Internal("failed to save record"));
    }

    tracing::info!(
        user_id,
        category = %category,
        filename = %filename,
        file_id = sha1_sum,
        size,
        "file uploaded"
    );

    Ok(Json(UploadResponse {
        file_id: sha1_sum.to_string(),
    }))
}

/// GET /api/file/download?fileId=<sha1sum>
///
/// Headers `userid`, `category` and optionally `filename`, which overrides
/// the stored name in `Content-Disposition`.
pub async fn download_file(
    State(store): State<Store>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let file_id = query.file_id.unwrap_or_default();
    let user_id = header_str(&headers, "userid");
    let category = decoded_header(&headers, "category")?;
    let filename = decoded_header(&headers, "filename")?;

    if file_id.is_empty() || user_id.is_empty() || category.is_empty() {
        tracing::warn!(
            file_id = %file_id,
            user_id,
            category = %category,
            "download rejected: missing query or header"
        );
        return Err(ApiError::BadRequest(
            "missing query fileId or header: userid, category",
        ));
    }

    let record = match store.find_by_identity(user_id, &category, &file_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::warn!(user_id, category = %category, file_id = %file_id, "file not found");
            return Err(ApiError::NotFound);
        }
        Err(e) => {
            tracing::error!(
                user_id,
                category = %category,
                file_id = %file_id,
                error = %e,
                "record lookup failed"
            );
            return Err(ApiError::Internal("database error"));
        }
    };

    let file = match fs::File::open(&record.storage_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %record.storage_path,
                user_id,
                file_id = %file_id,
                "record has no file on disk"
            );
            return Err(ApiError::NotFound);
        }
        Err(e) => {
            tracing::error!(path = %record.storage_path, error = %e, "failed to open file");
            return Err(ApiError::Internal("failed to open file"));
        }
    };
    let len = file.metadata().await.ok().map(|meta| meta.len());

    let name = if filename.is_empty() {
        record.filename
    } else {
        filename
    };
    let disposition = HeaderValue::from_bytes(format!("attachment; filename={name}").as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::CONTENT_DISPOSITION, disposition);
    if let Some(len) = len {
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    tracing::info!(
        user_id,
        category = %category,
        file_id = %file_id,
        record_id = record.id,
        size = record.size,
        "file download started"
    );
    Ok(response)
}

async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    tracing::warn!(%method, path = uri.path(), "method not allowed");
    ApiError::MethodNotAllowed
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Percent-decodes a header with query-unescape rules: `+` is a space and
/// every `%` must start a two-digit hex escape.
fn decoded_header(headers: &HeaderMap, name: &'static str) -> Result<String> {
    let raw = header_str(headers, name);
    if !has_valid_escapes(raw) {
        tracing::warn!(header = name, value = raw, "header has a malformed percent escape");
        return Err(ApiError::BadRequest("malformed header encoding"));
    }

    urlencoding::decode(&raw.replace('+', " "))
        .map(Cow::into_owned)
        .map_err(|e| {
            tracing::warn!(header = name, error = %e, "header does not decode to utf-8");
            ApiError::BadRequest("malformed header encoding")
        })
}

fn has_valid_escapes(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match bytes.get(i + 1..i + 3) {
                Some([hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => i += 3,
                _ => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

/// Values joined onto the blob directory must not climb out of it.
fn is_path_segment(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

async fn write_body(mut file: fs::File, mut body: Body) -> io::Result<i64> {
    let mut written = 0i64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        if let Ok(chunk) = frame.into_data() {
            file.write_all(&chunk).await?;
            written += chunk.len() as i64;
        }
    }
    file.flush().await?;
    Ok(written)
}

async fn remove_blob(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), error = %e, "failed to remove stored file");
        }
    }
}
