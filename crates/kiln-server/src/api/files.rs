//! File API routes
//!
//! Upload streams the multipart body straight into the blob store, hashing
//! as it goes; batch inputs are then validated line-by-line before the row
//! is committed. Download streams the blob back unchanged.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::ReaderStream;

use kiln_core::error::{Error, ErrorCode};
use kiln_core::models::jsonl::Validator;
use kiln_core::models::wire::{FileDeleted, FileObject};
use kiln_core::models::{new_file_id, FilePurpose, FileRecord};

use crate::api::rate_headers;
use crate::error::ApiError;
use crate::middleware::RequestId;
use crate::ratelimit::client_ip;
use crate::state::AppState;

/// File routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_files).post(upload_file))
        .route("/:id", get(get_file).delete(delete_file))
        .route("/:id/content", get(download_file))
}

/// Upload a file (multipart: `file`, `purpose`)
async fn upload_file(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let ip = client_ip(&headers, peer.map(|p| p.0.ip()), state.cfg.trust_forwarded_for);
    let decision = state
        .limiter
        .check("files", ip, state.cfg.rate_limit_files_per_min);
    if !decision.allowed {
        state.metrics.rate_limited.with_label_values(&["files"]).inc();
        return Err(ApiError::rate_limited(&decision).with_request_id(&rid.0));
    }

    let mut purpose: Option<String> = None;
    let mut filename = "upload.jsonl".to_string();
    let mut handle = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&rid, format!("multipart: {}", e)))?
    {
        match field.name() {
            Some("purpose") => {
                purpose = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| bad_request(&rid, format!("purpose field: {}", e)))?,
                );
            }
            Some("file") => {
                if let Some(name) = field.file_name() {
                    filename = name.to_string();
                }
                let mut writer = state
                    .blobs
                    .writer()
                    .await
                    .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;
                loop {
                    let chunk = field
                        .chunk()
                        .await
                        .map_err(|e| bad_request(&rid, format!("upload stream: {}", e)))?;
                    let Some(chunk) = chunk else { break };
                    if writer.bytes_written() + chunk.len() as u64 > state.cfg.max_file_bytes {
                        writer.abort().await.ok();
                        return Err(ApiError::new(
                            ErrorCode::TooLarge,
                            format!("file exceeds {} bytes", state.cfg.max_file_bytes),
                        )
                        .with_request_id(&rid.0));
                    }
                    writer
                        .write_chunk(&chunk)
                        .await
                        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;
                }
                handle = Some(
                    writer
                        .finish()
                        .await
                        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?,
                );
            }
            _ => {}
        }
    }

    let handle = handle.ok_or_else(|| bad_request(&rid, "missing file part"))?;
    let purpose = purpose.ok_or_else(|| bad_request(&rid, "missing purpose part"))?;
    match FilePurpose::parse(&purpose) {
        Some(FilePurpose::BatchInput) => {}
        _ => {
            state.blobs.delete(&handle.blob_ref).await.ok();
            return Err(bad_request(&rid, format!("unsupported purpose {:?}", purpose)));
        }
    }

    // Batch inputs are validated in full; one bad line rejects the file.
    let validated = match validate_blob(&state, &handle.blob_ref).await {
        Ok(v) => v,
        Err(e) => {
            if state
                .db
                .files_with_blob_ref(&handle.blob_ref)
                .await
                .map(|n| n == 0)
                .unwrap_or(false)
            {
                state.blobs.delete(&handle.blob_ref).await.ok();
            }
            return Err(ApiError::from(e).with_request_id(&rid.0));
        }
    };

    let record = FileRecord {
        id: new_file_id(),
        purpose: FilePurpose::BatchInput.as_str().to_string(),
        filename,
        bytes: handle.bytes as i64,
        blob_ref: handle.blob_ref,
        line_count: validated.total_requests as i64,
        model: Some(validated.model),
        created_at: Utc::now(),
        expires_at: None,
    };
    state
        .db
        .insert_file(&record)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;

    tracing::info!(
        file_id = %record.id,
        bytes = record.bytes,
        lines = record.line_count,
        "file uploaded"
    );

    Ok((rate_headers(&decision), Json(FileObject::from(&record))))
}

async fn validate_blob(
    state: &AppState,
    blob_ref: &str,
) -> kiln_core::Result<kiln_core::models::jsonl::ValidatedInput> {
    let reader = state.blobs.open_reader(blob_ref).await?;
    let mut lines = BufReader::new(reader).lines();
    let mut validator = Validator::new();
    while let Some(line) = lines.next_line().await? {
        validator.push_line(&line)?;
    }
    validator.finish()
}

#[derive(Serialize)]
struct FileList {
    object: &'static str,
    data: Vec<FileObject>,
}

/// List files, newest first
async fn list_files(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    let files = state
        .db
        .list_files(100)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;
    let data = files.iter().map(FileObject::from).collect();
    Ok(Json(FileList { object: "list", data }))
}

/// File metadata
async fn get_file(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let file = state
        .db
        .get_file(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?
        .ok_or_else(|| not_found(&rid, &id))?;
    Ok(Json(FileObject::from(&file)))
}

/// Stream raw file content
async fn download_file(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let file = state
        .db
        .get_file(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?
        .ok_or_else(|| not_found(&rid, &id))?;

    let reader = state
        .blobs
        .open_reader(&file.blob_ref)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;

    let body = Body::from_stream(ReaderStream::new(reader));
    let resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/jsonl")
        .header(header::CONTENT_LENGTH, file.bytes)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.filename),
        )
        .body(body)
        .map_err(|e| {
            ApiError::from(Error::internal(format!("response build: {}", e))).with_request_id(&rid.0)
        })?;
    Ok(resp)
}

/// Delete a file; refused while a non-terminal job references it
async fn delete_file(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .db
        .delete_file(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid.0))?;

    // Blob removal is best-effort, and only when no other row shares it
    if let Ok(0) = state.db.files_with_blob_ref(&record.blob_ref).await {
        state.blobs.delete(&record.blob_ref).await.ok();
    }

    tracing::info!(file_id = %id, "file deleted");
    Ok(Json(FileDeleted { id, object: "file".to_string(), deleted: true }))
}

fn bad_request(rid: &RequestId, msg: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::ValidationError, msg).with_request_id(&rid.0)
}

fn not_found(rid: &RequestId, id: &str) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("file {} not found", id)).with_request_id(&rid.0)
}
