use crate::api::DownloadFileRequest;
use crate::bucket::{BucketId, ParseIdError};
use crate::storage::{BucketGuard, Storage, StorageError};
use crate::tarstream::{self, TarStreamError};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::io::{ReaderStream, SyncIoBridge};

/// Router exposing the inter-peer transfer surface. Non-GET methods get a
/// 405 from the method router.
pub fn router(storage: Arc<Storage>) -> Router {
    Router::new()
        .route("/bucket", get(download_bucket))
        .route("/file", get(download_file))
        .with_state(storage)
}

#[derive(Debug, Deserialize)]
struct BucketQuery {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(rename = "bucket-id")]
    bucket_id: String,
}

/// GET /bucket?id=<hex> streams the whole bucket as a tar archive.
async fn download_bucket(
    State(storage): State<Arc<Storage>>,
    Query(query): Query<BucketQuery>,
) -> Result<Response, ApiError> {
    let id = parse_id(&query.id)?;
    let (path, guard) = storage.get_bucket(&id).await?;
    Ok(tar_response(guard, move |w| tarstream::send_dir(&path, w)))
}

/// GET /file?bucket-id=<hex> with body `{"file": "<relpath>"}` streams the
/// directories leading to the file plus the file itself.
async fn download_file(
    State(storage): State<Arc<Storage>>,
    Query(query): Query<FileQuery>,
    Json(req): Json<DownloadFileRequest>,
) -> Result<Response, ApiError> {
    let id = parse_id(&query.bucket_id)?;
    let (path, guard) = storage.get_bucket(&id).await?;
    Ok(tar_response(guard, move |w| {
        tarstream::send_file(&req.file, &path, w)
    }))
}

fn parse_id(s: &str) -> Result<BucketId, ApiError> {
    s.parse()
        .map_err(|e: ParseIdError| ApiError::BadRequest(e.to_string()))
}

/// Streams a tar archive produced by `send` as the response body. The
/// bucket's read guard moves into the blocking task so the lock is held
/// until the last byte is written (or the peer goes away).
fn tar_response<F>(guard: BucketGuard, send: F) -> Response
where
    F: FnOnce(SyncIoBridge<DuplexStream>) -> Result<(), TarStreamError> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(64 * 1024);

    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        if let Err(e) = send(SyncIoBridge::new(writer)) {
            tracing::error!("tar stream aborted: {e}");
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-tar")],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidId(_) | StorageError::InvalidPath(_) => {
                ApiError::BadRequest(e.to_string())
            }
            StorageError::BucketNotFound(_) | StorageError::FileNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}
