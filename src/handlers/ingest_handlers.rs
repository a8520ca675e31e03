//! HTTP handlers for chunk upload and artifact serving.
//! Streams request and response bodies to avoid buffering in memory and
//! delegates assembly concerns to `IngestService`.

use crate::{
    errors::AppError,
    models::artifact::IngestionResult,
    services::ingest_service::{ChunkOutcome, IngestService},
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, State,
        multipart::Field,
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::{io, path::PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Response body for `POST /upload`.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IngestionResult>,
}

/// Receive one chunk of a multipart upload at `POST /upload`.
///
/// Follows the resumable.js field layout: `resumableFilename`,
/// `resumableChunkNumber` and `resumableTotalChunks` must precede the binary
/// `file` part so the chunk can be streamed straight into staging.
pub async fn upload_chunk(
    State(service): State<IngestService>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut filename: Option<String> = None;
    let mut chunk_number: Option<u64> = None;
    let mut total_chunks: Option<u64> = None;
    let mut outcome: Option<ChunkOutcome> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("resumableFilename") => {
                filename = Some(text_field(field, "resumableFilename").await?);
            }
            Some("resumableChunkNumber") => {
                chunk_number = Some(numeric_field(field, "resumableChunkNumber").await?);
            }
            Some("resumableTotalChunks") => {
                total_chunks = Some(numeric_field(field, "resumableTotalChunks").await?);
            }
            Some("file") => {
                let identity = filename
                    .as_deref()
                    .ok_or_else(|| missing("resumableFilename"))?;
                let sequence = chunk_number.ok_or_else(|| missing("resumableChunkNumber"))?;
                let expected = total_chunks.ok_or_else(|| missing("resumableTotalChunks"))?;
                if sequence == 0 || expected == 0 {
                    return Err(AppError::bad_request("chunk numbering is 1-based"));
                }

                let stream = field
                    .map(|part| part.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));
                outcome = Some(
                    service
                        .submit_chunk(identity, sequence, expected, stream)
                        .await?,
                );
            }
            _ => {}
        }
    }

    let body = match outcome {
        Some(ChunkOutcome::Completed(result)) => UploadResponse {
            complete: true,
            result: Some(result),
        },
        Some(ChunkOutcome::Pending) => UploadResponse {
            complete: false,
            result: None,
        },
        None => return Err(missing("file")),
    };
    Ok(Json(body).into_response())
}

/// Stream a merged artifact from the output area at `GET /files/{name}`.
pub async fn get_artifact(
    State(service): State<IngestService>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    ensure_plain_file_name(&name)?;
    serve_file(service.output_dir.join(&name), &name).await
}

/// Stream a thumbnail at `GET /thumbnails/{name}`.
pub async fn get_thumbnail(
    State(service): State<IngestService>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    ensure_plain_file_name(&name)?;
    serve_file(service.thumbnail_dir.join(&name), &name).await
}

fn missing(field: &str) -> AppError {
    AppError::bad_request(format!("missing multipart field `{}`", field))
}

async fn text_field(field: Field<'_>, name: &str) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|err| AppError::bad_request(format!("unreadable field `{}`: {}", name, err)))
}

async fn numeric_field(field: Field<'_>, name: &str) -> Result<u64, AppError> {
    let raw = text_field(field, name).await?;
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("field `{}` must be a positive integer", name)))
}

/// Served names are bare generated filenames; anything path-like is treated
/// as absent rather than resolved.
fn ensure_plain_file_name(name: &str) -> Result<(), AppError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(AppError::not_found(format!("no such file `{}`", name)));
    }
    Ok(())
}

async fn serve_file(path: PathBuf, name: &str) -> Result<Response, AppError> {
    let file = File::open(&path).await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            AppError::not_found(format!("no such file `{}`", name))
        } else {
            AppError::internal(err.to_string())
        }
    })?;
    let size = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .len();

    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(name)),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    Ok(response)
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, extension)| extension) {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mp3") => "audio/mpeg",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
