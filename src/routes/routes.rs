//! Defines routes for the chunk-ingestion service.
//!
//! ## Structure
//! - **Upload endpoint**
//!   - `POST /upload` — receive one chunk (multipart, resumable.js field names)
//!
//! - **Serving endpoints**
//!   - `GET /files/{name}` — stream a merged artifact
//!   - `GET /thumbnails/{name}` — stream an extracted thumbnail
//!
//! All routes allow cross-origin requests; the upload endpoint accepts
//! bodies up to `CHUNK_BODY_LIMIT`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        ingest_handlers::{get_artifact, get_thumbnail, upload_chunk},
    },
    services::ingest_service::IngestService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

/// Upper bound for one multipart request: a single chunk payload plus its
/// form fields.
const CHUNK_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Build and return the router for all ingestion routes.
///
/// The router carries shared state (`IngestService`) to all handlers.
pub fn routes() -> Router<IngestService> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // chunk ingestion
        .route("/upload", post(upload_chunk))
        // merged artifacts and thumbnails
        .route("/files/{name}", get(get_artifact))
        .route("/thumbnails/{name}", get(get_thumbnail))
        .layer(DefaultBodyLimit::max(CHUNK_BODY_LIMIT))
        .layer(cors)
}
