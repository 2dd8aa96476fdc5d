//! Web service that annotates uploaded images with detected objects.
pub mod annotate;
pub mod endpoints;
pub mod errors;
pub mod nn;
pub mod pipeline;
pub mod storage;
pub mod upload;
pub mod utils;

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Router};

use crate::endpoints::{index, upload, AppState};

/// Build the HTTP server with its endpoints.
pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index).post(upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(Extension(state))
}
