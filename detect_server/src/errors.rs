//! Error kinds of the upload endpoint and their HTTP mapping.
//!
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Reasons an upload is rejected before anything is stored.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No file part")]
    MissingFilePart,

    #[error("No selected file")]
    EmptyFilename,

    #[error("File type not allowed: {0}")]
    DisallowedFile(String),

    #[error("Malformed upload: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The stored upload is not an image the decoder understands.
    #[error("Unable to read the image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Processing failed: {0:#}")]
    Processing(anyhow::Error),
}

impl ServiceError {
    pub fn processing(err: impl Into<anyhow::Error>) -> Self {
        ServiceError::Processing(err.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ServiceError::Processing(_) => log::error!("{}", &self),
            _ => log::warn!("Rejected upload: {}", &self),
        }

        (status, self.to_string()).into_response()
    }
}
