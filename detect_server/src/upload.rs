//! Extraction and validation of the uploaded file from a multipart body.
//!
use axum::{body::Bytes, extract::Multipart};
use common::protocol::{allowed_file, secure_filename, FILE_FIELD};

use crate::errors::ValidationError;

/// Image as received from the client, valid for the duration of a request.
#[derive(Debug)]
pub struct UploadedFile {
    /// Sanitized filename with an allowed extension.
    pub filename: String,
    pub data: Bytes,
}

/// Pull the first file part named `file` out of a multipart body.
///
/// Parts without a filename are plain form fields and do not count as a file
/// part. Nothing is read beyond the part that is returned.
pub async fn read_upload(mut multipart: Multipart) -> Result<UploadedFile, ValidationError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ValidationError::MalformedBody(e.to_string()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = match field.file_name() {
            Some(raw) => validate_filename(raw)?,
            None => continue,
        };

        let data = field
            .bytes()
            .await
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

        return Ok(UploadedFile { filename, data });
    }

    Err(ValidationError::MissingFilePart)
}

/// Check a client-supplied filename and reduce it to a safe local name.
pub fn validate_filename(raw: &str) -> Result<String, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptyFilename);
    }

    match secure_filename(raw) {
        Some(name) if allowed_file(name) => Ok(name.to_owned()),
        _ => Err(ValidationError::DisallowedFile(raw.to_owned())),
    }
}
