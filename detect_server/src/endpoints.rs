//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::{multipart::MultipartRejection, Multipart},
    http::header,
    response::{Html, IntoResponse, Response},
    Extension,
};
use common::protocol::ImageKind;
use tokio_util::io::ReaderStream;

use crate::{
    errors::{ServiceError, ValidationError},
    pipeline::ImagePipeline,
    storage::Storage,
    upload::read_upload,
};

/// Process-wide handles shared by all requests.
pub struct AppState {
    pub storage: Storage,
    pub pipeline: Arc<ImagePipeline>,
}

/// Upload form endpoint.
pub async fn index() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

/// Upload endpoint: store the image, annotate it and send the result back.
pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ServiceError> {
    let multipart = multipart.map_err(|rejection| {
        log::debug!("Request without multipart body: {}", rejection);
        ValidationError::MissingFilePart
    })?;
    let upload = read_upload(multipart).await?;
    log::info!(
        "Received {} ({} bytes)",
        &upload.filename,
        upload.data.len()
    );

    // Uploads with the same name share their input and output files
    let _guard = state.storage.lock(&upload.filename).await;

    let input = state
        .storage
        .store_upload(&upload.filename, &upload.data)
        .await
        .map_err(ServiceError::processing)?;
    let output = state.storage.output_path(&upload.filename);

    {
        let pipeline = Arc::clone(&state.pipeline);
        let output = output.clone();
        tokio::task::spawn_blocking(move || pipeline.process(&input, &output))
            .await
            .map_err(ServiceError::processing)??;
    }

    let file = tokio::fs::File::open(&output)
        .await
        .map_err(ServiceError::processing)?;
    let kind = ImageKind::from_filename(&upload.filename).unwrap_or(ImageKind::Jpeg);

    let body = StreamBody::new(ReaderStream::new(file));
    let headers = [(header::CONTENT_TYPE, kind.mime_type())];

    Ok((headers, body).into_response())
}

const UPLOAD_FORM: &str = r#"<!doctype html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Upload an Image</title>
    <style>
        body {
            font-family: Arial, sans-serif;
            background-color: #f1f1f1;
            margin: 0;
        }
        header {
            background-color: #333;
            color: white;
            padding: 20px;
            text-align: center;
            font-size: 24px;
        }
        .container {
            max-width: 800px;
            margin: 40px auto;
            background-color: white;
            padding: 20px;
            border-radius: 8px;
            box-shadow: 0 4px 6px rgba(0, 0, 0, 0.1);
        }
        .upload-form {
            display: flex;
            flex-direction: column;
            align-items: center;
        }
        input[type="file"] {
            margin-bottom: 20px;
            padding: 10px;
            border: 1px solid #ddd;
            border-radius: 5px;
        }
        input[type="submit"] {
            padding: 15px 30px;
            background-color: #4CAF50;
            color: white;
            border: none;
            border-radius: 5px;
            font-size: 18px;
            cursor: pointer;
        }
    </style>
</head>
<body>
    <header>AI-Powered Chest X-Ray Analysis: Normal or Abnormal?</header>
    <div class="container">
        <h1>Upload an Image Chest X-Ray AI Detection: Normal vs Abnormal</h1>
        <form class="upload-form" method="POST" enctype="multipart/form-data">
            <input type="file" name="file" accept="image/png,image/jpeg" required>
            <input type="submit" value="Upload Image">
        </form>
    </div>
</body>
</html>
"#;
