use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::{Body, Bytes},
    http::{header, Request, StatusCode},
    Router,
};
use detect_server::{
    annotate::Annotator,
    endpoints::AppState,
    nn::{Detection, DetectionSet, Detector, Labels, YoloModel},
    pipeline::{ImagePipeline, DEFAULT_INPUT_SIZE},
    router,
    storage::Storage,
};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "detect-server-test-boundary";
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Detector reporting one fixed object and counting its invocations.
struct CountingDetector {
    calls: AtomicUsize,
}

impl Detector for CountingDetector {
    fn detect(&self, _image: &RgbImage) -> anyhow::Result<DetectionSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Detection {
            bbox: [0.25, 0.25, 0.75, 0.75],
            class_id: 1,
            label: "abnormal".into(),
            confidence: 0.9,
        }])
    }
}

struct TestServer {
    app: Router,
    detector: Arc<CountingDetector>,
    dir: TempDir,
}

impl TestServer {
    fn new(max_upload_bytes: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(CountingDetector {
            calls: AtomicUsize::new(0),
        });

        let storage = Storage::new(dir.path().join("uploads"), dir.path().join("outputs"));
        storage.create_dirs().unwrap();
        let pipeline = ImagePipeline::new(detector.clone(), Annotator::default(), DEFAULT_INPUT_SIZE);
        let state = Arc::new(AppState {
            storage,
            pipeline: Arc::new(pipeline),
        });

        Self {
            app: router(state, max_upload_bytes),
            detector,
            dir,
        }
    }

    fn detector_calls(&self) -> usize {
        self.detector.calls.load(Ordering::SeqCst)
    }

    fn files_in(&self, subdir: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join(subdir))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_owned());
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();

        TestResponse {
            status,
            content_type,
            body,
        }
    }
}

struct TestResponse {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

impl TestResponse {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn image(&self) -> RgbImage {
        image::load_from_memory(&self.body)
            .expect("response is an image")
            .to_rgb8()
    }
}

/// One part of a multipart body.
struct Part<'a> {
    name: &'a str,
    filename: Option<&'a str>,
    data: &'a [u8],
}

fn multipart_request(parts: &[Part]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let disposition = match part.filename {
            Some(filename) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                part.name, filename
            ),
            None => format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                part.name
            ),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn upload_request(filename: &str, data: &[u8]) -> Request<Body> {
    multipart_request(&[Part {
        name: "file",
        filename: Some(filename),
        data,
    }])
}

fn encoded_image(color: [u8; 3], width: u32, height: u32, format: ImageOutputFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
        .write_to(&mut buf, format)
        .unwrap();
    buf.into_inner()
}

fn png(color: [u8; 3]) -> Vec<u8> {
    encoded_image(color, 120, 90, ImageOutputFormat::Png)
}

#[tokio::test]
async fn test_index_serves_upload_form() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = server.send(request).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response
        .content_type
        .as_deref()
        .unwrap()
        .starts_with("text/html"));
    let form = response.text();
    assert!(form.contains("<title>Upload an Image</title>"));
    assert!(form.contains("Chest X-Ray Analysis"));
    assert!(form.contains(r#"enctype="multipart/form-data""#));
    assert!(form.contains(r#"name="file""#));
}

#[tokio::test]
async fn test_missing_file_part() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let other_field = multipart_request(&[Part {
        name: "image",
        filename: Some("scan.png"),
        data: &png([0, 0, 0]),
    }]);
    let response = server.send(other_field).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "No file part");

    // A plain form field called `file` is not a file part
    let form_field = multipart_request(&[Part {
        name: "file",
        filename: None,
        data: b"scan.png",
    }]);
    let response = server.send(form_field).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "No file part");

    assert_eq!(server.detector_calls(), 0);
}

#[tokio::test]
async fn test_non_multipart_body_has_no_file_part() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();

    let response = server.send(request).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "No file part");
}

#[tokio::test]
async fn test_empty_filename() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let response = server.send(upload_request("", b"")).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "No selected file");
    assert_eq!(server.detector_calls(), 0);
}

#[tokio::test]
async fn test_disallowed_extensions_never_reach_the_pipeline() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);
    let data = png([0, 0, 0]);

    for filename in ["notes.txt", "scan.gif", "scan.png.zip", "scan", "scan."] {
        let response = server.send(upload_request(filename, &data)).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{filename}");
        assert_eq!(
            response.text(),
            format!("File type not allowed: {filename}")
        );
    }

    assert_eq!(server.detector_calls(), 0);
    assert!(server.files_in("uploads").is_empty());
    assert!(server.files_in("outputs").is_empty());
}

#[tokio::test]
async fn test_png_upload_is_annotated() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let response = server.send(upload_request("scan.png", &png([30, 30, 30]))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.content_type.as_deref(), Some("image/png"));
    let annotated = response.image();
    assert_eq!(
        annotated.dimensions(),
        (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
    );
    // Left edge of the detected box
    assert_ne!(*annotated.get_pixel(160, 320), Rgb([30, 30, 30]));

    assert_eq!(server.detector_calls(), 1);
    assert_eq!(server.files_in("uploads"), vec!["scan.png"]);
    assert_eq!(server.files_in("outputs"), vec!["annotated_scan.png"]);
}

#[tokio::test]
async fn test_jpeg_upload_is_annotated() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);
    let data = encoded_image([200, 10, 10], 1000, 300, ImageOutputFormat::Jpeg(90));

    let response = server.send(upload_request("Photo.JPEG", &data)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(
        response.image().dimensions(),
        (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
    );
}

#[tokio::test]
async fn test_renamed_text_file_is_rejected_and_server_keeps_serving() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let response = server
        .send(upload_request("notes.jpg", b"definitely not a jpeg"))
        .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(response.text().starts_with("Unable to read the image"));
    assert!(server.files_in("outputs").is_empty());
    assert_eq!(server.detector_calls(), 0);

    let response = server.send(upload_request("scan.png", &png([0, 0, 0]))).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_reupload_overwrites_output() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let first = server.send(upload_request("scan.png", &png([255, 0, 0]))).await;
    let second = server.send(upload_request("scan.png", &png([0, 0, 255]))).await;

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_ne!(first.body, second.body);
    assert_eq!(*first.image().get_pixel(5, 5), Rgb([255, 0, 0]));
    assert_eq!(*second.image().get_pixel(5, 5), Rgb([0, 0, 255]));

    let stored = std::fs::read(server.dir.path().join("outputs/annotated_scan.png")).unwrap();
    assert_eq!(stored, second.body);
    assert_eq!(server.files_in("outputs"), vec!["annotated_scan.png"]);
}

#[tokio::test]
async fn test_files_accumulate_across_uploads() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    for filename in ["a.png", "b.png", "c.png"] {
        let response = server.send(upload_request(filename, &png([1, 2, 3]))).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    assert_eq!(server.files_in("uploads"), vec!["a.png", "b.png", "c.png"]);
    assert_eq!(
        server.files_in("outputs"),
        vec!["annotated_a.png", "annotated_b.png", "annotated_c.png"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_uploads_of_same_name_get_their_own_result() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);
    let (red, blue) = (png([255, 0, 0]), png([0, 0, 255]));

    let (first, second) = tokio::join!(
        server.send(upload_request("scan.png", &red)),
        server.send(upload_request("scan.png", &blue)),
    );

    assert_eq!(*first.image().get_pixel(5, 5), Rgb([255, 0, 0]));
    assert_eq!(*second.image().get_pixel(5, 5), Rgb([0, 0, 255]));
    assert_eq!(server.detector_calls(), 2);
}

#[tokio::test]
async fn test_client_paths_are_stripped_from_filenames() {
    let server = TestServer::new(MAX_UPLOAD_BYTES);

    let response = server
        .send(upload_request("../../escape.png", &png([0, 0, 0])))
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(server.files_in("uploads"), vec!["escape.png"]);
    assert!(!server.dir.path().join("escape.png").exists());
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let server = TestServer::new(1024);
    let data = vec![0_u8; 8 * 1024];

    let response = server.send(upload_request("big.png", &data)).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.text().starts_with("Malformed upload"));
    assert_eq!(server.detector_calls(), 0);
}

/// Run a real YOLO export on a blank image.
#[test]
#[ignore = "needs a YOLO detection model exported to ONNX at model.onnx"]
fn test_yolo_model_640() -> Result<(), Box<dyn std::error::Error>> {
    let model = YoloModel::new(
        "model.onnx",
        DEFAULT_INPUT_SIZE,
        0.25,
        0.7,
        Labels::default(),
    )?;
    assert!(model.num_classes() > 0);

    let detections = model.detect(&RgbImage::new(DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE))?;
    for detection in detections {
        assert!(detection.bbox.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    Ok(())
}
