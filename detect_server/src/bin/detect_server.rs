//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    annotate::Annotator,
    endpoints::AppState,
    nn::{Labels, YoloModel},
    pipeline::{ImagePipeline, DEFAULT_INPUT_SIZE},
    router,
    storage::Storage,
    utils::download_file,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the upload form on
    #[clap(long, default_value = "127.0.0.1:5000")]
    server_address: String,

    /// YOLO detection model exported to ONNX
    #[clap(long, default_value = "model.onnx")]
    model: PathBuf,

    /// URL to download the model from if it is not on disk yet
    #[clap(long)]
    model_url: Option<String>,

    /// File with one class label per line, in the model's class order
    #[clap(long)]
    labels: Option<PathBuf>,

    /// Directory to store uploaded images in
    #[clap(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Directory to store annotated images in
    #[clap(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// Side length images are resized to before detection
    #[clap(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,

    /// Minimum class score for a detection to be kept
    #[clap(long, default_value_t = 0.25)]
    min_confidence: f32,

    /// Maximum overlap of two detections of the same class
    #[clap(long, default_value_t = 0.7)]
    max_iou: f32,

    /// Maximum size of an upload request in bytes
    #[clap(long, default_value_t = 16 * 1024 * 1024)]
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Fetch the model on first start
    if let Some(url) = &args.model_url {
        if !args.model.exists() {
            download_file(&reqwest::Client::new(), url, &args.model).await?;
        }
    }

    let labels = match &args.labels {
        Some(path) => Labels::from_file(path)?,
        None => Labels::default(),
    };

    // Build detector and processing pipeline shared by all requests
    let model = YoloModel::new(
        &args.model,
        args.input_size,
        args.min_confidence,
        args.max_iou,
        labels,
    )?;
    let pipeline = ImagePipeline::new(Arc::new(model), Annotator::default(), args.input_size);
    log::info!(
        "Annotating uploads at {}x{}",
        pipeline.size(),
        pipeline.size()
    );

    let storage = Storage::new(&args.upload_dir, &args.output_dir);
    storage.create_dirs()?;

    let state = Arc::new(AppState {
        storage,
        pipeline: Arc::new(pipeline),
    });
    let app = router(state, args.max_upload_bytes);

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Listening on http://{}", &addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
