use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::protocol::{allowed_file, output_file_name, ImageKind, FILE_FIELD};
use env_logger::TimestampPrecision;
use reqwest::multipart;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the detect server to upload to
    #[clap(long, default_value = "127.0.0.1:5000")]
    address: String,

    /// Image to annotate
    image: PathBuf,

    /// Where to save the annotated image, next to the input by default
    #[clap(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let filename = file_name(&args.image)?;
    if !allowed_file(&filename) {
        bail!("{} is not a png or jpeg image", &filename);
    }

    let data = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("reading {}", args.image.display()))?;
    log::info!("Uploading {} ({} bytes)", &filename, data.len());

    let mime = ImageKind::from_filename(&filename)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream");
    let part = multipart::Part::bytes(data)
        .file_name(filename.clone())
        .mime_str(mime)?;
    let form = multipart::Form::new().part(FILE_FIELD, part);

    let response = reqwest::Client::new()
        .post(&format!("http://{}/", &args.address))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        bail!("Server answered {}: {}", status, message);
    }

    let annotated = response.bytes().await?;
    let output = args
        .output
        .unwrap_or_else(|| default_output(&args.image, &filename));
    tokio::fs::write(&output, &annotated)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("Saved annotated image to {}", output.display());

    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn default_output(image: &Path, filename: &str) -> PathBuf {
    image.with_file_name(output_file_name(filename))
}
