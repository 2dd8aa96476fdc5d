//! Decode, resize, detect, annotate and encode a stored upload.
//!
use std::{
    io::{Cursor, Write},
    path::Path,
    sync::Arc,
};

use common::protocol::ImageKind;
use image::{imageops::FilterType, DynamicImage, ImageOutputFormat};
use tempfile::NamedTempFile;

use crate::{annotate::Annotator, errors::ServiceError, nn::Detector};

/// Side length every image is resized to before detection.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

const JPEG_QUALITY: u8 = 95;

/// Fixed processing sequence applied to every upload.
pub struct ImagePipeline {
    detector: Arc<dyn Detector>,
    annotator: Annotator,
    size: u32,
}

impl ImagePipeline {
    pub fn new(detector: Arc<dyn Detector>, annotator: Annotator, size: u32) -> Self {
        Self {
            detector,
            annotator,
            size,
        }
    }

    /// Side length of the square output images.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Process the image at `input` and write the annotated result to `output`.
    ///
    /// The image is squashed to `size` x `size` regardless of its aspect ratio.
    /// The output is encoded as named by its extension and replaces any file at
    /// `output` in one step. Returns the number of detections drawn.
    pub fn process(&self, input: &Path, output: &Path) -> Result<usize, ServiceError> {
        let data = std::fs::read(input).map_err(ServiceError::processing)?;
        let image = image::load_from_memory(&data).map_err(ServiceError::Decode)?;
        log::debug!(
            "Decoded {} ({}x{})",
            input.display(),
            image.width(),
            image.height()
        );

        let resized = image::imageops::resize(
            &image.to_rgb8(),
            self.size,
            self.size,
            FilterType::Triangle,
        );

        let detections = self
            .detector
            .detect(&resized)
            .map_err(ServiceError::Processing)?;
        for detection in detections.iter() {
            log::debug!(
                "{} {:.2} at {:?}",
                &detection.label,
                detection.confidence,
                detection.bbox
            );
        }

        let annotated = self.annotator.annotate(resized, &detections);

        let kind = output
            .file_name()
            .and_then(|name| ImageKind::from_filename(&name.to_string_lossy()))
            .unwrap_or(ImageKind::Jpeg);
        let format = match kind {
            ImageKind::Png => ImageOutputFormat::Png,
            ImageKind::Jpeg => ImageOutputFormat::Jpeg(JPEG_QUALITY),
        };
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(annotated)
            .write_to(&mut buf, format)
            .map_err(ServiceError::processing)?;

        write_replacing(output, buf.get_ref()).map_err(ServiceError::processing)?;
        log::info!(
            "Processed and saved: {} ({} detections)",
            output.display(),
            detections.len()
        );

        Ok(detections.len())
    }
}

/// Write `data` to a temporary file next to `path` and move it over `path`.
fn write_replacing(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
