//! Object detection with a YOLO model exported to ONNX.
//!
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use ndarray::{s, Axis, Ix2};
use smallvec::SmallVec;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type NnOut = SmallVec<[TValue; 4]>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Upper bound of detections kept per image after non-maximum-suppression.
const MAX_DETECTIONS: usize = 300;

/// A single predicted object on an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_min, y_min, x_max, y_max]`, normalized to the image size.
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

/// All detections of one image, most confident first.
pub type DetectionSet = Vec<Detection>;

/// Anything that finds objects on an image.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<DetectionSet>;
}

/// Class names in the order of the model's class outputs.
#[derive(Clone, Debug, Default)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Parse one label per line, ignoring blank lines.
    pub fn parse(content: &str) -> Self {
        let names = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Self { names }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of a class, falling back to `class <id>` for unknown IDs.
    pub fn name(&self, class_id: usize) -> String {
        match self.names.get(class_id) {
            Some(name) => name.clone(),
            None => format!("class {class_id}"),
        }
    }
}

/// YOLO (v8 layout) detector running on `tract`.
///
/// The model takes a `[1, 3, size, size]` RGB tensor scaled to `[0, 1]` and
/// produces one prediction per anchor: `cx, cy, w, h` in input pixels followed
/// by one score per class.
pub struct YoloModel {
    model: NnModel,
    size: u32,
    min_confidence: f32,
    max_iou: f32,
    labels: Labels,
    num_classes: usize,
}

impl YoloModel {
    pub fn new(
        path: impl AsRef<Path>,
        size: u32,
        min_confidence: f32,
        max_iou: f32,
        labels: Labels,
    ) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading detection model from {}", path.display());
        let model = get_yolo_model(path, size)?;

        let mut yolo = Self {
            model,
            size,
            min_confidence,
            max_iou,
            labels,
            num_classes: 0,
        };

        // A dry run reveals how many classes the model scores
        let blank = RgbImage::new(size, size);
        let raw_nn_out = yolo.model.run(tvec!(yolo.preproc(&blank).into()))?;
        let (num_attributes, _) = prediction_layout(first_output(&raw_nn_out)?)?;
        yolo.num_classes = num_attributes - 4;

        log::info!("Model scores {} classes", yolo.num_classes);
        if !yolo.labels.is_empty() && yolo.labels.len() != yolo.num_classes {
            log::warn!(
                "Got {} labels for a model with {} classes",
                yolo.labels.len(),
                yolo.num_classes
            );
        }

        Ok(yolo)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let (width, height) = (self.size, self.size);
        let resized;
        let image = if input.dimensions() == (width, height) {
            input
        } else {
            resized = image::imageops::resize(
                input,
                width,
                height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        };

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width as usize),
            |(_, c, y, x)| image[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }

    fn postproc(&self, raw_nn_out: NnOut) -> Result<DetectionSet> {
        let preds = first_output(&raw_nn_out)?;
        let candidates = decode_predictions(preds, self.size as f32, self.min_confidence)?;
        let selected = non_maximum_suppression(candidates, self.max_iou, MAX_DETECTIONS);

        Ok(selected
            .into_iter()
            .map(|candidate| Detection {
                bbox: candidate.bbox,
                class_id: candidate.class_id,
                label: self.labels.name(candidate.class_id),
                confidence: candidate.confidence,
            })
            .collect())
    }
}

impl Detector for YoloModel {
    fn detect(&self, image: &RgbImage) -> Result<DetectionSet> {
        let valid_input = tvec!(self.preproc(image).into());
        let raw_nn_out = self.model.run(valid_input)?;
        let detections = self.postproc(raw_nn_out)?;
        log::debug!("Detected {} objects", detections.len());

        Ok(detections)
    }
}

fn get_yolo_model(path: &Path, size: u32) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, size as usize, size as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load model {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

fn first_output(raw_nn_out: &NnOut) -> Result<tract_ndarray::ArrayViewD<'_, f32>> {
    raw_nn_out
        .first()
        .ok_or_else(|| anyhow!("model produced no output"))?
        .to_array_view::<f32>()
}

/// Return `(attributes, anchors)` of a `[1, attributes, anchors]` prediction
/// tensor, accepting the transposed `[1, anchors, attributes]` layout as well.
fn prediction_layout(preds: tract_ndarray::ArrayViewD<f32>) -> Result<(usize, usize)> {
    let shape = preds.shape();
    if shape.len() != 3 || shape[0] != 1 {
        bail!("unexpected model output shape {:?}", shape);
    }
    let (attributes, anchors) = if shape[1] > shape[2] {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if attributes <= 4 {
        bail!("model output has no class scores: shape {:?}", shape);
    }

    Ok((attributes, anchors))
}

/// Candidate box before non-maximum-suppression.
#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    bbox: [f32; 4],
    class_id: usize,
    confidence: f32,
}

/// Turn raw predictions into candidates scoring above `min_confidence`.
///
/// Every anchor keeps only its best class. Boxes are converted from center
/// format in input pixels to normalized corner format, clamped to the image.
fn decode_predictions(
    preds: tract_ndarray::ArrayViewD<f32>,
    size: f32,
    min_confidence: f32,
) -> Result<Vec<Candidate>> {
    let (attributes, _) = prediction_layout(preds.view())?;
    let preds = preds.index_axis_move(Axis(0), 0).into_dimensionality::<Ix2>()?;
    // Rows are attributes and columns anchors
    let preds = if preds.nrows() == attributes {
        preds
    } else {
        preds.reversed_axes()
    };

    let mut candidates = vec![];
    for anchor in preds.columns() {
        let (class_id, confidence) = anchor.slice(s![4..]).iter().enumerate().fold(
            (0, f32::MIN),
            |best, (class_id, &score)| match score > best.1 {
                true => (class_id, score),
                false => best,
            },
        );
        if confidence <= min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        let bbox = [
            (cx - w / 2.0) / size,
            (cy - h / 2.0) / size,
            (cx + w / 2.0) / size,
            (cy + h / 2.0) / size,
        ]
        .map(|v| v.clamp(0.0, 1.0));

        candidates.push(Candidate {
            bbox,
            class_id,
            confidence,
        });
    }

    Ok(candidates)
}

/// Run class-aware non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident candidate and walk the others in the order of
/// sinking confidence. A candidate is selected unless it overlaps an already
/// selected box of the same class with an IoU above `max_iou`. At most
/// `max_detections` boxes are returned.
fn non_maximum_suppression(
    mut candidates: Vec<Candidate>,
    max_iou: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Candidate> = vec![];
    'candidates: while let Some(candidate) = candidates.pop() {
        if selected.len() >= max_detections {
            break;
        }

        for chosen in selected.iter() {
            if chosen.class_id == candidate.class_id && iou(&candidate.bbox, &chosen.bbox) > max_iou
            {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // Boxes without overlap give an ill-defined overlap box with zero area
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
/// If the bottom-right point lies above or left of the top-left point, the
/// area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
