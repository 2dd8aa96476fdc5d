//! Drawing of detections onto images.
//!
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::Scale;

use crate::nn::Detection;

/// Box colors, picked by class ID.
const PALETTE: [[u8; 3]; 10] = [
    [163, 81, 251],
    [255, 64, 64],
    [255, 161, 160],
    [255, 118, 51],
    [255, 182, 51],
    [209, 212, 53],
    [76, 251, 18],
    [148, 207, 26],
    [64, 222, 138],
    [27, 150, 64],
];

/// Space between a label's text and the border of its background.
const LABEL_PADDING: i32 = 2;

/// Draws bounding boxes first and their labels on top.
#[derive(Clone, Debug)]
pub struct Annotator {
    thickness: u32,
    text_scale: f32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            thickness: 2,
            text_scale: 16.0,
        }
    }
}

impl Annotator {
    pub fn new(thickness: u32, text_scale: f32) -> Self {
        Self {
            thickness: thickness.max(1),
            text_scale,
        }
    }

    pub fn annotate(&self, mut frame: RgbImage, detections: &[Detection]) -> RgbImage {
        let (width, height) = frame.dimensions();
        let rects: Vec<_> = detections
            .iter()
            .map(|detection| pixel_rect(&detection.bbox, width, height))
            .collect();

        for (detection, rect) in detections.iter().zip(rects.iter()) {
            if let Some(rect) = rect {
                self.draw_box(&mut frame, *rect, class_color(detection.class_id));
            }
        }

        // Labels go on top so that later boxes never cover them
        for (detection, rect) in detections.iter().zip(rects.iter()) {
            if let Some(rect) = rect {
                self.draw_label(&mut frame, *rect, detection);
            }
        }

        frame
    }

    fn draw_box(&self, frame: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
        for inset in 0..self.thickness {
            let shrink = 2 * inset;
            if rect.width() <= shrink || rect.height() <= shrink {
                break;
            }
            let inner = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
                .of_size(rect.width() - shrink, rect.height() - shrink);
            draw_hollow_rect_mut(frame, inner, color);
        }
    }

    fn draw_label(&self, frame: &mut RgbImage, rect: Rect, detection: &Detection) {
        let (width, height) = (frame.width() as i32, frame.height() as i32);
        let text = format!("{} {:.2}", detection.label, detection.confidence);
        let scale = Scale::uniform(self.text_scale);
        let (text_width, text_height) = text_size(scale, &DEJAVU_MONO, &text);

        let label_width = (text_width + 2 * LABEL_PADDING).clamp(1, width);
        let label_height = (text_height + 2 * LABEL_PADDING).clamp(1, height);

        // Above the box if there is room, else just inside its top edge
        let label_x = rect.left().min(width - label_width).max(0);
        let label_y = match rect.top() - label_height {
            y if y >= 0 => y,
            _ => rect.top().min(height - label_height).max(0),
        };

        let background = class_color(detection.class_id);
        draw_filled_rect_mut(
            frame,
            Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32),
            background,
        );
        draw_text_mut(
            frame,
            text_color(background),
            label_x + LABEL_PADDING,
            label_y + LABEL_PADDING,
            scale,
            &DEJAVU_MONO,
            &text,
        );
    }
}

/// Convert a normalized bounding box to a pixel rectangle inside the image.
///
/// Returns `None` for boxes that are empty after clamping.
fn pixel_rect(bbox: &[f32; 4], width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let (w, h) = (width as f32, height as f32);
    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);

    let x_min = ((bbox[0] * w).floor() as i32).clamp(0, max_x);
    let y_min = ((bbox[1] * h).floor() as i32).clamp(0, max_y);
    let x_max = ((bbox[2] * w).ceil() as i32).clamp(0, max_x);
    let y_max = ((bbox[3] * h).ceil() as i32).clamp(0, max_y);

    if x_min >= x_max || y_min >= y_max {
        return None;
    }

    Some(
        Rect::at(x_min, y_min).of_size((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32),
    )
}

fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Black or white, whichever reads better on `background`.
fn text_color(background: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = background.0;
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    match luma > 150.0 {
        true => Rgb([0, 0, 0]),
        false => Rgb([255, 255, 255]),
    }
}

lazy_static! {
    static ref DEJAVU_MONO: rusttype::Font<'static> = {
        let font_data: &[u8] = include_bytes!("../../resources/DejaVuSansMono.ttf");
        let font: rusttype::Font<'static> =
            rusttype::Font::try_from_bytes(font_data).expect("failed to load font");
        font
    };
}
