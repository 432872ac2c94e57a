//! Object detection capability and frame annotation
//!
//! The detection model itself lives outside this crate. A worker is handed an
//! optional [`Detector`]; without one it streams frames unannotated.

use image::{Rgb, RgbImage};

use crate::capture::Frame;

/// Error returned by a detector implementation
pub type DetectError = Box<dyn std::error::Error + Send + Sync>;

/// Box color for annotations
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Box line thickness in pixels
pub const BOX_THICKNESS: i32 = 2;

/// One detected object
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    /// Bounding box as `[x1, y1, x2, y2]` in pixel coordinates
    pub bbox: [i32; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f32, bbox: [i32; 4]) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }
}

/// Open-vocabulary detector
///
/// Called from a blocking thread once per capture cycle with the label set
/// active at the start of that cycle.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame, labels: &[String]) -> Result<Vec<Detection>, DetectError>;
}

/// Draw a box per detection onto the image
///
/// Boxes are clamped to the image bounds; degenerate boxes still mark at
/// least one pixel.
pub fn annotate(image: &mut RgbImage, detections: &[Detection]) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }

    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                image,
                x1.min(x2) + inset,
                y1.min(y2) + inset,
                x1.max(x2) - inset,
                y1.max(y2) - inset,
                BOX_COLOR,
            );
        }
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1).max(left);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1).max(top);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_draws_two_pixel_border() {
        let mut image = RgbImage::new(20, 20);
        annotate(&mut image, &[Detection::new("a box", 0.9, [4, 4, 15, 15])]);

        assert_eq!(*image.get_pixel(4, 4), BOX_COLOR);
        assert_eq!(*image.get_pixel(5, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(15, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(14, 14), BOX_COLOR);
        // Interior and exterior untouched
        assert_eq!(*image.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(3, 3), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(6, 6), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_clamps_out_of_bounds() {
        let mut image = RgbImage::new(10, 10);
        annotate(&mut image, &[Detection::new("edge", 0.5, [-50, -50, 500, 500])]);

        assert_eq!(*image.get_pixel(0, 0), BOX_COLOR);
        assert_eq!(*image.get_pixel(9, 9), BOX_COLOR);
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_accepts_inverted_box() {
        let mut image = RgbImage::new(10, 10);
        annotate(&mut image, &[Detection::new("flip", 0.5, [8, 8, 2, 2])]);

        assert_eq!(*image.get_pixel(2, 2), BOX_COLOR);
        assert_eq!(*image.get_pixel(8, 8), BOX_COLOR);
    }
}
