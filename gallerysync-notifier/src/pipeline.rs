use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use gallerysync_core::{CoreError, MAX_TEXT_BYTES, ProcessData};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Inclusive pixel corners of one detected person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// Finds people in a decoded image.
pub trait HumanDetector: Send + Sync + 'static {
    fn detect_humans(&self, image: &DynamicImage) -> Vec<BoundingBox>;
}

/// Finds nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDetector;

impl HumanDetector for NullDetector {
    fn detect_humans(&self, _image: &DynamicImage) -> Vec<BoundingBox> {
        Vec::new()
    }
}

/// Reports `n` people standing side by side, one per vertical strip of the image.
#[derive(Debug, Clone, Copy)]
pub struct FixedCountDetector(pub u64);

impl HumanDetector for FixedCountDetector {
    fn detect_humans(&self, image: &DynamicImage) -> Vec<BoundingBox> {
        let (width, height) = (u64::from(image.width()), u64::from(image.height()));
        if width == 0 || height == 0 {
            return Vec::new();
        }
        let count = self.0;
        (0..count)
            .map(|i| {
                let x1 = i * width / count;
                let x2 = ((i + 1) * width / count).saturating_sub(1).max(x1);
                BoundingBox {
                    x1: x1 as u32,
                    y1: 0,
                    x2: x2 as u32,
                    y2: (height - 1) as u32,
                }
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("text must not be empty")]
    EmptyText,
    #[error("text exceeds {} bytes", MAX_TEXT_BYTES)]
    TextTooLong,
    #[error("invalid image encoding: {0}")]
    Encoding(#[from] CoreError),
    #[error("image decoding failed: {0}")]
    ImageDecode(String),
    #[error("image encoding failed: {0}")]
    ImageEncode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    /// Image with a box drawn around each person, as raw base64 JPEG, no header.
    pub jpeg_base64: String,
    pub human_count: u64,
}

/// Decodes the submitted image, counts humans and re-encodes the result as JPEG.
///
/// CPU bound; callers on the async runtime should run it on the blocking pool.
pub fn process_submission(
    request: &ProcessData,
    detector: &dyn HumanDetector,
) -> Result<ProcessedImage, PipelineError> {
    if request.text.is_empty() {
        return Err(PipelineError::EmptyText);
    }
    if request.text.len() > MAX_TEXT_BYTES {
        return Err(PipelineError::TextTooLong);
    }

    let bytes = request.image.decode()?;
    let image =
        image::load_from_memory(&bytes).map_err(|err| PipelineError::ImageDecode(err.to_string()))?;

    let detections = detector.detect_humans(&image);

    // The JPEG encoder has no alpha support.
    let mut rgb = image.to_rgb8();
    draw_detections(&mut rgb, &detections);

    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .map_err(|err| PipelineError::ImageEncode(err.to_string()))?;

    Ok(ProcessedImage {
        jpeg_base64: STANDARD.encode(&jpeg),
        human_count: detections.len() as u64,
    })
}

/// Outlines each box in place; boxes reaching past the edge are clipped.
fn draw_detections(image: &mut RgbImage, detections: &[BoundingBox]) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    for detection in detections {
        let x1 = detection.x1.min(width - 1);
        let x2 = detection.x2.min(width - 1);
        let y1 = detection.y1.min(height - 1);
        let y2 = detection.y2.min(height - 1);
        if x1 > x2 || y1 > y2 {
            continue;
        }
        for y in y1..=y2 {
            for x in x1..=x2 {
                let on_edge = x - x1 < BOX_THICKNESS
                    || x2 - x < BOX_THICKNESS
                    || y - y1 < BOX_THICKNESS
                    || y2 - y < BOX_THICKNESS;
                if on_edge {
                    image.put_pixel(x, y, BOX_COLOR);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gallerysync_core::TransportEncoding;
    use image::{Rgba, RgbaImage};

    use super::*;

    fn png_request(text: &str) -> ProcessData {
        let image = RgbaImage::from_pixel(4, 4, Rgba([200, 10, 10, 128]));
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        ProcessData {
            text: text.to_owned(),
            image: TransportEncoding::from_bytes("image/png", &png).unwrap(),
        }
    }

    #[test]
    fn transparent_png_comes_back_as_jpeg() {
        let processed = process_submission(&png_request("crowd"), &FixedCountDetector(7)).unwrap();
        assert_eq!(processed.human_count, 7);

        let jpeg = STANDARD.decode(&processed.jpeg_base64).unwrap();
        assert_eq!(&jpeg[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!(
            image::guess_format(&jpeg).unwrap(),
            ImageFormat::Jpeg,
            "re-encoded output should be JPEG"
        );
    }

    #[test]
    fn boxes_are_outlined_and_their_interior_left_alone() {
        let source = RgbImage::from_pixel(20, 20, Rgb([200, 10, 10]));
        let mut annotated = source.clone();
        let detection = BoundingBox {
            x1: 4,
            y1: 4,
            x2: 15,
            y2: 15,
        };
        draw_detections(&mut annotated, &[detection]);

        for (x, y) in [(4, 4), (5, 10), (15, 15), (10, 14)] {
            assert_eq!(annotated.get_pixel(x, y), &BOX_COLOR, "edge pixel ({x}, {y})");
            assert_ne!(annotated.get_pixel(x, y), source.get_pixel(x, y));
        }
        for (x, y) in [(10, 10), (6, 6), (0, 0), (19, 19)] {
            assert_eq!(annotated.get_pixel(x, y), source.get_pixel(x, y), "pixel ({x}, {y})");
        }
    }

    #[test]
    fn boxes_past_the_edge_are_clipped() {
        let mut image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let detection = BoundingBox {
            x1: 2,
            y1: 2,
            x2: 100,
            y2: 100,
        };
        draw_detections(&mut image, &[detection]);
        assert_eq!(image.get_pixel(7, 7), &BOX_COLOR);
        assert_eq!(image.get_pixel(4, 4), &Rgb([0, 0, 0]));
    }

    #[test]
    fn fixed_detector_splits_the_frame_into_strips() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(30, 10));
        let strip = |x1, x2| BoundingBox {
            x1,
            y1: 0,
            x2,
            y2: 9,
        };
        let boxes = FixedCountDetector(3).detect_humans(&image);
        assert_eq!(boxes, vec![strip(0, 9), strip(10, 19), strip(20, 29)]);
        assert!(NullDetector.detect_humans(&image).is_empty());
    }

    #[test]
    fn returned_image_carries_the_annotation() {
        let request = png_request("one person");
        let plain = process_submission(&request, &NullDetector).unwrap();
        let annotated = process_submission(&request, &FixedCountDetector(1)).unwrap();
        assert_eq!(plain.human_count, 0);
        assert_eq!(annotated.human_count, 1);
        assert_ne!(plain.jpeg_base64, annotated.jpeg_base64);

        let decoded = image::load_from_memory(&STANDARD.decode(&annotated.jpeg_base64).unwrap())
            .unwrap()
            .to_rgb8();
        let Rgb([r, g, _]) = *decoded.get_pixel(0, 0);
        assert!(g > r, "corner should be box green, got r={r} g={g}");
    }

    #[test]
    fn undecodable_bytes_fail_with_image_decode() {
        let request = ProcessData {
            text: "noise".to_owned(),
            image: TransportEncoding::from_bytes("image/jpeg", b"definitely not a jpeg").unwrap(),
        };
        let err = process_submission(&request, &NullDetector).unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)), "got {err}");
    }

    #[test]
    fn empty_text_is_rejected_before_decoding() {
        let err = process_submission(&png_request(""), &NullDetector).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyText));
    }
}
