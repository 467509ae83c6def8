//! Frame overlays

use std::path::{Path, PathBuf};

use camera_capture::VideoFrame;
use dms::DrowsinessAnalysis;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use inference_engine::Classification;
use tracing::{debug, warn};

use crate::glyphs::{draw_text, text_width, GLYPH_HEIGHT};
use crate::log::SinkError;
use crate::severity::{Severity, SeverityMap};

const MARGIN: u32 = 10;
const BOX_WIDTH: u32 = 320;
const BOX_HEIGHT: u32 = 70;
const STRIPE_HEIGHT: u32 = 4;
const BAR_HEIGHT: u32 = 6;
const LABEL_SCALE: u32 = 2;
const BANNER_SCALE: u32 = 3;
/// Weight of the tint in the status box
const BOX_ALPHA: f32 = 0.7;
const BANNER_ALPHA: f32 = 0.75;

const TRACK: Rgb<u8> = Rgb([60, 60, 60]);
const EAR_FILL: Rgb<u8> = Rgb([0, 120, 255]);
const TICK: Rgb<u8> = Rgb([255, 255, 255]);
const EYE_CONTOUR: Rgb<u8> = Rgb([0, 255, 0]);
const BANNER: Rgb<u8> = Rgb([230, 0, 0]);
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const WAITING_TEXT: &str = "WAITING";
const DROWSY_TEXT: &str = "DROWSY";

/// What to draw on one frame
#[derive(Debug, Clone, Copy, Default)]
pub struct Overlay<'a> {
    /// Latest published classification; `None` shows the waiting state
    pub classification: Option<&'a Classification>,
    /// Drowsiness result for this frame (behavior profile only)
    pub drowsiness: Option<&'a DrowsinessAnalysis>,
    pub ear_threshold: f32,
}

/// Draws classification and drowsiness state onto frames.
///
/// Rendering never touches the input frame: the same frame and overlay always
/// produce the same bytes.
#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer {
    severities: SeverityMap,
}

impl OverlayRenderer {
    pub fn new(severities: SeverityMap) -> Self {
        Self { severities }
    }

    pub fn severity(&self, overlay: &Overlay<'_>) -> Severity {
        self.severities
            .severity_of(overlay.classification.map(|c| c.label.as_str()))
    }

    pub fn render(&self, frame: &VideoFrame, overlay: &Overlay<'_>) -> VideoFrame {
        let Some(mut image) = frame.to_image() else {
            warn!(
                "Frame {} has {} bytes for {}x{}, drawn without overlay",
                frame.sequence,
                frame.data.len(),
                frame.width,
                frame.height
            );
            return frame.clone();
        };

        let severity = self.severity(overlay);
        let (width, height) = image.dimensions();
        let box_w = BOX_WIDTH.min(width.saturating_sub(2 * MARGIN));
        let box_h = BOX_HEIGHT.min(height / 3);

        // Status box
        blend_rect(&mut image, MARGIN, MARGIN, box_w, box_h, severity.background(), BOX_ALPHA);
        fill(&mut image, MARGIN, MARGIN, box_w, STRIPE_HEIGHT.min(box_h), severity.color());

        // Confidence bar
        let bar_w = box_w.saturating_sub(16);
        let bar_y = (MARGIN + box_h).saturating_sub(BAR_HEIGHT + 8);

        // Label and confidence, when there is room above the bar
        let text_y = MARGIN + STRIPE_HEIGHT + 8;
        if text_y + GLYPH_HEIGHT * LABEL_SCALE <= bar_y {
            let text = match overlay.classification {
                Some(c) => format!("{} {:.0}%", c.label, c.confidence.clamp(0.0, 1.0) * 100.0),
                None => WAITING_TEXT.to_string(),
            };
            draw_text(&mut image, MARGIN + 8, text_y, &text, LABEL_SCALE, bar_w, TEXT);
        }
        fill(&mut image, MARGIN + 8, bar_y, bar_w, BAR_HEIGHT, TRACK);
        if let Some(classification) = overlay.classification {
            let filled = (bar_w as f32 * classification.confidence.clamp(0.0, 1.0)).round() as u32;
            fill(&mut image, MARGIN + 8, bar_y, filled, BAR_HEIGHT, severity.color());
        }

        if let Some(analysis) = overlay.drowsiness {
            self.draw_drowsiness(&mut image, analysis, overlay.ear_threshold, box_w, box_h);
        }

        debug!("Rendered frame {} with {:?} overlay", frame.sequence, severity);
        VideoFrame::from_image(image, frame.timestamp_ns, frame.sequence)
    }

    fn draw_drowsiness(
        &self,
        image: &mut RgbImage,
        analysis: &DrowsinessAnalysis,
        ear_threshold: f32,
        box_w: u32,
        box_h: u32,
    ) {
        let (width, height) = image.dimensions();

        // EAR gauge: full scale is twice the threshold, tick marks the threshold
        let gauge_y = MARGIN + box_h + 6;
        fill(image, MARGIN, gauge_y, box_w, BAR_HEIGHT, TRACK);
        if let Some(ear) = analysis.ear {
            let full_scale = (2.0 * ear_threshold).max(f32::EPSILON);
            let filled = (box_w as f32 * (ear / full_scale).clamp(0.0, 1.0)).round() as u32;
            fill(image, MARGIN, gauge_y, filled, BAR_HEIGHT, EAR_FILL);
        }
        fill(image, MARGIN + box_w / 2, gauge_y.saturating_sub(2), 2, BAR_HEIGHT + 4, TICK);

        if let Some(eyes) = analysis.eyes {
            for contour in [eyes.left, eyes.right] {
                for i in 0..contour.len() {
                    let a = contour[i];
                    let b = contour[(i + 1) % contour.len()];
                    draw_line_segment_mut(image, (a.x, a.y), (b.x, b.y), EYE_CONTOUR);
                }
            }
        }

        if analysis.is_alerting() {
            let banner_h = (height / 6).max(1);
            let banner_y = (height / 2).saturating_sub(banner_h / 2);
            blend_rect(image, 0, banner_y, width, banner_h, BANNER, BANNER_ALPHA);
            fill(image, 0, banner_y, width, 3.min(banner_h), BANNER);
            fill(image, 0, (banner_y + banner_h).saturating_sub(3), width, 3.min(banner_h), BANNER);

            let text_h = GLYPH_HEIGHT * BANNER_SCALE;
            if banner_h >= text_h + 8 {
                let text_w = text_width(DROWSY_TEXT, BANNER_SCALE);
                let x = width.saturating_sub(text_w) / 2;
                let y = banner_y + (banner_h - text_h) / 2;
                draw_text(image, x, y, DROWSY_TEXT, BANNER_SCALE, width, TEXT);
            }
        }
    }
}

/// Write a rendered frame as `frame_NNNNNN.png` under `dir`
pub fn write_png(frame: &VideoFrame, dir: &Path) -> Result<PathBuf, SinkError> {
    let path = dir.join(format!("frame_{:06}.png", frame.sequence));
    let image = frame.to_image().ok_or_else(|| SinkError::Image {
        path: path.clone(),
        reason: "frame buffer does not match its dimensions".into(),
    })?;
    image.save(&path).map_err(|e| SinkError::Image {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    Ok(path)
}

/// Solid rectangle, clipped; zero-sized rectangles are skipped
fn fill(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    if w == 0 || h == 0 {
        return;
    }
    draw_filled_rect_mut(image, Rect::at(x as i32, y as i32).of_size(w, h), color);
}

/// `alpha * color + (1 - alpha) * pixel` over a clipped rectangle
fn blend_rect(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>, alpha: f32) {
    let (width, height) = image.dimensions();
    for py in y..y.saturating_add(h).min(height) {
        for px in x..x.saturating_add(w).min(width) {
            let pixel = image.get_pixel_mut(px, py);
            for c in 0..3 {
                let mixed = alpha * color.0[c] as f32 + (1.0 - alpha) * pixel.0[c] as f32;
                pixel.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use dms::{DrowsinessState, LandmarkSet, Point};

    fn classification(label: &str, confidence: f32) -> Classification {
        Classification {
            label: label.to_string(),
            class_index: 0,
            confidence,
            completed_at: Local::now(),
            finished: std::time::Instant::now(),
            frame_sequence: 1,
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame::solid(400, 300, [128, 128, 128], 1_000, 3)
    }

    #[test]
    fn test_render_is_idempotent() {
        let renderer = OverlayRenderer::new(SeverityMap::crash());
        let result = classification("CRASH", 0.9);
        let overlay = Overlay {
            classification: Some(&result),
            ..Default::default()
        };
        let input = frame();
        let first = renderer.render(&input, &overlay);
        let second = renderer.render(&input, &overlay);
        assert_eq!(first, second);
        assert_eq!(input, frame());
        assert_eq!(first.sequence, 3);
        assert_eq!(first.timestamp_ns, 1_000);
    }

    #[test]
    fn test_stripe_uses_severity_color() {
        let renderer = OverlayRenderer::new(SeverityMap::crash());
        let normal = classification("NORMAL", 0.5);

        let waiting = renderer.render(&frame(), &Overlay::default());
        assert_eq!(waiting.get_pixel(MARGIN + 1, MARGIN + 1), Some(Severity::Pending.color().0));

        let rendered = renderer.render(
            &frame(),
            &Overlay {
                classification: Some(&normal),
                ..Default::default()
            },
        );
        assert_eq!(rendered.get_pixel(MARGIN + 1, MARGIN + 1), Some(Severity::Safe.color().0));
        // Outside the box the frame is untouched
        assert_eq!(rendered.get_pixel(399, 299), Some([128, 128, 128]));
    }

    #[test]
    fn test_confidence_bar_length() {
        let renderer = OverlayRenderer::new(SeverityMap::crash());
        let half = classification("CRASH", 0.5);
        let rendered = renderer.render(
            &frame(),
            &Overlay {
                classification: Some(&half),
                ..Default::default()
            },
        );
        let bar_w = BOX_WIDTH - 16;
        let bar_y = MARGIN + BOX_HEIGHT - BAR_HEIGHT - 8;
        let filled = Severity::Danger.color().0;
        assert_eq!(rendered.get_pixel(MARGIN + 8, bar_y), Some(filled));
        assert_eq!(rendered.get_pixel(MARGIN + 8 + bar_w / 2 - 1, bar_y), Some(filled));
        assert_eq!(rendered.get_pixel(MARGIN + 8 + bar_w / 2 + 1, bar_y), Some(TRACK.0));
    }

    #[test]
    fn test_drowsiness_banner() {
        let renderer = OverlayRenderer::new(SeverityMap::behavior());
        let eye = [Point::new(200.0, 250.0); 6];
        let analysis = DrowsinessAnalysis {
            faces: 1,
            eyes: Some(LandmarkSet { left: eye, right: eye }),
            ear: Some(0.1),
            state: DrowsinessState::Alerting,
            consecutive_closed_frames: 20,
        };
        let overlay = Overlay {
            drowsiness: Some(&analysis),
            ear_threshold: 0.25,
            ..Default::default()
        };
        let rendered = renderer.render(&frame(), &overlay);
        let edge = rendered.get_pixel(5, 150).unwrap();
        assert!(edge[0] > 150 && edge[1] < 100 && edge[2] < 100);
        // Banner text is centered
        let text_w = text_width(DROWSY_TEXT, BANNER_SCALE);
        let text_rows = 125..150;
        let lit = |x: u32| text_rows.clone().any(|y| rendered.get_pixel(x, y) == Some(TEXT.0));
        assert!(lit((400 - text_w) / 2));
        assert!(!lit((400 - text_w) / 2 - 2));

        let calm = DrowsinessAnalysis {
            state: DrowsinessState::Normal,
            ..analysis.clone()
        };
        let rendered = renderer.render(
            &frame(),
            &Overlay {
                drowsiness: Some(&calm),
                ..overlay
            },
        );
        assert_eq!(rendered.get_pixel(5, 150), Some([128, 128, 128]));
    }

    /// Pixels of the label text line inside the status box
    fn label_region(frame: &VideoFrame) -> Vec<[u8; 3]> {
        let top = MARGIN + STRIPE_HEIGHT + 8;
        (top..top + GLYPH_HEIGHT * LABEL_SCALE)
            .flat_map(|y| (MARGIN..MARGIN + BOX_WIDTH).map(move |x| (x, y)))
            .filter_map(|(x, y)| frame.get_pixel(x, y))
            .collect()
    }

    #[test]
    fn test_labels_of_same_severity_are_distinguishable() {
        let renderer = OverlayRenderer::new(SeverityMap::behavior());
        let texting = classification("Texting", 0.8);
        let phone = classification("Talking on Phone", 0.8);
        assert_eq!(renderer.severities.severity_of(Some("Texting")), Severity::Danger);
        assert_eq!(renderer.severities.severity_of(Some("Talking on Phone")), Severity::Danger);

        let render = |c: &Classification| {
            renderer.render(
                &frame(),
                &Overlay {
                    classification: Some(c),
                    ..Default::default()
                },
            )
        };
        let a = render(&texting);
        let b = render(&phone);
        assert_ne!(label_region(&a), label_region(&b));
        assert!(label_region(&a).contains(&TEXT.0));
        assert_eq!(a.get_pixel(MARGIN + 1, MARGIN + 1), b.get_pixel(MARGIN + 1, MARGIN + 1));
    }

    #[test]
    fn test_waiting_state_has_text() {
        let renderer = OverlayRenderer::new(SeverityMap::crash());
        let waiting = renderer.render(&frame(), &Overlay::default());
        assert!(label_region(&waiting).contains(&TEXT.0));
    }

    #[test]
    fn test_tiny_frame_does_not_panic() {
        let renderer = OverlayRenderer::default();
        let analysis = DrowsinessAnalysis {
            state: DrowsinessState::Alerting,
            ear: Some(0.0),
            ..Default::default()
        };
        let result = classification("X", 1.0);
        let overlay = Overlay {
            classification: Some(&result),
            drowsiness: Some(&analysis),
            ear_threshold: 0.25,
        };
        let tiny = VideoFrame::solid(4, 4, [0, 0, 0], 0, 0);
        assert_eq!(renderer.render(&tiny, &overlay).data.len(), 48);
    }

    #[test]
    fn test_write_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(&frame(), dir.path()).unwrap();
        assert!(path.ends_with("frame_000003.png"));
        let image = image::open(&path).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (400, 300));
    }
}
