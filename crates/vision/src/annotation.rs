//! Overlay compositor: draws the text block, guide lines and status line onto
//! an RGB frame.
//!
//! Compositing is a pure function of its inputs. Nothing in the overlay can
//! make it fail: unknown colours fall back to green and characters without a
//! glyph render as a box.

use image::{Rgb, RgbImage};
use video_ingest::{CaptureError, Frame, FrameFormat};

use crate::{
    config::{Anchor, GuideLine, NormalizedPoint, OverlayConfig, TextOverlay},
    font::{self, TextMask},
};

/// Colour used when a configured colour cannot be parsed.
pub const FALLBACK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_FILL: Rgb<u8> = Rgb([255, 255, 255]);
const OUTLINE: Rgb<u8> = Rgb([0, 0, 0]);
const OUTLINE_ALPHA: f32 = 160.0 / 255.0;
const STATUS_MARGIN: u32 = 10;
const STATUS_FONT_SIZE: u32 = 16;

/// Convert a raw capture buffer into the canonical RGB image.
pub fn frame_to_rgb(frame: Frame) -> Result<RgbImage, CaptureError> {
    frame.validate()?;
    let Frame {
        mut data,
        width,
        height,
        format,
        ..
    } = frame;
    if format == FrameFormat::Bgr8 {
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
    }
    let expected = data.len();
    RgbImage::from_raw(width, height, data).ok_or(CaptureError::InvalidFrame {
        expected: width as usize * height as usize * 3,
        actual: expected,
    })
}

/// Draw `overlay` (and `status`, when given) onto `image`.
///
/// A disabled overlay returns the input untouched, status line included.
pub fn composite(mut image: RgbImage, overlay: &OverlayConfig, status: Option<&str>) -> RgbImage {
    if !overlay.enabled {
        return image;
    }

    if overlay.text.enabled && !overlay.text.content.is_empty() {
        draw_text_block(&mut image, &overlay.text);
    }

    for line in overlay.lines.iter().filter(|line| line.enabled) {
        draw_guide_line(&mut image, line);
    }

    // Drawn last so nothing else covers it.
    if let Some(status) = status.filter(|s| !s.is_empty()) {
        let scale = font::scale_for_size(STATUS_FONT_SIZE);
        let (_, text_h) = font::text_extent(status, scale);
        let y = image.height() as i64 - text_h as i64 - STATUS_MARGIN as i64;
        draw_outlined_text(&mut image, STATUS_MARGIN as i64, y.max(0), status, scale);
    }

    image
}

/// Resolve a normalised point against a frame of `width` x `height` pixels.
pub fn resolve_point(point: NormalizedPoint, width: u32, height: u32) -> (i64, i64) {
    let x = (point.x() as f64 * width as f64).round() as i64;
    let y = (point.y() as f64 * height as f64).round() as i64;
    (x.clamp(0, width as i64), y.clamp(0, height as i64))
}

/// Top-left corner of a `text_w` x `text_h` block placed at `anchor`.
pub fn text_origin(
    anchor: Anchor,
    margin: u32,
    (text_w, text_h): (u32, u32),
    (frame_w, frame_h): (u32, u32),
) -> (i64, i64) {
    let (fw, fh, tw, th, m) = (
        frame_w as i64,
        frame_h as i64,
        text_w as i64,
        text_h as i64,
        margin as i64,
    );
    let (x, y) = match anchor {
        Anchor::TopLeft => (m, m),
        Anchor::TopRight => (fw - tw - m, m),
        Anchor::BottomLeft => (m, fh - th - m),
        Anchor::BottomRight => (fw - tw - m, fh - th - m),
        Anchor::Center => ((fw - tw) / 2, (fh - th) / 2),
    };
    (x.max(0), y.max(0))
}

/// Parse `#RRGGBB` or `#RGB`, falling back to [`FALLBACK_COLOR`].
pub fn parse_color(value: &str) -> Rgb<u8> {
    let hex = value.trim();
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|c| [c, c]).collect(),
        6 => hex.to_string(),
        _ => return FALLBACK_COLOR,
    };
    let channel = |range: std::ops::Range<usize>| {
        expanded
            .get(range)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
    };
    match (channel(0..2), channel(2..4), channel(4..6)) {
        (Some(r), Some(g), Some(b)) => Rgb([r, g, b]),
        _ => FALLBACK_COLOR,
    }
}

fn draw_text_block(image: &mut RgbImage, text: &TextOverlay) {
    let scale = font::scale_for_size(text.font_size);
    let extent = font::text_extent(&text.content, scale);
    let (x, y) = text_origin(
        text.position,
        text.margin,
        extent,
        (image.width(), image.height()),
    );
    draw_outlined_text(image, x, y, &text.content, scale);
}

/// Outline pass, then fill pass, so the string reads on any background.
fn draw_outlined_text(image: &mut RgbImage, x: i64, y: i64, text: &str, scale: u32) {
    let radius = (scale / 2).max(1);
    let r = radius as i64;
    // Only rasterise glyphs that can land inside the frame.
    let available = (image.width() as i64 - x + r).clamp(0, u32::MAX as i64) as u32;
    let text = font::visible_prefix(text, scale, available);
    if text.is_empty() {
        return;
    }
    let fill = TextMask::render(text, scale);
    let outline = fill.dilate(radius);

    for my in 0..outline.height() {
        for mx in 0..outline.width() {
            let inside = mx >= radius
                && my >= radius
                && fill.get(mx - radius, my - radius);
            if outline.get(mx, my) && !inside {
                blend_pixel(image, x - r + mx as i64, y - r + my as i64, OUTLINE, OUTLINE_ALPHA);
            }
        }
    }
    for my in 0..fill.height() {
        for mx in 0..fill.width() {
            if fill.get(mx, my) {
                blend_pixel(image, x + mx as i64, y + my as i64, TEXT_FILL, 1.0);
            }
        }
    }
}

fn draw_guide_line(image: &mut RgbImage, line: &GuideLine) {
    let (width, height) = image.dimensions();
    let start = resolve_point(line.start, width, height);
    let end = resolve_point(line.end, width, height);
    draw_thick_line(
        image,
        start,
        end,
        line.width_px.max(1),
        parse_color(&line.color),
        line.alpha,
    );
}

/// Alpha-blend every pixel whose centre lies within `thickness / 2` of the
/// segment. Each pixel is touched at most once.
fn draw_thick_line(
    image: &mut RgbImage,
    (x0, y0): (i64, i64),
    (x1, y1): (i64, i64),
    thickness: u32,
    color: Rgb<u8>,
    alpha: f32,
) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    if width == 0 || height == 0 || alpha <= 0.0 {
        return;
    }
    let half = thickness as f64 / 2.0;
    let pad = half.ceil() as i64 + 1;
    let left = (x0.min(x1) - pad).max(0);
    let right = (x0.max(x1) + pad).min(width - 1);
    let top = (y0.min(y1) - pad).max(0);
    let bottom = (y0.max(y1) + pad).min(height - 1);

    let (ax, ay, bx, by) = (x0 as f64, y0 as f64, x1 as f64, y1 as f64);
    for py in top..=bottom {
        for px in left..=right {
            let distance = distance_to_segment(px as f64 + 0.5, py as f64 + 0.5, ax, ay, bx, by);
            if distance <= half {
                blend_pixel(image, px, py, color, alpha);
            }
        }
    }
}

fn distance_to_segment(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let (dx, dy) = (bx - ax, by - ay);
    let length_sq = dx * dx + dy * dy;
    let t = if length_sq == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / length_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

fn blend_pixel(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>, alpha: f32) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let pixel = image.get_pixel_mut(x as u32, y as u32);
    for channel in 0..3 {
        let dst = pixel.0[channel] as f32;
        let src = color.0[channel] as f32;
        pixel.0[channel] = (src * alpha + dst * (1.0 - alpha)).round() as u8;
    }
}
