//! Cheap per-frame measurements: ambient brightness and motion.

use image::RgbImage;

/// Sampling stride used by the motion detector on both axes.
const MOTION_STRIDE: u32 = 4;

/// Mean BT.601 luma over the whole frame, in `0..=255`.
pub fn mean_luma(image: &RgbImage) -> f32 {
    let pixels = image.width() as u64 * image.height() as u64;
    if pixels == 0 {
        return 0.0;
    }
    let sum: f64 = image.pixels().map(|p| luma(p.0) as f64).sum();
    (sum / pixels as f64) as f32
}

/// Rough ambient light estimate derived from mean luma.
///
/// The curve compresses highlights; it is not calibrated against a meter.
pub fn approx_lux(luma: f32) -> u32 {
    let x = if luma.is_nan() { 0.0 } else { luma.clamp(0.0, 255.0) as f64 };
    (2000.0 * (x / 255.0).powf(1.2)).round() as u32
}

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Frame-to-frame motion estimate over a down-sampled grey image.
#[derive(Debug, Default)]
pub struct MotionDetector {
    previous: Option<(u32, u32, Vec<u8>)>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean absolute grey-level difference to the previous frame, in
    /// `0..=255`. The first frame, and any frame whose size differs from the
    /// previous one, scores 0.
    pub fn update(&mut self, image: &RgbImage) -> f32 {
        let (width, height, grey) = downsample(image);
        let score = match &self.previous {
            Some((w, h, prev)) if *w == width && *h == height && !grey.is_empty() => {
                let total: u64 = prev
                    .iter()
                    .zip(&grey)
                    .map(|(a, b)| a.abs_diff(*b) as u64)
                    .sum();
                total as f32 / grey.len() as f32
            }
            _ => 0.0,
        };
        self.previous = Some((width, height, grey));
        score
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn downsample(image: &RgbImage) -> (u32, u32, Vec<u8>) {
    let width = image.width().div_ceil(MOTION_STRIDE);
    let height = image.height().div_ceil(MOTION_STRIDE);
    let mut grey = Vec::with_capacity(width as usize * height as usize);
    for y in (0..image.height()).step_by(MOTION_STRIDE as usize) {
        for x in (0..image.width()).step_by(MOTION_STRIDE as usize) {
            grey.push(luma(image.get_pixel(x, y).0).round() as u8);
        }
    }
    (width, height, grey)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn luma_weights_channels() {
        assert!((mean_luma(&solid(4, 4, [255, 255, 255])) - 255.0).abs() < 0.01);
        assert!((mean_luma(&solid(4, 4, [0, 255, 0])) - 149.685).abs() < 0.01);
        assert_eq!(mean_luma(&RgbImage::new(0, 0)), 0.0);
    }

    #[test]
    fn lux_curve_endpoints() {
        assert_eq!(approx_lux(0.0), 0);
        assert_eq!(approx_lux(255.0), 2000);
        assert_eq!(approx_lux(400.0), 2000);
        // 2000 * 0.5^1.2 = 870.55
        assert_eq!(approx_lux(127.5), 871);
    }

    #[test]
    fn motion_is_zero_for_static_scene() {
        let mut detector = MotionDetector::new();
        let frame = solid(16, 16, [90, 90, 90]);
        assert_eq!(detector.update(&frame), 0.0);
        assert_eq!(detector.update(&frame), 0.0);
    }

    #[test]
    fn motion_reports_mean_difference() {
        let mut detector = MotionDetector::new();
        detector.update(&solid(16, 16, [0, 0, 0]));
        let score = detector.update(&solid(16, 16, [100, 100, 100]));
        assert!((score - 100.0).abs() < 0.5, "score {score}");
    }

    #[test]
    fn size_change_resets_motion() {
        let mut detector = MotionDetector::new();
        detector.update(&solid(16, 16, [0, 0, 0]));
        assert_eq!(detector.update(&solid(32, 16, [255, 255, 255])), 0.0);
    }
}
