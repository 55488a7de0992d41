/// Frame brightness checks
///
/// Used after a capture is saved to flag frames that came back black, which
/// usually means the sensor had not settled after a mode switch.
use crate::types::Frame;

/// Mean Rec.601 luma of an RGB8 frame, 0.0 to 255.0.
///
/// An empty or malformed frame reads as 0.0.
pub fn mean_luminance(frame: &Frame) -> f64 {
    if !frame.is_valid() || frame.data.is_empty() {
        return 0.0;
    }
    let Some(rgb) = image::RgbImage::from_vec(frame.width, frame.height, frame.data.clone())
    else {
        return 0.0;
    };
    let luma = image::DynamicImage::ImageRgb8(rgb).to_luma8();
    let total: u64 = luma.as_raw().iter().map(|&v| u64::from(v)).sum();
    total as f64 / luma.as_raw().len() as f64
}

/// Mean luma of `frame` when it is at or below `threshold`.
pub fn black_level(frame: &Frame, threshold: f64) -> Option<f64> {
    let mean = mean_luminance(frame);
    (mean <= threshold).then_some(mean)
}
