//! Writing captured frames to disk

use crate::errors::CameraError;
use crate::types::Frame;
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Filesystem collaborator used by the capture sequence.
pub trait FrameWriter: Send {
    /// Create the directory if it does not exist yet
    fn ensure_dir(&self, dir: &Path) -> Result<(), CameraError>;

    /// Encode `frame` as JPEG at `path`
    fn write_jpeg(&self, frame: &Frame, path: &Path, quality: u8) -> Result<(), CameraError>;
}

/// Default writer backed by the `image` crate's JPEG encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegWriter;

impl FrameWriter for JpegWriter {
    fn ensure_dir(&self, dir: &Path) -> Result<(), CameraError> {
        fs::create_dir_all(dir).map_err(|e| {
            CameraError::SaveError(format!("Failed to create directory {:?}: {}", dir, e))
        })
    }

    fn write_jpeg(&self, frame: &Frame, path: &Path, quality: u8) -> Result<(), CameraError> {
        let img = image::RgbImage::from_vec(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| {
                CameraError::SaveError(format!(
                    "Frame buffer does not match {}x{}",
                    frame.width, frame.height
                ))
            })?;
        let dynamic_img = image::DynamicImage::ImageRgb8(img);

        let file = File::create(path)
            .map_err(|e| CameraError::SaveError(format!("Failed to create {:?}: {}", path, e)))?;
        let mut writer = BufWriter::new(file);
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
        dynamic_img
            .write_with_encoder(encoder)
            .map_err(|e| CameraError::SaveError(format!("Failed to encode {:?}: {}", path, e)))?;

        log::debug!("Frame saved to {:?}", path);
        Ok(())
    }
}

/// `YYYYmmdd_HHMMSS.jpg` in `dir`, with `_n` appended while the name is taken.
pub fn timestamped_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    let stem = at.format("%Y%m%d_%H%M%S").to_string();
    let first = dir.join(format!("{}.jpg", stem));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{}_{}.jpg", stem, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}
