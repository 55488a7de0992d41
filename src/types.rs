//! Core value types shared by the device manager and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when both axes differ by at most `tolerance` pixels.
    pub fn within(&self, other: Resolution, tolerance: u32) -> bool {
        self.width.abs_diff(other.width) <= tolerance
            && self.height.abs_diff(other.height) <= tolerance
    }

    /// Manhattan distance between two sizes, used to pick the closest achieved size.
    pub fn distance(&self, other: Resolution) -> u64 {
        u64::from(self.width.abs_diff(other.width)) + u64::from(self.height.abs_diff(other.height))
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parses `1920x1080` (spaces around the `x` are accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("resolution should be WIDTHxHEIGHT, got '{}'", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid width '{}': {}", w.trim(), e))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid height '{}': {}", h.trim(), e))?;
        Ok(Resolution::new(width, height))
    }
}

/// Labelled size offered to the resolution prober.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    pub label: String,
    pub resolution: Resolution,
}

impl ResolutionCandidate {
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            resolution: Resolution::new(width, height),
        }
    }
}

/// Resolution ladder offered to kiosk operators, largest first.
pub const STANDARD_RESOLUTIONS: &[(&str, u32, u32)] = &[
    ("8000 x 6000 (48MP)", 8000, 6000),
    ("3840 x 2160 (4K)", 3840, 2160),
    ("3264 x 2448 (8MP)", 3264, 2448),
    ("2592 x 1944 (5MP)", 2592, 1944),
    ("2560 x 1440 (QHD)", 2560, 1440),
    ("1920 x 1080 (FHD)", 1920, 1080),
    ("1600 x 1200 (UXGA)", 1600, 1200),
    ("1280 x 720 (HD)", 1280, 720),
    ("1024 x 768 (XGA)", 1024, 768),
    ("800 x 600 (SVGA)", 800, 600),
    ("640 x 480 (VGA)", 640, 480),
];

/// The standard ladder as prober candidates.
pub fn standard_candidates() -> Vec<ResolutionCandidate> {
    STANDARD_RESOLUTIONS
        .iter()
        .map(|(label, w, h)| ResolutionCandidate::new(*label, *w, *h))
        .collect()
}

/// Capture sizes tried when a caller does not state a preference.
pub fn default_capture_sizes() -> Vec<Resolution> {
    vec![
        Resolution::new(4056, 3040),
        Resolution::new(3840, 2160),
        Resolution::new(3264, 2448),
        Resolution::new(2592, 1944),
        Resolution::new(1920, 1080),
        Resolution::new(1280, 720),
    ]
}

/// Next smaller entry of the standard ladder.
pub fn suggest_downgrade(requested: Resolution) -> Option<Resolution> {
    STANDARD_RESOLUTIONS
        .iter()
        .map(|(_, w, h)| Resolution::new(*w, *h))
        .find(|r| r.pixel_count() < requested.pixel_count())
}

/// A decoded RGB8 frame and the instant it was read from the device.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data,
            captured_at: Instant::now(),
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn is_valid(&self) -> bool {
        self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// Device properties a caller may adjust through `set_property`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyId {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    Sharpness,
    Gamma,
    Gain,
    Exposure,
    AutoExposure,
    WhiteBalance,
    AutoWhiteBalance,
    BacklightCompensation,
    Focus,
    Zoom,
}

impl PropertyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyId::Brightness => "brightness",
            PropertyId::Contrast => "contrast",
            PropertyId::Saturation => "saturation",
            PropertyId::Hue => "hue",
            PropertyId::Sharpness => "sharpness",
            PropertyId::Gamma => "gamma",
            PropertyId::Gain => "gain",
            PropertyId::Exposure => "exposure",
            PropertyId::AutoExposure => "auto_exposure",
            PropertyId::WhiteBalance => "white_balance",
            PropertyId::AutoWhiteBalance => "auto_white_balance",
            PropertyId::BacklightCompensation => "backlight_compensation",
            PropertyId::Focus => "focus",
            PropertyId::Zoom => "zoom",
        }
    }
}

impl FromStr for PropertyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            PropertyId::Brightness,
            PropertyId::Contrast,
            PropertyId::Saturation,
            PropertyId::Hue,
            PropertyId::Sharpness,
            PropertyId::Gamma,
            PropertyId::Gain,
            PropertyId::Exposure,
            PropertyId::AutoExposure,
            PropertyId::WhiteBalance,
            PropertyId::AutoWhiteBalance,
            PropertyId::BacklightCompensation,
            PropertyId::Focus,
            PropertyId::Zoom,
        ];
        all.into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown property '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
}

/// OS capture subsystem used to talk to the webcam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    MediaFoundation,
    AVFoundation,
    Video4Linux,
    /// Let the capture library pick.
    Auto,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::MediaFoundation => "MSMF",
            BackendKind::AVFoundation => "AVFOUNDATION",
            BackendKind::Video4Linux => "V4L2",
            BackendKind::Auto => "AUTO",
        }
    }

    /// Platform-preferred backends first, generic fallback last.
    pub fn platform_order() -> Vec<BackendKind> {
        if cfg!(target_os = "windows") {
            vec![BackendKind::MediaFoundation, BackendKind::Auto]
        } else if cfg!(target_os = "macos") {
            vec![BackendKind::AVFoundation, BackendKind::Auto]
        } else if cfg!(target_os = "linux") {
            vec![BackendKind::Video4Linux, BackendKind::Auto]
        } else {
            vec![BackendKind::Auto]
        }
    }

    /// Open order with a remembered backend promoted to the front.
    pub fn fallback_order(remembered: Option<BackendKind>) -> Vec<BackendKind> {
        let mut order = Vec::new();
        if let Some(backend) = remembered {
            order.push(backend);
        }
        for backend in Self::platform_order() {
            if !order.contains(&backend) {
                order.push(backend);
            }
        }
        order
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one capture request. Always fully populated when the request resolves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub effective: Resolution,
    pub mismatch: bool,
    pub cancelled: bool,
    pub timed_out: bool,
    /// The buffered preview frame was saved without reconfiguring the device.
    pub fast_path: bool,
    pub saved_path: Option<PathBuf>,
    /// Set after repeated mismatches on the same requested size.
    pub downgrade_suggestion: Option<Resolution>,
    /// Why no file was written, when it was neither cancelled nor timed out.
    pub failure: Option<String>,
}

impl CaptureResult {
    /// Result for a request that was dropped before the worker ran it.
    pub fn abandoned() -> Self {
        Self {
            cancelled: true,
            failure: Some("request dropped before execution".to_string()),
            ..Default::default()
        }
    }

    pub fn is_saved(&self) -> bool {
        self.saved_path.is_some()
    }
}
