//! kioskcam: single-owner webcam device manager for kiosk applications
//!
//! One worker thread owns the capture device and arbitrates between a
//! continuous preview stream and high-resolution still captures requested
//! concurrently by independent callers (manual shutter, timelapse scheduler,
//! burst loop, settings UI).
//!
//! # Features
//! - Backend fallback and alternate-index recovery when opening the device
//! - Resolution negotiation that reports what the driver actually applied
//! - Fast path that saves the buffered preview frame when it already matches
//! - Cancellable captures with a hard deadline
//! - Watchdog that reopens the device when the preview stalls after a capture
//!
//! # Usage
//! ```rust,no_run
//! use kioskcam::{CameraManager, CaptureOptions, KioskCamConfig, Telemetry};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), kioskcam::CameraError> {
//! kioskcam::init_logging();
//! let config = KioskCamConfig::load_or_default();
//! let camera = CameraManager::with_native_backend(config, Arc::new(Telemetry::in_memory()))?;
//! camera.start_stream();
//!
//! let result = camera.capture_and_wait(CaptureOptions::new("captures").with_size(1920, 1080));
//! println!("{:?}", result);
//! camera.shutdown();
//! # Ok(())
//! # }
//! ```
pub mod capture;
pub mod command;
pub mod config;
pub mod device;
pub mod errors;
pub mod events;
pub mod frame_buffer;
pub mod manager;
pub mod probe;
pub mod quality;
pub mod session;
pub mod storage;
pub mod types;
pub mod watchdog;
pub mod worker;

// Testing utilities - scripted device and synthetic frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use command::{CaptureOptions, CompletionSignal, ResultSlot};
pub use config::KioskCamConfig;
pub use errors::CameraError;
pub use events::{CameraEvent, EventSink, LogSink, Telemetry};
pub use manager::CameraManager;
pub use storage::{FrameWriter, JpegWriter};
pub use types::{
    BackendKind, CaptureResult, Frame, PropertyId, Resolution, ResolutionCandidate,
};
pub use worker::StreamStats;

/// Initialize logging for the camera system
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "kioskcam=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        backends: BackendKind::platform_order(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Backends tried on this platform, in order
    pub backends: Vec<BackendKind>,
}
