//! Device abstraction for the camera worker
//!
//! The worker only ever talks to a [`CaptureDevice`]. Real webcams are
//! reached through nokhwa (`native` feature); tests use the scripted mock in
//! [`crate::testing`].

#[cfg(feature = "native")]
pub mod native;

use crate::errors::CameraError;
use crate::types::{BackendKind, Frame, PixelFormat, PropertyId, Resolution};

/// An open capture device. Dropping it releases the hardware.
pub trait CaptureDevice: Send {
    /// Backend the device was opened with
    fn backend(&self) -> BackendKind;

    /// Blocking read of one decoded RGB8 frame
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Request a capture size. Drivers may clamp or ignore it; read back with
    /// [`CaptureDevice::resolution`].
    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CameraError>;

    /// Size the driver reports as applied
    fn resolution(&self) -> Resolution;

    fn set_frame_rate(&mut self, fps: u32) -> Result<(), CameraError>;

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CameraError>;

    fn set_property(&mut self, id: PropertyId, value: f64) -> Result<(), CameraError>;

    /// Toggle automatic exposure and white balance
    fn set_auto_modes(&mut self, exposure: bool, white_balance: bool) -> Result<(), CameraError> {
        self.set_property(PropertyId::AutoExposure, if exposure { 1.0 } else { 0.0 })?;
        self.set_property(
            PropertyId::AutoWhiteBalance,
            if white_balance { 1.0 } else { 0.0 },
        )
    }

    /// Open the driver's own settings dialog, where the platform has one
    fn open_settings_dialog(&mut self) -> Result<(), CameraError> {
        Err(CameraError::Unsupported(
            "driver settings dialog is not available on this backend".to_string(),
        ))
    }
}

/// Opens devices by index on a given backend.
pub trait DeviceOpener: Send {
    fn open(&mut self, index: u32, backend: BackendKind)
        -> Result<Box<dyn CaptureDevice>, CameraError>;
}
