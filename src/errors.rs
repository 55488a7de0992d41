use thiserror::Error;

/// Faults raised inside the device manager.
///
/// None of these cross the command boundary: the worker converts them into
/// events and `CaptureResult` fields. They are returned directly only by the
/// few entry points that touch the device from a caller thread.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Every backend and the alternate index failed to open.
    #[error("Device open failure: {0}")]
    DeviceOpenFailure(String),
    /// A single frame read failed. Transient.
    #[error("Frame read failure: {0}")]
    FrameReadFailure(String),
    #[error("Camera control error: {0}")]
    ControlError(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Save error: {0}")]
    SaveError(String),
    #[error("No device is open")]
    NotOpen,
    #[error("Command channel closed")]
    ChannelClosed,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Worker error: {0}")]
    Worker(String),
}

impl CameraError {
    /// Transient faults are counted and retried, never surfaced per occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::FrameReadFailure(_))
    }
}
