//! Ownership of the one open capture device
//!
//! [`DeviceSession`] negotiates the backend when opening, applies the preview
//! configuration, and remembers which backend worked so the next open tries
//! it first. At most one device handle exists per session: opening always
//! releases the previous handle first.

use crate::config::CameraSettings;
use crate::device::{CaptureDevice, DeviceOpener};
use crate::errors::CameraError;
use crate::events::{CameraEvent, EventSink};
use crate::types::{BackendKind, Frame, PixelFormat, PropertyId, Resolution};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct DeviceSession {
    opener: Box<dyn DeviceOpener>,
    device: Option<Box<dyn CaptureDevice>>,
    events: Arc<dyn EventSink>,
    index: u32,
    remembered_backend: Option<BackendKind>,
    preview: Resolution,
    fps: u32,
    use_mjpg: bool,
    open_discard_frames: u32,
    reopen_cooldown: Duration,
    opened_at: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl DeviceSession {
    pub fn new(
        opener: Box<dyn DeviceOpener>,
        settings: &CameraSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            opener,
            device: None,
            events,
            index: settings.device_index,
            remembered_backend: settings.preferred_backend,
            preview: settings.preview(),
            fps: settings.preview_fps,
            use_mjpg: settings.use_mjpg,
            open_discard_frames: settings.open_discard_frames,
            reopen_cooldown: settings.reopen_cooldown(),
            opened_at: None,
            last_attempt: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Backend of the open device, or the one that worked last time
    pub fn backend(&self) -> Option<BackendKind> {
        self.device
            .as_ref()
            .map(|d| d.backend())
            .or(self.remembered_backend)
    }

    pub fn preview(&self) -> Resolution {
        self.preview
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn uses_mjpg(&self) -> bool {
        self.use_mjpg
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn current_resolution(&self) -> Option<Resolution> {
        self.device.as_ref().map(|d| d.resolution())
    }

    pub fn set_preview(&mut self, preview: Resolution) {
        self.preview = preview;
    }

    /// Switch to another device index. The current handle is released; the
    /// caller reopens.
    pub fn set_index(&mut self, index: u32) {
        if index == self.index {
            return;
        }
        self.events.emit(CameraEvent::CameraIndexChange {
            from: self.index,
            to: index,
        });
        self.close();
        self.index = index;
    }

    /// Open (or reopen) the device, trying every backend in fallback order on
    /// the configured index and then on the alternate index.
    pub fn open(&mut self) -> Result<BackendKind, CameraError> {
        self.close();

        let started = Instant::now();
        self.last_attempt = Some(started);
        self.events
            .emit(CameraEvent::CameraOpenStart { index: self.index });

        let device = match self.open_on_index(self.index) {
            Ok(device) => device,
            Err(first) => {
                let alternate = if self.index == 0 { 1 } else { 0 };
                log::warn!(
                    "Camera {} unavailable ({}), trying index {}",
                    self.index,
                    first,
                    alternate
                );
                self.events.emit(CameraEvent::CameraOpenIndexFallback {
                    from: self.index,
                    to: alternate,
                });
                match self.open_on_index(alternate) {
                    Ok(device) => {
                        self.index = alternate;
                        device
                    }
                    Err(e) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        log::error!("Camera open failed on every backend: {}", e);
                        self.events.emit(CameraEvent::DeviceOpenFailure {
                            index: self.index,
                            duration_ms,
                            reason: e.to_string(),
                        });
                        return Err(CameraError::DeviceOpenFailure(format!(
                            "index {} and {}: {}",
                            self.index, alternate, e
                        )));
                    }
                }
            }
        };

        let backend = device.backend();
        self.remembered_backend = Some(backend);
        self.device = Some(device);
        self.opened_at = Some(Instant::now());

        let resolution = match self.apply_preview() {
            Ok(resolution) => resolution,
            Err(e) => {
                log::warn!("Failed to apply preview settings after open: {}", e);
                self.current_resolution().unwrap_or_default()
            }
        };
        for _ in 0..self.open_discard_frames {
            if let Err(e) = self.read_frame() {
                log::debug!("Discard read after open failed: {}", e);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Camera {} opened via {} at {} in {} ms",
            self.index,
            backend,
            resolution,
            duration_ms
        );
        self.events.emit(CameraEvent::CameraOpenOk {
            index: self.index,
            backend,
            resolution,
            duration_ms,
        });
        Ok(backend)
    }

    fn open_on_index(&mut self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let mut last_error = None;
        for backend in BackendKind::fallback_order(self.remembered_backend) {
            match self.opener.open(index, backend) {
                Ok(device) => {
                    self.events.emit(CameraEvent::CameraOpenBackendTry {
                        index,
                        backend,
                        ok: true,
                    });
                    return Ok(device);
                }
                Err(e) => {
                    log::debug!("Backend {} failed for index {}: {}", backend, index, e);
                    self.events.emit(CameraEvent::CameraOpenBackendTry {
                        index,
                        backend,
                        ok: false,
                    });
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CameraError::DeviceOpenFailure("no backend available on this platform".to_string())
        }))
    }

    /// Open if needed. Explicit commands use this and always attempt.
    pub fn ensure_open(&mut self) -> bool {
        self.is_open() || self.open().is_ok()
    }

    /// Open if needed, at most once per reopen cooldown.
    pub fn ensure_open_throttled(&mut self, now: Instant) -> bool {
        if self.is_open() {
            return true;
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.reopen_cooldown {
                return false;
            }
        }
        self.open().is_ok()
    }

    /// Release the device handle.
    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            drop(device);
            self.opened_at = None;
            log::debug!("Camera {} released", self.index);
            self.events
                .emit(CameraEvent::CameraClosed { index: self.index });
        }
    }

    fn device_mut(&mut self) -> Result<&mut Box<dyn CaptureDevice>, CameraError> {
        self.device.as_mut().ok_or(CameraError::NotOpen)
    }

    /// Direct access for code that drives the device through several steps.
    pub fn device(&mut self) -> Option<&mut (dyn CaptureDevice + 'static)> {
        self.device.as_deref_mut()
    }

    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.device_mut()?.read_frame()
    }

    /// Re-apply pixel format, preview size and frame rate. Returns the size
    /// the driver settled on.
    pub fn apply_preview(&mut self) -> Result<Resolution, CameraError> {
        let (preview, fps, use_mjpg) = (self.preview, self.fps, self.use_mjpg);
        let device = self.device_mut()?;
        if use_mjpg {
            if let Err(e) = device.set_pixel_format(PixelFormat::Mjpeg) {
                log::debug!("MJPEG not accepted: {}", e);
            }
        }
        device.set_resolution(preview)?;
        if let Err(e) = device.set_frame_rate(fps) {
            log::debug!("Frame rate {} not accepted: {}", fps, e);
        }
        Ok(device.resolution())
    }

    /// Request a size and read back what the driver applied.
    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<Resolution, CameraError> {
        let device = self.device_mut()?;
        device.set_resolution(resolution)?;
        Ok(device.resolution())
    }

    pub fn set_mjpeg(&mut self) -> Result<(), CameraError> {
        self.device_mut()?.set_pixel_format(PixelFormat::Mjpeg)
    }

    pub fn set_property(&mut self, id: PropertyId, value: f64) -> Result<(), CameraError> {
        self.device_mut()?.set_property(id, value)
    }

    pub fn set_auto_modes(&mut self, exposure: bool, white_balance: bool) -> Result<(), CameraError> {
        self.device_mut()?.set_auto_modes(exposure, white_balance)
    }

    pub fn open_settings_dialog(&mut self) -> Result<(), CameraError> {
        self.device_mut()?.open_settings_dialog()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
