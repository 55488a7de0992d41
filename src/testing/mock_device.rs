//! Scripted capture device for running the manager without hardware
//!
//! A [`MockCamera`] is the controller a test keeps; [`MockCamera::opener`]
//! hands the manager a [`DeviceOpener`] whose devices share the controller's
//! state, so a test can change behaviour while the worker is running and
//! inspect what the worker did to the "hardware".

use crate::device::{CaptureDevice, DeviceOpener};
use crate::errors::CameraError;
use crate::types::{BackendKind, Frame, PixelFormat, PropertyId, Resolution};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// How the scripted driver behaves
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Largest size the driver accepts; larger requests are clamped
    pub max_resolution: Resolution,
    /// Modes the driver snaps to. Empty means any size up to the maximum.
    pub modes: Vec<Resolution>,
    /// Size a freshly opened device reports
    pub initial_resolution: Resolution,
    /// Byte every channel of every frame is filled with
    pub fill: u8,
    /// Time a frame read blocks
    pub read_delay: Duration,
    /// Time a resolution change blocks, like a driver renegotiating
    pub set_resolution_delay: Duration,
    pub fail_open: bool,
    pub failing_backends: Vec<BackendKind>,
    pub failing_indices: Vec<u32>,
    pub unsupported_properties: Vec<PropertyId>,
    /// Once a frame was delivered at this size, leaving it stalls the stream
    /// until the next open
    pub stall_after_leaving: Option<Resolution>,
    /// Stalls survive a reopen
    pub sticky_stall: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            max_resolution: Resolution::new(1920, 1080),
            modes: Vec::new(),
            initial_resolution: Resolution::new(640, 480),
            fill: 128,
            read_delay: Duration::from_millis(5),
            set_resolution_delay: Duration::ZERO,
            fail_open: false,
            failing_backends: Vec::new(),
            failing_indices: Vec::new(),
            unsupported_properties: Vec::new(),
            stall_after_leaving: None,
            sticky_stall: false,
        }
    }
}

/// One open attempt seen by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAttempt {
    pub index: u32,
    pub backend: BackendKind,
    pub ok: bool,
}

#[derive(Debug, Default)]
struct MockState {
    behavior: MockBehavior,
    stalled: bool,
    live_handles: usize,
    max_live_handles: usize,
    opens: Vec<OpenAttempt>,
    resolution_requests: Vec<Resolution>,
    properties: Vec<(PropertyId, f64)>,
    pixel_formats: Vec<PixelFormat>,
    frames_delivered: u64,
    delivered_at: Option<Resolution>,
    dialogs: u32,
}

/// Controller for a scripted camera
#[derive(Debug, Clone)]
pub struct MockCamera {
    state: Arc<Mutex<MockState>>,
}

impl MockCamera {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                behavior,
                ..Default::default()
            })),
        }
    }

    /// Camera capped at `width`x`height` that opens at that size
    pub fn capped(width: u32, height: u32) -> Self {
        let max = Resolution::new(width, height);
        Self::new(MockBehavior {
            max_resolution: max,
            initial_resolution: max,
            ..Default::default()
        })
    }

    pub fn opener(&self) -> MockOpener {
        MockOpener {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update<F: FnOnce(&mut MockBehavior)>(&self, f: F) {
        f(&mut self.lock().behavior);
    }

    pub fn set_fill(&self, fill: u8) {
        self.lock().behavior.fill = fill;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().behavior.fail_open = fail;
    }

    /// Make every read fail until cleared or, unless sticky, the next open
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn is_stalled(&self) -> bool {
        self.lock().stalled
    }

    pub fn open_attempts(&self) -> Vec<OpenAttempt> {
        self.lock().opens.clone()
    }

    pub fn successful_opens(&self) -> usize {
        self.lock().opens.iter().filter(|o| o.ok).count()
    }

    pub fn live_handles(&self) -> usize {
        self.lock().live_handles
    }

    /// Highest number of simultaneously open devices ever observed
    pub fn max_live_handles(&self) -> usize {
        self.lock().max_live_handles
    }

    pub fn resolution_requests(&self) -> Vec<Resolution> {
        self.lock().resolution_requests.clone()
    }

    pub fn properties(&self) -> Vec<(PropertyId, f64)> {
        self.lock().properties.clone()
    }

    pub fn pixel_formats(&self) -> Vec<PixelFormat> {
        self.lock().pixel_formats.clone()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.lock().frames_delivered
    }

    pub fn dialogs_opened(&self) -> u32 {
        self.lock().dialogs
    }
}

/// Opener handed to the manager
#[derive(Debug, Clone)]
pub struct MockOpener {
    state: Arc<Mutex<MockState>>,
}

impl DeviceOpener for MockOpener {
    fn open(
        &mut self,
        index: u32,
        backend: BackendKind,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let behavior = &state.behavior;
        let ok = !behavior.fail_open
            && !behavior.failing_backends.contains(&backend)
            && !behavior.failing_indices.contains(&index);
        let initial = clamp(behavior, behavior.initial_resolution);
        state.opens.push(OpenAttempt { index, backend, ok });

        if !ok {
            return Err(CameraError::DeviceOpenFailure(format!(
                "mock refused index {} via {}",
                index, backend
            )));
        }

        if !state.behavior.sticky_stall {
            state.stalled = false;
        }
        state.delivered_at = None;
        state.live_handles += 1;
        state.max_live_handles = state.max_live_handles.max(state.live_handles);

        Ok(Box::new(MockDevice {
            state: Arc::clone(&self.state),
            backend,
            resolution: initial,
            sequence: 0,
        }))
    }
}

fn clamp(behavior: &MockBehavior, requested: Resolution) -> Resolution {
    let max = behavior.max_resolution;
    let capped = Resolution::new(
        requested.width.min(max.width),
        requested.height.min(max.height),
    );
    if behavior.modes.is_empty() {
        return capped;
    }
    // Largest mode that fits, else the smallest mode.
    behavior
        .modes
        .iter()
        .filter(|m| m.width <= capped.width && m.height <= capped.height)
        .max_by_key(|m| m.pixel_count())
        .or_else(|| behavior.modes.iter().min_by_key(|m| m.pixel_count()))
        .copied()
        .unwrap_or(capped)
}

/// Device produced by [`MockOpener`]
#[derive(Debug)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    backend: BackendKind,
    resolution: Resolution,
    sequence: u64,
}

impl MockDevice {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureDevice for MockDevice {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let delay = self.lock().behavior.read_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if state.stalled {
            return Err(CameraError::FrameReadFailure("mock stream stalled".to_string()));
        }
        state.frames_delivered += 1;
        state.delivered_at = Some(self.resolution);
        let fill = state.behavior.fill;
        drop(state);

        self.sequence += 1;
        let Resolution { width, height } = self.resolution;
        Ok(Frame::new(vec![fill; (width * height * 3) as usize], width, height)
            .with_sequence(self.sequence))
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CameraError> {
        let delay = self.lock().behavior.set_resolution_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.lock();
        state.resolution_requests.push(resolution);
        let applied = clamp(&state.behavior, resolution);
        if applied != self.resolution {
            if let Some(trigger) = state.behavior.stall_after_leaving {
                if self.resolution == trigger && state.delivered_at == Some(trigger) {
                    state.stalled = true;
                }
            }
        }
        drop(state);
        self.resolution = applied;
        Ok(())
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn set_frame_rate(&mut self, _fps: u32) -> Result<(), CameraError> {
        Ok(())
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CameraError> {
        self.lock().pixel_formats.push(format);
        Ok(())
    }

    fn set_property(&mut self, id: PropertyId, value: f64) -> Result<(), CameraError> {
        let mut state = self.lock();
        if state.behavior.unsupported_properties.contains(&id) {
            return Err(CameraError::Unsupported(format!(
                "mock has no {}",
                id.as_str()
            )));
        }
        state.properties.push((id, value));
        Ok(())
    }

    fn open_settings_dialog(&mut self) -> Result<(), CameraError> {
        self.lock().dialogs += 1;
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.live_handles = state.live_handles.saturating_sub(1);
    }
}
