//! Public handle to the camera device manager
//!
//! [`CameraManager`] is created once at application start and cloned into
//! every caller that needs the camera (preview, timelapse scheduler, burst
//! loop, settings UI). All clones talk to the same worker thread; the worker
//! stops when `shutdown` is called or the last clone is dropped.

use crate::command::{CaptureCancel, CaptureIntake, CaptureOptions, CaptureRequest, Command, CompletionSignal, ResultSlot};
use crate::config::KioskCamConfig;
use crate::device::DeviceOpener;
use crate::errors::CameraError;
use crate::events::{CameraEvent, EventSink};
use crate::frame_buffer::FrameBuffer;
use crate::session::DeviceSession;
use crate::storage::FrameWriter;
use crate::types::{CaptureResult, Frame, PropertyId, Resolution, ResolutionCandidate};
use crate::worker::{StreamCounters, StreamStats, Worker};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Inner {
    commands: Sender<Command>,
    intake: CaptureIntake,
    cancel: CaptureCancel,
    stopping: Arc<AtomicBool>,
    frames: Arc<FrameBuffer>,
    session: Arc<Mutex<DeviceSession>>,
    counters: Arc<StreamCounters>,
    events: Arc<dyn EventSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<Inner>,
}

impl CameraManager {
    /// Validate the configuration and start the worker thread.
    pub fn start(
        config: KioskCamConfig,
        opener: Box<dyn DeviceOpener>,
        writer: Box<dyn FrameWriter>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, CameraError> {
        config.validate().map_err(CameraError::Config)?;

        let (tx, rx) = unbounded();
        let session = Arc::new(Mutex::new(DeviceSession::new(
            opener,
            &config.camera,
            Arc::clone(&events),
        )));
        let frames = Arc::new(FrameBuffer::new());
        let cancel = CaptureCancel::new();
        let stopping = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(StreamCounters::default());
        let intake = CaptureIntake::new(config.capture.queue_capacity);
        let shutdown_timeout = config.worker.shutdown_timeout();

        let worker = Worker::new(
            Arc::clone(&session),
            Arc::clone(&frames),
            rx,
            Arc::clone(&events),
            writer,
            cancel.clone(),
            Arc::clone(&stopping),
            Arc::clone(&counters),
            config,
        );
        let handle = std::thread::Builder::new()
            .name("kioskcam-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| CameraError::Worker(format!("spawn failed: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                commands: tx,
                intake,
                cancel,
                stopping,
                frames,
                session,
                counters,
                events,
                worker: Mutex::new(Some(handle)),
                shutdown_timeout,
            }),
        })
    }

    /// Start a manager on real hardware through nokhwa.
    #[cfg(feature = "native")]
    pub fn with_native_backend(
        config: KioskCamConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, CameraError> {
        let opener = crate::device::native::NativeOpener::new(&config.camera);
        Self::start(
            config,
            Box::new(opener),
            Box::new(crate::storage::JpegWriter),
            events,
        )
    }

    fn send(&self, command: Command) -> bool {
        let name = command.name();
        match self.inner.commands.send(command) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("Camera worker is gone, dropping {}", name);
                false
            }
        }
    }

    pub fn set_device_index(&self, index: u32) {
        self.send(Command::SetDeviceIndex(index));
    }

    pub fn start_stream(&self) {
        self.send(Command::StartStream);
    }

    pub fn stop_stream(&self) {
        self.send(Command::StopStream);
    }

    pub fn set_resolution(&self, width: u32, height: u32) {
        self.send(Command::SetResolution(Resolution::new(width, height)));
    }

    /// Queue a property write. Writes are coalesced per property and applied
    /// on the worker's debounce interval.
    pub fn set_property(&self, id: PropertyId, value: f64) {
        self.send(Command::SetProperty(id, value));
    }

    /// Queue a capture. Returns false when the capture queue is full or the
    /// worker is gone; in the latter case `result_slot` still receives an
    /// abandoned result.
    ///
    /// With `options.block` set, waits for the request to resolve (bounded by
    /// `options.timeout` when given) before returning.
    pub fn capture(&self, options: CaptureOptions, result_slot: Option<ResultSlot>) -> bool {
        let Some(permit) = self.inner.intake.try_acquire() else {
            log::warn!(
                "Capture rejected: {} captures already pending",
                self.inner.intake.capacity()
            );
            self.inner.events.emit(CameraEvent::CaptureQueueFull {
                capacity: self.inner.intake.capacity(),
            });
            return false;
        };

        let completion = CompletionSignal::new();
        let request = CaptureRequest::new(&options, completion.clone(), result_slot, Some(permit));
        self.inner.events.emit(CameraEvent::CaptureEnqueued {
            request_id: request.id,
            pending: self.inner.intake.pending(),
        });
        if !self.send(Command::Capture(request)) {
            return false;
        }

        if options.block {
            match options.timeout {
                Some(timeout) => {
                    if !completion.wait_timeout(timeout) {
                        log::debug!("Capture still running after {:?}", timeout);
                    }
                }
                None => completion.wait(),
            }
        }
        true
    }

    /// Queue a capture and wait for its result. `None` when it was rejected.
    pub fn capture_and_wait(&self, options: CaptureOptions) -> Option<CaptureResult> {
        let slot = ResultSlot::new();
        let options = CaptureOptions {
            block: true,
            timeout: None,
            ..options
        };
        if !self.capture(options, Some(slot.clone())) {
            return None;
        }
        slot.get()
    }

    /// Ask the running (or next queued) capture to stop at its next check.
    /// Does nothing when no capture is pending.
    pub fn cancel_capture(&self) {
        let pending = self.inner.intake.pending();
        if pending == 0 {
            log::debug!("Cancel ignored: no capture pending");
            return;
        }
        self.inner.cancel.request();
        self.inner
            .events
            .emit(CameraEvent::CaptureCancelRequest { pending });
    }

    /// Labels of the candidates the device supports. Blocks until the worker
    /// has probed them.
    pub fn probe_resolutions(&self, candidates: Vec<ResolutionCandidate>) -> Vec<String> {
        let (reply, response) = bounded(1);
        if !self.send(Command::Probe { candidates, reply }) {
            return Vec::new();
        }
        response.recv().unwrap_or_default()
    }

    /// Copy of the most recent preview frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.inner.frames.latest()
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.counters.snapshot(self.inner.intake.pending())
    }

    /// Open the driver's own settings dialog. Runs on the calling thread and
    /// waits for any in-progress device work to finish.
    pub fn show_driver_settings(&self) -> Result<(), CameraError> {
        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !session.ensure_open() {
            return Err(CameraError::NotOpen);
        }
        session.open_settings_dialog()
    }

    /// Toggle automatic exposure and white balance on the calling thread.
    pub fn set_auto_modes(&self, exposure: bool, white_balance: bool) -> Result<(), CameraError> {
        let mut session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !session.ensure_open() {
            return Err(CameraError::NotOpen);
        }
        session.set_auto_modes(exposure, white_balance)
    }

    /// Stop the worker and release the device. Pending captures resolve as
    /// cancelled. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn shutdown(&self) {
        let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        // Abort the running capture; everything still queued is discarded.
        self.stopping.store(true, Ordering::Release);
        self.cancel.request();
        let _ = self.commands.send(Command::Shutdown);

        let start = Instant::now();
        let mut handle = Some(handle);
        loop {
            let finished = handle.as_ref().is_some_and(|h| h.is_finished());
            if finished {
                if let Some(h) = handle.take() {
                    if h.join().is_err() {
                        log::error!("Camera worker panicked");
                    }
                }
                break;
            }
            if start.elapsed() >= self.shutdown_timeout {
                log::warn!(
                    "Camera worker did not stop within {:?}, detaching",
                    self.shutdown_timeout
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
