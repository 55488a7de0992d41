//! The camera worker thread
//!
//! One worker owns the device for the lifetime of a manager. Each tick it
//! drains a bounded number of commands, flushes debounced property writes,
//! reads one preview frame (or idles), and lets the watchdog look at the
//! stream.

use crate::capture::{self, CaptureContext, MismatchTracker};
use crate::command::{CaptureCancel, CaptureRequest, Command, PendingPropertyMap};
use crate::config::KioskCamConfig;
use crate::events::{CameraEvent, EventSink};
use crate::frame_buffer::FrameBuffer;
use crate::probe;
use crate::session::DeviceSession;
use crate::storage::FrameWriter;
use crate::types::Resolution;
use crate::watchdog::{Watchdog, WatchdogAction};
use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

/// Counters shared between the worker and the manager handle.
#[derive(Debug, Default)]
pub struct StreamCounters {
    frames_ok: AtomicU64,
    frames_failed: AtomicU64,
    consecutive_failures: AtomicU64,
    captures_completed: AtomicU64,
    streaming: AtomicBool,
    device_open: AtomicBool,
}

impl StreamCounters {
    pub fn snapshot(&self, pending_captures: usize) -> StreamStats {
        StreamStats {
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            captures_completed: self.captures_completed.load(Ordering::Relaxed),
            streaming: self.streaming.load(Ordering::Relaxed),
            device_open: self.device_open.load(Ordering::Relaxed),
            pending_captures,
        }
    }
}

/// Point-in-time view of the worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub frames_ok: u64,
    pub frames_failed: u64,
    pub consecutive_failures: u64,
    pub captures_completed: u64,
    pub streaming: bool,
    pub device_open: bool,
    pub pending_captures: usize,
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Worker {
    session: Arc<Mutex<DeviceSession>>,
    frames: Arc<FrameBuffer>,
    commands: Receiver<Command>,
    events: Arc<dyn EventSink>,
    writer: Box<dyn FrameWriter>,
    cancel: CaptureCancel,
    stopping: Arc<AtomicBool>,
    counters: Arc<StreamCounters>,
    config: KioskCamConfig,
    pending_properties: PendingPropertyMap,
    mismatches: MismatchTracker,
    watchdog: Watchdog,
    stream_enabled: bool,
    last_capture_at: Option<Instant>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Mutex<DeviceSession>>,
        frames: Arc<FrameBuffer>,
        commands: Receiver<Command>,
        events: Arc<dyn EventSink>,
        writer: Box<dyn FrameWriter>,
        cancel: CaptureCancel,
        stopping: Arc<AtomicBool>,
        counters: Arc<StreamCounters>,
        config: KioskCamConfig,
    ) -> Self {
        let watchdog = Watchdog::new(config.watchdog.clone(), Arc::clone(&events));
        Self {
            session,
            frames,
            commands,
            events,
            writer,
            cancel,
            stopping,
            counters,
            config,
            pending_properties: PendingPropertyMap::new(),
            mismatches: MismatchTracker::new(),
            watchdog,
            stream_enabled: false,
            last_capture_at: None,
        }
    }

    pub fn run(mut self) {
        log::info!("Camera worker started");
        loop {
            if let Flow::Shutdown = self.drain_commands() {
                break;
            }
            self.flush_properties(Instant::now());
            if self.stream_enabled {
                self.read_once();
            } else {
                thread::sleep(self.config.worker.idle_sleep());
            }
            self.supervise(Instant::now());
        }
        self.shutdown();
        log::info!("Camera worker stopped");
    }

    fn drain_commands(&mut self) -> Flow {
        for _ in 0..self.config.worker.max_ops_per_tick {
            // Queued work is discarded once the manager is stopping.
            if self.stopping.load(Ordering::Acquire) {
                return Flow::Shutdown;
            }
            match self.commands.try_recv() {
                Ok(command) => {
                    if let Flow::Shutdown = self.handle(command) {
                        return Flow::Shutdown;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Flow::Shutdown,
            }
        }
        Flow::Continue
    }

    fn handle(&mut self, command: Command) -> Flow {
        log::debug!("Handling command {}", command.name());
        match command {
            Command::SetDeviceIndex(index) => {
                let reopened = {
                    let mut session = self.lock_session();
                    session.set_index(index);
                    session.open().is_ok()
                };
                self.sync_device_open();
                if reopened && self.stream_enabled {
                    self.start_stream(false);
                }
            }
            Command::StartStream => {
                self.start_stream(false);
            }
            Command::StopStream => {
                self.events.emit(CameraEvent::StreamStopRequest);
                self.set_streaming(false);
                self.watchdog.note_stream_stopped();
            }
            Command::SetResolution(resolution) => self.set_resolution(resolution),
            Command::SetProperty(id, value) => self.pending_properties.insert(id, value),
            Command::Capture(request) => self.run_capture(request),
            Command::Probe { candidates, reply } => {
                let supported = {
                    let session = Arc::clone(&self.session);
                    let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                    probe::probe_resolutions(
                        &mut session,
                        &candidates,
                        self.config.capture.resolution_tolerance,
                        self.events.as_ref(),
                    )
                };
                self.sync_device_open();
                if reply.send(supported).is_err() {
                    log::debug!("Probe caller went away before the reply");
                }
            }
            Command::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, DeviceSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_device_open(&self) {
        let open = self.lock_session().is_open();
        self.counters.device_open.store(open, Ordering::Relaxed);
    }

    fn set_streaming(&mut self, enabled: bool) {
        self.stream_enabled = enabled;
        self.counters.streaming.store(enabled, Ordering::Relaxed);
    }

    /// Bring the stream up at the preview configuration. Returns false and
    /// leaves streaming disabled when the device cannot be opened.
    fn start_stream(&mut self, force_reopen: bool) -> bool {
        self.events
            .emit(CameraEvent::StreamStartRequest { force_reopen });
        match self.bring_up(force_reopen) {
            Some(_) => {
                self.set_streaming(true);
                true
            }
            None => {
                log::warn!("Stream start failed: camera unavailable");
                self.set_streaming(false);
                false
            }
        }
    }

    /// Open (or reopen), apply the preview and warm the buffer.
    fn bring_up(&mut self, force_reopen: bool) -> Option<Resolution> {
        let warm_reads = self.config.capture.resume_warmup_reads;
        let (resolution, warm_ok) = {
            let session = Arc::clone(&self.session);
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            let ready = if force_reopen {
                session.open().is_ok()
            } else {
                session.ensure_open()
            };
            self.counters.device_open.store(ready, Ordering::Relaxed);
            if !ready {
                return None;
            }

            let resolution = match session.apply_preview() {
                Ok(resolution) => resolution,
                Err(e) => {
                    log::warn!("Failed to apply preview settings: {}", e);
                    session.current_resolution().unwrap_or_default()
                }
            };
            let mut warm_ok = false;
            for _ in 0..warm_reads {
                match session.read_frame() {
                    Ok(frame) => {
                        self.frames.store(frame);
                        warm_ok = true;
                    }
                    Err(e) => log::debug!("Stream warm-up read failed: {}", e),
                }
            }
            (resolution, warm_ok)
        };

        self.counters.consecutive_failures.store(0, Ordering::Relaxed);
        self.watchdog.note_stream_started(Instant::now());
        self.events
            .emit(CameraEvent::StreamStartApplied { resolution, warm_ok });
        Some(resolution)
    }

    fn set_resolution(&mut self, requested: Resolution) {
        let effective = {
            let mut session = self.lock_session();
            session.set_preview(requested);
            if !session.is_open() {
                log::debug!("Preview set to {} for the next open", requested);
                return;
            }
            match session.apply_preview() {
                Ok(effective) => effective,
                Err(e) => {
                    log::warn!("Failed to apply preview {}: {}", requested, e);
                    return;
                }
            }
        };
        if effective != requested {
            log::info!("Preview {} requested, driver chose {}", requested, effective);
        }
        self.events
            .emit(CameraEvent::CameraResolutionChange { requested, effective });
    }

    fn flush_properties(&mut self, now: Instant) {
        if !self
            .pending_properties
            .is_due(now, self.config.worker.property_debounce())
        {
            return;
        }

        let session = Arc::clone(&self.session);
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        if !session.ensure_open_throttled(now) {
            return;
        }
        let values = self.pending_properties.take(now);
        let mut failed = 0;
        for (id, value) in &values {
            if let Err(e) = session.set_property(*id, *value) {
                log::debug!("Property {} = {} not applied: {}", id.as_str(), value, e);
                failed += 1;
            }
        }
        drop(session);
        self.sync_device_open();
        self.events.emit(CameraEvent::PropertiesApplied {
            count: values.len(),
            failed,
        });
    }

    fn read_once(&mut self) {
        let now = Instant::now();
        let (read, backend) = {
            let mut session = self.lock_session();
            if !session.ensure_open_throttled(now) {
                drop(session);
                thread::sleep(self.config.worker.idle_sleep());
                return;
            }
            (session.read_frame(), session.backend())
        };

        match read {
            Ok(frame) => {
                self.frames.store(frame);
                self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                let frames_ok = self.counters.frames_ok.fetch_add(1, Ordering::Relaxed) + 1;
                let every = self.config.worker.heartbeat_frames;
                if every > 0 && frames_ok % every == 0 {
                    self.events.emit(CameraEvent::CameraLoopHeartbeat {
                        frames_ok,
                        frames_failed: self.counters.frames_failed.load(Ordering::Relaxed),
                        backend,
                        last_capture_age_ms: self
                            .last_capture_at
                            .map(|at| at.elapsed().as_millis() as u64),
                    });
                }
            }
            Err(e) => {
                let total = self.counters.frames_failed.fetch_add(1, Ordering::Relaxed) + 1;
                let consecutive = self
                    .counters
                    .consecutive_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if self.should_report_read_failure(consecutive) {
                    log::warn!("{} consecutive frame read failures: {}", consecutive, e);
                    self.events.emit(CameraEvent::FrameReadError {
                        consecutive,
                        total_failures: total,
                        message: e.to_string(),
                    });
                }
                thread::sleep(self.config.worker.read_fail_backoff());
            }
        }
    }

    fn should_report_read_failure(&self, consecutive: u64) -> bool {
        let first = self.config.worker.read_fail_report_first;
        let every = self.config.worker.read_fail_report_every;
        consecutive == first || (consecutive > first && (consecutive - first) % every == 0)
    }

    fn run_capture(&mut self, request: CaptureRequest) {
        let report = {
            let session = Arc::clone(&self.session);
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            let ctx = CaptureContext {
                session: &mut session,
                frames: &self.frames,
                writer: self.writer.as_ref(),
                events: self.events.as_ref(),
                cancel: &self.cancel,
                settings: &self.config.capture,
                mismatches: &mut self.mismatches,
                streaming: self.stream_enabled,
            };
            capture::run(ctx, &request)
        };

        self.set_streaming(report.stream_enabled);
        if report.arm_watchdog {
            self.watchdog.arm_resume(report.ended_at);
        }
        self.sync_device_open();
        self.last_capture_at = Some(report.ended_at);
        self.counters
            .captures_completed
            .fetch_add(1, Ordering::Relaxed);

        request.resolve(report.result);
        // Only now may a cancel target the next capture.
        self.cancel.advance();
    }

    fn supervise(&mut self, now: Instant) {
        let action = self
            .watchdog
            .tick(now, self.frames.last_frame_at(), self.stream_enabled);
        match action {
            WatchdogAction::None => {}
            WatchdogAction::ForceReopen => {
                if self.bring_up(true).is_none() {
                    log::warn!("Post-capture reopen failed");
                }
                self.watchdog.reopen_done(Instant::now());
            }
            WatchdogAction::RestartStream => {
                let ok = self.bring_up(true).is_some();
                self.events.emit(CameraEvent::StreamWatchdogRecover { ok });
            }
        }
    }

    fn shutdown(&mut self) {
        for command in self.commands.try_iter() {
            self.events.emit(CameraEvent::CommandDiscarded {
                command: command.name().to_string(),
            });
            if let Command::Probe { reply, .. } = command {
                if reply.send(Vec::new()).is_err() {
                    log::debug!("Probe caller went away before the reply");
                }
            }
            // Dropping a capture request resolves it as abandoned.
        }
        self.set_streaming(false);
        self.lock_session().close();
        self.counters.device_open.store(false, Ordering::Relaxed);
    }
}
