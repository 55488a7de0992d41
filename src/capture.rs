//! Still capture sequence
//!
//! A capture runs on the worker thread and is the only code allowed to
//! reconfigure the device mid-stream. It moves through explicit states:
//!
//! ```text
//! FastPathCheck -> FastSave -> Done
//!               -> Pause -> Negotiate -> Warmup -> Acquire -> Save -> Resume -> Done
//!                                                          (read failed) -> Resume
//! ```
//!
//! Cancellation and the hard deadline are checked at the start of every
//! stage and once more between acquisition and save; either one skips
//! straight to `Resume` without writing a file.

use crate::command::{CaptureCancel, CaptureRequest};
use crate::config::CaptureSettings;
use crate::device::CaptureDevice;
use crate::events::{CameraEvent, CapturePhase, EventSink};
use crate::frame_buffer::FrameBuffer;
use crate::quality;
use crate::session::DeviceSession;
use crate::storage::{timestamped_path, FrameWriter};
use crate::types::{suggest_downgrade, CaptureResult, Frame, PixelFormat, Resolution};
use chrono::Local;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of resolution negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Size the driver reports after negotiation
    pub effective: Resolution,
    /// `effective` is outside tolerance of the first candidate
    pub mismatch: bool,
    /// Best size achieved in each pass that did not satisfy the first candidate
    pub failed_passes: Vec<Resolution>,
    /// `abort` fired before negotiation finished
    pub aborted: bool,
}

/// Set-and-read-back each candidate in order and accept the first the driver
/// honours within `tolerance`. A pass that does not satisfy the first
/// candidate is repeated up to `max_retries` times, re-asserting MJPEG when
/// `reassert_mjpeg` is set. When every pass falls short the closest size
/// achieved is re-applied and reported as a mismatch.
///
/// `abort` is polled before every pass and every candidate; once it returns
/// true the device is left where it is and the result is marked aborted.
pub fn negotiate_resolution(
    device: &mut dyn CaptureDevice,
    candidates: &[Resolution],
    tolerance: u32,
    max_retries: u32,
    reassert_mjpeg: bool,
    abort: &mut dyn FnMut() -> bool,
) -> Negotiation {
    let Some(&first) = candidates.first() else {
        return Negotiation {
            effective: device.resolution(),
            mismatch: false,
            failed_passes: Vec::new(),
            aborted: false,
        };
    };

    let mut closest: Option<Resolution> = None;
    let mut accepted: Option<Resolution> = None;
    let mut failed_passes = Vec::new();

    for pass in 0..=max_retries {
        if abort() {
            return interrupted(&*device, first, tolerance, failed_passes);
        }
        if pass > 0 && reassert_mjpeg {
            if let Err(e) = device.set_pixel_format(PixelFormat::Mjpeg) {
                log::debug!("MJPEG re-assert failed: {}", e);
            }
        }

        accepted = None;
        for &candidate in candidates {
            if abort() {
                return interrupted(&*device, first, tolerance, failed_passes);
            }
            if let Err(e) = device.set_resolution(candidate) {
                log::debug!("Driver rejected {}: {}", candidate, e);
            }
            let achieved = device.resolution();
            if closest.map_or(true, |c| achieved.distance(first) < c.distance(first)) {
                closest = Some(achieved);
            }
            if achieved.within(candidate, tolerance) {
                accepted = Some(achieved);
                break;
            }
        }

        if let Some(size) = accepted {
            if size.within(first, tolerance) {
                return Negotiation {
                    effective: size,
                    mismatch: false,
                    failed_passes,
                    aborted: false,
                };
            }
        }
        failed_passes.push(accepted.or(closest).unwrap_or_else(|| device.resolution()));
    }

    let target = accepted.or(closest).unwrap_or_else(|| device.resolution());
    if device.resolution() != target {
        if let Err(e) = device.set_resolution(target) {
            log::debug!("Could not return to {}: {}", target, e);
        }
    }
    let effective = device.resolution();
    Negotiation {
        effective,
        mismatch: !effective.within(first, tolerance),
        failed_passes,
        aborted: false,
    }
}

fn interrupted(
    device: &dyn CaptureDevice,
    first: Resolution,
    tolerance: u32,
    failed_passes: Vec<Resolution>,
) -> Negotiation {
    let effective = device.resolution();
    Negotiation {
        effective,
        mismatch: !effective.within(first, tolerance),
        failed_passes,
        aborted: true,
    }
}

/// Counts consecutive mismatches per requested size.
#[derive(Debug, Default)]
pub struct MismatchTracker {
    requested: Option<Resolution>,
    consecutive: u32,
}

impl MismatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome. Returns the mismatch streak for `requested`.
    pub fn record(&mut self, requested: Resolution, mismatch: bool) -> u32 {
        if self.requested != Some(requested) {
            self.requested = Some(requested);
            self.consecutive = 0;
        }
        if mismatch {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive
    }
}

/// Everything a capture borrows from the worker for its duration.
pub struct CaptureContext<'a> {
    pub session: &'a mut DeviceSession,
    pub frames: &'a FrameBuffer,
    pub writer: &'a dyn FrameWriter,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CaptureCancel,
    pub settings: &'a CaptureSettings,
    pub mismatches: &'a mut MismatchTracker,
    /// Preview streaming was enabled when the capture started
    pub streaming: bool,
}

/// What the worker needs to know once a capture finishes.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub result: CaptureResult,
    /// Streaming should be enabled after the capture
    pub stream_enabled: bool,
    /// The stream was paused and resumed; verify it recovers
    pub arm_watchdog: bool,
    pub ended_at: Instant,
}

enum CaptureState {
    FastPathCheck,
    FastSave(Frame),
    Pause,
    Negotiate,
    Warmup,
    Acquire,
    Save(Frame),
    Resume,
    Done,
}

struct CaptureRun<'r, 'a> {
    ctx: CaptureContext<'a>,
    request: &'r CaptureRequest,
    requested: Resolution,
    started: Instant,
    deadline: Instant,
    result: CaptureResult,
    paused: bool,
    stream_enabled: bool,
    arm_watchdog: bool,
}

/// Run one capture request to completion. Never fails: every outcome is
/// expressed in the returned report's result.
pub fn run(ctx: CaptureContext<'_>, request: &CaptureRequest) -> CaptureReport {
    let started = Instant::now();
    let requested = request.requested();
    let streaming = ctx.streaming;

    ctx.events.emit(CameraEvent::CaptureBegin {
        request_id: request.id,
        dest: request.dest_folder.clone(),
        requested,
        streaming,
    });
    log::info!(
        "Capture {} requested at {} into {:?}",
        request.id,
        requested,
        request.dest_folder
    );

    let deadline = started + ctx.settings.max_duration();
    let mut run = CaptureRun {
        ctx,
        request,
        requested,
        started,
        deadline,
        result: CaptureResult::default(),
        paused: false,
        stream_enabled: streaming,
        arm_watchdog: false,
    };

    let mut state = CaptureState::FastPathCheck;
    loop {
        state = match state {
            CaptureState::FastPathCheck => run.fast_path_check(),
            CaptureState::FastSave(frame) => {
                run.save(frame);
                CaptureState::Done
            }
            CaptureState::Pause => run.pause(),
            CaptureState::Negotiate => run.negotiate(),
            CaptureState::Warmup => run.warmup(),
            CaptureState::Acquire => run.acquire(),
            CaptureState::Save(frame) => {
                run.save(frame);
                CaptureState::Resume
            }
            CaptureState::Resume => run.resume(),
            CaptureState::Done => break,
        };
    }

    run.finish()
}

impl<'r, 'a> CaptureRun<'r, 'a> {
    /// Cancel wins over the deadline when both apply.
    fn should_abort(&mut self, phase: CapturePhase) -> bool {
        let request_id = self.request.id;
        if self.ctx.cancel.is_requested() {
            log::info!("Capture {} cancelled during {:?}", request_id, phase);
            self.result.cancelled = true;
            self.ctx
                .events
                .emit(CameraEvent::CaptureCancelled { request_id, phase });
            return true;
        }
        let now = Instant::now();
        if now >= self.deadline {
            let elapsed_ms = now.saturating_duration_since(self.started).as_millis() as u64;
            log::warn!(
                "Capture {} exceeded its deadline during {:?} ({} ms)",
                request_id,
                phase,
                elapsed_ms
            );
            self.result.timed_out = true;
            self.ctx.events.emit(CameraEvent::CaptureTimeout {
                request_id,
                phase,
                elapsed_ms,
            });
            return true;
        }
        false
    }

    fn fast_path_check(&mut self) -> CaptureState {
        if self.should_abort(CapturePhase::FastPath) {
            return CaptureState::Done;
        }
        if !self.ctx.streaming {
            return CaptureState::Pause;
        }

        let tolerance = self.ctx.settings.resolution_tolerance;
        let Some(current) = self.ctx.session.current_resolution() else {
            return CaptureState::Pause;
        };
        if !self.requested.within(current, tolerance) {
            return CaptureState::Pause;
        }
        let Some(frame) = self.ctx.frames.latest() else {
            return CaptureState::Pause;
        };
        let age = frame.age();
        if age >= self.ctx.settings.fast_path_max_age() {
            return CaptureState::Pause;
        }

        self.result.fast_path = true;
        self.ctx.events.emit(CameraEvent::CaptureFastPathUsed {
            request_id: self.request.id,
            frame_age_ms: age.as_millis() as u64,
        });
        CaptureState::FastSave(frame)
    }

    fn pause(&mut self) -> CaptureState {
        // Frames are only read by the worker, and the worker is here.
        self.paused = self.ctx.streaming;
        self.stream_enabled = false;
        CaptureState::Negotiate
    }

    fn negotiate(&mut self) -> CaptureState {
        if self.should_abort(CapturePhase::Negotiate) {
            return CaptureState::Resume;
        }
        let request_id = self.request.id;

        if !self.ctx.session.ensure_open() {
            self.result.failure = Some("device could not be opened".to_string());
            self.ctx.events.emit(CameraEvent::Error {
                phase: "capture_open".to_string(),
                message: "device could not be opened".to_string(),
            });
            return CaptureState::Resume;
        }

        let settings = self.ctx.settings;
        let tolerance = settings.resolution_tolerance;
        if let Some(current) = self.ctx.session.current_resolution() {
            if current.within(self.requested, tolerance) {
                self.ctx
                    .events
                    .emit(CameraEvent::CaptureResolutionSkip { request_id, current });
                self.result.effective = current;
                self.record_mismatch(false);
                return CaptureState::Warmup;
            }
        }

        let reassert = self.ctx.session.uses_mjpg();
        let cancel = self.ctx.cancel;
        let deadline = self.deadline;
        let mut stop_requested = || cancel.is_requested() || Instant::now() >= deadline;
        let Some(device) = self.ctx.session.device() else {
            self.result.failure = Some("device closed during negotiation".to_string());
            return CaptureState::Resume;
        };
        let negotiation = negotiate_resolution(
            device,
            &self.request.preferred_sizes,
            tolerance,
            settings.resolution_max_retries,
            reassert,
            &mut stop_requested,
        );
        if negotiation.aborted {
            self.result.effective = negotiation.effective;
            self.should_abort(CapturePhase::Negotiate);
            return CaptureState::Resume;
        }

        for (retry, effective) in negotiation.failed_passes.iter().enumerate() {
            self.ctx.events.emit(CameraEvent::CaptureResolutionMismatch {
                request_id,
                requested: self.requested,
                effective: *effective,
                retry: retry as u32,
            });
        }
        if negotiation.mismatch {
            log::warn!(
                "Capture {} wanted {}, driver settled on {}",
                request_id,
                self.requested,
                negotiation.effective
            );
        } else {
            self.ctx.events.emit(CameraEvent::CaptureResolutionEffective {
                request_id,
                requested: self.requested,
                effective: negotiation.effective,
            });
        }

        self.result.effective = negotiation.effective;
        self.result.mismatch = negotiation.mismatch;
        self.record_mismatch(negotiation.mismatch);
        CaptureState::Warmup
    }

    fn record_mismatch(&mut self, mismatch: bool) {
        let streak = self.ctx.mismatches.record(self.requested, mismatch);
        if streak < self.ctx.settings.mismatch_downgrade_threshold {
            return;
        }
        if let Some(suggested) = suggest_downgrade(self.requested) {
            log::warn!(
                "{} refused {} times in a row, suggesting {}",
                self.requested,
                streak,
                suggested
            );
            self.result.downgrade_suggestion = Some(suggested);
            self.ctx.events.emit(CameraEvent::ResolutionSuggestDowngrade {
                requested: self.requested,
                suggested,
                mismatches: streak,
            });
        }
    }

    fn warmup(&mut self) -> CaptureState {
        let settings = self.ctx.settings;
        let warm_deadline = (Instant::now() + settings.warmup_timeout()).min(self.deadline);

        for read in 0..settings.warmup_frames {
            if self.should_abort(CapturePhase::Warmup) {
                return CaptureState::Resume;
            }
            if Instant::now() >= warm_deadline {
                break;
            }
            if let Err(e) = self.ctx.session.read_frame() {
                self.ctx.events.emit(CameraEvent::CaptureWarmupReadError {
                    request_id: self.request.id,
                    message: e.to_string(),
                });
            }
            if read + 1 < settings.warmup_frames {
                let remaining = warm_deadline.saturating_duration_since(Instant::now());
                sleep_at_most(settings.cancel_poll(), remaining);
            }
        }
        CaptureState::Acquire
    }

    fn acquire(&mut self) -> CaptureState {
        if self.should_abort(CapturePhase::Acquire) {
            return CaptureState::Resume;
        }

        match self.ctx.session.read_frame() {
            Ok(frame) => {
                if self.should_abort(CapturePhase::Save) {
                    return CaptureState::Resume;
                }
                CaptureState::Save(frame)
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("Capture {} frame read failed: {}", self.request.id, message);
                let event = CameraEvent::CaptureFrameReadFail {
                    request_id: self.request.id,
                    message: message.clone(),
                };
                self.ctx.events.folder_log(&self.request.dest_folder, &event);
                self.ctx.events.emit(event);
                self.result.failure = Some(message);
                CaptureState::Resume
            }
        }
    }

    fn save(&mut self, frame: Frame) {
        let request = self.request;
        let request_id = request.id;
        let dest = &request.dest_folder;
        let tolerance = self.ctx.settings.resolution_tolerance;

        // The frame is the ground truth for what was captured.
        let actual = frame.resolution();
        if self.result.fast_path || actual != self.result.effective {
            self.result.effective = actual;
            self.result.mismatch = !actual.within(self.requested, tolerance);
        }

        let path = match self
            .ctx
            .writer
            .ensure_dir(dest)
            .map(|_| timestamped_path(dest, Local::now()))
            .and_then(|path| {
                self.ctx
                    .writer
                    .write_jpeg(&frame, &path, request.quality)
                    .map(|_| path)
            }) {
            Ok(path) => path,
            Err(e) => {
                log::error!("Capture {} could not be saved: {}", request_id, e);
                let event = CameraEvent::CaptureSaveError {
                    request_id,
                    message: e.to_string(),
                };
                self.ctx.events.folder_log(dest, &event);
                self.ctx.events.emit(event);
                self.result.failure = Some(e.to_string());
                return;
            }
        };

        log::info!("Capture {} saved to {:?} at {}", request_id, path, actual);
        self.ctx.events.emit(CameraEvent::CaptureSaveOk {
            request_id,
            path: path.clone(),
            resolution: actual,
        });

        if let Some(mean_brightness) =
            quality::black_level(&frame, self.ctx.settings.black_frame_threshold)
        {
            log::warn!(
                "Capture {} looks black (mean brightness {:.1})",
                request_id,
                mean_brightness
            );
            let event = CameraEvent::CaptureBlack {
                request_id,
                path: path.clone(),
                mean_brightness,
            };
            self.ctx.events.folder_log(dest, &event);
            self.ctx.events.emit(event);
        }
        self.result.saved_path = Some(path);
    }

    fn resume(&mut self) -> CaptureState {
        if !self.paused {
            return CaptureState::Done;
        }
        if !self.request.auto_resume {
            log::debug!("Capture {} leaves the preview paused", self.request.id);
            self.stream_enabled = false;
            return CaptureState::Done;
        }

        let session = &mut *self.ctx.session;
        if session.ensure_open() {
            if let Err(e) = session.apply_preview() {
                log::warn!("Failed to restore preview after capture: {}", e);
            }
            for _ in 0..self.ctx.settings.resume_warmup_reads {
                match session.read_frame() {
                    Ok(frame) => self.ctx.frames.store(frame),
                    Err(e) => log::debug!("Resume warm-up read failed: {}", e),
                }
            }
        }
        self.stream_enabled = true;
        self.arm_watchdog = true;
        CaptureState::Done
    }

    fn finish(self) -> CaptureReport {
        let ended_at = Instant::now();
        let result = self.result;
        self.ctx.events.emit(CameraEvent::CaptureEnd {
            request_id: self.request.id,
            duration_ms: ended_at.saturating_duration_since(self.started).as_millis() as u64,
            effective: result.effective,
            mismatch: result.mismatch,
            cancelled: result.cancelled,
            timed_out: result.timed_out,
            saved: result.saved_path.is_some(),
        });
        CaptureReport {
            result,
            stream_enabled: self.stream_enabled,
            arm_watchdog: self.arm_watchdog,
            ended_at,
        }
    }
}

fn sleep_at_most(step: Duration, remaining: Duration) {
    let nap = step.min(remaining);
    if !nap.is_zero() {
        thread::sleep(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CaptureOptions, CompletionSignal};
    use crate::config::CameraSettings;
    use crate::events::Telemetry;
    use crate::storage::JpegWriter;
    use crate::device::DeviceOpener;
    use crate::testing::{MockBehavior, MockCamera};
    use std::sync::Arc;

    struct Harness {
        camera: MockCamera,
        session: DeviceSession,
        frames: FrameBuffer,
        telemetry: Arc<Telemetry>,
        cancel: CaptureCancel,
        settings: CaptureSettings,
        mismatches: MismatchTracker,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(behavior: MockBehavior) -> Self {
            let camera = MockCamera::new(behavior);
            let telemetry = Arc::new(Telemetry::in_memory());
            let camera_settings = CameraSettings {
                preview_resolution: [320, 240],
                ..Default::default()
            };
            let session =
                DeviceSession::new(Box::new(camera.opener()), &camera_settings, telemetry.clone());
            Self {
                camera,
                session,
                frames: FrameBuffer::new(),
                telemetry,
                cancel: CaptureCancel::new(),
                settings: CaptureSettings {
                    cancel_poll_ms: 5,
                    ..Default::default()
                },
                mismatches: MismatchTracker::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn capture(&mut self, options: CaptureOptions, streaming: bool) -> CaptureReport {
            let request = CaptureRequest::new(&options, CompletionSignal::new(), None, None);
            let ctx = CaptureContext {
                session: &mut self.session,
                frames: &self.frames,
                writer: &JpegWriter,
                events: self.telemetry.as_ref(),
                cancel: &self.cancel,
                settings: &self.settings,
                mismatches: &mut self.mismatches,
                streaming,
            };
            run(ctx, &request)
        }

        fn options(&self, width: u32, height: u32) -> CaptureOptions {
            CaptureOptions::new(self.dir.path()).with_size(width, height)
        }

        fn jpeg_count(&self) -> usize {
            std::fs::read_dir(self.dir.path())
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .filter(|e| e.path().extension().is_some_and(|x| x == "jpg"))
                        .count()
                })
                .unwrap_or(0)
        }
    }

    fn quick() -> MockBehavior {
        MockBehavior {
            read_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_negotiation_accepts_first_honoured_candidate() {
        let camera = MockCamera::capped(1280, 720);
        let mut device = camera.opener().open(0, crate::types::BackendKind::Auto).unwrap();
        let negotiation = negotiate_resolution(
            device.as_mut(),
            &[Resolution::new(1920, 1080), Resolution::new(1280, 720)],
            16,
            1,
            true,
            &mut || false,
        );
        assert_eq!(negotiation.effective, Resolution::new(1280, 720));
        assert!(negotiation.mismatch);
        assert_eq!(negotiation.failed_passes.len(), 2);
        // MJPEG re-asserted on the retry pass only.
        assert_eq!(camera.pixel_formats(), vec![PixelFormat::Mjpeg]);
    }

    #[test]
    fn test_negotiation_keeps_closest_when_nothing_fits() {
        let camera = MockCamera::capped(1920, 1080);
        let mut device = camera.opener().open(0, crate::types::BackendKind::Auto).unwrap();
        let negotiation = negotiate_resolution(
            device.as_mut(),
            &[Resolution::new(3840, 2160)],
            16,
            1,
            false,
            &mut || false,
        );
        assert_eq!(negotiation.effective, Resolution::new(1920, 1080));
        assert!(negotiation.mismatch);
        assert_eq!(device.resolution(), Resolution::new(1920, 1080));
    }

    #[test]
    fn test_negotiation_success_within_tolerance() {
        let camera = MockCamera::new(MockBehavior {
            modes: vec![Resolution::new(1920, 1088)],
            max_resolution: Resolution::new(4000, 3000),
            ..quick()
        });
        let mut device = camera.opener().open(0, crate::types::BackendKind::Auto).unwrap();
        let negotiation = negotiate_resolution(
            device.as_mut(),
            &[Resolution::new(1920, 1080)],
            16,
            1,
            false,
            &mut || false,
        );
        assert!(!negotiation.mismatch);
        assert_eq!(negotiation.effective, Resolution::new(1920, 1088));
        assert!(negotiation.failed_passes.is_empty());
    }

    #[test]
    fn test_negotiation_stops_between_candidates() {
        let camera = MockCamera::capped(640, 480);
        let mut device = camera.opener().open(0, crate::types::BackendKind::Auto).unwrap();
        let candidates: Vec<Resolution> = [3840, 3264, 2592, 1920, 1600, 1280]
            .iter()
            .map(|&w| Resolution::new(w, w * 9 / 16))
            .collect();
        let mut checks = 0;
        let negotiation = negotiate_resolution(
            device.as_mut(),
            &candidates,
            16,
            2,
            true,
            &mut || {
                checks += 1;
                checks > 3
            },
        );

        assert!(negotiation.aborted);
        assert_eq!(camera.resolution_requests().len(), 2);
        assert_eq!(negotiation.effective, device.resolution());
        assert!(negotiation.mismatch);
    }

    #[test]
    fn test_mismatch_tracker_streaks() {
        let mut tracker = MismatchTracker::new();
        let big = Resolution::new(3840, 2160);
        assert_eq!(tracker.record(big, true), 1);
        assert_eq!(tracker.record(big, true), 2);
        assert_eq!(tracker.record(big, false), 0);
        assert_eq!(tracker.record(big, true), 1);
        assert_eq!(tracker.record(Resolution::new(1920, 1080), true), 1);
    }

    #[test]
    fn test_capture_without_stream_writes_file() {
        let mut h = Harness::new(quick());
        let report = h.capture(h.options(640, 480), false);

        assert!(report.result.is_saved());
        assert_eq!(report.result.effective, Resolution::new(640, 480));
        assert!(!report.result.mismatch);
        assert!(!report.stream_enabled);
        assert!(!report.arm_watchdog);
        assert_eq!(h.jpeg_count(), 1);
        assert_eq!(
            h.telemetry
                .count_where(|e| matches!(e, CameraEvent::CaptureEnd { saved: true, .. })),
            1
        );
    }

    #[test]
    fn test_fast_path_uses_buffered_frame() {
        let mut h = Harness::new(quick());
        h.session.open().unwrap();
        h.frames.store(h.session.read_frame().unwrap());
        let requests_before = h.camera.resolution_requests().len();

        let report = h.capture(h.options(320, 240), true);

        assert!(report.result.fast_path);
        assert!(report.result.is_saved());
        assert!(report.stream_enabled);
        assert!(!report.arm_watchdog);
        assert_eq!(h.camera.resolution_requests().len(), requests_before);
    }

    #[test]
    fn test_stale_frame_skips_fast_path() {
        let mut h = Harness::new(quick());
        h.session.open().unwrap();
        let mut frame = h.session.read_frame().unwrap();
        frame.captured_at -= Duration::from_secs(2);
        h.frames.store(frame);

        let report = h.capture(h.options(320, 240), true);
        assert!(!report.result.fast_path);
        assert!(report.result.is_saved());
        assert!(report.arm_watchdog);
    }

    #[test]
    fn test_paused_stream_resumes_at_preview() {
        let mut h = Harness::new(quick());
        h.session.open().unwrap();

        let report = h.capture(h.options(1280, 720), true);
        assert!(report.result.is_saved());
        assert_eq!(report.result.effective, Resolution::new(1280, 720));
        assert!(report.stream_enabled);
        assert!(report.arm_watchdog);
        assert_eq!(h.session.current_resolution(), Some(Resolution::new(320, 240)));
        assert!(h.frames.latest().is_some());
    }

    #[test]
    fn test_no_auto_resume_leaves_stream_paused() {
        let mut h = Harness::new(quick());
        h.session.open().unwrap();
        let options = h.options(1280, 720).with_auto_resume(false);

        let report = h.capture(options, true);
        assert!(report.result.is_saved());
        assert!(!report.stream_enabled);
        assert!(!report.arm_watchdog);
    }

    #[test]
    fn test_cancel_before_start() {
        let mut h = Harness::new(quick());
        h.cancel.request();
        let report = h.capture(h.options(640, 480), false);

        assert!(report.result.cancelled);
        assert!(!report.result.is_saved());
        assert_eq!(h.jpeg_count(), 0);
    }

    #[test]
    fn test_deadline_exceeded_writes_nothing() {
        let mut h = Harness::new(MockBehavior {
            read_delay: Duration::from_millis(30),
            ..Default::default()
        });
        h.settings.max_duration_ms = 40;
        let report = h.capture(h.options(640, 480), false);

        assert!(report.result.timed_out);
        assert!(!report.result.cancelled);
        assert!(!report.result.is_saved());
        assert_eq!(h.jpeg_count(), 0);
    }

    #[test]
    fn test_slow_driver_times_out_during_negotiation() {
        let mut h = Harness::new(MockBehavior {
            max_resolution: Resolution::new(640, 480),
            set_resolution_delay: Duration::from_millis(100),
            ..quick()
        });
        h.settings.max_duration_ms = 250;
        let mut options = h.options(3840, 2160);
        options.preferred_sizes = [3840, 3264, 2592, 1920, 1600, 1280]
            .iter()
            .map(|&w| Resolution::new(w, w * 9 / 16))
            .collect();
        let started = Instant::now();
        let report = h.capture(options, false);

        assert!(report.result.timed_out);
        assert!(!report.result.is_saved());
        assert_eq!(h.jpeg_count(), 0);
        assert_eq!(
            h.telemetry.count_where(|e| matches!(
                e,
                CameraEvent::CaptureTimeout {
                    phase: CapturePhase::Negotiate,
                    ..
                }
            )),
            1
        );
        // Far fewer than the twelve sets a full two-pass negotiation makes.
        assert!(h.camera.resolution_requests().len() <= 5);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_black_frame_flagged_once() {
        let mut h = Harness::new(MockBehavior { fill: 0, ..quick() });
        let report = h.capture(h.options(640, 480), false);

        assert!(report.result.is_saved());
        assert_eq!(
            h.telemetry
                .count_where(|e| matches!(e, CameraEvent::CaptureBlack { .. })),
            1
        );
        let log = crate::events::folder_log_path(h.dir.path());
        let contents = std::fs::read_to_string(log).unwrap();
        assert!(contents.contains("capture_black"));
        assert_eq!(h.telemetry.failures().len(), 1);
    }

    #[test]
    fn test_open_failure_resolves_with_failure() {
        let mut h = Harness::new(MockBehavior {
            fail_open: true,
            ..quick()
        });
        let report = h.capture(h.options(640, 480), false);
        assert!(!report.result.is_saved());
        assert!(!report.result.cancelled);
        assert!(report.result.failure.is_some());
    }

    #[test]
    fn test_repeated_mismatch_suggests_downgrade() {
        let mut h = Harness::new(MockBehavior {
            max_resolution: Resolution::new(1920, 1080),
            ..quick()
        });
        let first = h.capture(h.options(3840, 2160), false);
        assert!(first.result.mismatch);
        assert!(first.result.downgrade_suggestion.is_none());

        let second = h.capture(h.options(3840, 2160), false);
        assert!(second.result.mismatch);
        assert_eq!(
            second.result.downgrade_suggestion,
            Some(Resolution::new(3264, 2448))
        );
    }
}
