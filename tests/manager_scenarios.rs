//! End-to-end scenarios for the camera manager
//!
//! Every test drives a real worker thread against the scripted camera from
//! `kioskcam::testing` and writes JPEGs into a temporary directory.

use kioskcam::events::{folder_log_path, CapturePhase};
use kioskcam::testing::{MockBehavior, MockCamera};
use kioskcam::types::{standard_candidates, ResolutionCandidate};
use kioskcam::{
    CameraEvent, CameraManager, CaptureOptions, CaptureResult, JpegWriter, KioskCamConfig,
    Resolution, ResultSlot, Telemetry,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Rig {
    camera: MockCamera,
    manager: CameraManager,
    telemetry: Arc<Telemetry>,
    dir: TempDir,
}

impl Rig {
    fn new(behavior: MockBehavior) -> Self {
        Self::with_config(behavior, |_| {})
    }

    fn with_config<F: FnOnce(&mut KioskCamConfig)>(behavior: MockBehavior, tweak: F) -> Self {
        let mut config = KioskCamConfig::default();
        config.camera.preview_resolution = [320, 240];
        config.capture.warmup_frames = 1;
        config.capture.cancel_poll_ms = 5;
        config.worker.idle_sleep_ms = 2;
        tweak(&mut config);

        let camera = MockCamera::new(behavior);
        let telemetry = Arc::new(Telemetry::in_memory().with_capacity(5000));
        let manager = CameraManager::start(
            config,
            Box::new(camera.opener()),
            Box::new(JpegWriter),
            telemetry.clone(),
        )
        .expect("manager starts");
        Self {
            camera,
            manager,
            telemetry,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn options(&self, width: u32, height: u32) -> CaptureOptions {
        CaptureOptions::new(self.dir.path()).with_size(width, height)
    }

    fn jpegs(&self) -> Vec<std::path::PathBuf> {
        jpegs_in(self.dir.path())
    }

    fn count<F: Fn(&CameraEvent) -> bool>(&self, predicate: F) -> usize {
        self.telemetry.count_where(predicate)
    }

    /// Poll until `predicate` matches at least one event or `timeout` passes.
    fn wait_for<F: Fn(&CameraEvent) -> bool>(&self, predicate: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.telemetry.count_where(&predicate) > 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn start_streaming(&self) {
        self.manager.start_stream();
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.latest_frame().is_none() {
            assert!(Instant::now() < deadline, "preview never produced a frame");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

fn jpegs_in(dir: &Path) -> Vec<std::path::PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn wait_slot(slot: &ResultSlot, timeout: Duration) -> CaptureResult {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = slot.get() {
            return result;
        }
        assert!(Instant::now() < deadline, "capture never resolved");
        thread::sleep(Duration::from_millis(5));
    }
}

fn quick() -> MockBehavior {
    MockBehavior {
        read_delay: Duration::from_millis(2),
        ..Default::default()
    }
}

#[test]
fn test_fast_path_saves_buffered_preview_frame() {
    let rig = Rig::new(quick());
    rig.start_streaming();
    let requests_before = rig.camera.resolution_requests().len();

    let result = rig
        .manager
        .capture_and_wait(rig.options(320, 240))
        .expect("capture accepted");

    assert!(result.fast_path);
    assert!(!result.mismatch);
    assert_eq!(result.effective, Resolution::new(320, 240));
    assert_eq!(rig.jpegs().len(), 1);
    assert_eq!(rig.camera.resolution_requests().len(), requests_before);
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureFastPathUsed { .. })),
        1
    );
}

#[test]
fn test_oversized_request_reports_mismatch_and_saves_driver_size() {
    let rig = Rig::new(MockBehavior {
        max_resolution: Resolution::new(1280, 720),
        ..quick()
    });
    rig.start_streaming();

    let result = rig
        .manager
        .capture_and_wait(rig.options(3840, 2160))
        .expect("capture accepted");

    assert!(result.mismatch);
    assert!(!result.fast_path);
    assert_eq!(result.effective, Resolution::new(1280, 720));
    let path = result.saved_path.expect("file written");
    assert_eq!(image::image_dimensions(&path).unwrap(), (1280, 720));
    assert!(rig.count(|e| matches!(e, CameraEvent::CaptureResolutionMismatch { .. })) >= 1);
}

#[test]
fn test_cancel_shortly_after_enqueue() {
    let rig = Rig::with_config(
        MockBehavior {
            read_delay: Duration::from_millis(20),
            ..Default::default()
        },
        |config| {
            config.capture.warmup_frames = 5;
            config.capture.cancel_poll_ms = 20;
        },
    );
    rig.start_streaming();

    let slot = ResultSlot::new();
    assert!(rig
        .manager
        .capture(rig.options(640, 480).blocking(false), Some(slot.clone())));
    thread::sleep(Duration::from_millis(10));
    rig.manager.cancel_capture();

    let result = wait_slot(&slot, Duration::from_secs(5));
    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(result.saved_path.is_none());
    assert!(rig.jpegs().is_empty());
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureCancelled { .. })),
        1
    );
}

#[test]
fn test_cancel_interrupts_slow_negotiation() {
    let rig = Rig::with_config(
        MockBehavior {
            max_resolution: Resolution::new(640, 480),
            set_resolution_delay: Duration::from_millis(150),
            ..quick()
        },
        |config| config.capture.max_duration_ms = 300,
    );
    rig.start_streaming();
    let requests_before = rig.camera.resolution_requests().len();
    let sizes: Vec<Resolution> = [3840, 3264, 2592, 1920, 1600, 1280]
        .iter()
        .map(|&w| Resolution::new(w, w * 9 / 16))
        .collect();

    let slot = ResultSlot::new();
    let started = Instant::now();
    assert!(rig.manager.capture(
        CaptureOptions::new(rig.dir.path())
            .with_sizes(sizes.clone())
            .blocking(false),
        Some(slot.clone())
    ));
    thread::sleep(Duration::from_millis(50));
    rig.manager.cancel_capture();

    let result = wait_slot(&slot, Duration::from_secs(5));
    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(rig.jpegs().is_empty());
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(
        rig.count(|e| matches!(
            e,
            CameraEvent::CaptureCancelled {
                phase: CapturePhase::Negotiate,
                ..
            }
        )),
        1
    );
    // One candidate, plus the return to preview size.
    let made = rig.camera.resolution_requests().len() - requests_before;
    assert!(made < sizes.len(), "{} resolution changes", made);
}

#[test]
fn test_cancel_without_pending_capture_is_ignored() {
    let rig = Rig::new(quick());
    rig.manager.cancel_capture();

    let result = rig
        .manager
        .capture_and_wait(rig.options(320, 240))
        .expect("capture accepted");
    assert!(!result.cancelled);
    assert!(result.is_saved());
}

#[test]
fn test_unopenable_device_leaves_stream_disabled() {
    let rig = Rig::new(MockBehavior {
        fail_open: true,
        ..quick()
    });
    rig.manager.start_stream();

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::DeviceOpenFailure { .. }),
        Duration::from_secs(5)
    ));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::DeviceOpenFailure { .. })),
        1
    );
    let stats = rig.manager.stats();
    assert!(!stats.streaming);
    assert!(!stats.device_open);

    let attempts = rig.camera.open_attempts();
    assert!(attempts.iter().all(|a| !a.ok));
    assert!(attempts.iter().any(|a| a.index == 0));
    assert!(attempts.iter().any(|a| a.index == 1));
}

#[test]
fn test_deadline_exceeded_writes_nothing() {
    let rig = Rig::with_config(
        MockBehavior {
            read_delay: Duration::from_millis(60),
            ..Default::default()
        },
        |config| config.capture.max_duration_ms = 40,
    );

    let result = rig
        .manager
        .capture_and_wait(rig.options(640, 480))
        .expect("capture accepted");

    assert!(result.timed_out);
    assert!(!result.cancelled);
    assert!(result.saved_path.is_none());
    assert!(rig.jpegs().is_empty());
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureTimeout { .. })),
        1
    );
}

#[test]
fn test_black_frame_flagged_once_and_logged_in_folder() {
    let rig = Rig::new(MockBehavior { fill: 0, ..quick() });

    let result = rig
        .manager
        .capture_and_wait(rig.options(320, 240))
        .expect("capture accepted");

    assert!(result.is_saved());
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureBlack { .. })),
        1
    );
    let log = fs::read_to_string(folder_log_path(rig.dir.path())).unwrap();
    assert!(log.contains("capture_black"));
}

#[test]
fn test_bright_frame_is_not_flagged() {
    let rig = Rig::new(quick());
    rig.camera.set_fill(200);

    let result = rig
        .manager
        .capture_and_wait(rig.options(320, 240))
        .expect("capture accepted");

    assert!(result.is_saved());
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureBlack { .. })),
        0
    );
}

#[test]
fn test_full_queue_rejects_capture() {
    let rig = Rig::with_config(
        MockBehavior {
            read_delay: Duration::from_millis(30),
            ..Default::default()
        },
        |config| {
            config.capture.queue_capacity = 1;
            config.capture.warmup_frames = 5;
            config.capture.cancel_poll_ms = 20;
        },
    );

    let slot = ResultSlot::new();
    assert!(rig
        .manager
        .capture(rig.options(640, 480).blocking(false), Some(slot.clone())));
    assert!(!rig
        .manager
        .capture(rig.options(640, 480).blocking(false), None));
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CaptureQueueFull { capacity: 1 })),
        1
    );

    assert!(wait_slot(&slot, Duration::from_secs(5)).is_saved());
    // The slot frees once the first capture resolves.
    assert!(rig.manager.capture_and_wait(rig.options(640, 480)).is_some());
}

#[test]
fn test_captures_never_overlap() {
    let rig = Rig::new(quick());
    rig.start_streaming();

    let slots: Vec<ResultSlot> = (0..3).map(|_| ResultSlot::new()).collect();
    let sizes = [(640, 480), (320, 240), (800, 600)];
    for (slot, (w, h)) in slots.iter().zip(sizes) {
        assert!(rig
            .manager
            .capture(rig.options(w, h).blocking(false), Some(slot.clone())));
    }
    for slot in &slots {
        assert!(wait_slot(slot, Duration::from_secs(10)).is_saved());
    }

    let markers: Vec<(bool, uuid::Uuid)> = rig
        .telemetry
        .events()
        .into_iter()
        .filter_map(|e| match e {
            CameraEvent::CaptureBegin { request_id, .. } => Some((true, request_id)),
            CameraEvent::CaptureEnd { request_id, .. } => Some((false, request_id)),
            _ => None,
        })
        .collect();
    assert_eq!(markers.len(), 6);
    for pair in markers.chunks(2) {
        assert!(pair[0].0, "capture began while another was running");
        assert!(!pair[1].0);
        assert_eq!(pair[0].1, pair[1].1);
    }
    assert_eq!(rig.jpegs().len(), 3);
}

#[test]
fn test_stream_resumes_at_preview_after_capture() {
    let rig = Rig::new(quick());
    rig.start_streaming();

    let result = rig
        .manager
        .capture_and_wait(rig.options(640, 480))
        .expect("capture accepted");
    assert_eq!(result.effective, Resolution::new(640, 480));

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::PostCaptureResumeOk { .. }),
        Duration::from_secs(5)
    ));
    let frame = rig.manager.latest_frame().unwrap();
    assert_eq!(frame.resolution(), Resolution::new(320, 240));
    assert!(rig.manager.stats().streaming);
}

#[test]
fn test_probe_lists_supported_labels_and_keeps_streaming() {
    let rig = Rig::new(MockBehavior {
        modes: vec![
            Resolution::new(320, 240),
            Resolution::new(640, 480),
            Resolution::new(1280, 720),
        ],
        ..quick()
    });
    rig.start_streaming();

    let mut candidates = standard_candidates();
    candidates.push(ResolutionCandidate::new("320 x 240 (QVGA)", 320, 240));
    let supported = rig.manager.probe_resolutions(candidates);
    assert_eq!(
        supported,
        vec![
            "1280 x 720 (HD)".to_string(),
            "640 x 480 (VGA)".to_string(),
            "320 x 240 (QVGA)".to_string(),
        ]
    );

    thread::sleep(Duration::from_millis(50));
    let frame = rig.manager.latest_frame().unwrap();
    assert_eq!(frame.resolution(), Resolution::new(320, 240));
}

#[test]
fn test_stalled_resume_recovers_with_one_reopen() {
    let rig = Rig::with_config(
        MockBehavior {
            stall_after_leaving: Some(Resolution::new(640, 480)),
            ..quick()
        },
        |config| {
            config.watchdog.resume_timeout_ms = 150;
            config.watchdog.reopen_window_ms = 300;
            config.watchdog.give_up_grace_ms = 100;
        },
    );
    rig.start_streaming();
    let opens_before = rig.camera.successful_opens();

    let result = rig
        .manager
        .capture_and_wait(rig.options(640, 480))
        .expect("capture accepted");
    assert!(result.is_saved());

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::PostCaptureResumeOk { .. }),
        Duration::from_secs(5)
    ));
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::PostCaptureResumeTimeout { .. })),
        1
    );
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::PostCaptureReopenFailed { .. })),
        0
    );
    assert_eq!(rig.camera.successful_opens(), opens_before + 1);
    assert!(!rig.camera.is_stalled());
    assert!(rig.camera.max_live_handles() <= 1);
}

#[test]
fn test_stalled_resume_gives_up_after_reopen() {
    let rig = Rig::with_config(
        MockBehavior {
            stall_after_leaving: Some(Resolution::new(640, 480)),
            sticky_stall: true,
            ..quick()
        },
        |config| {
            config.watchdog.resume_timeout_ms = 100;
            config.watchdog.reopen_window_ms = 150;
            config.watchdog.give_up_grace_ms = 50;
        },
    );
    rig.start_streaming();

    rig.manager
        .capture_and_wait(rig.options(640, 480))
        .expect("capture accepted");

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::PostCaptureReopenFailed { .. }),
        Duration::from_secs(5)
    ));
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::PostCaptureResumeTimeout { .. })),
        1
    );
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::PostCaptureResumeOk { .. })),
        0
    );
    assert!(rig.camera.max_live_handles() <= 1);
}

#[test]
fn test_stalled_stream_is_restarted() {
    let rig = Rig::with_config(quick(), |config| {
        config.watchdog.stall_timeout_ms = 100;
        config.watchdog.stall_grace_ms = 50;
        config.watchdog.health_check_interval_ms = 20;
    });
    rig.start_streaming();
    rig.camera.set_stalled(true);

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::StreamWatchdogRecover { ok: true }),
        Duration::from_secs(5)
    ));
    assert!(rig.count(|e| matches!(e, CameraEvent::StreamWatchdogTrigger { .. })) >= 1);
    assert!(!rig.camera.is_stalled());
    assert!(rig.camera.max_live_handles() <= 1);
}

#[test]
fn test_properties_are_coalesced_before_reaching_driver() {
    use kioskcam::PropertyId;

    let rig = Rig::new(quick());
    rig.start_streaming();
    for step in 0..20 {
        rig.manager.set_property(PropertyId::Brightness, step as f64);
    }

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::PropertiesApplied { .. }),
        Duration::from_secs(5)
    ));
    thread::sleep(Duration::from_millis(400));
    let writes = rig.camera.properties();
    assert!(writes.len() < 20);
    assert_eq!(writes.last(), Some(&(PropertyId::Brightness, 19.0)));
}

#[test]
fn test_shutdown_resolves_every_pending_capture() {
    let rig = Rig::with_config(
        MockBehavior {
            read_delay: Duration::from_millis(30),
            ..Default::default()
        },
        |config| {
            config.capture.warmup_frames = 5;
            config.capture.cancel_poll_ms = 20;
        },
    );

    let slots: Vec<ResultSlot> = (0..3).map(|_| ResultSlot::new()).collect();
    for slot in &slots {
        assert!(rig
            .manager
            .capture(rig.options(640, 480).blocking(false), Some(slot.clone())));
    }
    rig.manager.shutdown();

    for slot in &slots {
        let result = slot.get().expect("resolved by shutdown");
        assert!(result.cancelled);
        assert!(!result.is_saved());
    }
    assert_eq!(rig.manager.stats().pending_captures, 0);
    assert_eq!(rig.camera.live_handles(), 0);
}

#[test]
fn test_device_index_change_reopens_on_new_index() {
    let rig = Rig::new(quick());
    rig.start_streaming();
    rig.manager.set_device_index(2);

    assert!(rig.wait_for(
        |e| matches!(e, CameraEvent::CameraOpenOk { index: 2, .. }),
        Duration::from_secs(5)
    ));
    assert_eq!(
        rig.count(|e| matches!(e, CameraEvent::CameraIndexChange { from: 0, to: 2 })),
        1
    );
    assert!(rig.camera.max_live_handles() <= 1);
}
