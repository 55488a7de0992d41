//! Structured camera events and the sinks that record them.
//!
//! Events are fire-and-forget: a sink that cannot write logs a warning and
//! carries on, it never feeds back into the worker.

use crate::types::{BackendKind, Resolution};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Stage of a capture at which it was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    FastPath,
    Negotiate,
    Warmup,
    Acquire,
    Save,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraEvent {
    CameraOpenStart {
        index: u32,
    },
    CameraOpenBackendTry {
        index: u32,
        backend: BackendKind,
        ok: bool,
    },
    CameraOpenIndexFallback {
        from: u32,
        to: u32,
    },
    CameraOpenOk {
        index: u32,
        backend: BackendKind,
        resolution: Resolution,
        duration_ms: u64,
    },
    DeviceOpenFailure {
        index: u32,
        duration_ms: u64,
        reason: String,
    },
    CameraClosed {
        index: u32,
    },
    CameraIndexChange {
        from: u32,
        to: u32,
    },
    StreamStartRequest {
        force_reopen: bool,
    },
    StreamStartApplied {
        resolution: Resolution,
        warm_ok: bool,
    },
    StreamStopRequest,
    CameraResolutionChange {
        requested: Resolution,
        effective: Resolution,
    },
    PropertiesApplied {
        count: usize,
        failed: usize,
    },
    CommandDiscarded {
        command: String,
    },
    CaptureEnqueued {
        request_id: Uuid,
        pending: usize,
    },
    CaptureQueueFull {
        capacity: usize,
    },
    CaptureCancelRequest {
        pending: usize,
    },
    CaptureBegin {
        request_id: Uuid,
        dest: PathBuf,
        requested: Resolution,
        streaming: bool,
    },
    CaptureFastPathUsed {
        request_id: Uuid,
        frame_age_ms: u64,
    },
    CaptureResolutionSkip {
        request_id: Uuid,
        current: Resolution,
    },
    CaptureResolutionEffective {
        request_id: Uuid,
        requested: Resolution,
        effective: Resolution,
    },
    CaptureResolutionMismatch {
        request_id: Uuid,
        requested: Resolution,
        effective: Resolution,
        retry: u32,
    },
    ResolutionSuggestDowngrade {
        requested: Resolution,
        suggested: Resolution,
        mismatches: u32,
    },
    CaptureCancelled {
        request_id: Uuid,
        phase: CapturePhase,
    },
    CaptureTimeout {
        request_id: Uuid,
        phase: CapturePhase,
        elapsed_ms: u64,
    },
    CaptureWarmupReadError {
        request_id: Uuid,
        message: String,
    },
    CaptureSaveOk {
        request_id: Uuid,
        path: PathBuf,
        resolution: Resolution,
    },
    CaptureSaveError {
        request_id: Uuid,
        message: String,
    },
    CaptureBlack {
        request_id: Uuid,
        path: PathBuf,
        mean_brightness: f64,
    },
    CaptureFrameReadFail {
        request_id: Uuid,
        message: String,
    },
    CaptureEnd {
        request_id: Uuid,
        duration_ms: u64,
        effective: Resolution,
        mismatch: bool,
        cancelled: bool,
        timed_out: bool,
        saved: bool,
    },
    FrameReadError {
        consecutive: u64,
        total_failures: u64,
        message: String,
    },
    CameraLoopHeartbeat {
        frames_ok: u64,
        frames_failed: u64,
        backend: Option<BackendKind>,
        last_capture_age_ms: Option<u64>,
    },
    PostCaptureResumeOk {
        latency_ms: u64,
    },
    PostCaptureResumeTimeout {
        waited_ms: u64,
    },
    PostCaptureReopenFailed {
        waited_ms: u64,
    },
    StreamWatchdogTrigger {
        stalled_ms: u64,
    },
    StreamWatchdogRecover {
        ok: bool,
    },
    ProbeResolutions {
        tested: usize,
        supported: Vec<String>,
    },
    Error {
        phase: String,
        message: String,
    },
}

impl CameraEvent {
    /// Events that also belong in the failure log.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CameraEvent::DeviceOpenFailure { .. }
                | CameraEvent::CaptureTimeout { .. }
                | CameraEvent::CaptureSaveError { .. }
                | CameraEvent::CaptureBlack { .. }
                | CameraEvent::CaptureFrameReadFail { .. }
                | CameraEvent::PostCaptureReopenFailed { .. }
                | CameraEvent::StreamWatchdogTrigger { .. }
                | CameraEvent::Error { .. }
        )
    }
}

/// Receives camera events. Implementations must never block the caller for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CameraEvent);

    /// Append an event to the capture folder's daily log.
    fn folder_log(&self, _folder: &Path, _event: &CameraEvent) {}
}

/// Timestamped event as written to JSONL logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CameraEvent,
}

impl EventRecord {
    pub fn now(event: CameraEvent) -> Self {
        Self {
            ts: Utc::now(),
            event,
        }
    }
}

/// Forwards every event to the `log` facade as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: CameraEvent) {
        let failure = event.is_failure();
        match serde_json::to_string(&event) {
            Ok(json) if failure => log::warn!("camera event: {}", json),
            Ok(json) => log::info!("camera event: {}", json),
            Err(e) => log::warn!("Unserializable camera event {:?}: {}", event, e),
        }
    }
}

pub const DEFAULT_RING_CAPACITY: usize = 500;

/// Event sink keeping a bounded in-memory history and, optionally, JSONL files.
///
/// With a log directory it appends every event to `telemetry.log` and
/// failure events to `failures.log`.
pub struct Telemetry {
    dir: Option<PathBuf>,
    capacity: usize,
    ring: Mutex<VecDeque<EventRecord>>,
    failures: Mutex<VecDeque<EventRecord>>,
}

impl Telemetry {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            capacity: DEFAULT_RING_CAPACITY,
            ring: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::in_memory()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn telemetry_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("telemetry.log"))
    }

    pub fn failures_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("failures.log"))
    }

    /// Up to `max` most recent records, oldest first.
    pub fn recent(&self, max: usize) -> Vec<EventRecord> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = ring.len().saturating_sub(max);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn events(&self) -> Vec<CameraEvent> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        ring.iter().map(|r| r.event.clone()).collect()
    }

    pub fn failures(&self) -> Vec<EventRecord> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.iter().cloned().collect()
    }

    pub fn count_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CameraEvent) -> bool,
    {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        ring.iter().filter(|r| predicate(&r.event)).count()
    }

    pub fn clear(&self) {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push_bounded(&self, queue: &Mutex<VecDeque<EventRecord>>, record: EventRecord) {
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(record);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EventSink for Telemetry {
    fn emit(&self, event: CameraEvent) {
        let record = EventRecord::now(event);
        log::debug!("camera event: {:?}", record.event);

        if let Some(path) = self.telemetry_path() {
            append_record(&path, &record);
        }
        if record.event.is_failure() {
            if let Some(path) = self.failures_path() {
                append_record(&path, &record);
            }
            self.push_bounded(&self.failures, record.clone());
        }
        self.push_bounded(&self.ring, record);
    }

    fn folder_log(&self, folder: &Path, event: &CameraEvent) {
        append_record(&folder_log_path(folder), &EventRecord::now(event.clone()));
    }
}

/// `<folder>/logs/YYYY-MM-DD.log` for today's local date.
pub fn folder_log_path(folder: &Path) -> PathBuf {
    folder
        .join("logs")
        .join(format!("{}.log", Local::now().format("%Y-%m-%d")))
}

fn append_record(path: &Path, record: &EventRecord) {
    let result = (|| -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    })();

    if let Err(e) = result {
        log::warn!("Failed to append event to {:?}: {}", path, e);
    }
}
