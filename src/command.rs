//! Commands sent to the camera worker and the request plumbing around them.

use crate::types::{
    default_capture_sizes, CaptureResult, PropertyId, Resolution, ResolutionCandidate,
};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Operations drained by the worker, in FIFO order.
#[derive(Debug)]
pub enum Command {
    SetDeviceIndex(u32),
    StartStream,
    StopStream,
    SetResolution(Resolution),
    SetProperty(PropertyId, f64),
    Capture(CaptureRequest),
    Probe {
        candidates: Vec<ResolutionCandidate>,
        reply: Sender<Vec<String>>,
    },
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetDeviceIndex(_) => "set_device_index",
            Command::StartStream => "start_stream",
            Command::StopStream => "stop_stream",
            Command::SetResolution(_) => "set_resolution",
            Command::SetProperty(..) => "set_property",
            Command::Capture(_) => "capture",
            Command::Probe { .. } => "probe_resolutions",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Latest value per property, flushed to the device on a debounce interval.
#[derive(Debug, Default)]
pub struct PendingPropertyMap {
    values: BTreeMap<PropertyId, f64>,
    last_flush: Option<Instant>,
}

impl PendingPropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub fn insert(&mut self, id: PropertyId, value: f64) {
        self.values.insert(id, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: PropertyId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    pub fn is_due(&self, now: Instant, debounce: Duration) -> bool {
        if self.values.is_empty() {
            return false;
        }
        match self.last_flush {
            Some(at) => now.saturating_duration_since(at) >= debounce,
            None => true,
        }
    }

    /// Drain all pending values and mark the flush time.
    pub fn take(&mut self, now: Instant) -> Vec<(PropertyId, f64)> {
        self.last_flush = Some(now);
        std::mem::take(&mut self.values).into_iter().collect()
    }
}

/// Caps the number of capture requests that are queued or running.
#[derive(Debug, Clone)]
pub struct CaptureIntake {
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

impl CaptureIntake {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Option<IntakePermit> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(IntakePermit {
                        pending: Arc::clone(&self.pending),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One admitted capture. Releases its slot when dropped.
#[derive(Debug)]
pub struct IntakePermit {
    pending: Arc<AtomicUsize>,
}

impl Drop for IntakePermit {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cancellation aimed at the oldest unresolved capture.
///
/// Captures are numbered in the order the worker resolves them. A cancel
/// records the number of the capture at the head of the queue, so one that
/// lands while the head is finishing can never hit the capture after it.
#[derive(Debug, Clone, Default)]
pub struct CaptureCancel {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    /// Head capture number plus one; 0 is "nothing requested"
    target: AtomicU64,
    resolved: AtomicU64,
}

impl CaptureCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the running capture, or the next queued one if none is running.
    pub fn request(&self) {
        let head = self.inner.resolved.load(Ordering::Acquire);
        self.inner.target.store(head + 1, Ordering::Release);
    }

    /// Whether the capture at the head of the queue has been cancelled.
    pub fn is_requested(&self) -> bool {
        let head = self.inner.resolved.load(Ordering::Acquire);
        self.inner.target.load(Ordering::Acquire) == head + 1
    }

    /// The head capture resolved. Call after its result is delivered.
    pub fn advance(&self) {
        self.inner.resolved.fetch_add(1, Ordering::AcqRel);
    }
}

/// Signal fired when a capture request resolves.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<(Mutex<u32>, Condvar)>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *fired += 1;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.fire_count() > 0
    }

    /// How many times the signal fired. A resolved request reads exactly 1.
    pub fn fire_count(&self) -> u32 {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *fired == 0 {
            fired = cvar.wait(fired).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns true if the signal fired before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (fired, _) = cvar
            .wait_timeout_while(guard, timeout, |fired| *fired == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *fired > 0
    }
}

/// Caller-owned cell receiving the result of a capture.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot {
    inner: Arc<Mutex<Option<CaptureResult>>>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<CaptureResult> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fill(&self, result: CaptureResult) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }
}

/// A capture waiting on, or running in, the worker.
///
/// Resolves exactly once. A request dropped without being resolved (worker
/// shut down, channel closed) resolves itself as abandoned.
#[derive(Debug)]
pub struct CaptureRequest {
    pub id: Uuid,
    pub dest_folder: PathBuf,
    pub preferred_sizes: Vec<Resolution>,
    pub quality: u8,
    pub auto_resume: bool,
    completion: CompletionSignal,
    slot: Option<ResultSlot>,
    permit: Option<IntakePermit>,
    resolved: bool,
}

impl CaptureRequest {
    pub fn new(
        options: &CaptureOptions,
        completion: CompletionSignal,
        slot: Option<ResultSlot>,
        permit: Option<IntakePermit>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dest_folder: options.dest_folder.clone(),
            preferred_sizes: options.sizes(),
            quality: options.quality,
            auto_resume: options.auto_resume,
            completion,
            slot,
            permit,
            resolved: false,
        }
    }

    /// The size the caller asked for first.
    pub fn requested(&self) -> Resolution {
        self.preferred_sizes.first().copied().unwrap_or_default()
    }

    pub fn completion(&self) -> &CompletionSignal {
        &self.completion
    }

    pub fn resolve(mut self, result: CaptureResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: CaptureResult) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        // Free the intake slot before waking the caller so it can enqueue again.
        drop(self.permit.take());
        if let Some(slot) = &self.slot {
            slot.fill(result);
        }
        self.completion.fire();
    }
}

impl Drop for CaptureRequest {
    fn drop(&mut self) {
        if !self.resolved {
            self.finish(CaptureResult::abandoned());
        }
    }
}

/// Caller-facing capture parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub dest_folder: PathBuf,
    pub preferred_sizes: Vec<Resolution>,
    pub quality: u8,
    pub auto_resume: bool,
    /// Block the caller until the request resolves.
    pub block: bool,
    /// Upper bound on the blocking wait. `None` waits until resolution.
    pub timeout: Option<Duration>,
}

impl CaptureOptions {
    pub fn new<P: Into<PathBuf>>(dest_folder: P) -> Self {
        Self {
            dest_folder: dest_folder.into(),
            preferred_sizes: default_capture_sizes(),
            quality: 95,
            auto_resume: true,
            block: true,
            timeout: None,
        }
    }

    pub fn with_sizes(mut self, sizes: Vec<Resolution>) -> Self {
        self.preferred_sizes = sizes;
        self
    }

    pub fn with_size(self, width: u32, height: u32) -> Self {
        self.with_sizes(vec![Resolution::new(width, height)])
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn with_auto_resume(mut self, auto_resume: bool) -> Self {
        self.auto_resume = auto_resume;
        self
    }

    pub fn blocking(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Preferred sizes, falling back to the defaults when none were given.
    pub fn sizes(&self) -> Vec<Resolution> {
        if self.preferred_sizes.is_empty() {
            default_capture_sizes()
        } else {
            self.preferred_sizes.clone()
        }
    }
}
