//! Post-capture resume verification and stream stall detection
//!
//! Some drivers stop delivering frames after switching back from a capture
//! resolution. After a capture resumes the preview, the watchdog waits for a
//! frame newer than the capture's end. If none arrives it asks the worker
//! for one forced reopen, then gives up with a terminal event. While no
//! resume check is armed it watches the live stream for stalls.

use crate::config::WatchdogSettings;
use crate::events::{CameraEvent, EventSink};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the worker must do after a watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// Reopen the device once to recover from a failed resume
    ForceReopen,
    /// Stop and restart a stalled stream
    RestartStream,
}

#[derive(Debug, Clone, Copy)]
struct ResumeCheck {
    capture_ended_at: Instant,
    deadline: Instant,
    reopen_in_progress: bool,
}

pub struct Watchdog {
    settings: WatchdogSettings,
    events: Arc<dyn EventSink>,
    resume: Option<ResumeCheck>,
    stream_started_at: Option<Instant>,
    last_health_check: Option<Instant>,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Watchdog {
    pub fn new(settings: WatchdogSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            events,
            resume: None,
            stream_started_at: None,
            last_health_check: None,
        }
    }

    /// Start verifying that the preview recovers after a capture.
    pub fn arm_resume(&mut self, capture_ended_at: Instant) {
        self.resume = Some(ResumeCheck {
            capture_ended_at,
            deadline: capture_ended_at + self.settings.resume_timeout(),
            reopen_in_progress: false,
        });
    }

    pub fn disarm(&mut self) {
        self.resume = None;
    }

    pub fn is_resume_armed(&self) -> bool {
        self.resume.is_some()
    }

    pub fn is_reopen_in_progress(&self) -> bool {
        self.resume.is_some_and(|r| r.reopen_in_progress)
    }

    /// The forced reopen finished; its frame window starts now.
    pub fn reopen_done(&mut self, now: Instant) {
        if let Some(check) = self.resume.as_mut() {
            if check.reopen_in_progress {
                check.deadline = now + self.settings.reopen_window();
            }
        }
    }

    pub fn note_stream_started(&mut self, now: Instant) {
        self.stream_started_at = Some(now);
        self.last_health_check = None;
    }

    pub fn note_stream_stopped(&mut self) {
        self.stream_started_at = None;
        self.resume = None;
    }

    pub fn tick(
        &mut self,
        now: Instant,
        last_frame_at: Option<Instant>,
        streaming: bool,
    ) -> WatchdogAction {
        if self.resume.is_some() {
            return self.check_resume(now, last_frame_at);
        }
        if streaming {
            return self.check_health(now, last_frame_at);
        }
        WatchdogAction::None
    }

    fn check_resume(&mut self, now: Instant, last_frame_at: Option<Instant>) -> WatchdogAction {
        let Some(mut check) = self.resume else {
            return WatchdogAction::None;
        };

        if let Some(frame_at) = last_frame_at {
            if frame_at > check.capture_ended_at {
                let latency_ms = millis(frame_at.saturating_duration_since(check.capture_ended_at));
                log::info!("Preview resumed {} ms after capture", latency_ms);
                self.events
                    .emit(CameraEvent::PostCaptureResumeOk { latency_ms });
                self.resume = None;
                return WatchdogAction::None;
            }
        }

        if now < check.deadline {
            return WatchdogAction::None;
        }

        let waited_ms = millis(now.saturating_duration_since(check.capture_ended_at));
        if !check.reopen_in_progress {
            log::warn!("No preview frame {} ms after capture, reopening", waited_ms);
            self.events
                .emit(CameraEvent::PostCaptureResumeTimeout { waited_ms });
            check.reopen_in_progress = true;
            check.deadline = now + self.settings.reopen_window();
            self.resume = Some(check);
            return WatchdogAction::ForceReopen;
        }

        if now >= check.deadline + self.settings.give_up_grace() {
            log::error!("Preview did not recover after reopen ({} ms)", waited_ms);
            self.events
                .emit(CameraEvent::PostCaptureReopenFailed { waited_ms });
            self.resume = None;
        }
        WatchdogAction::None
    }

    fn check_health(&mut self, now: Instant, last_frame_at: Option<Instant>) -> WatchdogAction {
        if let Some(last) = self.last_health_check {
            if now.saturating_duration_since(last) < self.settings.health_check_interval() {
                return WatchdogAction::None;
            }
        }
        self.last_health_check = Some(now);

        let Some(started) = self.stream_started_at else {
            return WatchdogAction::None;
        };
        if now.saturating_duration_since(started) < self.settings.stall_grace() {
            return WatchdogAction::None;
        }

        let reference = last_frame_at.map_or(started, |at| at.max(started));
        let stalled = now.saturating_duration_since(reference);
        if stalled > self.settings.stall_timeout() {
            let stalled_ms = millis(stalled);
            log::warn!("Preview stalled for {} ms, restarting stream", stalled_ms);
            self.events
                .emit(CameraEvent::StreamWatchdogTrigger { stalled_ms });
            return WatchdogAction::RestartStream;
        }
        WatchdogAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Telemetry;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn watchdog() -> (Watchdog, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::in_memory());
        (
            Watchdog::new(WatchdogSettings::default(), telemetry.clone()),
            telemetry,
        )
    }

    #[test]
    fn test_resume_ok_on_fresh_frame() {
        let (mut dog, telemetry) = watchdog();
        let end = Instant::now();
        dog.arm_resume(end);

        // A frame from before the capture ended does not count.
        assert_eq!(dog.tick(end + ms(100), Some(end), true), WatchdogAction::None);
        assert!(dog.is_resume_armed());

        assert_eq!(
            dog.tick(end + ms(200), Some(end + ms(150)), true),
            WatchdogAction::None
        );
        assert!(!dog.is_resume_armed());
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::PostCaptureResumeOk { latency_ms: 150 })),
            1
        );
    }

    #[test]
    fn test_resume_timeout_reopens_then_recovers() {
        let (mut dog, telemetry) = watchdog();
        let end = Instant::now();
        dog.arm_resume(end);

        assert_eq!(dog.tick(end + ms(1199), None, true), WatchdogAction::None);
        assert_eq!(dog.tick(end + ms(1200), None, true), WatchdogAction::ForceReopen);
        assert!(dog.is_reopen_in_progress());
        dog.reopen_done(end + ms(1300));

        // Still inside the reopen window.
        assert_eq!(dog.tick(end + ms(2700), None, true), WatchdogAction::None);
        assert_eq!(
            dog.tick(end + ms(2750), Some(end + ms(2740)), true),
            WatchdogAction::None
        );
        assert!(!dog.is_resume_armed());
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::PostCaptureResumeTimeout { .. })),
            1
        );
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::PostCaptureResumeOk { .. })),
            1
        );
    }

    #[test]
    fn test_gives_up_after_reopen_window_and_grace() {
        let (mut dog, telemetry) = watchdog();
        let end = Instant::now();
        dog.arm_resume(end);

        assert_eq!(dog.tick(end + ms(1200), None, true), WatchdogAction::ForceReopen);
        dog.reopen_done(end + ms(1200));
        // Reopen window ends at 2700, give-up at 3200.
        assert_eq!(dog.tick(end + ms(2800), None, true), WatchdogAction::None);
        assert!(dog.is_resume_armed());
        assert_eq!(dog.tick(end + ms(3200), None, true), WatchdogAction::None);
        assert!(!dog.is_resume_armed());
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::PostCaptureReopenFailed { .. })),
            1
        );
        // Only one reopen was ever requested.
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::PostCaptureResumeTimeout { .. })),
            1
        );
    }

    #[test]
    fn test_health_check_waits_for_grace() {
        let (mut dog, _) = watchdog();
        let start = Instant::now();
        dog.note_stream_started(start);
        assert_eq!(dog.tick(start + ms(4900), None, true), WatchdogAction::None);
    }

    #[test]
    fn test_stall_triggers_restart() {
        let (mut dog, telemetry) = watchdog();
        let start = Instant::now();
        dog.note_stream_started(start);

        assert_eq!(
            dog.tick(start + ms(6000), Some(start + ms(4000)), true),
            WatchdogAction::None
        );
        // Interval not elapsed since the previous check.
        assert_eq!(
            dog.tick(start + ms(7500), Some(start + ms(4000)), true),
            WatchdogAction::None
        );
        assert_eq!(
            dog.tick(start + ms(8100), Some(start + ms(4000)), true),
            WatchdogAction::RestartStream
        );
        assert_eq!(
            telemetry.count_where(|e| matches!(e, CameraEvent::StreamWatchdogTrigger { .. })),
            1
        );
    }

    #[test]
    fn test_no_health_checks_while_resume_armed_or_stopped() {
        let (mut dog, _) = watchdog();
        let start = Instant::now();
        dog.note_stream_started(start);
        assert_eq!(dog.tick(start + ms(9000), None, false), WatchdogAction::None);

        dog.arm_resume(start + ms(8000));
        assert_eq!(dog.tick(start + ms(9000), None, true), WatchdogAction::None);
    }
}
