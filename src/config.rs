//! Configuration management for the kiosk camera
//!
//! Every timing constant the worker, capture sequence and watchdog rely on is
//! loaded from here so a kiosk can be tuned without a rebuild.

use crate::errors::CameraError;
use crate::types::{BackendKind, Resolution};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskCamConfig {
    pub camera: CameraSettings,
    pub capture: CaptureSettings,
    pub watchdog: WatchdogSettings,
    pub worker: WorkerSettings,
}

/// Device selection and preview stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Device index opened at startup
    pub device_index: u32,
    /// Backend to try first; the platform order follows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<BackendKind>,
    /// Preview resolution [width, height]
    pub preview_resolution: [u32; 2],
    pub preview_fps: u32,
    /// Request MJPEG from the device
    pub use_mjpg: bool,
    /// Frames discarded right after a successful open
    pub open_discard_frames: u32,
    /// Minimum spacing between lazy reopen attempts in milliseconds
    pub reopen_cooldown_ms: u64,
}

/// Still capture behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Pixels either axis may differ from the request and still count as a match
    pub resolution_tolerance: u32,
    /// Extra negotiation rounds when the device reports a mismatch
    pub resolution_max_retries: u32,
    /// Total time budget for one capture in milliseconds
    pub max_duration_ms: u64,
    /// Sleep between cancel checks during warm-up
    pub cancel_poll_ms: u64,
    pub warmup_frames: u32,
    pub warmup_timeout_ms: u64,
    /// Reads performed when the preview stream is restarted after a capture
    pub resume_warmup_reads: u32,
    /// Buffered frames younger than this may be saved directly
    pub fast_path_max_age_ms: u64,
    /// Mean luminance at or below which a saved frame is flagged black
    pub black_frame_threshold: f64,
    /// Outstanding capture requests admitted at once
    pub queue_capacity: usize,
    /// Consecutive mismatches on one size before a smaller size is suggested
    pub mismatch_downgrade_threshold: u32,
    pub default_quality: u8,
}

/// Post-capture resume and stream health supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Time allowed for a fresh frame after a capture resumes the stream
    pub resume_timeout_ms: u64,
    /// Window in which a forced reopen is expected to produce a frame
    pub reopen_window_ms: u64,
    /// Extra time after the reopen window before giving up
    pub give_up_grace_ms: u64,
    /// Gap between frames that counts as a stalled stream
    pub stall_timeout_ms: u64,
    /// Time after stream start before stall checks begin
    pub stall_grace_ms: u64,
    pub health_check_interval_ms: u64,
}

/// Worker loop pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Commands drained per loop iteration
    pub max_ops_per_tick: usize,
    pub property_debounce_ms: u64,
    pub idle_sleep_ms: u64,
    pub read_fail_backoff_ms: u64,
    /// Frames between heartbeat events
    pub heartbeat_frames: u64,
    /// Consecutive read failure count that triggers the first report
    pub read_fail_report_first: u64,
    pub read_fail_report_every: u64,
    /// Time allowed for the worker thread to exit on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            preferred_backend: None,
            preview_resolution: [1280, 720],
            preview_fps: 30,
            use_mjpg: true,
            open_discard_frames: 1,
            reopen_cooldown_ms: 2000,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution_tolerance: 16,
            resolution_max_retries: 1,
            max_duration_ms: 8000,
            cancel_poll_ms: 50,
            warmup_frames: 3,
            warmup_timeout_ms: 800,
            resume_warmup_reads: 2,
            fast_path_max_age_ms: 1000,
            black_frame_threshold: 10.0,
            queue_capacity: 3,
            mismatch_downgrade_threshold: 2,
            default_quality: 95,
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            resume_timeout_ms: 1200,
            reopen_window_ms: 1500,
            give_up_grace_ms: 500,
            stall_timeout_ms: 3000,
            stall_grace_ms: 5000,
            health_check_interval_ms: 2000,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_ops_per_tick: 10,
            property_debounce_ms: 300,
            idle_sleep_ms: 10,
            read_fail_backoff_ms: 10,
            heartbeat_frames: 300,
            read_fail_report_first: 10,
            read_fail_report_every: 50,
            shutdown_timeout_ms: 3000,
        }
    }
}

impl CameraSettings {
    pub fn preview(&self) -> Resolution {
        Resolution::new(self.preview_resolution[0], self.preview_resolution[1])
    }

    pub fn reopen_cooldown(&self) -> Duration {
        Duration::from_millis(self.reopen_cooldown_ms)
    }
}

impl CaptureSettings {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    pub fn fast_path_max_age(&self) -> Duration {
        Duration::from_millis(self.fast_path_max_age_ms)
    }
}

impl WatchdogSettings {
    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms)
    }

    pub fn reopen_window(&self) -> Duration {
        Duration::from_millis(self.reopen_window_ms)
    }

    pub fn give_up_grace(&self) -> Duration {
        Duration::from_millis(self.give_up_grace_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stall_grace(&self) -> Duration {
        Duration::from_millis(self.stall_grace_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl WorkerSettings {
    pub fn property_debounce(&self) -> Duration {
        Duration::from_millis(self.property_debounce_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn read_fail_backoff(&self) -> Duration {
        Duration::from_millis(self.read_fail_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl KioskCamConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CameraError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CameraError::Config(format!("Failed to read config file: {}", e)))?;

        let config: KioskCamConfig = toml::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    CameraError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CameraError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CameraError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("kioskcam.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.camera.preview_resolution[0] == 0 || self.camera.preview_resolution[1] == 0 {
            return Err("Invalid preview resolution".to_string());
        }
        if self.camera.preview_fps == 0 || self.camera.preview_fps > 240 {
            return Err("Invalid preview FPS (must be 1-240)".to_string());
        }

        if self.capture.queue_capacity == 0 {
            return Err("Capture queue capacity must be at least 1".to_string());
        }
        if self.capture.max_duration_ms == 0 {
            return Err("Capture max duration must be positive".to_string());
        }
        if self.capture.cancel_poll_ms == 0 {
            return Err("Cancel poll interval must be positive".to_string());
        }
        if self.capture.default_quality == 0 || self.capture.default_quality > 100 {
            return Err("JPEG quality must be between 1 and 100".to_string());
        }
        if !(0.0..=255.0).contains(&self.capture.black_frame_threshold) {
            return Err("Black frame threshold must be between 0 and 255".to_string());
        }
        if self.capture.mismatch_downgrade_threshold == 0 {
            return Err("Mismatch downgrade threshold must be at least 1".to_string());
        }

        if self.watchdog.health_check_interval_ms == 0 {
            return Err("Health check interval must be positive".to_string());
        }
        if self.watchdog.stall_timeout_ms == 0 {
            return Err("Stall timeout must be positive".to_string());
        }

        if self.worker.max_ops_per_tick == 0 {
            return Err("Worker must drain at least one command per tick".to_string());
        }
        if self.worker.read_fail_report_every == 0 {
            return Err("Read failure report interval must be positive".to_string());
        }

        Ok(())
    }
}
