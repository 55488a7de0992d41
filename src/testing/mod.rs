//! Testing utilities for kioskcam
//!
//! A scripted capture device and synthetic frames, so the manager can be
//! exercised offline without a webcam attached.

pub mod mock_device;
pub mod synthetic_data;

pub use mock_device::{MockBehavior, MockCamera, MockDevice, MockOpener, OpenAttempt};
pub use synthetic_data::{gradient_frame, solid_frame};
