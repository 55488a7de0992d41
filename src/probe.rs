use crate::events::{CameraEvent, EventSink};
use crate::session::DeviceSession;
use crate::types::ResolutionCandidate;

/// Try each candidate on the open device and return the labels of those the
/// driver honours within `tolerance`. The preview configuration is restored
/// afterwards. Returns an empty list when the device cannot be opened.
pub fn probe_resolutions(
    session: &mut DeviceSession,
    candidates: &[ResolutionCandidate],
    tolerance: u32,
    events: &dyn EventSink,
) -> Vec<String> {
    if !session.ensure_open() {
        log::warn!("Resolution probe skipped: camera unavailable");
        events.emit(CameraEvent::ProbeResolutions {
            tested: 0,
            supported: Vec::new(),
        });
        return Vec::new();
    }

    let mut supported = Vec::new();
    for candidate in candidates {
        match session.set_resolution(candidate.resolution) {
            Ok(effective) if effective.within(candidate.resolution, tolerance) => {
                log::debug!("{} supported ({})", candidate.label, effective);
                supported.push(candidate.label.clone());
            }
            Ok(effective) => {
                log::debug!("{} not supported, got {}", candidate.label, effective);
            }
            Err(e) => {
                log::debug!("{} rejected: {}", candidate.label, e);
            }
        }
    }

    if let Err(e) = session.apply_preview() {
        log::warn!("Failed to restore preview after probe: {}", e);
    }

    log::info!(
        "Probed {} resolutions, {} supported",
        candidates.len(),
        supported.len()
    );
    events.emit(CameraEvent::ProbeResolutions {
        tested: candidates.len(),
        supported: supported.clone(),
    });
    supported
}
