use super::{CaptureDevice, DeviceOpener};
use crate::config::CameraSettings;
use crate::errors::CameraError;
use crate::types::{BackendKind, Frame, PixelFormat, PropertyId, Resolution};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, ControlValueSetter, FrameFormat,
        KnownCameraControl, RequestedFormat, RequestedFormatType,
        Resolution as NokhwaResolution,
    },
    Camera,
};

fn api_backend(backend: BackendKind) -> ApiBackend {
    match backend {
        BackendKind::MediaFoundation => ApiBackend::MediaFoundation,
        BackendKind::AVFoundation => ApiBackend::AVFoundation,
        BackendKind::Video4Linux => ApiBackend::Video4Linux,
        BackendKind::Auto => ApiBackend::Auto,
    }
}

fn control_for(id: PropertyId) -> Option<KnownCameraControl> {
    match id {
        PropertyId::Brightness => Some(KnownCameraControl::Brightness),
        PropertyId::Contrast => Some(KnownCameraControl::Contrast),
        PropertyId::Saturation => Some(KnownCameraControl::Saturation),
        PropertyId::Hue => Some(KnownCameraControl::Hue),
        PropertyId::Sharpness => Some(KnownCameraControl::Sharpness),
        PropertyId::Gamma => Some(KnownCameraControl::Gamma),
        PropertyId::Gain => Some(KnownCameraControl::Gain),
        PropertyId::Exposure => Some(KnownCameraControl::Exposure),
        PropertyId::WhiteBalance => Some(KnownCameraControl::WhiteBalance),
        PropertyId::BacklightCompensation => Some(KnownCameraControl::BacklightComp),
        PropertyId::Focus => Some(KnownCameraControl::Focus),
        PropertyId::Zoom => Some(KnownCameraControl::Zoom),
        // nokhwa exposes no portable auto-mode toggles
        PropertyId::AutoExposure | PropertyId::AutoWhiteBalance => None,
    }
}

/// Opens webcams through nokhwa.
pub struct NativeOpener {
    preview: Resolution,
    fps: u32,
    use_mjpg: bool,
}

impl NativeOpener {
    pub fn new(settings: &CameraSettings) -> Self {
        Self {
            preview: settings.preview(),
            fps: settings.preview_fps,
            use_mjpg: settings.use_mjpg,
        }
    }
}

impl DeviceOpener for NativeOpener {
    fn open(
        &mut self,
        index: u32,
        backend: BackendKind,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let frame_format = if self.use_mjpg {
            FrameFormat::MJPEG
        } else {
            FrameFormat::YUYV
        };
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                NokhwaResolution::new(self.preview.width, self.preview.height),
                frame_format,
                self.fps,
            ),
        ));

        let mut camera =
            Camera::with_backend(CameraIndex::Index(index), requested, api_backend(backend))
                .map_err(|e| {
                    CameraError::DeviceOpenFailure(format!(
                        "index {} via {}: {}",
                        index, backend, e
                    ))
                })?;

        camera.open_stream().map_err(|e| {
            CameraError::DeviceOpenFailure(format!(
                "index {} via {}: failed to start stream: {}",
                index, backend, e
            ))
        })?;

        log::debug!("Opened camera {} via {}", index, backend);
        Ok(Box::new(NativeDevice {
            camera,
            backend,
            sequence: 0,
        }))
    }
}

pub struct NativeDevice {
    camera: Camera,
    backend: BackendKind,
    sequence: u64,
}

impl CaptureDevice for NativeDevice {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| CameraError::FrameReadFailure(format!("Failed to capture frame: {}", e)))?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CameraError::FrameReadFailure(format!("Failed to decode frame: {}", e)))?;

        let (width, height) = (decoded.width(), decoded.height());
        self.sequence += 1;
        Ok(Frame::new(decoded.into_raw(), width, height).with_sequence(self.sequence))
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CameraError> {
        self.camera
            .set_resolution(NokhwaResolution::new(resolution.width, resolution.height))
            .map_err(|e| {
                CameraError::ControlError(format!("Failed to set resolution {}: {}", resolution, e))
            })
    }

    fn resolution(&self) -> Resolution {
        let applied = self.camera.resolution();
        Resolution::new(applied.width_x, applied.height_y)
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<(), CameraError> {
        self.camera
            .set_frame_rate(fps)
            .map_err(|e| CameraError::ControlError(format!("Failed to set frame rate: {}", e)))
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CameraError> {
        let frame_format = match format {
            PixelFormat::Mjpeg => FrameFormat::MJPEG,
            PixelFormat::Yuyv => FrameFormat::YUYV,
        };
        self.camera
            .set_frame_format(frame_format)
            .map_err(|e| CameraError::ControlError(format!("Failed to set pixel format: {}", e)))
    }

    fn set_property(&mut self, id: PropertyId, value: f64) -> Result<(), CameraError> {
        let control = control_for(id).ok_or_else(|| {
            CameraError::Unsupported(format!("{} is not exposed by nokhwa", id.as_str()))
        })?;
        self.camera
            .set_camera_control(control, ControlValueSetter::Integer(value.round() as i64))
            .map_err(|e| {
                CameraError::ControlError(format!("Failed to set {}: {}", id.as_str(), e))
            })
    }
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            log::debug!("stop_stream on release failed: {}", e);
        }
    }
}

// SAFETY: a device is only ever touched from the thread holding the session
// lock, and the handle never leaves the session it was opened into.
unsafe impl Send for NativeDevice {}
