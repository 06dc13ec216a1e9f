use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::Duration;

use facegate_config::CameraSettings;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::control::{Control, Description, Value};
use v4l::format::FourCC;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;

use super::{convert_raw_frame, Camera, DeviceLocator, Frame};
use crate::errors::{catch_unwind_silent, AppError, AppResult};

const STREAM_BUFFERS: u32 = 4;

/// V4L2 camera session holding a started mmap stream.
pub struct V4lCamera {
    // Declared before `device` so the stream is torn down first.
    stream: Option<Stream<'static>>,
    device: Option<v4l::Device>,
    path: String,
    pixel_format: String,
    width: u32,
    height: u32,
}

impl V4lCamera {
    pub fn open(settings: &CameraSettings) -> AppResult<Self> {
        let locator = DeviceLocator::from_option(Some(settings.device.clone()));
        let mut device = locator.open()?;
        debug!(device = %locator.display(), "opened video device");

        let caps = device.query_caps()?;
        ensure_capabilities(&caps)?;
        debug!(driver = %caps.driver, card = %caps.card, bus = %caps.bus, "device capabilities");

        let fourcc = parse_fourcc(&settings.pixel_format)
            .ok_or_else(|| AppError::UnsupportedFormat(settings.pixel_format.clone()))?;
        ensure_format_supported(&device, fourcc)?;
        ensure_framesize_supported(&device, fourcc, settings.width, settings.height)?;

        let mut format = device.format()?;
        format.fourcc = fourcc;
        format.width = settings.width;
        format.height = settings.height;
        let format = device.set_format(&format)?;
        let negotiated = fourcc_to_string(format.fourcc);
        info!(
            pixel_format = %negotiated,
            width = format.width,
            height = format.height,
            "negotiated camera format"
        );

        if settings.fps > 0 {
            match device.set_params(&Parameters::with_fps(settings.fps)) {
                Ok(_) => debug!(fps = settings.fps, "applied frame rate"),
                Err(err) => warn!(fps = settings.fps, "unable to set frame rate: {err}"),
            }
        }

        apply_controls(&mut device, &settings.controls);

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)?;
        // Without a timeout v4l polls forever on a stalled device.
        stream.set_timeout(settings.capture_timeout);
        for idx in 0..settings.warmup_frames {
            stream.next().map_err(|err| {
                AppError::FrameProcessing(format!(
                    "failed to read warm-up frame {}: {}",
                    idx + 1,
                    err
                ))
            })?;
        }
        if settings.settle > Duration::ZERO {
            sleep(settings.settle);
        }

        Ok(Self {
            stream: Some(stream),
            device: Some(device),
            path: locator.display(),
            pixel_format: negotiated,
            width: format.width,
            height: format.height,
        })
    }
}

impl Camera for V4lCamera {
    fn capture_frame(&mut self) -> AppResult<Frame> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            AppError::FrameProcessing(format!("camera session {} is closed", self.path))
        })?;
        let (data, _) = stream
            .next()
            .map_err(|err| capture_error(&self.path, err))?;
        convert_raw_frame(data, &self.pixel_format, self.width, self.height)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(device = %self.path, "stopped capture stream");
        }
        if self.device.take().is_some() {
            info!(device = %self.path, "released camera");
        }
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_error(path: &str, err: std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        AppError::FrameProcessing(format!("camera {path} delivered no frame before the timeout"))
    } else {
        AppError::Io(err)
    }
}

fn ensure_capabilities(caps: &Capabilities) -> AppResult<()> {
    let flags = caps.capabilities;
    let mut reasons = Vec::new();
    if !flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
        reasons.push("missing VIDEO_CAPTURE".to_string());
    }
    if !flags.contains(CapabilityFlags::STREAMING) {
        reasons.push("missing STREAMING".to_string());
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(AppError::Capability(reasons.join(", ")))
    }
}

fn ensure_format_supported(device: &v4l::Device, requested: FourCC) -> AppResult<()> {
    let formats = device.enum_formats()?;
    if formats.iter().any(|format| format.fourcc == requested) {
        Ok(())
    } else {
        Err(AppError::UnsupportedFormat(fourcc_to_string(requested)))
    }
}

fn ensure_framesize_supported(
    device: &v4l::Device,
    fourcc: FourCC,
    width: u32,
    height: u32,
) -> AppResult<()> {
    let framesizes = device.enum_framesizes(fourcc)?;
    let supported = framesizes.iter().any(|size| match &size.size {
        FrameSizeEnum::Discrete(discrete) => discrete.width == width && discrete.height == height,
        FrameSizeEnum::Stepwise(step) => {
            (step.min_width..=step.max_width).contains(&width)
                && (step.min_height..=step.max_height).contains(&height)
        }
    });
    if supported {
        Ok(())
    } else {
        Err(AppError::UnsupportedFrameSize {
            width,
            height,
            pixel_format: fourcc_to_string(fourcc),
        })
    }
}

/// Apply named driver controls. Missing or rejected controls are logged and skipped.
fn apply_controls(device: &mut v4l::Device, requested: &BTreeMap<String, i64>) {
    if requested.is_empty() {
        return;
    }

    // Some drivers report control types v4l cannot represent and the query panics.
    let queried = catch_unwind_silent("camera control query", || {
        device.query_controls().map_err(AppError::from)
    });
    let available = match queried {
        Ok(list) => list,
        Err(err) => {
            warn!("unable to query camera controls: {err}");
            return;
        }
    };

    for (name, value) in requested {
        match find_control(&available, name) {
            Some(ctrl) => match device.set_control(Control {
                id: ctrl.id,
                value: Value::Integer(*value),
            }) {
                Ok(_) => debug!(control = %ctrl.name, value, "applied camera control"),
                Err(err) => warn!(control = %ctrl.name, value, "failed to set control: {err}"),
            },
            None => warn!(control = %name, "camera control not supported by device"),
        }
    }
}

fn parse_fourcc(code: &str) -> Option<FourCC> {
    if code.is_empty() || code.len() > 4 {
        return None;
    }
    let mut repr = [b' '; 4];
    for (i, byte) in code.as_bytes().iter().enumerate() {
        repr[i] = *byte;
    }
    Some(FourCC::new(&repr))
}

fn fourcc_to_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr)
        .trim_matches(|c| c == char::from(0) || c == ' ')
        .to_string()
}

fn find_control<'a>(controls: &'a [Description], name: &str) -> Option<&'a Description> {
    let wanted = normalize_control_name(name);
    controls
        .iter()
        .find(|ctrl| normalize_control_name(&ctrl.name) == wanted)
}

fn normalize_control_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_' | ','))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_short_codes() {
        let fourcc = parse_fourcc("Y16").unwrap();
        assert_eq!(fourcc_to_string(fourcc), "Y16");
        assert_eq!(fourcc_to_string(parse_fourcc("RGB3").unwrap()), "RGB3");
    }

    #[test]
    fn stalled_capture_is_reported_as_timeout() {
        let err = capture_error(
            "/dev/video0",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "VIDIOC_DQBUF"),
        );
        match err {
            AppError::FrameProcessing(message) => {
                assert!(message.contains("/dev/video0"));
                assert!(message.contains("timeout"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let other = capture_error("/dev/video0", std::io::Error::from_raw_os_error(19));
        assert!(matches!(other, AppError::Io(_)));
    }

    #[test]
    fn fourcc_rejects_bad_lengths() {
        assert!(parse_fourcc("").is_none());
        assert!(parse_fourcc("TOOLONG").is_none());
    }

    #[test]
    fn control_names_ignore_punctuation_and_case() {
        assert_eq!(
            normalize_control_name("Noise Reduction, Mode"),
            normalize_control_name("noise_reduction-mode")
        );
        assert_eq!(normalize_control_name("AfMode"), "afmode");
    }

    #[test]
    fn missing_capabilities_are_listed() {
        let caps = Capabilities {
            driver: "fake".into(),
            card: "fake".into(),
            bus: "loopback".into(),
            version: (0, 0, 0),
            capabilities: CapabilityFlags::VIDEO_CAPTURE,
        };
        let err = ensure_capabilities(&caps).unwrap_err();
        assert!(matches!(err, AppError::Capability(msg) if msg.contains("STREAMING")));
    }
}
