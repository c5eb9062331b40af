use tracing::{debug, info};

use crate::error::{CaptureError, Result};

/// Device paths scanned by `list_devices` and `auto_detect_device`
const MAX_VIDEO_NODES: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    /// FFmpeg `input_format` name of the best advertised format, if any is known
    pub input_format: Option<String>,
}

/// FFmpeg input format names for V4L2 fourccs, in order of preference
const PREFERRED_FORMATS: [(&[u8; 4], &str); 3] =
    [(b"H264", "h264"), (b"MJPG", "mjpeg"), (b"YUYV", "yuyv422")];

#[cfg(feature = "v4l-probe")]
mod v4l_probe {
    use std::path::Path;

    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use super::*;

    fn probe_error(device: &str, reason: impl ToString) -> CaptureError {
        CaptureError::DeviceProbe {
            device: device.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Check that `path` is a V4L2 node with video capture capability
    pub fn probe_device(path: &str) -> Result<FoundDevice> {
        let device = Device::with_path(path).map_err(|e| probe_error(path, e))?;
        let caps = device.query_caps().map_err(|e| probe_error(path, e))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(probe_error(path, "device does not support video capture"));
        }

        let fourccs: Vec<FourCC> = device
            .enum_formats()
            .map(|formats| formats.into_iter().map(|f| f.fourcc).collect())
            .unwrap_or_default();
        let input_format = PREFERRED_FORMATS
            .iter()
            .find(|(fourcc, _)| fourccs.contains(&FourCC::new(fourcc)))
            .map(|(_, name)| (*name).to_owned());

        info!(
            path,
            card = %caps.card,
            driver = %caps.driver,
            formats = ?fourccs.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            "probed capture device"
        );

        Ok(FoundDevice {
            path: path.to_owned(),
            card: caps.card,
            driver: caps.driver,
            input_format,
        })
    }

    /// Every `/dev/videoN` node that accepts video capture
    pub fn list_devices() -> Vec<FoundDevice> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| match probe_device(&path) {
                Ok(found) => Some(found),
                Err(e) => {
                    debug!(error = %e, "skipping video node");
                    None
                }
            })
            .collect()
    }

    /// Auto-detect best capture device
    pub fn auto_detect_device() -> Result<FoundDevice> {
        info!("Auto-detecting capture devices...");

        let devices = list_devices();
        for (_, name) in PREFERRED_FORMATS {
            if let Some(found) = devices
                .iter()
                .find(|d| d.input_format.as_deref() == Some(name))
            {
                info!(path = %found.path, card = %found.card, format = name, "found capture device");
                return Ok(found.clone());
            }
        }

        Err(probe_error("auto", "no suitable capture device found"))
    }
}

#[cfg(feature = "v4l-probe")]
pub use v4l_probe::{auto_detect_device, list_devices, probe_device};

#[cfg(not(feature = "v4l-probe"))]
pub fn auto_detect_device() -> Result<FoundDevice> {
    Err(CaptureError::DeviceProbe {
        device: "auto".into(),
        reason: "built without the v4l-probe feature".into(),
    })
}

#[cfg(not(feature = "v4l-probe"))]
pub fn list_devices() -> Vec<FoundDevice> {
    debug!("device listing needs the v4l-probe feature");
    Vec::new()
}

/// Device value that asks for auto-detection
pub fn is_auto(device: &str) -> bool {
    device.eq_ignore_ascii_case("auto")
}
