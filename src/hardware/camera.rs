//! Camera vendor SDK boundary.
//!
//! The SDK is treated as an opaque capability: enumerate attached cameras,
//! attach one to a context id, configure exposure and frame rate, and then
//! "acquire a frame or fail". [`CameraBackend`] is that capability; a real
//! vendor binding implements it outside this crate. [`SimulatedCameraSdk`]
//! provides a deterministic stand-in for tests and dry runs.
//!
//! Frames arrive in the sensor's native [`PixelFormat`] and are converted to
//! 8-bit RGB by [`to_rgb8`] before they reach the device driver's caller.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use std::collections::HashSet;
use std::time::Duration;

/// Native pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 16-bit monochrome, little endian.
    Mono16,
    /// 8-bit RGB, packed.
    Rgb8,
    /// 8-bit BGR, packed.
    Bgr8,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }
}

/// A frame as delivered by the SDK.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Context id of the unit that produced the frame.
    pub context_id: usize,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// Raw pixel data
    pub data: Vec<u8>,
}

/// Identity of an enumerated camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// Vendor model name.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Transport class reported by the SDK (e.g. "BaslerGigE").
    pub device_class: String,
}

/// Opaque camera SDK session controlling an array of attached units.
#[async_trait]
pub trait CameraBackend: Send {
    /// List every camera visible to the SDK.
    fn enumerate(&mut self) -> AppResult<Vec<CameraInfo>>;

    /// Attach the enumerated camera `device_index` and tag its frames with `context_id`.
    fn attach(&mut self, device_index: usize, context_id: usize) -> AppResult<CameraInfo>;

    /// Set the exposure time of an attached unit, in microseconds.
    fn set_exposure_time(&mut self, context_id: usize, exposure_us: f64) -> AppResult<()>;

    /// Set the acquisition frame rate of an attached unit, in Hz.
    fn set_frame_rate(&mut self, context_id: usize, frame_rate_hz: f64) -> AppResult<()>;

    /// Start continuous grabbing on every attached unit.
    fn start_grabbing(&mut self) -> AppResult<()>;

    /// Retrieve the next frame of one unit, waiting at most `timeout`.
    ///
    /// Fails with [`DaqError::Acquisition`] when the unit's buffer stays empty.
    async fn retrieve(&mut self, context_id: usize, timeout: Duration) -> AppResult<RawFrame>;

    /// Stop grabbing and release every unit.
    fn close(&mut self) -> AppResult<()>;
}

/// Entry point of a camera SDK: opens a fresh [`CameraBackend`] session.
pub trait CameraSdk: Send + Sync {
    /// Open a new session.
    fn open(&self) -> AppResult<Box<dyn CameraBackend>>;
}

/// Convert a raw frame to 8-bit RGB.
pub fn to_rgb8(frame: &RawFrame) -> AppResult<RgbImage> {
    let expected = frame.width as usize * frame.height as usize * frame.format.bytes_per_pixel();
    if frame.data.len() != expected {
        return Err(DaqError::Acquisition {
            unit: frame.context_id,
            reason: format!(
                "frame buffer holds {} bytes, expected {expected} for {}x{} {:?}",
                frame.data.len(),
                frame.width,
                frame.height,
                frame.format
            ),
        });
    }

    let invalid = || DaqError::Acquisition {
        unit: frame.context_id,
        reason: "frame buffer does not match its dimensions".to_string(),
    };

    let image = match frame.format {
        PixelFormat::Mono8 => {
            let gray = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(invalid)?;
            DynamicImage::ImageLuma8(gray).to_rgb8()
        }
        PixelFormat::Mono16 => {
            let pixels: Vec<u16> = frame
                .data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect();
            let gray: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(frame.width, frame.height, pixels).ok_or_else(invalid)?;
            DynamicImage::ImageLuma16(gray).to_rgb8()
        }
        PixelFormat::Rgb8 => {
            RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(invalid)?
        }
        PixelFormat::Bgr8 => {
            let mut data = frame.data.clone();
            for pixel in data.chunks_exact_mut(3) {
                pixel.swap(0, 2);
            }
            RgbImage::from_raw(frame.width, frame.height, data).ok_or_else(invalid)?
        }
    };
    Ok(image)
}

// =============================================================================
// Simulated SDK
// =============================================================================

/// Deterministic camera SDK for tests and dry runs.
///
/// Enumerates `devices` cameras producing gradient frames. Units listed with
/// [`with_failing_unit`](Self::with_failing_unit) never deliver a frame.
#[derive(Debug, Clone)]
pub struct SimulatedCameraSdk {
    devices: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    failing_units: HashSet<usize>,
}

impl SimulatedCameraSdk {
    /// Simulate `devices` attached cameras (64x48, Mono8).
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            width: 64,
            height: 48,
            format: PixelFormat::Mono8,
            failing_units: HashSet::new(),
        }
    }

    /// Set the frame size.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the native pixel format.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Make the unit with this context id time out on every retrieve.
    pub fn with_failing_unit(mut self, context_id: usize) -> Self {
        self.failing_units.insert(context_id);
        self
    }
}

impl CameraSdk for SimulatedCameraSdk {
    fn open(&self) -> AppResult<Box<dyn CameraBackend>> {
        Ok(Box::new(SimulatedCameraBackend {
            sdk: self.clone(),
            attached: Vec::new(),
            grabbing: false,
        }))
    }
}

#[derive(Debug)]
struct SimulatedUnit {
    context_id: usize,
    info: CameraInfo,
    exposure_us: f64,
    frame_rate_hz: f64,
    frame_count: u64,
}

/// Session of a [`SimulatedCameraSdk`].
#[derive(Debug)]
pub struct SimulatedCameraBackend {
    sdk: SimulatedCameraSdk,
    attached: Vec<SimulatedUnit>,
    grabbing: bool,
}

impl SimulatedCameraBackend {
    fn info(index: usize) -> CameraInfo {
        CameraInfo {
            model: "Simulated acA1300-30gc".to_string(),
            serial_number: format!("SIM{:05}", 22_000 + index),
            device_class: "Simulated".to_string(),
        }
    }

    fn unit_mut(&mut self, context_id: usize) -> AppResult<&mut SimulatedUnit> {
        self.attached
            .iter_mut()
            .find(|unit| unit.context_id == context_id)
            .ok_or_else(|| {
                DaqError::Configuration(format!("camera context {context_id} is not attached"))
            })
    }

    fn pattern(&self, frame_count: u64, context_id: usize) -> Vec<u8> {
        let (w, h) = (self.sdk.width as usize, self.sdk.height as usize);
        let shift = (frame_count as usize + context_id * 17) % 256;
        let mut data = Vec::with_capacity(w * h * self.sdk.format.bytes_per_pixel());
        for y in 0..h {
            for x in 0..w {
                let level = ((x + y) * 255 / (w + h).max(1) + shift) % 256;
                match self.sdk.format {
                    PixelFormat::Mono8 => data.push(level as u8),
                    PixelFormat::Mono16 => data.extend_from_slice(&((level as u16) << 8).to_le_bytes()),
                    PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                        data.extend_from_slice(&[level as u8, (255 - level) as u8, (y % 256) as u8])
                    }
                }
            }
        }
        data
    }
}

#[async_trait]
impl CameraBackend for SimulatedCameraBackend {
    fn enumerate(&mut self) -> AppResult<Vec<CameraInfo>> {
        Ok((0..self.sdk.devices).map(Self::info).collect())
    }

    fn attach(&mut self, device_index: usize, context_id: usize) -> AppResult<CameraInfo> {
        if device_index >= self.sdk.devices {
            return Err(DaqError::Configuration(format!(
                "no camera at index {device_index} ({} enumerated)",
                self.sdk.devices
            )));
        }
        let info = Self::info(device_index);
        self.attached.push(SimulatedUnit {
            context_id,
            info: info.clone(),
            exposure_us: 0.0,
            frame_rate_hz: 0.0,
            frame_count: 0,
        });
        Ok(info)
    }

    fn set_exposure_time(&mut self, context_id: usize, exposure_us: f64) -> AppResult<()> {
        if exposure_us <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "exposure time must be positive, got {exposure_us}"
            )));
        }
        self.unit_mut(context_id)?.exposure_us = exposure_us;
        Ok(())
    }

    fn set_frame_rate(&mut self, context_id: usize, frame_rate_hz: f64) -> AppResult<()> {
        if frame_rate_hz <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "frame rate must be positive, got {frame_rate_hz}"
            )));
        }
        self.unit_mut(context_id)?.frame_rate_hz = frame_rate_hz;
        Ok(())
    }

    fn start_grabbing(&mut self) -> AppResult<()> {
        self.grabbing = true;
        Ok(())
    }

    async fn retrieve(&mut self, context_id: usize, timeout: Duration) -> AppResult<RawFrame> {
        if !self.grabbing {
            return Err(DaqError::Acquisition {
                unit: context_id,
                reason: "grabbing not started".to_string(),
            });
        }
        if self.sdk.failing_units.contains(&context_id) {
            tokio::time::sleep(timeout).await;
            return Err(DaqError::Acquisition {
                unit: context_id,
                reason: format!("no frame within {} ms", timeout.as_millis()),
            });
        }

        let unit = self.unit_mut(context_id)?;
        unit.frame_count += 1;
        tracing::trace!(
            context_id,
            serial = %unit.info.serial_number,
            exposure_us = unit.exposure_us,
            frame_rate_hz = unit.frame_rate_hz,
            "Simulated frame"
        );
        let frame_count = unit.frame_count;

        Ok(RawFrame {
            context_id,
            width: self.sdk.width,
            height: self.sdk.height,
            format: self.sdk.format,
            data: self.pattern(frame_count, context_id),
        })
    }

    fn close(&mut self) -> AppResult<()> {
        self.grabbing = false;
        self.attached.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let frame = RawFrame {
            context_id: 0,
            width: 1,
            height: 1,
            format: PixelFormat::Bgr8,
            data: vec![10, 20, 30],
        };
        let rgb = to_rgb8(&frame).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn mono16_is_scaled_to_eight_bits() {
        let frame = RawFrame {
            context_id: 0,
            width: 2,
            height: 1,
            format: PixelFormat::Mono16,
            data: [0u16, 0xFFFF].iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        let rgb = to_rgb8(&frame).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn truncated_buffer_is_an_acquisition_error() {
        let frame = RawFrame {
            context_id: 2,
            width: 4,
            height: 4,
            format: PixelFormat::Mono8,
            data: vec![0; 10],
        };
        assert!(matches!(
            to_rgb8(&frame),
            Err(DaqError::Acquisition { unit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn simulated_backend_tags_frames_with_context() {
        let sdk = SimulatedCameraSdk::new(2).with_format(PixelFormat::Rgb8);
        let mut backend = sdk.open().unwrap();
        assert_eq!(backend.enumerate().unwrap().len(), 2);
        backend.attach(0, 0).unwrap();
        backend.attach(1, 1).unwrap();
        backend.start_grabbing().unwrap();

        let frame = backend.retrieve(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame.context_id, 1);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[tokio::test]
    async fn failing_unit_times_out() {
        let sdk = SimulatedCameraSdk::new(1).with_failing_unit(0);
        let mut backend = sdk.open().unwrap();
        backend.attach(0, 0).unwrap();
        backend.start_grabbing().unwrap();

        let err = backend.retrieve(0, Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, DaqError::Acquisition { unit: 0, .. }));
    }

    #[test]
    fn attach_beyond_enumeration_fails() {
        let mut backend = SimulatedCameraSdk::new(1).open().unwrap();
        assert!(backend.attach(1, 1).is_err());
    }
}
