use std::path::PathBuf;

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::errors::{AppError, AppResult};

pub mod device;

pub use device::V4lCamera;

const CHANNELS: usize = 3;

/// Order of the three colour samples in each pixel of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Interleaved 8-bit three-channel pixel buffer owned by a single monitoring iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub data: Vec<u8>,
}

/// Axis-aligned rectangle that lies fully inside a frame and has non-zero area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, order: ChannelOrder, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            order,
            data,
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, ChannelOrder::Rgb, image.into_raw())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AppError::InvalidFrame(format!(
                "frame has empty dimensions {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * CHANNELS;
        if self.data.len() != expected {
            return Err(AppError::InvalidFrame(format!(
                "expected {} bytes for a {}x{} three-channel frame, got {}",
                expected,
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Single-channel luminance image (BT.601 weights) used by the detector.
    pub fn to_luma(&self) -> AppResult<GrayImage> {
        self.validate()?;
        let mut gray = GrayImage::new(self.width, self.height);
        for (idx, pixel) in self.data.chunks_exact(CHANNELS).enumerate() {
            let [r, g, b] = self.rgb_of(pixel);
            let value = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
            let x = idx as u32 % self.width;
            let y = idx as u32 / self.width;
            gray.put_pixel(x, y, Luma([value as u8]));
        }
        Ok(gray)
    }

    pub fn to_rgb_image(&self) -> AppResult<RgbImage> {
        self.crop_rgb(PixelRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        })
    }

    /// Copy `rect` out of the frame, converting to RGB sample order.
    pub fn crop_rgb(&self, rect: PixelRect) -> AppResult<RgbImage> {
        self.validate()?;
        let fits_x = rect.x.checked_add(rect.width).map_or(false, |end| end <= self.width);
        let fits_y = rect
            .y
            .checked_add(rect.height)
            .map_or(false, |end| end <= self.height);
        if rect.width == 0 || rect.height == 0 || !fits_x || !fits_y {
            return Err(AppError::InvalidFrame(format!(
                "crop {}x{}+{}+{} outside {}x{} frame",
                rect.width, rect.height, rect.x, rect.y, self.width, self.height
            )));
        }

        let stride = self.width as usize * CHANNELS;
        let mut out = RgbImage::new(rect.width, rect.height);
        for row in 0..rect.height {
            let start = (rect.y + row) as usize * stride + rect.x as usize * CHANNELS;
            let end = start + rect.width as usize * CHANNELS;
            for (col, pixel) in self.data[start..end].chunks_exact(CHANNELS).enumerate() {
                out.put_pixel(col as u32, row, Rgb(self.rgb_of(pixel)));
            }
        }
        Ok(out)
    }

    fn rgb_of(&self, pixel: &[u8]) -> [u8; 3] {
        match self.order {
            ChannelOrder::Rgb => [pixel[0], pixel[1], pixel[2]],
            ChannelOrder::Bgr => [pixel[2], pixel[1], pixel[0]],
        }
    }
}

/// Live camera session. Dropping or closing it releases the device.
pub trait Camera {
    fn capture_frame(&mut self) -> AppResult<Frame>;
    fn close(&mut self);
}

#[derive(Debug, Clone)]
pub enum DeviceLocator {
    Index(u32),
    Path(PathBuf),
}

impl DeviceLocator {
    pub fn from_option(device: Option<String>) -> Self {
        match device {
            Some(text) => {
                if let Ok(index) = text.parse::<u32>() {
                    DeviceLocator::Index(index)
                } else {
                    DeviceLocator::Path(PathBuf::from(text))
                }
            }
            None => DeviceLocator::Index(0),
        }
    }

    pub fn display(&self) -> String {
        match self {
            DeviceLocator::Index(i) => format!("/dev/video{i}"),
            DeviceLocator::Path(path) => path.display().to_string(),
        }
    }

    fn open(&self) -> AppResult<v4l::Device> {
        let opened = match self {
            DeviceLocator::Index(index) => v4l::Device::new(*index as usize),
            DeviceLocator::Path(path) => v4l::Device::with_path(path),
        };
        opened.map_err(|source| AppError::DeviceOpen {
            device: self.display(),
            source,
        })
    }
}

/// Convert one raw driver buffer into a [`Frame`].
pub fn convert_raw_frame(
    data: &[u8],
    pixel_format: &str,
    width: u32,
    height: u32,
) -> AppResult<Frame> {
    let pixels = width as usize * height as usize;

    match pixel_format {
        "RGB3" | "BGR3" => {
            let expected = pixels * CHANNELS;
            ensure_len(data, expected, pixel_format)?;
            let order = if pixel_format == "RGB3" {
                ChannelOrder::Rgb
            } else {
                ChannelOrder::Bgr
            };
            Ok(Frame::new(width, height, order, data[..expected].to_vec()))
        }
        "GREY" | "Y08" => {
            ensure_len(data, pixels, pixel_format)?;
            let mut buffer = Vec::with_capacity(pixels * CHANNELS);
            for &value in &data[..pixels] {
                buffer.extend_from_slice(&[value, value, value]);
            }
            Ok(Frame::new(width, height, ChannelOrder::Rgb, buffer))
        }
        "YUYV" => {
            if pixels % 2 != 0 {
                return Err(AppError::FrameProcessing(
                    "incomplete YUYV macro-pixel encountered".into(),
                ));
            }
            let expected = pixels * 2;
            ensure_len(data, expected, pixel_format)?;
            let mut buffer = Vec::with_capacity(pixels * CHANNELS);
            for chunk in data[..expected].chunks_exact(4) {
                let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
                buffer.extend_from_slice(&yuv_to_rgb(y0, u, v));
                buffer.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            Ok(Frame::new(width, height, ChannelOrder::Rgb, buffer))
        }
        other => Err(AppError::FrameProcessing(format!(
            "unsupported conversion from pixel format {other}"
        ))),
    }
}

fn ensure_len(data: &[u8], expected: usize, pixel_format: &str) -> AppResult<()> {
    if data.len() < expected {
        return Err(AppError::FrameProcessing(format!(
            "expected {} bytes for {} frame, got {}",
            expected,
            pixel_format,
            data.len()
        )));
    }
    Ok(())
}

// BT.601 limited range.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |value: i32| value.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}
