//! Per-frame transforms applied to sampled frames.
//!
//! Frames arrive from the decoder as packed BGR24. A candidate frame is
//! colour-converted first, then resized, then encoded as JPEG.
//!
//! JPEG encoding follows the decoder's native channel order: any
//! three-channel buffer is treated as BGR when written. Unconverted frames
//! therefore keep their true colours, while `rgb`-converted frames are stored
//! channel-swapped for consumers that reload images in BGR order.

use crate::decoder::{RawFrame, DECODED_CHANNELS};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageBuffer, Luma, Rgb};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during frame processing.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Resize failed: {0}")]
    ResizeFailed(String),

    #[error("JPEG encoding failed: {0}")]
    EncodeFailed(#[from] image::ImageError),

    #[error("Frame write failed: {0}")]
    Io(#[from] io::Error),
}

/// Optional colour conversion applied to candidate frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Conversion {
    #[default]
    None,
    /// Reorder BGR channels to RGB
    Rgb,
    /// Reduce to a single luminance channel
    Grayscale,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported conversion {0:?}, expected rgb or gray")]
pub struct InvalidConversion(pub String);

impl FromStr for Conversion {
    type Err = InvalidConversion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "rgb" => Ok(Self::Rgb),
            "gray" | "grey" | "grayscale" => Ok(Self::Grayscale),
            _ => Err(InvalidConversion(s.to_string())),
        }
    }
}

/// Fixed output size. Only exists when both dimensions are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    /// Build a target size from optional request parts. Resizing is
    /// disabled unless both dimensions are present and positive.
    pub fn from_parts(width: Option<u32>, height: Option<u32>) -> Option<Self> {
        match (width, height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(Self { width, height })
            }
            _ => None,
        }
    }
}

/// Channel layout of a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Bgr,
    Rgb,
    Gray,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Bgr | Self::Rgb => 3,
            Self::Gray => 1,
        }
    }
}

/// A frame after conversion and resize, ready to persist.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

/// Converts, resizes and encodes candidate frames.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    conversion: Conversion,
    target_size: Option<TargetSize>,
    jpeg_quality: u8,
}

impl FrameProcessor {
    pub fn new(conversion: Conversion, target_size: Option<TargetSize>, jpeg_quality: u8) -> Self {
        Self {
            conversion,
            target_size,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Apply colour conversion, then resize.
    pub fn process(&self, frame: RawFrame) -> Result<ProcessedFrame, ProcessingError> {
        let expected = frame.width as usize * frame.height as usize * DECODED_CHANNELS;
        if frame.data.len() != expected {
            return Err(ProcessingError::InvalidFormat(format!(
                "expected {expected} BGR bytes for {}x{}, got {}",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }

        let converted = convert(frame, self.conversion);

        match self.target_size {
            Some(size) => resize(converted, size),
            None => Ok(converted),
        }
    }

    /// Encode `frame` as JPEG at `path`. A failed write leaves no file
    /// behind.
    pub fn write_jpeg(&self, frame: &ProcessedFrame, path: &Path) -> Result<(), ProcessingError> {
        let result = encode_to(frame, path, self.jpeg_quality);
        if result.is_err() {
            let _ = std::fs::remove_file(path);
        }
        result
    }
}

fn encode_to(frame: &ProcessedFrame, path: &Path, quality: u8) -> Result<(), ProcessingError> {
    let mut writer = BufWriter::new(File::create(path)?);
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
        match frame.layout {
            PixelLayout::Gray => {
                encoder.encode(&frame.data, frame.width, frame.height, ExtendedColorType::L8)?
            }
            PixelLayout::Bgr | PixelLayout::Rgb => {
                let rgb = swap_red_blue(&frame.data);
                encoder.encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)?
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn convert(frame: RawFrame, conversion: Conversion) -> ProcessedFrame {
    let RawFrame {
        data,
        width,
        height,
    } = frame;

    match conversion {
        Conversion::None => ProcessedFrame {
            data,
            width,
            height,
            layout: PixelLayout::Bgr,
        },
        Conversion::Rgb => ProcessedFrame {
            data: swap_red_blue(&data),
            width,
            height,
            layout: PixelLayout::Rgb,
        },
        Conversion::Grayscale => ProcessedFrame {
            data: bgr_to_luma(&data),
            width,
            height,
            layout: PixelLayout::Gray,
        },
    }
}

fn resize(frame: ProcessedFrame, size: TargetSize) -> Result<ProcessedFrame, ProcessingError> {
    if frame.width == size.width && frame.height == size.height {
        return Ok(frame);
    }

    let ProcessedFrame {
        data,
        width,
        height,
        layout,
    } = frame;
    let mismatch = || {
        ProcessingError::ResizeFailed(format!(
            "buffer does not match {width}x{height} with {} channels",
            layout.channels()
        ))
    };

    // Bilinear, channel order is irrelevant here
    let data = match layout {
        PixelLayout::Gray => {
            let image = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(width, height, data)
                .ok_or_else(mismatch)?;
            imageops::resize(&image, size.width, size.height, FilterType::Triangle).into_raw()
        }
        PixelLayout::Bgr | PixelLayout::Rgb => {
            let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, data)
                .ok_or_else(mismatch)?;
            imageops::resize(&image, size.width, size.height, FilterType::Triangle).into_raw()
        }
    };

    Ok(ProcessedFrame {
        data,
        width: size.width,
        height: size.height,
        layout,
    })
}

fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect()
}

/// BGR to luminance with the BT.601 weights in 14-bit fixed point.
fn bgr_to_luma(data: &[u8]) -> Vec<u8> {
    const B: u32 = 1868;
    const G: u32 = 9617;
    const R: u32 = 4899;

    data.chunks_exact(3)
        .map(|px| {
            let y = px[0] as u32 * B + px[1] as u32 * G + px[2] as u32 * R;
            ((y + (1 << 13)) >> 14) as u8
        })
        .collect()
}
