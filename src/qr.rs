// src/qr.rs
use image::{GrayImage, Luma};
use qrcode::{Color, QrCode};

use crate::error::PairError;

pub const DEFAULT_QR_SIZE: u32 = 512;
/// Largest raster `encode` will allocate (16 MiB of luma).
pub const MAX_QR_SIZE: u32 = 4096;

// Modules of white border on every side.
const QUIET_ZONE: u32 = 4;

const DARK: Luma<u8> = Luma([0]);
const LIGHT: Luma<u8> = Luma([255]);

#[derive(Debug, Clone, Copy)]
pub struct QrEncoder {
    size: u32,
}

impl Default for QrEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_QR_SIZE)
    }
}

impl QrEncoder {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn render(&self, content: &str) -> Result<GrayImage, PairError> {
        encode(content, self.size)
    }
}

/// Encodes `content` into a `size`x`size` black-on-white QR raster.
pub fn encode(content: &str, size: u32) -> Result<GrayImage, PairError> {
    if size > MAX_QR_SIZE {
        return Err(PairError::Encode(format!(
            "{size}px exceeds the {MAX_QR_SIZE}px limit"
        )));
    }
    let code = QrCode::new(content.as_bytes()).map_err(|e| PairError::Encode(e.to_string()))?;
    let width = code.width() as u32;
    let total = width + 2 * QUIET_ZONE;

    if size < total {
        return Err(PairError::Encode(format!(
            "{size}px is too small for a {total}-module code"
        )));
    }

    let colors = code.to_colors();
    let img = GrayImage::from_fn(size, size, |x, y| {
        let mx = x * total / size;
        let my = y * total / size;
        let inside = (QUIET_ZONE..QUIET_ZONE + width).contains(&mx)
            && (QUIET_ZONE..QUIET_ZONE + width).contains(&my);
        if !inside {
            return LIGHT;
        }
        let idx = ((my - QUIET_ZONE) * width + (mx - QUIET_ZONE)) as usize;
        if colors[idx] == Color::Dark { DARK } else { LIGHT }
    });

    Ok(img)
}
