//! Data URL decoding and bounded image downscaling.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use log::debug;

use crate::storage_error::{StorageError, StorageResult};

/// A decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DataUrl {
    pub fn parse(url: &str) -> StorageResult<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| StorageError::Validation("not a data URL".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| StorageError::Validation("data URL has no payload".to_string()))?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or_else(|| StorageError::Validation("data URL is not base64 encoded".to_string()))?;

        Ok(Self {
            mime_type: mime_type.to_string(),
            bytes: STANDARD.decode(payload.trim())?,
        })
    }

    pub fn encode(mime_type: &str, bytes: &[u8]) -> String {
        format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
    }
}

/// Largest size that fits inside `max_width` x `max_height` with the same
/// aspect ratio. Sources already within bounds are returned unchanged.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w.min(max_width), h.min(max_height))
}

/// Decodes an image data URL, downscales it to fit the bounds and re-encodes
/// it as a JPEG data URL.
pub fn resize_image(
    data_url: &str,
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> StorageResult<String> {
    let source = DataUrl::parse(data_url)?;
    let img = image::load_from_memory(&source.bytes)?;
    let (width, height) = img.dimensions();
    let (target_w, target_h) = fit_within(width, height, max_width, max_height);

    let img = if (target_w, target_h) == (width, height) {
        img
    } else {
        debug!("resizing {}x{} to {}x{}", width, height, target_w, target_h);
        img.resize_exact(target_w, target_h, FilterType::Triangle)
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&rgb)?;
    Ok(DataUrl::encode("image/jpeg", &out))
}
