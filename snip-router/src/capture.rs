//! Screenshot capture.
//!
//! Grabs the visible tab (falling back to a desktop capture) as a PNG data
//! URL and recompresses oversized captures to JPEG before they are sent to
//! the AI service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clipboard::first_ok;
use crate::config::CaptureConfig;
use crate::surface::{CaptureApi, CaptureRect, SurfaceError, TabCaptureOptions};
use crate::types::InputFile;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture failed: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Not a base64 data URL")]
    InvalidDataUrl,

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureSource {
    Tab,
    Desktop,
}

/// Screenshot acquisition over a [`CaptureApi`]
pub struct CaptureService {
    api: Arc<dyn CaptureApi>,
    config: CaptureConfig,
}

impl CaptureService {
    pub fn new(api: Arc<dyn CaptureApi>, config: CaptureConfig) -> Self {
        Self { api, config }
    }

    /// Capture the visible tab, cropped to `rect` when it has a positive
    /// size. Falls back to the desktop when the tab cannot be captured.
    pub async fn capture_visible_tab(
        &self,
        rect: Option<CaptureRect>,
        scale: Option<f64>,
    ) -> Result<String, CaptureError> {
        let rect = rect.filter(CaptureRect::is_usable);
        let options = TabCaptureOptions {
            rect,
            scale: Some(scale.unwrap_or(1.0)),
        };

        let start = Instant::now();
        let captured = first_ok([CaptureSource::Tab, CaptureSource::Desktop], |source| {
            let options = &options;
            async move {
                match source {
                    CaptureSource::Tab => self.api.capture_visible_tab(options).await,
                    CaptureSource::Desktop => self.api.capture_desktop(rect).await,
                }
            }
        })
        .await;

        let data_url = match captured {
            Ok((source, data_url)) => {
                debug!("📸 {:?} captured in {:?}", source, start.elapsed());
                data_url
            }
            Err(mut failures) => {
                for (source, e) in &failures {
                    warn!("{:?} capture failed: {}", source, e);
                }
                let (_, last) = failures
                    .pop()
                    .ok_or(SurfaceError::Unavailable("screen capture"))?;
                return Err(last.into());
            }
        };

        Ok(self.compress(data_url).await)
    }

    /// [`compress_if_needed`] off the async runtime
    pub async fn compress(&self, data_url: String) -> String {
        if data_url.len() <= self.config.size_threshold_bytes {
            return data_url;
        }
        let threshold = self.config.size_threshold_bytes;
        let quality = self.config.jpeg_quality;
        let original = data_url.clone();
        tokio::task::spawn_blocking(move || compress_if_needed(&data_url, threshold, quality))
            .await
            .unwrap_or(original)
    }
}

/// Recompress a data URL longer than `threshold` to JPEG. The JPEG is only
/// adopted when it decodes to an image with non-zero dimensions; any failure
/// keeps the original.
pub fn compress_if_needed(data_url: &str, threshold: usize, quality: u8) -> String {
    if data_url.len() <= threshold {
        return data_url.to_string();
    }

    let start = Instant::now();
    let compressed = decode_data_url(data_url)
        .and_then(|(_, bytes)| encode_jpeg(&bytes, quality))
        .map(|jpeg| format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)));

    match compressed {
        Ok(jpeg_url) if is_showable(&jpeg_url) => {
            debug!(
                "Compressed capture {} -> {} bytes in {:?}",
                data_url.len(),
                jpeg_url.len(),
                start.elapsed()
            );
            jpeg_url
        }
        Ok(_) => {
            warn!("Compressed capture does not decode, keeping original");
            data_url.to_string()
        }
        Err(e) => {
            warn!("Capture compression failed: {}", e);
            data_url.to_string()
        }
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into mime type and bytes
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), CaptureError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or(CaptureError::InvalidDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(CaptureError::InvalidDataUrl)?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or(CaptureError::InvalidDataUrl)?;
    let mime = if mime.is_empty() { "text/plain" } else { mime };
    Ok((mime.to_string(), STANDARD.decode(payload.trim())?))
}

fn encode_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, CaptureError> {
    let image = image::load_from_memory(bytes)?;
    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(out)
}

/// True when the data URL decodes to an image with a non-zero size
pub fn is_showable(data_url: &str) -> bool {
    let Ok((_, bytes)) = decode_data_url(data_url) else {
        return false;
    };
    match image::load_from_memory(&bytes) {
        Ok(image) => {
            let (width, height) = image.dimensions();
            trace!("Decoded {}x{} image", width, height);
            width > 0 && height > 0
        }
        Err(_) => false,
    }
}

/// Turn a captured data URL into an engine input file. Undecodable input is
/// passed along as plain text.
pub fn data_url_to_file(data_url: &str, name: &str) -> InputFile {
    match decode_data_url(data_url) {
        Ok((mime, bytes)) => InputFile::new(name, mime, bytes),
        Err(_) => InputFile::new(name, "text/plain", data_url.as_bytes().to_vec()),
    }
}
