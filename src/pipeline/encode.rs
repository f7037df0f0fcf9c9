//! Page image loading: file on disk → bytes ready for the vision request.
//!
//! Rasterised pages at 200 DPI are typically 1700 × 2200 px, but images found
//! in shared directories can be anything. Oversized images are downscaled so
//! the request stays under provider upload limits; small ones are passed
//! through byte-for-byte.

use crate::error::DegradedReason;
use image::{GenericImageView, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// An encoded page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl PageImage {
    /// MIME type for the vision request.
    pub fn mime_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "image/jpeg",
            _ => "image/png",
        }
    }
}

/// Read `path`, verify it decodes as PNG or JPEG, and downscale to
/// `max_pixels` on the longest edge when larger (re-encoded as PNG).
pub fn load_page_image(path: &Path, max_pixels: u32) -> Result<PageImage, DegradedReason> {
    let unreadable = |detail: String| DegradedReason::ImageUnreadable {
        detail: format!("{}: {detail}", path.display()),
    };

    let bytes = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    let format = image::guess_format(&bytes).map_err(|e| unreadable(e.to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(unreadable(format!("unsupported image format {format:?}")));
    }

    let img = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| unreadable(e.to_string()))?;
    let (w, h) = img.dimensions();
    if w.max(h) <= max_pixels {
        debug!("Loaded {} ({}×{}, {} bytes)", path.display(), w, h, bytes.len());
        return Ok(PageImage { bytes, format });
    }

    let resized = img.resize(max_pixels, max_pixels, image::imageops::FilterType::Lanczos3);
    let mut buf = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| unreadable(e.to_string()))?;
    debug!(
        "Downscaled {} from {}×{} to {}×{}",
        path.display(),
        w,
        h,
        resized.width(),
        resized.height()
    );
    Ok(PageImage {
        bytes: buf,
        format: ImageFormat::Png,
    })
}
