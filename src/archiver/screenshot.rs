//! Full-page screenshot capture, re-encoded as WebP or JPEG.

use std::io::Cursor;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use image::ImageEncoder;

use crate::browser::{BrowserManager, page_load};
use crate::catalog::LogSink;

use super::{ArchiveError, ArchiveOutput, Cleanup, PageGuard};

/// WebP refuses images taller than this; anything larger is re-encoded as
/// JPEG instead. The decision is deterministic on pixel height.
const WEBP_MAX_HEIGHT: u32 = 16_383;

const JPEG_QUALITY: u8 = 85;

const VIEWPORT_WIDTH: i64 = 1500;
const VIEWPORT_HEIGHT: i64 = 1080;
const DEVICE_SCALE_FACTOR: f64 = 2.0;

pub struct ScreenshotArchiver {
    browser: Arc<BrowserManager>,
}

impl ScreenshotArchiver {
    pub fn new(browser: Arc<BrowserManager>) -> Self {
        Self { browser }
    }

    pub async fn archive(&self, url: &str, log: &LogSink) -> Result<ArchiveOutput, ArchiveError> {
        let page = self
            .browser
            .page()
            .await
            .map_err(|e| ArchiveError::Browser(format!("{e:#}")))?;
        let guard = PageGuard::new(page.clone());

        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(VIEWPORT_WIDTH)
                .height(VIEWPORT_HEIGHT)
                .device_scale_factor(DEVICE_SCALE_FACTOR)
                .mobile(false)
                .build()
                .map_err(ArchiveError::Other)?,
        )
        .await
        .map_err(|e| ArchiveError::Browser(format!("viewport override failed: {e}")))?;

        page_load::load_settled(&page, url, log)
            .await
            .map_err(|e| ArchiveError::PageLoad(format!("{e:#}")))?;

        // The settle sequence ends at the top, but capture must never start
        // mid-scroll.
        page.evaluate("window.scrollTo(0, 0)")
            .await
            .map_err(|e| ArchiveError::Browser(format!("scroll reset failed: {e}")))?;

        let png = page
            .screenshot(CaptureScreenshotParams {
                format: Some(CaptureScreenshotFormat::Png),
                capture_beyond_viewport: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|e| ArchiveError::Browser(format!("screenshot failed: {e}")))?;

        log.line(&format!("captured full-page PNG ({} bytes)", png.len()))
            .await;

        let (bytes, extension, content_type, height) =
            tokio::task::spawn_blocking(move || encode(png))
                .await
                .map_err(|e| ArchiveError::Other(format!("encode task panicked: {e}")))??;

        log.line(&format!(
            "encoded {height}px-tall screenshot as {content_type}"
        ))
        .await;

        Ok(ArchiveOutput {
            data: Box::pin(Cursor::new(bytes)),
            extension,
            content_type,
            cleanup: Cleanup::page(guard),
        })
    }
}

type Encoded = (Vec<u8>, &'static str, &'static str, u32);

fn encode(png: Vec<u8>) -> Result<Encoded, ArchiveError> {
    let img = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
        .map_err(|e| ArchiveError::Other(format!("failed to decode PNG screenshot: {e}")))?;
    let height = img.height();

    if height > WEBP_MAX_HEIGHT {
        let rgb = img.to_rgb8();
        let mut out = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut out), JPEG_QUALITY);
        encoder
            .write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| ArchiveError::Other(format!("JPEG encode failed: {e}")))?;
        Ok((out, ".jpg", "image/jpeg", height))
    } else {
        let rgba = img.to_rgba8();
        let mut out = Vec::new();
        let encoder = image::codecs::webp::WebPEncoder::new_lossless(Cursor::new(&mut out));
        encoder
            .write_image(
                rgba.as_raw(),
                rgba.width(),
                rgba.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|e| ArchiveError::Other(format!("WebP encode failed: {e}")))?;
        Ok((out, ".webp", "image/webp", height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_of_height(height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, height, image::Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn short_pages_encode_as_webp() {
        let (bytes, ext, content_type, _) = encode(png_of_height(64)).unwrap();
        assert_eq!(ext, ".webp");
        assert_eq!(content_type, "image/webp");
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
    }

    #[test]
    fn tall_pages_fall_back_to_jpeg() {
        let (bytes, ext, content_type, height) = encode(png_of_height(WEBP_MAX_HEIGHT + 1)).unwrap();
        assert_eq!(ext, ".jpg");
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(height, WEBP_MAX_HEIGHT + 1);
        assert_eq!(&bytes[0..2], [0xff, 0xd8]);
    }

    #[test]
    fn boundary_height_still_uses_webp() {
        let (_, ext, _, _) = encode(png_of_height(WEBP_MAX_HEIGHT)).unwrap();
        assert_eq!(ext, ".webp");
    }
}
