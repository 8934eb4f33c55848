use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::error::TranscodeError;

pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_MAX_HEIGHT: u32 = 1080;
pub const DEFAULT_DECODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Media type of every transcoded output.
pub const MEDIA_TYPE: &str = "image/webp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodePolicy {
    pub max_width: u32,
    pub max_height: u32,
    pub compress: bool,
}

impl Default for TranscodePolicy {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            compress: true,
        }
    }
}

impl TranscodePolicy {
    /// Output dimensions for an image of `width` x `height`.
    ///
    /// Orientation picks the constrained side: landscape (`width > height`) is
    /// limited by `max_width` only, everything else by `max_height` only.
    /// Never upscales.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if !self.compress {
            return (width, height);
        }
        if width > height {
            if width > self.max_width {
                let h = scale(height, self.max_width, width);
                return (self.max_width.max(1), h);
            }
        } else if height > self.max_height {
            let w = scale(width, self.max_height, height);
            return (w, self.max_height.max(1));
        }
        (width, height)
    }
}

fn scale(side: u32, numerator: u32, denominator: u32) -> u32 {
    let scaled = (side as f64 * numerator as f64 / denominator as f64).round();
    (scaled as u32).max(1)
}

/// Decode + optional resize + WebP encode.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, raw: Arc<[u8]>, policy: &TranscodePolicy) -> Result<Vec<u8>, TranscodeError>;
}

/// Production transcoder backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    pub decode_timeout: Duration,
}

impl Default for ImageTranscoder {
    fn default() -> Self {
        Self {
            decode_timeout: DEFAULT_DECODE_TIMEOUT,
        }
    }
}

impl ImageTranscoder {
    pub fn new(decode_timeout: Duration) -> Self {
        Self { decode_timeout }
    }
}

impl Transcoder for ImageTranscoder {
    fn transcode(&self, raw: Arc<[u8]>, policy: &TranscodePolicy) -> Result<Vec<u8>, TranscodeError> {
        let img = with_timeout(self.decode_timeout, move || {
            image::load_from_memory(&raw).map_err(TranscodeError::Decode)
        })?;
        encode(img, policy)
    }
}

/// Resize per `policy`, then encode as lossless WebP (the only WebP mode the
/// `image` crate writes). For photographs the result can be larger than the
/// source JPEG.
fn encode(img: DynamicImage, policy: &TranscodePolicy) -> Result<Vec<u8>, TranscodeError> {
    let (w, h) = (img.width(), img.height());
    let (tw, th) = policy.target_dimensions(w, h);
    let img = if (tw, th) != (w, h) {
        img.resize_exact(tw, th, FilterType::Lanczos3)
    } else {
        img
    };

    // The WebP encoder only accepts 8-bit RGB(A)
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut buf = Cursor::new(Vec::new());
    rgba.write_to(&mut buf, ImageFormat::WebP)
        .map_err(TranscodeError::Encode)?;
    Ok(buf.into_inner())
}

/// Run `f` on a helper thread and give up after `timeout`.
///
/// A timed-out helper keeps running detached; its result is dropped.
pub fn with_timeout<T, F>(timeout: Duration, f: F) -> Result<T, TranscodeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TranscodeError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::Builder::new()
        .name("datezip-decode".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|_| TranscodeError::Aborted)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(TranscodeError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(TranscodeError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png(width: u32, height: u32) -> Arc<[u8]> {
        let img = ImageBuffer::from_pixel(width, height, Rgb([200u8, 40, 90]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner().into()
    }

    #[test]
    fn test_landscape_constrained_by_width() {
        let p = TranscodePolicy::default();
        assert_eq!(p.target_dimensions(4000, 3000), (1920, 1440));
        assert_eq!(p.target_dimensions(3000, 1000), (1920, 640));
    }

    #[test]
    fn test_portrait_and_square_constrained_by_height() {
        let p = TranscodePolicy::default();
        assert_eq!(p.target_dimensions(3000, 4000), (810, 1080));
        assert_eq!(p.target_dimensions(2000, 2000), (1080, 1080));
    }

    #[test]
    fn test_never_upscales() {
        let p = TranscodePolicy::default();
        assert_eq!(p.target_dimensions(800, 600), (800, 600));
        assert_eq!(p.target_dimensions(1920, 1080), (1920, 1080));
        // Landscape only looks at width, even when height exceeds max_height
        assert_eq!(p.target_dimensions(1500, 1400), (1500, 1400));
    }

    #[test]
    fn test_no_compress_keeps_dimensions() {
        let p = TranscodePolicy {
            compress: false,
            ..Default::default()
        };
        assert_eq!(p.target_dimensions(8000, 6000), (8000, 6000));
    }

    #[test]
    fn test_rounds_to_nearest() {
        let p = TranscodePolicy {
            max_width: 100,
            max_height: 100,
            compress: true,
        };
        // 333 * 100 / 1000 = 33.3
        assert_eq!(p.target_dimensions(1000, 333), (100, 33));
        // 335 * 100 / 1000 = 33.5
        assert_eq!(p.target_dimensions(1000, 335), (100, 34));
        assert_eq!(p.target_dimensions(10000, 1), (100, 1));
    }

    #[test]
    fn test_transcode_resizes_and_encodes_webp() {
        let policy = TranscodePolicy {
            max_width: 20,
            max_height: 20,
            compress: true,
        };
        let out = ImageTranscoder::default().transcode(png(40, 10), &policy).unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 5));
    }

    #[test]
    fn test_transcode_without_compress_keeps_size() {
        let policy = TranscodePolicy {
            max_width: 20,
            max_height: 20,
            compress: false,
        };
        let out = ImageTranscoder::default().transcode(png(40, 10), &policy).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 10));
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() {
        let raw: Arc<[u8]> = b"\xff\xd8\xff definitely not a jpeg".to_vec().into();
        let err = ImageTranscoder::default()
            .transcode(raw, &TranscodePolicy::default())
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Decode(_)));
    }

    #[test]
    fn test_with_timeout_reports_slow_work() {
        let err = with_timeout(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout(_)));

        assert_eq!(with_timeout(Duration::from_secs(5), || Ok(7)).unwrap(), 7);
    }
}
