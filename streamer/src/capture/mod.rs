//! Frame acquisition. Each stream opens its own capture session and drops it
//! when the stream ends, which releases the underlying connection or files.

pub mod directory;
pub mod mjpeg;
pub mod polling;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use facefilter_common::config::CaptureConfig;
use image::RgbImage;

pub use directory::DirectoryCapture;
pub use mjpeg::MjpegCapture;
pub use polling::PollingCapture;

/// A source of decoded RGB frames.
pub trait FrameSource: Send {
    /// Next frame in capture order. `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self)
        -> impl Future<Output = Result<Option<RgbImage>, CaptureError>> + Send;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture source {0}: {1}")]
    Open(String, String),
    #[error("capture source returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("capture stream error: {0}")]
    Stream(String),
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("unknown capture mode '{0}', expected 'mjpeg', 'polling' or 'directory'")]
    UnknownMode(String),
}

/// Capture session selected by `[capture] mode`.
pub enum Capture {
    Mjpeg(MjpegCapture),
    Polling(PollingCapture),
    Directory(DirectoryCapture),
}

impl Capture {
    /// Open a fresh session. Each call owns its own connection or file list.
    pub async fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        match config.mode.as_str() {
            "mjpeg" => Ok(Self::Mjpeg(
                MjpegCapture::open(&config.url, connect_timeout).await?,
            )),
            "polling" => Ok(Self::Polling(PollingCapture::open(
                &config.url,
                config.fps,
                connect_timeout,
            )?)),
            "directory" => Ok(Self::Directory(
                DirectoryCapture::open(
                    PathBuf::from(&config.directory),
                    config.fps,
                    config.loop_directory,
                )
                .await?,
            )),
            other => Err(CaptureError::UnknownMode(other.to_string())),
        }
    }
}

impl FrameSource for Capture {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        match self {
            Self::Mjpeg(source) => source.next_frame().await,
            Self::Polling(source) => source.next_frame().await,
            Self::Directory(source) => source.next_frame().await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Mjpeg(source) => source.name(),
            Self::Polling(source) => source.name(),
            Self::Directory(source) => source.name(),
        }
    }
}

/// Decode an encoded image on the blocking pool.
pub(crate) async fn decode_frame(encoded: Vec<u8>) -> Result<RgbImage, CaptureError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&encoded)
            .map(|img| img.to_rgb8())
            .map_err(|e| CaptureError::Read(e.to_string()))
    })
    .await
    .map_err(|e| CaptureError::Read(e.to_string()))?
}

const DEFAULT_FPS: f64 = 15.0;

/// Time between frames at `fps`. Rates that do not give a usable non-zero
/// period fall back to `DEFAULT_FPS`.
fn frame_period(fps: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|period| fps.is_finite() && fps > 0.0 && !period.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(1.0 / DEFAULT_FPS))
}

/// Ticker for sources that pace themselves. After backpressure stalls the
/// next tick is rescheduled rather than bursting to catch up.
pub(crate) fn frame_interval(fps: f64) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(frame_period(fps));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};

    pub fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Vec::new();
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 95))
            .unwrap();
        buf
    }

    /// Serve `router` on an ephemeral local port and return its base URL.
    pub async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let config = CaptureConfig {
            mode: "webcam".into(),
            ..CaptureConfig::default()
        };
        assert!(matches!(
            Capture::open(&config).await,
            Err(CaptureError::UnknownMode(_))
        ));
    }

    #[tokio::test]
    async fn unusable_fps_falls_back_to_default_rate() {
        let default = Duration::from_secs_f64(1.0 / DEFAULT_FPS);
        for fps in [1e-30, 0.0, -5.0, f64::NAN, f64::INFINITY, f64::MAX] {
            assert_eq!(frame_interval(fps).period(), default, "fps {fps}");
        }
        assert_eq!(frame_interval(4.0).period(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn decode_rejects_non_images() {
        assert!(decode_frame(b"nope".to_vec()).await.is_err());
        let frame = decode_frame(test_support::jpeg(6, 4, [10, 20, 30])).await.unwrap();
        assert_eq!(frame.dimensions(), (6, 4));
    }
}
