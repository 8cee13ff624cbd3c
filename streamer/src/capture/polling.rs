use std::time::Duration;

use image::RgbImage;
use tracing::warn;

use super::{decode_frame, frame_interval, CaptureError, FrameSource};

/// Consecutive failed fetches tolerated before the session is declared dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Fetches single JPEG snapshots from a URL at a fixed rate. Fallback for
/// cameras that only expose a still-image endpoint.
pub struct PollingCapture {
    client: reqwest::Client,
    url: String,
    ticker: tokio::time::Interval,
    failures: u32,
}

impl PollingCapture {
    pub fn open(url: &str, fps: f64, connect_timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| CaptureError::Open(url.to_string(), e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            ticker: frame_interval(fps),
            failures: 0,
        })
    }

    async fn fetch(&self) -> Result<RgbImage, CaptureError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg = resp
            .bytes()
            .await
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        decode_frame(jpeg.to_vec()).await
    }
}

impl FrameSource for PollingCapture {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        loop {
            self.ticker.tick().await;
            match self.fetch().await {
                Ok(frame) => {
                    self.failures = 0;
                    return Ok(Some(frame));
                }
                Err(e) => {
                    self.failures += 1;
                    if self.failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                    warn!(error = %e, url = self.url, failures = self.failures, "failed to fetch camera frame");
                }
            }
        }
    }

    fn name(&self) -> &str {
        "polling"
    }
}
