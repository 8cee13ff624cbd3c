use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use facefilter_common::mjpeg::{boundary_from_content_type, MultipartParser, BOUNDARY_TOKEN};
use futures_util::{Stream, StreamExt};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{decode_frame, CaptureError, FrameSource};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Largest part body held while waiting for its closing boundary.
const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

/// Reads frames from an upstream `multipart/x-mixed-replace` JPEG stream,
/// such as an IP camera or another instance of this streamer.
///
/// The HTTP connection is held for the life of the value and closed on drop.
pub struct MjpegCapture {
    url: String,
    body: ByteStream,
    parser: MultipartParser,
    max_part_bytes: usize,
    frames: u64,
}

impl MjpegCapture {
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| CaptureError::Open(url.to_string(), e.to_string()))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| CaptureError::Open(url.to_string(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| BOUNDARY_TOKEN.to_string());

        info!(url, status = %response.status(), boundary, "connected to MJPEG stream");

        Ok(Self {
            url: url.to_string(),
            body: Box::pin(response.bytes_stream()),
            parser: MultipartParser::new(&boundary),
            max_part_bytes: MAX_PART_BYTES,
            frames: 0,
        })
    }
}

impl FrameSource for MjpegCapture {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        loop {
            while let Some(jpeg) = self.parser.next_part() {
                match decode_frame(jpeg).await {
                    Ok(frame) => {
                        self.frames += 1;
                        return Ok(Some(frame));
                    }
                    Err(e) => {
                        warn!(error = %e, url = self.url, "undecodable part in MJPEG stream, skipping");
                    }
                }
            }

            if self.parser.buffered() > self.max_part_bytes {
                return Err(CaptureError::Stream(format!(
                    "part exceeds {} bytes without a closing boundary",
                    self.max_part_bytes
                )));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(CaptureError::Stream(e.to_string())),
                None => {
                    debug!(url = self.url, frames = self.frames, "MJPEG stream ended");
                    return Ok(None);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}
