use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use facefilter_common::catalog::FilterRecord;
use facefilter_common::config::{PlacementConfig, StreamConfig};
use facefilter_common::mjpeg::{encode_part, JPEG_MIME};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureError, FrameSource};
use crate::catalog::{AssetCache, CatalogService};
use crate::compositor::{composite, CompositeMode, CompositeOptions, OverlayAsset, Resample};
use crate::landmarks::{ChannelOrder, LandmarkSource};
use crate::placement::PlacementCalculator;

/// Per-connection pipeline states. A stream cycles through
/// `Capturing → Detecting → [Placing → Compositing] → Encoding → Emitting`
/// until it reaches `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Capturing,
    Detecting,
    Placing,
    Compositing,
    Encoding,
    Emitting,
    Terminated,
}

/// Why a stream stopped.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The capture source ran out of frames.
    SourceExhausted,
    CaptureFailed(CaptureError),
    ConsumerDisconnected,
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_captured: u64,
    pub frames_emitted: u64,
    pub frames_composited: u64,
    pub detection_misses: u64,
    pub frames_dropped: u64,
}

/// Result of the CPU stage for one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub faces: usize,
    pub composited: usize,
    /// The detector ran and returned a result, possibly empty.
    pub detected: bool,
    pub detect_failed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unknown composite_mode '{0}', expected 'binary' or 'alpha_blend'")]
    CompositeMode(String),
    #[error("unknown resample '{0}', expected 'nearest' or 'bilinear'")]
    Resample(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode frame: {0}")]
pub struct EncodeError(String);

/// Mirror, detect, place, composite and encode a single frame.
///
/// Shared by every stream; holds no per-stream state.
pub struct FrameProcessor {
    detector: Arc<dyn LandmarkSource>,
    placement: PlacementCalculator,
    options: CompositeOptions,
    mirror: bool,
    max_faces: usize,
    jpeg_quality: u8,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn LandmarkSource>,
        stream: &StreamConfig,
        placement: &PlacementConfig,
    ) -> Result<Self, SettingsError> {
        let mode = CompositeMode::parse(&stream.composite_mode)
            .ok_or_else(|| SettingsError::CompositeMode(stream.composite_mode.clone()))?;
        let resample = Resample::parse(&stream.resample)
            .ok_or_else(|| SettingsError::Resample(stream.resample.clone()))?;
        Ok(Self {
            detector,
            placement: PlacementCalculator::new(placement),
            options: CompositeOptions { mode, resample },
            mirror: stream.mirror,
            max_faces: stream.max_faces.max(1),
            jpeg_quality: stream.jpeg_quality.clamp(1, 100),
        })
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Mirror `frame` and draw `overlay` over each detected face.
    ///
    /// Detection is skipped when there is no overlay to draw. Any detector
    /// failure leaves the (mirrored) frame untouched.
    pub fn process(&self, frame: &mut RgbImage, overlay: Option<&OverlayAsset>) -> CycleReport {
        let mut report = CycleReport::default();
        if self.mirror {
            image::imageops::flip_horizontal_in_place(frame);
        }
        let Some(asset) = overlay else {
            return report;
        };

        trace!(state = ?StreamState::Detecting, detector = self.detector.name());
        let faces = {
            let view = detection_view(frame, self.detector.channel_order());
            match self.detector.detect(&view) {
                Ok(faces) => faces,
                Err(e) => {
                    warn!(error = %e, detector = self.detector.name(), "landmark detection failed, passing frame through");
                    report.detect_failed = true;
                    return report;
                }
            }
        };
        report.detected = true;
        report.faces = faces.len();

        let (width, height) = frame.dimensions();
        for face in faces.iter().take(self.max_faces) {
            trace!(state = ?StreamState::Placing);
            let Some(rect) = self
                .placement
                .compute(face, width, height, asset.aspect_ratio())
            else {
                debug!(points = face.len(), "landmark set lacks anchor points, skipping face");
                continue;
            };
            trace!(state = ?StreamState::Compositing, ?rect);
            if composite(frame, asset, rect, self.options) {
                report.composited += 1;
            }
        }
        report
    }

    pub fn encode(&self, frame: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        frame
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality))
            .map_err(|e| EncodeError(e.to_string()))?;
        Ok(buf)
    }
}

/// The frame as the detector wants to see it. Display order is RGB; BGR
/// detectors get a channel-swapped copy.
fn detection_view(frame: &RgbImage, order: ChannelOrder) -> Cow<'_, RgbImage> {
    match order {
        ChannelOrder::Rgb => Cow::Borrowed(frame),
        ChannelOrder::Bgr => {
            let mut swapped = frame.clone();
            for px in swapped.pixels_mut() {
                px.0.swap(0, 2);
            }
            Cow::Owned(swapped)
        }
    }
}

/// Which catalog entry a stream draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSelection {
    /// The first filter in the catalog.
    First,
    /// A specific filter id, falling back to the first if it is gone.
    ById(i64),
}

impl FilterSelection {
    pub fn pick<'a>(&self, filters: &'a [FilterRecord]) -> Option<&'a FilterRecord> {
        match self {
            Self::First => filters.first(),
            Self::ById(id) => filters
                .iter()
                .find(|f| f.id == *id)
                .or_else(|| filters.first()),
        }
    }
}

/// Everything a stream needs besides its own capture session.
#[derive(Clone)]
pub struct StreamContext {
    pub processor: Arc<FrameProcessor>,
    pub catalog: Arc<CatalogService>,
    pub assets: Arc<AssetCache>,
}

fn transition(state: &mut StreamState, next: StreamState) {
    trace!(from = ?*state, to = ?next, "stream state");
    *state = next;
}

/// Drive one viewer's stream until the source ends, capture fails, the
/// viewer disconnects or shutdown is signalled.
///
/// Each part is handed to `tx`, whose capacity bounds how far capture can
/// run ahead of the viewer. `source` is dropped before returning, releasing
/// the capture session on every exit path.
pub async fn run_stream<S: FrameSource>(
    mut source: S,
    ctx: StreamContext,
    selection: FilterSelection,
    tx: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) -> (StreamOutcome, StreamStats) {
    let mut stats = StreamStats::default();
    let mut state = StreamState::Idle;
    let mut logged_filter: Option<i64> = None;
    info!(source = source.name(), detector = ctx.processor.detector_name(), ?selection, "stream started");

    let outcome = loop {
        transition(&mut state, StreamState::Capturing);
        let captured = tokio::select! {
            result = source.next_frame() => result,
            _ = tx.closed() => break StreamOutcome::ConsumerDisconnected,
            _ = shutdown.changed() => break StreamOutcome::Shutdown,
        };
        let mut frame = match captured {
            Ok(Some(frame)) => frame,
            Ok(None) => break StreamOutcome::SourceExhausted,
            Err(e) => break StreamOutcome::CaptureFailed(e),
        };
        stats.frames_captured += 1;

        let filters = ctx.catalog.snapshot();
        let record = selection.pick(&filters);
        if record.map(|r| r.id) != logged_filter {
            logged_filter = record.map(|r| r.id);
            match record {
                Some(r) => info!(id = r.id, name = r.name, "active filter"),
                None => info!("no filter available, streaming unmodified frames"),
            }
        }
        let overlay = match record {
            Some(r) => ctx.assets.get(r).await,
            None => None,
        };

        transition(&mut state, StreamState::Detecting);
        let processor = Arc::clone(&ctx.processor);
        let work = tokio::task::spawn_blocking(move || {
            let report = processor.process(&mut frame, overlay.as_deref());
            let encoded = processor.encode(&frame);
            (report, encoded)
        })
        .await;
        transition(&mut state, StreamState::Encoding);

        let jpeg = match work {
            Ok((report, Ok(jpeg))) => {
                if report.detected && report.faces == 0 {
                    stats.detection_misses += 1;
                }
                stats.frames_composited += u64::from(report.composited > 0);
                jpeg
            }
            // Outside backpressure this is the only place a captured frame is
            // not emitted: there is no encoded image to send.
            Ok((_, Err(e))) => {
                warn!(error = %e, "dropping frame");
                stats.frames_dropped += 1;
                continue;
            }
            Err(e) => {
                error!(error = %e, "frame worker panicked, dropping frame");
                stats.frames_dropped += 1;
                continue;
            }
        };

        transition(&mut state, StreamState::Emitting);
        let part = encode_part(JPEG_MIME, &jpeg);
        tokio::select! {
            sent = tx.send(part) => {
                if sent.is_err() {
                    break StreamOutcome::ConsumerDisconnected;
                }
            }
            _ = shutdown.changed() => break StreamOutcome::Shutdown,
        }
        stats.frames_emitted += 1;
    };

    drop(source);
    transition(&mut state, StreamState::Terminated);

    match &outcome {
        StreamOutcome::CaptureFailed(e) => {
            warn!(error = %e, ?stats, "stream ended: capture failed")
        }
        other => info!(outcome = ?other, ?stats, "stream ended"),
    }
    (outcome, stats)
}
