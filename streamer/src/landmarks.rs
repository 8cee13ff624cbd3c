use std::time::Duration;

use facefilter_common::config::DetectorConfig;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use tracing::debug;

/// Face-mesh index of the left eye's outer corner.
pub const LEFT_EYE_OUTER: usize = 133;
/// Face-mesh index of the right eye's outer corner.
pub const RIGHT_EYE_OUTER: usize = 362;
/// Face-mesh index of the nose tip.
pub const NOSE_TIP: usize = 1;

/// Number of points in a full face-mesh landmark set.
pub const FACE_MESH_POINTS: usize = 468;

/// A normalized image coordinate, nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f32; 2]")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

/// Ordered landmarks for one detected face. Index meaning is fixed by the
/// face-mesh topology and must not be renumbered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// A full-size mesh with every point at the origin except the three the
    /// overlay placement reads.
    pub fn from_anchors(left_eye_outer: Point, right_eye_outer: Point, nose_tip: Point) -> Self {
        let mut points = vec![Point::new(0.0, 0.0); FACE_MESH_POINTS];
        points[LEFT_EYE_OUTER] = left_eye_outer;
        points[RIGHT_EYE_OUTER] = right_eye_outer;
        points[NOSE_TIP] = nose_tip;
        Self { points }
    }

    pub fn get(&self, index: usize) -> Option<Point> {
        self.points.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// Channel order a detector expects its input frame in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Some(Self::Rgb),
            "bgr" => Some(Self::Bgr),
            _ => None,
        }
    }
}

/// Opaque face landmark detector.
///
/// Implementations receive the mirrored frame in the channel order they
/// declare and return one landmark set per detected face (possibly none).
/// Detection is CPU-bound or blocking and is always called off the async
/// runtime.
pub trait LandmarkSource: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<LandmarkSet>, DetectError>;

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("failed to encode detection frame: {0}")]
    Encode(String),
    #[error("detector request failed: {0}")]
    Request(String),
    #[error("detector returned status {0}")]
    Status(u16),
    #[error("malformed detector response: {0}")]
    Response(String),
}

/// Detector that never finds a face; every frame passes through unmodified.
pub struct NoFaces;

impl LandmarkSource for NoFaces {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<LandmarkSet>, DetectError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Reports the same configured face on every frame. Useful for calibrating
/// placement without a detector service.
pub struct FixedFace {
    face: LandmarkSet,
}

impl FixedFace {
    pub fn new(face: LandmarkSet) -> Self {
        Self { face }
    }
}

impl LandmarkSource for FixedFace {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<LandmarkSet>, DetectError> {
        Ok(vec![self.face.clone()])
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<LandmarkSet>,
}

/// Delegates detection to an external face-mesh service.
///
/// Each frame is JPEG-encoded and POSTed to `url`; the service answers
/// `{"faces": [[[x, y], ...], ...]}` with normalized coordinates. `detect`
/// runs on a blocking worker and drives the async request on the runtime
/// captured at construction.
pub struct HttpLandmarkSource {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    url: String,
    channel_order: ChannelOrder,
}

impl HttpLandmarkSource {
    /// Must be called from within a tokio runtime.
    pub fn new(
        url: &str,
        timeout: Duration,
        channel_order: ChannelOrder,
    ) -> Result<Self, DetectError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DetectError::Request(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Request(e.to_string()))?;
        Ok(Self {
            client,
            runtime,
            url: url.to_string(),
            channel_order,
        })
    }

    async fn request(&self, body: Vec<u8>) -> Result<Vec<LandmarkSet>, DetectError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await
            .map_err(|e| DetectError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DetectError::Status(response.status().as_u16()));
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| DetectError::Response(e.to_string()))?;
        debug!(faces = parsed.faces.len(), url = self.url, "detector response");
        Ok(parsed.faces)
    }
}

impl LandmarkSource for HttpLandmarkSource {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<LandmarkSet>, DetectError> {
        let mut body = Vec::new();
        frame
            .write_with_encoder(JpegEncoder::new_with_quality(&mut body, 90))
            .map_err(|e| DetectError::Encode(e.to_string()))?;
        self.runtime.block_on(self.request(body))
    }

    fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Build the detector named by `config.kind`.
pub fn from_config(config: &DetectorConfig) -> Result<Box<dyn LandmarkSource>, DetectorConfigError> {
    let channel_order = ChannelOrder::parse(&config.channel_order)
        .ok_or_else(|| DetectorConfigError::ChannelOrder(config.channel_order.clone()))?;
    match config.kind.as_str() {
        "none" => Ok(Box::new(NoFaces)),
        "fixed" => {
            let fixed = &config.fixed;
            Ok(Box::new(FixedFace::new(LandmarkSet::from_anchors(
                fixed.left_eye_outer.into(),
                fixed.right_eye_outer.into(),
                fixed.nose_tip.into(),
            ))))
        }
        "http" => {
            if config.url.is_empty() {
                return Err(DetectorConfigError::MissingUrl);
            }
            let source = HttpLandmarkSource::new(
                &config.url,
                Duration::from_millis(config.timeout_ms),
                channel_order,
            )
            .map_err(|e| DetectorConfigError::Client(e.to_string()))?;
            Ok(Box::new(source))
        }
        other => Err(DetectorConfigError::UnknownKind(other.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorConfigError {
    #[error("unknown detector kind '{0}', expected 'none', 'fixed' or 'http'")]
    UnknownKind(String),
    #[error("unknown channel order '{0}', expected 'rgb' or 'bgr'")]
    ChannelOrder(String),
    #[error("detector kind 'http' requires detector.url")]
    MissingUrl,
    #[error("failed to build detector client: {0}")]
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchors_land_on_contract_indices() {
        let set = LandmarkSet::from_anchors(
            Point::new(0.3, 0.4),
            Point::new(0.5, 0.4),
            Point::new(0.4, 0.5),
        );
        assert_eq!(set.len(), FACE_MESH_POINTS);
        assert_eq!(set.get(LEFT_EYE_OUTER), Some(Point::new(0.3, 0.4)));
        assert_eq!(set.get(RIGHT_EYE_OUTER), Some(Point::new(0.5, 0.4)));
        assert_eq!(set.get(NOSE_TIP), Some(Point::new(0.4, 0.5)));
        assert_eq!(set.get(FACE_MESH_POINTS), None);
    }

    #[test]
    fn detector_response_parses_point_pairs() {
        let body = r#"{"faces": [[[0.1, 0.2], [0.3, 0.4]], []]}"#;
        let parsed: DetectResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.faces.len(), 2);
        assert_eq!(parsed.faces[0].get(1), Some(Point::new(0.3, 0.4)));
        assert_eq!(parsed.faces[1].len(), 0);

        let empty: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.faces.is_empty());
    }

    #[test]
    fn config_builds_named_detectors() {
        let mut config = DetectorConfig::default();
        assert_eq!(from_config(&config).unwrap().name(), "none");

        config.kind = "fixed".into();
        let fixed = from_config(&config).unwrap();
        let faces = fixed.detect(&RgbImage::new(4, 4)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].get(NOSE_TIP), Some(Point::new(0.5, 0.55)));

        config.kind = "http".into();
        assert!(matches!(
            from_config(&config),
            Err(DetectorConfigError::MissingUrl)
        ));

        config.kind = "magic".into();
        assert!(matches!(
            from_config(&config),
            Err(DetectorConfigError::UnknownKind(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_detector_posts_jpeg_and_parses_faces() {
        use crate::capture::test_support::serve;
        use axum::body::Bytes;
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::{Json, Router};

        let router = Router::new()
            .route(
                "/detect",
                post(|body: Bytes| async move {
                    assert_eq!(&body[..2], &[0xFF, 0xD8]);
                    Json(serde_json::json!({"faces": [[[0.5, 0.5], [0.25, 0.75]]]}))
                }),
            )
            .route("/broken", post(|| async { StatusCode::BAD_GATEWAY }));
        let base = serve(router).await;

        let source = HttpLandmarkSource::new(
            &format!("{base}/detect"),
            Duration::from_secs(2),
            ChannelOrder::Bgr,
        )
        .unwrap();
        assert_eq!(source.channel_order(), ChannelOrder::Bgr);
        let faces = tokio::task::spawn_blocking(move || source.detect(&RgbImage::new(8, 8)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].get(NOSE_TIP), Some(Point::new(0.25, 0.75)));

        let broken =
            HttpLandmarkSource::new(&format!("{base}/broken"), Duration::from_secs(2), ChannelOrder::Rgb)
                .unwrap();
        let result = tokio::task::spawn_blocking(move || broken.detect(&RgbImage::new(8, 8)))
            .await
            .unwrap();
        assert!(matches!(result, Err(DetectError::Status(502))));
    }

    #[test]
    fn channel_order_parsing() {
        assert_eq!(ChannelOrder::parse("BGR"), Some(ChannelOrder::Bgr));
        assert_eq!(ChannelOrder::parse("rgb"), Some(ChannelOrder::Rgb));
        assert_eq!(ChannelOrder::parse("yuv"), None);
    }
}
