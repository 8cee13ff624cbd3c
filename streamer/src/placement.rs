use facefilter_common::config::PlacementConfig;

use crate::landmarks::{LandmarkSet, Point, LEFT_EYE_OUTER, NOSE_TIP, RIGHT_EYE_OUTER};

/// Target rectangle for an overlay, in frame pixel coordinates.
///
/// The rectangle may extend past any frame edge or lie entirely outside the
/// frame; the compositor clips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PlacementRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Converts a face's landmarks into an overlay rectangle.
///
/// Width scales with the distance between the outer eye corners; height
/// follows from the overlay's own aspect ratio. The rectangle is centered
/// horizontally on the nose tip and raised by `vertical_offset` of its
/// height so the overlay sits at eye level.
#[derive(Debug, Clone, Copy)]
pub struct PlacementCalculator {
    width_multiplier: f32,
    vertical_offset: f32,
}

impl Default for PlacementCalculator {
    fn default() -> Self {
        Self::new(&PlacementConfig::default())
    }
}

impl PlacementCalculator {
    pub fn new(config: &PlacementConfig) -> Self {
        let width_multiplier = if config.width_multiplier.is_finite() && config.width_multiplier > 0.0 {
            config.width_multiplier
        } else {
            2.0
        };
        let vertical_offset = if config.vertical_offset.is_finite() {
            config.vertical_offset
        } else {
            2.0 / 3.0
        };
        Self {
            width_multiplier,
            vertical_offset,
        }
    }

    /// `asset_aspect_ratio` is the overlay's width divided by its height.
    ///
    /// Returns `None` only when the set lacks one of the anchor landmarks.
    /// Degenerate geometry never fails: the rectangle shrinks to 1×1.
    pub fn compute(
        &self,
        landmarks: &LandmarkSet,
        frame_width: u32,
        frame_height: u32,
        asset_aspect_ratio: f32,
    ) -> Option<PlacementRect> {
        let to_pixels = |p: Point| (p.x * frame_width as f32, p.y * frame_height as f32);
        let (lx, ly) = to_pixels(landmarks.get(LEFT_EYE_OUTER)?);
        let (rx, ry) = to_pixels(landmarks.get(RIGHT_EYE_OUTER)?);
        let (nx, ny) = to_pixels(landmarks.get(NOSE_TIP)?);

        let eye_distance = (rx - lx).hypot(ry - ly);
        let aspect = if asset_aspect_ratio.is_finite() && asset_aspect_ratio > 0.0 {
            asset_aspect_ratio
        } else {
            1.0
        };

        let width = clamp_extent(eye_distance * self.width_multiplier);
        let height = clamp_extent(width as f32 / aspect);

        let x = clamp_coord(nx - width as f32 / 2.0);
        let y = clamp_coord(ny - height as f32 * self.vertical_offset);

        Some(PlacementRect {
            x,
            y,
            width,
            height,
        })
    }
}

/// Round to whole pixels, never below 1. NaN collapses to 1.
fn clamp_extent(value: f32) -> u32 {
    if value.is_nan() {
        return 1;
    }
    // `as` saturates on overflow
    (value.round() as u32).max(1)
}

fn clamp_coord(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.round() as i32
}
