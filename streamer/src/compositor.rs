use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::FilterType;
use image::{ImageReader, RgbImage, RgbaImage};
use tracing::{debug, warn};

use crate::placement::PlacementRect;

/// Alpha value treated as "fully transparent" in binary mode.
const TRANSPARENT: u8 = 0;

/// Resampled overlays larger than this many pixels are skipped.
const MAX_RESAMPLE_PIXELS: u64 = 32 * 1024 * 1024;

/// Last resampled copy of an overlay, keyed by target size and filter.
type ScaledEntry = (u32, u32, Resample, Arc<RgbaImage>);

/// An overlay image with an alpha channel. The pixels are immutable once
/// loaded; shared between streams behind an `Arc`.
#[derive(Debug)]
pub struct OverlayAsset {
    image: RgbaImage,
    scaled: Mutex<Option<ScaledEntry>>,
}

impl OverlayAsset {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            scaled: Mutex::new(None),
        }
    }

    /// Decode an image file, adding an opaque alpha channel if it has none.
    pub fn load(path: &Path) -> Result<Self, AssetError> {
        let image = ImageReader::open(path)
            .map_err(|e| AssetError::Read(path.display().to_string(), e.to_string()))?
            .with_guessed_format()
            .map_err(|e| AssetError::Read(path.display().to_string(), e.to_string()))?
            .decode()
            .map_err(|e| AssetError::Decode(path.display().to_string(), e.to_string()))?;
        let image = image.to_rgba8();
        if image.width() == 0 || image.height() == 0 {
            return Err(AssetError::Empty(path.display().to_string()));
        }
        Ok(Self::new(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Width divided by height.
    pub fn aspect_ratio(&self) -> f32 {
        self.image.width() as f32 / self.image.height().max(1) as f32
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// The overlay resampled to `width` x `height`.
    ///
    /// The most recent size is kept, so a face that holds still costs one
    /// resize rather than one per frame.
    pub(crate) fn scaled(&self, width: u32, height: u32, resample: Resample) -> Arc<RgbaImage> {
        let mut slot = self.scaled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((w, h, r, cached)) = slot.as_ref() {
            if (*w, *h, *r) == (width, height, resample) {
                return Arc::clone(cached);
            }
        }
        let resized = Arc::new(image::imageops::resize(
            &self.image,
            width,
            height,
            resample.filter(),
        ));
        *slot = Some((width, height, resample, Arc::clone(&resized)));
        resized
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("failed to read overlay {0}: {1}")]
    Read(String, String),
    #[error("failed to decode overlay {0}: {1}")]
    Decode(String, String),
    #[error("overlay {0} has no pixels")]
    Empty(String),
}

/// How overlay pixels are combined with frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Alpha 0 skips the pixel; anything else replaces it.
    Binary,
    /// Linear blend weighted by `alpha / 255`.
    AlphaBlend,
}

impl CompositeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(Self::Binary),
            "alpha_blend" | "alphaBlend" => Some(Self::AlphaBlend),
            _ => None,
        }
    }
}

/// Resampling filter used to scale the overlay to its placement rect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    Nearest,
    Bilinear,
}

impl Resample {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nearest" => Some(Self::Nearest),
            "bilinear" => Some(Self::Bilinear),
            _ => None,
        }
    }

    fn filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Bilinear => FilterType::Triangle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompositeOptions {
    pub mode: CompositeMode,
    pub resample: Resample,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            mode: CompositeMode::Binary,
            resample: Resample::Bilinear,
        }
    }
}

/// Visible part of a placement rect: frame origin plus the matching offset
/// into the resampled overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Visible {
    frame_x: u32,
    frame_y: u32,
    overlay_x: u32,
    overlay_y: u32,
    width: u32,
    height: u32,
}

fn visible_region(rect: PlacementRect, frame_width: u32, frame_height: u32) -> Option<Visible> {
    if rect.is_empty() {
        return None;
    }
    let left = i64::from(rect.x).max(0);
    let top = i64::from(rect.y).max(0);
    let right = (i64::from(rect.x) + i64::from(rect.width)).min(i64::from(frame_width));
    let bottom = (i64::from(rect.y) + i64::from(rect.height)).min(i64::from(frame_height));
    if left >= right || top >= bottom {
        return None;
    }
    Some(Visible {
        frame_x: left as u32,
        frame_y: top as u32,
        overlay_x: (left - i64::from(rect.x)) as u32,
        overlay_y: (top - i64::from(rect.y)) as u32,
        width: (right - left) as u32,
        height: (bottom - top) as u32,
    })
}

/// Draw `asset`, scaled to `rect`, onto `frame` in place.
///
/// Only pixels inside both the rect and the frame are touched. A rect that
/// is empty or misses the frame entirely leaves the frame byte-identical
/// and skips resampling. Returns whether any part of the overlay was drawn.
pub fn composite(
    frame: &mut RgbImage,
    asset: &OverlayAsset,
    rect: PlacementRect,
    options: CompositeOptions,
) -> bool {
    let Some(visible) = visible_region(rect, frame.width(), frame.height()) else {
        debug!(?rect, "overlay outside frame, nothing to draw");
        return false;
    };

    let resample_pixels = u64::from(rect.width) * u64::from(rect.height);
    if resample_pixels > MAX_RESAMPLE_PIXELS {
        warn!(?rect, resample_pixels, "overlay target too large, skipping");
        return false;
    }

    let overlay = asset.scaled(rect.width, rect.height, options.resample);

    for row in 0..visible.height {
        let oy = visible.overlay_y + row;
        let fy = visible.frame_y + row;
        for col in 0..visible.width {
            let src = overlay.get_pixel(visible.overlay_x + col, oy).0;
            let alpha = src[3];
            if alpha == TRANSPARENT {
                continue;
            }
            let dst = frame.get_pixel_mut(visible.frame_x + col, fy);
            match options.mode {
                CompositeMode::Binary => {
                    dst.0 = [src[0], src[1], src[2]];
                }
                CompositeMode::AlphaBlend => {
                    for c in 0..3 {
                        dst.0[c] = blend(src[c], dst.0[c], alpha);
                    }
                }
            }
        }
    }
    true
}

/// `(src * a + dst * (255 - a)) / 255`, rounded.
fn blend(src: u8, dst: u8, alpha: u8) -> u8 {
    let a = u32::from(alpha);
    let value = u32::from(src) * a + u32::from(dst) * (255 - a);
    ((value + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};

    const NEAREST_BINARY: CompositeOptions = CompositeOptions {
        mode: CompositeMode::Binary,
        resample: Resample::Nearest,
    };

    /// Gradient frame so every pixel is distinguishable.
    fn test_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]))
    }

    fn solid_asset(width: u32, height: u32, color: [u8; 4]) -> OverlayAsset {
        OverlayAsset::new(RgbaImage::from_pixel(width, height, Rgba(color)))
    }

    fn rect(x: i32, y: i32, width: u32, height: u32) -> PlacementRect {
        PlacementRect {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn opaque_overlay_fills_rect_exactly() {
        let mut frame = test_frame(20, 20);
        let original = frame.clone();
        let asset = solid_asset(4, 4, [255, 0, 0, 255]);

        assert!(composite(&mut frame, &asset, rect(5, 6, 8, 3), NEAREST_BINARY));
        for (x, y, px) in frame.enumerate_pixels() {
            let inside = (5..13).contains(&x) && (6..9).contains(&y);
            if inside {
                assert_eq!(px.0, [255, 0, 0], "({x},{y}) should be overlay");
            } else {
                assert_eq!(px, original.get_pixel(x, y), "({x},{y}) should be untouched");
            }
        }
    }

    #[test]
    fn rect_fully_outside_is_noop() {
        let asset = solid_asset(4, 4, [255, 255, 255, 255]);
        for r in [
            rect(-50, -50, 10, 10),
            rect(20, 0, 5, 5),
            rect(0, 20, 5, 5),
            rect(-5, 3, 5, 5),
            rect(i32::MAX, i32::MAX, u32::MAX, u32::MAX),
            rect(i32::MIN, i32::MIN, 10, 10),
        ] {
            let mut frame = test_frame(20, 20);
            let before = frame.as_raw().clone();
            assert!(!composite(&mut frame, &asset, r, NEAREST_BINARY), "{r:?}");
            assert_eq!(frame.as_raw(), &before, "{r:?} modified the frame");
        }
    }

    #[test]
    fn zero_dimension_rect_is_noop() {
        let asset = solid_asset(4, 4, [255, 255, 255, 255]);
        let mut frame = test_frame(10, 10);
        let before = frame.clone();
        assert!(!composite(&mut frame, &asset, rect(2, 2, 0, 5), NEAREST_BINARY));
        assert!(!composite(&mut frame, &asset, rect(2, 2, 5, 0), NEAREST_BINARY));
        assert_eq!(frame, before);
    }

    #[test]
    fn partial_overlap_writes_only_in_bounds() {
        let mut frame = test_frame(10, 10);
        let original = frame.clone();
        // Quadrants: top-left red, top-right green, bottom-left blue, bottom-right white
        let asset = OverlayAsset::new(RgbaImage::from_fn(4, 4, |x, y| match (x < 2, y < 2) {
            (true, true) => Rgba([255, 0, 0, 255]),
            (false, true) => Rgba([0, 255, 0, 255]),
            (true, false) => Rgba([0, 0, 255, 255]),
            (false, false) => Rgba([255, 255, 255, 255]),
        }));

        // Hangs off the top-left corner: only the bottom-right quadrant lands
        assert!(composite(&mut frame, &asset, rect(-2, -2, 4, 4), NEAREST_BINARY));
        for (x, y, px) in frame.enumerate_pixels() {
            if x < 2 && y < 2 {
                assert_eq!(px.0, [255, 255, 255]);
            } else {
                assert_eq!(px, original.get_pixel(x, y));
            }
        }

        // Hangs off the bottom-right corner: only the top-left quadrant lands
        let mut frame = test_frame(10, 10);
        assert!(composite(&mut frame, &asset, rect(8, 8, 4, 4), NEAREST_BINARY));
        for (x, y, px) in frame.enumerate_pixels() {
            if x >= 8 && y >= 8 {
                assert_eq!(px.0, [255, 0, 0]);
            } else {
                assert_eq!(px, original.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn transparent_pixels_leave_frame_unchanged() {
        let mut frame = test_frame(8, 8);
        let original = frame.clone();
        // Checkerboard of opaque black and fully transparent white
        let asset = OverlayAsset::new(RgbaImage::from_fn(8, 8, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 0])
            }
        }));

        composite(&mut frame, &asset, rect(0, 0, 8, 8), NEAREST_BINARY);
        for (x, y, px) in frame.enumerate_pixels() {
            if (x + y) % 2 == 0 {
                assert_eq!(px.0, [0, 0, 0]);
            } else {
                assert_eq!(px, original.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn fully_transparent_asset_is_noop_with_bilinear() {
        let mut frame = test_frame(16, 16);
        let before = frame.clone();
        let asset = solid_asset(5, 7, [200, 100, 50, 0]);
        let options = CompositeOptions {
            mode: CompositeMode::Binary,
            resample: Resample::Bilinear,
        };
        composite(&mut frame, &asset, rect(1, 2, 13, 9), options);
        assert_eq!(frame, before);
    }

    #[test]
    fn binary_mode_ignores_partial_alpha_value() {
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let asset = solid_asset(2, 2, [200, 100, 50, 1]);
        composite(&mut frame, &asset, rect(0, 0, 4, 4), NEAREST_BINARY);
        assert!(frame.pixels().all(|p| p.0 == [200, 100, 50]));
    }

    #[test]
    fn alpha_blend_mixes_by_alpha() {
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([0, 100, 255]));
        let asset = solid_asset(2, 2, [255, 255, 255, 128]);
        let options = CompositeOptions {
            mode: CompositeMode::AlphaBlend,
            resample: Resample::Nearest,
        };
        composite(&mut frame, &asset, rect(0, 0, 4, 4), options);
        // 255*128/255 + 0 = 128; (255*128 + 100*127)/255 = 178; 255 stays 255
        assert!(frame.pixels().all(|p| p.0 == [128, 178, 255]));
    }

    #[test]
    fn blend_endpoints() {
        assert_eq!(blend(10, 200, 0), 200);
        assert_eq!(blend(10, 200, 255), 10);
        assert_eq!(blend(255, 0, 128), 128);
    }

    #[test]
    fn compositing_is_deterministic() {
        let original = test_frame(32, 24);
        let asset = OverlayAsset::new(RgbaImage::from_fn(9, 5, |x, y| {
            Rgba([(x * 20) as u8, (y * 40) as u8, 90, if x == y { 0 } else { 255 }])
        }));
        let options = CompositeOptions::default();

        let mut first = original.clone();
        composite(&mut first, &asset, rect(-3, 4, 20, 11), options);
        let mut second = original.clone();
        composite(&mut second, &asset, rect(-3, 4, 20, 11), options);
        assert_eq!(first, second);
    }

    #[test]
    fn oversized_target_is_skipped() {
        let mut frame = test_frame(8, 8);
        let before = frame.clone();
        let asset = solid_asset(2, 2, [255, 255, 255, 255]);
        assert!(!composite(&mut frame, &asset, rect(0, 0, 100_000, 100_000), NEAREST_BINARY));
        assert_eq!(frame, before);
    }

    #[test]
    fn resampled_overlay_is_reused_until_size_changes() {
        let asset = solid_asset(4, 4, [9, 9, 9, 255]);
        let first = asset.scaled(10, 12, Resample::Bilinear);
        assert_eq!(first.dimensions(), (10, 12));
        let again = asset.scaled(10, 12, Resample::Bilinear);
        assert!(Arc::ptr_eq(&first, &again));

        let other_filter = asset.scaled(10, 12, Resample::Nearest);
        assert!(!Arc::ptr_eq(&first, &other_filter));
        let resized = asset.scaled(11, 12, Resample::Nearest);
        assert_eq!(resized.dimensions(), (11, 12));
        assert!(!Arc::ptr_eq(&other_filter, &resized));
    }

    #[test]
    fn repeated_composites_match_a_fresh_asset() {
        let pixels = RgbaImage::from_fn(6, 6, |x, y| Rgba([(x * 40) as u8, (y * 40) as u8, 90, 255]));
        let cached = OverlayAsset::new(pixels.clone());
        let target = rect(-2, 1, 9, 7);

        let mut warm = test_frame(12, 10);
        composite(&mut warm, &cached, target, CompositeOptions::default());
        let mut reused = test_frame(12, 10);
        composite(&mut reused, &cached, target, CompositeOptions::default());
        let mut fresh = test_frame(12, 10);
        composite(&mut fresh, &OverlayAsset::new(pixels), target, CompositeOptions::default());

        assert_eq!(reused, fresh);
        assert_eq!(warm, fresh);
    }

    #[test]
    fn visible_region_clips_to_frame() {
        let v = visible_region(rect(-3, 5, 10, 10), 8, 12).unwrap();
        assert_eq!(
            v,
            Visible {
                frame_x: 0,
                frame_y: 5,
                overlay_x: 3,
                overlay_y: 0,
                width: 7,
                height: 7,
            }
        );
        assert!(visible_region(rect(8, 0, 4, 4), 8, 12).is_none());
    }

    #[test]
    fn load_adds_alpha_to_rgb_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        RgbImage::from_pixel(6, 3, Rgb([1, 2, 3])).save(&path).unwrap();

        let asset = OverlayAsset::load(&path).unwrap();
        assert_eq!((asset.width(), asset.height()), (6, 3));
        assert_eq!(asset.aspect_ratio(), 2.0);
        assert!(asset.image().pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(OverlayAsset::load(&path).is_err());
        assert!(matches!(
            OverlayAsset::load(&dir.path().join("missing.png")),
            Err(AssetError::Read(_, _))
        ));
    }
}
