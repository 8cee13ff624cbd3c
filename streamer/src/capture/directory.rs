use std::path::PathBuf;

use image::imageops::FilterType;
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{decode_frame, frame_interval, CaptureError, FrameSource};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Plays the image files in a directory, in file-name order, at `fps`.
///
/// Every frame is scaled to the first frame's size so the session keeps one
/// resolution. Without `looping` the source ends after the last file.
pub struct DirectoryCapture {
    files: Vec<PathBuf>,
    next: usize,
    looping: bool,
    ticker: tokio::time::Interval,
    size: Option<(u32, u32)>,
}

impl DirectoryCapture {
    pub async fn open(dir: PathBuf, fps: f64, looping: bool) -> Result<Self, CaptureError> {
        let dir_label = dir.display().to_string();
        let files = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<PathBuf>> {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(&dir)?.flatten() {
                let path = entry.path();
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
                if is_image && path.is_file() {
                    files.push(path);
                }
            }
            files.sort();
            Ok(files)
        })
        .await
        .map_err(|e| CaptureError::Open(dir_label.clone(), e.to_string()))?
        .map_err(|e| CaptureError::Open(dir_label.clone(), e.to_string()))?;

        if files.is_empty() {
            return Err(CaptureError::Open(dir_label, "no image files".into()));
        }
        info!(dir = dir_label, files = files.len(), looping, "opened frame directory");

        Ok(Self {
            files,
            next: 0,
            looping,
            ticker: frame_interval(fps),
            size: None,
        })
    }
}

impl FrameSource for DirectoryCapture {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        loop {
            if self.next >= self.files.len() {
                if !self.looping {
                    debug!(files = self.files.len(), "frame directory exhausted");
                    return Ok(None);
                }
                self.next = 0;
            }
            let path = self.files[self.next].clone();
            self.next += 1;

            self.ticker.tick().await;
            let encoded = tokio::fs::read(&path)
                .await
                .map_err(|e| CaptureError::Read(format!("{}: {e}", path.display())))?;
            let frame = match decode_frame(encoded).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, path = path.display().to_string(), "skipping undecodable frame file");
                    continue;
                }
            };

            let (width, height) = *self.size.get_or_insert(frame.dimensions());
            if frame.dimensions() == (width, height) {
                return Ok(Some(frame));
            }
            return Ok(Some(image::imageops::resize(
                &frame,
                width,
                height,
                FilterType::Triangle,
            )));
        }
    }

    fn name(&self) -> &str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_frames(dir: &std::path::Path) {
        RgbImage::from_pixel(4, 4, Rgb([10, 0, 0]))
            .save(dir.join("002.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([20, 0, 0]))
            .save(dir.join("001.png"))
            .unwrap();
        RgbImage::from_pixel(8, 2, Rgb([30, 0, 0]))
            .save(dir.join("003.png"))
            .unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
    }

    #[tokio::test]
    async fn plays_files_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let mut capture = DirectoryCapture::open(dir.path().to_path_buf(), 500.0, false)
            .await
            .unwrap();
        let mut reds = Vec::new();
        while let Some(frame) = capture.next_frame().await.unwrap() {
            assert_eq!(frame.dimensions(), (4, 4), "frames keep the session size");
            reds.push(frame.get_pixel(0, 0).0[0]);
        }
        assert_eq!(&reds[..2], &[20, 10]);
        assert_eq!(reds.len(), 3);
    }

    #[tokio::test]
    async fn looping_restarts_from_first_file() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let mut capture = DirectoryCapture::open(dir.path().to_path_buf(), 500.0, true)
            .await
            .unwrap();
        for _ in 0..3 {
            capture.next_frame().await.unwrap().unwrap();
        }
        let again = capture.next_frame().await.unwrap().unwrap();
        assert_eq!(again.get_pixel(0, 0).0[0], 20);
    }

    #[tokio::test]
    async fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = DirectoryCapture::open(dir.path().to_path_buf(), 10.0, false).await;
        assert!(matches!(result, Err(CaptureError::Open(_, _))));
    }
}
