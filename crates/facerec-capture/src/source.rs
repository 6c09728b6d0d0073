//! Pull-based frame sources.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("no images in {0}")]
    NoImages(String),
    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Which camera the caller would like. Sources without a choice ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Front camera, facing the user.
    #[default]
    User,
    /// Rear camera.
    Environment,
}

/// A live source that yields its current frame on demand.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<Frame, CaptureError>;

    /// Request a camera facing. May be ignored.
    fn set_facing(&self, facing: Facing) {
        tracing::debug!(?facing, "source has a single camera; facing ignored");
    }
}

/// Open a file as a [`StillImageSource`] or a directory as a [`DirectorySource`].
pub fn open(path: &Path) -> Result<Box<dyn FrameSource>, CaptureError> {
    if path.is_dir() {
        Ok(Box::new(DirectorySource::open(path)?))
    } else {
        Ok(Box::new(StillImageSource::open(path)?))
    }
}

/// Serves the same decoded image on every capture.
pub struct StillImageSource {
    frame: Frame,
    sequence: AtomicU32,
}

impl StillImageSource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        if !path.exists() {
            return Err(CaptureError::SourceNotFound(path.display().to_string()));
        }
        let frame = decode(path, 0)?;
        tracing::info!(
            path = %path.display(),
            width = frame.width,
            height = frame.height,
            "opened still image source"
        );
        Ok(Self::from_frame(frame))
    }

    pub fn from_frame(frame: Frame) -> Self {
        Self {
            frame,
            sequence: AtomicU32::new(0),
        }
    }
}

impl FrameSource for StillImageSource {
    fn capture(&self) -> Result<Frame, CaptureError> {
        let mut frame = self.frame.clone();
        frame.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        frame.timestamp = std::time::Instant::now();
        Ok(frame)
    }
}

/// Cycles through the images of a directory in file-name order, decoding
/// one per capture.
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: AtomicUsize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::SourceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::NoImages(dir.display().to_string()));
        }

        tracing::info!(dir = %dir.display(), images = files.len(), "opened directory source");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn capture(&self) -> Result<Frame, CaptureError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let path = &self.files[n % self.files.len()];
        tracing::trace!(dir = %self.dir.display(), file = %path.display(), "capturing");
        decode(path, n as u32)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn decode(path: &Path, sequence: u32) -> Result<Frame, CaptureError> {
    let image = image::open(path).map_err(|e| CaptureError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(Frame::from_image(&image, sequence))
}
