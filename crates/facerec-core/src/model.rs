//! Boundary to the pretrained detection/embedding model.
//!
//! The network itself runs outside this workspace. [`DetectionModel`] is the
//! seam; [`RecordedModel`] replays detections captured from it, which is
//! what the daemon loads from its model asset.

use crate::types::FaceBox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model asset not found: {0}")]
    ModelNotFound(String),
    #[error("model asset unreadable: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model runtime unsupported: {0}")]
    Unsupported(String),
}

/// Speed/accuracy tradeoff requested for one detection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    /// Lightweight detector, faster and less accurate.
    Tiny,
    Full,
}

impl ModelSize {
    pub fn from_tiny_flag(use_tiny: bool) -> Self {
        if use_tiny {
            Self::Tiny
        } else {
            Self::Full
        }
    }
}

/// One face as reported by the model, before matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDetection {
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    pub score: f32,
    #[serde(default)]
    pub landmarks: Option<Vec<(f32, f32)>>,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub gender_label: Option<String>,
    #[serde(default)]
    pub gender_confidence: Option<f32>,
    #[serde(default)]
    pub expression_scores: Option<BTreeMap<String, f32>>,
}

/// Detector + landmarker + embedder behind one call.
///
/// `pixels` is packed RGB8, `width * height * 3` bytes.
pub trait DetectionModel: Send {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        size: ModelSize,
    ) -> Result<Vec<RawDetection>, ModelError>;
}

/// Replays recorded model output, one recorded frame per call, wrapping
/// around at the end.
///
/// The asset is a JSON array of frames, each an array of [`RawDetection`].
pub struct RecordedModel {
    frames: Vec<Vec<RawDetection>>,
    cursor: usize,
}

impl RecordedModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::ModelNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ModelError::LoadFailed(format!("{}: {e}", path.display())))?;
        let frames: Vec<Vec<RawDetection>> = serde_json::from_str(&raw)
            .map_err(|e| ModelError::LoadFailed(format!("{}: {e}", path.display())))?;

        tracing::info!(
            path = %path.display(),
            frames = frames.len(),
            "loaded recorded detections"
        );
        Ok(Self::from_frames(frames))
    }

    pub fn from_frames(frames: Vec<Vec<RawDetection>>) -> Self {
        Self { frames, cursor: 0 }
    }
}

impl DetectionModel for RecordedModel {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        size: ModelSize,
    ) -> Result<Vec<RawDetection>, ModelError> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() < expected {
            return Err(ModelError::InferenceFailed(format!(
                "frame buffer too short: expected {expected}, got {}",
                pixels.len()
            )));
        }
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        let frame = self.frames[self.cursor % self.frames.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        tracing::trace!(?size, faces = frame.len(), "replayed detections");
        Ok(frame)
    }
}

/// Stands in when the model asset could not be loaded; every call fails.
pub struct UnavailableModel {
    reason: String,
}

impl UnavailableModel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl DetectionModel for UnavailableModel {
    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _size: ModelSize,
    ) -> Result<Vec<RawDetection>, ModelError> {
        Err(ModelError::Unsupported(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ASSET: &str = r#"[
        [
            {"box": {"x": 10, "y": 20, "width": 30, "height": 40},
             "score": 0.91,
             "embedding": [0.1, 0.2],
             "age": 31.5,
             "genderLabel": "female",
             "genderConfidence": 0.8,
             "expressionScores": {"happy": 0.9, "neutral": 0.1}}
        ],
        []
    ]"#;

    #[test]
    fn test_load_missing_asset() {
        let err = RecordedModel::load(Path::new("/nonexistent/model.json"))
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::ModelNotFound(_)));
    }

    #[test]
    fn test_load_invalid_asset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = RecordedModel::load(file.path()).err().unwrap();
        assert!(matches!(err, ModelError::LoadFailed(_)));
    }

    #[test]
    fn test_replay_cycles_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ASSET.as_bytes()).unwrap();
        let mut model = RecordedModel::load(file.path()).unwrap();
        let pixels = vec![0u8; 2 * 2 * 3];

        let first = model.detect(&pixels, 2, 2, ModelSize::Full).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].bbox.width, 30.0);
        assert_eq!(first[0].gender_label.as_deref(), Some("female"));
        assert_eq!(first[0].expression_scores.as_ref().unwrap()["happy"], 0.9);
        assert!(first[0].landmarks.is_none());

        assert!(model.detect(&pixels, 2, 2, ModelSize::Tiny).unwrap().is_empty());
        assert_eq!(model.detect(&pixels, 2, 2, ModelSize::Full).unwrap().len(), 1);
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let mut model = RecordedModel::from_frames(vec![]);
        let err = model.detect(&[0u8; 3], 2, 2, ModelSize::Full).err().unwrap();
        assert!(matches!(err, ModelError::InferenceFailed(_)));
    }

    #[test]
    fn test_unavailable_model_always_fails() {
        let mut model = UnavailableModel::new("no asset");
        let err = model.detect(&[], 0, 0, ModelSize::Full).err().unwrap();
        assert_eq!(err.to_string(), "model runtime unsupported: no asset");
    }

    #[test]
    fn test_model_size_flag() {
        assert_eq!(ModelSize::from_tiny_flag(true), ModelSize::Tiny);
        assert_eq!(ModelSize::from_tiny_flag(false), ModelSize::Full);
    }
}
