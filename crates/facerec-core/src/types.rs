use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name reported for a probe that matched nobody in the registry.
pub const UNKNOWN_NAME: &str = "unknown";

/// Maximum distance accepted as a match unless the caller supplies another.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// Bounding box of a detected face in source-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    /// Strict parse used for persisted and user-supplied values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Lenient mapping for labels coming out of the model.
    pub fn from_label(label: &str) -> Self {
        Self::parse(label).unwrap_or(Self::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered person: name plus the face descriptor captured at enrollment.
///
/// Registry entries have no stable id. Their position in the list is the
/// only handle, so any index held by a caller is stale after a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFace {
    pub name: String,
    pub descriptor: Vec<f32>,
    /// Date of birth, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

/// Result of matching a probe descriptor against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Matched name, or [`UNKNOWN_NAME`].
    pub name: String,
    /// Distance of the closest entry; infinite when the registry is empty.
    pub distance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            distance,
            dob: None,
            gender: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN_NAME
    }
}

/// Per-cycle record for one detected face. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub id: String,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expressions: Option<BTreeMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
}

impl FaceResult {
    /// Highest-probability expression label, if the model reported any.
    pub fn dominant_expression(&self) -> Option<(&str, f32)> {
        self.expressions
            .as_ref()?
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(label, p)| (label.as_str(), *p))
    }
}

/// Euclidean distance over the common prefix of two descriptors.
///
/// Descriptors of different lengths are compared on `min(a.len(), b.len())`
/// dimensions only.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::debug!(
            probe_len = a.len(),
            candidate_len = b.len(),
            "descriptor length mismatch; comparing common prefix"
        );
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Strategy for comparing a probe descriptor against the registry.
pub trait Matcher {
    fn compare(&self, probe: &[f32], gallery: &[StoredFace], threshold: f32) -> MatchResult;
}

/// Linear nearest-neighbour scan by Euclidean distance.
///
/// Ties keep the earliest entry in registry order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &[f32], gallery: &[StoredFace], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, face) in gallery.iter().enumerate() {
            let dist = euclidean_distance(probe, &face.descriptor);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= threshold => {
                let face = &gallery[idx];
                MatchResult {
                    name: face.name.clone(),
                    distance: best_dist,
                    dob: face.dob.clone(),
                    gender: face.gender,
                }
            }
            _ => MatchResult::unknown(best_dist),
        }
    }
}
