//! facerec-core — Face registry, matching and result projection.
//!
//! The detection/embedding network is an external collaborator reached
//! through [`model::DetectionModel`]; everything downstream of its output
//! lives here.

pub mod codec;
pub mod kv;
pub mod model;
pub mod projection;
pub mod sanitize;
pub mod store;
pub mod types;

pub use kv::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
pub use model::{
    DetectionModel, ModelError, ModelSize, RawDetection, RecordedModel, UnavailableModel,
};
pub use store::EmbeddingStore;
pub use types::{
    EuclideanMatcher, FaceBox, FaceResult, Gender, MatchResult, Matcher, StoredFace,
    DEFAULT_MATCH_THRESHOLD, UNKNOWN_NAME,
};
