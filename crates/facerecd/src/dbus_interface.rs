use crate::engine::{DetectionLoop, EngineError};
use crate::settings::SettingsStore;
use chrono::NaiveDate;
use facerec_capture::{Frame, FrameSource, StillImageSource};
use facerec_core::sanitize::sanitize_name;
use facerec_core::{EmbeddingStore, Gender};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facerec.Recognizer1";
pub const OBJECT_PATH: &str = "/org/facerec/Recognizer1";

/// D-Bus interface for the facerec daemon.
///
/// Bus name: org.facerec.Recognizer1
/// Object path: /org/facerec/Recognizer1
///
/// Structured results are returned as JSON strings. Empty strings stand for
/// "not set" in optional arguments.
pub struct RecognizerService {
    store: Arc<EmbeddingStore>,
    settings: Arc<SettingsStore>,
    engine: DetectionLoop,
    threshold: f32,
}

impl RecognizerService {
    pub fn new(
        store: Arc<EmbeddingStore>,
        settings: Arc<SettingsStore>,
        engine: DetectionLoop,
        threshold: f32,
    ) -> Self {
        Self {
            store,
            settings,
            engine,
            threshold,
        }
    }
}

#[interface(name = "org.facerec.Recognizer1")]
impl RecognizerService {
    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let snapshot = self.engine.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "loop": self.engine.state(),
            "source": self.engine.has_source(),
            "faces_registered": self.store.len(),
            "match_threshold": self.threshold,
            "cycle": snapshot.cycle,
            "skipped_ticks": self.engine.skipped_ticks(),
            "settings": self.settings.get(),
        })
        .to_string())
    }

    /// Start live detection. Returns false if it was already running.
    async fn start(&self) -> fdo::Result<bool> {
        tracing::info!("start requested");
        self.engine.start(&self.settings.get()).map_err(engine_error)
    }

    /// Stop live detection and clear the published results.
    async fn stop(&self) -> fdo::Result<()> {
        tracing::info!("stop requested");
        self.engine.stop();
        self.engine.clear_results();
        Ok(())
    }

    /// Latest published detection snapshot.
    async fn results(&self) -> fdo::Result<String> {
        to_json(&self.engine.snapshot())
    }

    /// One-shot detection on an image file; the result is also published.
    async fn detect_image(&self, path: &str) -> fdo::Result<String> {
        tracing::info!(path, "detect_image requested");
        let frame = load_frame(path).await?;
        let faces = self
            .engine
            .detect_frame(frame, &self.settings.get())
            .await
            .map_err(engine_error)?;
        to_json(&faces)
    }

    /// List registered faces with their current indices.
    async fn list_faces(&self) -> fdo::Result<String> {
        let faces: Vec<serde_json::Value> = self
            .store
            .list()
            .iter()
            .enumerate()
            .map(|(index, face)| {
                serde_json::json!({
                    "index": index,
                    "name": face.name,
                    "dob": face.dob,
                    "gender": face.gender,
                    "descriptor_len": face.descriptor.len(),
                })
            })
            .collect();
        to_json(&faces)
    }

    /// Register a face. Returns its index.
    async fn add_face(
        &self,
        name: &str,
        descriptor: Vec<f64>,
        dob: &str,
        gender: &str,
    ) -> fdo::Result<u32> {
        let name = checked_name(name)?;
        let dob = optional_dob(dob)?;
        let gender = optional_gender(gender)?;
        let index = self.store.add(&name, to_descriptor(&descriptor), dob, gender);
        Ok(index as u32)
    }

    /// Register the best-scoring face found in an image file. Returns its
    /// index.
    async fn enroll_image(
        &self,
        path: &str,
        name: &str,
        dob: &str,
        gender: &str,
    ) -> fdo::Result<u32> {
        let name = checked_name(name)?;
        let dob = optional_dob(dob)?;
        let gender = optional_gender(gender)?;
        tracing::info!(path, %name, "enroll_image requested");

        let frame = load_frame(path).await?;
        let face = self
            .engine
            .enroll_frame(frame, &self.settings.get())
            .await
            .map_err(engine_error)?;
        let index = self.store.add(&name, face.embedding, dob, gender);
        tracing::info!(%name, index, score = face.score, "face enrolled from image");
        Ok(index as u32)
    }

    /// Remove the face at `index`. Out-of-range indices are ignored.
    async fn delete_face(&self, index: u32) -> fdo::Result<()> {
        self.store.delete_at(index as usize);
        Ok(())
    }

    /// Rename / re-date the face at `index`, keeping its descriptor.
    /// Out-of-range indices are ignored.
    async fn update_face(&self, index: u32, name: &str, dob: &str, gender: &str) -> fdo::Result<()> {
        let name = checked_name(name)?;
        let dob = optional_dob(dob)?;
        let gender = optional_gender(gender)?;
        self.store.update_at(index as usize, &name, dob, gender);
        Ok(())
    }

    async fn clear_faces(&self) -> fdo::Result<()> {
        self.store.clear();
        Ok(())
    }

    /// Drop the registry cache so the next read reloads from storage.
    async fn reload_faces(&self) -> fdo::Result<()> {
        self.store.invalidate_cache();
        Ok(())
    }

    async fn export_faces(&self, pretty: bool) -> fdo::Result<String> {
        Ok(self.store.export_serialized(pretty))
    }

    /// Import faces; malformed entries are skipped. Returns how many were accepted.
    async fn import_faces(&self, json: &str, merge: bool) -> fdo::Result<u32> {
        Ok(self.store.import_serialized(json, merge) as u32)
    }

    /// Match a descriptor against the registry. An infinite distance
    /// (empty registry) is reported as `null`.
    async fn match_descriptor(&self, descriptor: Vec<f64>) -> fdo::Result<String> {
        let result = self
            .store
            .match_descriptor(&to_descriptor(&descriptor), self.threshold);
        to_json(&result)
    }

    async fn get_settings(&self) -> fdo::Result<String> {
        Ok(self.settings.get().to_json())
    }

    /// Apply a partial settings update. A running loop is restarted with
    /// the new values.
    async fn set_settings(&self, json: &str) -> fdo::Result<String> {
        let updated = self.settings.update_from_json(json);
        if self.engine.state() == crate::engine::LoopState::Running {
            self.engine.restart(&updated).map_err(engine_error)?;
        }
        Ok(updated.to_json())
    }

    /// Emitted once when live detection falls back to snapshot-only mode.
    #[zbus(signal)]
    pub async fn fallback(emitter: &SignalEmitter<'_>, message: &str, reason: &str) -> zbus::Result<()>;
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization: {e}")))
}

/// Decode an image file into a frame off the async runtime.
async fn load_frame(path: &str) -> fdo::Result<Frame> {
    let path = PathBuf::from(path);
    tokio::task::spawn_blocking(move || {
        StillImageSource::open(&path).and_then(|source| source.capture())
    })
    .await
    .map_err(|e| fdo::Error::Failed(format!("image worker failed: {e}")))?
    .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::NoSource => fdo::Error::NotSupported(e.to_string()),
        EngineError::Busy => fdo::Error::LimitsExceeded(e.to_string()),
        EngineError::NoFace => fdo::Error::InvalidArgs(e.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn checked_name(raw: &str) -> fdo::Result<String> {
    let name = sanitize_name(raw);
    if name.is_empty() {
        return Err(fdo::Error::InvalidArgs(format!("invalid name: {raw:?}")));
    }
    Ok(name)
}

fn optional_dob(raw: &str) -> fdo::Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| fdo::Error::InvalidArgs(format!("dob must be YYYY-MM-DD, got {raw:?}")))
}

fn optional_gender(raw: &str) -> fdo::Result<Option<Gender>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Gender::parse(raw)
        .map(Some)
        .ok_or_else(|| fdo::Error::InvalidArgs(format!("gender must be male, female or other, got {raw:?}")))
}

fn to_descriptor(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}
