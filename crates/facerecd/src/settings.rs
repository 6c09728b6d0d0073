//! User-tunable detection settings, persisted as one JSON object.

use facerec_capture::Facing;
use facerec_core::{KeyValueStore, ModelSize};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage key holding the serialized settings.
pub const SETTINGS_KEY: &str = "app.settings";

const MIN_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Delay between detection ticks.
    pub interval_ms: u64,
    /// Use the lightweight detector.
    pub use_tiny_model: bool,
    /// Detections scoring below this are dropped (0.0–1.0).
    pub min_confidence: f32,
    pub camera_facing: Facing,
    /// Display hint for clients; the daemon publishes expressions regardless.
    pub show_expressions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            use_tiny_model: false,
            min_confidence: 0.5,
            camera_facing: Facing::User,
            show_expressions: true,
        }
    }
}

impl Settings {
    /// Overlay the fields present in `raw` onto `base`.
    ///
    /// Each field is taken independently: a missing or mistyped field keeps
    /// the value from `base`, and a payload that is not a JSON object keeps
    /// `base` entirely.
    pub fn merged_from_json(base: &Settings, raw: &str) -> Settings {
        let mut out = base.clone();
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) else {
            tracing::debug!("settings payload is not a JSON object; keeping previous values");
            return out;
        };

        if let Some(v) = obj.get("intervalMs").and_then(Value::as_u64) {
            out.interval_ms = v;
        }
        if let Some(v) = obj.get("useTinyModel").and_then(Value::as_bool) {
            out.use_tiny_model = v;
        }
        if let Some(v) = obj.get("minConfidence").and_then(Value::as_f64) {
            if v.is_finite() {
                out.min_confidence = v as f32;
            }
        }
        if let Some(v) = obj
            .get("cameraFacing")
            .and_then(|v| serde_json::from_value::<Facing>(v.clone()).ok())
        {
            out.camera_facing = v;
        }
        if let Some(v) = obj.get("showExpressions").and_then(Value::as_bool) {
            out.show_expressions = v;
        }
        out.normalized()
    }

    fn normalized(mut self) -> Self {
        self.interval_ms = self.interval_ms.max(MIN_INTERVAL_MS);
        self.min_confidence = self.min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn model_size(&self) -> ModelSize {
        ModelSize::from_tiny_flag(self.use_tiny_model)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Current settings plus their persistence.
pub struct SettingsStore {
    kv: Arc<dyn KeyValueStore>,
    current: Mutex<Settings>,
}

impl SettingsStore {
    /// Read persisted settings, falling back to defaults field by field.
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Self {
        let settings = match kv.get(SETTINGS_KEY) {
            Ok(Some(raw)) => Settings::merged_from_json(&Settings::default(), &raw),
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read settings; using defaults");
                Settings::default()
            }
        };
        tracing::info!(?settings, "settings loaded");
        Self {
            kv,
            current: Mutex::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply a partial JSON update, persist, and return the result.
    pub fn update_from_json(&self, raw: &str) -> Settings {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let updated = Settings::merged_from_json(&current, raw);
        if let Err(e) = self.kv.set(SETTINGS_KEY, &updated.to_json()) {
            tracing::warn!(error = %e, "failed to persist settings");
        }
        *current = updated.clone();
        tracing::info!(settings = ?updated, "settings updated");
        updated
    }
}
