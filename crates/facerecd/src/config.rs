use std::path::PathBuf;
use std::time::Duration;

/// Shortest model call bound accepted from the environment.
const MIN_MODEL_TIMEOUT_MS: u64 = 100;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite key-value database.
    pub db_path: PathBuf,
    /// Model asset (recorded detections JSON).
    pub model_path: PathBuf,
    /// Tried when `model_path` cannot be loaded.
    pub model_fallback_path: Option<PathBuf>,
    /// Image file or directory serving as the live source, if any.
    pub source: Option<PathBuf>,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Upper bound on a single model call.
    pub model_timeout_ms: u64,
    /// Start the detection loop at boot.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `FACEREC_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facerec");

        let db_path = std::env::var("FACEREC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("facerec.db"));

        let model_path = std::env::var("FACEREC_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("model.json"));

        Self {
            db_path,
            model_path,
            model_fallback_path: std::env::var("FACEREC_MODEL_FALLBACK_PATH")
                .ok()
                .map(PathBuf::from),
            source: std::env::var("FACEREC_SOURCE").ok().map(PathBuf::from),
            match_threshold: env_f32(
                "FACEREC_MATCH_THRESHOLD",
                facerec_core::DEFAULT_MATCH_THRESHOLD,
            ),
            model_timeout_ms: env_u64("FACEREC_MODEL_TIMEOUT_MS", 5000).max(MIN_MODEL_TIMEOUT_MS),
            autostart: std::env::var("FACEREC_AUTOSTART")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
