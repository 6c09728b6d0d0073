use anyhow::{Context, Result};
use facerec_capture::FrameSource;
use facerec_core::{DetectionModel, EmbeddingStore, KeyValueStore, RecordedModel, SqliteStore, UnavailableModel};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod settings;

use config::Config;
use dbus_interface::{RecognizerService, BUS_NAME, OBJECT_PATH};
use engine::{DetectionLoop, LoopEvent};
use settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facerecd starting");

    let config = Config::from_env();

    let kv: Arc<dyn KeyValueStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let store = Arc::new(EmbeddingStore::new(kv.clone()));
    let settings = Arc::new(SettingsStore::load(kv));
    tracing::info!(faces = store.len(), "registry ready");

    let model = load_model(&config.model_path, config.model_fallback_path.as_deref());

    let source: Option<Arc<dyn FrameSource>> = match &config.source {
        Some(path) => match facerec_capture::source::open(path) {
            Ok(source) => Some(Arc::from(source)),
            Err(e) => {
                tracing::warn!(error = %e, "live source unavailable; snapshot detection only");
                None
            }
        },
        None => {
            tracing::info!("no FACEREC_SOURCE configured; snapshot detection only");
            None
        }
    };

    let (engine, events) = DetectionLoop::new(
        model,
        source,
        store.clone(),
        config.match_threshold,
        config.model_timeout(),
    );

    let service = RecognizerService::new(store, settings.clone(), engine.clone(), config.match_threshold);
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tokio::spawn(forward_events(conn.clone(), events));

    if config.autostart {
        match engine.start(&settings.get()) {
            Ok(_) => tracing::info!("detection loop autostarted"),
            Err(e) => tracing::warn!(error = %e, "autostart skipped"),
        }
    }

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facerecd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facerecd shutting down");
    engine.stop();

    Ok(())
}

/// Load the model asset, trying `fallback` when `primary` fails.
///
/// A missing model is not fatal: the loop degrades on first use and clients
/// are told detection is unavailable.
fn load_model(primary: &Path, fallback: Option<&Path>) -> Box<dyn DetectionModel> {
    let err = match RecordedModel::load(primary) {
        Ok(model) => return Box::new(model),
        Err(e) => e,
    };
    if let Some(fallback) = fallback {
        tracing::warn!(error = %err, fallback = %fallback.display(), "primary model failed; trying fallback");
        match RecordedModel::load(fallback) {
            Ok(model) => return Box::new(model),
            Err(e) => tracing::warn!(error = %e, "fallback model failed"),
        }
    }
    tracing::warn!(error = %err, "model unavailable; live detection will fall back");
    Box::new(UnavailableModel::new(err.to_string()))
}

/// Relay loop notifications to D-Bus clients as `Fallback` signals.
async fn forward_events(conn: zbus::Connection, mut events: mpsc::UnboundedReceiver<LoopEvent>) {
    while let Some(event) = events.recv().await {
        let LoopEvent::Fallback { message, reason } = event;
        tracing::warn!(%message, %reason, "live detection fell back");

        let iface = match conn
            .object_server()
            .interface::<_, RecognizerService>(OBJECT_PATH)
            .await
        {
            Ok(iface) => iface,
            Err(e) => {
                tracing::warn!(error = %e, "interface lookup failed; fallback not signalled");
                continue;
            }
        };
        if let Err(e) = RecognizerService::fallback(iface.signal_emitter(), &message, &reason).await {
            tracing::warn!(error = %e, "failed to emit fallback signal");
        }
    }
}
