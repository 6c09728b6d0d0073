//! Detection loop: capture → detect → filter → match → publish.
//!
//! The loop is a small state machine (`Idle`, `Running`, `Degraded`) driven
//! by a fixed-delay ticker. At most one poll is in flight at a time; ticks
//! that fire while a poll is outstanding are dropped. Every start/stop bumps
//! a generation counter, and a poll only publishes if its generation is still
//! current, so nothing is written after a stop.

use crate::settings::Settings;
use chrono::{DateTime, Local, NaiveDate, Utc};
use facerec_capture::{CaptureError, Frame, FrameSource};
use facerec_core::projection;
use facerec_core::{
    DetectionModel, EmbeddingStore, EuclideanMatcher, FaceResult, Matcher, ModelError, ModelSize,
    RawDetection, StoredFace,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Message surfaced to clients when live detection stops working.
pub const FALLBACK_MESSAGE: &str = "Automatic detection unavailable. You can still take snapshots.";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("model unavailable: {0}")]
    Model(#[from] ModelError),
    #[error("model call timed out after {0:?}")]
    ModelTimeout(Duration),
    #[error("model worker failed: {0}")]
    ModelWorker(String),
    #[error("no live source configured")]
    NoSource,
    #[error("a detection is already in flight")]
    Busy,
    #[error("no face detected")]
    NoFace,
}

impl EngineError {
    /// Failures that mean the model cannot be used in this environment.
    pub fn is_model_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Model(_) | Self::ModelTimeout(_) | Self::ModelWorker(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// Live detection stopped; `reason` is the underlying model failure.
    Fallback { message: String, reason: String },
}

/// The most recently published result list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSnapshot {
    pub faces: Vec<FaceResult>,
    /// Number of result lists published so far.
    pub cycle: u64,
    /// `None` until the first publish and after a clear.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-cycle knobs taken from [`Settings`] when the loop starts.
#[derive(Debug, Clone, Copy)]
struct CycleParams {
    interval: Duration,
    min_confidence: f32,
    size: ModelSize,
}

impl From<&Settings> for CycleParams {
    fn from(settings: &Settings) -> Self {
        Self {
            interval: settings.interval(),
            min_confidence: settings.min_confidence,
            size: settings.model_size(),
        }
    }
}

struct Control {
    state: LoopState,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
}

struct Inner {
    model: Arc<Mutex<Box<dyn DetectionModel>>>,
    source: Option<Arc<dyn FrameSource>>,
    store: Arc<EmbeddingStore>,
    threshold: f32,
    model_timeout: Duration,
    control: Mutex<Control>,
    in_flight: AtomicBool,
    skipped_ticks: AtomicU64,
    results: watch::Sender<DetectionSnapshot>,
    events: mpsc::UnboundedSender<LoopEvent>,
}

/// Clone-safe handle to the detection loop.
#[derive(Clone)]
pub struct DetectionLoop {
    inner: Arc<Inner>,
}

impl DetectionLoop {
    /// Build an idle loop. Fallback notifications arrive on the returned
    /// receiver.
    pub fn new(
        model: Box<dyn DetectionModel>,
        source: Option<Arc<dyn FrameSource>>,
        store: Arc<EmbeddingStore>,
        threshold: f32,
        model_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (results, _) = watch::channel(DetectionSnapshot::default());
        let inner = Inner {
            model: Arc::new(Mutex::new(model)),
            source,
            store,
            threshold,
            model_timeout,
            control: Mutex::new(Control {
                state: LoopState::Idle,
                generation: 0,
                ticker: None,
            }),
            in_flight: AtomicBool::new(false),
            skipped_ticks: AtomicU64::new(0),
            results,
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Begin polling. Also the only way out of `Degraded`.
    ///
    /// Returns `Ok(false)` if the loop was already running. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self, settings: &Settings) -> Result<bool, EngineError> {
        let source = self.inner.source.clone().ok_or(EngineError::NoSource)?;
        let mut control = self.inner.lock_control();
        if control.state == LoopState::Running {
            return Ok(false);
        }

        source.set_facing(settings.camera_facing);

        control.generation += 1;
        control.state = LoopState::Running;
        let params = CycleParams::from(settings);
        let generation = control.generation;
        control.ticker = Some(tokio::spawn(run_ticker(
            self.inner.clone(),
            generation,
            params,
        )));

        tracing::info!(
            generation,
            interval_ms = params.interval.as_millis() as u64,
            min_confidence = params.min_confidence,
            size = ?params.size,
            "detection loop started"
        );
        Ok(true)
    }

    /// Stop polling. A poll already in flight completes but is not published.
    pub fn stop(&self) {
        let mut control = self.inner.lock_control();
        control.generation += 1;
        if let Some(ticker) = control.ticker.take() {
            ticker.abort();
        }
        if control.state != LoopState::Idle {
            tracing::info!(generation = control.generation, "detection loop stopped");
        }
        control.state = LoopState::Idle;
    }

    /// Stop, then start with fresh settings.
    pub fn restart(&self, settings: &Settings) -> Result<bool, EngineError> {
        self.stop();
        self.start(settings)
    }

    pub fn state(&self) -> LoopState {
        self.inner.lock_control().state.clone()
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        self.inner.results.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionSnapshot> {
        self.inner.results.subscribe()
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.inner.skipped_ticks.load(Ordering::Relaxed)
    }

    pub fn has_source(&self) -> bool {
        self.inner.source.is_some()
    }

    /// Publish an empty result list.
    pub fn clear_results(&self) {
        self.inner.results.send_modify(|snap| {
            snap.faces.clear();
            snap.updated_at = None;
        });
    }

    /// Run one detection on a caller-supplied frame and publish the result.
    ///
    /// Shares the single-flight guard with the loop. A model failure here is
    /// returned to the caller and does not change the loop state. If the loop
    /// is started or stopped while the call is outstanding, the result is
    /// returned but not published.
    pub async fn detect_frame(
        &self,
        frame: Frame,
        settings: &Settings,
    ) -> Result<Vec<FaceResult>, EngineError> {
        let _guard = InFlight::acquire(&self.inner).ok_or(EngineError::Busy)?;
        let generation = self.inner.lock_control().generation;
        let faces = self.inner.detect(frame, CycleParams::from(settings)).await?;
        self.inner.publish_if_current(generation, faces.clone());
        Ok(faces)
    }

    /// Detect on a caller-supplied frame and return the highest-scoring face
    /// at or above the confidence floor. Nothing is published.
    pub async fn enroll_frame(
        &self,
        frame: Frame,
        settings: &Settings,
    ) -> Result<RawDetection, EngineError> {
        let _guard = InFlight::acquire(&self.inner).ok_or(EngineError::Busy)?;
        let params = CycleParams::from(settings);
        let raw = self.inner.run_model(frame, params.size).await?;
        tracing::debug!(faces = raw.len(), "enrollment frame analysed");
        best_face(raw, params.min_confidence).ok_or(EngineError::NoFace)
    }
}

async fn run_ticker(inner: Arc<Inner>, generation: u64, params: CycleParams) {
    let mut ticker = tokio::time::interval(params.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.is_current(generation) {
            break;
        }

        let Some(guard) = InFlight::acquire(&inner) else {
            let skipped = inner.skipped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(skipped, "poll still in flight; tick dropped");
            continue;
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let outcome = inner.poll(params).await;
            inner.finish_poll(generation, outcome);
            drop(guard);
        });
    }
}

impl Inner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let control = self.lock_control();
        control.generation == generation && control.state == LoopState::Running
    }

    async fn poll(&self, params: CycleParams) -> Result<Vec<FaceResult>, EngineError> {
        let source = self.source.clone().ok_or(EngineError::NoSource)?;
        let frame = tokio::task::spawn_blocking(move || source.capture())
            .await
            .map_err(|e| CaptureError::CaptureFailed(format!("capture worker failed: {e}")))??;
        tracing::trace!(
            sequence = frame.sequence,
            brightness = frame.avg_brightness(),
            "frame captured"
        );
        self.detect(frame, params).await
    }

    async fn run_model(&self, frame: Frame, size: ModelSize) -> Result<Vec<RawDetection>, EngineError> {
        let model = self.model.clone();
        let call = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("model panicked during an earlier call; reusing it");
                poisoned.into_inner()
            });
            model.detect(&frame.data, frame.width, frame.height, size)
        });

        match tokio::time::timeout(self.model_timeout, call).await {
            Err(_) => Err(EngineError::ModelTimeout(self.model_timeout)),
            Ok(Err(join)) => Err(EngineError::ModelWorker(join.to_string())),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    async fn detect(&self, frame: Frame, params: CycleParams) -> Result<Vec<FaceResult>, EngineError> {
        let raw = self.run_model(frame, params.size).await?;
        let gallery = self.store.list();
        let today = Local::now().date_naive();
        let faces = project_detections(&raw, &gallery, self.threshold, params.min_confidence, today);
        tracing::debug!(raw = raw.len(), kept = faces.len(), "detection cycle complete");
        Ok(faces)
    }

    /// Publish or discard a finished poll, entering `Degraded` on model failure.
    fn finish_poll(&self, generation: u64, outcome: Result<Vec<FaceResult>, EngineError>) {
        let mut control = self.lock_control();
        if control.generation != generation || control.state != LoopState::Running {
            tracing::debug!(generation, "discarding result of a stopped poll");
            return;
        }

        match outcome {
            Ok(faces) => self.publish(faces),
            Err(e) if e.is_model_unavailable() => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, "model unavailable; detection loop degraded");
                control.generation += 1;
                if let Some(ticker) = control.ticker.take() {
                    ticker.abort();
                }
                control.state = LoopState::Degraded {
                    reason: reason.clone(),
                };
                let _ = self.events.send(LoopEvent::Fallback {
                    message: FALLBACK_MESSAGE.to_string(),
                    reason,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "detection cycle dropped");
            }
        }
    }

    fn publish_if_current(&self, generation: u64, faces: Vec<FaceResult>) {
        let control = self.lock_control();
        if control.generation != generation {
            tracing::debug!(generation, "discarding snapshot result after a start or stop");
            return;
        }
        self.publish(faces);
    }

    fn publish(&self, faces: Vec<FaceResult>) {
        self.results.send_modify(|snap| {
            snap.faces = faces;
            snap.cycle += 1;
            snap.updated_at = Some(Utc::now());
        });
    }
}

/// Single-flight token; releases the flag on drop.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(inner.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Highest-scoring detection at or above `min_confidence` that carries an
/// embedding.
fn best_face(raw: Vec<RawDetection>, min_confidence: f32) -> Option<RawDetection> {
    raw.into_iter()
        .filter(|d| d.score >= min_confidence && !d.embedding.is_empty())
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// Confidence filter, match and projection for one cycle's raw output.
fn project_detections(
    raw: &[RawDetection],
    gallery: &[StoredFace],
    threshold: f32,
    min_confidence: f32,
    today: NaiveDate,
) -> Vec<FaceResult> {
    raw.iter()
        .filter(|d| d.score >= min_confidence)
        .map(|d| {
            let outcome = EuclideanMatcher.compare(&d.embedding, gallery, threshold);
            projection::project(d, &outcome, today)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerec_capture::StillImageSource;
    use facerec_core::{FaceBox, MemoryStore};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Test model with a fixed output, optional latency, and call accounting.
    #[derive(Clone, Default)]
    struct Probe {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    struct ScriptedModel {
        output: Vec<RawDetection>,
        delay: Duration,
        fail: bool,
        probe: Probe,
    }

    impl DetectionModel for ScriptedModel {
        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _size: ModelSize,
        ) -> Result<Vec<RawDetection>, ModelError> {
            self.probe.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.probe.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModelError::Unsupported("no WebGL backend".into()));
            }
            Ok(self.output.clone())
        }
    }

    /// Panics on its first call, then reports one face.
    struct PanicOnce {
        panicked: bool,
    }

    impl DetectionModel for PanicOnce {
        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _size: ModelSize,
        ) -> Result<Vec<RawDetection>, ModelError> {
            if !self.panicked {
                self.panicked = true;
                panic!("model crashed");
            }
            Ok(vec![detection(0.9, vec![0.0])])
        }
    }

    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn capture(&self) -> Result<Frame, CaptureError> {
            Err(CaptureError::CaptureFailed("device unplugged".into()))
        }
    }

    fn detection(score: f32, embedding: Vec<f32>) -> RawDetection {
        RawDetection {
            bbox: FaceBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            score,
            landmarks: None,
            embedding,
            age: Some(40.0),
            gender_label: Some("female".into()),
            gender_confidence: Some(0.9),
            expression_scores: None,
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(vec![0; 2 * 2 * 3], 2, 2, 0).unwrap()
    }

    fn source() -> Option<Arc<dyn FrameSource>> {
        Some(Arc::new(StillImageSource::from_frame(frame())))
    }

    fn store() -> Arc<EmbeddingStore> {
        Arc::new(EmbeddingStore::new(Arc::new(MemoryStore::new())))
    }

    fn fast_settings() -> Settings {
        Settings {
            interval_ms: 50,
            ..Settings::default()
        }
    }

    fn build(
        output: Vec<RawDetection>,
        delay: Duration,
        fail: bool,
        source: Option<Arc<dyn FrameSource>>,
        timeout: Duration,
    ) -> (DetectionLoop, mpsc::UnboundedReceiver<LoopEvent>, Probe) {
        let probe = Probe::default();
        let model = ScriptedModel {
            output,
            delay,
            fail,
            probe: probe.clone(),
        };
        let (engine, events) = DetectionLoop::new(Box::new(model), source, store(), 0.45, timeout);
        (engine, events, probe)
    }

    async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[test]
    fn test_project_detections_filters_by_confidence() {
        let raw = vec![detection(0.4, vec![0.0]), detection(0.7, vec![0.0])];
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let faces = project_detections(&raw, &[], 0.45, 0.5, today);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].score, Some(0.7));
        assert_eq!(faces[0].name, None);
    }

    #[test]
    fn test_project_detections_score_equal_to_floor_is_kept() {
        let raw = vec![detection(0.5, vec![0.0])];
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(project_detections(&raw, &[], 0.45, 0.5, today).len(), 1);
    }

    #[tokio::test]
    async fn test_detect_frame_publishes_filtered_matched_results() {
        let raw = vec![detection(0.4, vec![0.1, 0.0]), detection(0.7, vec![0.1, 0.0])];
        let probe = Probe::default();
        let model = ScriptedModel {
            output: raw,
            delay: Duration::ZERO,
            fail: false,
            probe: probe.clone(),
        };
        let store = store();
        store.add("Bob", vec![0.6, 0.0], None, None);
        store.add("Alice", vec![0.0, 0.0], Some("1990-01-01".into()), None);
        let (engine, _events) =
            DetectionLoop::new(Box::new(model), None, store, 0.45, Duration::from_secs(1));

        let faces = engine.detect_frame(frame(), &Settings::default()).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].name.as_deref(), Some("Alice"));
        assert_eq!(faces[0].dob.as_deref(), Some("1990-01-01"));

        let snap = engine.snapshot();
        assert_eq!(snap.cycle, 1);
        assert_eq!(snap.faces, faces);
        assert!(snap.updated_at.is_some());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_results() {
        let (engine, _events, _) =
            build(vec![detection(0.9, vec![0.0])], Duration::ZERO, false, None, Duration::from_secs(1));
        engine.detect_frame(frame(), &Settings::default()).await.unwrap();
        assert_eq!(engine.snapshot().faces.len(), 1);
        engine.clear_results();
        let snap = engine.snapshot();
        assert!(snap.faces.is_empty());
        assert!(snap.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_start_requires_source() {
        let (engine, _events, _) = build(vec![], Duration::ZERO, false, None, Duration::from_secs(1));
        assert!(matches!(engine.start(&fast_settings()), Err(EngineError::NoSource)));
        assert_eq!(engine.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_loop_publishes_each_cycle_wholesale() {
        let (engine, _events, probe) = build(
            vec![detection(0.9, vec![0.0]), detection(0.8, vec![0.0])],
            Duration::ZERO,
            false,
            source(),
            Duration::from_secs(1),
        );
        let mut rx = engine.subscribe();
        assert!(engine.start(&fast_settings()).unwrap());
        assert!(!engine.start(&fast_settings()).unwrap());
        assert_eq!(engine.state(), LoopState::Running);

        assert!(wait_until(Duration::from_secs(2), || engine.snapshot().cycle >= 3).await);
        engine.stop();
        assert_eq!(engine.state(), LoopState::Idle);

        rx.changed().await.unwrap();
        let snap = rx.borrow().clone();
        assert_eq!(snap.faces.len(), 2);
        assert_ne!(snap.faces[0].id, snap.faces[1].id);
        assert!(probe.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_model_failure_degrades_with_single_notification() {
        let (engine, mut events, probe) =
            build(vec![], Duration::ZERO, true, source(), Duration::from_secs(1));
        engine.start(&fast_settings()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let LoopEvent::Fallback { message, reason } = event;
        assert_eq!(message, FALLBACK_MESSAGE);
        assert!(reason.contains("no WebGL backend"));

        // Several intervals later nothing else has been attempted.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(engine.state(), LoopState::Degraded { .. }));
        assert!(events.try_recv().is_err());
        assert_eq!(engine.snapshot().cycle, 0);

        // Explicit restart leaves Degraded.
        assert!(engine.start(&fast_settings()).unwrap());
        assert_eq!(engine.state(), LoopState::Running);
        engine.stop();
    }

    #[tokio::test]
    async fn test_restart_recovers_after_model_panic() {
        let (engine, mut events) = DetectionLoop::new(
            Box::new(PanicOnce { panicked: false }),
            source(),
            store(),
            0.45,
            Duration::from_secs(1),
        );
        engine.start(&fast_settings()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let LoopEvent::Fallback { reason, .. } = event;
        assert!(reason.contains("model worker failed"));
        assert!(matches!(engine.state(), LoopState::Degraded { .. }));

        assert!(engine.start(&fast_settings()).unwrap());
        assert!(wait_until(Duration::from_secs(2), || engine.snapshot().cycle > 0).await);
        assert_eq!(engine.state(), LoopState::Running);
        assert_eq!(engine.snapshot().faces.len(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn test_model_timeout_degrades() {
        let (engine, mut events, _) = build(
            vec![],
            Duration::from_millis(400),
            false,
            source(),
            Duration::from_millis(50),
        );
        engine.start(&fast_settings()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let LoopEvent::Fallback { reason, .. } = event;
        assert!(reason.contains("timed out"));
        assert!(matches!(engine.state(), LoopState::Degraded { .. }));
    }

    #[tokio::test]
    async fn test_capture_failure_keeps_loop_running() {
        let (engine, mut events, probe) = build(
            vec![],
            Duration::ZERO,
            false,
            Some(Arc::new(BrokenSource)),
            Duration::from_secs(1),
        );
        engine.start(&fast_settings()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.state(), LoopState::Running);
        assert!(events.try_recv().is_err());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        engine.stop();
    }

    #[tokio::test]
    async fn test_slow_model_drops_ticks_without_overlap() {
        let (engine, _events, probe) = build(
            vec![detection(0.9, vec![0.0])],
            Duration::from_millis(180),
            false,
            source(),
            Duration::from_secs(5),
        );
        engine.start(&fast_settings()).unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        engine.stop();

        assert!(engine.skipped_ticks() > 0);
        assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_result() {
        let (engine, _events, probe) = build(
            vec![detection(0.9, vec![0.0])],
            Duration::from_millis(200),
            false,
            source(),
            Duration::from_secs(5),
        );
        engine.start(&fast_settings()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || probe.calls.load(Ordering::SeqCst) == 1).await);
        engine.stop();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.snapshot().cycle, 0);
        assert!(engine.snapshot().faces.is_empty());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_detect_frame_is_single_flight() {
        let (engine, _events, probe) = build(
            vec![],
            Duration::from_millis(300),
            false,
            None,
            Duration::from_secs(5),
        );
        let background = engine.clone();
        let first = tokio::spawn(async move {
            background.detect_frame(frame(), &Settings::default()).await
        });
        assert!(wait_until(Duration::from_secs(2), || probe.calls.load(Ordering::SeqCst) == 1).await);

        let second = engine.detect_frame(frame(), &Settings::default()).await;
        assert!(matches!(second, Err(EngineError::Busy)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_model_failure_does_not_change_state() {
        let (engine, mut events, _) = build(vec![], Duration::ZERO, true, None, Duration::from_secs(1));
        let err = engine.detect_frame(frame(), &Settings::default()).await.err().unwrap();
        assert!(err.is_model_unavailable());
        assert_eq!(engine.state(), LoopState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_finishing_after_stop_is_not_published() {
        let (engine, _events, probe) = build(
            vec![detection(0.9, vec![0.0])],
            Duration::from_millis(200),
            false,
            None,
            Duration::from_secs(5),
        );
        let background = engine.clone();
        let pending = tokio::spawn(async move {
            background.detect_frame(frame(), &Settings::default()).await
        });
        assert!(wait_until(Duration::from_secs(2), || probe.calls.load(Ordering::SeqCst) == 1).await);
        engine.stop();
        engine.clear_results();

        let faces = pending.await.unwrap().unwrap();
        assert_eq!(faces.len(), 1);
        let snap = engine.snapshot();
        assert_eq!(snap.cycle, 0);
        assert!(snap.faces.is_empty());
    }

    #[tokio::test]
    async fn test_enroll_frame_picks_best_scoring_face() {
        let (engine, _events, _) = build(
            vec![
                detection(0.6, vec![1.0]),
                detection(0.9, vec![2.0]),
                detection(0.3, vec![3.0]),
            ],
            Duration::ZERO,
            false,
            None,
            Duration::from_secs(1),
        );
        let face = engine.enroll_frame(frame(), &Settings::default()).await.unwrap();
        assert_eq!(face.embedding, vec![2.0]);
        assert_eq!(engine.snapshot().cycle, 0);
    }

    #[tokio::test]
    async fn test_enroll_frame_without_confident_face() {
        let (engine, _events, _) = build(
            vec![detection(0.3, vec![1.0]), detection(0.9, vec![])],
            Duration::ZERO,
            false,
            None,
            Duration::from_secs(1),
        );
        let err = engine.enroll_frame(frame(), &Settings::default()).await.err().unwrap();
        assert!(matches!(err, EngineError::NoFace));
        assert_eq!(engine.state(), LoopState::Idle);
    }
}
