use super::*;
use crate::camera::ImageCapture;
use crate::config::{PreprocessConfig, ScanConfig};
use crate::error::{Result, ScanError};
use crate::events::{EventBus, ScanEvent};
use crate::frame::{Frame, FrameFormat};
use crate::inference::{BackendInput, InferenceAdapter, InferenceOutput, InputKind};
use crate::interpreter::{ClassScores, ResultInterpreter, WasteLabel};
use crate::preprocess::FramePreprocessor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;

#[derive(Default)]
struct FakeCamera {
    frames: AtomicU64,
    fail_first: AtomicUsize,
    always_fail: AtomicBool,
    degenerate: AtomicBool,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
}

impl FakeCamera {
    fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::default()
            },
            gate,
        )
    }
}

#[async_trait]
impl ImageCapture for FakeCamera {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn capture(&self) -> Result<Frame> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ScanError::capture("sensor offline"));
        }
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(ScanError::capture("lens obstructed"));
        }

        let id = self.frames.fetch_add(1, Ordering::SeqCst);
        if self.degenerate.load(Ordering::SeqCst) {
            return Ok(Frame::new(id, Vec::new(), 0, 0, FrameFormat::Rgb24));
        }
        Ok(Frame::new(id, vec![128; 4 * 4 * 3], 4, 4, FrameFormat::Rgb24))
    }

    fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

enum Reply {
    Scores(Vec<f32>),
    RateLimited(Duration),
    Unavailable,
    ChannelLost,
}

struct FakeAdapter {
    init_ok: bool,
    ready: AtomicBool,
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl FakeAdapter {
    fn new(init_ok: bool) -> Self {
        Self {
            init_ok,
            ready: AtomicBool::new(false),
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_replies(replies: Vec<Reply>) -> Self {
        let adapter = Self::new(true);
        adapter.replies.lock().extend(replies);
        adapter
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceAdapter for FakeAdapter {
    fn name(&self) -> &str {
        "fake"
    }

    fn input_kind(&self) -> InputKind {
        InputKind::Tensor
    }

    async fn initialize(&self) -> bool {
        self.ready.store(self.init_ok, Ordering::SeqCst);
        self.init_ok
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn infer(&self, input: BackendInput) -> Result<InferenceOutput> {
        assert!(matches!(input, BackendInput::Tensor(ref t) if t.shape() == [4, 4, 3]));
        self.calls.fetch_add(1, Ordering::SeqCst);

        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::Scores(vec![0.92, 0.06, 0.02]));
        match reply {
            Reply::Scores(scores) => Ok(InferenceOutput {
                scores: ClassScores::new(scores),
                elapsed: Duration::from_millis(5),
            }),
            Reply::RateLimited(retry_after) => Err(ScanError::RateLimited { retry_after }),
            Reply::Unavailable => Err(ScanError::backend(Some(503), "unavailable")),
            Reply::ChannelLost => {
                self.ready.store(false, Ordering::SeqCst);
                Err(ScanError::backend(None, "sandbox channel closed"))
            }
        }
    }
}

struct Harness {
    controller: ScanLoopController,
    camera: Arc<FakeCamera>,
    adapter: Arc<FakeAdapter>,
    events: broadcast::Receiver<ScanEvent>,
}

fn scan_config() -> ScanConfig {
    ScanConfig {
        auto_start: false,
        stop_grace_ms: 100,
        ..ScanConfig::default()
    }
}

fn harness(camera: FakeCamera, adapter: FakeAdapter, config: ScanConfig) -> Harness {
    let camera = Arc::new(camera);
    let adapter = Arc::new(adapter);
    let event_bus = EventBus::new(256);
    let events = event_bus.subscribe();
    let preprocess = PreprocessConfig {
        width: 4,
        height: 4,
        ..PreprocessConfig::default()
    };

    let controller = ScanLoopController::new(
        Arc::clone(&camera) as Arc<dyn ImageCapture>,
        Arc::clone(&adapter) as Arc<dyn InferenceAdapter>,
        FramePreprocessor::new(&preprocess),
        ResultInterpreter::new(0.3),
        config,
        event_bus,
    );

    Harness {
        controller,
        camera,
        adapter,
        events,
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ScanEvent>, matches: F) -> ScanEvent
where
    F: Fn(&ScanEvent) -> bool,
{
    timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("expected event was not published")
}

fn is_running(event: &ScanEvent) -> bool {
    matches!(
        event,
        ScanEvent::LoopStateChanged {
            to: ScanState::Running,
            ..
        }
    )
}

#[tokio::test]
async fn test_start_refused_when_backend_not_ready() {
    let mut h = harness(FakeCamera::default(), FakeAdapter::new(false), scan_config());

    assert!(!h.controller.initialize_backend().await);
    assert!(!h.controller.is_backend_ready());
    assert!(matches!(
        wait_for(&mut h.events, |e| matches!(e, ScanEvent::BackendUnavailable { .. })).await,
        ScanEvent::BackendUnavailable { .. }
    ));

    assert!(matches!(
        h.controller.start().await,
        Err(ScanError::BackendNotReady)
    ));
    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::BackendNotReady)
    ));
    assert_eq!(h.controller.state(), ScanState::Idle);
    assert_eq!(h.adapter.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_loop_runs_first_cycle_then_reaches_running() {
    let mut h = harness(FakeCamera::default(), FakeAdapter::new(true), scan_config());
    assert!(h.controller.initialize_backend().await);

    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), ScanState::Starting);
    assert!(h.controller.session().session_id.is_some());

    let event = wait_for(&mut h.events, |e| {
        matches!(e, ScanEvent::PredictionReady { .. })
    })
    .await;
    if let ScanEvent::PredictionReady { prediction, .. } = event {
        assert_eq!(prediction.label, WasteLabel::Biodegradable);
        assert!((prediction.confidence - 0.92).abs() < 1e-6);
    }
    wait_for(&mut h.events, is_running).await;
    assert_eq!(h.controller.state(), ScanState::Running);

    let session = h.controller.session();
    assert!(session.is_running);
    assert_eq!(
        session.last_prediction.map(|p| p.class_name()),
        Some("biodegradable")
    );

    assert!(matches!(
        h.controller.start().await,
        Err(ScanError::InvalidState {
            operation: "start",
            ..
        })
    ));

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), ScanState::Idle);
    assert!(h.controller.session().session_id.is_none());
    assert!(matches!(
        h.controller.stop().await,
        Err(ScanError::InvalidState {
            operation: "stop",
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cycles_are_spaced_by_interval() {
    let h = harness(FakeCamera::default(), FakeAdapter::new(true), scan_config());
    h.controller.initialize_backend().await;
    h.controller.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.adapter.calls(), 1);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.adapter.calls(), 2);

    h.controller.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.adapter.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_cycle_refused_while_one_in_flight() {
    let (camera, gate) = FakeCamera::gated();
    let entered = Arc::clone(&camera.entered);
    let mut h = harness(camera, FakeAdapter::new(true), scan_config());
    h.controller.initialize_backend().await;

    h.controller.start().await.unwrap();
    entered.notified().await;
    assert!(h.controller.is_in_flight());

    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::CycleInFlight)
    ));

    gate.notify_one();
    wait_for(&mut h.events, |e| {
        matches!(e, ScanEvent::PredictionReady { .. })
    })
    .await;
    assert_eq!(h.camera.frame_count(), 1);

    h.controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_cycle_discards_result() {
    let (camera, gate) = FakeCamera::gated();
    let entered = Arc::clone(&camera.entered);
    let mut h = harness(camera, FakeAdapter::new(true), scan_config());
    h.controller.initialize_backend().await;

    h.controller.start().await.unwrap();
    entered.notified().await;

    // Grace period elapses with the capture still blocked
    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), ScanState::Idle);

    gate.notify_one();
    wait_for(&mut h.events, |e| {
        matches!(e, ScanEvent::ResultDiscarded { .. })
    })
    .await;

    assert!(h.controller.last_prediction().is_none());
    let stats = h.controller.session().stats;
    assert_eq!(stats.results_discarded, 1);
    assert_eq!(stats.cycles_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_cycle_within_grace() {
    let (camera, gate) = FakeCamera::gated();
    let entered = Arc::clone(&camera.entered);
    let config = ScanConfig {
        stop_grace_ms: 5_000,
        ..scan_config()
    };
    let h = harness(camera, FakeAdapter::new(true), config);
    h.controller.initialize_backend().await;
    h.controller.start().await.unwrap();
    entered.notified().await;

    let controller = h.controller.clone();
    let stopping = tokio::spawn(async move { controller.stop().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.controller.state(), ScanState::Stopping);

    gate.notify_one();
    stopping.await.unwrap().unwrap();

    assert_eq!(h.controller.state(), ScanState::Idle);
    assert!(h.controller.last_prediction().is_none());
    assert_eq!(h.controller.session().stats.results_discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycles_do_not_stop_loop() {
    let camera = FakeCamera::default();
    camera.fail_first.store(2, Ordering::SeqCst);
    let mut h = harness(camera, FakeAdapter::new(true), scan_config());
    h.controller.initialize_backend().await;
    h.controller.start().await.unwrap();

    let failed = wait_for(&mut h.events, |e| matches!(e, ScanEvent::CycleFailed { .. })).await;
    if let ScanEvent::CycleFailed {
        kind, recoverable, ..
    } = failed
    {
        assert_eq!(kind, "capture_failed");
        assert!(recoverable);
    }
    assert!(h.controller.last_prediction().is_none());

    wait_for(&mut h.events, |e| {
        matches!(e, ScanEvent::PredictionReady { .. })
    })
    .await;

    let session = h.controller.session();
    assert_eq!(session.state, ScanState::Running);
    assert_eq!(session.stats.cycles_failed, 2);
    assert_eq!(session.consecutive_failures, 0);
    assert!(session.last_prediction.is_some());

    h.controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_loop_halts_after_consecutive_failures() {
    let camera = FakeCamera::default();
    camera.always_fail.store(true, Ordering::SeqCst);
    let config = ScanConfig {
        max_consecutive_failures: 3,
        ..scan_config()
    };
    let mut h = harness(camera, FakeAdapter::new(true), config);
    h.controller.initialize_backend().await;
    h.controller.start().await.unwrap();

    let halted = wait_for(&mut h.events, |e| matches!(e, ScanEvent::LoopHalted { .. })).await;
    if let ScanEvent::LoopHalted { reason } = halted {
        assert!(reason.starts_with("3 consecutive failures"));
    }

    assert_eq!(h.controller.state(), ScanState::Idle);
    assert_eq!(h.controller.session().stats.cycles_failed, 3);
    assert!(matches!(
        h.controller.stop().await,
        Err(ScanError::InvalidState { .. })
    ));

    // The loop can be started again once the cause is fixed
    h.camera.always_fail.store(false, Ordering::SeqCst);
    h.controller.start().await.unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, ScanEvent::PredictionReady { .. })
    })
    .await;
    h.controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_backoff_rejects_early_retry() {
    let h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![Reply::RateLimited(Duration::from_secs(10))]),
        scan_config(),
    );
    h.controller.initialize_backend().await;

    match h.controller.scan_once().await {
        Err(ScanError::RateLimited { retry_after }) => {
            assert_eq!(retry_after, Duration::from_secs(10));
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(h.adapter.calls(), 1);

    tokio::time::advance(Duration::from_secs(4)).await;
    match h.controller.scan_once().await {
        Err(ScanError::RateLimited { retry_after }) => {
            assert_eq!(retry_after, Duration::from_secs(6));
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
    // Refused by the backoff itself, the backend was not contacted again
    assert_eq!(h.adapter.calls(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let prediction = h.controller.scan_once().await.unwrap();
    assert_eq!(prediction.label, WasteLabel::Biodegradable);
    assert_eq!(h.adapter.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_loop_waits_out_backoff() {
    let mut h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![Reply::RateLimited(Duration::from_secs(10))]),
        scan_config(),
    );
    h.controller.initialize_backend().await;
    h.controller.start().await.unwrap();

    wait_for(&mut h.events, |e| matches!(e, ScanEvent::RateLimited { .. })).await;

    // Well past the normal interval, still inside the backoff
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.adapter.calls(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.adapter.calls(), 2);
    assert!(h.controller.last_prediction().is_some());

    h.controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_loop_started_inside_backoff_waits_before_first_cycle() {
    let mut h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![Reply::RateLimited(Duration::from_secs(10))]),
        scan_config(),
    );
    h.controller.initialize_backend().await;

    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::RateLimited { .. })
    ));
    assert_eq!(h.adapter.calls(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    h.controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.adapter.calls(), 1);
    assert_eq!(h.controller.state(), ScanState::Starting);

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(h.adapter.calls(), 1);

    wait_for(&mut h.events, |e| matches!(e, ScanEvent::PredictionReady { .. })).await;
    assert_eq!(h.adapter.calls(), 2);
    wait_for(&mut h.events, is_running).await;

    h.controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_backoff_wait_skips_the_cycle() {
    let h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![Reply::RateLimited(Duration::from_secs(10))]),
        scan_config(),
    );
    h.controller.initialize_backend().await;
    let _ = h.controller.scan_once().await;

    h.controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.controller.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.adapter.calls(), 1);
    assert_eq!(h.controller.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_lost_backend_clears_readiness_until_reinitialized() {
    let mut h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![Reply::ChannelLost]),
        scan_config(),
    );
    assert!(h.controller.initialize_backend().await);
    assert!(h.controller.is_backend_ready());

    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::BackendError { status: None, .. })
    ));
    assert!(!h.controller.is_backend_ready());
    assert!(!h.controller.session().backend_ready);
    match wait_for(&mut h.events, |e| matches!(e, ScanEvent::BackendUnavailable { .. })).await {
        ScanEvent::BackendUnavailable { backend, reason } => {
            assert_eq!(backend, "fake");
            assert!(reason.contains("sandbox channel closed"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(matches!(
        h.controller.start().await,
        Err(ScanError::BackendNotReady)
    ));
    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::BackendNotReady)
    ));
    assert_eq!(h.adapter.calls(), 1);

    assert!(h.controller.initialize_backend().await);
    assert!(h.controller.is_backend_ready());
    let prediction = h.controller.scan_once().await.unwrap();
    assert_eq!(prediction.label, WasteLabel::Biodegradable);
}

#[tokio::test]
async fn test_manual_scan_interprets_scores() {
    let h = harness(
        FakeCamera::default(),
        FakeAdapter::with_replies(vec![
            Reply::Scores(vec![0.0, 0.0, 0.0]),
            Reply::Scores(vec![0.5, 0.5]),
            Reply::Unavailable,
            Reply::Scores(vec![0.3, 0.3, 0.4]),
            Reply::Scores(vec![0.2, 0.25, 0.05]),
        ]),
        scan_config(),
    );
    h.controller.initialize_backend().await;

    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::DegenerateScores { .. })
    ));
    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::ScoreCardinalityMismatch {
            expected: 3,
            actual: 2
        })
    ));
    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::BackendError {
            status: Some(503),
            ..
        })
    ));
    assert!(h.controller.last_prediction().is_none());

    let prediction = h.controller.scan_once().await.unwrap();
    assert_eq!(prediction.class_name(), "toxic");
    assert!((prediction.confidence - 0.4).abs() < 1e-6);

    // Unnormalized scores: arg-max survives normalization
    let prediction = h.controller.scan_once().await.unwrap();
    assert_eq!(prediction.label, WasteLabel::NonBiodegradable);
    assert!((prediction.confidence - 0.5).abs() < 1e-6);
    assert_eq!(
        h.controller.last_prediction().map(|p| p.label),
        Some(WasteLabel::NonBiodegradable)
    );

    let stats = h.controller.session().stats;
    assert_eq!(stats.manual_scans, 5);
    assert_eq!(stats.cycles_failed, 3);
    assert_eq!(stats.cycles_completed, 2);
}

#[tokio::test]
async fn test_degenerate_frame_never_reaches_backend() {
    let camera = FakeCamera::default();
    camera.degenerate.store(true, Ordering::SeqCst);
    let h = harness(camera, FakeAdapter::new(true), scan_config());
    h.controller.initialize_backend().await;

    assert!(matches!(
        h.controller.scan_once().await,
        Err(ScanError::InvalidFrame { .. })
    ));
    assert_eq!(h.adapter.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_start_after_settling_delay() {
    let config = ScanConfig {
        auto_start: true,
        auto_start_delay_ms: 1_000,
        ..scan_config()
    };
    let mut h = harness(FakeCamera::default(), FakeAdapter::new(true), config);

    assert!(h.controller.initialize_backend().await);
    assert_eq!(h.controller.state(), ScanState::Idle);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.controller.state(), ScanState::Idle);

    wait_for(&mut h.events, is_running).await;
    h.controller.shutdown().await;
    assert_eq!(h.controller.state(), ScanState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_auto_start() {
    let config = ScanConfig {
        auto_start: true,
        ..scan_config()
    };
    let h = harness(FakeCamera::default(), FakeAdapter::new(true), config);

    assert!(h.controller.initialize_backend().await);
    h.controller.shutdown().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.controller.state(), ScanState::Idle);
    assert_eq!(h.adapter.calls(), 0);
}
