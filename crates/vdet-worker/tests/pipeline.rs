//! End-to-end session behavior with fake sources and detectors and a mock
//! webhook endpoint.

mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{car, person, pipeline_config, wait_until, FakeSources, ScriptedBackend};
use tokio::runtime::Handle;
use vdet_models::{
    DetectionEvent, PipelineConfig, Polygon, QueuePolicy, SessionState, StreamConfig,
};
use vdet_webhook::WebhookDispatcher;
use vdet_worker::{PipelineError, PipelineRuntime, PoolCell, SessionFailure};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

fn runtime(
    config: PipelineConfig,
    backend: ScriptedBackend,
    sources: FakeSources,
) -> (PipelineRuntime, Arc<WebhookDispatcher>) {
    let dispatcher =
        Arc::new(WebhookDispatcher::start(&config.webhook, &Handle::current()).unwrap());
    let runtime = PipelineRuntime::new(config, Arc::clone(&dispatcher))
        .with_backend(Arc::new(backend))
        .with_source_provider(Arc::new(sources))
        .with_pool_cell(Arc::new(PoolCell::new()));
    (runtime, dispatcher)
}

fn gate_stream() -> StreamConfig {
    StreamConfig::new("gate", "rtsp://10.0.0.5/stream1", "yolo")
}

async fn accepting_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_source_fails_without_jobs() {
    let server = accepting_server().await;
    let sources = FakeSources::unreachable();
    let open_attempts = Arc::clone(&sources.open_attempts);
    let (runtime, dispatcher) = runtime(
        pipeline_config(&format!("{}/hook", server.uri())),
        ScriptedBackend::new(vec![person(0.1, 0.1)]),
        sources,
    );

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || runtime.state(&handle) == Some(SessionState::Failed)));

    match runtime.failure(&handle) {
        Some(SessionFailure::SourceUnavailable(msg)) => assert!(msg.contains("connection refused")),
        other => panic!("unexpected failure: {:?}", other),
    }
    // First open plus two reconnect attempts
    assert_eq!(open_attempts.load(Ordering::SeqCst), 3);

    let stats = runtime.stats();
    assert_eq!(stats.pool.map(|p| p.submitted), Some(0));
    assert_eq!(stats.sessions[0].stats.jobs_accepted, 0);
    assert_eq!(stats.sessions[0].stats.frames_pulled, 0);

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_only_allowed_detections_in_regions_are_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Only the first frame contains objects: a person inside the region and a
    // car outside it
    let backend = ScriptedBackend::new(vec![person(0.1, 0.1), car(0.7, 0.7)]).only_on(0);
    let (runtime, dispatcher) = runtime(
        pipeline_config(&format!("{}/hook", server.uri())),
        backend,
        FakeSources::live(Duration::from_millis(5)),
    );

    let stream = gate_stream()
        .with_regions(vec![Polygon::rect(0.0, 0.0, 0.5, 0.5)])
        .with_classes(["person"]);
    let handle = runtime.start(&stream).unwrap();

    assert!(wait_until(WAIT, || dispatcher.stats().delivered == 1));
    assert!(wait_until(WAIT, || {
        runtime.sessions()[0].stats.frames_pulled >= 20
    }));
    runtime.stop(&handle).unwrap();
    assert_eq!(runtime.state(&handle), Some(SessionState::Stopped));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let event: DetectionEvent = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(event.stream_id, "gate");
    assert_eq!(event.sequence, 0);
    assert_eq!(event.model, "yolo");
    assert_eq!(event.detections.len(), 1);
    assert_eq!(event.detections[0].label, "person");

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refused_webhook_does_not_stop_ingestion() {
    // Reserve a port, then release it so connections are refused
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (runtime, dispatcher) = runtime(
        pipeline_config(&format!("http://127.0.0.1:{}/hook", port)),
        ScriptedBackend::new(vec![person(0.1, 0.1)]),
        FakeSources::live(Duration::from_millis(10)),
    );

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || dispatcher.stats().failed >= 3));
    assert!(wait_until(WAIT, || {
        runtime.sessions()[0].stats.frames_pulled >= 30
    }));

    assert_eq!(runtime.state(&handle), Some(SessionState::Running));
    assert!(runtime.failure(&handle).is_none());

    let webhook = dispatcher.stats();
    assert_eq!(webhook.delivered, 0);
    // Each failed event used its whole budget: one attempt plus two retries
    assert!(webhook.attempts >= webhook.failed * 3);

    // Still pulling frames
    let pulled = runtime.sessions()[0].stats.frames_pulled;
    assert!(wait_until(WAIT, || runtime.sessions()[0].stats.frames_pulled > pulled));

    runtime.stop(&handle).unwrap();
    assert_eq!(runtime.state(&handle), Some(SessionState::Stopped));
    assert!(runtime.failure(&handle).is_none());

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_bounded_and_final() {
    let server = accepting_server().await;
    let config = pipeline_config(&format!("{}/hook", server.uri()));
    let grace = config.session.stop_grace();
    let (runtime, dispatcher) = runtime(
        config,
        ScriptedBackend::new(vec![person(0.1, 0.1)]),
        FakeSources::live(Duration::from_millis(5)),
    );

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || dispatcher.stats().delivered >= 3));

    let started = Instant::now();
    runtime.stop(&handle).unwrap();
    assert!(started.elapsed() <= grace + Duration::from_millis(200));
    assert_eq!(runtime.state(&handle), Some(SessionState::Stopped));

    // Let a request already on the wire land, then nothing else may arrive
    thread::sleep(Duration::from_millis(100));
    let delivered = server.received_requests().await.unwrap().len();
    let pulled = runtime.sessions()[0].stats.frames_pulled;
    thread::sleep(Duration::from_millis(300));
    assert_eq!(server.received_requests().await.unwrap().len(), delivered);
    assert_eq!(runtime.sessions()[0].stats.frames_pulled, pulled);

    // Stopping again is a no-op
    runtime.stop(&handle).unwrap();
    assert_eq!(runtime.state(&handle), Some(SessionState::Stopped));

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_releases_submitter_blocked_on_full_queue() {
    let server = accepting_server().await;
    let mut config = pipeline_config(&format!("{}/hook", server.uri()));
    config.pool.worker_threads = 1;
    config.pool.queue_capacity = 1;
    config.pool.queue_policy = QueuePolicy::Block;
    config.session.stop_grace_ms = 200;
    let grace = config.session.stop_grace();

    // Inference hangs until the gate opens, so the queue stays full
    let gate = Arc::new(AtomicBool::new(false));
    let backend = ScriptedBackend::new(vec![person(0.1, 0.1)]).gated(Arc::clone(&gate));
    let (runtime, dispatcher) = runtime(config, backend, FakeSources::live(Duration::from_millis(5)));

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || runtime.sessions()[0].stats.jobs_accepted >= 2));
    // Let the pull thread run into the full queue
    thread::sleep(Duration::from_millis(100));
    assert_eq!(runtime.sessions()[0].stats.jobs_accepted, 2);

    let started = Instant::now();
    runtime.stop(&handle).unwrap();
    assert!(started.elapsed() <= grace + Duration::from_millis(200));
    assert_eq!(runtime.state(&handle), Some(SessionState::Stopped));
    assert_eq!(runtime.stats().pool.map(|p| p.cancelled), Some(1));

    // Freeing the queue must not let anything else in
    let accepted = runtime.sessions()[0].stats.jobs_accepted;
    gate.store(true, Ordering::Release);
    thread::sleep(Duration::from_millis(200));
    let stats = runtime.sessions()[0].stats;
    assert_eq!(stats.jobs_accepted, accepted);
    assert_eq!(runtime.stats().pool.map(|p| p.accepted), Some(2));

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
    // Results of the two jobs finished after stop are not delivered
    assert!(server.received_requests().await.unwrap().is_empty());
}

/// Sequences of every event the server received, in arrival order.
async fn received_sequences(server: &MockServer) -> Vec<u64> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| serde_json::from_slice::<DetectionEvent>(&request.body).unwrap().sequence)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_arrive_in_frame_order_across_workers() {
    let server = accepting_server().await;
    let mut config = pipeline_config(&format!("{}/hook", server.uri()));
    config.pool.worker_threads = 3;
    config.session.reorder_window = 8;

    // Even frames take longer, so workers finish out of order
    let backend = ScriptedBackend::new(vec![person(0.1, 0.1)]).slow_on_even(Duration::from_millis(30));
    let calls = Arc::clone(&backend.calls);
    let (runtime, dispatcher) = runtime(config, backend, FakeSources::live(Duration::from_millis(10)));

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || dispatcher.stats().delivered >= 10));
    runtime.stop(&handle).unwrap();
    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;

    assert!(calls.load(Ordering::SeqCst) >= 10);
    let sequences = received_sequences(&server).await;
    assert!(sequences.len() >= 10);
    assert!(
        sequences.windows(2).all(|pair| pair[0] < pair[1]),
        "out of order: {:?}",
        sequences
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_results_behind_a_given_up_gap_are_dropped_as_late() {
    let server = accepting_server().await;
    let mut config = pipeline_config(&format!("{}/hook", server.uri()));
    config.pool.worker_threads = 3;
    config.session.reorder_window = 1;

    let backend = ScriptedBackend::new(vec![person(0.1, 0.1)]).slow_on_even(Duration::from_millis(150));
    let (runtime, dispatcher) = runtime(config, backend, FakeSources::live(Duration::from_millis(20)));

    let handle = runtime.start(&gate_stream()).unwrap();
    assert!(wait_until(WAIT, || runtime.sessions()[0].stats.results_late >= 1));
    assert!(wait_until(WAIT, || dispatcher.stats().delivered >= 3));
    runtime.stop(&handle).unwrap();
    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;

    // Whatever was delivered still went out in frame order
    let sequences = received_sequences(&server).await;
    assert!(!sequences.is_empty());
    assert!(
        sequences.windows(2).all(|pair| pair[0] < pair[1]),
        "out of order: {:?}",
        sequences
    );
    let stats = runtime.sessions()[0].stats;
    assert!(stats.results_discarded >= stats.results_late);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_active_session_per_stream() {
    let server = accepting_server().await;
    let (runtime, dispatcher) = runtime(
        pipeline_config(&format!("{}/hook", server.uri())),
        ScriptedBackend::new(Vec::new()),
        FakeSources::live(Duration::from_millis(5)),
    );

    let first = runtime.start(&gate_stream()).unwrap();
    match runtime.start(&gate_stream()) {
        Err(PipelineError::SessionExists(stream_id)) => assert_eq!(stream_id, "gate"),
        other => panic!("unexpected result: {:?}", other),
    }

    runtime.stop(&first).unwrap();
    let second = runtime.start(&gate_stream()).unwrap();
    assert_ne!(first, second);
    assert!(wait_until(WAIT, || runtime.state(&second) == Some(SessionState::Running)));

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_model_is_rejected_before_start() {
    let server = accepting_server().await;
    let (runtime, dispatcher) = runtime(
        pipeline_config(&format!("{}/hook", server.uri())),
        ScriptedBackend::new(Vec::new()),
        FakeSources::live(Duration::from_millis(5)),
    );

    let stream = StreamConfig::new("gate", "rtsp://10.0.0.5/stream1", "missing");
    assert!(matches!(runtime.start(&stream), Err(PipelineError::Config(_))));
    assert!(runtime.sessions().is_empty());

    runtime.shutdown();
    dispatcher.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_starts_share_one_pool() {
    let server = accepting_server().await;
    let mut backend = ScriptedBackend::new(Vec::new());
    backend.shared = false;
    backend.load_delay = Duration::from_millis(50);
    let loads = Arc::clone(&backend.loads);

    let config = pipeline_config(&format!("{}/hook", server.uri()));
    let workers = config.pool.worker_threads;
    let (runtime, dispatcher) = runtime(config, backend, FakeSources::live(Duration::from_millis(5)));

    thread::scope(|scope| {
        for i in 0..4 {
            let runtime = &runtime;
            scope.spawn(move || {
                let stream = StreamConfig::new(format!("cam-{}", i), format!("rtsp://10.0.0.{}/live", i), "yolo");
                runtime.start(&stream).unwrap();
            });
        }
    });

    // One private handle per worker, loaded exactly once
    assert_eq!(loads.load(Ordering::SeqCst), workers);
    assert_eq!(runtime.sessions().len(), 4);

    let stats = runtime.shutdown();
    assert!(stats.sessions.iter().all(|s| s.state == SessionState::Stopped));
    assert!(matches!(runtime.start(&gate_stream()), Err(PipelineError::ShuttingDown)));

    dispatcher.shutdown(Duration::from_secs(1)).await;
}
