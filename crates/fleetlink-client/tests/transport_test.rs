//! Transport behaviour against the simulated server.
//!
//! Runs on a paused clock: backoff and liveness waits complete instantly
//! while keeping their order.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fleetlink_client::{Handler, Transport, TransportConfig, Upload, shutdown_channel};
use fleetlink_core::{ExchangeMode, LivenessConfig, RotationConfig, TransportError};
use fleetlink_crypto::{CryptoConfig, CryptoManager, InMemoryResolver};
use fleetlink_harness::{SimEnv, SimServer, test_key};
use fleetlink_proto::{Compression, Message, MessageList, MessagePayload};

const PRIMARY: &str = "sim://primary";

fn config(urls: &[&str]) -> TransportConfig {
    TransportConfig {
        server_urls: urls.iter().map(ToString::to_string).collect(),
        rotation: RotationConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            retries_per_url: 2,
            cycle_wait: Duration::from_millis(20),
            cycle_jitter: Duration::ZERO,
        },
        liveness: LivenessConfig { ping_wait: Duration::from_millis(50) },
        duplex_fallback_after: 2,
        ..TransportConfig::default()
    }
}

fn endpoint_crypto() -> Arc<CryptoManager<SimEnv>> {
    Arc::new(CryptoManager::new(
        SimEnv::with_seed(1),
        test_key(0),
        Arc::new(InMemoryResolver::new()),
        CryptoConfig::default(),
    ))
}

fn transport(server: &SimServer, handler: Handler, config: &TransportConfig) -> Transport<SimEnv, SimServer> {
    Transport::new(SimEnv::with_seed(2), Arc::new(server.clone()), endpoint_crypto(), handler, config).unwrap()
}

fn server() -> SimServer {
    SimServer::new(SimEnv::with_seed(3), test_key(1))
}

fn log_upload(request_id: u64) -> Upload {
    let record = MessageList::single(Message {
        session_id: "F.1".to_string(),
        request_id,
        source: test_key(0).identity().to_string(),
        urgent: false,
        payload: MessagePayload::Log { level: "INFO".to_string(), message: format!("line {request_id}") },
    })
    .encode_record()
    .unwrap();
    Upload { chunks: vec![Bytes::from(record)], compression: Compression::None, urgent: false }
}

#[tokio::test(start_paused = true)]
async fn delivers_and_fetches_server_key_once() {
    let server = server();
    server.trust(&test_key(0));
    let mut transport = transport(&server, Handler::Control, &config(&[PRIMARY]));
    let (_trigger, mut shutdown) = shutdown_channel();

    assert!(transport.exchange(&log_upload(1), &mut shutdown).await.unwrap().is_empty());
    assert!(transport.exchange(&log_upload(2), &mut shutdown).await.unwrap().is_empty());

    let ids: Vec<u64> = server.received().iter().map(|m| m.request_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(server.key_fetches(), 1);
    assert_eq!(transport.server_identity(), Some(server.identity()));
}

#[tokio::test(start_paused = true)]
async fn unknown_endpoint_must_enrol() {
    let server = server();
    let mut transport = transport(&server, Handler::Control, &config(&[PRIMARY]));
    let (_trigger, mut shutdown) = shutdown_channel();

    let err = transport.exchange(&log_upload(1), &mut shutdown).await.unwrap_err();
    assert_eq!(err, TransportError::EnrolmentRequired);
    assert!(server.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn redirect_target_is_kept() {
    let server = server();
    server.trust(&test_key(0));
    server.redirect_once("sim://mirror");
    let mut transport = transport(&server, Handler::Control, &config(&[PRIMARY]));
    let (_trigger, mut shutdown) = shutdown_channel();

    transport.exchange(&log_upload(1), &mut shutdown).await.unwrap();
    transport.exchange(&log_upload(2), &mut shutdown).await.unwrap();

    assert_eq!(server.post_urls(), vec![PRIMARY, "sim://mirror", "sim://mirror"]);
    assert_eq!(transport.current_url(), "sim://mirror");
    assert_eq!(server.key_fetches(), 2, "key is fetched again from the new frontend");
    assert_eq!(server.received().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn pinned_identity_mismatch_is_refused() {
    let server = server();
    server.trust(&test_key(0));
    let mut config = config(&[PRIMARY]);
    config.pinned_server_name = Some(test_key(3).identity().to_string());
    let mut transport = transport(&server, Handler::Control, &config);
    let (_trigger, mut shutdown) = shutdown_channel();

    for _ in 0..2 {
        let err = transport.exchange(&log_upload(1), &mut shutdown).await.unwrap_err();
        assert!(matches!(err, TransportError::ServerIdentityMismatch { .. }), "{err:?}");
    }
    assert!(transport.server_identity().is_none());
    assert_eq!(server.key_fetches(), 2, "key is fetched again after every failure");
    assert_eq!(server.posts(), 0);
}

#[tokio::test(start_paused = true)]
async fn outage_advances_to_next_server() {
    let server = server();
    server.trust(&test_key(0));
    server.set_offline(true);
    let mut transport = transport(&server, Handler::Control, &config(&["sim://a", "sim://b"]));
    let (_trigger, mut shutdown) = shutdown_channel();

    let first = transport.current_url().to_string();
    for _ in 0..2 {
        let err = transport.exchange(&log_upload(1), &mut shutdown).await.unwrap_err();
        assert!(err.is_transient());
    }
    assert_ne!(transport.current_url(), first);

    server.set_offline(false);
    transport.exchange(&log_upload(1), &mut shutdown).await.unwrap();
    assert_eq!(server.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_backoff() {
    let server = server();
    server.set_offline(true);
    let mut config = config(&[PRIMARY]);
    config.rotation.retries_per_url = 1;
    config.rotation.cycle_wait = Duration::from_secs(3600);
    let mut transport = transport(&server, Handler::Control, &config);
    let (trigger, mut shutdown) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();
    });

    let start = tokio::time::Instant::now();
    let err = transport.exchange(&log_upload(1), &mut shutdown).await.unwrap_err();
    assert_eq!(err, TransportError::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn reader_returns_queued_requests() {
    let server = server();
    server.trust(&test_key(0));
    let request = Message {
        session_id: "F.9".to_string(),
        request_id: 4,
        source: server.identity().to_string(),
        urgent: false,
        payload: MessagePayload::Request { name: "processes".to_string(), query: "SELECT *".to_string() },
    };
    server.push_request(test_key(0).identity(), request.clone());
    let mut transport = transport(&server, Handler::Reader, &config(&[PRIMARY]));
    let (_trigger, mut shutdown) = shutdown_channel();

    let poll = Upload::default();
    assert_eq!(transport.exchange(&poll, &mut shutdown).await.unwrap(), vec![request]);
    assert!(transport.exchange(&poll, &mut shutdown).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn healthy_duplex_channel_is_reused() {
    let server = server();
    server.trust(&test_key(0));
    let mut config = config(&[PRIMARY]);
    config.exchange_mode = ExchangeMode::Duplex;
    let mut transport = transport(&server, Handler::Control, &config);
    let (_trigger, mut shutdown) = shutdown_channel();

    for id in 0..3 {
        transport.exchange(&log_upload(id), &mut shutdown).await.unwrap();
    }
    assert_eq!(server.duplex_opens(), 1);
    assert_eq!(server.posts(), 0);
    assert_eq!(server.received().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn silent_duplex_falls_back_to_request_response() {
    let server = server();
    server.trust(&test_key(0));
    server.set_silent_duplex(true);
    let mut config = config(&[PRIMARY]);
    config.exchange_mode = ExchangeMode::Duplex;
    let mut transport = transport(&server, Handler::Control, &config);
    let (_trigger, mut shutdown) = shutdown_channel();

    for _ in 0..2 {
        let err = transport.exchange(&log_upload(1), &mut shutdown).await.unwrap_err();
        assert!(matches!(err, TransportError::LivenessLost { .. }), "{err:?}");
    }
    transport.exchange(&log_upload(1), &mut shutdown).await.unwrap();

    assert_eq!(server.duplex_opens(), 2);
    assert_eq!(server.posts(), 1);
    assert_eq!(server.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exchange_runs_on_a_spawned_task() {
    let server = server();
    server.trust(&test_key(0));
    let mut config = config(&[PRIMARY]);
    config.exchange_mode = ExchangeMode::Duplex;
    let mut transport = transport(&server, Handler::Control, &config);
    let (_trigger, mut shutdown) = shutdown_channel();

    let delivered = tokio::spawn(async move {
        for id in 0..2 {
            transport.exchange(&log_upload(id), &mut shutdown).await?;
        }
        Ok::<_, TransportError>(transport.current_url().to_string())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(delivered, PRIMARY);
    assert_eq!(server.received().len(), 2);
}
