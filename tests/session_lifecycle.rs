//! End-to-end tests over the `LifecycleController` Session API.
//!
//! The upstream trader-data endpoint is deliberately pointed at a closed
//! loopback port so every test exercises the synthetic-population fallback
//! (§1 puts the live query out of scope) instead of depending on network
//! access.

use marketsim_engine::config::EngineConfig;
use marketsim_engine::error::EngineError;
use marketsim_engine::external_orders::ThroughputMode;
use marketsim_engine::lifecycle::{CreateSessionParams, LifecycleController};
use marketsim_engine::provider::SYNTHETIC_POPULATION_SIZE;
use marketsim_engine::session::SessionState;
use std::time::Duration;
use uuid::Uuid;

const DEAD_ENDPOINT: &str = "http://127.0.0.1:1/top-traders";

fn test_controller() -> std::sync::Arc<LifecycleController> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.trader_cache_dir = dir.path().to_string_lossy().into_owned();
    // Leak the tempdir so the cache directory outlives the controller; each
    // test gets its own controller and process teardown reclaims the disk.
    std::mem::forget(dir);
    LifecycleController::new(config, DEAD_ENDPOINT)
}

#[tokio::test]
async fn cold_start_creates_idle_session_with_synthetic_population() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    let snapshot = controller.get_session(id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.trader_count, SYNTHETIC_POPULATION_SIZE);
    assert_eq!(snapshot.total_trades_processed, 0);
}

#[tokio::test]
async fn unknown_session_id_returns_not_found() {
    let controller = test_controller();
    let err = controller.get_session(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn single_session_lock_rejects_a_second_concurrent_session() {
    let controller = test_controller();
    let _first = controller.create_session(CreateSessionParams::default()).await.unwrap();

    let err = controller.create_session(CreateSessionParams::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::SingleSessionLock(_)));
}

#[tokio::test]
async fn deleting_a_session_releases_the_single_session_lock() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();
    controller.delete_session(id).await.unwrap();

    let second = controller.create_session(CreateSessionParams::default()).await;
    assert!(second.is_ok());

    assert!(matches!(controller.get_session(id).await.unwrap_err(), EngineError::NotFound(_)));
}

#[tokio::test]
async fn start_pause_resume_round_trip() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    assert_eq!(controller.start_session(id).await.unwrap(), SessionState::Running);
    assert_eq!(controller.pause_session(id).await.unwrap(), SessionState::Paused);
    assert_eq!(controller.resume_session(id).await.unwrap(), SessionState::Running);

    controller.pause_session(id).await.unwrap();
    controller.delete_session(id).await.unwrap();
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    // Idle session cannot be paused or resumed.
    assert!(matches!(controller.pause_session(id).await.unwrap_err(), EngineError::InvalidTransition(_)));
    assert!(matches!(controller.resume_session(id).await.unwrap_err(), EngineError::InvalidTransition(_)));

    controller.start_session(id).await.unwrap();
    // Already running: starting again, or resuming, must fail.
    assert!(matches!(controller.start_session(id).await.unwrap_err(), EngineError::InvalidTransition(_)));
    assert!(matches!(controller.resume_session(id).await.unwrap_err(), EngineError::InvalidTransition(_)));

    controller.pause_session(id).await.unwrap();
    controller.delete_session(id).await.unwrap();
}

#[tokio::test]
async fn reset_returns_to_idle_and_zeroes_the_trade_counter() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    controller.start_session(id).await.unwrap();
    // A handful of tick periods (50ms default) is enough for the trader
    // population to generate at least some fills.
    tokio::time::sleep(Duration::from_millis(400)).await;
    controller.pause_session(id).await.unwrap();

    let state = controller.reset_session(id).await.unwrap();
    assert_eq!(state, SessionState::Idle);

    let snapshot = controller.get_session(id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.total_trades_processed, 0);
}

#[tokio::test]
async fn liquidation_cascade_requires_stress_or_hft_throughput() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    let err = controller.trigger_liquidation_cascade(id).await.unwrap_err();
    assert!(matches!(err, EngineError::WrongMode(ThroughputMode::Normal)));

    let (previous, snapshot) = controller.set_throughput_mode(id, "stress").await.unwrap();
    assert_eq!(previous, ThroughputMode::Normal);
    assert!(snapshot.configured_tps > 0.0);

    let (generated, estimated_impact, cascade_size) = controller.trigger_liquidation_cascade(id).await.unwrap();
    assert_eq!(generated, cascade_size);
    assert!((10..=30).contains(&generated));
    assert!(estimated_impact >= 0.0);
}

#[tokio::test]
async fn unknown_throughput_mode_name_is_rejected() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    let err = controller.set_throughput_mode(id, "ludicrous").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownThroughputMode(_)));
}

#[tokio::test]
async fn speed_must_stay_within_the_supported_range() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();

    assert!(matches!(controller.set_speed(id, 0).await.unwrap_err(), EngineError::InvalidSpeed(0)));
    assert!(matches!(controller.set_speed(id, 500).await.unwrap_err(), EngineError::InvalidSpeed(500)));
    assert_eq!(controller.set_speed(id, 10).await.unwrap(), 10);
}

#[tokio::test]
async fn subscribers_receive_a_status_event_on_start() {
    let controller = test_controller();
    let id = controller.create_session(CreateSessionParams::default()).await.unwrap();
    let mut rx = controller.subscribe(id).unwrap();

    controller.start_session(id).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("status event within timeout")
        .unwrap();

    match event {
        marketsim_engine::events::StreamEvent::SimulationStatus { session_id, state, .. } => {
            assert_eq!(session_id, id);
            assert_eq!(state, "Running");
        }
        other => panic!("expected SimulationStatus, got {other:?}"),
    }

    controller.pause_session(id).await.unwrap();
    controller.delete_session(id).await.unwrap();
}
