//! Worker lifecycle and the runtime-facing entry points

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use adblink_broker::config::RetryConfig;
use adblink_broker::{initialize, DdmCallback, DebuggerController, SendOutcome};
use adblink_utils::AdblinkError;

use common::{handshake, read_packet, test_config, wait_for, FakeBridge, Harness};

#[test]
fn test_stop_joins_blocked_worker() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    broker.start().unwrap();
    assert!(wait_for(|| harness.bridge.is_registered()));

    let started = Instant::now();
    broker.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!broker.is_running());

    // Second stop is a no-op
    broker.stop();
}

#[test]
fn test_stop_interrupts_registration_backoff() {
    let harness = Harness::with(
        FakeBridge::failing(usize::MAX),
        Default::default(),
        Default::default(),
    );
    let mut config = test_config();
    config.retry = RetryConfig {
        initial_delay_ms: 5_000,
        max_delay_ms: 5_000,
    };
    let broker = initialize(config, harness.collaborators()).unwrap();
    broker.start().unwrap();
    assert!(wait_for(|| harness.bridge.connects.load(Ordering::SeqCst) == 1));

    let started = Instant::now();
    broker.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(harness.bridge.connects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_without_start_is_noop() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    broker.stop();
    assert!(!broker.is_running());
    assert_eq!(broker.publish_chunk(1, b"x"), SendOutcome::Dropped);
}

#[test]
fn test_start_twice_is_rejected() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    broker.start().unwrap();
    assert!(matches!(broker.start(), Err(AdblinkError::AlreadyStarted)));
    broker.stop();
}

#[test]
fn test_restart_after_stop() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    broker.start().unwrap();
    assert!(wait_for(|| harness.bridge.is_registered()));
    broker.stop();

    broker.start().unwrap();
    assert!(wait_for(|| harness.bridge.registrations.load(Ordering::SeqCst) == 2));
    let mut debugger = harness.bridge.forward_debugger();
    handshake(&mut debugger);
    broker.stop();
}

#[test]
fn test_registers_after_connect_failures() {
    let harness = Harness::with(
        FakeBridge::failing(3),
        Default::default(),
        Default::default(),
    );
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    broker.start().unwrap();

    assert!(wait_for(|| harness.bridge.is_registered()));
    assert_eq!(harness.bridge.connects.load(Ordering::SeqCst), 4);

    let info = harness.bridge.last_info.lock().clone().unwrap();
    assert_eq!(info.pid, std::process::id());
    assert!(info.debuggable);
    assert!(!info.profileable);
    assert_eq!(info.architecture, std::env::consts::ARCH);
    broker.stop();
}

#[test]
fn test_profileable_process_reregisters_on_bridge_activity() {
    let harness = Harness::new();
    let mut config = test_config();
    config.process.debuggable = false;
    config.process.profileable = true;
    let broker = initialize(config, harness.collaborators()).unwrap();
    let controller = DebuggerController::new(broker.clone());

    controller.start_debugger();
    assert!(wait_for(|| harness.bridge.is_registered()));
    assert_eq!(harness.bridge.connects.load(Ordering::SeqCst), 1);

    harness.bridge.poke();
    assert!(wait_for(|| harness.bridge.connects.load(Ordering::SeqCst) == 2));
    assert_eq!(harness.attacher.count(), 0);
    controller.stop_debugger();
}

#[test]
fn test_controller_refuses_undebuggable_process() {
    let harness = Harness::new();
    let mut config = test_config();
    config.process.debuggable = false;
    let broker = initialize(config, harness.collaborators()).unwrap();
    let controller = DebuggerController::new(broker.clone());

    controller.start_debugger();
    assert!(!broker.is_running());
    assert!(!controller.is_debugger_configured());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.bridge.connects.load(Ordering::SeqCst), 0);
}

#[test]
fn test_debugger_configured_needs_options() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    assert!(!DebuggerController::new(broker).is_debugger_configured());

    let mut config = test_config();
    config.jdwp_options = "logfile=jdwp.log".into();
    let broker = initialize(config, harness.collaborators()).unwrap();
    assert!(DebuggerController::new(broker).is_debugger_configured());
}

#[test]
fn test_initialize_rejects_unsupported_options() {
    let harness = Harness::new();
    let mut config = test_config();
    config.jdwp_options = "server=n,suspend=y".into();

    let err = initialize(config, harness.collaborators()).unwrap_err();
    assert!(matches!(err, AdblinkError::InvalidAgentOptions(_)));
}

#[test]
fn test_ddm_callback_publishes_through_broker() {
    let harness = Harness::new();
    let broker = initialize(test_config(), harness.collaborators()).unwrap();
    let controller = DebuggerController::new(broker.clone());
    let callback = DdmCallback::new(broker.clone());

    controller.start_debugger();
    assert!(wait_for(|| harness.bridge.is_registered()));
    let mut debugger = harness.bridge.forward_debugger();
    handshake(&mut debugger);
    assert!(wait_for(
        || broker.publish_chunk(0x5448_4452, b"") == SendOutcome::Sent
    ));

    callback.ddm_publish_chunk(0x5448_4452, b"abc");
    // The empty chunk from the readiness wait arrives first
    let first = read_packet(&mut debugger);
    assert_eq!(first.ddm_chunk().unwrap().1, b"");
    let packet = read_packet(&mut debugger);
    let (sub, payload) = packet.ddm_chunk().unwrap();
    assert_eq!(sub.chunk_type, 0x5448_4452);
    assert_eq!(payload, b"abc");
    controller.stop_debugger();
}
