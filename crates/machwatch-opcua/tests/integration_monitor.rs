// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Machine Monitor Integration Tests
//!
//! Drives a `MachineMonitor` over the simulated transport:
//!
//! - `test_transition_*`: state transition detection
//! - `test_trigger_*`: video trigger fan-out and enrichment
//! - `test_status_*`: status and statistics queries

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use machwatch_opcua::{trigger_fn, EventKind, MachineState, MonitorConfig, TriggerKind, Variant};

use common::{settle, MachineFixture};

// =============================================================================
// Transition Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transition_state_changed_then_equipment_stop() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.set_state(MachineState::OutOfService);
    settle().await;

    assert_eq!(
        fx.kinds(&[EventKind::StateChanged, EventKind::EquipmentStop]),
        vec![EventKind::StateChanged, EventKind::EquipmentStop]
    );
    let stops = fx.stops();
    assert_eq!(stops[0].state.previous, Some(MachineState::Executing));
    assert_eq!(stops[0].state.current, Some(MachineState::OutOfService));
    assert_eq!(stops[0].kind, TriggerKind::Automatic);
}

#[tokio::test(start_paused = true)]
async fn test_transition_two_stops_for_two_entries() {
    let fx = MachineFixture::new(MachineState::NotExecuting);
    fx.monitor.connect().await.unwrap();

    for state in [
        MachineState::Executing,
        MachineState::OutOfService,
        MachineState::Executing,
        MachineState::OutOfService,
    ] {
        fx.set_state(state);
        settle().await;
    }

    let stops = fx.stops();
    assert_eq!(stops.len(), 2);
    assert!(stops
        .iter()
        .all(|s| s.state.previous == Some(MachineState::Executing)
            && s.state.current == Some(MachineState::OutOfService)));
    assert_eq!(fx.monitor.stats().stats.equipment_stops, 2);
}

#[tokio::test(start_paused = true)]
async fn test_transition_repeated_value_is_silent() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();

    for _ in 0..3 {
        fx.set_state(MachineState::Executing);
        settle().await;
    }

    assert_eq!(fx.collector.count(EventKind::StateChanged), 0);
    // Notifications are still counted as received.
    assert!(fx.monitor.stats().stats.events_received >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_transition_detected_across_reconnect() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.transport.drop_connection("switch reboot");
    // The machine stops while the link is down.
    fx.set_state(MachineState::OutOfService);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(fx.monitor.connection().is_connected());
    assert_eq!(fx.collector.count(EventKind::ConnectionReestablished), 1);
    assert_eq!(fx.stops().len(), 1);
    assert_eq!(
        fx.monitor.machine_status().current_state,
        Some(MachineState::OutOfService)
    );
}

#[tokio::test(start_paused = true)]
async fn test_transition_error_code_does_not_touch_state() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.set_error_code(0);
    fx.set_error_code(1042);
    settle().await;

    assert_eq!(fx.collector.count(EventKind::ErrorDetected), 1);
    assert_eq!(fx.collector.count(EventKind::StateChanged), 0);
    assert_eq!(
        fx.monitor.machine_status().current_state,
        Some(MachineState::Executing)
    );
}

// =============================================================================
// Setup Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_survives_error_item_failure() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.transport
        .fail_monitor(&fx.config.machinery.error_code_node);

    fx.monitor.connect().await.unwrap();
    settle().await;
    assert_eq!(fx.monitor.stats().monitored_items, 1);

    fx.set_state(MachineState::OutOfService);
    settle().await;

    assert_eq!(
        fx.kinds(&[EventKind::StateChanged, EventKind::EquipmentStop]),
        vec![EventKind::StateChanged, EventKind::EquipmentStop]
    );
    let stops = fx.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].state.previous, Some(MachineState::Executing));
    assert_eq!(stops[0].state.current, Some(MachineState::OutOfService));

    let status = fx.monitor.machine_status();
    assert_eq!(status.previous_state, Some(MachineState::Executing));
    assert_eq!(status.current_state, Some(MachineState::OutOfService));
}

#[tokio::test(start_paused = true)]
async fn test_setup_retry_keeps_known_state() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.transport
        .fail_monitor(&fx.config.machinery.machine_state_node);

    assert!(fx.monitor.connect().await.is_err());
    settle().await;
    assert_eq!(
        fx.monitor.machine_status().current_state,
        Some(MachineState::Executing)
    );

    // The machine stops before setup is retried.
    fx.set_state(MachineState::OutOfService);
    fx.transport.clear_monitor_failures();
    fx.monitor.connect().await.unwrap();
    settle().await;

    let stops = fx.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].state.previous, Some(MachineState::Executing));
    assert_eq!(stops[0].state.current, Some(MachineState::OutOfService));
    assert_eq!(fx.monitor.stats().monitored_items, 2);
}

#[tokio::test(start_paused = true)]
async fn test_setup_skips_error_item_without_details() {
    let mut config = MonitorConfig::default();
    config.machinery.include_error_details = false;
    let fx = MachineFixture::with_config(config, MachineState::Executing);

    fx.monitor.connect().await.unwrap();
    settle().await;

    assert_eq!(fx.monitor.stats().monitored_items, 1);
    assert_eq!(fx.transport.item_count(), 1);
    fx.set_error_code(1042);
    settle().await;
    assert_eq!(fx.collector.count(EventKind::ErrorDetected), 0);
}

#[tokio::test(start_paused = true)]
async fn test_setup_runs_for_connect_through_manager() {
    let fx = MachineFixture::new(MachineState::Executing);

    fx.monitor.connection().connect().await.unwrap();
    settle().await;

    assert_eq!(fx.monitor.stats().monitored_items, 2);
    assert_eq!(
        fx.monitor.machine_status().machine_id.as_deref(),
        Some("press-07")
    );

    fx.set_state(MachineState::OutOfService);
    settle().await;

    let stops = fx.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].state.previous, Some(MachineState::Executing));
    assert_eq!(fx.monitor.stats().stats.equipment_stops, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transition_between_unknown_codes() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    for code in [5i64, 7, 7] {
        fx.transport
            .set_value(&fx.config.machinery.machine_state_node, code);
        settle().await;
    }

    assert_eq!(fx.collector.count(EventKind::StateChanged), 2);
    let status = fx.monitor.machine_status();
    assert_eq!(status.previous_state, Some(MachineState::Unknown(Some(5))));
    assert_eq!(status.current_state, Some(MachineState::Unknown(Some(7))));
    assert_eq!(status.state_name, "Unknown");
}

// =============================================================================
// Trigger Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_trigger_handlers_and_manual() {
    let fx = MachineFixture::new(MachineState::Executing);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let id = fx
        .monitor
        .on_video_trigger(trigger_fn("recorder", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    fx.monitor.connect().await.unwrap();
    settle().await;

    let before = fx.monitor.machine_status();
    let manual = fx.monitor.manual_trigger("test");
    let after = fx.monitor.machine_status();

    assert_eq!(manual.kind, TriggerKind::Manual);
    assert_eq!(manual.metadata.trigger_source, "manual");
    assert_eq!(before.current_state, after.current_state);
    assert_eq!(before.previous_state, after.previous_state);
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(fx.collector.count(EventKind::ManualTrigger), 1);
    assert_eq!(fx.monitor.stats().stats.equipment_stops, 0);

    assert!(fx.monitor.off_video_trigger(id));
    fx.set_state(MachineState::OutOfService);
    settle().await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(fx.stops().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_carries_error_details() {
    let fx = MachineFixture::new(MachineState::Executing);
    let mut triggers = fx.monitor.subscribe_triggers();
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.set_error_code(77);
    fx.set_state(MachineState::OutOfService);
    let trigger = triggers.recv().await.unwrap();

    let details = trigger.error_details.as_ref().expect("error details");
    assert_eq!(details.code, Variant::Int64(77));
    assert_eq!(trigger.machine_id.as_deref(), Some("press-07"));
    assert_eq!(trigger.metadata.trigger_source, "machinery_item_state");
    assert!(trigger.metadata.session_id.is_some());
    assert_eq!(
        trigger.source.as_ref().map(|s| s.node_id.clone()),
        Some(fx.config.machinery.machine_state_node.clone())
    );
}

#[tokio::test(start_paused = true)]
async fn test_trigger_not_blocked_by_failed_enrichment() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.transport.fail_reads(true);
    fx.set_state(MachineState::OutOfService);
    settle().await;

    let stops = fx.stops();
    assert_eq!(stops.len(), 1);
    assert!(stops[0].error_details.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_not_delayed_by_slow_enrichment() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.transport.set_read_delay(Some(Duration::from_secs(60)));
    fx.set_state(MachineState::OutOfService);
    tokio::time::sleep(fx.config.machinery.error_read_timeout + Duration::from_millis(100)).await;

    let stops = fx.stops();
    assert_eq!(stops.len(), 1);
    assert!(stops[0].error_details.is_none());
}

// =============================================================================
// Status Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_status_reports_machine_and_connection() {
    let fx = MachineFixture::new(MachineState::OutOfService);
    let status = fx.monitor.machine_status();
    assert!(!status.connection_status.is_connected);
    assert_eq!(status.current_state, None);

    fx.monitor.connect().await.unwrap();
    settle().await;

    let status = fx.monitor.machine_status();
    assert_eq!(status.machine_id.as_deref(), Some("press-07"));
    assert_eq!(status.current_state, Some(MachineState::OutOfService));
    assert_eq!(status.state_name, "OutOfService");
    assert!(status.is_stopped);
    assert!(!status.is_operational);
    assert!(status.last_state_change.is_some());
    assert_eq!(status.connection_status.endpoint, fx.config.connection.endpoint);
    // Seeding is not a transition.
    assert!(fx.stops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_status_uptime_only_while_connected() {
    let fx = MachineFixture::new(MachineState::Executing);
    assert_eq!(fx.monitor.stats().stats.uptime, Duration::ZERO);

    fx.monitor.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let uptime = fx.monitor.stats().stats.uptime;
    assert!(uptime >= Duration::from_secs(5));

    fx.monitor.disconnect().await;
    let stats = fx.monitor.stats();
    assert_eq!(stats.stats.uptime, Duration::ZERO);
    assert!(!stats.reconnecting);
    assert_eq!(stats.monitored_items, 2);
}

#[tokio::test(start_paused = true)]
async fn test_status_stats_serialize() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();

    let json = serde_json::to_value(fx.monitor.stats()).unwrap();
    assert_eq!(json["connection_state"], "connected");
    assert_eq!(json["monitored_items"], 2);
    assert!(json.get("total_reconnects").is_some());
}
