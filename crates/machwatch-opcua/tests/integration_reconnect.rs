// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Reconnect Integration Tests
//!
//! Connection lifecycle behaviour under transport failures:
//!
//! - `test_backoff_*`: retry timing and the retry budget
//! - `test_restore_*`: monitored item restoration
//! - `test_teardown_*`: disconnect and partial-connect cleanup

mod common;

use std::sync::Arc;
use std::time::Duration;

use machwatch_opcua::{
    ConnectionConfig, ConnectionManager, ConnectionState, EventKind, MachineMonitor,
    MachineState, MonitorEvent, MonitoredItemSpec, NodeId, ReconnectPolicy, SimulatedTransport,
};

use common::{config_with_retries, settle, MachineFixture, ScriptedTransport};

fn manager<T: machwatch_opcua::TelemetryTransport>(
    transport: Arc<T>,
    max_retries: u32,
) -> ConnectionManager<T> {
    common::init_tracing();
    let config = ConnectionConfig::builder()
        .endpoint("opc.tcp://press-07:4840")
        .reconnect(ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(8),
            max_retries,
        ))
        .build()
        .unwrap();
    ConnectionManager::builder(transport)
        .connection(config)
        .build()
        .unwrap()
}

// =============================================================================
// Backoff Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_follows_capped_doubling() {
    let fx = MachineFixture::with_config(config_with_retries(10), MachineState::Executing);
    fx.transport.fail_next_connects(6);

    assert!(fx.monitor.connect().await.is_err());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(fx.monitor.connection().is_connected());

    let opens = fx.transport.open_attempts();
    let gaps: Vec<u64> = opens
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![1, 2, 4, 8, 8, 8]);

    let stats = fx.monitor.stats().stats;
    assert_eq!(stats.total_reconnects, 1);
    assert_eq!(stats.reconnect_attempts, 0);
    assert_eq!(fx.collector.count(EventKind::ConnectionError), 6);

    // Machinery setup ran after the automatic reconnect.
    assert_eq!(fx.monitor.stats().monitored_items, 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_exhaustion_is_terminal_and_single() {
    let fx = MachineFixture::with_config(config_with_retries(3), MachineState::Executing);
    fx.transport.fail_next_connects(u32::MAX);

    assert!(fx.monitor.connect().await.is_err());
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(fx.collector.count(EventKind::MaxReconnectAttemptsReached), 1);
    assert_eq!(fx.transport.open_attempts().len(), 4);
    assert_eq!(fx.monitor.connection().state(), ConnectionState::Disconnected);

    let exhausted = fx
        .collector
        .events()
        .into_iter()
        .find_map(|e| match e {
            MonitorEvent::MaxReconnectAttemptsReached { attempts } => Some(attempts),
            _ => None,
        });
    assert_eq!(exhausted, Some(3));

    // Nothing happens without an explicit connect.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(fx.transport.open_attempts().len(), 4);

    fx.transport.fail_next_connects(0);
    fx.monitor.connect().await.unwrap();
    assert!(fx.monitor.connection().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_counter_resets_after_success() {
    let fx = MachineFixture::with_config(config_with_retries(5), MachineState::Executing);
    fx.monitor.connect().await.unwrap();

    for _ in 0..2 {
        fx.transport.fail_next_connects(2);
        fx.transport.drop_connection("link flap");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.monitor.connection().is_connected());
    }

    let delays: Vec<u64> = fx
        .collector
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MonitorEvent::Reconnecting { delay, .. } => Some(delay.as_secs()),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 1, 2, 4]);
    assert_eq!(fx.monitor.stats().stats.total_reconnects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_explicit_connect_clears_pending_attempts() {
    let fx = MachineFixture::with_config(config_with_retries(5), MachineState::Executing);
    fx.transport.fail_next_connects(1);

    assert!(fx.monitor.connect().await.is_err());
    assert!(fx.monitor.stats().reconnecting);
    assert_eq!(fx.monitor.stats().stats.reconnect_attempts, 1);

    // Explicit connect while the retry timer is still pending.
    fx.monitor.connect().await.unwrap();
    let stats = fx.monitor.stats();
    assert!(!stats.reconnecting);
    assert_eq!(stats.stats.reconnect_attempts, 0);
    assert_eq!(stats.stats.total_reconnects, 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.transport.open_attempts().len(), 2);
    assert_eq!(fx.monitor.stats().stats.reconnect_attempts, 0);
}

// =============================================================================
// Restore Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_restore_continues_past_failing_item() {
    let transport = Arc::new(SimulatedTransport::new());
    let manager = manager(transport.clone(), 5);
    manager.connect().await.unwrap();

    let nodes: Vec<NodeId> = ["Feed", "Spindle", "Coolant"]
        .iter()
        .map(|n| NodeId::string(2, *n))
        .collect();
    for node in &nodes {
        let name = node.to_string();
        manager
            .monitor(MonitoredItemSpec::new(node.clone(), name))
            .await
            .unwrap();
    }

    transport.fail_monitor(&nodes[1]);
    transport.drop_connection("plc restart");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(manager.is_connected());
    let registry = manager.registry();
    assert_eq!(registry.len(), 3);
    assert!(registry.item_id(&nodes[0].to_string()).is_some());
    assert!(registry.item_id(&nodes[1].to_string()).is_none());
    assert!(registry.item_id(&nodes[2].to_string()).is_some());

    // The healthy items deliver on the new subscription.
    let collector = Arc::new(machwatch_opcua::CollectorHandler::new());
    manager.events().subscribe_all(collector.clone());
    transport.set_value(&nodes[2], 12.5);
    settle().await;
    assert_eq!(collector.count(EventKind::DataChange), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restore_item_error_keeps_subscription() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    settle().await;

    fx.transport
        .item_error(&fx.config.machinery.error_code_node, "BadSensorFailure");
    settle().await;

    assert_eq!(fx.collector.count(EventKind::MonitoringError), 1);
    assert!(fx.monitor.connection().is_connected());

    fx.set_state(MachineState::OutOfService);
    settle().await;
    assert_eq!(fx.stops().len(), 1);
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_teardown_disconnect_order_and_no_reconnect() {
    let fx = MachineFixture::new(MachineState::Executing);
    fx.monitor.connect().await.unwrap();
    fx.transport.fail_teardown(true);
    fx.transport.clear_calls();

    fx.monitor.disconnect().await;

    assert_eq!(
        fx.transport.calls(),
        vec!["terminate_subscription", "close_session", "disconnect"]
    );
    assert_eq!(fx.collector.count(EventKind::Disconnected), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.transport.open_attempts().len(), 1);
    assert_eq!(fx.collector.count(EventKind::Reconnecting), 0);

    // A second disconnect is a no-op.
    fx.monitor.disconnect().await;
    assert_eq!(fx.collector.count(EventKind::Disconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_partial_connect_releases_session() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail_next_subscriptions(1);
    let manager = manager(transport.clone(), 3);

    assert!(manager.connect().await.is_err());
    assert_eq!(
        transport.inner.calls(),
        vec!["open", "create_session", "close_session", "disconnect"]
    );
    assert_eq!(transport.inner.session_count(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(manager.is_connected());
    assert_eq!(transport.inner.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_disconnect_during_slow_connect() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.set_open_delay(Some(Duration::from_secs(5)));
    let manager = manager(transport.clone(), 3);

    let connecting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    manager.disconnect().await;
    assert!(connecting.await.unwrap().is_ok());

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!transport.inner.is_open());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!manager.is_reconnecting());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_monitor_rejects_without_subscription() {
    let transport = Arc::new(SimulatedTransport::new());
    let monitor = MachineMonitor::new(transport, config_with_retries(3)).unwrap();

    let err = monitor
        .connection()
        .monitor(MonitoredItemSpec::new(NodeId::numeric(2, 1001), "Spindle"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        machwatch_opcua::MonitorError::Monitoring(machwatch_opcua::MonitoringError::NotSubscribed)
    ));
}
