// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use machwatch_opcua::client::transport::{ItemSink, LifecycleSink};
use machwatch_opcua::{
    AttributeId, CollectorHandler, ConnectionConfig, DataValue, EventKind, MachineMonitor,
    MachineState, MonitorConfig, MonitorEvent, MonitoredItemId, MonitoringError,
    MonitoringParameters, NodeId, ReadError, ReconnectPolicy, SessionId, SimulatedTransport,
    StatusCode, SubscriptionId, SubscriptionSettings, TelemetryTransport, TransportError,
    TriggerEvent, Variant, WriteError,
};

/// Installs a test subscriber once. Enable output with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Machine Fixture
// =============================================================================

/// Monitor over a simulated press with identity, state and error code nodes.
pub struct MachineFixture {
    pub config: MonitorConfig,
    pub transport: Arc<SimulatedTransport>,
    pub monitor: MachineMonitor<SimulatedTransport>,
    pub collector: Arc<CollectorHandler>,
}

impl MachineFixture {
    pub fn new(initial: MachineState) -> Self {
        Self::with_config(MonitorConfig::default(), initial)
    }

    pub fn with_config(config: MonitorConfig, initial: MachineState) -> Self {
        init_tracing();
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_value(config.machinery.machine_id_node.clone(), "press-07")
                .with_value(config.machinery.machine_state_node.clone(), initial)
                .with_value(config.machinery.error_code_node.clone(), 0i64),
        );
        let monitor = MachineMonitor::new(transport.clone(), config.clone())
            .expect("valid monitor config");
        let collector = Arc::new(CollectorHandler::new());
        monitor.events().subscribe_all(collector.clone());
        Self {
            config,
            transport,
            monitor,
            collector,
        }
    }

    pub fn set_state(&self, state: MachineState) {
        self.transport
            .set_value(&self.config.machinery.machine_state_node, state);
    }

    pub fn set_error_code(&self, code: i64) {
        self.transport
            .set_value(&self.config.machinery.error_code_node, code);
    }

    pub fn stops(&self) -> Vec<Arc<TriggerEvent>> {
        self.collector
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::EquipmentStop(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    /// Event kinds in order, restricted to `wanted`.
    pub fn kinds(&self, wanted: &[EventKind]) -> Vec<EventKind> {
        self.collector
            .kinds()
            .into_iter()
            .filter(|k| wanted.contains(k))
            .collect()
    }
}

/// Config with a short reconnect policy.
pub fn config_with_retries(max_retries: u32) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.connection = ConnectionConfig::builder()
        .endpoint("opc.tcp://press-07:4840")
        .reconnect(ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(8),
            max_retries,
        ))
        .build()
        .expect("valid connection config");
    config
}

/// Lets spawned tasks drain their queues under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// =============================================================================
// ScriptedTransport
// =============================================================================

/// Simulated server with scripted subscription failures and slow opens.
#[derive(Default)]
pub struct ScriptedTransport {
    pub inner: SimulatedTransport,
    subscription_failures: AtomicU32,
    open_delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_subscriptions(&self, count: u32) {
        self.subscription_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }
}

#[async_trait]
impl TelemetryTransport for ScriptedTransport {
    async fn open(
        &self,
        config: &ConnectionConfig,
        signals: LifecycleSink,
    ) -> Result<(), TransportError> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.open(config, signals).await
    }

    async fn create_session(&self, timeout: Duration) -> Result<SessionId, TransportError> {
        self.inner.create_session(timeout).await
    }

    async fn create_subscription(
        &self,
        session: SessionId,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, TransportError> {
        let refused = self
            .subscription_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::subscription("BadTooManySubscriptions"));
        }
        self.inner.create_subscription(session, settings).await
    }

    async fn terminate_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.inner.terminate_subscription(subscription).await
    }

    async fn close_session(&self, session: SessionId) -> Result<(), TransportError> {
        self.inner.close_session(session).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect().await
    }

    async fn monitor(
        &self,
        subscription: SubscriptionId,
        node_id: &NodeId,
        attribute: AttributeId,
        params: &MonitoringParameters,
        sink: ItemSink,
    ) -> Result<MonitoredItemId, MonitoringError> {
        self.inner
            .monitor(subscription, node_id, attribute, params, sink)
            .await
    }

    async fn read(&self, session: SessionId, node_id: &NodeId) -> Result<DataValue, ReadError> {
        self.inner.read(session, node_id).await
    }

    async fn write(
        &self,
        session: SessionId,
        node_id: &NodeId,
        value: &Variant,
    ) -> Result<StatusCode, WriteError> {
        self.inner.write(session, node_id, value).await
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
