// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-process transport that simulates an OPC UA server.
//!
//! [`SimulatedTransport`] keeps node values in memory and pushes a
//! notification to every monitored item of a node when its value changes.
//! It can also drop the connection, refuse connects, fail item creation,
//! fail teardown steps and slow down reads, which makes it the transport
//! of choice for tests and for the `simulate` command.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = Arc::new(SimulatedTransport::new()
//!     .with_value(state_node.clone(), MachineState::Executing));
//!
//! let monitor = MachineMonitor::new(transport.clone(), MonitorConfig::default())?;
//! monitor.connect().await?;
//!
//! transport.set_value(&state_node, MachineState::OutOfService);
//! transport.drop_connection("cable unplugged");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::transport::{
    ItemSink, LifecycleSink, MonitoredItemId, SessionId, SubscriptionId, TelemetryTransport,
    TransportSignal,
};
use crate::config::{ConnectionConfig, MonitoringParameters, SubscriptionSettings};
use crate::error::{MonitoringError, ReadError, TransportError, WriteError};
use crate::types::{AttributeId, DataValue, NodeId, StatusCode, Variant};

#[derive(Default)]
struct ServerState {
    open: bool,
    signals: Option<LifecycleSink>,
    sessions: HashSet<u32>,
    subscriptions: HashMap<u32, u32>,
    items: Vec<SimulatedItem>,
    values: HashMap<NodeId, DataValue>,
}

struct SimulatedItem {
    subscription: u32,
    node_id: NodeId,
    sink: ItemSink,
}

/// Simulated OPC UA server.
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<ServerState>,
    next_handle: AtomicU32,
    connect_failures: AtomicU32,
    fail_teardown: AtomicBool,
    fail_reads: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    failing_nodes: Mutex<HashSet<NodeId>>,
    calls: Mutex<Vec<String>>,
    open_attempts: Mutex<Vec<Instant>>,
}

impl SimulatedTransport {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an initial node value.
    pub fn with_value(self, node_id: NodeId, value: impl Into<Variant>) -> Self {
        self.state
            .lock()
            .values
            .insert(node_id, DataValue::good(value));
        self
    }

    // =========================================================================
    // Server Side
    // =========================================================================

    /// Changes a node value and notifies its monitored items.
    ///
    /// Returns the number of items notified.
    pub fn set_value(&self, node_id: &NodeId, value: impl Into<Variant>) -> usize {
        self.set_data_value(node_id, DataValue::good(value))
    }

    /// Changes a node value with explicit status and timestamps.
    pub fn set_data_value(&self, node_id: &NodeId, value: DataValue) -> usize {
        let mut state = self.state.lock();
        state.values.insert(node_id.clone(), value.clone());
        if !state.open {
            return 0;
        }
        state
            .items
            .iter()
            .filter(|item| &item.node_id == node_id)
            .filter(|item| item.sink.data_change(value.clone()))
            .count()
    }

    /// Returns the current value of a node.
    pub fn value(&self, node_id: &NodeId) -> Option<DataValue> {
        self.state.lock().values.get(node_id).cloned()
    }

    /// Reports an error on every monitored item of a node.
    pub fn item_error(&self, node_id: &NodeId, cause: &str) -> usize {
        self.state
            .lock()
            .items
            .iter()
            .filter(|item| &item.node_id == node_id)
            .filter(|item| item.sink.error(cause))
            .count()
    }

    /// Drops the connection: sessions, subscriptions and items vanish and
    /// a `ConnectionLost` signal is raised.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let signals = {
            let mut state = self.state.lock();
            state.open = false;
            state.sessions.clear();
            state.subscriptions.clear();
            state.items.clear();
            state.signals.take()
        };
        tracing::debug!(reason, "Simulated connection drop");
        signals.is_some_and(|s| s.connection_lost(reason))
    }

    /// Raises a lifecycle signal on the current connection.
    pub fn signal(&self, signal: TransportSignal) -> bool {
        self.state
            .lock()
            .signals
            .as_ref()
            .is_some_and(|s| s.send(signal))
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    /// Refuses the next `count` open attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Refuses item creation for `node_id`.
    pub fn fail_monitor(&self, node_id: &NodeId) {
        self.failing_nodes.lock().insert(node_id.clone());
    }

    /// Accepts item creation for every node again.
    pub fn clear_monitor_failures(&self) {
        self.failing_nodes.lock().clear();
    }

    /// Makes every teardown step fail after taking effect.
    pub fn fail_teardown(&self, fail: bool) {
        self.fail_teardown.store(fail, Ordering::SeqCst);
    }

    /// Makes reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delays every read.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Returns the recorded calls in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Clears the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Returns the instants of every open attempt.
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.open_attempts.lock().clone()
    }

    /// Returns `true` while the transport is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Returns the number of live monitored items.
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn teardown_result(&self, what: &'static str) -> Result<(), TransportError> {
        if self.fail_teardown.load(Ordering::SeqCst) {
            Err(TransportError::close(what, "simulated teardown failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetryTransport for SimulatedTransport {
    async fn open(
        &self,
        config: &ConnectionConfig,
        signals: LifecycleSink,
    ) -> Result<(), TransportError> {
        self.record("open");
        self.open_attempts.lock().push(Instant::now());

        let refused = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::open(&config.endpoint, "connection refused"));
        }

        let mut state = self.state.lock();
        state.open = true;
        state.signals = Some(signals);
        Ok(())
    }

    async fn create_session(&self, _timeout: Duration) -> Result<SessionId, TransportError> {
        self.record("create_session");
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::session("transport not open"));
        }
        let id = self.next_handle();
        state.sessions.insert(id);
        Ok(SessionId(id))
    }

    async fn create_subscription(
        &self,
        session: SessionId,
        _settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, TransportError> {
        self.record("create_subscription");
        let mut state = self.state.lock();
        if !state.sessions.contains(&session.0) {
            return Err(TransportError::subscription(format!("unknown {session}")));
        }
        let id = self.next_handle();
        state.subscriptions.insert(id, session.0);
        Ok(SubscriptionId(id))
    }

    async fn terminate_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.record("terminate_subscription");
        {
            let mut state = self.state.lock();
            state.subscriptions.remove(&subscription.0);
            state.items.retain(|item| item.subscription != subscription.0);
        }
        self.teardown_result("subscription")
    }

    async fn close_session(&self, session: SessionId) -> Result<(), TransportError> {
        self.record("close_session");
        {
            let mut state = self.state.lock();
            state.sessions.remove(&session.0);
            state.subscriptions.retain(|_, owner| *owner != session.0);
        }
        self.teardown_result("session")
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record("disconnect");
        {
            let mut state = self.state.lock();
            state.open = false;
            state.signals = None;
            state.sessions.clear();
            state.subscriptions.clear();
            state.items.clear();
        }
        self.teardown_result("transport")
    }

    async fn monitor(
        &self,
        subscription: SubscriptionId,
        node_id: &NodeId,
        _attribute: AttributeId,
        _params: &MonitoringParameters,
        sink: ItemSink,
    ) -> Result<MonitoredItemId, MonitoringError> {
        self.record(format!("monitor {node_id}"));
        if self.failing_nodes.lock().contains(node_id) {
            return Err(MonitoringError::item_creation(
                sink.display_name(),
                "BadNodeIdUnknown",
            ));
        }

        let mut state = self.state.lock();
        if !state.subscriptions.contains_key(&subscription.0) {
            return Err(MonitoringError::item_creation(
                sink.display_name(),
                format!("unknown {subscription}"),
            ));
        }

        // Servers report the current value right after item creation.
        if let Some(value) = state.values.get(node_id) {
            sink.data_change(value.clone());
        }

        let id = self.next_handle();
        state.items.push(SimulatedItem {
            subscription: subscription.0,
            node_id: node_id.clone(),
            sink,
        });
        Ok(MonitoredItemId(id))
    }

    async fn read(&self, session: SessionId, node_id: &NodeId) -> Result<DataValue, ReadError> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if !state.sessions.contains(&session.0) {
            return Err(ReadError::NotConnected {
                node_id: node_id.clone(),
            });
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ReadError::failed(node_id, "BadCommunicationError"));
        }
        Ok(state.values.get(node_id).cloned().unwrap_or_else(|| {
            DataValue::with_status(Variant::Null, StatusCode::BAD_NODE_ID_UNKNOWN)
        }))
    }

    async fn write(
        &self,
        session: SessionId,
        node_id: &NodeId,
        value: &Variant,
    ) -> Result<StatusCode, WriteError> {
        self.record(format!("write {node_id}"));
        if !self.state.lock().sessions.contains(&session.0) {
            return Err(WriteError::NotConnected {
                node_id: node_id.clone(),
            });
        }
        self.set_value(node_id, value.clone());
        Ok(StatusCode::GOOD)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// Tests
// =============================================================================
