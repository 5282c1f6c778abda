// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport abstraction over the OPC UA protocol stack.
//!
//! [`TelemetryTransport`] is the seam between the monitor and whatever
//! speaks the wire protocol. The monitor never sees sockets, secure
//! channels or encodings; it drives the transport through opaque session,
//! subscription and item handles.
//!
//! Asynchronous deliveries flow back through two sinks:
//!
//! - [`LifecycleSink`]: connection lost / reestablished / backoff signals,
//!   handed to [`TelemetryTransport::open`].
//! - [`ItemSink`]: value changes and errors of one monitored item, handed to
//!   [`TelemetryTransport::monitor`].
//!
//! Both sinks are stamped with the connection epoch they were created for.
//! Deliveries from an epoch that is no longer current are dropped by the
//! receiving side, so a transport may keep calling old sinks safely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, MonitoringParameters, SubscriptionSettings};
use crate::error::{MonitoringError, ReadError, TransportError, WriteError};
use crate::types::{AttributeId, DataValue, NodeId, StatusCode, Variant};

// =============================================================================
// Handles
// =============================================================================

/// Opaque handle of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Opaque handle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Opaque handle of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoredItemId(pub u32);

impl fmt::Display for MonitoredItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mi-{}", self.0)
    }
}

// =============================================================================
// Lifecycle Signals
// =============================================================================

/// Connection lifecycle signals raised by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// The underlying channel dropped. Session and subscription are gone.
    ConnectionLost {
        /// Reason reported by the stack.
        reason: String,
    },
    /// The stack restored its channel on its own.
    ConnectionReestablished,
    /// The stack is backing off before its own retry.
    Backoff {
        /// Retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
}

pub(crate) type SignalEnvelope = (u64, TransportSignal);

/// Channel the transport uses to report lifecycle signals.
#[derive(Debug, Clone)]
pub struct LifecycleSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

impl LifecycleSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<SignalEnvelope>) -> Self {
        Self { epoch, tx }
    }

    /// Creates a sink together with its receiving end.
    ///
    /// Useful for driving a transport outside a connection manager.
    pub fn detached(epoch: u64) -> (Self, mpsc::UnboundedReceiver<(u64, TransportSignal)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(epoch, tx), rx)
    }

    /// Returns the connection epoch this sink belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Reports a dropped connection.
    pub fn connection_lost(&self, reason: impl Into<String>) -> bool {
        self.send(TransportSignal::ConnectionLost {
            reason: reason.into(),
        })
    }

    /// Reports that the stack restored its channel.
    pub fn connection_reestablished(&self) -> bool {
        self.send(TransportSignal::ConnectionReestablished)
    }

    /// Reports a stack-level backoff.
    pub fn backoff(&self, attempt: u32, delay: Duration) -> bool {
        self.send(TransportSignal::Backoff { attempt, delay })
    }

    /// Sends a signal. Returns `false` once nobody listens any more.
    pub fn send(&self, signal: TransportSignal) -> bool {
        self.tx.send((self.epoch, signal)).is_ok()
    }

    /// Returns `true` once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Item Notifications
// =============================================================================

/// Notification of a single monitored item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemNotice {
    /// A new sample.
    Changed(DataValue),
    /// The item reported an error.
    Error(String),
}

/// Notification routed from an [`ItemSink`] to the registry.
#[derive(Debug, Clone)]
pub(crate) struct ItemEnvelope {
    pub epoch: u64,
    pub serial: u64,
    pub display_name: Arc<str>,
    pub node_id: NodeId,
    pub notice: ItemNotice,
}

/// Callback target of one monitored item.
#[derive(Debug, Clone)]
pub struct ItemSink {
    epoch: u64,
    serial: u64,
    display_name: Arc<str>,
    node_id: NodeId,
    tx: mpsc::UnboundedSender<ItemEnvelope>,
}

impl ItemSink {
    pub(crate) fn new(
        epoch: u64,
        serial: u64,
        display_name: Arc<str>,
        node_id: NodeId,
        tx: mpsc::UnboundedSender<ItemEnvelope>,
    ) -> Self {
        Self {
            epoch,
            serial,
            display_name,
            node_id,
            tx,
        }
    }

    /// Returns the registry key of the item.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the monitored node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Delivers a new sample. Returns `false` once nobody listens any more.
    pub fn data_change(&self, value: DataValue) -> bool {
        self.send(ItemNotice::Changed(value))
    }

    /// Delivers an item error. Returns `false` once nobody listens any more.
    pub fn error(&self, cause: impl Into<String>) -> bool {
        self.send(ItemNotice::Error(cause.into()))
    }

    /// Returns `true` once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, notice: ItemNotice) -> bool {
        self.tx
            .send(ItemEnvelope {
                epoch: self.epoch,
                serial: self.serial,
                display_name: Arc::clone(&self.display_name),
                node_id: self.node_id.clone(),
                notice,
            })
            .is_ok()
    }
}

// =============================================================================
// TelemetryTransport
// =============================================================================

/// Capabilities the monitor needs from an OPC UA protocol stack.
///
/// Calls arrive in lifecycle order: `open`, `create_session`,
/// `create_subscription`, any number of `monitor`/`read`/`write`, then
/// `terminate_subscription`, `close_session`, `disconnect`. After a
/// `ConnectionLost` signal the monitor calls the teardown methods for the
/// dead handles before opening again; implementations should treat
/// teardown of unknown handles as a no-op or return an error that is only
/// logged.
#[async_trait]
pub trait TelemetryTransport: Send + Sync + 'static {
    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Opens the transport to the configured endpoint.
    ///
    /// # Arguments
    ///
    /// * `config` - Endpoint, security selectors and client identity
    /// * `signals` - Sink for lifecycle signals of this connection
    async fn open(&self, config: &ConnectionConfig, signals: LifecycleSink)
        -> Result<(), TransportError>;

    /// Creates a session on the open transport.
    async fn create_session(&self, timeout: Duration) -> Result<SessionId, TransportError>;

    /// Creates a subscription on a session.
    async fn create_subscription(
        &self,
        session: SessionId,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, TransportError>;

    /// Terminates a subscription.
    async fn terminate_subscription(&self, subscription: SubscriptionId)
        -> Result<(), TransportError>;

    /// Closes a session.
    async fn close_session(&self, session: SessionId) -> Result<(), TransportError>;

    /// Closes the transport.
    async fn disconnect(&self) -> Result<(), TransportError>;

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Creates a monitored item.
    ///
    /// # Arguments
    ///
    /// * `subscription` - Subscription the item belongs to
    /// * `node_id` - Node to monitor
    /// * `attribute` - Attribute to sample
    /// * `params` - Sampling parameters
    /// * `sink` - Target for value changes and item errors
    async fn monitor(
        &self,
        subscription: SubscriptionId,
        node_id: &NodeId,
        attribute: AttributeId,
        params: &MonitoringParameters,
        sink: ItemSink,
    ) -> Result<MonitoredItemId, MonitoringError>;

    // =========================================================================
    // Read / Write
    // =========================================================================

    /// Reads the value attribute of a node.
    async fn read(&self, session: SessionId, node_id: &NodeId) -> Result<DataValue, ReadError>;

    /// Writes the value attribute of a node.
    async fn write(
        &self,
        session: SessionId,
        node_id: &NodeId,
        value: &Variant,
    ) -> Result<StatusCode, WriteError>;

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Returns a short name for logs.
    fn name(&self) -> &str {
        "opcua"
    }
}

// =============================================================================
// Tests
// =============================================================================
