// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection lifecycle and reconnect state machine.
//!
//! # State Machine
//!
//! ```text
//!              connect()
//! Disconnected ─────────▶ Connecting ─────────▶ Connected
//!      ▲                      │ ▲                   │
//!      │ retries exhausted    │ │ timer fires       │ connection lost
//!      │ or disconnect()      ▼ │                   ▼
//!      └─────────────────  Reconnecting ◀─────  ConnectionLost
//! ```
//!
//! - At most one reconnect timer is pending at any time.
//! - The delay before attempt `n` is `min(initial * 2^(n-1), max)`.
//! - After `max_retries` failed attempts a single
//!   `maxReconnectAttemptsReached` event is emitted and automatic
//!   reconnection stops until the next explicit [`ConnectionManager::connect`].
//! - [`ConnectionManager::disconnect`] cancels the timer, tears down
//!   subscription, session and transport in that order, and disables
//!   automatic reconnection.
//!
//! Every successful connect gets a new epoch. Lifecycle signals and item
//! notifications carry the epoch they were created under and are ignored
//! once it is no longer current.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::client::registry::{MonitoredItemSpec, RestoreReport, SubscriptionRegistry};
use crate::client::transport::{
    LifecycleSink, MonitoredItemId, SessionId, SignalEnvelope, SubscriptionId, TelemetryTransport,
    TransportSignal,
};
use crate::config::{ConnectionConfig, MonitorConfig, MonitoringParameters, SubscriptionSettings};
use crate::error::{MonitorError, MonitorResult, ReadError, TransportError, WriteError};
use crate::events::{EventBus, MonitorEvent};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::types::{DataValue, NodeId, Variant};

// =============================================================================
// ConnectionState
// =============================================================================

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection, no automatic activity.
    #[default]
    Disconnected,
    /// Opening transport, session and subscription.
    Connecting,
    /// Session and subscription are live.
    Connected,
    /// The transport dropped; handles are gone.
    ConnectionLost,
    /// A reconnect timer is pending.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` if connected.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` while the manager works towards a connection.
    #[inline]
    pub const fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::ConnectionLost | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::ConnectionLost => "ConnectionLost",
            Self::Reconnecting => "Reconnecting",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// NodeReader
// =============================================================================

/// Read access to the live session, as needed by consumers that enrich
/// events with extra node values.
#[async_trait]
pub trait NodeReader: Send + Sync {
    /// Reads a node value. Bad status is an error.
    async fn read_node(&self, node_id: &NodeId) -> MonitorResult<DataValue>;

    /// Returns the live session, if any.
    fn session_id(&self) -> Option<SessionId> {
        None
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ActiveConnection {
    epoch: u64,
    session: SessionId,
    subscription: SubscriptionId,
}

#[derive(Default)]
struct ReconnectSlot {
    timer: Option<JoinHandle<()>>,
    in_progress: bool,
    attempts: u32,
    exhausted: bool,
}

struct Inner<T: TelemetryTransport> {
    config: ConnectionConfig,
    subscription: SubscriptionSettings,
    transport: Arc<T>,
    registry: SubscriptionRegistry<T>,
    events: Arc<EventBus>,
    stats: Arc<StatsCollector>,
    state: RwLock<ConnectionState>,
    active: Mutex<Option<ActiveConnection>>,
    stale: Mutex<Option<ActiveConnection>>,
    reconnect: Mutex<ReconnectSlot>,
    lifecycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    auto_reconnect: AtomicBool,
    span: Span,
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Owns the session and subscription of one endpoint and keeps them alive.
///
/// Cloning is cheap; clones share the same connection.
pub struct ConnectionManager<T: TelemetryTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: TelemetryTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TelemetryTransport> ConnectionManager<T> {
    /// Creates a builder.
    pub fn builder(transport: Arc<T>) -> ConnectionManagerBuilder<T> {
        ConnectionManagerBuilder::new(transport)
    }

    /// Creates a manager from the connection sections of a monitor config.
    pub fn from_config(transport: Arc<T>, config: &MonitorConfig) -> MonitorResult<Self> {
        Self::builder(transport)
            .connection(config.connection.clone())
            .subscription(config.subscription.clone())
            .monitoring(config.monitoring.clone())
            .build()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connects and restores all registered monitored items.
    ///
    /// Returns immediately if already connected. On failure a reconnect is
    /// scheduled (unless one is pending) and the error is returned.
    pub async fn connect(&self) -> MonitorResult<()> {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move { inner.connect_explicit().await }
            .instrument(span)
            .await
    }

    /// Tears the connection down and disables automatic reconnection.
    ///
    /// Teardown is best effort: subscription, session and transport are
    /// closed in that order and a failing step does not stop the others.
    pub async fn disconnect(&self) {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move { inner.disconnect_explicit().await }
            .instrument(span)
            .await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Reads a node through the live session.
    ///
    /// # Errors
    ///
    /// `ReadError::NotConnected` without a session, `ReadError::Timeout`
    /// after the request timeout, `ReadError::BadStatus` for a bad status.
    pub async fn read(&self, node_id: &NodeId) -> MonitorResult<DataValue> {
        let inner = &self.inner;
        let active = inner.current().ok_or_else(|| ReadError::NotConnected {
            node_id: node_id.clone(),
        })?;

        let timeout = inner.config.request_timeout;
        let value = tokio::time::timeout(timeout, inner.transport.read(active.session, node_id))
            .await
            .map_err(|_| ReadError::Timeout {
                node_id: node_id.clone(),
                timeout,
            })??;

        if !inner.is_current(active.epoch) {
            return Err(TransportError::Superseded.into());
        }
        if value.status.is_bad() {
            return Err(ReadError::BadStatus {
                node_id: node_id.clone(),
                status: value.status,
            }
            .into());
        }
        Ok(value)
    }

    /// Reads several nodes one after another.
    pub async fn read_many(&self, node_ids: &[NodeId]) -> Vec<MonitorResult<DataValue>> {
        let mut results = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            results.push(self.read(node_id).await);
        }
        results
    }

    /// Writes a node value through the live session.
    pub async fn write(&self, node_id: &NodeId, value: impl Into<Variant>) -> MonitorResult<()> {
        let inner = &self.inner;
        let value = value.into();
        let active = inner.current().ok_or_else(|| WriteError::NotConnected {
            node_id: node_id.clone(),
        })?;

        let status = tokio::time::timeout(
            inner.config.request_timeout,
            inner.transport.write(active.session, node_id, &value),
        )
        .await
        .map_err(|_| WriteError::failed(node_id, "request timed out"))??;

        if status.is_bad() {
            return Err(WriteError::BadStatus {
                node_id: node_id.clone(),
                status,
            }
            .into());
        }
        tracing::debug!(node_id = %node_id, value = %value, "Node written");
        Ok(())
    }

    /// Monitors a data point on the current subscription.
    pub async fn monitor(&self, spec: MonitoredItemSpec) -> MonitorResult<MonitoredItemId> {
        self.inner.registry.monitor(spec).await
    }

    /// Re-monitors every registered data point.
    pub async fn restore_all(&self) -> RestoreReport {
        self.inner.registry.restore_all().await
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns `true` if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Returns `true` while a reconnect timer is pending or running.
    pub fn is_reconnecting(&self) -> bool {
        let slot = self.inner.reconnect.lock();
        slot.timer.is_some() || slot.in_progress
    }

    /// Returns the live session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.current().map(|a| a.session)
    }

    /// Returns the live subscription.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.inner.current().map(|a| a.subscription)
    }

    /// Returns the event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Returns the monitored item registry.
    pub fn registry(&self) -> &SubscriptionRegistry<T> {
        &self.inner.registry
    }

    /// Returns the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Returns the span the manager logs in.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

#[async_trait]
impl<T: TelemetryTransport> NodeReader for ConnectionManager<T> {
    async fn read_node(&self, node_id: &NodeId) -> MonitorResult<DataValue> {
        self.read(node_id).await
    }

    fn session_id(&self) -> Option<SessionId> {
        ConnectionManager::session_id(self)
    }
}

impl<T: TelemetryTransport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.config.endpoint)
            .field("transport", &self.inner.transport.name())
            .field("state", &self.state())
            .field("monitored_items", &self.inner.registry.len())
            .finish()
    }
}

// =============================================================================
// Lifecycle Internals
// =============================================================================

impl<T: TelemetryTransport> Inner<T> {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            tracing::trace!(old_state = %old_state, new_state = %new_state, "Connection state changed");
        }
    }

    fn current(&self) -> Option<ActiveConnection> {
        *self.active.lock()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current().is_some_and(|a| a.epoch == epoch)
    }

    async fn connect_explicit(self: &Arc<Self>) -> MonitorResult<()> {
        self.auto_reconnect.store(true, Ordering::SeqCst);
        {
            let mut slot = self.reconnect.lock();
            if slot.exhausted {
                slot.exhausted = false;
                slot.attempts = 0;
            }
        }

        match self.establish().await {
            Ok(Some(_)) => {
                let mut slot = self.reconnect.lock();
                if let Some(timer) = slot.timer.take() {
                    timer.abort();
                }
                slot.attempts = 0;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.report_connect_failure(&e);
                if !e.is_superseded() {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Opens transport, session and subscription and restores items.
    ///
    /// Returns `Ok(None)` if already connected.
    async fn establish(self: &Arc<Self>) -> MonitorResult<Option<SessionId>> {
        let _guard = self.lifecycle.lock().await;

        if self.state().is_connected() {
            tracing::info!(endpoint = %self.config.endpoint, "Already connected");
            return Ok(None);
        }

        let stale = self.stale.lock().take();
        if stale.is_some() {
            tracing::debug!("Releasing handles of the lost connection");
            self.teardown(stale).await;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);
        tracing::info!(
            endpoint = %self.config.endpoint,
            security_mode = %self.config.security_mode,
            security_policy = %self.config.security_policy,
            epoch,
            "Connecting"
        );

        let active = match self.open_connection(epoch).await {
            Ok(active) => active,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.active.lock() = Some(active);
        self.registry.bind(epoch, active.subscription);
        self.set_state(ConnectionState::Connected);

        let report = self.registry.restore_all().await;
        if !self.is_current(epoch) {
            return Err(TransportError::connection_lost("connection dropped during setup").into());
        }

        tracing::info!(
            endpoint = %self.config.endpoint,
            session = %active.session,
            subscription = %active.subscription,
            monitored_items = report.restored.len(),
            "Connected"
        );
        self.events.emit(&MonitorEvent::Connected {
            endpoint: self.config.endpoint.clone(),
            session_id: active.session,
        });
        Ok(Some(active.session))
    }

    async fn open_connection(self: &Arc<Self>, epoch: u64) -> MonitorResult<ActiveConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_signal_listener(rx);

        self.transport
            .open(&self.config, LifecycleSink::new(epoch, tx))
            .await?;

        let session = match self
            .transport
            .create_session(self.config.session_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.teardown_parts(None, None).await;
                return Err(e.into());
            }
        };

        let subscription = match self
            .transport
            .create_subscription(session, &self.subscription)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.teardown_parts(None, Some(session)).await;
                return Err(e.into());
            }
        };

        tracing::debug!(
            session = %session,
            subscription = %subscription,
            publishing_interval_ms = self.subscription.publishing_interval.as_millis() as u64,
            "Session and subscription created"
        );
        Ok(ActiveConnection {
            epoch,
            session,
            subscription,
        })
    }

    fn spawn_signal_listener(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SignalEnvelope>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(
            async move {
                while let Some((epoch, signal)) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.on_signal(epoch, signal);
                }
            }
            .instrument(self.span.clone()),
        );
    }

    fn on_signal(self: &Arc<Self>, epoch: u64, signal: TransportSignal) {
        if !self.is_current(epoch) {
            tracing::debug!(epoch, ?signal, "Ignoring signal from a previous connection");
            return;
        }

        match signal {
            TransportSignal::ConnectionLost { reason } => self.on_connection_lost(epoch, reason),
            TransportSignal::ConnectionReestablished => {
                tracing::info!(epoch, "Transport channel reestablished");
            }
            TransportSignal::Backoff { attempt, delay } => {
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transport backing off"
                );
                self.events.emit(&MonitorEvent::Backoff { attempt, delay });
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>, epoch: u64, reason: String) {
        let lost = {
            let mut active = self.active.lock();
            match *active {
                Some(a) if a.epoch == epoch => active.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else {
            return;
        };

        *self.stale.lock() = Some(lost);
        self.registry.unbind();
        self.set_state(ConnectionState::ConnectionLost);

        tracing::warn!(
            endpoint = %self.config.endpoint,
            session = %lost.session,
            reason = %reason,
            "Connection lost"
        );
        self.events.emit(&MonitorEvent::ConnectionLost {
            endpoint: self.config.endpoint.clone(),
            reason,
        });

        self.schedule_reconnect();
    }

    /// Arms the reconnect timer. Returns `false` if one is already pending,
    /// a reconnect is running, or automatic reconnection is disabled.
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            tracing::debug!("Automatic reconnect disabled");
            return false;
        }

        let (attempt, delay) = {
            let mut slot = self.reconnect.lock();
            if slot.timer.is_some() || slot.in_progress {
                tracing::debug!("Reconnect already pending");
                return false;
            }

            slot.attempts += 1;
            let attempt = slot.attempts;
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            self.set_state(ConnectionState::Reconnecting);

            let inner = Arc::clone(self);
            slot.timer = Some(tokio::spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    inner.run_reconnect(attempt).await;
                }
                .instrument(self.span.clone()),
            ));
            (attempt, delay)
        };

        tracing::info!(
            attempt,
            max_retries = self.config.reconnect.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.events
            .emit(&MonitorEvent::Reconnecting { attempt, delay });
        true
    }

    async fn run_reconnect(self: Arc<Self>, attempt: u32) {
        {
            let mut slot = self.reconnect.lock();
            slot.timer = None;
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                return;
            }
            slot.in_progress = true;
        }

        tracing::info!(attempt, "Attempting reconnect");
        let result = self.establish().await;
        self.reconnect.lock().in_progress = false;

        match result {
            Ok(Some(session)) => {
                self.reconnect.lock().attempts = 0;
                tracing::info!(attempt, session = %session, "Reconnected");
                self.events.emit(&MonitorEvent::ConnectionReestablished {
                    endpoint: self.config.endpoint.clone(),
                    session_id: session,
                    attempts: attempt,
                });
                // A loss reported while the attempt was still marked running
                // could not arm a timer.
                if self.state() == ConnectionState::ConnectionLost {
                    self.schedule_reconnect();
                }
            }
            Ok(None) => tracing::debug!("Already connected, reconnect skipped"),
            Err(e) => {
                self.report_connect_failure(&e);
                if e.is_superseded() || !self.auto_reconnect.load(Ordering::SeqCst) {
                    return;
                }
                if attempt < self.config.reconnect.max_retries {
                    self.schedule_reconnect();
                } else {
                    self.reconnect.lock().exhausted = true;
                    self.set_state(ConnectionState::Disconnected);
                    tracing::error!(
                        endpoint = %self.config.endpoint,
                        attempts = attempt,
                        "Max reconnect attempts reached"
                    );
                    self.events
                        .emit(&MonitorEvent::MaxReconnectAttemptsReached { attempts: attempt });
                }
            }
        }
    }

    async fn disconnect_explicit(self: &Arc<Self>) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        {
            let mut slot = self.reconnect.lock();
            if let Some(timer) = slot.timer.take() {
                timer.abort();
                tracing::debug!("Cancelled pending reconnect");
            }
            slot.attempts = 0;
            slot.exhausted = false;
        }

        let _guard = self.lifecycle.lock().await;
        let previous = self.state();

        self.epoch.fetch_add(1, Ordering::SeqCst);
        let active = self.active.lock().take();
        let stale = self.stale.lock().take();
        self.registry.unbind();

        let target = active.or(stale);
        if previous != ConnectionState::Disconnected || target.is_some() {
            self.teardown(target).await;
        }
        self.set_state(ConnectionState::Disconnected);

        if previous != ConnectionState::Disconnected {
            tracing::info!(endpoint = %self.config.endpoint, "Disconnected");
            self.events.emit(&MonitorEvent::Disconnected {
                endpoint: self.config.endpoint.clone(),
            });
        }
    }

    async fn teardown(&self, target: Option<ActiveConnection>) {
        self.teardown_parts(target.map(|a| a.subscription), target.map(|a| a.session))
            .await;
    }

    async fn teardown_parts(
        &self,
        subscription: Option<SubscriptionId>,
        session: Option<SessionId>,
    ) {
        if let Some(subscription) = subscription {
            if let Err(e) = self.transport.terminate_subscription(subscription).await {
                tracing::warn!(subscription = %subscription, error = %e, "Failed to terminate subscription");
            }
        }
        if let Some(session) = session {
            if let Err(e) = self.transport.close_session(session).await {
                tracing::warn!(session = %session, error = %e, "Failed to close session");
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(endpoint = %self.config.endpoint, error = %e, "Failed to disconnect transport");
        }
    }

    fn report_connect_failure(&self, error: &MonitorError) {
        error.log("connect");
        if error.is_superseded() {
            return;
        }
        self.events.emit(&MonitorEvent::ConnectionError {
            endpoint: self.config.endpoint.clone(),
            error: error.to_string(),
        });
    }
}

// =============================================================================
// ConnectionManagerBuilder
// =============================================================================

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder<T: TelemetryTransport> {
    transport: Arc<T>,
    connection: Option<ConnectionConfig>,
    subscription: SubscriptionSettings,
    monitoring: MonitoringParameters,
    events: Option<Arc<EventBus>>,
    span: Option<Span>,
}

impl<T: TelemetryTransport> ConnectionManagerBuilder<T> {
    fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            connection: None,
            subscription: SubscriptionSettings::default(),
            monitoring: MonitoringParameters::default(),
            events: None,
            span: None,
        }
    }

    /// Sets the connection configuration.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = Some(config);
        self
    }

    /// Sets the subscription settings.
    pub fn subscription(mut self, settings: SubscriptionSettings) -> Self {
        self.subscription = settings;
        self
    }

    /// Sets the default monitored item parameters.
    pub fn monitoring(mut self, params: MonitoringParameters) -> Self {
        self.monitoring = params;
        self
    }

    /// Publishes events on an existing bus.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the span all manager activity is logged in.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validates the configuration and builds the manager.
    pub fn build(self) -> MonitorResult<ConnectionManager<T>> {
        let config = self.connection.unwrap_or_default();
        config.validate()?;
        self.subscription.validate()?;
        self.monitoring.validate("monitoring")?;

        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("connection", endpoint = %config.endpoint));
        let events = self.events.unwrap_or_default();
        let stats = Arc::new(StatsCollector::new());
        events.subscribe_all(stats.clone());

        let registry = SubscriptionRegistry::new(
            Arc::clone(&self.transport),
            self.monitoring,
            Arc::clone(&events),
        )
        .with_span(span.clone());

        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                config,
                subscription: self.subscription,
                transport: self.transport,
                registry,
                events,
                stats,
                state: RwLock::new(ConnectionState::Disconnected),
                active: Mutex::new(None),
                stale: Mutex::new(None),
                reconnect: Mutex::new(ReconnectSlot::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                auto_reconnect: AtomicBool::new(false),
                span,
            }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
