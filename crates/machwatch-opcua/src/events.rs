// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitor events and their dispatch.
//!
//! Every observable occurrence is a variant of [`MonitorEvent`]. Consumers
//! register an [`EventHandler`] on the [`EventBus`] for the [`EventKind`]s
//! they care about (or for all of them). Handlers run synchronously in
//! registration order; a handler that fails or panics is logged and the
//! remaining handlers still run.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use machwatch_opcua::events::{CollectorHandler, EventBus, EventKind, MonitorEvent};
//!
//! let bus = EventBus::new();
//! let collector = Arc::new(CollectorHandler::new());
//! bus.subscribe(EventKind::MaxReconnectAttemptsReached, collector.clone());
//!
//! bus.emit(&MonitorEvent::MaxReconnectAttemptsReached { attempts: 10 });
//! assert_eq!(collector.count(EventKind::MaxReconnectAttemptsReached), 1);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::client::registry::DataChange;
use crate::client::transport::SessionId;
use crate::error::HandlerError;
use crate::machinery::state::{ErrorReport, StateChange};
use crate::machinery::trigger::TriggerEvent;
use crate::types::NodeId;

// =============================================================================
// MonitorEvent
// =============================================================================

/// Events published by a machine monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A session and subscription are up.
    Connected {
        /// Endpoint URL.
        endpoint: String,
        /// New session.
        session_id: SessionId,
    },
    /// The monitor was disconnected on request.
    Disconnected {
        /// Endpoint URL.
        endpoint: String,
    },
    /// The transport reported a dropped connection.
    ConnectionLost {
        /// Endpoint URL.
        endpoint: String,
        /// Reason reported by the transport.
        reason: String,
    },
    /// An automatic reconnect succeeded.
    ConnectionReestablished {
        /// Endpoint URL.
        endpoint: String,
        /// New session.
        session_id: SessionId,
        /// Attempts it took.
        attempts: u32,
    },
    /// A connect attempt failed.
    ConnectionError {
        /// Endpoint URL.
        endpoint: String,
        /// Failure description.
        error: String,
    },
    /// A reconnect timer was armed.
    Reconnecting {
        /// Attempt number, 1-based.
        attempt: u32,
        /// Delay until the attempt.
        delay: Duration,
    },
    /// The protocol stack reported its own backoff.
    Backoff {
        /// Stack retry number.
        attempt: u32,
        /// Stack delay.
        delay: Duration,
    },
    /// Automatic reconnection gave up.
    MaxReconnectAttemptsReached {
        /// Attempts made.
        attempts: u32,
    },
    /// A monitored item delivered a value.
    DataChange(DataChange),
    /// A monitored item failed.
    MonitoringError {
        /// Registry key of the item.
        display_name: String,
        /// Monitored node, when known.
        node_id: Option<NodeId>,
        /// Failure description.
        cause: String,
    },
    /// The machine state changed.
    StateChanged(StateChange),
    /// The machine entered a trigger state.
    EquipmentStop(Arc<TriggerEvent>),
    /// The machine reported a non-zero error code.
    ErrorDetected(ErrorReport),
    /// A trigger was raised by hand.
    ManualTrigger(Arc<TriggerEvent>),
}

impl MonitorEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::ConnectionReestablished { .. } => EventKind::ConnectionReestablished,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Backoff { .. } => EventKind::Backoff,
            Self::MaxReconnectAttemptsReached { .. } => EventKind::MaxReconnectAttemptsReached,
            Self::DataChange(_) => EventKind::DataChange,
            Self::MonitoringError { .. } => EventKind::MonitoringError,
            Self::StateChanged(_) => EventKind::StateChanged,
            Self::EquipmentStop(_) => EventKind::EquipmentStop,
            Self::ErrorDetected(_) => EventKind::ErrorDetected,
            Self::ManualTrigger(_) => EventKind::ManualTrigger,
        }
    }
}

// =============================================================================
// EventKind
// =============================================================================

/// Discriminant of [`MonitorEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// See [`MonitorEvent::Connected`].
    Connected,
    /// See [`MonitorEvent::Disconnected`].
    Disconnected,
    /// See [`MonitorEvent::ConnectionLost`].
    ConnectionLost,
    /// See [`MonitorEvent::ConnectionReestablished`].
    ConnectionReestablished,
    /// See [`MonitorEvent::ConnectionError`].
    ConnectionError,
    /// See [`MonitorEvent::Reconnecting`].
    Reconnecting,
    /// See [`MonitorEvent::Backoff`].
    Backoff,
    /// See [`MonitorEvent::MaxReconnectAttemptsReached`].
    MaxReconnectAttemptsReached,
    /// See [`MonitorEvent::DataChange`].
    DataChange,
    /// See [`MonitorEvent::MonitoringError`].
    MonitoringError,
    /// See [`MonitorEvent::StateChanged`].
    StateChanged,
    /// See [`MonitorEvent::EquipmentStop`].
    EquipmentStop,
    /// See [`MonitorEvent::ErrorDetected`].
    ErrorDetected,
    /// See [`MonitorEvent::ManualTrigger`].
    ManualTrigger,
}

impl EventKind {
    /// Returns the event name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectionLost => "connectionLost",
            Self::ConnectionReestablished => "connectionReestablished",
            Self::ConnectionError => "connectionError",
            Self::Reconnecting => "reconnecting",
            Self::Backoff => "backoff",
            Self::MaxReconnectAttemptsReached => "maxReconnectAttemptsReached",
            Self::DataChange => "dataChange",
            Self::MonitoringError => "monitoringError",
            Self::StateChanged => "stateChanged",
            Self::EquipmentStop => "equipmentStop",
            Self::ErrorDetected => "errorDetected",
            Self::ManualTrigger => "manualTrigger",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// EventHandler
// =============================================================================

/// Consumer of monitor events.
pub trait EventHandler: Send + Sync {
    /// Returns the handler name used in logs.
    fn name(&self) -> &str;

    /// Handles an event. Errors are logged by the bus.
    fn handle(&self, event: &MonitorEvent) -> Result<(), HandlerError>;
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&MonitorEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &MonitorEvent) -> Result<(), HandlerError> {
        (self.f)(event)
    }
}

/// Wraps a closure into an [`EventHandler`].
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&MonitorEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Runs a consumer callback, turning a panic into a [`HandlerError`].
pub(crate) fn invoke_guarded<F>(name: &str, f: F) -> Result<(), HandlerError>
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::panicked(name, panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Identifier returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    handler: Arc<dyn EventHandler>,
}

/// Dispatches events to per-kind subscriber lists.
pub struct EventBus {
    by_kind: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    wildcard: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            by_kind: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
        }
    }

    /// Registers a handler for one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriberId {
        let id = self.next_id();
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, handler });
        id
    }

    /// Registers a handler for every event kind.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriberId {
        let id = self.next_id();
        self.wildcard.write().push(Subscriber { id, handler });
        id
    }

    /// Registers an infallible closure for one event kind.
    pub fn on<F>(&self, kind: EventKind, name: impl Into<String>, f: F) -> SubscriberId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            kind,
            handler_fn(name, move |event| {
                f(event);
                Ok(())
            }),
        )
    }

    /// Removes a subscription. Returns `false` if it was unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        {
            let mut by_kind = self.by_kind.write();
            for subscribers in by_kind.values_mut() {
                if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                    subscribers.remove(pos);
                    return true;
                }
            }
        }
        let mut wildcard = self.wildcard.write();
        match wildcard.iter().position(|s| s.id == id) {
            Some(pos) => {
                wildcard.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Dispatches an event. Returns the number of handlers that succeeded.
    pub fn emit(&self, event: &MonitorEvent) -> usize {
        let kind = event.kind();
        let mut targets: Vec<Subscriber> = self
            .by_kind
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        targets.extend(self.wildcard.read().iter().cloned());

        let mut delivered = 0;
        for subscriber in targets {
            let handler = &subscriber.handler;
            match invoke_guarded(handler.name(), || handler.handle(event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        handler = handler.name(),
                        event = kind.as_str(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }
        delivered
    }

    /// Returns the number of handlers that would receive `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let specific = self.by_kind.read().get(&kind).map_or(0, Vec::len);
        specific + self.wildcard.read().len()
    }

    /// Returns how many handler invocations failed so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<_> = self
            .by_kind
            .read()
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(k, s)| (k.as_str(), s.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("subscribers", &kinds)
            .field("wildcard", &self.wildcard.read().len())
            .finish()
    }
}

// =============================================================================
// Built-in Handlers
// =============================================================================

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingHandler;

impl EventHandler for TracingHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    fn handle(&self, event: &MonitorEvent) -> Result<(), HandlerError> {
        match event {
            MonitorEvent::DataChange(change) => tracing::trace!(
                display_name = %change.display_name,
                value = %change.value,
                "dataChange"
            ),
            MonitorEvent::StateChanged(change) => tracing::info!(
                previous = ?change.previous,
                current = %change.current,
                "stateChanged"
            ),
            MonitorEvent::EquipmentStop(trigger) | MonitorEvent::ManualTrigger(trigger) => {
                tracing::info!(trigger_id = %trigger.id, kind = ?trigger.kind, "{}", event.kind())
            }
            other => tracing::debug!(event = other.kind().as_str(), "{other:?}"),
        }
        Ok(())
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct CollectorHandler {
    events: Mutex<Vec<MonitorEvent>>,
}

impl CollectorHandler {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    /// Returns the kinds of the recorded events in order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(MonitorEvent::kind).collect()
    }

    /// Returns how many events of `kind` were recorded.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Removes all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventHandler for CollectorHandler {
    fn name(&self) -> &str {
        "collector"
    }

    fn handle(&self, event: &MonitorEvent) -> Result<(), HandlerError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn lost() -> MonitorEvent {
        MonitorEvent::ConnectionLost {
            endpoint: "opc.tcp://plc:4840".into(),
            reason: "socket closed".into(),
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let bus = EventBus::new();
        let lost_events = Arc::new(CollectorHandler::new());
        let all_events = Arc::new(CollectorHandler::new());

        bus.subscribe(EventKind::ConnectionLost, lost_events.clone());
        bus.subscribe_all(all_events.clone());

        bus.emit(&lost());
        bus.emit(&MonitorEvent::MaxReconnectAttemptsReached { attempts: 3 });

        assert_eq!(lost_events.kinds(), vec![EventKind::ConnectionLost]);
        assert_eq!(all_events.events().len(), 2);
        assert_eq!(bus.subscriber_count(EventKind::ConnectionLost), 2);
        assert_eq!(bus.subscriber_count(EventKind::DataChange), 1);
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::ConnectionLost,
            handler_fn("broken", |_| Err(HandlerError::failed("broken", "boom"))),
        );
        bus.subscribe(
            EventKind::ConnectionLost,
            handler_fn("panicky", |_| panic!("handler bug")),
        );
        let counter = calls.clone();
        bus.on(EventKind::ConnectionLost, "counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.emit(&lost());

        assert_eq!(delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.failure_count(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let collector = Arc::new(CollectorHandler::new());
        let id = bus.subscribe(EventKind::ConnectionLost, collector.clone());
        let wildcard = bus.subscribe_all(Arc::new(TracingHandler));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(bus.unsubscribe(wildcard));

        bus.emit(&lost());
        assert!(collector.events().is_empty());
        assert_eq!(bus.subscriber_count(EventKind::ConnectionLost), 0);
    }

    #[test]
    fn test_invoke_guarded_reports_panic_message() {
        let err = invoke_guarded("video", || panic!("disk full")).unwrap_err();
        assert!(matches!(err, HandlerError::Panicked { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::MaxReconnectAttemptsReached.as_str(), "maxReconnectAttemptsReached");
        assert_eq!(lost().kind().to_string(), "connectionLost");
    }
}
