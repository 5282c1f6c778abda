// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Video trigger events and their fan-out.
//!
//! [`TriggerEmitter`] is separate from the monitor's event bus so that the
//! video pipeline, telemetry and test harnesses can come and go without
//! touching each other. Consumers either register a [`TriggerHandler`]
//! (called synchronously, in registration order) or take a broadcast
//! receiver from [`TriggerEmitter::subscribe`].
//!
//! ```text
//! StateMonitor ──▶ TriggerEmitter ──┬──▶ handler (video pipeline)
//!                                   ├──▶ handler (telemetry)
//!                                   └──▶ broadcast receivers
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::events::invoke_guarded;
use crate::types::{MachineState, NodeId, Variant};

/// `trigger_source` of triggers raised by a state transition.
pub const TRIGGER_SOURCE_MACHINERY: &str = "machinery_item_state";

/// `trigger_source` of triggers raised by hand.
pub const TRIGGER_SOURCE_MANUAL: &str = "manual";

/// Default capacity of the broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

// =============================================================================
// TriggerEvent
// =============================================================================

/// How a trigger was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// The machine entered a trigger state.
    Automatic,
    /// Raised through `manual_trigger`.
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Machine state at trigger time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerState {
    /// State before the transition.
    pub previous: Option<MachineState>,
    /// State after the transition.
    pub current: Option<MachineState>,
    /// Name of the current state.
    pub name: String,
}

impl TriggerState {
    /// Creates a state snapshot.
    pub fn new(previous: Option<MachineState>, current: Option<MachineState>) -> Self {
        Self {
            previous,
            current,
            name: current.unwrap_or(MachineState::Unknown(None)).name().to_string(),
        }
    }
}

/// Error code read while building a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetails {
    /// Error code value.
    pub code: Variant,
    /// Source timestamp of the code.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Notification that caused an automatic trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerSource {
    /// State node.
    pub node_id: NodeId,
    /// Source timestamp of the notification.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp of the notification.
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Origin information attached to every trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerMetadata {
    /// `machinery_item_state` or `manual`.
    pub trigger_source: String,
    /// Application name of this client.
    pub client_id: String,
    /// Session that observed the trigger.
    pub session_id: Option<String>,
}

/// Context shared by automatic and manual triggers.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    /// Machine identifier, if known.
    pub machine_id: Option<String>,
    /// State snapshot.
    pub state: TriggerState,
    /// Application name of this client.
    pub client_id: String,
    /// Live session, if any.
    pub session_id: Option<String>,
}

/// Immutable record of an equipment stop, handed to video consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    /// Unique trigger id.
    pub id: Uuid,
    /// How the trigger was raised.
    pub kind: TriggerKind,
    /// Creation time.
    pub trigger_time: DateTime<Utc>,
    /// Machine identifier, if known.
    pub machine_id: Option<String>,
    /// State snapshot.
    pub state: TriggerState,
    /// Error code at trigger time; `None` if unavailable.
    pub error_details: Option<ErrorDetails>,
    /// Reason given for a manual trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Notification behind an automatic trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<TriggerSource>,
    /// Origin information.
    pub metadata: TriggerMetadata,
}

impl TriggerEvent {
    /// Builds an automatic trigger.
    pub fn automatic(
        context: TriggerContext,
        source: TriggerSource,
        error_details: Option<ErrorDetails>,
    ) -> Self {
        Self::build(TriggerKind::Automatic, context, error_details, None, Some(source))
    }

    /// Builds a manual trigger.
    pub fn manual(context: TriggerContext, reason: impl Into<String>) -> Self {
        Self::build(TriggerKind::Manual, context, None, Some(reason.into()), None)
    }

    fn build(
        kind: TriggerKind,
        context: TriggerContext,
        error_details: Option<ErrorDetails>,
        reason: Option<String>,
        source: Option<TriggerSource>,
    ) -> Self {
        let trigger_source = match kind {
            TriggerKind::Automatic => TRIGGER_SOURCE_MACHINERY,
            TriggerKind::Manual => TRIGGER_SOURCE_MANUAL,
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            trigger_time: Utc::now(),
            machine_id: context.machine_id,
            state: context.state,
            error_details,
            reason,
            source,
            metadata: TriggerMetadata {
                trigger_source: trigger_source.to_string(),
                client_id: context.client_id,
                session_id: context.session_id,
            },
        }
    }

    /// Returns `true` for manual triggers.
    #[inline]
    pub fn is_manual(&self) -> bool {
        self.kind == TriggerKind::Manual
    }

    /// Serializes the event as a JSON line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// TriggerHandler
// =============================================================================

/// Consumer of trigger events.
pub trait TriggerHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one trigger.
    fn on_trigger(&self, event: &TriggerEvent) -> Result<(), HandlerError>;
}

struct FnTriggerHandler<F> {
    name: String,
    f: F,
}

impl<F> TriggerHandler for FnTriggerHandler<F>
where
    F: Fn(&TriggerEvent) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_trigger(&self, event: &TriggerEvent) -> Result<(), HandlerError> {
        (self.f)(event);
        Ok(())
    }
}

/// Wraps a closure as a [`TriggerHandler`].
pub fn trigger_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn TriggerHandler>
where
    F: Fn(&TriggerEvent) + Send + Sync + 'static,
{
    Arc::new(FnTriggerHandler {
        name: name.into(),
        f,
    })
}

/// Identifier returned by [`TriggerEmitter::on_video_trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandlerId(u64);

// =============================================================================
// TriggerEmitter
// =============================================================================

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct TriggerDelivery {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handler failures, including panics.
    pub failed: Vec<HandlerError>,
    /// Broadcast receivers reached.
    pub broadcast: usize,
}

/// Fan-out point for trigger events.
pub struct TriggerEmitter {
    handlers: RwLock<Vec<(TriggerHandlerId, Arc<dyn TriggerHandler>)>>,
    sender: broadcast::Sender<Arc<TriggerEvent>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    failures: AtomicU64,
}

impl TriggerEmitter {
    /// Creates an emitter whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            sender,
            next_id: AtomicU64::new(1),
            emitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Registers a video trigger handler.
    pub fn on_video_trigger(&self, handler: Arc<dyn TriggerHandler>) -> TriggerHandlerId {
        let id = TriggerHandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(handler = handler.name(), "Video trigger handler registered");
        self.handlers.write().push((id, handler));
        id
    }

    /// Removes a video trigger handler. Returns `false` if it was unknown.
    pub fn off_video_trigger(&self, id: TriggerHandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        before != handlers.len()
    }

    /// Returns a receiver of every future trigger.
    ///
    /// Slow receivers lose the oldest events once the channel is full.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TriggerEvent>> {
        self.sender.subscribe()
    }

    /// Delivers `event` to every handler and broadcast receiver.
    ///
    /// A failing or panicking handler is logged and does not stop the
    /// remaining ones.
    pub fn emit(&self, event: &Arc<TriggerEvent>) -> TriggerDelivery {
        // Snapshot so handlers may (un)register from inside a callback.
        let handlers: Vec<_> = self.handlers.read().iter().map(|(_, h)| h.clone()).collect();
        let mut delivery = TriggerDelivery::default();

        for handler in handlers {
            match invoke_guarded(handler.name(), || handler.on_trigger(event)) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        handler = handler.name(),
                        trigger_id = %event.id,
                        error = %e,
                        "Video trigger handler failed"
                    );
                    delivery.failed.push(e);
                }
            }
        }

        delivery.broadcast = self.sender.send(Arc::clone(event)).unwrap_or(0);
        self.emitted.fetch_add(1, Ordering::Relaxed);
        delivery
    }

    /// Builds a manual trigger from `context` and delivers it.
    pub fn manual_trigger(
        &self,
        context: TriggerContext,
        reason: impl Into<String>,
    ) -> Arc<TriggerEvent> {
        let event = Arc::new(TriggerEvent::manual(context, reason));
        tracing::info!(
            trigger_id = %event.id,
            reason = event.reason.as_deref().unwrap_or_default(),
            "Manual trigger"
        );
        self.emit(&event);
        event
    }

    /// Returns the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns the number of triggers emitted.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Returns the number of handler failures so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for TriggerEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl fmt::Debug for TriggerEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEmitter")
            .field("handlers", &self.handler_count())
            .field("receivers", &self.sender.receiver_count())
            .field("emitted", &self.emitted_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
