// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Machine monitor facade.
//!
//! [`MachineMonitor`] composes the connection manager, the state monitor and
//! the trigger emitter:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MachineMonitor                        │
//! │                                                              │
//! │  ConnectionManager ──EventBus──┬── dataChange ──▶ work queue │
//! │   └─ SubscriptionRegistry      └── connected  ──▶ work queue │
//! │                                                     │        │
//! │                                                     ▼        │
//! │                         StateMonitor (one task, in order)    │
//! │                               │                              │
//! │                               ▼                              │
//! │                         TriggerEmitter ──▶ video consumers   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! On the first successful connect the monitor reads the machine id and the
//! initial state, then monitors the state and error code items. Later
//! reconnects restore those items through the registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::client::connection::{ConnectionManager, ConnectionState};
use crate::client::registry::{DataChange, MonitoredItemSpec};
use crate::client::transport::TelemetryTransport;
use crate::config::{MachineryConfig, MonitorConfig};
use crate::error::MonitorResult;
use crate::events::{EventBus, EventKind, MonitorEvent};
use crate::machinery::state::{StateMonitor, ERROR_ITEM, STATE_ITEM};
use crate::machinery::trigger::{TriggerEmitter, TriggerEvent, TriggerHandler, TriggerHandlerId};
use crate::stats::StatsSnapshot;
use crate::types::MachineState;

// =============================================================================
// Status Types
// =============================================================================

/// Connection part of [`MachineStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// `true` while connected.
    pub is_connected: bool,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Endpoint URL.
    pub endpoint: String,
}

/// Snapshot of the monitored machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineStatus {
    /// Machine identifier, if known.
    pub machine_id: Option<String>,
    /// Latest state.
    pub current_state: Option<MachineState>,
    /// Name of the latest state.
    pub state_name: String,
    /// State before the last change.
    pub previous_state: Option<MachineState>,
    /// Time of the last change.
    pub last_state_change: Option<DateTime<Utc>>,
    /// `true` while executing.
    pub is_operational: bool,
    /// `true` while out of service.
    pub is_stopped: bool,
    /// Connection status.
    pub connection_status: ConnectionStatus,
}

/// Statistics of a [`MachineMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    /// Connection and event counters.
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    /// Lifecycle state.
    pub connection_state: ConnectionState,
    /// `true` while a reconnect is pending or running.
    pub reconnecting: bool,
    /// Registered monitored items.
    pub monitored_items: usize,
    /// Triggers emitted, automatic and manual.
    pub triggers_emitted: u64,
}

// =============================================================================
// MachineMonitor
// =============================================================================

enum Work {
    Change(DataChange),
    Connected,
}

struct Core<T: TelemetryTransport> {
    manager: ConnectionManager<T>,
    state: Arc<StateMonitor>,
    config: MachineryConfig,
    initialized: tokio::sync::Mutex<bool>,
}

impl<T: TelemetryTransport> Core<T> {
    /// Reads identity and initial state, then monitors the machinery items.
    /// Runs once per monitor; a failed run is repeated on the next connect.
    ///
    /// Only the state item is required. The error code item is monitored
    /// when error details are enabled, and a failure there is logged.
    async fn ensure_initialized(&self) -> MonitorResult<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.read_identity().await;

        let state_item = MonitoredItemSpec::new(self.config.machine_state_node.clone(), STATE_ITEM)
            .sampling_interval(self.config.state_sampling_interval)
            .queue_size(1);
        self.manager.monitor(state_item).await?;

        if self.config.include_error_details {
            let error_item =
                MonitoredItemSpec::new(self.config.error_code_node.clone(), ERROR_ITEM)
                    .sampling_interval(self.config.error_sampling_interval)
                    .queue_size(1);
            if let Err(e) = self.manager.monitor(error_item).await {
                tracing::warn!(
                    error_node = %self.config.error_code_node,
                    error = %e,
                    "Error code not monitored, continuing with state only"
                );
            }
        }

        *initialized = true;
        tracing::info!(
            state_node = %self.config.machine_state_node,
            error_node = %self.config.error_code_node,
            error_details = self.config.include_error_details,
            "Machinery monitoring started"
        );
        Ok(())
    }

    async fn read_identity(&self) {
        match self.manager.read(&self.config.machine_id_node).await {
            Ok(value) if !value.value.is_null() => {
                let machine_id = value.value.to_string();
                tracing::info!(machine_id = %machine_id, "Machine identified");
                self.state.set_machine_id(machine_id);
            }
            Ok(_) => tracing::warn!("Machine id node holds no value"),
            Err(e) => tracing::warn!(error = %e, "Could not read machine id"),
        }

        match self.manager.read(&self.config.machine_state_node).await {
            Ok(value) => {
                self.state.seed(MachineState::from_variant(&value.value));
            }
            Err(e) => tracing::warn!(error = %e, "Could not read initial machine state"),
        }
    }
}

/// Monitors one machine's state and raises video triggers.
pub struct MachineMonitor<T: TelemetryTransport> {
    core: Arc<Core<T>>,
    triggers: Arc<TriggerEmitter>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Work>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl<T: TelemetryTransport> MachineMonitor<T> {
    /// Creates a monitor logging under a `machine_monitor` span.
    pub fn new(transport: Arc<T>, config: MonitorConfig) -> MonitorResult<Self> {
        let span = tracing::info_span!("machine_monitor", endpoint = %config.connection.endpoint);
        Self::with_span(transport, config, span)
    }

    /// Creates a monitor logging under `span`.
    pub fn with_span(transport: Arc<T>, config: MonitorConfig, span: Span) -> MonitorResult<Self> {
        config.validate()?;

        let manager = ConnectionManager::builder(transport)
            .connection(config.connection.clone())
            .subscription(config.subscription.clone())
            .monitoring(config.monitoring.clone())
            .span(span.clone())
            .build()?;

        let triggers = Arc::new(TriggerEmitter::default());
        let state = Arc::new(StateMonitor::new(
            config.machinery.clone(),
            config.connection.application_name.clone(),
            Arc::new(manager.clone()),
            Arc::clone(manager.events()),
            Arc::clone(&triggers),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let changes = tx.clone();
        manager
            .events()
            .on(EventKind::DataChange, "state_monitor", move |event| {
                if let MonitorEvent::DataChange(change) = event {
                    if change.display_name == STATE_ITEM || change.display_name == ERROR_ITEM {
                        let _ = changes.send(Work::Change(change.clone()));
                    }
                }
            });
        manager
            .events()
            .on(EventKind::Connected, "machinery_setup", move |_| {
                let _ = tx.send(Work::Connected);
            });

        let monitor = Self {
            core: Arc::new(Core {
                manager,
                state,
                config: config.machinery,
                initialized: tokio::sync::Mutex::new(false),
            }),
            triggers,
            queue: Mutex::new(Some(rx)),
            pump: Mutex::new(None),
            span,
        };
        // Connects made directly on the connection manager still reach the
        // state monitor once a runtime is present.
        if let Ok(handle) = Handle::try_current() {
            monitor.start_pump(&handle);
        }
        Ok(monitor)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connects and, the first time, starts machinery monitoring.
    pub async fn connect(&self) -> MonitorResult<()> {
        if let Ok(handle) = Handle::try_current() {
            self.start_pump(&handle);
        }
        self.core.manager.connect().await?;
        self.core
            .ensure_initialized()
            .instrument(self.span.clone())
            .await
    }

    /// Disconnects and stops automatic reconnection.
    pub async fn disconnect(&self) {
        self.core.manager.disconnect().await;
    }

    /// Starts the task draining the work queue. Later calls are no-ops.
    fn start_pump(&self, handle: &Handle) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let Some(mut rx) = self.queue.lock().take() else {
            return;
        };

        let core = Arc::clone(&self.core);
        *pump = Some(handle.spawn(
            async move {
                while let Some(work) = rx.recv().await {
                    match work {
                        Work::Change(change) => core.state.process(&change).await,
                        Work::Connected => {
                            if let Err(e) = core.ensure_initialized().await {
                                e.log("machinery setup");
                            }
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        ));
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Raises a manual trigger without changing the state record.
    pub fn manual_trigger(&self, reason: impl Into<String>) -> Arc<TriggerEvent> {
        self.core.state.manual_trigger(reason)
    }

    /// Registers a video trigger handler.
    pub fn on_video_trigger(&self, handler: Arc<dyn TriggerHandler>) -> TriggerHandlerId {
        self.triggers.on_video_trigger(handler)
    }

    /// Removes a video trigger handler.
    pub fn off_video_trigger(&self, id: TriggerHandlerId) -> bool {
        self.triggers.off_video_trigger(id)
    }

    /// Returns a broadcast receiver of trigger events.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<Arc<TriggerEvent>> {
        self.triggers.subscribe()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns the machine status.
    pub fn machine_status(&self) -> MachineStatus {
        let record = self.core.state.record();
        let manager = &self.core.manager;
        let current = record.current;
        MachineStatus {
            machine_id: self.core.state.machine_id(),
            current_state: current,
            state_name: current.unwrap_or(MachineState::Unknown(None)).name().to_string(),
            previous_state: record.previous,
            last_state_change: record.changed_at,
            is_operational: current.is_some_and(|s| s.is_operational()),
            is_stopped: current.is_some_and(|s| s.is_stopped()),
            connection_status: ConnectionStatus {
                is_connected: manager.is_connected(),
                state: manager.state(),
                endpoint: manager.config().endpoint.clone(),
            },
        }
    }

    /// Returns the monitor statistics.
    pub fn stats(&self) -> MonitorStats {
        let manager = &self.core.manager;
        MonitorStats {
            stats: manager.stats(),
            connection_state: manager.state(),
            reconnecting: manager.is_reconnecting(),
            monitored_items: manager.registry().len(),
            triggers_emitted: self.triggers.emitted_count(),
        }
    }

    /// Returns the event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        self.core.manager.events()
    }

    /// Returns the connection manager.
    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.core.manager
    }

    /// Returns the state monitor.
    pub fn state_monitor(&self) -> &Arc<StateMonitor> {
        &self.core.state
    }

    /// Returns the trigger emitter.
    pub fn triggers(&self) -> &Arc<TriggerEmitter> {
        &self.triggers
    }
}

impl<T: TelemetryTransport> Drop for MachineMonitor<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl<T: TelemetryTransport> std::fmt::Debug for MachineMonitor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineMonitor")
            .field("connection", &self.core.manager)
            .field("state", &self.core.state)
            .field("triggers", &self.triggers)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::simulator::SimulatedTransport;
    use crate::events::CollectorHandler;
    use std::time::Duration;

    fn setup() -> (
        Arc<SimulatedTransport>,
        MachineMonitor<SimulatedTransport>,
        Arc<CollectorHandler>,
    ) {
        let config = MonitorConfig::default();
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_value(config.machinery.machine_id_node.clone(), "press-07")
                .with_value(config.machinery.machine_state_node.clone(), MachineState::Executing)
                .with_value(config.machinery.error_code_node.clone(), 0i64),
        );
        let monitor = MachineMonitor::new(transport.clone(), config).unwrap();
        let collector = Arc::new(CollectorHandler::new());
        monitor.events().subscribe_all(collector.clone());
        (transport, monitor, collector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_reads_identity_and_monitors() {
        let (transport, monitor, collector) = setup();
        monitor.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = monitor.machine_status();
        assert_eq!(status.machine_id.as_deref(), Some("press-07"));
        assert_eq!(status.current_state, Some(MachineState::Executing));
        assert_eq!(status.previous_state, Some(MachineState::Executing));
        assert!(status.is_operational);
        assert!(!status.is_stopped);
        assert!(status.connection_status.is_connected);

        assert_eq!(monitor.stats().monitored_items, 2);
        assert_eq!(transport.item_count(), 2);
        // The initial notification repeats the seeded state.
        assert_eq!(collector.count(EventKind::StateChanged), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reaches_video_handlers() {
        let (transport, monitor, collector) = setup();
        let mut triggers = monitor.subscribe_triggers();
        monitor.connect().await.unwrap();

        let state_node = MonitorConfig::default().machinery.machine_state_node;
        transport.set_value(&state_node, MachineState::OutOfService);

        let trigger = triggers.recv().await.unwrap();
        assert_eq!(trigger.state.previous, Some(MachineState::Executing));
        assert_eq!(trigger.state.current, Some(MachineState::OutOfService));
        assert_eq!(trigger.machine_id.as_deref(), Some("press-07"));
        assert_eq!(collector.count(EventKind::EquipmentStop), 1);
        assert_eq!(monitor.stats().stats.equipment_stops, 1);
        assert!(monitor.machine_status().is_stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_runs_after_late_connect() {
        let (transport, monitor, _collector) = setup();
        transport.fail_next_connects(1);

        assert!(monitor.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(monitor.connection().is_connected());
        assert_eq!(monitor.stats().monitored_items, 2);
        assert_eq!(
            monitor.machine_status().current_state,
            Some(MachineState::Executing)
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = MonitorConfig::default();
        config.machinery.trigger_states.clear();
        let result = MachineMonitor::new(Arc::new(SimulatedTransport::new()), config);
        assert!(result.is_err());
    }
}
