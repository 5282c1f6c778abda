// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Machine state transition detection.
//!
//! [`StateMonitor`] consumes normalized data changes of two monitored items:
//!
//! - [`STATE_ITEM`]: the machine state. A value equal to the current state
//!   is dropped. Any other value updates the [`StateRecord`], emits
//!   `stateChanged`, and for a configured trigger state raises an automatic
//!   [`TriggerEvent`].
//! - [`ERROR_ITEM`]: the error code. Non-zero codes emit `errorDetected`
//!   and never touch the state record.
//!
//! The monitor is unaware of reconnects; it only sees the data changes the
//! registry delivers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::client::connection::NodeReader;
use crate::client::registry::DataChange;
use crate::config::MachineryConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::machinery::trigger::{
    ErrorDetails, TriggerContext, TriggerEmitter, TriggerEvent, TriggerSource, TriggerState,
};
use crate::types::{MachineState, Variant};

/// Display name of the machine state item.
pub const STATE_ITEM: &str = "MachineryItemState";

/// Display name of the error code item.
pub const ERROR_ITEM: &str = "MachineryErrorCode";

// =============================================================================
// Records
// =============================================================================

/// Current and previous machine state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateRecord {
    /// State before the last change.
    pub previous: Option<MachineState>,
    /// Latest state.
    pub current: Option<MachineState>,
    /// Time of the last change.
    pub changed_at: Option<DateTime<Utc>>,
}

/// Payload of `stateChanged`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    /// Machine identifier, if known.
    pub machine_id: Option<String>,
    /// State before the change.
    pub previous: Option<MachineState>,
    /// New state.
    pub current: MachineState,
    /// Name of the new state.
    pub name: String,
    /// Local time of the change.
    pub timestamp: DateTime<Utc>,
    /// Source timestamp of the notification.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp of the notification.
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Payload of `errorDetected`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Machine identifier, if known.
    pub machine_id: Option<String>,
    /// Reported error code.
    pub code: Variant,
    /// Machine state when the code was reported.
    pub current_state: Option<MachineState>,
    /// Local receive time.
    pub timestamp: DateTime<Utc>,
    /// Source timestamp of the notification.
    pub source_timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// StateMonitor
// =============================================================================

/// Turns machine state notifications into transitions and triggers.
pub struct StateMonitor {
    config: MachineryConfig,
    client_id: String,
    record: Mutex<StateRecord>,
    machine_id: RwLock<Option<String>>,
    reader: Arc<dyn NodeReader>,
    events: Arc<EventBus>,
    triggers: Arc<TriggerEmitter>,
}

impl StateMonitor {
    /// Creates a monitor with an empty state record.
    ///
    /// `reader` is used for the error code read during trigger construction.
    pub fn new(
        config: MachineryConfig,
        client_id: impl Into<String>,
        reader: Arc<dyn NodeReader>,
        events: Arc<EventBus>,
        triggers: Arc<TriggerEmitter>,
    ) -> Self {
        Self {
            config,
            client_id: client_id.into(),
            record: Mutex::new(StateRecord::default()),
            machine_id: RwLock::new(None),
            reader,
            events,
            triggers,
        }
    }

    /// Sets the machine identifier attached to events.
    pub fn set_machine_id(&self, machine_id: impl Into<String>) {
        *self.machine_id.write() = Some(machine_id.into());
    }

    /// Returns the machine identifier.
    pub fn machine_id(&self) -> Option<String> {
        self.machine_id.read().clone()
    }

    /// Returns a copy of the state record.
    pub fn record(&self) -> StateRecord {
        *self.record.lock()
    }

    /// Initializes current and previous state without emitting anything.
    ///
    /// Applies only while no state is known. Returns `false` when the record
    /// already holds a state, which is then left untouched.
    pub fn seed(&self, state: MachineState) -> bool {
        let mut record = self.record.lock();
        if let Some(current) = record.current {
            tracing::debug!(current = %current, ignored = %state, "Machine state already known");
            return false;
        }
        record.previous = Some(state);
        record.current = Some(state);
        record.changed_at = Some(Utc::now());
        tracing::info!(state = %state, "Initial machine state");
        true
    }

    /// Returns the machinery configuration.
    pub fn config(&self) -> &MachineryConfig {
        &self.config
    }

    /// Processes one data change. Items other than the state and error code
    /// items are ignored.
    pub async fn process(&self, change: &DataChange) {
        match change.display_name.as_str() {
            STATE_ITEM => self.on_state_change(change).await,
            ERROR_ITEM => self.on_error_code(change),
            _ => {}
        }
    }

    /// Raises a manual trigger from the current state record.
    ///
    /// The record is not modified.
    pub fn manual_trigger(&self, reason: impl Into<String>) -> Arc<TriggerEvent> {
        let record = self.record();
        let context = self.context(record.previous, record.current);
        let event = self.triggers.manual_trigger(context, reason);
        self.events.emit(&MonitorEvent::ManualTrigger(Arc::clone(&event)));
        event
    }

    async fn on_state_change(&self, change: &DataChange) {
        if change.status.is_bad() {
            tracing::warn!(
                status = %change.status,
                value = %change.value,
                "Ignoring machine state sample with bad status"
            );
            return;
        }

        let state = MachineState::from_variant(&change.value);
        let previous = {
            let mut record = self.record.lock();
            if record.current == Some(state) {
                tracing::trace!(state = %state, "Machine state unchanged");
                return;
            }
            let previous = record.current;
            record.previous = previous;
            record.current = Some(state);
            record.changed_at = Some(Utc::now());
            previous
        };

        tracing::info!(
            previous = previous.map(|s| s.name()).unwrap_or("none"),
            current = %state,
            "Machine state changed"
        );
        self.events.emit(&MonitorEvent::StateChanged(StateChange {
            machine_id: self.machine_id(),
            previous,
            current: state,
            name: state.name().to_string(),
            timestamp: Utc::now(),
            source_timestamp: change.source_timestamp,
            server_timestamp: change.server_timestamp,
        }));

        if self.config.is_trigger_state(state) {
            self.raise_trigger(previous, state, change).await;
        }
    }

    async fn raise_trigger(
        &self,
        previous: Option<MachineState>,
        state: MachineState,
        change: &DataChange,
    ) {
        tracing::warn!(state = %state, "Equipment stop detected");

        let error_details = if self.config.include_error_details {
            self.read_error_details().await
        } else {
            None
        };

        let event = Arc::new(TriggerEvent::automatic(
            self.context(previous, Some(state)),
            TriggerSource {
                node_id: change.node_id.clone(),
                source_timestamp: change.source_timestamp,
                server_timestamp: change.server_timestamp,
            },
            error_details,
        ));

        let delivery = self.triggers.emit(&event);
        self.events
            .emit(&MonitorEvent::EquipmentStop(Arc::clone(&event)));
        tracing::info!(
            trigger_id = %event.id,
            handlers = delivery.delivered,
            failed = delivery.failed.len(),
            "Video trigger emitted"
        );
    }

    /// Single bounded read of the error code. Any failure yields `None`.
    async fn read_error_details(&self) -> Option<ErrorDetails> {
        let node_id = &self.config.error_code_node;
        let timeout = self.config.error_read_timeout;

        match tokio::time::timeout(timeout, self.reader.read_node(node_id)).await {
            Ok(Ok(value)) => Some(ErrorDetails {
                code: value.value,
                timestamp: value.source_timestamp,
            }),
            Ok(Err(e)) => {
                tracing::debug!(node_id = %node_id, error = %e, "Could not read error code");
                None
            }
            Err(_) => {
                tracing::debug!(
                    node_id = %node_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Error code read timed out"
                );
                None
            }
        }
    }

    fn on_error_code(&self, change: &DataChange) {
        if !change.value.is_truthy() {
            return;
        }

        tracing::warn!(code = %change.value, "Machine error code reported");
        self.events.emit(&MonitorEvent::ErrorDetected(ErrorReport {
            machine_id: self.machine_id(),
            code: change.value.clone(),
            current_state: self.record().current,
            timestamp: Utc::now(),
            source_timestamp: change.source_timestamp,
        }));
    }

    fn context(
        &self,
        previous: Option<MachineState>,
        current: Option<MachineState>,
    ) -> TriggerContext {
        TriggerContext {
            machine_id: self.machine_id(),
            state: TriggerState::new(previous, current),
            client_id: self.client_id.clone(),
            session_id: self.reader.session_id().map(|s| s.to_string()),
        }
    }
}

impl std::fmt::Debug for StateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMonitor")
            .field("record", &self.record())
            .field("machine_id", &self.machine_id())
            .field("trigger_states", &self.config.trigger_states)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::SessionId;
    use crate::error::{MonitorResult, ReadError};
    use crate::events::{CollectorHandler, EventKind};
    use crate::types::{DataValue, NodeId, StatusCode};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeReader {
        value: Option<DataValue>,
        delay: Duration,
    }

    #[async_trait]
    impl NodeReader for FakeReader {
        async fn read_node(&self, node_id: &NodeId) -> MonitorResult<DataValue> {
            tokio::time::sleep(self.delay).await;
            self.value
                .clone()
                .ok_or_else(|| ReadError::failed(node_id, "unavailable").into())
        }

        fn session_id(&self) -> Option<SessionId> {
            Some(SessionId(9))
        }
    }

    struct Fixture {
        monitor: StateMonitor,
        collector: Arc<CollectorHandler>,
        triggers: Arc<TriggerEmitter>,
    }

    fn fixture(reader: FakeReader) -> Fixture {
        let events = Arc::new(EventBus::new());
        let collector = Arc::new(CollectorHandler::new());
        events.subscribe_all(collector.clone());
        let triggers = Arc::new(TriggerEmitter::default());
        let monitor = StateMonitor::new(
            MachineryConfig::default(),
            "machwatch",
            Arc::new(reader),
            events,
            triggers.clone(),
        );
        Fixture {
            monitor,
            collector,
            triggers,
        }
    }

    fn reader() -> FakeReader {
        FakeReader {
            value: Some(DataValue::good(17i64)),
            delay: Duration::ZERO,
        }
    }

    fn change(display_name: &str, value: impl Into<Variant>) -> DataChange {
        DataChange {
            node_id: NodeId::string(2, display_name),
            display_name: display_name.to_string(),
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(Utc::now()),
            server_timestamp: None,
            received_at: Utc::now(),
        }
    }

    fn stops(collector: &CollectorHandler) -> Vec<Arc<TriggerEvent>> {
        collector
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::EquipmentStop(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_equal_value_is_dropped() {
        let fx = fixture(reader());
        fx.monitor.process(&change(STATE_ITEM, MachineState::Executing)).await;
        fx.monitor.process(&change(STATE_ITEM, MachineState::Executing)).await;
        fx.monitor.process(&change(STATE_ITEM, 3i64)).await;

        assert_eq!(fx.collector.count(EventKind::StateChanged), 1);
        assert_eq!(fx.monitor.record().current, Some(MachineState::Executing));
        assert_eq!(fx.monitor.record().previous, None);
    }

    #[tokio::test]
    async fn test_two_stops_for_two_entries() {
        let fx = fixture(reader());
        for state in [
            MachineState::Executing,
            MachineState::OutOfService,
            MachineState::Executing,
            MachineState::OutOfService,
        ] {
            fx.monitor.process(&change(STATE_ITEM, state)).await;
        }

        let stops = stops(&fx.collector);
        assert_eq!(stops.len(), 2);
        for stop in &stops {
            assert_eq!(stop.state.previous, Some(MachineState::Executing));
            assert_eq!(stop.state.current, Some(MachineState::OutOfService));
        }
        assert_eq!(fx.triggers.emitted_count(), 2);
    }

    #[tokio::test]
    async fn test_state_changed_precedes_equipment_stop() {
        let fx = fixture(reader());
        fx.monitor.set_machine_id("press-07");
        fx.monitor.seed(MachineState::Executing);
        assert!(fx.collector.events().is_empty());

        fx.monitor.process(&change(STATE_ITEM, MachineState::OutOfService)).await;

        let events = fx.collector.events();
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (MonitorEvent::StateChanged(c), MonitorEvent::EquipmentStop(t)) => {
                assert_eq!(c.previous, Some(MachineState::Executing));
                assert_eq!(c.current, MachineState::OutOfService);
                assert_eq!(c.machine_id.as_deref(), Some("press-07"));
                assert_eq!(t.state.current, Some(MachineState::OutOfService));
                assert_eq!(t.metadata.session_id.as_deref(), Some("session-9"));
                assert_eq!(
                    t.error_details.as_ref().map(|d| d.code.clone()),
                    Some(Variant::Int64(17))
                );
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_error_read_yields_no_details() {
        let fx = fixture(FakeReader {
            value: Some(DataValue::good(5i64)),
            delay: Duration::from_secs(30),
        });
        let started = tokio::time::Instant::now();
        fx.monitor.process(&change(STATE_ITEM, MachineState::OutOfService)).await;

        let stops = stops(&fx.collector);
        assert_eq!(stops.len(), 1);
        assert!(stops[0].error_details.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failed_error_read_yields_no_details() {
        let fx = fixture(FakeReader {
            value: None,
            delay: Duration::ZERO,
        });
        fx.monitor.process(&change(STATE_ITEM, MachineState::OutOfService)).await;
        assert!(stops(&fx.collector)[0].error_details.is_none());
    }

    #[tokio::test]
    async fn test_bad_status_sample_is_ignored() {
        let fx = fixture(reader());
        let mut sample = change(STATE_ITEM, MachineState::OutOfService);
        sample.status = StatusCode::BAD_COMMUNICATION_ERROR;
        fx.monitor.process(&sample).await;

        assert!(fx.collector.events().is_empty());
        assert_eq!(fx.monitor.record(), StateRecord::default());
    }

    #[tokio::test]
    async fn test_error_codes() {
        let fx = fixture(reader());
        fx.monitor.process(&change(ERROR_ITEM, 0i64)).await;
        fx.monitor.process(&change(ERROR_ITEM, 42i64)).await;

        let reports: Vec<_> = fx
            .collector
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::ErrorDetected(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].code, Variant::Int64(42));
        assert_eq!(fx.monitor.record().current, None);
    }

    #[tokio::test]
    async fn test_manual_trigger_leaves_record() {
        let fx = fixture(reader());
        fx.monitor.process(&change(STATE_ITEM, MachineState::NotExecuting)).await;
        fx.monitor.process(&change(STATE_ITEM, MachineState::Executing)).await;
        let before = fx.monitor.record();

        let event = fx.monitor.manual_trigger("test");

        assert!(event.is_manual());
        assert_eq!(event.reason.as_deref(), Some("test"));
        assert_eq!(event.state.current, Some(MachineState::Executing));
        assert_eq!(event.state.previous, Some(MachineState::NotExecuting));
        assert_eq!(fx.monitor.record(), before);
        assert_eq!(fx.collector.count(EventKind::ManualTrigger), 1);
        assert_eq!(fx.collector.count(EventKind::EquipmentStop), 0);
    }

    #[tokio::test]
    async fn test_seed_applies_once() {
        let fx = fixture(reader());
        assert!(fx.monitor.seed(MachineState::Executing));
        fx.monitor.process(&change(STATE_ITEM, MachineState::OutOfService)).await;

        assert!(!fx.monitor.seed(MachineState::OutOfService));
        let record = fx.monitor.record();
        assert_eq!(record.previous, Some(MachineState::Executing));
        assert_eq!(record.current, Some(MachineState::OutOfService));
        assert_eq!(stops(&fx.collector).len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_unknown_codes_are_changes() {
        let fx = fixture(reader());
        fx.monitor.process(&change(STATE_ITEM, 5i64)).await;
        fx.monitor.process(&change(STATE_ITEM, 7i64)).await;
        fx.monitor.process(&change(STATE_ITEM, 7i64)).await;

        assert_eq!(fx.collector.count(EventKind::StateChanged), 2);
        let record = fx.monitor.record();
        assert_eq!(record.previous, Some(MachineState::Unknown(Some(5))));
        assert_eq!(record.current, Some(MachineState::Unknown(Some(7))));
        assert!(stops(&fx.collector).is_empty());
    }

    #[tokio::test]
    async fn test_other_items_are_ignored() {
        let fx = fixture(reader());
        fx.monitor.process(&change("SpindleSpeed", 1200i64)).await;
        assert!(fx.collector.events().is_empty());
    }
}
