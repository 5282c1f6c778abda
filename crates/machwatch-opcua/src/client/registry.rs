// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitored item registry.
//!
//! The registry remembers every [`MonitoredItemSpec`] ever monitored, keyed
//! by display name, and outlives individual subscriptions. After a
//! reconnect, [`SubscriptionRegistry::restore_all`] replays the specs
//! against the new subscription.
//!
//! # Duplicate display names
//!
//! Monitoring a spec under a display name that is already registered
//! replaces the earlier spec in place (last write wins). Notifications of
//! the replaced item are dropped from then on. A replacement that points at
//! a different node is logged at `warn`.
//!
//! # Notification flow
//!
//! ```text
//! transport ──ItemSink──▶ pump task ──▶ epoch / serial check ──▶ EventBus
//!                                                                 ├─ dataChange
//!                                                                 └─ monitoringError
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::client::transport::{
    ItemEnvelope, ItemNotice, ItemSink, MonitoredItemId, SubscriptionId, TelemetryTransport,
};
use crate::config::MonitoringParameters;
use crate::error::{MonitorResult, MonitoringError};
use crate::events::{EventBus, MonitorEvent};
use crate::types::{AttributeId, NodeId, StatusCode, Variant};

// =============================================================================
// MonitoredItemSpec
// =============================================================================

/// Description of a data point to monitor.
///
/// Unset sampling fields fall back to the registry defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredItemSpec {
    /// Node to monitor.
    pub node_id: NodeId,
    /// Registry key.
    pub display_name: String,
    /// Attribute to sample.
    pub attribute: AttributeId,
    /// Sampling interval override.
    pub sampling_interval: Option<Duration>,
    /// Queue size override.
    pub queue_size: Option<u32>,
    /// Discard policy override.
    pub discard_oldest: Option<bool>,
}

impl MonitoredItemSpec {
    /// Creates a spec that uses the default sampling parameters.
    pub fn new(node_id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            attribute: AttributeId::Value,
            sampling_interval: None,
            queue_size: None,
            discard_oldest: None,
        }
    }

    /// Overrides the sampling interval.
    pub fn sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = Some(interval);
        self
    }

    /// Overrides the queue size.
    pub fn queue_size(mut self, size: u32) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Overrides the discard policy.
    pub fn discard_oldest(mut self, discard: bool) -> Self {
        self.discard_oldest = Some(discard);
        self
    }

    /// Merges this spec over `defaults`.
    pub fn resolve(&self, defaults: &MonitoringParameters) -> MonitoringParameters {
        MonitoringParameters {
            sampling_interval: self.sampling_interval.unwrap_or(defaults.sampling_interval),
            queue_size: self.queue_size.unwrap_or(defaults.queue_size),
            discard_oldest: self.discard_oldest.unwrap_or(defaults.discard_oldest),
        }
    }
}

// =============================================================================
// DataChange
// =============================================================================

/// Normalized value change of a monitored item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataChange {
    /// Monitored node.
    pub node_id: NodeId,
    /// Registry key of the item.
    pub display_name: String,
    /// New value.
    pub value: Variant,
    /// Quality of the value.
    pub status: StatusCode,
    /// Source timestamp.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// MonitoredItems
// =============================================================================

/// A registered spec and its current server-side item.
#[derive(Debug, Clone)]
pub struct RegisteredItem {
    /// The spec as last monitored.
    pub spec: MonitoredItemSpec,
    /// Item handle on the current subscription, if any.
    pub item_id: Option<MonitoredItemId>,
    serial: u64,
}

/// Insertion-ordered map of display name to registered item.
///
/// Replacing an entry keeps its original position.
#[derive(Debug, Default)]
pub struct MonitoredItems {
    entries: Vec<RegisteredItem>,
}

impl MonitoredItems {
    /// Returns the entry registered under `display_name`.
    pub fn get(&self, display_name: &str) -> Option<&RegisteredItem> {
        self.entries.iter().find(|e| e.spec.display_name == display_name)
    }

    /// Iterates entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredItem> {
        self.entries.iter()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, display_name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.spec.display_name == display_name)
    }

    /// Inserts or replaces, returning the replaced entry.
    fn upsert(&mut self, entry: RegisteredItem) -> Option<RegisteredItem> {
        match self.position(&entry.spec.display_name) {
            Some(pos) => Some(std::mem::replace(&mut self.entries[pos], entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    /// Undoes an `upsert` made with `serial`, unless a newer one won.
    fn revert(&mut self, display_name: &str, serial: u64, previous: Option<RegisteredItem>) {
        let Some(pos) = self.position(display_name) else {
            return;
        };
        if self.entries[pos].serial != serial {
            return;
        }
        match previous {
            Some(mut previous) => {
                previous.item_id = None;
                self.entries[pos] = previous;
            }
            None => {
                self.entries.remove(pos);
            }
        }
    }

    fn set_item(&mut self, display_name: &str, serial: u64, item_id: MonitoredItemId) -> bool {
        match self.position(display_name) {
            Some(pos) if self.entries[pos].serial == serial => {
                self.entries[pos].item_id = Some(item_id);
                true
            }
            _ => false,
        }
    }

    fn accepts(&self, display_name: &str, serial: u64) -> bool {
        self.get(display_name).is_some_and(|e| e.serial == serial)
    }

    fn clear_items(&mut self) {
        for entry in &mut self.entries {
            entry.item_id = None;
        }
    }

    fn specs(&self) -> Vec<MonitoredItemSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }
}

// =============================================================================
// RestoreReport
// =============================================================================

/// Outcome of [`SubscriptionRegistry::restore_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Display names restored.
    pub restored: Vec<String>,
    /// Display names that failed, with the cause.
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    /// Returns `true` if every spec was restored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns the number of specs attempted.
    pub fn attempted(&self) -> usize {
        self.restored.len() + self.failed.len()
    }
}

// =============================================================================
// SubscriptionRegistry
// =============================================================================

struct RegistryShared {
    items: Mutex<MonitoredItems>,
    epoch: AtomicU64,
    events: Arc<EventBus>,
}

impl RegistryShared {
    fn deliver(&self, envelope: ItemEnvelope) {
        if self.epoch.load(Ordering::SeqCst) != envelope.epoch {
            tracing::trace!(
                display_name = %envelope.display_name,
                "Dropping notification from a previous connection"
            );
            return;
        }
        let accepted = self
            .items
            .lock()
            .accepts(&envelope.display_name, envelope.serial);
        if !accepted {
            tracing::trace!(
                display_name = %envelope.display_name,
                "Dropping notification from a replaced item"
            );
            return;
        }

        match envelope.notice {
            ItemNotice::Changed(value) => {
                self.events.emit(&MonitorEvent::DataChange(DataChange {
                    node_id: envelope.node_id,
                    display_name: envelope.display_name.to_string(),
                    value: value.value,
                    status: value.status,
                    source_timestamp: value.source_timestamp,
                    server_timestamp: value.server_timestamp,
                    received_at: Utc::now(),
                }));
            }
            ItemNotice::Error(cause) => {
                tracing::warn!(
                    display_name = %envelope.display_name,
                    node_id = %envelope.node_id,
                    cause = %cause,
                    "Monitored item error"
                );
                self.events.emit(&MonitorEvent::MonitoringError {
                    display_name: envelope.display_name.to_string(),
                    node_id: Some(envelope.node_id),
                    cause,
                });
            }
        }
    }
}

struct Binding {
    epoch: u64,
    subscription: SubscriptionId,
    tx: mpsc::UnboundedSender<ItemEnvelope>,
    pump: JoinHandle<()>,
}

/// Registry of monitored items that survives reconnection.
pub struct SubscriptionRegistry<T: TelemetryTransport> {
    transport: Arc<T>,
    defaults: MonitoringParameters,
    shared: Arc<RegistryShared>,
    binding: Mutex<Option<Binding>>,
    next_serial: AtomicU64,
    span: Span,
}

impl<T: TelemetryTransport> SubscriptionRegistry<T> {
    /// Creates an unbound registry.
    pub fn new(transport: Arc<T>, defaults: MonitoringParameters, events: Arc<EventBus>) -> Self {
        Self {
            transport,
            defaults,
            shared: Arc::new(RegistryShared {
                items: Mutex::new(MonitoredItems::default()),
                epoch: AtomicU64::new(0),
                events,
            }),
            binding: Mutex::new(None),
            next_serial: AtomicU64::new(1),
            span: Span::current(),
        }
    }

    /// Sets the span the notification pump runs in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Attaches the registry to a live subscription of connection `epoch`.
    pub(crate) fn bind(&self, epoch: u64, subscription: SubscriptionId) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ItemEnvelope>();
        self.shared.epoch.store(epoch, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(
            async move {
                while let Some(envelope) = rx.recv().await {
                    shared.deliver(envelope);
                }
            }
            .instrument(self.span.clone()),
        );

        let previous = self.binding.lock().replace(Binding {
            epoch,
            subscription,
            tx,
            pump,
        });
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        tracing::debug!(epoch, subscription = %subscription, "Registry bound to subscription");
    }

    /// Detaches the registry from its subscription. Specs are kept.
    pub(crate) fn unbind(&self) {
        self.shared.epoch.store(0, Ordering::SeqCst);
        if let Some(binding) = self.binding.lock().take() {
            binding.pump.abort();
            tracing::debug!(
                epoch = binding.epoch,
                subscription = %binding.subscription,
                "Registry unbound"
            );
        }
        self.shared.items.lock().clear_items();
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Creates a monitored item for `spec` and registers it under its
    /// display name.
    ///
    /// # Errors
    ///
    /// [`MonitoringError::NotSubscribed`] without an active subscription,
    /// or the transport's item creation error. A failed call leaves the
    /// registry as it was.
    pub async fn monitor(&self, spec: MonitoredItemSpec) -> MonitorResult<MonitoredItemId> {
        let (epoch, subscription, tx) = {
            let binding = self.binding.lock();
            let binding = binding.as_ref().ok_or(MonitoringError::NotSubscribed)?;
            (binding.epoch, binding.subscription, binding.tx.clone())
        };

        let params = spec.resolve(&self.defaults);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let sink = ItemSink::new(
            epoch,
            serial,
            Arc::from(spec.display_name.as_str()),
            spec.node_id.clone(),
            tx,
        );

        let previous = self.shared.items.lock().upsert(RegisteredItem {
            spec: spec.clone(),
            item_id: None,
            serial,
        });
        if let Some(previous) = &previous {
            if previous.spec.node_id != spec.node_id {
                tracing::warn!(
                    display_name = %spec.display_name,
                    previous_node = %previous.spec.node_id,
                    node_id = %spec.node_id,
                    "Display name re-registered for a different node, replacing"
                );
            }
        }

        let result = self
            .transport
            .monitor(subscription, &spec.node_id, spec.attribute, &params, sink)
            .await;

        match result {
            Ok(item_id) => {
                if self.shared.epoch.load(Ordering::SeqCst) != epoch {
                    tracing::debug!(
                        display_name = %spec.display_name,
                        "Subscription replaced while creating item"
                    );
                    return Err(MonitoringError::NotSubscribed.into());
                }
                self.shared
                    .items
                    .lock()
                    .set_item(&spec.display_name, serial, item_id);
                tracing::info!(
                    display_name = %spec.display_name,
                    node_id = %spec.node_id,
                    item_id = %item_id,
                    sampling_interval_ms = params.sampling_interval.as_millis() as u64,
                    queue_size = params.queue_size,
                    "Monitoring node"
                );
                Ok(item_id)
            }
            Err(e) => {
                self.shared
                    .items
                    .lock()
                    .revert(&spec.display_name, serial, previous);
                tracing::warn!(
                    display_name = %spec.display_name,
                    node_id = %spec.node_id,
                    error = %e,
                    "Failed to monitor node"
                );
                Err(e.into())
            }
        }
    }

    /// Re-monitors every registered spec against the current subscription.
    ///
    /// Each spec is restored independently; failures are logged and
    /// reported without stopping the remaining specs.
    pub async fn restore_all(&self) -> RestoreReport {
        let specs = self.shared.items.lock().specs();
        let mut report = RestoreReport::default();

        for spec in specs {
            let display_name = spec.display_name.clone();
            match self.monitor(spec).await {
                Ok(_) => report.restored.push(display_name),
                Err(e) => {
                    tracing::warn!(
                        display_name = %display_name,
                        error = %e,
                        "Failed to restore monitored item"
                    );
                    report.failed.push((display_name, e.to_string()));
                }
            }
        }

        if report.attempted() > 0 {
            tracing::info!(
                restored = report.restored.len(),
                failed = report.failed.len(),
                "Monitored items restored"
            );
        }
        report
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns the registered specs in registration order.
    pub fn specs(&self) -> Vec<MonitoredItemSpec> {
        self.shared.items.lock().specs()
    }

    /// Returns the spec registered under `display_name`.
    pub fn get(&self, display_name: &str) -> Option<MonitoredItemSpec> {
        self.shared
            .items
            .lock()
            .get(display_name)
            .map(|e| e.spec.clone())
    }

    /// Returns the live item handle of `display_name`.
    pub fn item_id(&self, display_name: &str) -> Option<MonitoredItemId> {
        self.shared
            .items
            .lock()
            .get(display_name)
            .and_then(|e| e.item_id)
    }

    /// Returns the number of registered specs.
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Returns `true` if no spec is registered.
    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }

    /// Returns the bound subscription.
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.binding.lock().as_ref().map(|b| b.subscription)
    }

    /// Returns the default sampling parameters.
    pub fn defaults(&self) -> &MonitoringParameters {
        &self.defaults
    }
}

impl<T: TelemetryTransport> Drop for SubscriptionRegistry<T> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.pump.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
