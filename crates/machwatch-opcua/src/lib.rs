// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Machine-state monitoring over OPC UA subscriptions.
//!
//! This crate watches a machine's `MachineryItemState` over a subscription
//! connection, detects transitions into a stopped state, and raises trigger
//! events for a downstream video-capture pipeline. The connection survives
//! transport drops: it reconnects with bounded exponential backoff and
//! restores every monitored item on the new subscription.
//!
//! # Features
//!
//! - Connection state machine with a single reconnect timer
//! - Monitored item registry keyed by display name, restored on reconnect
//! - Exactly-once state transition detection with trigger enrichment
//! - Independent trigger fan-out (handlers and broadcast receivers)
//! - Event-derived statistics
//! - In-process simulated transport
//! - OPC UA client transport over the `opcua` crate (`real-transport` feature)
//!
//! # Error Handling
//!
//! ```text
//! MonitorError
//! ├── Transport   - Connect, session and subscription failures
//! ├── Read        - Node read failures
//! ├── Write       - Node write failures
//! ├── Monitoring  - Monitored item failures
//! ├── Config      - Invalid settings
//! └── Handler     - Consumer callback failures
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use machwatch_opcua::{trigger_fn, MachineMonitor, MonitorConfig, SimulatedTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(SimulatedTransport::new());
//!     let monitor = MachineMonitor::new(transport, MonitorConfig::default())?;
//!
//!     monitor.on_video_trigger(trigger_fn("recorder", |event| {
//!         println!("record clip for {:?}", event.machine_id);
//!     }));
//!
//!     monitor.connect().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod machinery;
pub mod stats;
pub mod types;

pub use error::{
    ConfigError, ErrorSeverity, HandlerError, MonitorError, MonitorResult, MonitoringError,
    ReadError, TransportError, WriteError,
};

pub use types::{
    AttributeId, DataValue, Identifier, MachineState, NodeId, SecurityMode, SecurityPolicy,
    StatusCode, Variant,
};

pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, MachineryConfig, MonitorConfig,
    MonitoringParameters, ReconnectPolicy, SubscriptionSettings,
};

pub use events::{
    handler_fn, CollectorHandler, EventBus, EventHandler, EventKind, MonitorEvent, SubscriberId,
    TracingHandler,
};

pub use stats::{StatsCollector, StatsSnapshot};

// Re-export client types
pub use client::{
    ConnectionManager, ConnectionManagerBuilder, ConnectionState, DataChange, LifecycleSink,
    ItemSink, MonitoredItemId, MonitoredItemSpec, NodeReader, RestoreReport, SessionId,
    SimulatedTransport, SubscriptionId, SubscriptionRegistry, TelemetryTransport,
    TransportSignal,
};

// Re-export the OPC UA stack transport when the feature is enabled
#[cfg(feature = "real-transport")]
pub use client::OpcUaTransport;

// Re-export machinery types
pub use machinery::{
    trigger_fn, ErrorReport, MachineMonitor, MachineStatus, MonitorStats, StateChange,
    StateMonitor, StateRecord, TriggerEmitter, TriggerEvent, TriggerHandler, TriggerHandlerId,
    TriggerKind,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
