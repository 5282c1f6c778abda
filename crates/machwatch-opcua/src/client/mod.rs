// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection, subscription and transport layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ConnectionManager                           │
//! │        (lifecycle, reconnect with backoff, read/write)          │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   SubscriptionRegistry                          │
//! │         (monitored items that survive reconnection)             │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   TelemetryTransport                            │
//! │   (protocol stack seam; OpcUaTransport, SimulatedTransport)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod connection;
#[cfg(feature = "real-transport")]
pub mod opcua_transport;
pub mod registry;
pub mod simulator;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionManagerBuilder, ConnectionState, NodeReader};
pub use registry::{
    DataChange, MonitoredItemSpec, MonitoredItems, RegisteredItem, RestoreReport,
    SubscriptionRegistry,
};
#[cfg(feature = "real-transport")]
pub use opcua_transport::OpcUaTransport;
pub use simulator::SimulatedTransport;
pub use transport::{
    ItemNotice, ItemSink, LifecycleSink, MonitoredItemId, SessionId, SubscriptionId,
    TelemetryTransport, TransportSignal,
};
