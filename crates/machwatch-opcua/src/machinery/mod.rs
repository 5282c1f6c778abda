// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Machinery item state monitoring and video triggers.

pub mod monitor;
pub mod state;
pub mod trigger;

pub use monitor::{ConnectionStatus, MachineMonitor, MachineStatus, MonitorStats};
pub use state::{ErrorReport, StateChange, StateMonitor, StateRecord, ERROR_ITEM, STATE_ITEM};
pub use trigger::{
    trigger_fn, ErrorDetails, TriggerContext, TriggerDelivery, TriggerEmitter, TriggerEvent,
    TriggerHandler, TriggerHandlerId, TriggerKind, TriggerMetadata, TriggerSource, TriggerState,
    TRIGGER_SOURCE_MACHINERY, TRIGGER_SOURCE_MANUAL,
};
