// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection and monitoring statistics.
//!
//! [`StatsCollector`] is an [`EventHandler`] that derives its counters from
//! the monitor's own events, so it never needs to be called directly by the
//! connection or state logic.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::HandlerError;
use crate::events::{EventHandler, MonitorEvent};

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Time of the last successful connect.
    pub connect_time: Option<DateTime<Utc>>,
    /// Time of the last disconnect or connection loss.
    pub disconnect_time: Option<DateTime<Utc>>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Successful automatic reconnects.
    pub total_reconnects: u64,
    /// Value changes received.
    pub events_received: u64,
    /// Equipment stop triggers raised.
    pub equipment_stops: u64,
    /// Time since the last connect while connected, zero otherwise.
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

#[derive(Debug, Default)]
struct Timestamps {
    connect_time: Option<DateTime<Utc>>,
    disconnect_time: Option<DateTime<Utc>>,
    connected_since: Option<Instant>,
}

/// Event-driven statistics collector.
#[derive(Debug, Default)]
pub struct StatsCollector {
    reconnect_attempts: AtomicU32,
    total_reconnects: AtomicU64,
    events_received: AtomicU64,
    equipment_stops: AtomicU64,
    connected: AtomicBool,
    times: RwLock<Timestamps>,
}

impl StatsCollector {
    /// Creates a collector with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let times = self.times.read();
        let uptime = match (self.connected.load(Ordering::SeqCst), times.connected_since) {
            (true, Some(since)) => since.elapsed(),
            _ => Duration::ZERO,
        };
        StatsSnapshot {
            connect_time: times.connect_time,
            disconnect_time: times.disconnect_time,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            total_reconnects: self.total_reconnects.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            equipment_stops: self.equipment_stops.load(Ordering::Relaxed),
            uptime,
        }
    }

    /// Returns the time since the last connect, zero while disconnected.
    pub fn uptime(&self) -> Duration {
        self.snapshot().uptime
    }

    fn mark_connected(&self) {
        let mut times = self.times.write();
        times.connect_time = Some(Utc::now());
        times.connected_since = Some(Instant::now());
        self.connected.store(true, Ordering::SeqCst);
    }

    fn mark_disconnected(&self) {
        let mut times = self.times.write();
        times.disconnect_time = Some(Utc::now());
        times.connected_since = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl EventHandler for StatsCollector {
    fn name(&self) -> &str {
        "stats"
    }

    fn handle(&self, event: &MonitorEvent) -> Result<(), HandlerError> {
        match event {
            MonitorEvent::Connected { .. } => {
                // Every successful connect ends a pending retry sequence.
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                self.mark_connected();
            }
            MonitorEvent::Disconnected { .. } | MonitorEvent::ConnectionLost { .. } => {
                self.mark_disconnected()
            }
            MonitorEvent::Reconnecting { attempt, .. } => {
                self.reconnect_attempts.store(*attempt, Ordering::Relaxed)
            }
            MonitorEvent::ConnectionReestablished { .. } => {
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                self.total_reconnects.fetch_add(1, Ordering::Relaxed);
            }
            MonitorEvent::DataChange(_) => {
                self.events_received.fetch_add(1, Ordering::Relaxed);
            }
            MonitorEvent::EquipmentStop(_) => {
                self.equipment_stops.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::SessionId;

    fn connected() -> MonitorEvent {
        MonitorEvent::Connected {
            endpoint: "opc.tcp://plc:4840".into(),
            session_id: SessionId(1),
        }
    }

    #[test]
    fn test_uptime_zero_while_disconnected() {
        let stats = StatsCollector::new();
        assert_eq!(stats.uptime(), Duration::ZERO);
        assert!(stats.snapshot().connect_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_increases_while_connected() {
        let stats = StatsCollector::new();
        stats.handle(&connected()).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let first = stats.uptime();
        tokio::time::advance(Duration::from_secs(3)).await;
        let second = stats.uptime();

        assert!(first >= Duration::from_secs(5));
        assert!(second > first);

        stats
            .handle(&MonitorEvent::ConnectionLost {
                endpoint: "opc.tcp://plc:4840".into(),
                reason: "reset".into(),
            })
            .unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.uptime, Duration::ZERO);
        assert!(snapshot.disconnect_time.is_some());
    }

    #[test]
    fn test_reconnect_counters() {
        let stats = StatsCollector::new();
        for attempt in 1..=3 {
            stats
                .handle(&MonitorEvent::Reconnecting {
                    attempt,
                    delay: Duration::from_secs(1),
                })
                .unwrap();
        }
        assert_eq!(stats.snapshot().reconnect_attempts, 3);

        stats
            .handle(&MonitorEvent::ConnectionReestablished {
                endpoint: "opc.tcp://plc:4840".into(),
                session_id: SessionId(2),
                attempts: 3,
            })
            .unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.total_reconnects, 1);
    }

    #[test]
    fn test_connect_clears_pending_attempts() {
        let stats = StatsCollector::new();
        stats
            .handle(&MonitorEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1),
            })
            .unwrap();
        assert_eq!(stats.snapshot().reconnect_attempts, 1);

        stats.handle(&connected()).unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.total_reconnects, 0);
    }
}
