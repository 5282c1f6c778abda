// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `simulate` command.
//!
//! Runs a [`MachineMonitor`] against an in-process machine that cycles
//! through `NotExecuting -> Executing -> OutOfService -> Executing`, setting
//! an error code before every stop. Trigger events are written to stdout as
//! JSON lines; logs go to stderr.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use machwatch_opcua::{MachineMonitor, MachineState, MonitorConfig, MonitorStats, SimulatedTransport};

use crate::cli::{Cli, SimulateArgs};
use crate::error::{BinError, BinResult};
use crate::loader::load_config;
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};

const CYCLE: [MachineState; 4] = [
    MachineState::NotExecuting,
    MachineState::Executing,
    MachineState::OutOfService,
    MachineState::Executing,
];

const ERROR_CODE_BASE: i64 = 1000;

/// Executes the `simulate` command.
pub async fn simulate(cli: &Cli, args: SimulateArgs) -> BinResult<()> {
    let config = if cli.config.is_file() {
        load_config(&cli.config)?
    } else if args.allow_defaults {
        warn!(path = %cli.config.display(), "Configuration file not found, using defaults");
        MonitorConfig::default()
    } else {
        return Err(BinError::config(format!(
            "Configuration file not found: {} (pass --allow-defaults to run without one)",
            cli.config.display()
        )));
    };

    let coordinator = ShutdownCoordinator::new();
    let token = coordinator.token();
    let signals = tokio::spawn(async move {
        if let Err(e) = coordinator.wait_for_signal().await {
            error!(error = %e, "Signal handling unavailable");
            // Keep the coordinator alive so the run is not cut short.
            std::future::pending::<()>().await;
        }
    });

    let mut simulator = Simulator::new(config, args)?;
    let report = simulator
        .run(token, &mut std::io::stdout())
        .await
        .map_err(|e| e.with_context("simulation failed"));
    signals.abort();

    let report = report?;
    info!(
        steps = report.steps,
        triggers = report.triggers,
        reconnects = report.stats.stats.total_reconnects,
        "Simulation finished"
    );
    Ok(())
}

// =============================================================================
// Simulator
// =============================================================================

/// Summary of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// State changes applied to the simulated machine.
    pub steps: u64,
    /// Trigger events written to the output.
    pub triggers: u64,
    /// Monitor statistics at the end of the run.
    pub stats: MonitorStats,
}

/// Simulated machine driven by a monitor.
pub struct Simulator {
    config: MonitorConfig,
    args: SimulateArgs,
    transport: Arc<SimulatedTransport>,
    monitor: MachineMonitor<SimulatedTransport>,
    step: u64,
}

impl Simulator {
    /// Seeds the simulated machine and builds the monitor.
    pub fn new(config: MonitorConfig, args: SimulateArgs) -> BinResult<Self> {
        let machinery = &config.machinery;
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_value(machinery.machine_id_node.clone(), args.machine_id.clone())
                .with_value(machinery.machine_state_node.clone(), MachineState::Executing)
                .with_value(machinery.error_code_node.clone(), 0i64),
        );
        let monitor = MachineMonitor::new(transport.clone(), config.clone())?;

        Ok(Self {
            config,
            args,
            transport,
            monitor,
            step: 0,
        })
    }

    /// Returns the monitor under simulation.
    pub fn monitor(&self) -> &MachineMonitor<SimulatedTransport> {
        &self.monitor
    }

    /// Returns the simulated transport.
    pub fn transport(&self) -> &Arc<SimulatedTransport> {
        &self.transport
    }

    /// Runs until `token` fires or the configured cycle count is reached.
    pub async fn run<W: Write>(
        &mut self,
        mut token: ShutdownToken,
        out: &mut W,
    ) -> BinResult<SimulationReport> {
        let mut triggers = self.monitor.subscribe_triggers();
        self.monitor.connect().await?;
        info!(
            endpoint = %self.config.connection.endpoint,
            machine_id = %self.args.machine_id,
            interval_ms = self.args.interval_ms,
            "Simulation started"
        );

        let mut emitted = 0u64;
        let mut ticker = tokio::time::interval(Duration::from_millis(self.args.interval_ms.max(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = triggers.recv() => match received {
                    Ok(event) => {
                        writeln!(out, "{}", event.to_json()?)?;
                        out.flush()?;
                        emitted += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Trigger output fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if self.args.cycles.is_some_and(|cycles| self.step >= cycles) {
                        break;
                    }
                    self.advance();
                }
            }
        }

        while let Ok(event) = triggers.try_recv() {
            writeln!(out, "{}", event.to_json()?)?;
            emitted += 1;
        }
        out.flush()?;

        self.monitor.disconnect().await;
        Ok(SimulationReport {
            steps: self.step,
            triggers: emitted,
            stats: self.monitor.stats(),
        })
    }

    /// Applies the next state of the cycle.
    fn advance(&mut self) {
        let index = (self.step % CYCLE.len() as u64) as usize;
        self.step += 1;
        let state = CYCLE[index];
        let machinery = &self.config.machinery;

        if self.args.drop_every.is_some_and(|n| n > 0 && self.step % n == 0) {
            warn!(step = self.step, "Dropping simulated connection");
            self.transport.drop_connection("simulated link drop");
        }

        if state == MachineState::OutOfService {
            let code = ERROR_CODE_BASE + self.step as i64;
            self.transport.set_value(&machinery.error_code_node, code);
        } else if state == MachineState::Executing {
            self.transport.set_value(&machinery.error_code_node, 0i64);
        }
        self.transport.set_value(&machinery.machine_state_node, state);
        info!(step = self.step, state = %state, "Simulated state change");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cycles: u64, drop_every: Option<u64>) -> SimulateArgs {
        SimulateArgs {
            interval_ms: 2000,
            cycles: Some(cycles),
            drop_every,
            machine_id: "sim-press".to_string(),
            allow_defaults: true,
        }
    }

    fn lines(out: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).expect("JSON line"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_cycles_emit_two_triggers() {
        let mut simulator = Simulator::new(MonitorConfig::default(), args(8, None)).unwrap();
        let coordinator = ShutdownCoordinator::new();
        let mut out = Vec::new();

        let report = simulator.run(coordinator.token(), &mut out).await.unwrap();

        assert_eq!(report.steps, 8);
        assert_eq!(report.triggers, 2);
        assert_eq!(report.stats.stats.equipment_stops, 2);

        let events = lines(&out);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["kind"], "automatic");
        assert_eq!(events[0]["machine_id"], "sim-press");
        assert_eq!(events[0]["error_details"]["code"], 1003);
        assert_eq!(events[1]["error_details"]["code"], 1007);
        assert!(!simulator.transport().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_survive_link_drops() {
        let mut simulator = Simulator::new(MonitorConfig::default(), args(8, Some(3))).unwrap();
        let coordinator = ShutdownCoordinator::new();
        let mut out = Vec::new();

        let report = simulator.run(coordinator.token(), &mut out).await.unwrap();

        assert_eq!(report.triggers, 2);
        assert_eq!(report.stats.stats.total_reconnects, 2);
        assert_eq!(lines(&out)[0]["error_details"]["code"], 1003);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_run() {
        let mut simulator = Simulator::new(MonitorConfig::default(), SimulateArgs::default()).unwrap();
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown();
        let mut out = Vec::new();

        let report = simulator.run(coordinator.token(), &mut out).await.unwrap();

        assert_eq!(report.steps, 0);
        assert!(out.is_empty());
        assert!(!simulator.monitor().connection().is_connected());
    }
}
