// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `run` command.
//!
//! Connects to the configured OPC UA endpoint and watches the machine until
//! a shutdown signal arrives. Trigger events are written to stdout as JSON
//! lines; logs go to stderr. A failed first connect is not fatal since the
//! connection manager keeps retrying; exhausting the retries is.

use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use machwatch_opcua::{EventKind, MachineMonitor, MonitorStats, TelemetryTransport};

use crate::cli::{Cli, RunArgs};
use crate::error::{BinError, BinResult};
use crate::shutdown::ShutdownToken;

/// Executes the `run` command against the configured endpoint.
#[cfg(feature = "opcua")]
pub async fn run(cli: &Cli, args: RunArgs) -> BinResult<()> {
    use std::sync::Arc;

    use machwatch_opcua::OpcUaTransport;

    use crate::shutdown::ShutdownCoordinator;

    let config = crate::loader::load_config(&cli.config)?;
    info!(
        endpoint = %config.connection.endpoint,
        security_mode = %config.connection.security_mode,
        "Starting machine monitor"
    );
    let monitor = MachineMonitor::new(Arc::new(OpcUaTransport::new()), config)?;

    let coordinator = ShutdownCoordinator::new();
    let token = coordinator.token();
    let signals = tokio::spawn(async move {
        if let Err(e) = coordinator.wait_for_signal().await {
            tracing::error!(error = %e, "Signal handling unavailable");
            std::future::pending::<()>().await;
        }
    });

    let report = watch(&monitor, token, &mut std::io::stdout(), &args).await;
    signals.abort();

    let report = report?;
    info!(
        triggers = report.triggers,
        stops = report.stats.stats.equipment_stops,
        reconnects = report.stats.stats.total_reconnects,
        "Machine monitor stopped"
    );
    Ok(())
}

/// Executes the `run` command in a build without the OPC UA stack.
#[cfg(not(feature = "opcua"))]
pub async fn run(_cli: &Cli, _args: RunArgs) -> BinResult<()> {
    Err(BinError::init(
        "this build has no OPC UA client; rebuild with `--features opcua` or use `simulate`",
    ))
}

// =============================================================================
// Watch Loop
// =============================================================================

/// Summary of a `run` session.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Trigger events written to the output.
    pub triggers: u64,
    /// Monitor statistics at the end of the run.
    pub stats: MonitorStats,
}

/// Connects `monitor` and writes its trigger events to `out` until `token`
/// fires.
///
/// Returns a runtime error once the monitor gives up reconnecting.
pub async fn watch<T, W>(
    monitor: &MachineMonitor<T>,
    mut token: ShutdownToken,
    out: &mut W,
    args: &RunArgs,
) -> BinResult<RunReport>
where
    T: TelemetryTransport,
    W: Write,
{
    let mut triggers = monitor.subscribe_triggers();
    let (exhausted_tx, mut exhausted) = mpsc::unbounded_channel();
    let exhausted_id = monitor.events().on(
        EventKind::MaxReconnectAttemptsReached,
        "run_exhausted",
        move |_| {
            let _ = exhausted_tx.send(());
        },
    );

    if let Err(e) = monitor.connect().await {
        warn!(error = %e, "Initial connect failed, retrying in the background");
    }

    let mut emitted = 0u64;
    let mut status = (args.status_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.status_interval_secs)));
    if let Some(status) = status.as_mut() {
        status.tick().await;
    }

    let outcome = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            received = triggers.recv() => match received {
                Ok(event) => {
                    writeln!(out, "{}", event.to_json()?)?;
                    out.flush()?;
                    emitted += 1;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Trigger output fell behind"),
                Err(RecvError::Closed) => break Ok(()),
            },
            Some(()) = exhausted.recv() => {
                break Err(BinError::runtime(format!(
                    "gave up reconnecting to {}",
                    monitor.connection().config().endpoint
                )));
            }
            _ = async { status.as_mut()?.tick().await; Some(()) }, if status.is_some() => {
                let machine = monitor.machine_status();
                let stats = monitor.stats();
                info!(
                    state = %machine.state_name,
                    connected = machine.connection_status.is_connected,
                    stops = stats.stats.equipment_stops,
                    reconnects = stats.stats.total_reconnects,
                    "Machine status"
                );
            }
        }
    };

    while let Ok(event) = triggers.try_recv() {
        writeln!(out, "{}", event.to_json()?)?;
        emitted += 1;
    }
    out.flush()?;

    monitor.disconnect().await;
    monitor.events().unsubscribe(exhausted_id);
    outcome.map(|()| RunReport {
        triggers: emitted,
        stats: monitor.stats(),
    })
}

// =============================================================================
// Tests
// =============================================================================
