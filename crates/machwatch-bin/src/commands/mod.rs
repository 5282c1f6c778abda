// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI command implementations.
//!
//! - `run`: Watch a machine over a live OPC UA endpoint
//! - `validate`: Validate configuration file
//! - `simulate`: Run the monitor against a simulated machine
//! - `version`: Show version information

mod run;
mod simulate;
mod validate;
mod version;

pub use run::{run, watch, RunReport};
pub use simulate::{simulate, SimulationReport, Simulator};
pub use validate::{validate, validation_warnings};
pub use version::version;

use crate::cli::{Cli, Commands};
use crate::error::BinResult;

/// Executes the appropriate command based on CLI arguments.
pub async fn execute(cli: Cli) -> BinResult<()> {
    match cli.effective_command() {
        Commands::Run(args) => run::run(&cli, args).await,
        Commands::Validate(args) => validate::validate(&cli, args),
        Commands::Simulate(args) => simulate::simulate(&cli, args).await,
        Commands::Version => version::version(&cli),
    }
}
