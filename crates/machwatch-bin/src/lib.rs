// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # machwatch-bin
//!
//! CLI binary for the machwatch machine-state monitor.
//!
//! - CLI argument parsing with clap
//! - Configuration loading (YAML/TOML files plus environment overrides)
//! - Logging initialization
//! - Graceful shutdown handling
//! - Command implementations (run, validate, simulate, version)
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   main.rs   │
//!                    └──────┬──────┘
//!                    ┌──────▼──────┐
//!                    │   cli.rs    │
//!                    └──────┬──────┘
//!               ┌───────────┼───────────┐
//!               ▼           ▼           ▼
//!        ┌──────────┐ ┌──────────┐ ┌──────────┐
//!        │ commands │ │  loader  │ │ logging  │
//!        └────┬─────┘ └──────────┘ └──────────┘
//!             │       ┌──────────┐
//!             ├──────►│ shutdown │
//!             │       └──────────┘
//!      ┌──────▼──────────┐
//!      │ machwatch-opcua │
//!      └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run against the simulated machine (default command)
//! machwatch
//!
//! # Watch a live machine (build with `--features opcua`)
//! machwatch run -c /etc/machwatch/press-07.yaml
//!
//! # Validate a configuration file
//! machwatch validate -c /etc/machwatch/press-07.yaml
//!
//! # Fast simulation with a link drop every third state change
//! machwatch simulate --interval-ms 500 --drop-every 3
//!
//! # Show version
//! machwatch version
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod loader;
pub mod logging;
pub mod shutdown;

pub use cli::{Cli, Commands};
pub use error::{BinError, BinResult};
pub use loader::{load_config, ConfigLoader};
pub use logging::init_logging;
pub use shutdown::{ShutdownCoordinator, ShutdownToken};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
