// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `validate` command.

use machwatch_opcua::{MachineState, MonitorConfig};

use crate::cli::{Cli, OutputFormat, ValidateArgs};
use crate::error::{BinError, BinResult};
use crate::loader::load_config;

/// Executes the `validate` command to validate configuration.
pub fn validate(cli: &Cli, args: ValidateArgs) -> BinResult<()> {
    let config_path = &cli.config;

    let config = load_config(config_path)
        .map_err(|e| BinError::from(e).with_context("Configuration validation failed"))?;
    let warnings = validation_warnings(&config);

    let trigger_states: Vec<&str> = config
        .machinery
        .trigger_states
        .iter()
        .map(MachineState::name)
        .collect();
    let reconnect = &config.connection.reconnect;

    match args.format {
        OutputFormat::Text => {
            println!("✓ Configuration is valid: {}", config_path.display());
            println!();
            println!("Summary:");
            println!("  Endpoint: {}", config.connection.endpoint);
            println!(
                "  Security: {} / {}",
                config.connection.security_mode, config.connection.security_policy
            );
            println!(
                "  Reconnect: {:?} doubling to {:?}, {} retries",
                reconnect.initial_delay, reconnect.max_delay, reconnect.max_retries
            );
            println!("  State node: {}", config.machinery.machine_state_node);
            println!("  Error code node: {}", config.machinery.error_code_node);
            println!("  Trigger states: {}", trigger_states.join(", "));

            if !warnings.is_empty() {
                println!();
                println!("Warnings:");
                for warning in &warnings {
                    println!("  ⚠ {}", warning);
                }
            }

            if args.show_config {
                println!();
                println!("Parsed configuration:");
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "valid": true,
                "config_path": config_path.display().to_string(),
                "summary": {
                    "endpoint": config.connection.endpoint,
                    "security_mode": config.connection.security_mode,
                    "security_policy": config.connection.security_policy,
                    "max_retries": reconnect.max_retries,
                    "machine_state_node": config.machinery.machine_state_node,
                    "trigger_states": config.machinery.trigger_states,
                },
                "warnings": warnings,
                "config": if args.show_config { Some(&config) } else { None },
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if args.strict && !warnings.is_empty() {
        return Err(BinError::config(format!(
            "Strict mode: {} warning(s) found",
            warnings.len()
        )));
    }

    Ok(())
}

/// Returns non-fatal findings for a valid configuration.
pub fn validation_warnings(config: &MonitorConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let machinery = &config.machinery;

    if config.connection.security_mode.is_none() {
        warnings.push("Endpoint security is disabled (security_mode: none)".to_string());
    }

    if !machinery.include_error_details {
        warnings.push(
            "Error details are disabled, the error code node is neither monitored nor read"
                .to_string(),
        );
    } else if machinery.error_read_timeout > config.connection.request_timeout {
        warnings.push(format!(
            "error_read_timeout ({:?}) exceeds request_timeout ({:?})",
            machinery.error_read_timeout, config.connection.request_timeout
        ));
    }

    if machinery.is_trigger_state(MachineState::Executing) {
        warnings.push("Trigger states include 'executing', every production start raises a trigger".to_string());
    }

    if machinery.machine_state_node == machinery.error_code_node {
        warnings.push(format!(
            "State and error code share node {}",
            machinery.machine_state_node
        ));
    }

    warnings
}

// =============================================================================
// Tests
// =============================================================================
