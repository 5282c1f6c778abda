// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitor configuration.
//!
//! [`MonitorConfig`] is the root and deserializes from YAML or TOML. Every
//! section has defaults, so a file only needs the values it changes:
//!
//! ```yaml
//! connection:
//!   endpoint: opc.tcp://press-07.plant.local:4840
//!   reconnect:
//!     initial_delay: 1s
//!     max_delay: 30s
//!     max_retries: 10
//! machinery:
//!   trigger_states: [out_of_service]
//! ```
//!
//! Durations use humantime notation (`500ms`, `30s`, `2m`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{MachineState, NodeId, SecurityMode, SecurityPolicy};

// =============================================================================
// MonitorConfig
// =============================================================================

/// Root configuration of a machine monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Endpoint and reconnect settings.
    pub connection: ConnectionConfig,
    /// Subscription settings.
    pub subscription: SubscriptionSettings,
    /// Defaults applied to monitored items.
    pub monitoring: MonitoringParameters,
    /// Machinery node layout and trigger rules.
    pub machinery: MachineryConfig,
}

impl MonitorConfig {
    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.subscription.validate()?;
        self.monitoring.validate("monitoring")?;
        self.machinery.validate()?;
        Ok(())
    }
}

// =============================================================================
// ConnectionConfig
// =============================================================================

/// Endpoint, identity and reconnect settings.
///
/// Immutable once a connection manager has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server endpoint URL (`opc.tcp://host:port`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Message security mode.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Security policy.
    #[serde(default)]
    pub security_policy: SecurityPolicy,

    /// Client application name.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Client application URI.
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// Requested session timeout.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Timeout for single requests.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_endpoint() -> String {
    "opc.tcp://localhost:4840".to_string()
}

fn default_application_name() -> String {
    "machwatch".to_string()
}

fn default_application_uri() -> String {
    "urn:machwatch".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            security_mode: SecurityMode::default(),
            security_policy: SecurityPolicy::default(),
            application_name: default_application_name(),
            application_uri: default_application_uri(),
            session_timeout: default_session_timeout(),
            request_timeout: default_request_timeout(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Creates a builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::missing_field("connection.endpoint"));
        }
        if !self.endpoint.starts_with("opc.tcp://") {
            return Err(ConfigError::invalid_value(
                "connection.endpoint",
                "endpoint must start with 'opc.tcp://'",
            ));
        }
        if self.security_mode.is_none() != self.security_policy.is_none() {
            return Err(ConfigError::invalid_value(
                "connection.security_policy",
                format!(
                    "security mode {} cannot be combined with policy {}",
                    self.security_mode, self.security_policy
                ),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "connection.session_timeout",
                "session timeout must be greater than zero",
            ));
        }
        self.reconnect.validate()
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    endpoint: Option<String>,
    security_mode: Option<SecurityMode>,
    security_policy: Option<SecurityPolicy>,
    application_name: Option<String>,
    application_uri: Option<String>,
    session_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    reconnect: Option<ReconnectPolicy>,
}

impl ConnectionConfigBuilder {
    /// Sets the endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the security mode and policy.
    pub fn security(mut self, mode: SecurityMode, policy: SecurityPolicy) -> Self {
        self.security_mode = Some(mode);
        self.security_policy = Some(policy);
        self
    }

    /// Sets the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Sets the application URI.
    pub fn application_uri(mut self, uri: impl Into<String>) -> Self {
        self.application_uri = Some(uri.into());
        self
    }

    /// Sets the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the reconnect policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        let defaults = ConnectionConfig::default();
        let config = ConnectionConfig {
            endpoint: self
                .endpoint
                .ok_or_else(|| ConfigError::missing_field("connection.endpoint"))?,
            security_mode: self.security_mode.unwrap_or(defaults.security_mode),
            security_policy: self.security_policy.unwrap_or(defaults.security_policy),
            application_name: self.application_name.unwrap_or(defaults.application_name),
            application_uri: self.application_uri.unwrap_or(defaults.application_uri),
            session_timeout: self.session_timeout.unwrap_or(defaults.session_timeout),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            reconnect: self.reconnect.unwrap_or(defaults.reconnect),
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// ReconnectPolicy
// =============================================================================

/// Bounded exponential backoff between reconnect attempts.
///
/// The delay before attempt `n` (1-based) is
/// `min(initial_delay * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    10
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy.
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_retries,
        }
    }

    /// Returns the delay before the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid_value(
                "connection.reconnect.initial_delay",
                "initial delay must not exceed max delay",
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid_value(
                "connection.reconnect.max_retries",
                "at least one reconnect attempt is required",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SubscriptionSettings
// =============================================================================

/// Settings of the server-side subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Lifetime count.
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Max keep-alive count.
    #[serde(default = "default_max_keep_alive_count")]
    pub max_keep_alive_count: u32,

    /// Max notifications per publish response.
    #[serde(default = "default_max_notifications")]
    pub max_notifications_per_publish: u32,

    /// Priority.
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Whether publishing starts enabled.
    #[serde(default = "default_true")]
    pub publishing_enabled: bool,
}

fn default_publishing_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lifetime_count() -> u32 {
    100
}

fn default_max_keep_alive_count() -> u32 {
    10
}

fn default_max_notifications() -> u32 {
    100
}

fn default_priority() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            lifetime_count: default_lifetime_count(),
            max_keep_alive_count: default_max_keep_alive_count(),
            max_notifications_per_publish: default_max_notifications(),
            priority: default_priority(),
            publishing_enabled: true,
        }
    }
}

impl SubscriptionSettings {
    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "subscription.publishing_interval",
                "publishing interval must be greater than zero",
            ));
        }
        if self.lifetime_count < self.max_keep_alive_count.saturating_mul(3) {
            return Err(ConfigError::invalid_value(
                "subscription.lifetime_count",
                "lifetime count must be at least three times the keep-alive count",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// MonitoringParameters
// =============================================================================

/// Sampling parameters of a monitored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    /// Sampling interval.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Server-side queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,

    /// Drop the oldest value when the queue is full.
    #[serde(default = "default_true")]
    pub discard_oldest: bool,
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_size() -> u32 {
    10
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
            discard_oldest: true,
        }
    }
}

impl MonitoringParameters {
    /// Validates the parameters; `section` prefixes field paths.
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.sampling_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                format!("{section}.sampling_interval"),
                "sampling interval must be greater than zero",
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid_value(
                format!("{section}.queue_size"),
                "queue size must be greater than zero",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// MachineryConfig
// =============================================================================

/// Node layout of the machinery item and trigger rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineryConfig {
    /// Node holding the current machine state.
    #[serde(default = "default_state_node")]
    pub machine_state_node: NodeId,

    /// Node holding the current error code.
    #[serde(default = "default_error_code_node")]
    pub error_code_node: NodeId,

    /// Node holding the machine identifier.
    #[serde(default = "default_machine_id_node")]
    pub machine_id_node: NodeId,

    /// States that raise an equipment stop trigger.
    #[serde(default = "default_trigger_states")]
    pub trigger_states: Vec<MachineState>,

    /// Read the error code when building a trigger.
    #[serde(default = "default_true")]
    pub include_error_details: bool,

    /// Bound on the error code read during trigger construction.
    #[serde(default = "default_error_read_timeout", with = "humantime_serde")]
    pub error_read_timeout: Duration,

    /// Sampling interval of the state item.
    #[serde(default = "default_state_sampling", with = "humantime_serde")]
    pub state_sampling_interval: Duration,

    /// Sampling interval of the error code item.
    #[serde(default = "default_error_sampling", with = "humantime_serde")]
    pub error_sampling_interval: Duration,
}

fn default_state_node() -> NodeId {
    NodeId::string(2, "MachineryItemState.CurrentState")
}

fn default_error_code_node() -> NodeId {
    NodeId::string(2, "MachineryItemState.ErrorCode")
}

fn default_machine_id_node() -> NodeId {
    NodeId::string(2, "MachineIdentification.ProductInstanceUri")
}

fn default_trigger_states() -> Vec<MachineState> {
    vec![MachineState::OutOfService]
}

fn default_error_read_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_state_sampling() -> Duration {
    Duration::from_millis(500)
}

fn default_error_sampling() -> Duration {
    Duration::from_secs(1)
}

impl Default for MachineryConfig {
    fn default() -> Self {
        Self {
            machine_state_node: default_state_node(),
            error_code_node: default_error_code_node(),
            machine_id_node: default_machine_id_node(),
            trigger_states: default_trigger_states(),
            include_error_details: true,
            error_read_timeout: default_error_read_timeout(),
            state_sampling_interval: default_state_sampling(),
            error_sampling_interval: default_error_sampling(),
        }
    }
}

impl MachineryConfig {
    /// Returns `true` if entering `state` raises a trigger.
    pub fn is_trigger_state(&self, state: MachineState) -> bool {
        self.trigger_states.contains(&state)
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger_states.is_empty() {
            return Err(ConfigError::invalid_value(
                "machinery.trigger_states",
                "at least one trigger state is required",
            ));
        }
        if self.trigger_states.iter().any(MachineState::is_unknown) {
            return Err(ConfigError::invalid_value(
                "machinery.trigger_states",
                "'unknown' cannot be used as a trigger state",
            ));
        }
        if self.error_read_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "machinery.error_read_timeout",
                "error read timeout must be greater than zero",
            ));
        }
        if self.state_sampling_interval.is_zero() || self.error_sampling_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "machinery.state_sampling_interval",
                "sampling intervals must be greater than zero",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
