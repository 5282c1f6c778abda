// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Value types shared by the transport seam and the monitor.
//!
//! - [`NodeId`]: address of a data point on the server
//! - [`StatusCode`]: quality of a value or result
//! - [`Variant`] / [`DataValue`]: a value and its quality and timestamps
//! - [`MachineState`]: the decoded machinery item state
//! - [`SecurityMode`] / [`SecurityPolicy`]: endpoint security selectors

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// NodeId
// =============================================================================

/// Address of a node, written as `ns=<index>;i=<number>` or
/// `ns=<index>;s=<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    /// Namespace index.
    pub namespace: u16,
    /// Identifier within the namespace.
    pub identifier: Identifier,
}

/// Node identifier kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Numeric identifier (`i=`).
    Numeric(u32),
    /// String identifier (`s=`).
    String(String),
}

impl NodeId {
    /// Creates a numeric node id.
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Creates a string node id.
    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "ns={};i={}", self.namespace, v),
            Identifier::String(v) => write!(f, "ns={};s={}", self.namespace, v),
        }
    }
}

impl FromStr for NodeId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |message: &str| ConfigError::invalid_value("node_id", format!("'{s}': {message}"));

        let (namespace, identifier) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, ident) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace"))?;
                let ns: u16 = ns.parse().map_err(|_| invalid("invalid namespace index"))?;
                (ns, ident)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier.strip_prefix("i=") {
            Identifier::Numeric(id.parse().map_err(|_| invalid("invalid numeric identifier"))?)
        } else if let Some(id) = identifier.strip_prefix("s=") {
            if id.is_empty() {
                return Err(invalid("empty string identifier"));
            }
            Identifier::String(id.to_string())
        } else {
            return Err(invalid("expected i= or s= identifier"));
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl TryFrom<String> for NodeId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code. The top two bits carry the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: Self = Self(0);
    /// Uncertain, no further detail.
    pub const UNCERTAIN: Self = Self(0x4000_0000);
    /// Generic bad status.
    pub const BAD: Self = Self(0x8000_0000);
    /// The node does not exist.
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// Communication with the data source failed.
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    /// The value was rejected on write.
    pub const BAD_TYPE_MISMATCH: Self = Self(0x8074_0000);

    /// Returns `true` for good status.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for uncertain status.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    /// Returns `true` for bad status.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

// =============================================================================
// Variant
// =============================================================================

/// A scalar value read from or written to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Variant {
    /// No value.
    #[default]
    Null,
    /// Boolean.
    Boolean(bool),
    /// Signed integer.
    Int64(i64),
    /// Unsigned integer.
    UInt64(u64),
    /// Floating point.
    Double(f64),
    /// Text.
    String(String),
    /// Timestamp.
    DateTime(DateTime<Utc>),
}

impl Variant {
    /// Returns the value as an `i64` when it is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            Self::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Boolean(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Returns the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` for null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` unless the value is null, false, zero or empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Boolean(v) => *v,
            Self::Int64(v) => *v != 0,
            Self::UInt64(v) => *v != 0,
            Self::Double(v) => *v != 0.0 && !v.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::DateTime(_) => true,
        }
    }

    /// Returns a short type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Boolean(_) => "Boolean",
            Self::Int64(_) => "Int64",
            Self::UInt64(_) => "UInt64",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::DateTime(_) => "DateTime",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::UInt64(u64::from(v))
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<MachineState> for Variant {
    fn from(v: MachineState) -> Self {
        match v {
            MachineState::Unknown(Some(raw)) => Self::Int64(raw),
            MachineState::Unknown(None) => Self::Null,
            known => Self::UInt64(u64::from(known.code().unwrap_or_default())),
        }
    }
}

// =============================================================================
// DataValue
// =============================================================================

/// A value together with its status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataValue {
    /// The value.
    pub value: Variant,
    /// Quality of the value.
    pub status: StatusCode,
    /// Timestamp from the data source.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Timestamp from the server.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Creates a good value stamped with the current time.
    pub fn good(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// Creates a value with an explicit status and no timestamps.
    pub fn with_status(value: impl Into<Variant>, status: StatusCode) -> Self {
        Self {
            value: value.into(),
            status,
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    /// Sets the timestamps.
    pub fn with_timestamps(
        mut self,
        source: Option<DateTime<Utc>>,
        server: Option<DateTime<Utc>>,
    ) -> Self {
        self.source_timestamp = source;
        self.server_timestamp = server;
        self
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Node attribute selected by a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeId {
    /// The value attribute.
    #[default]
    Value,
    /// The display name attribute.
    DisplayName,
}

impl AttributeId {
    /// Returns the OPC UA attribute id.
    pub const fn id(&self) -> u32 {
        match self {
            Self::DisplayName => 4,
            Self::Value => 13,
        }
    }
}

// =============================================================================
// MachineState
// =============================================================================

/// Operating state of a machinery item.
///
/// Codes follow the OPC UA Machinery `MachineryItemState` model. Values the
/// monitor cannot decode map to [`MachineState::Unknown`], which keeps the
/// raw numeric code so that two different unknown codes stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// State information is not available.
    NotAvailable,
    /// The machine is out of service.
    OutOfService,
    /// The machine is idle.
    NotExecuting,
    /// The machine is producing.
    Executing,
    /// The reported value is not a known state. Holds the raw code when
    /// the value was numeric.
    Unknown(Option<i64>),
}

impl MachineState {
    /// Decodes a state from a node value.
    ///
    /// Accepts the numeric codes 0-3 and the state names.
    pub fn from_variant(value: &Variant) -> Self {
        if let Some(code) = value.as_i64() {
            return Self::from_code(code);
        }
        value
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Self::Unknown(None))
    }

    /// Decodes a numeric state code.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::NotAvailable,
            1 => Self::OutOfService,
            2 => Self::NotExecuting,
            3 => Self::Executing,
            other => Self::Unknown(Some(other)),
        }
    }

    /// Returns the numeric code, `None` for `Unknown`.
    pub const fn code(&self) -> Option<u32> {
        match self {
            Self::NotAvailable => Some(0),
            Self::OutOfService => Some(1),
            Self::NotExecuting => Some(2),
            Self::Executing => Some(3),
            Self::Unknown(_) => None,
        }
    }

    /// Returns the state name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotAvailable => "NotAvailable",
            Self::OutOfService => "OutOfService",
            Self::NotExecuting => "NotExecuting",
            Self::Executing => "Executing",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Returns `true` for any undecodable value.
    #[inline]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// Returns `true` while the machine produces.
    #[inline]
    pub const fn is_operational(&self) -> bool {
        matches!(self, Self::Executing)
    }

    /// Returns `true` when the machine is out of service.
    #[inline]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::OutOfService)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(Some(code)) => write!(f, "Unknown({code})"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl FromStr for MachineState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "notavailable" => Ok(Self::NotAvailable),
            "outofservice" => Ok(Self::OutOfService),
            "notexecuting" => Ok(Self::NotExecuting),
            "executing" => Ok(Self::Executing),
            "unknown" => Ok(Self::Unknown(None)),
            _ => Err(ConfigError::invalid_value(
                "machine_state",
                format!("unknown machine state '{s}'"),
            )),
        }
    }
}

// =============================================================================
// SecurityMode / SecurityPolicy
// =============================================================================

/// Message security mode of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Neither signed nor encrypted.
    #[default]
    None,
    /// Signed.
    Sign,
    /// Signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns `true` if this mode provides no security.
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(ConfigError::invalid_value(
                "security_mode",
                format!("unknown security mode '{s}'"),
            )),
        }
    }
}

/// Security policy of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityPolicy {
    /// No security policy.
    #[default]
    #[serde(alias = "none")]
    None,
    /// Basic128Rsa15 (deprecated).
    #[serde(alias = "basic128rsa15")]
    Basic128Rsa15,
    /// Basic256 (deprecated).
    #[serde(alias = "basic256")]
    Basic256,
    /// Basic256Sha256.
    #[serde(alias = "basic256sha256")]
    Basic256Sha256,
}

impl SecurityPolicy {
    /// Returns the policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            Self::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
        }
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic128Rsa15 => "Basic128Rsa15",
            Self::Basic256 => "Basic256",
            Self::Basic256Sha256 => "Basic256Sha256",
        }
    }

    /// Returns `true` if this policy provides no security.
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SecurityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('#').next().unwrap_or(s);
        match name.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "basic128rsa15" => Ok(Self::Basic128Rsa15),
            "basic256" => Ok(Self::Basic256),
            "basic256sha256" => Ok(Self::Basic256Sha256),
            _ => Err(ConfigError::invalid_value(
                "security_policy",
                format!("unknown security policy '{s}'"),
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
