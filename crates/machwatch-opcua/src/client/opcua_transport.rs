// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! [`TelemetryTransport`] over the `opcua` crate.
//!
//! The `opcua` client API is synchronous. Every call into it runs on the
//! blocking thread pool so the connection manager's tasks are never stalled
//! by network round trips.
//!
//! Lifecycle mapping:
//!
//! - `open`: builds the client and discovers the endpoint matching the
//!   configured security mode and policy.
//! - `create_session`: connects to that endpoint, activates an anonymous
//!   session and starts its publish loop.
//! - `create_subscription`: creates a server subscription whose data change
//!   callback routes samples to [`ItemSink`]s by client handle.
//! - A dropped session is reported through the [`LifecycleSink`]. The
//!   session's own retry is disabled; the connection manager reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use machwatch_opcua::{MachineMonitor, MonitorConfig, OpcUaTransport};
//!
//! let transport = Arc::new(OpcUaTransport::new());
//! let monitor = MachineMonitor::new(transport, MonitorConfig::default())?;
//! monitor.connect().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use opcua::client::prelude::*;
use opcua::sync::RwLock as OpcUaRwLock;

use crate::client::transport::{
    ItemSink, LifecycleSink, MonitoredItemId, SessionId, SubscriptionId, TelemetryTransport,
};
use crate::config::{ConnectionConfig, MonitoringParameters, SubscriptionSettings};
use crate::error::{MonitoringError, ReadError, TransportError, WriteError};
use crate::types::{
    AttributeId, DataValue, Identifier, NodeId, SecurityMode, SecurityPolicy, StatusCode, Variant,
};

type SharedSession = Arc<OpcUaRwLock<Session>>;
type Routes = Arc<Mutex<HashMap<u32, ItemSink>>>;

// =============================================================================
// OpcUaTransport
// =============================================================================

/// Transport speaking OPC UA through the `opcua` client stack.
pub struct OpcUaTransport {
    link: Mutex<Link>,
    subscriptions: Mutex<HashMap<u32, Routes>>,
    next_client_handle: AtomicU32,
}

#[derive(Default)]
struct Link {
    client: Option<Client>,
    endpoint: Option<EndpointDescription>,
    endpoint_url: String,
    signals: Option<LifecycleSink>,
    session: Option<ActiveSession>,
}

struct ActiveSession {
    id: SessionId,
    session: SharedSession,
    closing: Arc<AtomicBool>,
    runner: Option<oneshot::Sender<SessionCommand>>,
}

impl ActiveSession {
    fn close(mut self) -> SharedSession {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(runner) = self.runner.take() {
            let _ = runner.send(SessionCommand::Stop);
        }
        self.session
    }
}

impl Default for OpcUaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OpcUaTransport {
    /// Creates a transport. Nothing is opened until the manager connects.
    pub fn new() -> Self {
        Self {
            link: Mutex::new(Link::default()),
            subscriptions: Mutex::new(HashMap::new()),
            next_client_handle: AtomicU32::new(1),
        }
    }

    fn build_client(config: &ConnectionConfig) -> Result<Client, TransportError> {
        ClientBuilder::new()
            .application_name(config.application_name.as_str())
            .application_uri(config.application_uri.as_str())
            .create_sample_keypair(!config.security_mode.is_none())
            // Reconnects are owned by the connection manager.
            .session_retry_limit(0)
            .session_timeout(duration_millis(config.session_timeout))
            .client()
            .ok_or_else(|| TransportError::open(&config.endpoint, "invalid client configuration"))
    }

    fn session(&self) -> Option<(SessionId, SharedSession)> {
        self.link
            .lock()
            .session
            .as_ref()
            .map(|active| (active.id, Arc::clone(&active.session)))
    }

    fn routes(&self, subscription: SubscriptionId) -> Option<Routes> {
        self.subscriptions.lock().get(&subscription.0).cloned()
    }
}

impl std::fmt::Debug for OpcUaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.link.lock();
        f.debug_struct("OpcUaTransport")
            .field("endpoint", &link.endpoint_url)
            .field("session", &link.session.as_ref().map(|s| s.id))
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

/// Runs a call into the synchronous client on the blocking pool.
async fn blocking<F, R>(call: F) -> Result<R, String>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| format!("client task failed: {e}"))
}

#[async_trait]
impl TelemetryTransport for OpcUaTransport {
    async fn open(
        &self,
        config: &ConnectionConfig,
        signals: LifecycleSink,
    ) -> Result<(), TransportError> {
        let client = Self::build_client(config)?;
        let url = config.endpoint.clone();
        let policy = security_policy(config.security_policy);
        let mode = security_mode(config.security_mode);

        tracing::debug!(
            endpoint = %url,
            policy = %config.security_policy,
            mode = %config.security_mode,
            "Discovering endpoints"
        );
        let discovery_url = url.clone();
        let (client, endpoints) = blocking(move || {
            let endpoints = client.get_server_endpoints_from_url(discovery_url.as_str());
            (client, endpoints)
        })
        .await
        .map_err(|e| TransportError::open(&url, e))?;
        let endpoints = endpoints.map_err(|status| TransportError::open(&url, status.to_string()))?;

        let endpoint = endpoints
            .into_iter()
            .find(|e| e.security_policy_uri.as_ref() == policy.to_uri() && e.security_mode == mode)
            .ok_or_else(|| {
                TransportError::open(
                    &url,
                    format!(
                        "no endpoint offers {}/{}",
                        config.security_policy, config.security_mode
                    ),
                )
            })?;

        let mut link = self.link.lock();
        link.client = Some(client);
        link.endpoint = Some(endpoint);
        link.endpoint_url = url;
        link.signals = Some(signals);
        Ok(())
    }

    async fn create_session(&self, timeout: Duration) -> Result<SessionId, TransportError> {
        let (client, endpoint, signals) = {
            let mut link = self.link.lock();
            match (link.client.take(), link.endpoint.clone(), link.signals.clone()) {
                (Some(client), Some(endpoint), Some(signals)) => (client, endpoint, signals),
                _ => return Err(TransportError::session("transport not open")),
            }
        };

        let connect = blocking(move || {
            let mut client = client;
            let session = client.connect_to_endpoint(endpoint, IdentityToken::Anonymous);
            (client, session)
        });
        let (client, session) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::session(format!("no session after {timeout:?}")))?
            .map_err(TransportError::session)?;
        self.link.lock().client = Some(client);
        let session = session.map_err(|status| TransportError::session(status.to_string()))?;

        let closing = Arc::new(AtomicBool::new(false));
        let watcher = Arc::clone(&closing);
        session
            .write()
            .set_connection_status_callback(ConnectionStatusCallback::new(move |connected| {
                if watcher.load(Ordering::SeqCst) {
                    return;
                }
                if connected {
                    signals.connection_reestablished();
                } else {
                    signals.connection_lost("session connection closed");
                }
            }));
        let runner = Session::run_async(Arc::clone(&session));

        let id = SessionId(self.next_client_handle.fetch_add(1, Ordering::Relaxed));
        let mut link = self.link.lock();
        if let Some(stale) = link.session.take() {
            let stale = stale.close();
            let _ = tokio::task::spawn_blocking(move || stale.read().disconnect());
        }
        link.session = Some(ActiveSession {
            id,
            session,
            closing,
            runner: Some(runner),
        });
        tracing::debug!(session = %id, "Session activated");
        Ok(id)
    }

    async fn create_subscription(
        &self,
        session: SessionId,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, TransportError> {
        let (current, shared) = self
            .session()
            .ok_or_else(|| TransportError::subscription("no session"))?;
        if current != session {
            return Err(TransportError::subscription(format!("unknown {session}")));
        }

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let callback_routes = Arc::clone(&routes);
        let callback = DataChangeCallback::new(move |items| {
            let routes = callback_routes.lock();
            for item in items.iter() {
                if let Some(sink) = routes.get(&item.client_handle()) {
                    sink.data_change(from_opcua_data_value(item.last_value()));
                }
            }
        });

        let settings = settings.clone();
        let created = blocking(move || {
            shared.read().create_subscription(
                settings.publishing_interval.as_secs_f64() * 1000.0,
                settings.lifetime_count,
                settings.max_keep_alive_count,
                settings.max_notifications_per_publish,
                settings.priority,
                settings.publishing_enabled,
                callback,
            )
        })
        .await
        .map_err(TransportError::subscription)?;
        let server_id = created.map_err(|status| TransportError::subscription(status.to_string()))?;

        self.subscriptions.lock().insert(server_id, routes);
        Ok(SubscriptionId(server_id))
    }

    async fn terminate_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        if self.subscriptions.lock().remove(&subscription.0).is_none() {
            return Ok(());
        }
        let Some((_, shared)) = self.session() else {
            return Ok(());
        };
        let deleted = blocking(move || shared.read().delete_subscription(subscription.0))
            .await
            .map_err(|e| TransportError::close("subscription", e))?;
        deleted
            .map(|_| ())
            .map_err(|status| TransportError::close("subscription", status.to_string()))
    }

    async fn close_session(&self, session: SessionId) -> Result<(), TransportError> {
        let active = {
            let mut link = self.link.lock();
            match &link.session {
                Some(active) if active.id == session => link.session.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            return Ok(());
        };
        let shared = active.close();
        blocking(move || shared.read().disconnect())
            .await
            .map_err(|e| TransportError::close("session", e))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let active = {
            let mut link = self.link.lock();
            link.client = None;
            link.endpoint = None;
            link.signals = None;
            link.session.take()
        };
        self.subscriptions.lock().clear();
        if let Some(active) = active {
            let shared = active.close();
            blocking(move || shared.read().disconnect())
                .await
                .map_err(|e| TransportError::close("transport", e))?;
        }
        Ok(())
    }

    async fn monitor(
        &self,
        subscription: SubscriptionId,
        node_id: &NodeId,
        attribute: AttributeId,
        params: &MonitoringParameters,
        sink: ItemSink,
    ) -> Result<MonitoredItemId, MonitoringError> {
        let routes = self.routes(subscription).ok_or(MonitoringError::NotSubscribed)?;
        let (_, shared) = self.session().ok_or(MonitoringError::NotSubscribed)?;

        let display_name = sink.display_name().to_string();
        let client_handle = self.next_client_handle.fetch_add(1, Ordering::Relaxed);
        // Registered first: the server may publish the initial value before
        // the create call returns.
        routes.lock().insert(client_handle, sink);

        let request = MonitoredItemCreateRequest {
            item_to_monitor: read_value_id(node_id, attribute),
            monitoring_mode: MonitoringMode::Reporting,
            requested_parameters: opcua::types::MonitoringParameters {
                client_handle,
                sampling_interval: params.sampling_interval.as_secs_f64() * 1000.0,
                filter: ExtensionObject::null(),
                queue_size: params.queue_size,
                discard_oldest: params.discard_oldest,
            },
        };
        let created = blocking(move || {
            shared
                .read()
                .create_monitored_items(subscription.0, TimestampsToReturn::Both, &[request])
        })
        .await;

        let result = match created {
            Ok(Ok(results)) => match results.into_iter().next() {
                Some(result) if result.status_code.is_good() => Ok(result.monitored_item_id),
                Some(result) => Err(result.status_code.to_string()),
                None => Err("empty create response".to_string()),
            },
            Ok(Err(status)) => Err(status.to_string()),
            Err(e) => Err(e),
        };

        match result {
            Ok(id) => Ok(MonitoredItemId(id)),
            Err(message) => {
                routes.lock().remove(&client_handle);
                Err(MonitoringError::item_creation(display_name, message))
            }
        }
    }

    async fn read(&self, session: SessionId, node_id: &NodeId) -> Result<DataValue, ReadError> {
        let (current, shared) = self.session().ok_or_else(|| ReadError::NotConnected {
            node_id: node_id.clone(),
        })?;
        if current != session {
            return Err(ReadError::NotConnected {
                node_id: node_id.clone(),
            });
        }

        let request = read_value_id(node_id, AttributeId::Value);
        let values = blocking(move || shared.read().read(&[request], TimestampsToReturn::Both, 0.0))
            .await
            .map_err(|e| ReadError::failed(node_id, e))?
            .map_err(|status| ReadError::failed(node_id, status.to_string()))?;

        let value = values
            .first()
            .map(from_opcua_data_value)
            .ok_or_else(|| ReadError::failed(node_id, "empty read response"))?;
        if value.status.is_bad() {
            return Err(ReadError::BadStatus {
                node_id: node_id.clone(),
                status: value.status,
            });
        }
        Ok(value)
    }

    async fn write(
        &self,
        session: SessionId,
        node_id: &NodeId,
        value: &Variant,
    ) -> Result<StatusCode, WriteError> {
        let (current, shared) = self.session().ok_or_else(|| WriteError::NotConnected {
            node_id: node_id.clone(),
        })?;
        if current != session {
            return Err(WriteError::NotConnected {
                node_id: node_id.clone(),
            });
        }

        let request = WriteValue {
            node_id: to_opcua_node_id(node_id),
            attribute_id: AttributeId::Value.id(),
            index_range: UAString::null(),
            value: opcua::types::DataValue::new_now(to_opcua_variant(value)),
        };
        let results = blocking(move || shared.read().write(&[request]))
            .await
            .map_err(|e| WriteError::failed(node_id, e))?
            .map_err(|status| WriteError::failed(node_id, status.to_string()))?;

        let status = results
            .first()
            .map(|s| StatusCode(s.bits()))
            .ok_or_else(|| WriteError::failed(node_id, "empty write response"))?;
        if status.is_bad() {
            return Err(WriteError::BadStatus {
                node_id: node_id.clone(),
                status,
            });
        }
        Ok(status)
    }

    fn name(&self) -> &str {
        "opcua"
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn duration_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn security_policy(policy: SecurityPolicy) -> opcua::client::prelude::SecurityPolicy {
    match policy {
        SecurityPolicy::None => opcua::client::prelude::SecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15 => opcua::client::prelude::SecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256 => opcua::client::prelude::SecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256 => opcua::client::prelude::SecurityPolicy::Basic256Sha256,
    }
}

fn security_mode(mode: SecurityMode) -> opcua::types::MessageSecurityMode {
    match mode {
        SecurityMode::None => opcua::types::MessageSecurityMode::None,
        SecurityMode::Sign => opcua::types::MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => opcua::types::MessageSecurityMode::SignAndEncrypt,
    }
}

fn read_value_id(node_id: &NodeId, attribute: AttributeId) -> ReadValueId {
    ReadValueId {
        node_id: to_opcua_node_id(node_id),
        attribute_id: attribute.id(),
        index_range: UAString::null(),
        data_encoding: QualifiedName::null(),
    }
}

fn to_opcua_node_id(node_id: &NodeId) -> opcua::types::NodeId {
    match &node_id.identifier {
        Identifier::Numeric(v) => opcua::types::NodeId::new(node_id.namespace, *v),
        Identifier::String(v) => opcua::types::NodeId::new(node_id.namespace, v.clone()),
    }
}

fn from_opcua_variant(variant: &opcua::types::Variant) -> Variant {
    use opcua::types::Variant as Ua;

    match variant {
        Ua::Empty => Variant::Null,
        Ua::Boolean(v) => Variant::Boolean(*v),
        Ua::SByte(v) => Variant::Int64(i64::from(*v)),
        Ua::Byte(v) => Variant::UInt64(u64::from(*v)),
        Ua::Int16(v) => Variant::Int64(i64::from(*v)),
        Ua::UInt16(v) => Variant::UInt64(u64::from(*v)),
        Ua::Int32(v) => Variant::Int64(i64::from(*v)),
        Ua::UInt32(v) => Variant::UInt64(u64::from(*v)),
        Ua::Int64(v) => Variant::Int64(*v),
        Ua::UInt64(v) => Variant::UInt64(*v),
        Ua::Float(v) => Variant::Double(f64::from(*v)),
        Ua::Double(v) => Variant::Double(*v),
        Ua::String(v) => Variant::String(v.as_ref().to_string()),
        Ua::DateTime(v) => Variant::DateTime(v.as_chrono()),
        Ua::LocalizedText(v) => Variant::String(v.text.as_ref().to_string()),
        other => Variant::String(format!("{other:?}")),
    }
}

fn to_opcua_variant(value: &Variant) -> opcua::types::Variant {
    use opcua::types::Variant as Ua;

    match value {
        Variant::Null => Ua::Empty,
        Variant::Boolean(v) => Ua::Boolean(*v),
        Variant::Int64(v) => Ua::Int64(*v),
        Variant::UInt64(v) => Ua::UInt64(*v),
        Variant::Double(v) => Ua::Double(*v),
        Variant::String(v) => Ua::String(UAString::from(v.as_str())),
        Variant::DateTime(v) => Ua::DateTime(Box::new(opcua::types::DateTime::from(*v))),
    }
}

fn from_opcua_data_value(value: &opcua::types::DataValue) -> DataValue {
    DataValue {
        value: value
            .value
            .as_ref()
            .map(from_opcua_variant)
            .unwrap_or_default(),
        status: value
            .status
            .as_ref()
            .map(|s| StatusCode(s.bits()))
            .unwrap_or(StatusCode::GOOD),
        source_timestamp: value.source_timestamp.as_ref().map(|t| t.as_chrono()),
        server_timestamp: value.server_timestamp.as_ref().map(|t| t.as_chrono()),
    }
}

// =============================================================================
// Tests
// =============================================================================
