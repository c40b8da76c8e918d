//! Client registry
//!
//! Holds the currently-known client applications in registration order,
//! together with the filters describing which channels each one wants to
//! observe, approve and handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::channel::Channel;
use super::filter::{matches_any, ChannelFilter};
use super::operation::DispatchOperation;
use super::types::{ClientRole, OperationId, Properties};
use crate::core::errors::{DispatchError, Result};

/// Filters and flags a client registers with
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub name: String,
    #[serde(default)]
    pub observer_filters: Vec<ChannelFilter>,
    #[serde(default)]
    pub approver_filters: Vec<ChannelFilter>,
    #[serde(default)]
    pub handler_filters: Vec<ChannelFilter>,
    #[serde(default)]
    pub bypass_approval: bool,
}

impl ClientDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn observe(mut self, filter: ChannelFilter) -> Self {
        self.observer_filters.push(filter);
        self
    }

    pub fn approve(mut self, filter: ChannelFilter) -> Self {
        self.approver_filters.push(filter);
        self
    }

    pub fn handle(mut self, filter: ChannelFilter) -> Self {
        self.handler_filters.push(filter);
        self
    }

    pub fn bypass_approval(mut self, bypass: bool) -> Self {
        self.bypass_approval = bypass;
        self
    }

    pub fn filters(&self, role: ClientRole) -> &[ChannelFilter] {
        match role {
            ClientRole::Observe => &self.observer_filters,
            ClientRole::Approve => &self.approver_filters,
            ClientRole::Handle => &self.handler_filters,
        }
    }

    /// Whether any of this client's filters for `role` accepts the channel
    pub fn wants(&self, role: ClientRole, channel: &Properties) -> bool {
        matches_any(self.filters(role), channel)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(yaml)?;
        if descriptor.name.is_empty() {
            return Err(DispatchError::configuration_field(
                "client name must not be empty",
                "name",
            ));
        }
        Ok(descriptor)
    }
}

/// Arguments of ObserveChannels
#[derive(Clone)]
pub struct ObserveRequest {
    pub account: String,
    pub connection: String,
    pub channel_path: String,
    pub properties: Properties,
    pub operation: Arc<DispatchOperation>,
}

/// Arguments of AddDispatchOperation
#[derive(Clone)]
pub struct ApprovalRequest {
    pub account: String,
    pub connection: String,
    pub channel_path: String,
    pub properties: Properties,
    pub possible_handlers: Vec<String>,
    pub operation: Arc<DispatchOperation>,
}

/// Arguments of HandleChannels
#[derive(Clone)]
pub struct HandleRequest {
    pub operation: OperationId,
    pub account: String,
    pub connection: String,
    pub channel: Arc<dyn Channel>,
    pub properties: Properties,
}

/// Entry points of a client application.
///
/// Each call returns once the client has acknowledged it. A client only
/// needs to implement the roles it registers filters for.
#[async_trait]
pub trait Client: Send + Sync {
    async fn observe_channels(&self, _request: ObserveRequest) -> anyhow::Result<()> {
        anyhow::bail!("client does not implement the observer role")
    }

    async fn add_dispatch_operation(&self, _request: ApprovalRequest) -> anyhow::Result<()> {
        anyhow::bail!("client does not implement the approver role")
    }

    async fn handle_channels(&self, _request: HandleRequest) -> anyhow::Result<()> {
        anyhow::bail!("client does not implement the handler role")
    }
}

/// A registered client: its descriptor plus the endpoint to call
#[derive(Clone)]
pub struct RegisteredClient {
    pub descriptor: Arc<ClientDescriptor>,
    pub endpoint: Arc<dyn Client>,
}

impl RegisteredClient {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Registry of client applications, in registration order
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<Vec<RegisteredClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, or replace the filters of a known one in place
    pub async fn register(&self, descriptor: ClientDescriptor, endpoint: Arc<dyn Client>) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(DispatchError::invalid_argument("client name must not be empty"));
        }
        let entry = RegisteredClient {
            descriptor: Arc::new(descriptor),
            endpoint,
        };
        let mut clients = self.clients.write().await;
        match clients.iter_mut().find(|c| c.name() == entry.name()) {
            Some(existing) => {
                debug!(client = %entry.name(), "Client re-registered");
                *existing = entry;
            }
            None => {
                info!(client = %entry.name(), "Client registered");
                clients.push(entry);
            }
        }
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<()> {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|c| c.name() != name);
        if clients.len() == before {
            return Err(DispatchError::unknown_client(name));
        }
        info!(client = %name, "Client unregistered");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<RegisteredClient> {
        let clients = self.clients.read().await;
        clients.iter().find(|c| c.name() == name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.get(name).await.is_some()
    }

    /// Registered client names, in registration order
    pub async fn list(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        clients.iter().map(|c| c.name().to_string()).collect()
    }

    /// Copy of the current client set, for one fan-out phase
    pub async fn snapshot(&self) -> Vec<RegisteredClient> {
        self.clients.read().await.clone()
    }

    /// Clients whose filters for `role` accept the channel
    pub async fn matching(&self, channel: &Properties, role: ClientRole) -> Vec<RegisteredClient> {
        let clients = self.clients.read().await;
        clients
            .iter()
            .filter(|c| c.descriptor.wants(role, channel))
            .cloned()
            .collect()
    }

    /// Names of the clients whose filters for `role` accept the channel
    pub async fn match_clients(&self, channel: &Properties, role: ClientRole) -> Vec<String> {
        self.matching(channel, role)
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}
