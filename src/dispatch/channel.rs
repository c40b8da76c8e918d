//! Channel abstraction supplied by the connection manager

use async_trait::async_trait;

use super::types::{interfaces, props, Properties, RemovalReason};

/// A live channel handed to the dispatcher.
///
/// The dispatcher never mutates a channel's properties; it only removes the
/// local member from group channels and closes channels it cannot dispatch.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable object identity of the channel
    fn path(&self) -> &str;

    /// Immutable properties fixed at creation
    fn properties(&self) -> &Properties;

    /// Remove the local user from a group channel
    async fn remove_self(&self, message: &str, reason: RemovalReason) -> anyhow::Result<()>;

    /// Close the channel
    async fn close(&self) -> anyhow::Result<()>;

    /// Whether the channel implements the group interface
    fn is_group(&self) -> bool {
        self.properties()
            .get(props::INTERFACES)
            .and_then(|v| v.as_list())
            .map(|ifaces| ifaces.iter().any(|i| i == interfaces::GROUP))
            .unwrap_or(false)
    }

    /// Whether the local user asked for this channel
    fn is_requested(&self) -> bool {
        self.properties()
            .get(props::REQUESTED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn channel_type(&self) -> Option<&str> {
        self.properties()
            .get(props::CHANNEL_TYPE)
            .and_then(|v| v.as_str())
    }
}
