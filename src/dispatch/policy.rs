//! Policy gate
//!
//! Policy plugins get a veto over every incoming channel before any client
//! sees it. All plugins are queried concurrently and the first denial
//! decides; a plugin that fails or does not answer in time counts as a
//! denial.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::types::{Properties, RemovalReason};
use crate::core::errors::DispatchError;

/// What a policy plugin is asked about
#[derive(Clone, Debug)]
pub struct PolicyQuery {
    pub account: String,
    pub connection: String,
    pub channel_path: String,
    pub properties: Properties,
}

/// A single plugin's answer
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyVerdict {
    Allow,
    Deny {
        reason: String,
        removal_reason: RemovalReason,
    },
}

impl PolicyVerdict {
    /// Deny with the permission-denied removal reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            removal_reason: RemovalReason::PermissionDenied,
        }
    }
}

/// A pluggable permission check
#[async_trait]
pub trait PolicyPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, query: &PolicyQuery) -> anyhow::Result<PolicyVerdict>;
}

/// The gate's aggregate decision
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny {
        plugin: String,
        reason: String,
        removal_reason: RemovalReason,
    },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Reduces the answers of all registered plugins to one decision
#[derive(Clone)]
pub struct PolicyGate {
    plugins: Arc<RwLock<Vec<Arc<dyn PolicyPlugin>>>>,
    timeout: Duration,
}

impl PolicyGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            plugins: Arc::new(RwLock::new(Vec::new())),
            timeout,
        }
    }

    pub async fn add_plugin(&self, plugin: Arc<dyn PolicyPlugin>) {
        info!(plugin = %plugin.name(), "Policy plugin registered");
        self.plugins.write().await.push(plugin);
    }

    /// Remove every plugin registered under `name`
    pub async fn remove_plugin(&self, name: &str) -> bool {
        let mut plugins = self.plugins.write().await;
        let before = plugins.len();
        plugins.retain(|p| p.name() != name);
        plugins.len() != before
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        let plugins = self.plugins.read().await;
        plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn evaluate(&self, query: &PolicyQuery) -> PolicyDecision {
        let plugins = self.plugins.read().await.clone();
        if plugins.is_empty() {
            return PolicyDecision::Allow;
        }

        let timeout = self.timeout;
        let mut pending: FuturesUnordered<_> = plugins
            .into_iter()
            .map(|plugin| {
                let query = query.clone();
                async move {
                    let answer = tokio::time::timeout(timeout, plugin.check(&query)).await;
                    (plugin.name().to_string(), answer)
                }
            })
            .collect();

        // Returning early drops the remaining queries, so late answers
        // have nowhere to land.
        while let Some((plugin, answer)) = pending.next().await {
            match answer {
                Ok(Ok(PolicyVerdict::Allow)) => {
                    debug!(plugin = %plugin, channel = %query.channel_path, "Policy plugin allowed channel");
                }
                Ok(Ok(PolicyVerdict::Deny { reason, removal_reason })) => {
                    info!(plugin = %plugin, channel = %query.channel_path, reason = %reason, "Policy plugin denied channel");
                    return PolicyDecision::Deny {
                        plugin,
                        reason,
                        removal_reason,
                    };
                }
                Ok(Err(e)) => {
                    let err = DispatchError::client(plugin.as_str(), "check", &e);
                    warn!(plugin = %plugin, channel = %query.channel_path, error = %err, "Policy plugin failed; denying");
                    return PolicyDecision::Deny {
                        plugin,
                        reason: err.to_string(),
                        removal_reason: RemovalReason::PermissionDenied,
                    };
                }
                Err(_) => {
                    let err = DispatchError::policy_timeout(plugin.as_str(), timeout.as_millis() as u64);
                    error!(plugin = %plugin, channel = %query.channel_path, error = %err, category = err.category(), "Policy query timed out; denying");
                    return PolicyDecision::Deny {
                        plugin,
                        reason: err.to_string(),
                        removal_reason: RemovalReason::PermissionDenied,
                    };
                }
            }
        }

        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        verdict: PolicyVerdict,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, verdict: PolicyVerdict, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                verdict,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PolicyPlugin for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self, _query: &PolicyQuery) -> anyhow::Result<PolicyVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.verdict.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl PolicyPlugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn check(&self, _query: &PolicyQuery) -> anyhow::Result<PolicyVerdict> {
            anyhow::bail!("policy service unreachable")
        }
    }

    fn query() -> PolicyQuery {
        PolicyQuery {
            account: "/account/fakecm/fakeprotocol/someguy".into(),
            connection: "/conn/fakecm/someguy".into(),
            channel_path: "/conn/fakecm/someguy/chan1".into(),
            properties: Properties::new(),
        }
    }

    #[tokio::test]
    async fn test_no_plugins_allows() {
        let gate = PolicyGate::new(Duration::from_millis(50));
        assert_eq!(gate.evaluate(&query()).await, PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn test_all_allow() {
        let gate = PolicyGate::new(Duration::from_secs(1));
        let a = Fixed::new("a", PolicyVerdict::Allow, Duration::ZERO);
        let b = Fixed::new("b", PolicyVerdict::Allow, Duration::from_millis(10));
        gate.add_plugin(a.clone()).await;
        gate.add_plugin(b.clone()).await;
        assert!(gate.evaluate(&query()).await.is_allowed());
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denial_wins_over_allow() {
        let gate = PolicyGate::new(Duration::from_secs(1));
        gate.add_plugin(Fixed::new("allow", PolicyVerdict::Allow, Duration::ZERO)).await;
        gate.add_plugin(Fixed::new(
            "deny",
            PolicyVerdict::deny("Computer says no"),
            Duration::from_millis(20),
        ))
        .await;

        match gate.evaluate(&query()).await {
            PolicyDecision::Deny { plugin, reason, removal_reason } => {
                assert_eq!(plugin, "deny");
                assert_eq!(reason, "Computer says no");
                assert_eq!(removal_reason, RemovalReason::PermissionDenied);
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plugins_are_queried_concurrently() {
        let gate = PolicyGate::new(Duration::from_secs(2));
        for name in ["a", "b", "c"] {
            gate.add_plugin(Fixed::new(name, PolicyVerdict::Allow, Duration::from_millis(200)))
                .await;
        }
        let started = std::time::Instant::now();
        assert!(gate.evaluate(&query()).await.is_allowed());
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_timeout_fails_closed() {
        let gate = PolicyGate::new(Duration::from_millis(30));
        gate.add_plugin(Fixed::new("slow", PolicyVerdict::Allow, Duration::from_secs(5)))
            .await;
        match gate.evaluate(&query()).await {
            PolicyDecision::Deny { plugin, reason, .. } => {
                assert_eq!(plugin, "slow");
                assert!(reason.contains("did not respond"), "{}", reason);
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plugin_failure_fails_closed() {
        let gate = PolicyGate::new(Duration::from_secs(1));
        gate.add_plugin(Arc::new(Broken)).await;
        assert!(!gate.evaluate(&query()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_remove_plugin() {
        let gate = PolicyGate::new(Duration::from_secs(1));
        gate.add_plugin(Arc::new(Broken)).await;
        assert!(gate.remove_plugin("broken").await);
        assert!(!gate.remove_plugin("broken").await);
        assert!(gate.plugin_names().await.is_empty());
        assert!(gate.evaluate(&query()).await.is_allowed());
    }
}
