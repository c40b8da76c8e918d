use crate::core::errors::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded waits and buffer sizes for the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long a single policy plugin may take to answer
    pub policy_timeout: Duration,
    /// How long the observation sub-phase waits for all observers
    pub observer_timeout: Duration,
    /// How long an approver may take to acknowledge AddDispatchOperation
    pub approver_timeout: Duration,
    /// How long a handler may take to answer HandleChannels
    pub handler_timeout: Duration,
    /// Buffer size of the created/finished notification stream
    pub notification_capacity: usize,
    /// Skip approvers when the preferred handler has bypass-approval set
    pub skip_approval_for_bypass_handlers: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            policy_timeout: Duration::from_secs(25),
            observer_timeout: Duration::from_secs(5),
            approver_timeout: Duration::from_secs(25),
            handler_timeout: Duration::from_secs(25),
            notification_capacity: 256,
            skip_approval_for_bypass_handlers: true,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        let waits = [
            ("policy_timeout", self.policy_timeout),
            ("observer_timeout", self.observer_timeout),
            ("approver_timeout", self.approver_timeout),
            ("handler_timeout", self.handler_timeout),
        ];
        for (field, wait) in waits {
            if wait.is_zero() {
                return Err(DispatchError::configuration_field(
                    format!("{} must be greater than 0", field),
                    field,
                ));
            }
        }
        if self.notification_capacity == 0 {
            return Err(DispatchError::configuration_field(
                "notification_capacity must be greater than 0",
                "notification_capacity",
            ));
        }
        Ok(())
    }

    /// Short waits for tests and local tooling
    pub fn quick() -> Self {
        Self {
            policy_timeout: Duration::from_millis(500),
            observer_timeout: Duration::from_millis(250),
            approver_timeout: Duration::from_millis(250),
            handler_timeout: Duration::from_millis(250),
            notification_capacity: 64,
            skip_approval_for_bypass_handlers: true,
        }
    }

    pub fn with_policy_timeout(mut self, timeout: Duration) -> Self {
        self.policy_timeout = timeout;
        self
    }

    pub fn with_observer_timeout(mut self, timeout: Duration) -> Self {
        self.observer_timeout = timeout;
        self
    }

    pub fn with_approver_timeout(mut self, timeout: Duration) -> Self {
        self.approver_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_bypass_skip(mut self, enabled: bool) -> Self {
        self.skip_approval_for_bypass_handlers = enabled;
        self
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}
