use thiserror::Error;

/// Unified error type for the dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A policy plugin did not answer within the configured wait
    #[error("Policy plugin {plugin} did not respond (timeout: {timeout_ms}ms)")]
    PolicyTimeout { plugin: String, timeout_ms: u64 },

    /// No registered handler accepts the channel
    #[error("No handler matches channel {channel}")]
    NoMatchingHandler { channel: String },

    /// A handler refused or failed HandleChannels
    #[error("Handler {handler} rejected the channel: {message}")]
    HandlerRejected { handler: String, message: String },

    /// Every candidate handler failed
    #[error("All handlers failed for {operation}: tried [{}]", .tried.join(", "))]
    AllHandlersExhausted { operation: String, tried: Vec<String> },

    /// The operation has finished; its entry points are permanently invalid
    #[error("Operation {operation} is no longer active")]
    StaleOperation { operation: String },

    /// The operation is live but cannot accept this call (lost race, wrong phase)
    #[error("Operation {operation} is no longer available: {message}")]
    NotAvailable { operation: String, message: String },

    /// The channel was closed underneath the operation
    #[error("Channel {channel} vanished")]
    ChannelVanished { channel: String },

    /// A second operation was requested for a channel that already has one
    #[error("Channel {channel} is already being dispatched by {operation}")]
    AlreadyDispatching { channel: String, operation: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unknown client: {name}")]
    UnknownClient { name: String },

    /// A call into an external party (client, plugin, channel) failed
    #[error("Call {call} on {party} failed: {message}")]
    Client {
        party: String,
        call: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    pub fn policy_timeout<S: Into<String>>(plugin: S, timeout_ms: u64) -> Self {
        Self::PolicyTimeout {
            plugin: plugin.into(),
            timeout_ms,
        }
    }

    pub fn no_matching_handler<S: Into<String>>(channel: S) -> Self {
        Self::NoMatchingHandler {
            channel: channel.into(),
        }
    }

    pub fn handler_rejected<S: Into<String>, M: Into<String>>(handler: S, message: M) -> Self {
        Self::HandlerRejected {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn handlers_exhausted<S: Into<String>>(operation: S, tried: Vec<String>) -> Self {
        Self::AllHandlersExhausted {
            operation: operation.into(),
            tried,
        }
    }

    pub fn stale<S: Into<String>>(operation: S) -> Self {
        Self::StaleOperation {
            operation: operation.into(),
        }
    }

    pub fn not_available<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::NotAvailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn vanished<S: Into<String>>(channel: S) -> Self {
        Self::ChannelVanished {
            channel: channel.into(),
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unknown_client<S: Into<String>>(name: S) -> Self {
        Self::UnknownClient { name: name.into() }
    }

    /// Wrap a failure reported by an external party
    pub fn client<P: Into<String>, C: Into<String>>(party: P, call: C, err: &anyhow::Error) -> Self {
        Self::Client {
            party: party.into(),
            call: call.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failure is absorbed inside a single operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PolicyTimeout { .. } | Self::HandlerRejected { .. } | Self::Client { .. }
        )
    }

    /// True for every error a finished or lost-race operation hands back
    pub fn is_no_longer_active(&self) -> bool {
        matches!(self, Self::StaleOperation { .. } | Self::NotAvailable { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::PolicyTimeout { .. } => "policy_timeout",
            Self::NoMatchingHandler { .. } => "no_matching_handler",
            Self::HandlerRejected { .. } => "handler_rejected",
            Self::AllHandlersExhausted { .. } => "handlers_exhausted",
            Self::StaleOperation { .. } => "stale_operation",
            Self::NotAvailable { .. } => "not_available",
            Self::ChannelVanished { .. } => "channel_vanished",
            Self::AlreadyDispatching { .. } => "already_dispatching",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::UnknownClient { .. } => "unknown_client",
            Self::Client { .. } => "client",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DispatchError>;

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for DispatchError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
