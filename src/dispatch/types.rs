//! Core types shared by the dispatcher components
//!
//! Channels are described by an immutable property map; everything the
//! dispatcher reports about an operation is a plain serialisable value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known channel property names
pub mod props {
    pub const CHANNEL_TYPE: &str = "Channel.ChannelType";
    pub const TARGET_HANDLE_TYPE: &str = "Channel.TargetHandleType";
    pub const TARGET_HANDLE: &str = "Channel.TargetHandle";
    pub const TARGET_ID: &str = "Channel.TargetID";
    pub const INITIATOR_HANDLE: &str = "Channel.InitiatorHandle";
    pub const INITIATOR_ID: &str = "Channel.InitiatorID";
    pub const REQUESTED: &str = "Channel.Requested";
    pub const INTERFACES: &str = "Channel.Interfaces";
}

/// Well-known channel interface names
pub mod interfaces {
    pub const GROUP: &str = "Channel.Interface.Group";
    pub const DESTROYABLE: &str = "Channel.Interface.Destroyable";
}

/// Capabilities a dispatch operation can expose to approvers
pub mod capabilities {
    pub const CLAIM: &str = "Claim";
    pub const HANDLE_WITH: &str = "HandleWith";
}

/// Well-known values for channel type and target handle type
pub mod values {
    pub const CHANNEL_TYPE_TEXT: &str = "Channel.Type.Text";
    pub const CHANNEL_TYPE_CALL: &str = "Channel.Type.Call";
    pub const HANDLE_TYPE_NONE: u64 = 0;
    pub const HANDLE_TYPE_CONTACT: u64 = 1;
    pub const HANDLE_TYPE_ROOM: u64 = 2;
}

/// A single channel property value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    StringList(Vec<String>),
    String(String),
    /// Serialised as a plain string; configuration files cannot express it
    #[serde(skip_deserializing)]
    ObjectPath(String),
}

impl PropertyValue {
    pub fn object_path(path: impl Into<String>) -> Self {
        Self::ObjectPath(path.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(l) => Some(l),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i128> {
        match self {
            Self::UInt(u) => Some(*u as i128),
            Self::Int(i) => Some(*i as i128),
            _ => None,
        }
    }

    /// Whether this channel value satisfies `filter`.
    ///
    /// Kinds must agree, except that the two integer kinds compare by value.
    pub fn satisfies(&self, filter: &PropertyValue) -> bool {
        match (self, filter) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::ObjectPath(a), Self::ObjectPath(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::StringList(a), Self::StringList(b)) => a == b,
            _ => match (self.as_integer(), filter.as_integer()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::UInt(value as u64)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

/// Immutable channel properties, keyed by property name
pub type Properties = BTreeMap<String, PropertyValue>;

/// Build a property map from `(name, value)` pairs
pub fn properties<I, K, V>(pairs: I) -> Properties
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropertyValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Roles a client can take for a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    Observe,
    Approve,
    Handle,
}

impl ClientRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "observe",
            Self::Approve => "approve",
            Self::Handle => "handle",
        }
    }
}

/// Identity of a dispatch operation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(format!("cdo_{}", cuid2::create_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Machine-readable reason for removing the local member from a group channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    None,
    Offline,
    Kicked,
    Busy,
    Invited,
    Banned,
    Error,
    InvalidContact,
    NoAnswer,
    Renamed,
    PermissionDenied,
    Separated,
}

impl RemovalReason {
    /// Wire code of the reason
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Offline => 1,
            Self::Kicked => 2,
            Self::Busy => 3,
            Self::Invited => 4,
            Self::Banned => 5,
            Self::Error => 6,
            Self::InvalidContact => 7,
            Self::NoAnswer => 8,
            Self::Renamed => 9,
            Self::PermissionDenied => 10,
            Self::Separated => 11,
        }
    }
}

/// Who committed an operation and how
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Commit {
    /// An approver takes the channel itself
    Claim { by: String },
    /// An approver asks for a handler; `None` lets the dispatcher pick
    HandleWith { handler: Option<String> },
    /// No approver committed; the dispatcher picks the handler
    Automatic,
}

/// Final outcome of a dispatch operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Denied {
        reason: String,
        removal_reason: RemovalReason,
    },
    Claimed {
        by: String,
    },
    Handled {
        by: String,
    },
    Failed {
        reason: String,
        tried: Vec<String>,
    },
    Vanished,
}

impl DispatchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "denied",
            Self::Claimed { .. } => "claimed",
            Self::Handled { .. } => "handled",
            Self::Failed { .. } => "failed",
            Self::Vanished => "vanished",
        }
    }

    /// The client that ended up owning the channel, if any
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Claimed { by } | Self::Handled { by } => Some(by),
            _ => None,
        }
    }
}

/// Sub-phases of the Approving state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalPhase {
    Observation,
    Approval,
}

/// State of a dispatch operation
#[derive(Clone, Debug, PartialEq)]
pub enum OperationState {
    Created,
    PolicyPending,
    Approving(ApprovalPhase),
    /// Committed; the handoff is in progress
    Dispatching(Commit),
    Finished(DispatchOutcome),
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PolicyPending => "policy_pending",
            Self::Approving(ApprovalPhase::Observation) => "observing",
            Self::Approving(ApprovalPhase::Approval) => "approving",
            Self::Dispatching(_) => "dispatching",
            Self::Finished(_) => "finished",
        }
    }
}

/// What external parties see of a live operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub account: String,
    pub connection: String,
    pub channel: String,
    pub possible_handlers: Vec<String>,
    pub interfaces: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Payload of the operation-finished notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinishedOperation {
    pub id: OperationId,
    pub channel: String,
    pub outcome: DispatchOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Lifecycle notifications published by the operation registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    OperationCreated(OperationSummary),
    OperationFinished(FinishedOperation),
}

impl DispatchEvent {
    pub fn id(&self) -> &OperationId {
        match self {
            Self::OperationCreated(summary) => &summary.id,
            Self::OperationFinished(finished) => &finished.id,
        }
    }
}
