//! Scripted fakes shared by the dispatch integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chandispatch::{
    interfaces, properties, props, values, ApprovalRequest, Channel, ChannelFilter, Client,
    ClientRole, DispatchEvent, HandleRequest, ObserveRequest, PolicyPlugin, PolicyQuery,
    PolicyVerdict, Properties, PropertyValue, RemovalReason,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCOUNT: &str = "/account/fakecm/fakeprotocol/someguy";
pub const CONNECTION: &str = "/conn/fakecm/fakeprotocol/someguy";

pub fn text_filter() -> ChannelFilter {
    ChannelFilter::any()
        .with(props::CHANNEL_TYPE, values::CHANNEL_TYPE_TEXT)
        .with(props::TARGET_HANDLE_TYPE, values::HANDLE_TYPE_CONTACT)
}

pub struct FakeChannel {
    path: String,
    properties: Properties,
    closed: AtomicBool,
    removals: Mutex<Vec<(String, RemovalReason)>>,
}

impl FakeChannel {
    /// A text channel to `target`; group channels also carry the group interface
    pub fn text(path: &str, target: &str, group: bool) -> Arc<Self> {
        Self::contact(path, target, group, false)
    }

    /// A text channel the local user asked for
    pub fn requested(path: &str, target: &str) -> Arc<Self> {
        Self::contact(path, target, false, true)
    }

    fn contact(path: &str, target: &str, group: bool, requested: bool) -> Arc<Self> {
        let mut ifaces = vec![interfaces::DESTROYABLE.to_string()];
        if group {
            ifaces.push(interfaces::GROUP.to_string());
        }
        Arc::new(Self {
            path: path.to_string(),
            properties: properties([
                (props::CHANNEL_TYPE, PropertyValue::from(values::CHANNEL_TYPE_TEXT)),
                (props::TARGET_HANDLE_TYPE, PropertyValue::UInt(values::HANDLE_TYPE_CONTACT)),
                (props::TARGET_ID, PropertyValue::from(target)),
                (props::REQUESTED, PropertyValue::Bool(requested)),
                (props::INTERFACES, PropertyValue::StringList(ifaces)),
            ]),
            closed: AtomicBool::new(false),
            removals: Mutex::new(Vec::new()),
        })
    }

    pub fn with_type(path: &str, channel_type: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            properties: properties([(props::CHANNEL_TYPE, PropertyValue::from(channel_type))]),
            closed: AtomicBool::new(false),
            removals: Mutex::new(Vec::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> Vec<(String, RemovalReason)> {
        self.removals.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn path(&self) -> &str {
        &self.path
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    async fn remove_self(&self, message: &str, reason: RemovalReason) -> anyhow::Result<()> {
        self.removals.lock().unwrap().push((message.to_string(), reason));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// How a scripted client answers one kind of call
#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Ack,
    Fail,
    Hang,
    After(Duration),
    /// Close the channel underneath the operation, then acknowledge
    Vanish,
}

impl Reply {
    async fn answer(self, what: &str) -> anyhow::Result<()> {
        match self {
            Reply::Ack => Ok(()),
            Reply::Fail => anyhow::bail!("{} refused", what),
            Reply::Hang => std::future::pending().await,
            Reply::Vanish => Ok(()),
            Reply::After(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Every call made to any scripted client, in arrival order
pub type CallLog = Arc<Mutex<Vec<(String, ClientRole)>>>;

pub struct ScriptedClient {
    name: String,
    observe: Reply,
    approve: Reply,
    handle: Reply,
    log: CallLog,
    approvals: Mutex<Vec<ApprovalRequest>>,
    handled: Mutex<Vec<HandleRequest>>,
}

impl ScriptedClient {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            observe: Reply::Ack,
            approve: Reply::Ack,
            handle: Reply::Ack,
            log: log.clone(),
            approvals: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
        }
    }

    pub fn observe(mut self, reply: Reply) -> Self {
        self.observe = reply;
        self
    }

    pub fn approve(mut self, reply: Reply) -> Self {
        self.approve = reply;
        self
    }

    pub fn handle(mut self, reply: Reply) -> Self {
        self.handle = reply;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn record(&self, role: ClientRole) {
        self.log.lock().unwrap().push((self.name.clone(), role));
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }

    /// Wait until the dispatcher has offered us an operation
    pub async fn next_approval(&self) -> ApprovalRequest {
        for _ in 0..400 {
            if let Some(request) = self.approvals.lock().unwrap().first().cloned() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} was never asked to approve", self.name);
    }
}

#[async_trait]
impl Client for ScriptedClient {
    async fn observe_channels(&self, request: ObserveRequest) -> anyhow::Result<()> {
        self.record(ClientRole::Observe);
        if let Reply::Vanish = self.observe {
            request.operation.cancel();
        }
        self.observe.answer("ObserveChannels").await
    }

    async fn add_dispatch_operation(&self, request: ApprovalRequest) -> anyhow::Result<()> {
        self.record(ClientRole::Approve);
        self.approvals.lock().unwrap().push(request);
        self.approve.answer("AddDispatchOperation").await
    }

    async fn handle_channels(&self, request: HandleRequest) -> anyhow::Result<()> {
        self.record(ClientRole::Handle);
        self.handled.lock().unwrap().push(request);
        self.handle.answer("HandleChannels").await
    }
}

/// Denies every channel whose target is on a deny list
pub struct TargetPolicy {
    denied: Vec<String>,
    reason: String,
}

impl TargetPolicy {
    pub fn new(denied: &[&str], reason: &str) -> Arc<Self> {
        Arc::new(Self {
            denied: denied.iter().map(|s| s.to_string()).collect(),
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl PolicyPlugin for TargetPolicy {
    fn name(&self) -> &str {
        "target-policy"
    }

    async fn check(&self, query: &PolicyQuery) -> anyhow::Result<PolicyVerdict> {
        let target = query
            .properties
            .get(props::TARGET_ID)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if self.denied.iter().any(|d| d == target) {
            Ok(PolicyVerdict::deny(self.reason.clone()))
        } else {
            Ok(PolicyVerdict::Allow)
        }
    }
}

/// Never answers
pub struct SilentPolicy;

#[async_trait]
impl PolicyPlugin for SilentPolicy {
    fn name(&self) -> &str {
        "silent"
    }

    async fn check(&self, _query: &PolicyQuery) -> anyhow::Result<PolicyVerdict> {
        std::future::pending().await
    }
}

/// Collect notifications until `count` have arrived
pub async fn next_events(
    events: &mut async_broadcast::Receiver<DispatchEvent>,
    count: usize,
) -> Vec<DispatchEvent> {
    let mut seen = Vec::with_capacity(count);
    while seen.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a dispatch notification")
            .expect("notification channel closed");
        seen.push(event);
    }
    seen
}

pub fn calls(log: &CallLog) -> Vec<(String, ClientRole)> {
    log.lock().unwrap().clone()
}
