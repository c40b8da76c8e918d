//! Channel dispatch
//!
//! Incoming channels pass a policy gate, are shown to observers, offered to
//! approvers and finally handed to exactly one handler.

pub mod types;
pub mod filter;
pub mod channel;
pub mod clients;
pub mod policy;
pub mod operation;
pub mod registry;
pub mod hooks;
pub mod coordinator;

pub use types::*;
pub use filter::*;
pub use channel::*;
pub use clients::*;
pub use policy::*;
pub use operation::*;
pub use registry::*;
pub use hooks::*;
pub use coordinator::*;
