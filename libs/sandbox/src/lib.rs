//! Sandbox providers for the relay: provisioning, lifecycle, and the
//! line-delimited JSON channel to the agent process inside each sandbox.

pub mod channel;
pub mod container;
pub mod manager;
pub mod microvm;
pub mod mock;
pub mod provider;

mod proc_io;

pub use channel::{AgentChannel, ChannelEvent, ChannelHub, ChannelSender, CloseReason};
pub use manager::{ProviderHealth, SandboxManager};
pub use provider::{
    CleanupReport, SandboxError, SandboxHandle, SandboxInfo, SandboxProvider, SandboxSpec,
};
