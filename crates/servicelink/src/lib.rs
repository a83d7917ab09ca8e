//! servicelink: launch auxiliary workers and exchange named commands with them
//! over a private loopback channel.
//!
//! The host owns a [`ChannelListener`]; the worker runs a [`ChildRuntime`].

mod config;
mod dispatch;
mod error;
mod listener;
mod runtime;
mod state;
mod task_queue;
mod version;

pub mod bridge;
pub mod launcher;
pub mod logging;

#[cfg(test)]
mod testing;

pub use bridge::protocol::{Message, Value};
pub use bridge::transport::{Endpoint, SERVICE_ARGUMENT_ENV};
pub use config::ChannelConfig;
pub use dispatch::{CommandDispatcher, Dispatched, Handler};
pub use error::ChannelError;
pub use launcher::{
    LaunchError, LocalProcessLauncher, PlatformServiceApi, PlatformServiceLauncher,
    RuntimeEnvironment, ServiceDescriptor, ServiceLauncher, select_launcher,
};
pub use listener::{ChannelListener, DeferredTask, HostDispatcher};
pub use runtime::{ChannelContext, ChildRuntime, ChildSession, RuntimeHandle, WorkerDispatcher};
pub use state::{ChannelFlags, ChannelPhase, ChannelStatus};
pub use task_queue::{TaskQueue, TaskSender};
pub use version::{SERVICELINK_VERSION, VersionInfo};
