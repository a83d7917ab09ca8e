//! In-process launchers for exercising the listener without spawning processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::bridge::protocol::Message;
use crate::config::ChannelConfig;
use crate::launcher::{LaunchError, ServiceDescriptor, ServiceLauncher};
use crate::runtime::{ChildRuntime, ChildSession};

/// Worker that echoes `ECHO` back to the host.
pub(crate) fn echo_runtime() -> ChildRuntime {
    ChildRuntime::new()
        .with_config(ChannelConfig::new())
        .on("ECHO", |session: &mut ChildSession, msg: &Message| {
            Ok(session.send("ECHO", msg.args.clone())?)
        })
}

/// Runs a [`ChildRuntime`] on a thread instead of a child process.
pub(crate) struct ThreadLauncher {
    descriptor: ServiceDescriptor,
    factory: fn() -> ChildRuntime,
    worker: Option<JoinHandle<()>>,
    launches: Arc<AtomicUsize>,
}

impl ThreadLauncher {
    pub(crate) fn new(factory: fn() -> ChildRuntime) -> Self {
        Self {
            descriptor: ServiceDescriptor::new("thread", "in-process"),
            factory,
            worker: None,
            launches: Arc::default(),
        }
    }

    pub(crate) fn launch_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.launches)
    }
}

impl ServiceLauncher for ThreadLauncher {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn start(&mut self, arg: &str) -> Result<(), LaunchError> {
        if self.is_running() {
            return Ok(());
        }
        let runtime = (self.factory)();
        let arg = arg.to_string();
        self.launches.fetch_add(1, Ordering::AcqRel);
        self.worker = Some(thread::spawn(move || {
            if let Err(e) = runtime.run_with_argument(&arg) {
                tracing::error!(error = %e, "In-process worker failed");
            }
        }));
        Ok(())
    }

    // Threads cannot be killed; the worker is detached and forgotten.
    fn stop(&mut self) {
        self.worker = None;
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

/// Accepts `start` and never runs anything.
pub(crate) struct SilentLauncher {
    descriptor: ServiceDescriptor,
    started: bool,
}

impl SilentLauncher {
    pub(crate) fn new() -> Self {
        Self {
            descriptor: ServiceDescriptor::new("silent", "nothing"),
            started: false,
        }
    }
}

impl ServiceLauncher for SilentLauncher {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn start(&mut self, _arg: &str) -> Result<(), LaunchError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn is_running(&self) -> bool {
        self.started
    }
}
