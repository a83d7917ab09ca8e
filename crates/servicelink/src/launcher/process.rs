//! Workers run as local child processes.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use super::pid_record::{PidRecord, probe_alive};
use super::{INTERPRETER_OPTION, LaunchError, ServiceDescriptor, ServiceLauncher};
use crate::bridge::transport::SERVICE_ARGUMENT_ENV;

/// Spawns the entrypoint and remembers it through a pid record, so a host
/// that restarts can adopt a worker left running by its previous life.
#[derive(Debug)]
pub struct LocalProcessLauncher {
    descriptor: ServiceDescriptor,
    entrypoint_dir: PathBuf,
    record: PidRecord,
    child: Option<Child>,
    pid: Option<u32>,
}

impl LocalProcessLauncher {
    /// Entrypoint resolved against the current working directory.
    pub fn new(descriptor: ServiceDescriptor) -> Result<Self, LaunchError> {
        let dir = std::env::current_dir().map_err(LaunchError::WorkingDir)?;
        Ok(Self::with_dir(descriptor, dir))
    }

    pub fn with_dir(descriptor: ServiceDescriptor, dir: impl Into<PathBuf>) -> Self {
        let entrypoint_dir = dir.into();
        let record = PidRecord::for_entrypoint(&entrypoint_dir, descriptor.entrypoint());
        let mut launcher = Self {
            descriptor,
            entrypoint_dir,
            record,
            child: None,
            pid: None,
        };
        launcher.recover();
        launcher
    }

    pub fn entrypoint_dir(&self) -> &Path {
        &self.entrypoint_dir
    }

    pub fn pid_record(&self) -> &PidRecord {
        &self.record
    }

    fn recover(&mut self) {
        let service = self.descriptor.name();
        match self.record.read() {
            Ok(None) => {}
            Ok(Some(pid)) if probe_alive(pid) => {
                tracing::info!(service, pid, "Service is already running");
                self.pid = Some(pid);
            }
            Ok(Some(pid)) => {
                tracing::info!(service, pid, "Service was gone, removing pid record");
                self.record.remove();
            }
            Err(e) => {
                tracing::warn!(service, error = %e, "Discarding pid record");
                self.record.remove();
            }
        }
    }

    fn command(&self) -> Command {
        let entrypoint = self.entrypoint_dir.join(self.descriptor.entrypoint());
        let mut command = match self.descriptor.option(INTERPRETER_OPTION) {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(entrypoint);
                command
            }
            None => Command::new(entrypoint),
        };
        command.current_dir(&self.entrypoint_dir);
        command
    }
}

impl ServiceLauncher for LocalProcessLauncher {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn start(&mut self, arg: &str) -> Result<(), LaunchError> {
        if let Some(pid) = self.pid {
            tracing::debug!(service = self.descriptor.name(), pid, "Start ignored, already running");
            return Ok(());
        }

        let child = self
            .command()
            .env(SERVICE_ARGUMENT_ENV, arg)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: self.descriptor.entrypoint().to_path_buf(),
                source,
            })?;
        let pid = child.id();
        self.pid = Some(pid);
        self.child = Some(child);
        tracing::info!(service = self.descriptor.name(), pid, "Spawned service process");

        self.record.write(pid)
    }

    fn stop(&mut self) {
        let service = self.descriptor.name();
        match (self.child.take(), self.pid) {
            (Some(child), _) => terminate_child(service, child),
            (None, Some(pid)) => {
                if let Err(e) = signal_terminate(pid) {
                    tracing::debug!(service, pid, error = %e, "Could not signal recorded pid");
                }
            }
            (None, None) => {}
        }
        self.pid = None;
        self.record.remove();
    }

    fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Ask an owned child to exit and reap it off the caller's thread.
fn terminate_child(service: &str, mut child: Child) {
    let pid = child.id();
    #[cfg(unix)]
    let result = signal_terminate(pid);
    #[cfg(not(unix))]
    let result = child.kill();
    if let Err(e) = result {
        tracing::debug!(service, pid, error = %e, "Terminate failed");
    }

    let spawned = std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => tracing::debug!(pid, %status, "Service process exited"),
            Err(e) => tracing::debug!(pid, error = %e, "Failed to reap service process"),
        });
    if let Err(e) = spawned {
        tracing::warn!(service, pid, error = %e, "Failed to spawn reaper thread");
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
    if raw == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no signal delivery on this platform",
    ))
}
