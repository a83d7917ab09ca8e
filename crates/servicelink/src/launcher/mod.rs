//! Starting and stopping workers.
//!
//! One capability interface, [`ServiceLauncher`], with two variants:
//! - **LocalProcessLauncher**: spawns the entrypoint as a child process and
//!   keeps a pid record so a restarted host can find it again
//! - **PlatformServiceLauncher**: hands the work to an opaque OS service API
//!
//! The variant is picked once, by [`select_launcher`].

mod pid_record;
mod platform;
mod process;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use pid_record::{PidRecord, probe_alive};
pub use platform::{PlatformServiceApi, PlatformServiceLauncher};
pub use process::LocalProcessLauncher;

/// Option naming the program used to run the entrypoint (e.g. `python3`).
pub const INTERPRETER_OPTION: &str = "interpreter";

/// Set by managed mobile runtimes; selects the platform service variant.
pub const MANAGED_RUNTIME_ENV: &str = "ANDROID_ARGUMENT";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write pid record {}: {source}", path.display())]
    PidRecord {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pid record {} is unreadable: {reason}", path.display())]
    CorruptPidRecord { path: PathBuf, reason: String },
    #[error("working directory unavailable: {0}")]
    WorkingDir(#[source] io::Error),
    #[error("platform service error: {0}")]
    Platform(String),
}

/// What to launch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    entrypoint: PathBuf,
    options: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, entrypoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            entrypoint: entrypoint.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entrypoint(&self) -> &Path {
        &self.entrypoint
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Start, stop and liveness-check one worker.
///
/// `start` is idempotent: with a worker already known it does nothing, so a
/// UI toggle may call it repeatedly. `stop` means "forget this service": it
/// always clears local state, even when termination fails.
pub trait ServiceLauncher: Send {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Launch the worker, handing it `arg` as its startup argument.
    fn start(&mut self, arg: &str) -> Result<(), LaunchError>;

    fn stop(&mut self);

    /// Best-effort; variants without a reliable liveness query may always say `false`.
    fn is_running(&self) -> bool;

    fn pid(&self) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Desktop,
    Managed,
}

impl RuntimeEnvironment {
    pub fn detect() -> Self {
        if std::env::var_os(MANAGED_RUNTIME_ENV).is_some() {
            Self::Managed
        } else {
            Self::Desktop
        }
    }
}

/// Pick the launcher variant for the current runtime environment.
pub fn select_launcher(
    descriptor: ServiceDescriptor,
    platform: Option<Arc<dyn PlatformServiceApi>>,
) -> Result<Box<dyn ServiceLauncher>, LaunchError> {
    select_for(RuntimeEnvironment::detect(), descriptor, platform)
}

fn select_for(
    environment: RuntimeEnvironment,
    descriptor: ServiceDescriptor,
    platform: Option<Arc<dyn PlatformServiceApi>>,
) -> Result<Box<dyn ServiceLauncher>, LaunchError> {
    match (environment, platform) {
        (RuntimeEnvironment::Managed, Some(api)) => {
            tracing::debug!(service = descriptor.name(), "Using platform service launcher");
            Ok(Box::new(PlatformServiceLauncher::new(descriptor, api)))
        }
        (RuntimeEnvironment::Managed, None) => {
            tracing::warn!(
                service = descriptor.name(),
                "Managed runtime without a platform service API, falling back to local process"
            );
            Ok(Box::new(LocalProcessLauncher::new(descriptor)?))
        }
        (RuntimeEnvironment::Desktop, _) => {
            tracing::debug!(service = descriptor.name(), "Using local process launcher");
            Ok(Box::new(LocalProcessLauncher::new(descriptor)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
    }

    impl PlatformServiceApi for RecordingApi {
        fn package_name(&self) -> String {
            "org.example.app".to_string()
        }

        fn start_service(&self, service_class: &str, arg: &str) -> Result<(), LaunchError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {service_class} {arg}"));
            Ok(())
        }

        fn stop_service(&self, service_class: &str) -> Result<(), LaunchError> {
            self.calls.lock().unwrap().push(format!("stop {service_class}"));
            Ok(())
        }
    }

    #[test]
    fn descriptor_options() {
        let descriptor = ServiceDescriptor::new("s1", "service_1.py")
            .with_option(INTERPRETER_OPTION, "python3");
        assert_eq!(descriptor.name(), "s1");
        assert_eq!(descriptor.entrypoint(), Path::new("service_1.py"));
        assert_eq!(descriptor.option(INTERPRETER_OPTION), Some("python3"));
        assert_eq!(descriptor.option("missing"), None);
    }

    #[test]
    fn managed_environment_with_api_uses_platform_service() {
        let api = Arc::new(RecordingApi::default());
        let mut launcher = select_for(
            RuntimeEnvironment::Managed,
            ServiceDescriptor::new("s1", "service_1.py"),
            Some(api.clone()),
        )
        .unwrap();

        launcher.start("tcp://127.0.0.1:4000").unwrap();
        assert!(!launcher.is_running());
        launcher.stop();

        assert_eq!(
            *api.calls.lock().unwrap(),
            vec![
                "start org.example.app.ServiceS1 tcp://127.0.0.1:4000",
                "stop org.example.app.ServiceS1",
            ]
        );
    }

    #[test]
    fn desktop_environment_ignores_platform_api() {
        let launcher = select_for(
            RuntimeEnvironment::Desktop,
            ServiceDescriptor::new("s1", "servicelink_never_started.sh"),
            Some(Arc::new(RecordingApi::default())),
        )
        .unwrap();
        assert!(!launcher.is_running());
        assert_eq!(launcher.pid(), None);
    }
}
