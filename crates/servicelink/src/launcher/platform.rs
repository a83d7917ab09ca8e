//! Workers hosted by the OS as background services.

use std::fmt;
use std::sync::Arc;

use super::{LaunchError, ServiceDescriptor, ServiceLauncher};

/// The opaque platform facility that actually runs background services.
pub trait PlatformServiceApi: Send + Sync {
    /// Package the application is installed under.
    fn package_name(&self) -> String;

    fn start_service(&self, service_class: &str, arg: &str) -> Result<(), LaunchError>;

    fn stop_service(&self, service_class: &str) -> Result<(), LaunchError>;
}

pub struct PlatformServiceLauncher {
    descriptor: ServiceDescriptor,
    service_class: String,
    api: Arc<dyn PlatformServiceApi>,
}

impl fmt::Debug for PlatformServiceLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformServiceLauncher")
            .field("descriptor", &self.descriptor)
            .field("service_class", &self.service_class)
            .finish_non_exhaustive()
    }
}

impl PlatformServiceLauncher {
    pub fn new(descriptor: ServiceDescriptor, api: Arc<dyn PlatformServiceApi>) -> Self {
        let service_class = service_class_name(&api.package_name(), descriptor.name());
        Self {
            descriptor,
            service_class,
            api,
        }
    }

    pub fn service_class(&self) -> &str {
        &self.service_class
    }
}

impl ServiceLauncher for PlatformServiceLauncher {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn start(&mut self, arg: &str) -> Result<(), LaunchError> {
        tracing::info!(service_class = %self.service_class, "Starting platform service");
        self.api.start_service(&self.service_class, arg)
    }

    fn stop(&mut self) {
        if let Err(e) = self.api.stop_service(&self.service_class) {
            tracing::warn!(service_class = %self.service_class, error = %e, "Failed to stop platform service");
        }
    }

    /// The platform offers no liveness query.
    fn is_running(&self) -> bool {
        false
    }
}

/// `"{package}.Service{Name}"`: first character upper-cased, the rest lower-cased.
fn service_class_name(package: &str, name: &str) -> String {
    let mut chars = name.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    };
    format!("{package}.Service{capitalized}")
}
