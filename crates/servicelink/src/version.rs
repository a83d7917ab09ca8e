//! Version information for servicelink.

use crate::bridge::codec::PAYLOAD_VERSION;

/// servicelink version from Cargo.toml
pub const SERVICELINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library and wire-format versions, reported by the demo binaries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub servicelink: &'static str,
    /// Payload format version written by the codec.
    pub protocol: u8,
    /// Embedding application's own version, if it reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            servicelink: SERVICELINK_VERSION,
            protocol: PAYLOAD_VERSION,
            application: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, version: impl Into<String>) -> Self {
        self.application = Some(version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_and_protocol_version() {
        let info = VersionInfo::new();
        assert_eq!(info.servicelink, SERVICELINK_VERSION);
        assert_eq!(info.protocol, PAYLOAD_VERSION);
        assert!(info.application.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            servicelink: "0.1.0",
            protocol: 1,
            application: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "servicelink": "0.1.0",
          "protocol": 1
        }
        "#);
    }

    #[test]
    fn version_info_serializes_application() {
        let info = VersionInfo {
            servicelink: "0.1.0",
            protocol: 1,
            application: None,
        }
        .with_application("2.3.0");
        insta::assert_json_snapshot!(info, @r#"
        {
          "servicelink": "0.1.0",
          "protocol": 1,
          "application": "2.3.0"
        }
        "#);
    }
}
