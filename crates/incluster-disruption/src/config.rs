//! Probe lifecycle configuration
//!
//! Timeouts, selectors and the optional probe image. Everything has a default,
//! so an empty document (or no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Label selector marking probe pods that record disruption intervals.
pub const POLLER_SELECTOR: &str = "network.openshift.io/disruption-actor=poller";
/// Label selector for control-plane nodes.
pub const CONTROL_PLANE_SELECTOR: &str = "node-role.kubernetes.io/master=";
/// Name of the ConfigMap that tells probes to stop recording.
pub const STOP_SIGNAL_NAME: &str = "stop-collecting";

/// Main probe configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// How long to wait for the first replica of each probe deployment
    #[serde(default = "default_rollout_timeout_seconds")]
    pub rollout_timeout_seconds: u64,

    /// Grace period between writing the stop marker and harvesting
    #[serde(default = "default_collection_grace_seconds")]
    pub collection_grace_seconds: u64,

    /// Maximum number of pods read concurrently during harvest
    #[serde(default = "default_collection_concurrency")]
    pub collection_concurrency: usize,

    /// Node selector used to count control-plane nodes
    #[serde(default = "default_control_plane_selector")]
    pub control_plane_selector: String,

    /// Pod selector used to find probe pods at harvest time
    #[serde(default = "default_poller_selector")]
    pub poller_selector: String,

    /// Name of the stop marker ConfigMap
    #[serde(default = "default_stop_signal_name")]
    pub stop_signal_name: String,

    /// Probe image pull spec, when not supplied on the command line
    #[serde(default)]
    pub image: Option<String>,
}

fn default_rollout_timeout_seconds() -> u64 {
    300
}

fn default_collection_grace_seconds() -> u64 {
    30
}

fn default_collection_concurrency() -> usize {
    8
}

fn default_control_plane_selector() -> String {
    CONTROL_PLANE_SELECTOR.to_string()
}

fn default_poller_selector() -> String {
    POLLER_SELECTOR.to_string()
}

fn default_stop_signal_name() -> String {
    STOP_SIGNAL_NAME.to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            rollout_timeout_seconds: default_rollout_timeout_seconds(),
            collection_grace_seconds: default_collection_grace_seconds(),
            collection_concurrency: default_collection_concurrency(),
            control_plane_selector: default_control_plane_selector(),
            poller_selector: default_poller_selector(),
            stop_signal_name: default_stop_signal_name(),
            image: None,
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_seconds)
    }

    #[must_use]
    pub fn collection_grace(&self) -> Duration {
        Duration::from_secs(self.collection_grace_seconds)
    }

    /// Validate that the configuration can drive a lifecycle.
    pub fn validate(&self) -> Result<()> {
        if self.rollout_timeout_seconds == 0 {
            return Err(Error::Config(
                "rolloutTimeoutSeconds must be greater than zero".to_string(),
            ));
        }
        if self.collection_concurrency == 0 {
            return Err(Error::Config(
                "collectionConcurrency must be greater than zero".to_string(),
            ));
        }
        if self.poller_selector.trim().is_empty() {
            return Err(Error::Config("pollerSelector must not be empty".to_string()));
        }
        if self.control_plane_selector.trim().is_empty() {
            return Err(Error::Config(
                "controlPlaneSelector must not be empty".to_string(),
            ));
        }
        self.control_plane_node_selector()?;
        if self.stop_signal_name.trim().is_empty() {
            return Err(Error::Config("stopSignalName must not be empty".to_string()));
        }
        if let Some(image) = &self.image {
            if image.trim().is_empty() {
                return Err(Error::Config("image must not be blank when set".to_string()));
            }
        }
        Ok(())
    }

    /// `controlPlaneSelector` as a pod `nodeSelector`.
    ///
    /// Only equality terms (`key=value`, `key==value`, `key=`) can be placed
    /// into a `nodeSelector`, so the counted nodes and the schedulable nodes
    /// stay the same set.
    pub fn control_plane_node_selector(&self) -> Result<BTreeMap<String, String>> {
        self.control_plane_selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(|term| {
                let invalid = || {
                    Error::Config(format!(
                        "controlPlaneSelector term {term:?} must be of the form key=value"
                    ))
                };
                if term.contains("!=") {
                    return Err(invalid());
                }
                let (key, value) = term.split_once('=').ok_or_else(invalid)?;
                let value = value.strip_prefix('=').unwrap_or(value);
                if key.trim().is_empty() {
                    return Err(invalid());
                }
                Ok((key.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Load configuration from a mounted YAML file.
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("failed to read {config_path}: {e}")))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProbeConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.rollout_timeout(), Duration::from_secs(300));
        assert_eq!(config.collection_grace(), Duration::from_secs(30));
        assert_eq!(config.poller_selector, POLLER_SELECTOR);
        assert_eq!(config.stop_signal_name, "stop-collecting");
        assert!(config.image.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
rolloutTimeoutSeconds: 120
collectionGraceSeconds: 10
collectionConcurrency: 2
image: "quay.io/openshift/tests:latest"
"#;

        let config = ProbeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rollout_timeout_seconds, 120);
        assert_eq!(config.collection_grace_seconds, 10);
        assert_eq!(config.collection_concurrency, 2);
        assert_eq!(config.control_plane_selector, CONTROL_PLANE_SELECTOR);
        assert_eq!(
            config.image.as_deref(),
            Some("quay.io/openshift/tests:latest")
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = ProbeConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ProbeConfig::default());
    }

    #[test]
    fn validate_rejects_zero_timeouts_and_blank_fields() {
        let mut config = ProbeConfig {
            rollout_timeout_seconds: 0,
            ..ProbeConfig::default()
        };
        assert!(config.validate().is_err());

        config.rollout_timeout_seconds = 300;
        config.collection_concurrency = 0;
        assert!(config.validate().is_err());

        config.collection_concurrency = 4;
        config.image = Some("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn control_plane_selector_becomes_node_selector() {
        let default_terms = ProbeConfig::default().control_plane_node_selector().unwrap();
        assert_eq!(
            default_terms.get("node-role.kubernetes.io/master").map(String::as_str),
            Some("")
        );

        let config = ProbeConfig {
            control_plane_selector: "node-role.kubernetes.io/control-plane=, zone==a".to_string(),
            ..ProbeConfig::default()
        };
        let terms = config.control_plane_node_selector().unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms["node-role.kubernetes.io/control-plane"], "");
        assert_eq!(terms["zone"], "a");
    }

    #[test]
    fn set_based_control_plane_selector_is_rejected() {
        for selector in ["node-role.kubernetes.io/master", "role!=worker", "=x"] {
            let config = ProbeConfig {
                control_plane_selector: selector.to_string(),
                ..ProbeConfig::default()
            };
            assert!(config.validate().is_err(), "{selector}");
        }
    }

    #[test]
    fn from_mounted_file_reports_missing_file() {
        let err = ProbeConfig::from_mounted_file("/nonexistent/probe.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
