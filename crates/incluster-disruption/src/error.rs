//! Error types for the disruption probe lifecycle.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while driving the probe lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Watch stream error
    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// A static manifest failed to parse
    #[error("Invalid manifest {name}: {source}")]
    Manifest {
        name: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cluster reported an unusable API URL
    #[error("Invalid internal API URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A provisioning step failed
    #[error("error {step}: {source}")]
    Provision {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A deployment never reported a ready replica
    #[error("deployment {deployment} didn't roll out within {}s", timeout.as_secs())]
    RolloutTimeout {
        deployment: String,
        timeout: Duration,
    },

    /// The deployment watch ended before the deployment became ready
    #[error("deployment {deployment} watch ended: {reason}")]
    RolloutStream { deployment: String, reason: String },

    /// The ambient cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Intervals could not be read from one probe pod
    #[error("failed to collect intervals from pod {pod}: {source}")]
    PodCollection {
        pod: String,
        #[source]
        source: Box<Error>,
    },

    /// A teardown delete failed for a reason other than "not found"
    #[error("error removing {kind} {name}: {source}")]
    Teardown {
        kind: &'static str,
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No nodes to place probes on
    #[error("{}", no_nodes_message(.selector))]
    NoMatchingNodes { selector: Option<String> },

    /// The cluster reported something the probes cannot be sized for
    #[error("unexpected cluster state: {0}")]
    Cluster(String),

    /// Collection was requested before the probes were started
    #[error("probes were not started: {0}")]
    NotStarted(String),

    /// Start was requested twice on the same lifecycle instance
    #[error("probes already started in namespace {0}")]
    AlreadyStarted(String),

    /// Several independent operations failed
    #[error("{0}")]
    Aggregate(AggregateError),
}

fn no_nodes_message(selector: &Option<String>) -> String {
    match selector {
        Some(selector) => format!("no nodes match selector {selector}"),
        None => "cluster has no nodes".to_string(),
    }
}

impl Error {
    /// Wrap an error with the provisioning step it came from.
    pub(crate) fn provision(step: &'static str, source: Error) -> Self {
        Self::Provision {
            step,
            source: Box::new(source),
        }
    }

    /// Returns the Kubernetes API status code, looking through wrappers.
    #[must_use]
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            Self::Provision { source, .. }
            | Self::PodCollection { source, .. }
            | Self::Teardown { source, .. } => source.api_code(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Returns true if this error (or the step it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Provision { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// A list of errors reported together.
///
/// Rendered as `[first, second]`, or just the message when there is only one.
#[derive(Debug)]
pub struct AggregateError(Vec<Error>);

impl AggregateError {
    /// Collapse a list of errors; `None` when the list is empty.
    #[must_use]
    pub fn from_errors(errors: Vec<Error>) -> Option<Error> {
        if errors.is_empty() {
            None
        } else {
            Some(Error::Aggregate(Self(errors)))
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.0.as_slice() {
            return write!(f, "{only}");
        }
        write!(f, "[")?;
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{error}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (simulated)"),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(500, "InternalError").is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }

    #[test]
    fn provision_wrapper_keeps_classification() {
        let wrapped = Error::provision("creating namespace", api_error(409, "AlreadyExists"));
        assert!(wrapped.is_already_exists());
        assert!(wrapped.to_string().starts_with("error creating namespace:"));

        let cancelled = Error::provision("waiting for rollout", Error::Cancelled);
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn missing_nodes_are_reported_as_cluster_state() {
        let none = Error::NoMatchingNodes { selector: None };
        assert_eq!(none.to_string(), "cluster has no nodes");

        let control_plane = Error::NoMatchingNodes {
            selector: Some("node-role.kubernetes.io/master=".to_string()),
        };
        assert_eq!(
            control_plane.to_string(),
            "no nodes match selector node-role.kubernetes.io/master="
        );
    }

    #[test]
    fn aggregate_formats_like_a_list() {
        assert!(AggregateError::from_errors(Vec::new()).is_none());

        let single = AggregateError::from_errors(vec![Error::Cancelled]).unwrap();
        assert_eq!(single.to_string(), "operation cancelled");

        let many = AggregateError::from_errors(vec![
            Error::Config("a".into()),
            Error::Config("b".into()),
        ])
        .unwrap();
        assert_eq!(
            many.to_string(),
            "[Configuration error: a, Configuration error: b]"
        );
    }
}
