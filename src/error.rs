//! Error types for provisioning.
//!
//! Errors are split by where they originate:
//!
//! - [`ConfigError`]: bad configuration or caller input. Always fatal and
//!   raised before any instance exists.
//! - [`RuntimeError`]: the sandbox runtime refused or failed an operation.
//! - [`ProvisionError`]: what a provisioning call returns. Wraps the above
//!   with the phase that failed, and keeps teardown failures next to the
//!   error that caused the teardown.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The registry mirror target is not a usable URL.
    #[error("Invalid registry mirror '{value}': {reason}")]
    InvalidMirror { value: String, reason: String },

    /// An environment variable holds a value that cannot be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// An environment variable could not be read.
    #[error("Failed to read environment: {0}")]
    Env(String),

    /// A launcher needs a configuration file that was not mounted.
    #[error("{service} requires a configuration file mounted at {container_path}")]
    MissingConfigFile {
        service: String,
        container_path: String,
    },

    /// A file scheduled for upload does not exist or cannot be read.
    #[error("Cannot read file '{}': {reason}", path.display())]
    MissingFile { path: PathBuf, reason: String },

    /// A configuration document could not be parsed.
    #[error("Failed to parse '{}': {reason}", path.display())]
    InvalidDocument { path: PathBuf, reason: String },

    /// A proxy configuration declares no inbound the launcher can use.
    #[error("No usable capability: no SOCKS5, HTTP, or TUN inbound found in config")]
    NoUsableCapability,

    /// No observable readiness signal exists for the launch.
    #[error("Cannot determine readiness strategy: {reason}")]
    NoReadinessSignal { reason: String },

    /// The readiness strategy references a port the launch does not expose.
    #[error("Readiness strategy probes {port} which is not an exposed port")]
    InconsistentReadiness { port: String },

    /// The launch specification has no image.
    #[error("Launch specification has no image")]
    EmptyImage,

    /// A port string could not be parsed.
    #[error("Invalid port '{value}': {reason}")]
    InvalidPort { value: String, reason: String },
}

/// Errors reported by a sandbox runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Docker is not available.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Failed to create the container.
    #[error("Failed to create container '{name}': {reason}")]
    ContainerCreationFailed { name: String, reason: String },

    /// Failed to start the container.
    #[error("Failed to start container '{id}': {reason}")]
    ContainerStartFailed { id: String, reason: String },

    /// The runtime has no record of the container.
    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    /// Failed to inspect the container.
    #[error("Failed to inspect container '{id}': {reason}")]
    InspectFailed { id: String, reason: String },

    /// The internal port has no host mapping.
    #[error("Port {port} of container '{id}' is not mapped")]
    PortNotMapped { id: String, port: String },

    /// Failed to copy a file into the container.
    #[error("Failed to copy '{path}' into container '{id}': {reason}")]
    CopyFailed {
        id: String,
        path: String,
        reason: String,
    },

    /// Failed to read container logs.
    #[error("Failed to read logs of container '{id}': {reason}")]
    LogsFailed { id: String, reason: String },

    /// Failed to run a command inside the container.
    #[error("Exec in container '{id}' failed: {reason}")]
    ExecFailed { id: String, reason: String },

    /// Failed to create or remove a network.
    #[error("Network '{name}' operation failed: {reason}")]
    NetworkFailed { name: String, reason: String },

    /// A readiness check could not be set up.
    #[error("Readiness check '{strategy}' could not be set up: {reason}")]
    ProbeSetupFailed { strategy: String, reason: String },

    /// Failed to stop and remove the container.
    #[error("Failed to terminate container '{id}': {reason}")]
    TerminateFailed { id: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provisioning phase, used to say where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Create,
    Start,
    Ready,
    Resolve,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Create => "create",
            Phase::Start => "start",
            Phase::Ready => "ready",
            Phase::Resolve => "resolve",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a provisioning call.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A caller-supplied customization rejected the specification.
    #[error("Customization failed: {reason}")]
    Customization { reason: String },

    /// The runtime failed to create, start or describe the instance.
    #[error("Provisioning failed during {phase}: {source}")]
    Acquisition {
        phase: Phase,
        #[source]
        source: RuntimeError,
    },

    /// The instance started but never satisfied its readiness strategy.
    #[error("{strategy} not satisfied within {timeout:?}{}", format_logs(.logs))]
    ReadinessTimeout {
        strategy: String,
        timeout: Duration,
        logs: Option<String>,
    },

    /// The instance stopped or misbehaved before becoming ready.
    #[error("Instance never became ready: {reason}{}", format_logs(.logs))]
    Readiness {
        reason: String,
        logs: Option<String>,
    },

    /// The caller cancelled the provisioning call.
    #[error("Provisioning cancelled during {phase}")]
    Cancelled { phase: Phase },

    /// Cleanup after an earlier failure also failed.
    #[error("{error} (teardown also failed: {teardown})")]
    Teardown {
        error: Box<ProvisionError>,
        teardown: RuntimeError,
    },
}

impl ProvisionError {
    pub(crate) fn acquisition(phase: Phase, source: RuntimeError) -> Self {
        Self::Acquisition { phase, source }
    }

    pub fn customization(reason: impl Into<String>) -> Self {
        Self::Customization {
            reason: reason.into(),
        }
    }

    /// True if the instance started but never became healthy.
    pub fn is_readiness_failure(&self) -> bool {
        match self {
            Self::ReadinessTimeout { .. } | Self::Readiness { .. } => true,
            Self::Teardown { error, .. } => error.is_readiness_failure(),
            _ => false,
        }
    }

    /// The error that triggered teardown, or `self`.
    pub fn root(&self) -> &ProvisionError {
        match self {
            Self::Teardown { error, .. } => error.root(),
            other => other,
        }
    }
}

fn format_logs(logs: &Option<String>) -> String {
    match logs {
        Some(logs) if !logs.is_empty() => format!("\nContainer logs:\n{logs}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Create.to_string(), "create");
        assert_eq!(Phase::Resolve.as_str(), "resolve");
    }

    #[test]
    fn test_teardown_keeps_both_errors_visible() {
        let err = ProvisionError::Teardown {
            error: Box::new(ProvisionError::ReadinessTimeout {
                strategy: "listening port 5432/tcp".to_string(),
                timeout: Duration::from_secs(1),
                logs: None,
            }),
            teardown: RuntimeError::TerminateFailed {
                id: "abc".to_string(),
                reason: "daemon gone".to_string(),
            },
        };

        let text = err.to_string();
        assert!(text.contains("listening port 5432/tcp"));
        assert!(text.contains("daemon gone"));
        assert!(err.is_readiness_failure());
        assert!(matches!(
            err.root(),
            ProvisionError::ReadinessTimeout { .. }
        ));
    }

    #[test]
    fn test_readiness_error_includes_logs() {
        let err = ProvisionError::Readiness {
            reason: "container exited".to_string(),
            logs: Some("FATAL: bad config".to_string()),
        };
        assert!(err.to_string().contains("Container logs:\nFATAL: bad config"));

        let err = ProvisionError::Readiness {
            reason: "container exited".to_string(),
            logs: None,
        };
        assert!(!err.to_string().contains("Container logs"));
    }

    #[test]
    fn test_acquisition_is_not_readiness() {
        let err = ProvisionError::acquisition(
            Phase::Start,
            RuntimeError::ContainerStartFailed {
                id: "abc".to_string(),
                reason: "no such image".to_string(),
            },
        );
        assert!(!err.is_readiness_failure());
        assert!(err.to_string().contains("during start"));
    }
}
