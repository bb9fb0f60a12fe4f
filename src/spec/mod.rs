//! Launch specifications and the builder that layers caller customizations
//! over a service's built-in defaults.
//!
//! # Ordering
//!
//! ```text
//! base (fixed service fields)
//!    │
//!    ▼  customization 1, 2, ... n   (fold, last write wins)
//!    │
//!    ▼  defaults filled only where still unset
//! LaunchSpec
//! ```
//!
//! Defaults are applied last, so an explicit caller choice is never
//! clobbered by a built-in value.

mod customize;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ConfigError, ProvisionError};
use crate::readiness::WaitStrategy;

pub use customize::{
    Customization, with_cmd, with_entrypoint, with_env, with_envs, with_exposed_ports, with_file,
    with_image, with_label, with_networks, with_privileged, with_wait,
};

/// Default file mode for uploaded files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Transport protocol of a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A port inside the sandbox, e.g. `5432/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub const fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for ContainerPort {
    type Err = ConfigError;

    /// Parses `5432`, `5432/tcp` or `53/udp`. A bare number means TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPort {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (number, protocol) = match s.split_once('/') {
            None => (s, Protocol::Tcp),
            Some((number, "tcp")) => (number, Protocol::Tcp),
            Some((number, "udp")) => (number, Protocol::Udp),
            Some(_) => return Err(invalid("protocol must be tcp or udp")),
        };

        let port: u16 = number
            .trim()
            .parse()
            .map_err(|_| invalid("not a port number"))?;
        if port == 0 {
            return Err(invalid("port 0 cannot be exposed"));
        }

        Ok(Self { port, protocol })
    }
}

impl From<u16> for ContainerPort {
    fn from(port: u16) -> Self {
        Self::tcp(port)
    }
}

/// A host file copied into the sandbox before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: u32,
}

/// Everything needed to launch one sandbox instance.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Effective image identifier.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Internal ports to publish, in declaration order.
    pub exposed_ports: Vec<ContainerPort>,
    /// Files copied in before start.
    pub files: Vec<FileMount>,
    /// Readiness strategy. `None` until chosen by the caller or the selector.
    pub wait: Option<WaitStrategy>,
    /// Run with elevated privileges.
    pub privileged: bool,
    /// Command arguments replacing the image default.
    pub cmd: Option<Vec<String>>,
    /// Entrypoint replacing the image default.
    pub entrypoint: Option<Vec<String>>,
    /// Networks to attach, the first one as the primary network.
    pub networks: Vec<String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Append a port unless already exposed.
    pub fn expose(&mut self, port: ContainerPort) {
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
    }

    /// Mounted file targeting `container_path`, if any.
    pub fn file_at(&self, container_path: &str) -> Option<&FileMount> {
        self.files
            .iter()
            .find(|f| f.container_path == container_path)
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Check the invariants that must hold before launch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::EmptyImage);
        }
        if let Some(port) = self.wait.as_ref().and_then(WaitStrategy::port)
            && !self.exposed_ports.contains(&port)
        {
            return Err(ConfigError::InconsistentReadiness {
                port: port.to_string(),
            });
        }
        Ok(())
    }
}

/// Built-in values applied after customizations, only where unset.
#[derive(Debug, Clone, Default)]
struct SpecDefaults {
    image: String,
    env: Vec<(String, String)>,
    cmd: Option<Vec<String>>,
}

/// Assembles a [`LaunchSpec`] from service defaults and customizations.
#[derive(Debug, Clone)]
pub struct LaunchSpecBuilder {
    base: LaunchSpec,
    defaults: SpecDefaults,
}

impl LaunchSpecBuilder {
    /// Start a builder whose default image is `image` (already rewritten).
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            base: LaunchSpec::default(),
            defaults: SpecDefaults {
                image: image.into(),
                ..Default::default()
            },
        }
    }

    /// Expose a port in the base specification.
    pub fn expose(mut self, port: ContainerPort) -> Self {
        self.base.expose(port);
        self
    }

    /// Set an environment variable in the base specification.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base.env.insert(key.into(), value.into());
        self
    }

    /// Environment variable applied only if no customization set it.
    pub fn default_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.env.push((key.into(), value.into()));
        self
    }

    /// Command applied only if no customization set one.
    pub fn default_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base.labels.insert(key.into(), value.into());
        self
    }

    /// Fold the customizations over the base, then fill unset defaults.
    ///
    /// The first failing customization stops the fold.
    pub fn build(self, customizations: &[Customization]) -> Result<LaunchSpec, ProvisionError> {
        let Self { base, defaults } = self;

        let mut spec = customizations
            .iter()
            .try_fold(base, |spec, customization| customization.apply(spec))?;

        if spec.image.trim().is_empty() {
            spec.image = defaults.image;
        }
        for (key, value) in defaults.env {
            spec.env.entry(key).or_insert(value);
        }
        if spec.cmd.is_none() {
            spec.cmd = defaults.cmd;
        }

        Ok(spec)
    }
}
