//! The sandbox runtime the provisioner drives.
//!
//! [`SandboxRuntime`] is the only way the rest of the crate touches
//! containers. [`DockerRuntime`] implements it against a local or remote
//! Docker daemon; [`FakeRuntime`](crate::testing::FakeRuntime) implements it
//! in memory for tests.

pub mod docker;

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::spec::{ContainerPort, LaunchSpec};

pub use docker::{DockerRuntime, connect_docker};

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn output_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// Options for creating a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Network driver; empty means the runtime default (bridge).
    pub driver: String,
    /// MTU of the network, if not the default.
    pub mtu: Option<u32>,
    pub labels: BTreeMap<String, String>,
}

/// Operations the provisioner needs from a sandbox runtime.
///
/// Instances are addressed by the id returned from [`create`](Self::create).
/// [`terminate`](Self::terminate) also accepts the name the instance was
/// created with, so an instance whose creation was interrupted can still be
/// removed.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create (but do not start) an instance. Pulls the image if needed.
    async fn create(&self, name: &str, spec: &LaunchSpec) -> Result<String, RuntimeError>;

    /// Write a file into a created instance.
    async fn copy_file(
        &self,
        id: &str,
        container_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RuntimeError>;

    /// Attach a created instance to an additional network.
    async fn connect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop and remove the instance.
    async fn terminate(&self, id: &str) -> Result<(), RuntimeError>;

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Host through which mapped ports are reachable.
    async fn host(&self, id: &str) -> Result<String, RuntimeError>;

    /// Host port mapped to an internal port.
    async fn mapped_port(&self, id: &str, port: ContainerPort) -> Result<u16, RuntimeError>;

    /// Everything the instance has logged so far.
    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Run a command inside the instance and collect its output.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Create a network and return its id.
    async fn create_network(
        &self,
        name: &str,
        options: &NetworkOptions,
    ) -> Result<String, RuntimeError>;

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError>;
}
