//! Test support for code that provisions services.
//!
//! Provides:
//! - [`FakeRuntime`]: an in-memory [`SandboxRuntime`] that records what the
//!   provisioner asked for and can be told to fail
//! - [`init_tracing`]: idempotent test subscriber
//! - [`closed_port`]: a local port nothing listens on
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ephemeral_services::config::ProvisionConfig;
//! use ephemeral_services::provision::Provisioner;
//! use ephemeral_services::testing::{FakeOp, FakeRuntime};
//!
//! let runtime = Arc::new(FakeRuntime::new().fail(FakeOp::Start));
//! let provisioner = Provisioner::new(runtime.clone(), ProvisionConfig::default()).unwrap();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use crate::error::RuntimeError;
use crate::runtime::{ExecOutput, NetworkOptions, SandboxRuntime};
use crate::spec::{ContainerPort, LaunchSpec};

/// Runtime operations a [`FakeRuntime`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    CopyFile,
    ConnectNetwork,
    Start,
    Terminate,
    IsRunning,
    Host,
    MappedPort,
    Logs,
    Exec,
    CreateNetwork,
    RemoveNetwork,
}

/// A file written into a fake instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub container_path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// What the fake knows about one created instance.
#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub id: String,
    pub name: String,
    pub spec: LaunchSpec,
    pub files: Vec<CopiedFile>,
    /// Networks attached after creation.
    pub connected: Vec<String>,
    pub started: bool,
    pub terminated: bool,
}

#[derive(Debug, Default)]
struct State {
    instances: Vec<FakeInstance>,
    networks: Vec<(String, NetworkOptions)>,
    removed_networks: Vec<String>,
    calls: HashMap<FakeOp, u32>,
}

/// An in-memory sandbox runtime.
///
/// Ports map to `40000 + port` unless mapped explicitly with
/// [`map_port`](Self::map_port), which is how tests point readiness probes at
/// real local listeners. Commands succeed with empty output unless
/// [`with_exec_output`](Self::with_exec_output) says otherwise.
#[derive(Debug)]
pub struct FakeRuntime {
    host: String,
    failures: HashSet<FakeOp>,
    port_map: HashMap<ContainerPort, u16>,
    unmapped: HashSet<ContainerPort>,
    logs: Vec<u8>,
    exec_output: ExecOutput,
    exits_after_start: bool,
    next_id: AtomicU32,
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            failures: HashSet::new(),
            port_map: HashMap::new(),
            unmapped: HashSet::new(),
            logs: Vec::new(),
            exec_output: ExecOutput {
                exit_code: 0,
                output: Vec::new(),
            },
            exits_after_start: false,
            next_id: AtomicU32::new(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every call of `op` fail.
    pub fn fail(mut self, op: FakeOp) -> Self {
        self.failures.insert(op);
        self
    }

    /// Map an internal port to a specific host port.
    pub fn map_port(mut self, port: impl Into<ContainerPort>, host_port: u16) -> Self {
        self.port_map.insert(port.into(), host_port);
        self
    }

    /// Leave an internal port without a host mapping.
    pub fn unmapped(mut self, port: impl Into<ContainerPort>) -> Self {
        self.unmapped.insert(port.into());
        self
    }

    /// Logs every instance reports.
    pub fn with_logs(mut self, logs: impl Into<Vec<u8>>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Result of every exec.
    pub fn with_exec_output(mut self, exit_code: i64, output: impl Into<Vec<u8>>) -> Self {
        self.exec_output = ExecOutput {
            exit_code,
            output: output.into(),
        };
        self
    }

    /// Instances report not running once started.
    pub fn exits_after_start(mut self) -> Self {
        self.exits_after_start = true;
        self
    }

    /// Every instance created so far, in creation order.
    pub fn created(&self) -> Vec<FakeInstance> {
        self.lock().instances.clone()
    }

    /// Instances that were created and later terminated.
    pub fn terminated_count(&self) -> usize {
        self.lock().instances.iter().filter(|i| i.terminated).count()
    }

    /// Instances that are started and not terminated.
    pub fn running_count(&self) -> usize {
        self.lock()
            .instances
            .iter()
            .filter(|i| i.started && !i.terminated)
            .count()
    }

    /// How many times `op` was called.
    pub fn calls(&self, op: FakeOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Networks created so far, with their options.
    pub fn networks(&self) -> Vec<(String, NetworkOptions)> {
        self.lock().networks.clone()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        self.lock().removed_networks.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test must not hide the state from the next assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and fail it if configured to.
    fn enter(&self, op: FakeOp, id: &str) -> Result<(), RuntimeError> {
        *self.lock().calls.entry(op).or_default() += 1;
        if !self.failures.contains(&op) {
            return Ok(());
        }

        let id = id.to_string();
        let reason = "injected failure".to_string();
        Err(match op {
            FakeOp::Create => RuntimeError::ContainerCreationFailed { name: id, reason },
            FakeOp::CopyFile => RuntimeError::CopyFailed {
                id,
                path: String::new(),
                reason,
            },
            FakeOp::Start => RuntimeError::ContainerStartFailed { id, reason },
            FakeOp::Terminate => RuntimeError::TerminateFailed { id, reason },
            FakeOp::IsRunning | FakeOp::Host => RuntimeError::InspectFailed { id, reason },
            FakeOp::MappedPort => RuntimeError::PortNotMapped {
                id,
                port: String::new(),
            },
            FakeOp::Logs => RuntimeError::LogsFailed { id, reason },
            FakeOp::Exec => RuntimeError::ExecFailed { id, reason },
            FakeOp::ConnectNetwork | FakeOp::CreateNetwork | FakeOp::RemoveNetwork => {
                RuntimeError::NetworkFailed { name: id, reason }
            }
        })
    }

    fn with_instance<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeInstance) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.lock();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.id == id || i.name == id)
            .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() })?;
        Ok(f(instance))
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn create(&self, name: &str, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        self.enter(FakeOp::Create, name)?;
        let id = format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().instances.push(FakeInstance {
            id: id.clone(),
            name: name.to_string(),
            spec: spec.clone(),
            files: Vec::new(),
            connected: Vec::new(),
            started: false,
            terminated: false,
        });
        Ok(id)
    }

    async fn copy_file(
        &self,
        id: &str,
        container_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RuntimeError> {
        self.enter(FakeOp::CopyFile, id)?;
        self.with_instance(id, |i| {
            i.files.push(CopiedFile {
                container_path: container_path.to_string(),
                contents: contents.to_vec(),
                mode,
            })
        })
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError> {
        self.enter(FakeOp::ConnectNetwork, network)?;
        self.with_instance(id, |i| i.connected.push(network.to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter(FakeOp::Start, id)?;
        self.with_instance(id, |i| i.started = true)
    }

    async fn terminate(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter(FakeOp::Terminate, id)?;
        // Unknown instances are already gone.
        let _ = self.with_instance(id, |i| i.terminated = true);
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        self.enter(FakeOp::IsRunning, id)?;
        let exits = self.exits_after_start;
        self.with_instance(id, |i| i.started && !i.terminated && !exits)
    }

    async fn host(&self, id: &str) -> Result<String, RuntimeError> {
        self.enter(FakeOp::Host, id)?;
        Ok(self.host.clone())
    }

    async fn mapped_port(&self, id: &str, port: ContainerPort) -> Result<u16, RuntimeError> {
        self.enter(FakeOp::MappedPort, id)?;
        let exposed = self.with_instance(id, |i| i.spec.exposed_ports.contains(&port))?;
        if !exposed || self.unmapped.contains(&port) {
            return Err(RuntimeError::PortNotMapped {
                id: id.to_string(),
                port: port.to_string(),
            });
        }
        Ok(self
            .port_map
            .get(&port)
            .copied()
            .unwrap_or_else(|| 40000u16.saturating_add(port.port % 20000)))
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        self.enter(FakeOp::Logs, id)?;
        Ok(self.logs.clone())
    }

    async fn exec(&self, id: &str, _cmd: &[String]) -> Result<ExecOutput, RuntimeError> {
        self.enter(FakeOp::Exec, id)?;
        Ok(self.exec_output.clone())
    }

    async fn create_network(
        &self,
        name: &str,
        options: &NetworkOptions,
    ) -> Result<String, RuntimeError> {
        self.enter(FakeOp::CreateNetwork, name)?;
        self.lock()
            .networks
            .push((name.to_string(), options.clone()));
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter(FakeOp::RemoveNetwork, id)?;
        self.lock().removed_networks.push(id.to_string());
        Ok(())
    }
}

/// Install a fmt subscriber for tests. Honors `RUST_LOG`, defaults to `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// A local port with no listener behind it.
pub async fn closed_port() -> std::io::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_lifecycle() {
        let fake = FakeRuntime::new();
        let spec = LaunchSpec {
            image: "redis:7".to_string(),
            exposed_ports: vec![ContainerPort::tcp(6379)],
            ..Default::default()
        };

        let id = fake.create("ephemeral-redis-1", &spec).await.unwrap();
        fake.start(&id).await.unwrap();
        assert!(fake.is_running(&id).await.unwrap());
        assert_eq!(fake.running_count(), 1);
        assert_eq!(
            fake.mapped_port(&id, ContainerPort::tcp(6379)).await.unwrap(),
            46379
        );
        assert!(fake.mapped_port(&id, ContainerPort::tcp(80)).await.is_err());

        // By name, as the provisioner does after a cancelled create.
        fake.terminate("ephemeral-redis-1").await.unwrap();
        assert_eq!(fake.terminated_count(), 1);
        assert_eq!(fake.running_count(), 0);
        assert_eq!(fake.calls(FakeOp::Terminate), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let fake = FakeRuntime::new().fail(FakeOp::Start);
        let id = fake.create("x", &LaunchSpec::default()).await.unwrap();
        assert!(matches!(
            fake.start(&id).await,
            Err(RuntimeError::ContainerStartFailed { .. })
        ));
        assert_eq!(fake.calls(FakeOp::Start), 1);
    }
}
