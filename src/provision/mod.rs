//! The provisioning protocol.
//!
//! ```text
//! Built ──create──▶ Created ──upload files, start──▶ Started
//!                      │                                │ after_start hook,
//!                      │                                ▼ readiness wait
//!                      │                              Ready ──resolve──▶ Handle
//!                      ▼                                │
//!                    Error ◀────────────────────────────┘
//!              (instance torn down first)
//! ```
//!
//! Everything before `create` is pure: the launch specification is built,
//! the service plans its launch (capability detection happens here), the
//! readiness strategy is selected and host files are read. Any failure from
//! `Created` on tears the instance down before the error is returned, and a
//! failing teardown is reported next to the original error.

pub mod cell;
pub mod container;
pub mod coordinates;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capability::Capabilities;
use crate::config::ProvisionConfig;
use crate::error::{ConfigError, Phase, ProvisionError, Result, RuntimeError};
use crate::image::ImageRewriter;
use crate::readiness::{self, ReadinessPolicy, WaitStrategy, wait_until_ready};
use crate::runtime::{DockerRuntime, SandboxRuntime};
use crate::spec::{ContainerPort, Customization, FileMount, LaunchSpec, LaunchSpecBuilder};

pub use cell::ConnectionCell;
pub use container::Container;
pub use coordinates::Coordinates;

/// Label naming the service an instance runs.
pub const SERVICE_LABEL: &str = "ephemeral.service";
/// Label marking instances created by this crate.
pub const MANAGED_LABEL: &str = "ephemeral.managed";

/// Everything a launch needs after planning.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub spec: LaunchSpec,
    /// How readiness is decided when the caller did not choose.
    pub policy: ReadinessPolicy,
    /// Capabilities detected from a configuration document, if any.
    pub capabilities: Option<Capabilities>,
}

impl LaunchPlan {
    pub fn new(spec: LaunchSpec, policy: ReadinessPolicy) -> Self {
        Self {
            spec,
            policy,
            capabilities: None,
        }
    }
}

/// A service that can be launched in a sandbox.
#[async_trait]
pub trait Service: Send + Sync {
    /// What a successful launch returns.
    type Handle: Send;

    /// Short name used in container names, labels and logs.
    fn name(&self) -> &str;

    /// Base specification and built-in defaults.
    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder;

    /// Readiness policy for the finished specification.
    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::default()
    }

    /// Turn the finished specification into a launch plan.
    ///
    /// Runs before anything is created, so failures here never need
    /// teardown.
    async fn plan(&self, spec: LaunchSpec) -> Result<LaunchPlan> {
        let policy = self.readiness(&spec);
        Ok(LaunchPlan::new(spec, policy))
    }

    /// Hook run after start and before the readiness wait.
    async fn after_start(&self, _container: &Container, _plan: &LaunchPlan) -> Result<()> {
        Ok(())
    }

    /// Build the handle from the resolved coordinates.
    fn handle(&self, plan: &LaunchPlan, coordinates: Coordinates) -> Result<Self::Handle>;
}

/// Uniform access to any provisioned handle.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    fn coordinates(&self) -> &Coordinates;

    fn container(&self) -> &Container {
        self.coordinates().container()
    }

    fn host(&self) -> &str {
        self.coordinates().host()
    }

    fn mapped_port(&self, port: ContainerPort) -> Option<u16> {
        self.coordinates().port(port)
    }

    /// Stop and remove the instance.
    async fn terminate(&self) -> std::result::Result<(), RuntimeError> {
        self.container().terminate().await
    }
}

/// A host file read ahead of launch.
struct Upload {
    container_path: String,
    contents: Vec<u8>,
    mode: u32,
}

/// Drives a [`SandboxRuntime`] through the provisioning protocol.
#[derive(Clone)]
pub struct Provisioner {
    runtime: Arc<dyn SandboxRuntime>,
    images: ImageRewriter,
    config: ProvisionConfig,
}

impl Provisioner {
    /// Fails if the configured registry mirror is malformed.
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        config: ProvisionConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let images = ImageRewriter::new(config.mirror.as_deref())?;
        Ok(Self {
            runtime,
            images,
            config,
        })
    }

    /// Provisioner backed by the local Docker daemon.
    pub async fn docker(config: ProvisionConfig) -> Result<Self> {
        let images = ImageRewriter::new(config.mirror.as_deref())?;
        let runtime = DockerRuntime::connect(&config)
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Create, e))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            images,
            config,
        })
    }

    /// Docker-backed provisioner configured from the environment.
    pub async fn from_env() -> Result<Self> {
        Self::docker(ProvisionConfig::from_env()?).await
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    pub fn images(&self) -> &ImageRewriter {
        &self.images
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Launch one instance of `service` and wait until it is ready.
    ///
    /// On success the caller owns the returned handle and must terminate it.
    /// On failure no handle is returned and whatever was created has been
    /// torn down.
    pub async fn run<S: Service>(
        &self,
        service: &S,
        cancel: &CancellationToken,
        customizations: &[Customization],
    ) -> Result<S::Handle> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled { phase: Phase::Build });
        }

        let spec = service
            .launch_spec(&self.images)
            .build(customizations)?;
        let mut plan = service.plan(spec).await?;

        plan.spec.image = self.images.rewrite(&plan.spec.image);
        let strategy = readiness::select(&plan.spec, &plan.policy, plan.capabilities.as_ref())?;
        plan.spec.wait = Some(strategy.clone());
        plan.spec.validate()?;

        let uploads = read_files(&plan.spec.files).await?;

        plan.spec
            .labels
            .insert(SERVICE_LABEL.to_string(), service.name().to_string());
        plan.spec
            .labels
            .insert(MANAGED_LABEL.to_string(), "true".to_string());

        let name = instance_name(service.name());
        tracing::info!(
            "Creating {} container {} from {}",
            service.name(),
            name,
            plan.spec.image
        );

        let created = cancellable(cancel, Phase::Create, async {
            self.runtime
                .create(&name, &plan.spec)
                .await
                .map_err(|e| ProvisionError::acquisition(Phase::Create, e))
        })
        .await;

        let id = match created {
            Ok(id) => id,
            Err(error @ ProvisionError::Cancelled { .. }) => {
                // The daemon may have finished creating it anyway.
                return Err(self.teardown(&name, error).await);
            }
            Err(error) => return Err(error),
        };

        let container = Container::new(id, name, service.name(), Arc::clone(&self.runtime));

        match self
            .bring_up(service, &container, &plan, &strategy, &uploads, cancel)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(error) => {
                tracing::warn!("Provisioning {} failed: {}", container.name(), error);
                let error = self.teardown_container(&container, error).await;
                Err(error)
            }
        }
    }

    async fn bring_up<S: Service>(
        &self,
        service: &S,
        container: &Container,
        plan: &LaunchPlan,
        strategy: &WaitStrategy,
        uploads: &[Upload],
        cancel: &CancellationToken,
    ) -> Result<S::Handle> {
        // The first network is the primary one, set at creation.
        for network in plan.spec.networks.iter().skip(1) {
            cancellable(cancel, Phase::Create, async {
                container
                    .connect_network(network)
                    .await
                    .map_err(|e| ProvisionError::acquisition(Phase::Create, e))
            })
            .await?;
        }

        for upload in uploads {
            cancellable(cancel, Phase::Create, async {
                container
                    .copy_file(&upload.container_path, &upload.contents, upload.mode)
                    .await
                    .map_err(|e| ProvisionError::acquisition(Phase::Create, e))
            })
            .await?;
        }

        cancellable(cancel, Phase::Start, async {
            container
                .start()
                .await
                .map_err(|e| ProvisionError::acquisition(Phase::Start, e))
        })
        .await?;
        tracing::info!("Started {} container {}", service.name(), container.name());

        cancellable(cancel, Phase::Start, service.after_start(container, plan)).await?;
        cancellable(cancel, Phase::Ready, wait_until_ready(container, strategy)).await?;

        let coordinates = cancellable(
            cancel,
            Phase::Resolve,
            Coordinates::resolve(container, &plan.spec.exposed_ports),
        )
        .await?;

        let handle = service.handle(plan, coordinates)?;
        tracing::info!("{} container {} ready", service.name(), container.name());
        Ok(handle)
    }

    async fn teardown_container(&self, container: &Container, error: ProvisionError) -> ProvisionError {
        let outcome = tokio::time::timeout(self.config.teardown_timeout, container.terminate()).await;
        attach_teardown(container.id(), self.config.teardown_timeout, outcome, error)
    }

    /// Remove an instance known only by name.
    async fn teardown(&self, name: &str, error: ProvisionError) -> ProvisionError {
        let outcome =
            tokio::time::timeout(self.config.teardown_timeout, self.runtime.terminate(name)).await;
        attach_teardown(name, self.config.teardown_timeout, outcome, error)
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("images", &self.images)
            .field("config", &self.config)
            .finish()
    }
}

fn attach_teardown(
    id: &str,
    limit: std::time::Duration,
    outcome: std::result::Result<std::result::Result<(), RuntimeError>, tokio::time::error::Elapsed>,
    error: ProvisionError,
) -> ProvisionError {
    let teardown = match outcome {
        Ok(Ok(())) => return error,
        Ok(Err(e)) => e,
        Err(_) => RuntimeError::TerminateFailed {
            id: id.to_string(),
            reason: format!("timed out after {limit:?}"),
        },
    };

    tracing::warn!("Teardown of {} failed: {}", id, teardown);
    ProvisionError::Teardown {
        error: Box::new(error),
        teardown,
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, phase: Phase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("Provisioning cancelled during {}", phase);
            Err(ProvisionError::Cancelled { phase })
        }
        result = fut => result,
    }
}

/// Read every mounted host file before anything is created.
async fn read_files(files: &[FileMount]) -> Result<Vec<Upload>> {
    let mut uploads = Vec::with_capacity(files.len());
    for file in files {
        let contents = tokio::fs::read(&file.host_path)
            .await
            .map_err(|e| missing_file(file.host_path.clone(), e))?;
        uploads.push(Upload {
            container_path: file.container_path.clone(),
            contents,
            mode: file.mode,
        });
    }
    Ok(uploads)
}

fn missing_file(path: PathBuf, e: std::io::Error) -> ConfigError {
    ConfigError::MissingFile {
        path,
        reason: e.to_string(),
    }
}

/// `ephemeral-<service>-<12 hex chars>`.
fn instance_name(service: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("ephemeral-{}-{}", service, &suffix[..12])
}
