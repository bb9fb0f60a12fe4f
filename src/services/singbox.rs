//! sing-box proxy daemon.
//!
//! The ports to publish are not fixed. They come from the inbounds declared
//! in the mounted configuration, which is read and classified before
//! anything is created (see [`crate::capability`]):
//!
//! - SOCKS5 and/or HTTP inbounds are published and the first one is probed
//!   as a listening port.
//! - A TUN-only configuration runs privileged and is ready once a `tun`
//!   interface shows up in `ip addr show`.
//! - Anything else fails before launch.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capability::Capabilities;
use crate::config::ProvisionConfig;
use crate::error::{Result, RuntimeError};
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::{DEFAULT_STARTUP_TIMEOUT, ReadinessPolicy};
use crate::runtime::{NetworkOptions, SandboxRuntime};
use crate::services::required_file;
use crate::spec::{Customization, DEFAULT_FILE_MODE, LaunchSpec, LaunchSpecBuilder, with_file};

pub use crate::spec::with_networks;

pub const DEFAULT_IMAGE: &str = "ghcr.io/sagernet/sing-box";
pub const CONFIG_PATH: &str = "/etc/sing-box/config.json";
/// Label put on networks created by [`create_network_with_mtu`].
pub const NETWORK_LABEL: &str = "ephemeral.singbox";

/// Mount the sing-box configuration. sing-box cannot start without one.
pub fn with_config_file(path: impl Into<PathBuf>) -> Customization {
    with_file(path, CONFIG_PATH, DEFAULT_FILE_MODE)
}

/// sing-box launcher.
#[derive(Debug, Clone, Default)]
pub struct SingBox {
    image: Option<String>,
}

impl SingBox {
    /// Launcher using `SINGBOX_IMAGE` from `config` when set.
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            image: config.singbox_image.clone(),
        }
    }

    fn default_image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }
}

#[async_trait]
impl Service for SingBox {
    type Handle = SingBoxHandle;

    fn name(&self) -> &str {
        "singbox"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(self.default_image()))
            .default_cmd(["run", "-c", CONFIG_PATH])
            .default_env("ENABLE_DEPRECATED_SPECIAL_OUTBOUNDS", "true")
    }

    async fn plan(&self, mut spec: LaunchSpec) -> Result<LaunchPlan> {
        let config = required_file(&spec, self.name(), CONFIG_PATH)?;
        let capabilities = Capabilities::from_file(&config.host_path).await?;
        tracing::debug!(
            "sing-box capabilities: socks={:?} http={:?} tun={}",
            capabilities.socks_port,
            capabilities.http_port,
            capabilities.tunnel
        );

        // Detected ports go first so the readiness probe targets SOCKS5,
        // then HTTP.
        let extra = std::mem::take(&mut spec.exposed_ports);
        for port in capabilities.ports().into_iter().chain(extra) {
            spec.expose(port);
        }

        if capabilities.requires_privilege() {
            tracing::debug!("Enabling privileged mode for TUN support");
            spec.privileged = true;
        }

        Ok(LaunchPlan {
            spec,
            policy: ReadinessPolicy::FirstExposedPort {
                timeout: DEFAULT_STARTUP_TIMEOUT,
            },
            capabilities: Some(capabilities),
        })
    }

    fn handle(&self, plan: &LaunchPlan, coordinates: Coordinates) -> Result<SingBoxHandle> {
        let (socks, http, tunnel) = plan
            .capabilities
            .as_ref()
            .map(Capabilities::summary)
            .unwrap_or_default();

        Ok(SingBoxHandle {
            socks5_url: socks.map(|p| coordinates.url("socks5", p)).transpose()?,
            http_url: http.map(|p| coordinates.url("http", p)).transpose()?,
            socks5_port: socks.map(|p| coordinates.require(p)).transpose()?,
            http_port: http.map(|p| coordinates.require(p)).transpose()?,
            tunnel,
            coordinates,
        })
    }
}

/// A running sing-box instance.
#[derive(Debug, Clone)]
pub struct SingBoxHandle {
    coordinates: Coordinates,
    /// `socks5://host:port`, when a SOCKS5 inbound is declared.
    pub socks5_url: Option<String>,
    /// `http://host:port`, when an HTTP inbound is declared.
    pub http_url: Option<String>,
    /// Mapped SOCKS5 port.
    pub socks5_port: Option<u16>,
    /// Mapped HTTP proxy port.
    pub http_port: Option<u16>,
    /// A TUN interface is configured.
    pub tunnel: bool,
}

impl ServiceHandle for SingBoxHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start sing-box with a mounted configuration and wait until it is usable.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<SingBoxHandle> {
    let service = SingBox::new(provisioner.config());
    provisioner.run(&service, cancel, customizations).await
}

/// A network removed by [`NetworkGuard::remove`].
pub struct NetworkGuard {
    name: String,
    runtime: Arc<dyn SandboxRuntime>,
    removed: bool,
}

impl NetworkGuard {
    /// Network name, for [`with_networks`].
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn remove(mut self) -> std::result::Result<(), RuntimeError> {
        self.runtime.remove_network(&self.name).await?;
        self.removed = true;
        tracing::info!("Removed network {}", self.name);
        Ok(())
    }
}

impl std::fmt::Debug for NetworkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGuard")
            .field("name", &self.name)
            .field("removed", &self.removed)
            .finish()
    }
}

impl Drop for NetworkGuard {
    fn drop(&mut self) {
        if !self.removed {
            tracing::warn!("Network '{}' dropped without remove()", self.name);
        }
    }
}

/// Create a bridge network with a custom MTU.
///
/// Tunnels on the host often have an MTU below 1500; containers behind them
/// need a matching network.
pub async fn create_network_with_mtu(
    provisioner: &Provisioner,
    mtu: u32,
) -> std::result::Result<NetworkGuard, RuntimeError> {
    let name = format!("singbox-mtu{}-{}", mtu, chrono::Utc::now().timestamp());
    let options = NetworkOptions {
        driver: "bridge".to_string(),
        mtu: Some(mtu),
        labels: [(NETWORK_LABEL.to_string(), "true".to_string())].into(),
    };

    let runtime = Arc::clone(provisioner.runtime());
    let name = runtime.create_network(&name, &options).await?;
    Ok(NetworkGuard {
        name,
        runtime,
        removed: false,
    })
}
