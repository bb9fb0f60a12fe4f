//! Xray proxy.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::services::required_file;
use crate::spec::{
    ContainerPort, Customization, DEFAULT_FILE_MODE, LaunchSpec, LaunchSpecBuilder, with_file,
};

pub const DEFAULT_IMAGE: &str = "teddysun/xray";
pub const PORT: ContainerPort = ContainerPort::tcp(443);
pub const CONFIG_PATH: &str = "/etc/xray/config.json";

/// Mount the Xray configuration. Xray cannot start without one.
pub fn with_config_file(path: impl Into<PathBuf>) -> Customization {
    with_file(path, CONFIG_PATH, DEFAULT_FILE_MODE)
}

/// Xray launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xray;

#[async_trait]
impl Service for Xray {
    type Handle = XrayHandle;

    fn name(&self) -> &str {
        "xray"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE)).expose(PORT)
    }

    async fn plan(&self, spec: LaunchSpec) -> Result<LaunchPlan> {
        required_file(&spec, self.name(), CONFIG_PATH)?;
        let policy = self.readiness(&spec);
        Ok(LaunchPlan::new(spec, policy))
    }

    fn handle(&self, _plan: &LaunchPlan, coordinates: Coordinates) -> Result<XrayHandle> {
        Ok(XrayHandle {
            endpoint: coordinates.address(PORT)?,
            coordinates,
        })
    }
}

/// A running Xray instance.
#[derive(Debug, Clone)]
pub struct XrayHandle {
    coordinates: Coordinates,
    /// `host:port` of the inbound on 443.
    pub endpoint: String,
}

impl ServiceHandle for XrayHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start Xray with a mounted configuration and wait until 443 listens.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<XrayHandle> {
    provisioner.run(&Xray, cancel, customizations).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ProvisionError};

    #[tokio::test]
    async fn test_config_file_required() {
        let spec = Xray
            .launch_spec(&ImageRewriter::disabled())
            .build(&[])
            .unwrap();
        assert!(matches!(
            Xray.plan(spec).await,
            Err(ProvisionError::Config(ConfigError::MissingConfigFile { .. }))
        ));
    }

    #[tokio::test]
    async fn test_plan_with_config() {
        let spec = Xray
            .launch_spec(&ImageRewriter::disabled())
            .build(&[with_config_file("/tmp/xray.json")])
            .unwrap();
        let plan = Xray.plan(spec).await.unwrap();
        assert_eq!(plan.spec.file_at(CONFIG_PATH).unwrap().mode, 0o644);
    }
}
