//! VictoriaMetrics single-node.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::{DEFAULT_STARTUP_TIMEOUT, ReadinessPolicy, WaitStrategy};
use crate::spec::{ContainerPort, Customization, LaunchSpec, LaunchSpecBuilder};

pub const DEFAULT_IMAGE: &str = "victoriametrics/victoria-metrics:v1.103.0";
pub const PORT: ContainerPort = ContainerPort::tcp(8428);

const READY_LOG: &str = "starting server at";

/// Keeps a year of data and makes freshly written samples queryable at once.
const DEFAULT_ARGS: [&str; 3] = [
    "-retentionPeriod=12",
    "-search.cacheTimestampOffset=43200h",
    "-search.latencyOffset=1s",
];

/// VictoriaMetrics launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct VictoriaMetrics;

#[async_trait]
impl Service for VictoriaMetrics {
    type Handle = VictoriaMetricsHandle;

    fn name(&self) -> &str {
        "victoriametrics"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE))
            .expose(PORT)
            .default_cmd(DEFAULT_ARGS)
    }

    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::Declared(WaitStrategy::log(READY_LOG, DEFAULT_STARTUP_TIMEOUT))
    }

    fn handle(
        &self,
        _plan: &LaunchPlan,
        coordinates: Coordinates,
    ) -> Result<VictoriaMetricsHandle> {
        Ok(VictoriaMetricsHandle {
            url: coordinates.url("http", PORT)?,
            coordinates,
        })
    }
}

/// A running VictoriaMetrics instance.
#[derive(Debug, Clone)]
pub struct VictoriaMetricsHandle {
    coordinates: Coordinates,
    /// `http://host:port`
    pub url: String,
}

impl ServiceHandle for VictoriaMetricsHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start VictoriaMetrics and wait for its startup log line.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<VictoriaMetricsHandle> {
    provisioner.run(&VictoriaMetrics, cancel, customizations).await
}
