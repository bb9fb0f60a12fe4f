//! Jaeger all-in-one.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::{DEFAULT_STARTUP_TIMEOUT, ReadinessPolicy, WaitStrategy};
use crate::spec::{ContainerPort, Customization, LaunchSpec, LaunchSpecBuilder};

pub const DEFAULT_IMAGE: &str = "jaegertracing/all-in-one:1.51";

pub const UI_PORT: ContainerPort = ContainerPort::tcp(16686);
pub const OTLP_GRPC_PORT: ContainerPort = ContainerPort::tcp(4317);
pub const OTLP_HTTP_PORT: ContainerPort = ContainerPort::tcp(4318);

/// Every port the all-in-one image listens on.
pub const PORTS: [ContainerPort; 8] = [
    ContainerPort::tcp(14250),
    ContainerPort::tcp(14268),
    ContainerPort::tcp(14269),
    UI_PORT,
    OTLP_GRPC_PORT,
    OTLP_HTTP_PORT,
    ContainerPort::tcp(5778),
    ContainerPort::tcp(9411),
];

/// Jaeger launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jaeger;

#[async_trait]
impl Service for Jaeger {
    type Handle = JaegerHandle;

    fn name(&self) -> &str {
        "jaeger"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        PORTS
            .iter()
            .fold(LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE)), |b, p| {
                b.expose(*p)
            })
    }

    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::Declared(WaitStrategy::listening_port(
            OTLP_GRPC_PORT,
            DEFAULT_STARTUP_TIMEOUT,
        ))
    }

    fn handle(&self, _plan: &LaunchPlan, coordinates: Coordinates) -> Result<JaegerHandle> {
        Ok(JaegerHandle {
            ui_url: coordinates.url("http", UI_PORT)?,
            grpc_collector: coordinates.address(OTLP_GRPC_PORT)?,
            http_collector: coordinates.address(OTLP_HTTP_PORT)?,
            coordinates,
        })
    }
}

/// A running Jaeger instance.
#[derive(Debug, Clone)]
pub struct JaegerHandle {
    coordinates: Coordinates,
    /// `http://host:port` of the UI and query API.
    pub ui_url: String,
    /// `host:port` of the OTLP gRPC collector.
    pub grpc_collector: String,
    /// `host:port` of the OTLP HTTP collector.
    pub http_collector: String,
}

impl ServiceHandle for JaegerHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start Jaeger and wait until the OTLP gRPC collector listens.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<JaegerHandle> {
    provisioner.run(&Jaeger, cancel, customizations).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::select;

    #[test]
    fn test_exposes_all_ports_and_waits_on_grpc() {
        let spec = Jaeger
            .launch_spec(&ImageRewriter::disabled())
            .build(&[])
            .unwrap();
        assert_eq!(spec.exposed_ports.len(), 8);
        assert_eq!(spec.exposed_ports[0], ContainerPort::tcp(14250));

        let strategy = select(&spec, &Jaeger.readiness(&spec), None).unwrap();
        assert_eq!(strategy.port(), Some(OTLP_GRPC_PORT));
    }
}
