//! Redis.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::ReadinessPolicy;
use crate::spec::{ContainerPort, Customization, LaunchSpec, LaunchSpecBuilder};

pub const DEFAULT_IMAGE: &str = "redis:7.2.2-alpine";
pub const PORT: ContainerPort = ContainerPort::tcp(6379);

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Redis launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redis;

#[async_trait]
impl Service for Redis {
    type Handle = RedisHandle;

    fn name(&self) -> &str {
        "redis"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE)).expose(PORT)
    }

    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::FirstExposedPort {
            timeout: STARTUP_TIMEOUT,
        }
    }

    fn handle(&self, _plan: &LaunchPlan, coordinates: Coordinates) -> Result<RedisHandle> {
        let port = coordinates.require(PORT)?;
        Ok(RedisHandle { coordinates, port })
    }
}

/// A running Redis instance.
#[derive(Debug, Clone)]
pub struct RedisHandle {
    coordinates: Coordinates,
    port: u16,
}

impl RedisHandle {
    /// `host:port`
    pub fn address(&self) -> String {
        crate::provision::coordinates::authority(self.coordinates.host(), self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `redis://host:port`
    pub fn url(&self) -> String {
        format!("redis://{}", self.address())
    }
}

impl ServiceHandle for RedisHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start Redis and wait until its port accepts connections.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<RedisHandle> {
    provisioner.run(&Redis, cancel, customizations).await
}
