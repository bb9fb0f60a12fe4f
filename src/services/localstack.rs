//! LocalStack, used for its S3 API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::{ReadinessPolicy, WaitStrategy};
use crate::spec::{ContainerPort, Customization, LaunchSpec, LaunchSpecBuilder};

pub const DEFAULT_IMAGE: &str = "localstack/localstack:1.4.0";
pub const PORT: ContainerPort = ContainerPort::tcp(4566);
pub const HEALTH_PATH: &str = "/_localstack/health";

// LocalStack accepts any static credentials.
const ACCESS_KEY_ID: &str = "access_key_id";
const SECRET_ACCESS_KEY: &str = "secret_access_key";
const SESSION_TOKEN: &str = "token";
pub const REGION: &str = "us-east-1";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// LocalStack launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStack;

#[async_trait]
impl Service for LocalStack {
    type Handle = S3Handle;

    fn name(&self) -> &str {
        "localstack"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE))
            .expose(PORT)
            .default_env("SERVICES", "s3")
    }

    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::Declared(WaitStrategy::http(PORT, HEALTH_PATH, STARTUP_TIMEOUT))
    }

    fn handle(&self, _plan: &LaunchPlan, coordinates: Coordinates) -> Result<S3Handle> {
        Ok(S3Handle {
            endpoint: coordinates.address(PORT)?,
            access_key_id: ACCESS_KEY_ID.to_string(),
            secret_access_key: SecretString::from(SECRET_ACCESS_KEY.to_string()),
            token: SecretString::from(SESSION_TOKEN.to_string()),
            region: REGION.to_string(),
            coordinates,
        })
    }
}

/// A running LocalStack instance serving S3.
#[derive(Debug, Clone)]
pub struct S3Handle {
    coordinates: Coordinates,
    /// `host:port`, without scheme.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub token: SecretString,
    pub region: String,
}

impl S3Handle {
    /// `http://host:port`, for path-style S3 clients.
    pub fn endpoint_url(&self) -> String {
        format!("http://{}", self.endpoint)
    }
}

impl ServiceHandle for S3Handle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start LocalStack and wait until its health endpoint answers 200.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<S3Handle> {
    provisioner.run(&LocalStack, cancel, customizations).await
}
