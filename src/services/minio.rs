//! MinIO object storage.

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::image::ImageRewriter;
use crate::provision::{Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::services::env_or;
use crate::spec::{ContainerPort, Customization, LaunchSpecBuilder, with_env};

pub const DEFAULT_IMAGE: &str = "minio/minio";
pub const PORT: ContainerPort = ContainerPort::tcp(9000);

pub const ACCESS_KEY_ENV: &str = "MINIO_ACCESS_KEY";
pub const SECRET_KEY_ENV: &str = "MINIO_SECRET_KEY";

const DEFAULT_ACCESS_KEY: &str = "minioadmin";
const DEFAULT_SECRET_KEY: &str = "minioadmin";
pub const REGION: &str = "us-east-1";

pub fn with_credentials(access_key: impl Into<String>, secret_key: impl Into<String>) -> Customization {
    let access = with_env(ACCESS_KEY_ENV, access_key);
    let secret = with_env(SECRET_KEY_ENV, secret_key);
    Customization::new(move |spec| secret.apply(access.apply(spec)?))
}

/// MinIO launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Minio;

#[async_trait]
impl Service for Minio {
    type Handle = MinioHandle;

    fn name(&self) -> &str {
        "minio"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE))
            .expose(PORT)
            .default_env(ACCESS_KEY_ENV, DEFAULT_ACCESS_KEY)
            .default_env(SECRET_KEY_ENV, DEFAULT_SECRET_KEY)
            .default_cmd(["server", "/data"])
    }

    fn handle(&self, plan: &LaunchPlan, coordinates: Coordinates) -> Result<MinioHandle> {
        let endpoint = coordinates.address(PORT)?;
        Ok(MinioHandle {
            endpoint,
            access_key: env_or(&plan.spec, ACCESS_KEY_ENV, DEFAULT_ACCESS_KEY),
            secret_key: SecretString::from(env_or(&plan.spec, SECRET_KEY_ENV, DEFAULT_SECRET_KEY)),
            region: REGION.to_string(),
            coordinates,
        })
    }
}

/// A running MinIO instance.
#[derive(Debug, Clone)]
pub struct MinioHandle {
    coordinates: Coordinates,
    /// `host:port`, without scheme.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: SecretString,
    pub region: String,
}

impl MinioHandle {
    /// `http://host:port`
    pub fn endpoint_url(&self) -> String {
        format!("http://{}", self.endpoint)
    }
}

impl ServiceHandle for MinioHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start MinIO and wait until its API port accepts connections.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<MinioHandle> {
    provisioner.run(&Minio, cancel, customizations).await
}
