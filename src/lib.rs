//! Disposable service dependencies for integration tests.
//!
//! Each launcher in [`services`] starts one isolated container (a database,
//! cache, broker, object store, tracing backend or proxy), waits until it is
//! actually usable and hands back the coordinates needed to reach it. If any
//! step after creation fails, the container is removed before the error is
//! returned.
//!
//! ```rust,no_run
//! use ephemeral_services::provision::{Provisioner, ServiceHandle};
//! use ephemeral_services::services::redis;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let provisioner = Provisioner::from_env().await?;
//! let redis = redis::run(&provisioner, &CancellationToken::new(), &[]).await?;
//! println!("redis at {}", redis.url());
//! redis.terminate().await?;
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod image;
pub mod provision;
pub mod readiness;
pub mod runtime;
pub mod services;
pub mod spec;
pub mod testing;

pub use config::ProvisionConfig;
pub use error::{ConfigError, ProvisionError, RuntimeError};
pub use provision::{Provisioner, ServiceHandle};
pub use spec::Customization;
