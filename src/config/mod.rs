//! Process configuration for provisioning.
//!
//! Everything is resolved once, up front, and then injected into the
//! [`Provisioner`](crate::provision::Provisioner). Nothing here is a global.

mod helpers;

use std::time::Duration;

use crate::error::ConfigError;

use helpers::{optional_env, parse_bool_env, parse_optional_env};

/// Registry mirror that image identifiers are rewritten to.
pub const MIRROR_ENV: &str = "DOCKER_PROXY";
/// Override for the sing-box image.
pub const SINGBOX_IMAGE_ENV: &str = "SINGBOX_IMAGE";
/// Host name to report in coordinates instead of the runtime's own.
pub const HOST_OVERRIDE_ENV: &str = "PROVISION_HOST_OVERRIDE";
/// Whether missing images are pulled automatically.
pub const AUTO_PULL_ENV: &str = "PROVISION_AUTO_PULL";
/// Upper bound on best-effort teardown after a failure, in seconds.
pub const TEARDOWN_TIMEOUT_ENV: &str = "PROVISION_TEARDOWN_TIMEOUT_SECS";

/// Provisioning configuration.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Pull-through registry mirror. `None` disables image rewriting.
    pub mirror: Option<String>,
    /// sing-box image replacing the built-in default.
    pub singbox_image: Option<String>,
    /// Host reported in coordinates.
    pub host_override: Option<String>,
    /// Pull images that are not present locally.
    pub auto_pull: bool,
    /// How long teardown may take before it is abandoned.
    pub teardown_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            mirror: None,
            singbox_image: None,
            host_override: None,
            auto_pull: true,
            teardown_timeout: Duration::from_secs(30),
        }
    }
}

impl ProvisionConfig {
    /// Resolve configuration from the environment, loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve()
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            mirror: optional_env(MIRROR_ENV)?.map(|m| m.trim().to_string()),
            singbox_image: optional_env(SINGBOX_IMAGE_ENV)?,
            host_override: optional_env(HOST_OVERRIDE_ENV)?,
            auto_pull: parse_bool_env(AUTO_PULL_ENV, defaults.auto_pull)?,
            teardown_timeout: Duration::from_secs(parse_optional_env(
                TEARDOWN_TIMEOUT_ENV,
                defaults.teardown_timeout.as_secs(),
            )?),
        })
    }

    /// Set the registry mirror.
    pub fn with_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.mirror = Some(mirror.into());
        self
    }

    /// Set the reported host.
    pub fn with_host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            for key in [
                MIRROR_ENV,
                SINGBOX_IMAGE_ENV,
                HOST_OVERRIDE_ENV,
                AUTO_PULL_ENV,
                TEARDOWN_TIMEOUT_ENV,
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_when_unset() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = ProvisionConfig::resolve().expect("resolve should succeed");
        assert!(config.mirror.is_none());
        assert!(config.singbox_image.is_none());
        assert!(config.auto_pull);
        assert_eq!(config.teardown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_values_from_env() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var(MIRROR_ENV, " mirror.example.com ");
            std::env::set_var(AUTO_PULL_ENV, "FALSE");
            std::env::set_var(TEARDOWN_TIMEOUT_ENV, "5");
        }

        let config = ProvisionConfig::resolve().expect("resolve should succeed");
        assert_eq!(config.mirror.as_deref(), Some("mirror.example.com"));
        assert!(!config.auto_pull);
        assert_eq!(config.teardown_timeout, Duration::from_secs(5));

        clear_env();
    }

    #[test]
    fn test_empty_mirror_disables_rewriting() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var(MIRROR_ENV, "");
        }

        let config = ProvisionConfig::resolve().expect("resolve should succeed");
        assert!(config.mirror.is_none());

        clear_env();
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var(AUTO_PULL_ENV, "sometimes");
        }

        let result = ProvisionConfig::resolve();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == AUTO_PULL_ENV
        ));

        clear_env();
    }
}
