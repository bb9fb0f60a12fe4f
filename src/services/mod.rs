//! Service launchers.
//!
//! Each launcher implements [`Service`](crate::provision::Service) with its
//! image, ports, credentials and readiness policy, and exposes a `run`
//! function returning a typed handle.

pub mod clickhouse;
pub mod jaeger;
pub mod kafka;
pub mod localstack;
pub mod minio;
pub mod postgres;
pub mod redis;
pub mod singbox;
pub mod victoria_metrics;
pub mod xray;

use crate::error::ConfigError;
use crate::spec::{FileMount, LaunchSpec};

/// Effective value of `key`: the customized one, else `default`.
pub(crate) fn env_or(spec: &LaunchSpec, key: &str, default: &str) -> String {
    spec.env_var(key).unwrap_or(default).to_string()
}

/// The mount at `container_path`, which the service cannot start without.
pub(crate) fn required_file<'a>(
    spec: &'a LaunchSpec,
    service: &str,
    container_path: &str,
) -> Result<&'a FileMount, ConfigError> {
    spec.file_at(container_path)
        .ok_or_else(|| ConfigError::MissingConfigFile {
            service: service.to_string(),
            container_path: container_path.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DEFAULT_FILE_MODE, with_file};

    #[test]
    fn test_required_file() {
        let spec = LaunchSpec::default();
        assert!(matches!(
            required_file(&spec, "xray", "/etc/xray/config.json"),
            Err(ConfigError::MissingConfigFile { .. })
        ));

        let spec = with_file("/tmp/x.json", "/etc/xray/config.json", DEFAULT_FILE_MODE)
            .apply(spec)
            .unwrap();
        assert!(required_file(&spec, "xray", "/etc/xray/config.json").is_ok());
    }
}
