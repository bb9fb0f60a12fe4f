//! Externally reachable coordinates of a ready instance.

use std::collections::BTreeMap;

use crate::error::{Phase, ProvisionError, Result, RuntimeError};
use crate::provision::Container;
use crate::spec::ContainerPort;

/// Host and mapped ports of a ready instance.
///
/// Only built after readiness, and only when every exposed port resolved.
#[derive(Debug, Clone)]
pub struct Coordinates {
    container: Container,
    host: String,
    ports: BTreeMap<ContainerPort, u16>,
}

impl Coordinates {
    /// Query the runtime for the host and the mapping of every port.
    ///
    /// One unresolvable port fails the whole resolution.
    pub(crate) async fn resolve(container: &Container, ports: &[ContainerPort]) -> Result<Self> {
        let host = container
            .host()
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Resolve, e))?;

        let mut mapped = BTreeMap::new();
        for port in ports {
            let host_port = container
                .mapped_port(*port)
                .await
                .map_err(|e| ProvisionError::acquisition(Phase::Resolve, e))?;
            tracing::debug!("{} {} -> {}:{}", container.name(), port, host, host_port);
            mapped.insert(*port, host_port);
        }

        Ok(Self {
            container: container.clone(),
            host,
            ports: mapped,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Mapped port for an internal port.
    pub fn port(&self, port: impl Into<ContainerPort>) -> Option<u16> {
        self.ports.get(&port.into()).copied()
    }

    /// Like [`port`](Self::port), failing when the port was not exposed.
    pub fn require(&self, port: impl Into<ContainerPort>) -> Result<u16> {
        let port = port.into();
        self.port(port).ok_or_else(|| {
            ProvisionError::acquisition(
                Phase::Resolve,
                RuntimeError::PortNotMapped {
                    id: self.container.id().to_string(),
                    port: port.to_string(),
                },
            )
        })
    }

    /// All resolved ports.
    pub fn ports(&self) -> &BTreeMap<ContainerPort, u16> {
        &self.ports
    }

    /// `host:port` for an internal port.
    pub fn address(&self, port: impl Into<ContainerPort>) -> Result<String> {
        Ok(authority(&self.host, self.require(port)?))
    }

    /// `scheme://host:port` for an internal port.
    pub fn url(&self, scheme: &str, port: impl Into<ContainerPort>) -> Result<String> {
        Ok(format!("{scheme}://{}", self.address(port)?))
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn into_container(self) -> Container {
        self.container
    }
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
