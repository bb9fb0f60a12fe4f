//! Capability detection for proxy daemons configured by a JSON document.
//!
//! The proxy's listening ports are not fixed: they come from the `inbounds`
//! the caller declared. A single pass over the inbounds classifies them:
//!
//! | inbound type | effect                                            |
//! |--------------|---------------------------------------------------|
//! | `socks`      | SOCKS5 port, if not already set                   |
//! | `http`       | HTTP port, if not already set                     |
//! | `mixed`      | both SOCKS5 and HTTP port, each only if unset     |
//! | `tun`        | tunnel interface present                          |
//! | other        | ignored                                           |
//!
//! The first inbound of a kind wins. A document that yields no port and no
//! tunnel has no usable capability and cannot be launched.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::spec::ContainerPort;

/// Inbound types the detector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    Socks,
    Http,
    Mixed,
    Tun,
    #[default]
    #[serde(other)]
    Other,
}

impl InboundKind {
    /// Whether inbounds of this kind listen on a port.
    pub fn is_port_bearing(&self) -> bool {
        matches!(self, InboundKind::Socks | InboundKind::Http | InboundKind::Mixed)
    }
}

/// One declared inbound.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type", default)]
    pub kind: InboundKind,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ProxyDocument {
    // `"inbounds": null` means the same as no inbounds.
    #[serde(default)]
    inbounds: Option<Vec<Inbound>>,
}

/// What a proxy configuration offers to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// All declared inbounds, in document order.
    pub inbounds: Vec<Inbound>,
    pub socks_port: Option<u16>,
    pub http_port: Option<u16>,
    /// A tunnel interface is declared.
    pub tunnel: bool,
}

impl Capabilities {
    /// Classify the inbounds of a parsed document.
    pub fn from_inbounds(inbounds: Vec<Inbound>) -> Result<Self, ConfigError> {
        let mut socks_port = None;
        let mut http_port = None;
        let mut tunnel = false;

        for (index, inbound) in inbounds.iter().enumerate() {
            tracing::debug!(
                "Inbound {}: type={:?}, listen_port={:?}",
                index,
                inbound.kind,
                inbound.listen_port
            );

            let port = inbound.listen_port.filter(|p| *p != 0);
            match (inbound.kind, port) {
                (InboundKind::Socks, Some(port)) => {
                    socks_port.get_or_insert(port);
                }
                (InboundKind::Http, Some(port)) => {
                    http_port.get_or_insert(port);
                }
                (InboundKind::Mixed, Some(port)) => {
                    socks_port.get_or_insert(port);
                    http_port.get_or_insert(port);
                }
                (InboundKind::Tun, _) => tunnel = true,
                (kind, None) if kind.is_port_bearing() => {
                    tracing::warn!("Ignoring {:?} inbound {} without listen_port", kind, index);
                }
                _ => {}
            }
        }

        if socks_port.is_none() && http_port.is_none() && !tunnel {
            return Err(ConfigError::NoUsableCapability);
        }

        Ok(Self {
            inbounds,
            socks_port,
            http_port,
            tunnel,
        })
    }

    /// Parse and classify a JSON configuration document.
    pub fn from_document(path: &Path, document: &str) -> Result<Self, ConfigError> {
        let parsed: ProxyDocument =
            serde_json::from_str(document).map_err(|e| ConfigError::InvalidDocument {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let inbounds = parsed.inbounds.unwrap_or_default();
        tracing::debug!("Found {} inbounds in {}", inbounds.len(), path.display());
        Self::from_inbounds(inbounds)
    }

    /// Read, parse and classify a configuration file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let document =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::MissingFile {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
        Self::from_document(path, &document)
    }

    /// Ports to publish: SOCKS5 first, then HTTP when it differs.
    pub fn ports(&self) -> Vec<ContainerPort> {
        let mut ports = Vec::with_capacity(2);
        for port in [self.socks_port, self.http_port].into_iter().flatten() {
            let port = ContainerPort::tcp(port);
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }

    /// A tunnel interface needs elevated sandbox privileges.
    pub fn requires_privilege(&self) -> bool {
        self.tunnel
    }

    /// `(socks_port, http_port, tunnel)`.
    pub fn summary(&self) -> (Option<u16>, Option<u16>, bool) {
        (self.socks_port, self.http_port, self.tunnel)
    }
}
