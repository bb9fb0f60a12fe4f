//! Image identifier rewriting for pull-through registry mirrors.
//!
//! When a mirror is configured every image is pulled through it:
//! `redis:7.2.2-alpine` becomes `mirror.example.com/redis:7.2.2-alpine`, and
//! a well-known public registry prefix (`docker.io/`, `ghcr.io/`) is dropped
//! first so the mirror sees the path it proxies.

use std::borrow::Cow;

use url::Url;

use crate::error::ConfigError;

/// Registry prefixes removed before joining with the mirror.
pub const WELL_KNOWN_PREFIXES: &[&str] = &["docker.io/", "ghcr.io/"];

/// Rewrites image identifiers onto an optional registry mirror.
#[derive(Debug, Clone, Default)]
pub struct ImageRewriter {
    mirror: Option<String>,
}

impl ImageRewriter {
    /// Create a rewriter. `None` (or a blank mirror) disables rewriting.
    ///
    /// A mirror that is not a usable URL is rejected here, once, so that
    /// [`rewrite`](Self::rewrite) itself cannot fail.
    pub fn new(mirror: Option<&str>) -> Result<Self, ConfigError> {
        let mirror = match mirror.map(str::trim) {
            None | Some("") => None,
            Some(m) => {
                validate_mirror(m)?;
                Some(m.trim_end_matches('/').to_string())
            }
        };
        Ok(Self { mirror })
    }

    /// A rewriter that leaves every identifier untouched.
    pub fn disabled() -> Self {
        Self { mirror: None }
    }

    /// The configured mirror, without trailing slash.
    pub fn mirror(&self) -> Option<&str> {
        self.mirror.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.mirror.is_some()
    }

    /// Map a nominal image identifier to the one that is actually pulled.
    ///
    /// Identifiers already under the mirror are returned unchanged, so
    /// rewriting is idempotent.
    pub fn rewrite(&self, image: &str) -> String {
        let Some(mirror) = self.mirror.as_deref() else {
            return image.to_string();
        };

        if image
            .strip_prefix(mirror)
            .is_some_and(|rest| rest.starts_with('/'))
        {
            return image.to_string();
        }

        let stripped = WELL_KNOWN_PREFIXES
            .iter()
            .find_map(|prefix| {
                image.strip_prefix(prefix).inspect(|_| {
                    tracing::debug!("Trimmed registry prefix {} from {}", prefix, image);
                })
            })
            .unwrap_or(image);

        let target = format!("{}/{}", mirror, stripped.trim_start_matches('/'));
        tracing::debug!("Rewrote image {} to {}", image, target);
        target
    }
}

fn validate_mirror(mirror: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidMirror {
        value: mirror.to_string(),
        reason,
    };

    // Registry references are usually scheme-less (`host[:port][/path]`).
    let candidate: Cow<'_, str> = if mirror.contains("://") {
        Cow::Borrowed(mirror)
    } else {
        Cow::Owned(format!("https://{mirror}"))
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed".to_string()));
    }
    Ok(())
}
