//! Shared reference to one running sandbox instance.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RuntimeError;
use crate::runtime::{ExecOutput, SandboxRuntime};
use crate::spec::ContainerPort;

/// Characters of log output attached to readiness errors.
pub const LOG_EXCERPT_LIMIT: usize = 2000;

/// A sandbox instance created by the [`Provisioner`](super::Provisioner).
///
/// Cloning is cheap; every clone refers to the same instance. The caller owns
/// the instance once a handle is returned and must call
/// [`terminate`](Self::terminate) when done with it.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    name: String,
    service: String,
    runtime: Arc<dyn SandboxRuntime>,
    terminated: AtomicBool,
}

impl Container {
    pub(crate) fn new(
        id: String,
        name: String,
        service: impl Into<String>,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                name,
                service: service.into(),
                runtime,
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Runtime identifier of the instance.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Unique name the instance was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the service launched in the instance.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub async fn host(&self) -> Result<String, RuntimeError> {
        self.inner.runtime.host(&self.inner.id).await
    }

    pub async fn mapped_port(&self, port: impl Into<ContainerPort>) -> Result<u16, RuntimeError> {
        self.inner
            .runtime
            .mapped_port(&self.inner.id, port.into())
            .await
    }

    pub async fn is_running(&self) -> Result<bool, RuntimeError> {
        self.inner.runtime.is_running(&self.inner.id).await
    }

    pub async fn logs(&self) -> Result<Vec<u8>, RuntimeError> {
        self.inner.runtime.logs(&self.inner.id).await
    }

    /// The first [`LOG_EXCERPT_LIMIT`] characters of the logs, or `None` if
    /// they cannot be read.
    pub async fn log_excerpt(&self) -> Option<String> {
        match self.logs().await {
            Ok(bytes) => Some(excerpt(&String::from_utf8_lossy(&bytes))),
            Err(e) => {
                tracing::debug!("Could not read logs of {}: {}", self.name(), e);
                None
            }
        }
    }

    /// Run a command inside the instance.
    pub async fn exec<S: AsRef<str>>(&self, cmd: &[S]) -> Result<ExecOutput, RuntimeError> {
        let cmd: Vec<String> = cmd.iter().map(|s| s.as_ref().to_string()).collect();
        self.inner.runtime.exec(&self.inner.id, &cmd).await
    }

    /// Write a file into the instance.
    pub async fn copy_file(
        &self,
        container_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RuntimeError> {
        self.inner
            .runtime
            .copy_file(&self.inner.id, container_path, contents, mode)
            .await
    }

    pub(crate) async fn connect_network(&self, network: &str) -> Result<(), RuntimeError> {
        self.inner.runtime.connect_network(&self.inner.id, network).await
    }

    pub(crate) async fn start(&self) -> Result<(), RuntimeError> {
        self.inner.runtime.start(&self.inner.id).await
    }

    /// Stop and remove the instance. Calling it again after success is a
    /// no-op.
    pub async fn terminate(&self) -> Result<(), RuntimeError> {
        if self.is_terminated() {
            return Ok(());
        }

        tracing::info!("Terminating {} container {}", self.service(), self.name());
        self.inner.runtime.terminate(&self.inner.id).await?;
        self.inner.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("service", &self.inner.service)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::SeqCst) {
            tracing::warn!(
                "Container '{}' dropped without terminate(), it may remain running",
                self.name
            );
        }
    }
}

/// Cut `logs` to [`LOG_EXCERPT_LIMIT`] characters.
pub(crate) fn excerpt(logs: &str) -> String {
    match logs.char_indices().nth(LOG_EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}\n... (truncated)", &logs[..cut]),
        None => logs.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_short_logs_untouched() {
        assert_eq!(excerpt("ready\n"), "ready\n");
        assert_eq!(excerpt(""), "");
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let logs = "é".repeat(LOG_EXCERPT_LIMIT + 10);
        let cut = excerpt(&logs);
        assert!(cut.ends_with("\n... (truncated)"));
        assert_eq!(
            cut.trim_end_matches("\n... (truncated)").chars().count(),
            LOG_EXCERPT_LIMIT
        );
    }
}
