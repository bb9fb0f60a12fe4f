//! Polling loop that waits for a readiness strategy to hold.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::{Phase, ProvisionError, RuntimeError};
use crate::provision::Container;
use crate::provision::coordinates::authority;
use crate::readiness::{StatusMatcher, WaitStrategy};
use crate::spec::{ContainerPort, Protocol};

/// Upper bound for one probe attempt.
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for one TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Block until `strategy` holds for `container` or its timeout elapses.
///
/// The instance is also checked between polls: one that has exited fails
/// immediately with its logs attached.
pub(crate) async fn wait_until_ready(
    container: &Container,
    strategy: &WaitStrategy,
) -> Result<(), ProvisionError> {
    let timeout = strategy.timeout();
    let interval = strategy.poll_interval();
    let start = Instant::now();

    let prober =
        Prober::new(strategy).map_err(|e| ProvisionError::acquisition(Phase::Ready, e))?;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = timeout.saturating_sub(start.elapsed());
        let attempt = tokio::time::timeout(
            remaining.min(PROBE_ATTEMPT_TIMEOUT),
            prober.probe(container, strategy),
        )
        .await;

        match attempt {
            Ok(Ok(true)) => {
                tracing::info!(
                    "{} ready after {:?} ({}, {} attempts)",
                    container.name(),
                    start.elapsed(),
                    strategy,
                    attempts
                );
                return Ok(());
            }
            Ok(Ok(false)) => tracing::trace!("{}: {} not yet satisfied", container.name(), strategy),
            Ok(Err(e)) => tracing::trace!("{}: probe error: {}", container.name(), e),
            Err(_) => tracing::trace!("{}: probe attempt timed out", container.name()),
        }

        let running = container
            .is_running()
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Ready, e))?;
        if !running {
            return Err(ProvisionError::Readiness {
                reason: format!("container {} exited while waiting for {}", container.name(), strategy),
                logs: container.log_excerpt().await,
            });
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProvisionError::ReadinessTimeout {
                strategy: strategy.to_string(),
                timeout,
                logs: container.log_excerpt().await,
            });
        }

        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Per-wait state shared across polls.
struct Prober {
    http: Option<reqwest::Client>,
}

impl Prober {
    fn new(strategy: &WaitStrategy) -> Result<Self, RuntimeError> {
        let http = match strategy {
            WaitStrategy::HttpStatus { .. } => Some(
                reqwest::Client::builder()
                    .timeout(PROBE_ATTEMPT_TIMEOUT)
                    .build()
                    .map_err(|e| RuntimeError::ProbeSetupFailed {
                        strategy: strategy.to_string(),
                        reason: e.to_string(),
                    })?,
            ),
            _ => None,
        };
        Ok(Self { http })
    }

    async fn probe(
        &self,
        container: &Container,
        strategy: &WaitStrategy,
    ) -> Result<bool, RuntimeError> {
        match strategy {
            WaitStrategy::ListeningPort { port, .. } => listening_port(container, *port).await,
            WaitStrategy::HttpStatus {
                port, path, status, ..
            } => match &self.http {
                Some(client) => http_status(client, container, *port, path, status).await,
                None => Err(RuntimeError::ProbeSetupFailed {
                    strategy: strategy.to_string(),
                    reason: "no HTTP client".to_string(),
                }),
            },
            WaitStrategy::LogPattern {
                pattern,
                occurrences,
                ..
            } => {
                let logs = container.logs().await?;
                let found = String::from_utf8_lossy(&logs)
                    .matches(pattern.as_str())
                    .count();
                Ok(found >= *occurrences)
            }
            #[cfg(feature = "postgres")]
            WaitStrategy::Sql { port, url, .. } => {
                let host = container.host().await?;
                let mapped = container.mapped_port(*port).await?;
                Ok(sql_select_one(&url.build(&host, mapped)).await)
            }
            WaitStrategy::Exec { cmd, matcher, .. } => {
                let output = container.exec(cmd.as_slice()).await?;
                Ok(matcher.matches(&output))
            }
        }
    }
}

/// The mapped port accepts connections and the port is bound inside.
///
/// Docker's userland proxy accepts connections before the service listens,
/// so a successful external connect alone proves nothing.
async fn listening_port(container: &Container, port: ContainerPort) -> Result<bool, RuntimeError> {
    let host = container.host().await?;
    let mapped = container.mapped_port(port).await?;

    if port.protocol == Protocol::Tcp && !tcp_connect(&host, mapped).await {
        return Ok(false);
    }

    let check = internal_listen_check(port);
    let output = container.exec(check.as_slice()).await?;
    match output.exit_code {
        0 => Ok(true),
        // `sh` cannot be run in the image; the external check has to do.
        126 | 127 => Ok(port.protocol == Protocol::Tcp),
        _ => Ok(false),
    }
}

/// Shell check that exits 0 when `port` is bound inside the sandbox and 1
/// otherwise. It never exits 126 or 127, so those codes only mean `sh`
/// itself could not be run.
fn internal_listen_check(port: ContainerPort) -> Vec<String> {
    // Column 2 is local_address, column 4 the socket state (0A = LISTEN).
    let (table, state) = match port.protocol {
        Protocol::Tcp => ("tcp", "0A"),
        Protocol::Udp => ("udp", "07"),
    };
    let mut script = format!(
        "if cat /proc/net/{table} /proc/net/{table}6 2>/dev/null \
         | grep -qiE '^ *[0-9]+: [0-9A-F]+:{:04X} [0-9A-F]+:[0-9A-F]+ {state}'; \
         then exit 0; fi; ",
        port.port
    );
    if port.protocol == Protocol::Tcp {
        script.push_str(&format!(
            "if command -v nc >/dev/null 2>&1; then nc -z localhost {} && exit 0; fi; ",
            port.port
        ));
    }
    script.push_str("exit 1");
    vec!["sh".to_string(), "-c".to_string(), script]
}

async fn tcp_connect(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn http_status(
    client: &reqwest::Client,
    container: &Container,
    port: ContainerPort,
    path: &str,
    status: &StatusMatcher,
) -> Result<bool, RuntimeError> {
    let host = container.host().await?;
    let mapped = container.mapped_port(port).await?;
    let url = format!(
        "http://{}/{}",
        authority(&host, mapped),
        path.trim_start_matches('/')
    );

    match client.get(&url).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            tracing::trace!("GET {} -> {}", url, code);
            Ok(status.matches(code))
        }
        Err(e) => {
            // Connection refused is expected during startup
            if !e.is_connect() {
                tracing::trace!("GET {} failed: {}", url, e);
            }
            Ok(false)
        }
    }
}

#[cfg(feature = "postgres")]
async fn sql_select_one(url: &str) -> bool {
    let (client, connection) = match tokio_postgres::connect(url, tokio_postgres::NoTls).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::trace!("SQL connect failed: {}", e);
            return false;
        }
    };

    let driver = tokio::spawn(connection);
    let ok = client.simple_query("SELECT 1").await.is_ok();
    drop(client);
    driver.abort();
    ok
}
