//! Readiness strategies and their selection.
//!
//! A sandbox is ready when an externally observable signal says so: a port
//! accepts connections, an HTTP endpoint answers with an acceptable status,
//! the logs contain a marker, a SQL query succeeds, or a command run inside
//! the sandbox prints what we expect. Readiness is never a fixed sleep.

mod probe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::Capabilities;
use crate::error::ConfigError;
use crate::runtime::ExecOutput;
use crate::spec::{ContainerPort, LaunchSpec};

pub(crate) use probe::wait_until_ready;

/// Default startup timeout.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness checks for strategies without their own.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Command listing network interfaces for the tunnel probe.
pub const TUNNEL_PROBE_CMD: &[&str] = &["ip", "addr", "show"];
/// Interval between tunnel probe polls.
pub const TUNNEL_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound for a tunnel interface to appear.
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Predicate over an HTTP status code.
#[derive(Clone)]
pub struct StatusMatcher(Arc<dyn Fn(u16) -> bool + Send + Sync>);

impl StatusMatcher {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Accept exactly `status`.
    pub fn exact(status: u16) -> Self {
        Self::new(move |s| s == status)
    }

    /// Accept any 2xx status.
    pub fn success() -> Self {
        Self::new(|s| (200..300).contains(&s))
    }

    pub fn matches(&self, status: u16) -> bool {
        (self.0)(status)
    }
}

impl fmt::Debug for StatusMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatusMatcher(..)")
    }
}

/// Predicate over the result of a command run inside the sandbox.
#[derive(Clone)]
pub struct OutputMatcher(Arc<dyn Fn(&ExecOutput) -> bool + Send + Sync>);

impl OutputMatcher {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ExecOutput) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Command exited with status 0.
    pub fn exit_success() -> Self {
        Self::new(ExecOutput::success)
    }

    /// Output contains `needle`, whatever the exit status.
    pub fn contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(move |out| out.output_lossy().contains(needle.as_str()))
    }

    pub fn matches(&self, output: &ExecOutput) -> bool {
        (self.0)(output)
    }
}

impl fmt::Debug for OutputMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputMatcher(..)")
    }
}

/// Builds a SQL connection URL from the mapped host and port.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct SqlUrl(Arc<dyn Fn(&str, u16) -> String + Send + Sync>);

#[cfg(feature = "postgres")]
impl SqlUrl {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, u16) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn build(&self, host: &str, port: u16) -> String {
        (self.0)(host, port)
    }
}

#[cfg(feature = "postgres")]
impl fmt::Debug for SqlUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SqlUrl(..)")
    }
}

/// The condition that marks a sandbox as ready.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// The port accepts TCP connections from outside and is bound inside.
    ListeningPort {
        port: ContainerPort,
        timeout: Duration,
    },
    /// `GET path` on the port answers with an accepted status.
    HttpStatus {
        port: ContainerPort,
        path: String,
        status: StatusMatcher,
        timeout: Duration,
    },
    /// The logs contain `pattern` at least `occurrences` times.
    LogPattern {
        pattern: String,
        occurrences: usize,
        timeout: Duration,
    },
    /// A PostgreSQL connection succeeds and answers `SELECT 1`.
    #[cfg(feature = "postgres")]
    Sql {
        port: ContainerPort,
        url: SqlUrl,
        timeout: Duration,
    },
    /// A command run inside the sandbox produces matching output.
    Exec {
        cmd: Vec<String>,
        matcher: OutputMatcher,
        poll_interval: Duration,
        timeout: Duration,
    },
}

impl WaitStrategy {
    pub fn listening_port(port: ContainerPort, timeout: Duration) -> Self {
        Self::ListeningPort { port, timeout }
    }

    /// HTTP probe accepting `200 OK`.
    pub fn http(port: ContainerPort, path: impl Into<String>, timeout: Duration) -> Self {
        Self::HttpStatus {
            port,
            path: path.into(),
            status: StatusMatcher::exact(200),
            timeout,
        }
    }

    pub fn log(pattern: impl Into<String>, timeout: Duration) -> Self {
        Self::LogPattern {
            pattern: pattern.into(),
            occurrences: 1,
            timeout,
        }
    }

    #[cfg(feature = "postgres")]
    pub fn sql(port: ContainerPort, url: SqlUrl, timeout: Duration) -> Self {
        Self::Sql { port, url, timeout }
    }

    pub fn exec<I, S>(cmd: I, matcher: OutputMatcher, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec {
            cmd: cmd.into_iter().map(Into::into).collect(),
            matcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    /// Polls `ip addr show` until an interface named like `tun` appears.
    pub fn tunnel_interface() -> Self {
        Self::Exec {
            cmd: TUNNEL_PROBE_CMD.iter().map(|s| s.to_string()).collect(),
            matcher: OutputMatcher::contains("tun"),
            poll_interval: TUNNEL_POLL_INTERVAL,
            timeout: TUNNEL_TIMEOUT,
        }
    }

    /// Replace the timeout.
    pub fn with_timeout(mut self, new_timeout: Duration) -> Self {
        match &mut self {
            Self::ListeningPort { timeout, .. }
            | Self::HttpStatus { timeout, .. }
            | Self::LogPattern { timeout, .. }
            | Self::Exec { timeout, .. } => *timeout = new_timeout,
            #[cfg(feature = "postgres")]
            Self::Sql { timeout, .. } => *timeout = new_timeout,
        }
        self
    }

    /// Replace the accepted HTTP statuses. No effect on other strategies.
    pub fn with_status(mut self, matcher: StatusMatcher) -> Self {
        if let Self::HttpStatus { status, .. } = &mut self {
            *status = matcher;
        }
        self
    }

    /// Require the log pattern this many times. No effect on other strategies.
    pub fn with_occurrences(mut self, count: usize) -> Self {
        if let Self::LogPattern { occurrences, .. } = &mut self {
            *occurrences = count.max(1);
        }
        self
    }

    /// Replace the poll interval. No effect on strategies without one.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let Self::Exec { poll_interval, .. } = &mut self {
            *poll_interval = interval;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::ListeningPort { timeout, .. }
            | Self::HttpStatus { timeout, .. }
            | Self::LogPattern { timeout, .. }
            | Self::Exec { timeout, .. } => *timeout,
            #[cfg(feature = "postgres")]
            Self::Sql { timeout, .. } => *timeout,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        match self {
            Self::Exec { poll_interval, .. } => *poll_interval,
            _ => DEFAULT_POLL_INTERVAL,
        }
    }

    /// The sandbox port this strategy probes, if any.
    pub fn port(&self) -> Option<ContainerPort> {
        match self {
            Self::ListeningPort { port, .. } | Self::HttpStatus { port, .. } => Some(*port),
            #[cfg(feature = "postgres")]
            Self::Sql { port, .. } => Some(*port),
            Self::LogPattern { .. } | Self::Exec { .. } => None,
        }
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListeningPort { port, .. } => write!(f, "listening port {port}"),
            Self::HttpStatus { port, path, .. } => write!(f, "HTTP GET {path} on {port}"),
            Self::LogPattern {
                pattern,
                occurrences,
                ..
            } => write!(f, "log pattern {pattern:?} x{occurrences}"),
            #[cfg(feature = "postgres")]
            Self::Sql { port, .. } => write!(f, "SQL probe on {port}"),
            Self::Exec { cmd, .. } => write!(f, "exec probe `{}`", cmd.join(" ")),
        }
    }
}

/// How a service wants readiness decided when the caller did not choose.
#[derive(Debug, Clone)]
pub enum ReadinessPolicy {
    /// A service-specific strategy.
    Declared(WaitStrategy),
    /// Listening-port probe on the first exposed port. Without any port, a
    /// detected tunnel interface is polled for instead.
    FirstExposedPort { timeout: Duration },
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::FirstExposedPort {
            timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// Choose the readiness strategy for a launch.
///
/// A strategy already on the specification is the caller's and is kept.
/// Fails before launch when no observable signal exists or when the chosen
/// strategy probes a port that is not exposed.
pub fn select(
    spec: &LaunchSpec,
    policy: &ReadinessPolicy,
    capabilities: Option<&Capabilities>,
) -> Result<WaitStrategy, ConfigError> {
    let strategy = match (&spec.wait, policy) {
        (Some(explicit), _) => explicit.clone(),
        (None, ReadinessPolicy::Declared(strategy)) => strategy.clone(),
        (None, ReadinessPolicy::FirstExposedPort { timeout }) => {
            if let Some(port) = spec.exposed_ports.first() {
                WaitStrategy::listening_port(*port, *timeout)
            } else if capabilities.is_some_and(|c| c.tunnel) {
                WaitStrategy::tunnel_interface()
            } else {
                return Err(ConfigError::NoReadinessSignal {
                    reason: "no exposed port and no tunnel interface".to_string(),
                });
            }
        }
    };

    if let Some(port) = strategy.port()
        && !spec.exposed_ports.contains(&port)
    {
        return Err(ConfigError::InconsistentReadiness {
            port: port.to_string(),
        });
    }

    tracing::debug!("Selected readiness strategy: {}", strategy);
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Inbound, InboundKind};

    fn spec_with_ports(ports: &[u16]) -> LaunchSpec {
        LaunchSpec {
            image: "img".to_string(),
            exposed_ports: ports.iter().copied().map(ContainerPort::tcp).collect(),
            ..Default::default()
        }
    }

    fn tun_caps() -> Capabilities {
        Capabilities::from_inbounds(vec![Inbound {
            kind: InboundKind::Tun,
            tag: None,
            listen: None,
            listen_port: None,
        }])
        .unwrap()
    }

    #[test]
    fn test_explicit_strategy_never_overridden() {
        let mut spec = spec_with_ports(&[8428]);
        spec.wait = Some(WaitStrategy::log("ready", Duration::from_secs(5)));

        let chosen = select(
            &spec,
            &ReadinessPolicy::Declared(WaitStrategy::listening_port(
                ContainerPort::tcp(8428),
                Duration::from_secs(1),
            )),
            None,
        )
        .unwrap();
        assert!(matches!(chosen, WaitStrategy::LogPattern { .. }));
    }

    #[test]
    fn test_first_exposed_port_preferred() {
        let spec = spec_with_ports(&[1080, 8080]);
        let chosen = select(&spec, &ReadinessPolicy::default(), Some(&tun_caps())).unwrap();
        assert_eq!(chosen.port(), Some(ContainerPort::tcp(1080)));
        assert_eq!(chosen.timeout(), DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn test_tunnel_fallback() {
        let spec = spec_with_ports(&[]);
        let chosen = select(&spec, &ReadinessPolicy::default(), Some(&tun_caps())).unwrap();
        match chosen {
            WaitStrategy::Exec {
                cmd,
                poll_interval,
                timeout,
                ..
            } => {
                assert_eq!(cmd, vec!["ip", "addr", "show"]);
                assert_eq!(poll_interval, Duration::from_secs(1));
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("expected exec probe, got {other}"),
        }
    }

    #[test]
    fn test_no_signal_fails() {
        let spec = spec_with_ports(&[]);
        assert!(matches!(
            select(&spec, &ReadinessPolicy::default(), None),
            Err(ConfigError::NoReadinessSignal { .. })
        ));
    }

    #[test]
    fn test_declared_strategy_must_match_exposed_port() {
        let spec = spec_with_ports(&[9000]);
        let policy = ReadinessPolicy::Declared(WaitStrategy::http(
            ContainerPort::tcp(8123),
            "/ping",
            Duration::from_secs(5),
        ));
        assert!(matches!(
            select(&spec, &policy, None),
            Err(ConfigError::InconsistentReadiness { .. })
        ));
    }

    #[test]
    fn test_matchers() {
        let ok = ExecOutput {
            exit_code: 0,
            output: b"3: tun0: <POINTOPOINT,UP>".to_vec(),
        };
        let failed = ExecOutput {
            exit_code: 1,
            output: b"1: lo: <LOOPBACK,UP>".to_vec(),
        };

        assert!(OutputMatcher::contains("tun").matches(&ok));
        assert!(!OutputMatcher::contains("tun").matches(&failed));
        assert!(OutputMatcher::exit_success().matches(&ok));
        assert!(!OutputMatcher::exit_success().matches(&failed));

        assert!(StatusMatcher::exact(200).matches(200));
        assert!(!StatusMatcher::exact(200).matches(204));
        assert!(StatusMatcher::success().matches(204));
    }

    #[test]
    fn test_builders() {
        let strategy = WaitStrategy::log("started", Duration::from_secs(1))
            .with_occurrences(0)
            .with_timeout(Duration::from_secs(9));
        assert!(matches!(
            strategy,
            WaitStrategy::LogPattern { occurrences: 1, .. }
        ));
        assert_eq!(strategy.timeout(), Duration::from_secs(9));
        assert_eq!(strategy.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(strategy.to_string(), "log pattern \"started\" x1");
    }
}
