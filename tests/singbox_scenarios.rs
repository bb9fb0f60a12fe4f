//! sing-box launches driven by the inbounds of the mounted configuration.

use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ephemeral_services::config::ProvisionConfig;
use ephemeral_services::error::{ConfigError, ProvisionError};
use ephemeral_services::provision::{Provisioner, ServiceHandle};
use ephemeral_services::runtime::SandboxRuntime;
use ephemeral_services::services::singbox::{
    self, CONFIG_PATH, NETWORK_LABEL, create_network_with_mtu, with_config_file, with_networks,
};
use ephemeral_services::spec::ContainerPort;
use ephemeral_services::testing::{FakeOp, FakeRuntime, init_tracing};

fn write_config(dir: &tempfile::TempDir, document: &str) -> PathBuf {
    let path = dir.path().join("config.json");
    std::fs::write(&path, document).unwrap();
    path
}

fn provisioner(runtime: &Arc<FakeRuntime>) -> Provisioner {
    Provisioner::new(runtime.clone(), ProvisionConfig::default()).unwrap()
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn socks_and_http_inbounds_are_published() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{
            "log": {"level": "info"},
            "inbounds": [
                {"type": "socks", "tag": "socks-in", "listen": "0.0.0.0", "listen_port": 1080},
                {"type": "http", "tag": "http-in", "listen": "0.0.0.0", "listen_port": 8080}
            ],
            "outbounds": [{"type": "direct"}]
        }"#,
    );
    let (_socks, socks_port) = listener().await;
    let (_http, http_port) = listener().await;
    let runtime = Arc::new(
        FakeRuntime::new()
            .map_port(1080, socks_port)
            .map_port(8080, http_port),
    );

    let handle = singbox::run(
        &provisioner(&runtime),
        &CancellationToken::new(),
        &[with_config_file(&path)],
    )
    .await
    .unwrap();

    assert_eq!(
        handle.socks5_url.as_deref(),
        Some(format!("socks5://127.0.0.1:{socks_port}").as_str())
    );
    assert_eq!(
        handle.http_url.as_deref(),
        Some(format!("http://127.0.0.1:{http_port}").as_str())
    );
    assert_eq!(handle.socks5_port, Some(socks_port));
    assert_eq!(handle.http_port, Some(http_port));
    assert!(!handle.tunnel);

    let created = runtime.created();
    let spec = &created[0].spec;
    assert_eq!(
        spec.exposed_ports,
        vec![ContainerPort::tcp(1080), ContainerPort::tcp(8080)]
    );
    assert_eq!(spec.wait.as_ref().unwrap().port(), Some(ContainerPort::tcp(1080)));
    assert!(!spec.privileged);
    assert_eq!(created[0].files[0].container_path, CONFIG_PATH);

    handle.terminate().await.unwrap();
}

#[tokio::test]
async fn tun_only_runs_privileged_and_waits_for_interface() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{"inbounds": [{"type": "tun", "tag": "tun-in", "interface_name": "tun0"}]}"#,
    );
    let runtime = Arc::new(FakeRuntime::new().with_exec_output(
        0,
        "1: lo: <LOOPBACK,UP>\n5: tun0: <POINTOPOINT,UP> mtu 9000\n",
    ));

    let handle = singbox::run(
        &provisioner(&runtime),
        &CancellationToken::new(),
        &[with_config_file(&path)],
    )
    .await
    .unwrap();

    assert!(handle.tunnel);
    assert_eq!(handle.socks5_url, None);
    assert_eq!(handle.http_url, None);
    assert!(handle.coordinates().ports().is_empty());

    let spec = &runtime.created()[0].spec;
    assert!(spec.privileged);
    assert!(spec.exposed_ports.is_empty());
    assert!(runtime.calls(FakeOp::Exec) >= 1);

    handle.terminate().await.unwrap();
}

#[tokio::test]
async fn no_usable_inbound_fails_before_create() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{"inbounds": [{"type": "shadowsocks", "listen_port": 8388}]}"#,
    );
    let runtime = Arc::new(FakeRuntime::new());

    let err = singbox::run(
        &provisioner(&runtime),
        &CancellationToken::new(),
        &[with_config_file(&path)],
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::NoUsableCapability)
    ));
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn empty_inbounds_fail_before_create() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, r#"{"inbounds": []}"#);
    let runtime = Arc::new(FakeRuntime::new());

    let err = singbox::run(
        &provisioner(&runtime),
        &CancellationToken::new(),
        &[with_config_file(&path)],
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::NoUsableCapability)
    ));
    assert_eq!(runtime.calls(FakeOp::Create), 0);
}

#[tokio::test]
async fn missing_config_fails_before_create() {
    let runtime = Arc::new(FakeRuntime::new());

    let err = singbox::run(&provisioner(&runtime), &CancellationToken::new(), &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::MissingConfigFile { .. })
    ));
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn unreadable_config_fails_before_create() {
    let runtime = Arc::new(FakeRuntime::new());

    let err = singbox::run(
        &provisioner(&runtime),
        &CancellationToken::new(),
        &[with_config_file("/nonexistent/sing-box.json")],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ProvisionError::Config(_)));
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn mtu_network_is_created_and_removed() {
    let runtime = Arc::new(FakeRuntime::new());
    let provisioner = provisioner(&runtime);

    let network = create_network_with_mtu(&provisioner, 1400).await.unwrap();
    assert!(network.name().starts_with("singbox-mtu1400-"));

    let networks = runtime.networks();
    assert_eq!(networks.len(), 1);
    let (name, options) = &networks[0];
    assert_eq!(name, network.name());
    assert_eq!(options.driver, "bridge");
    assert_eq!(options.mtu, Some(1400));
    assert_eq!(options.labels.get(NETWORK_LABEL).map(String::as_str), Some("true"));

    // The network can be handed to a launch.
    let customization = with_networks([network.name()]);
    let spec = ephemeral_services::spec::LaunchSpec::default();
    let spec = customization.apply(spec).unwrap();
    assert_eq!(spec.networks, vec![network.name().to_string()]);

    let expected = network.name().to_string();
    network.remove().await.unwrap();
    assert_eq!(runtime.removed_networks(), vec![expected]);
}

#[tokio::test]
async fn network_failure_is_reported() {
    let runtime = Arc::new(FakeRuntime::new().fail(FakeOp::CreateNetwork));
    let provisioner = provisioner(&runtime);

    assert!(create_network_with_mtu(&provisioner, 1280).await.is_err());
    assert!(runtime.networks().is_empty());

    // Runtime stays usable for direct calls.
    let runtime: Arc<dyn SandboxRuntime> = runtime;
    assert!(runtime.remove_network("unknown").await.is_ok());
}
