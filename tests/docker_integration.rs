//! Launches against a real Docker daemon.
//!
//! Built only with `--features integration`. Needs a reachable daemon and
//! either network access or the images already present locally.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use ephemeral_services::config::ProvisionConfig;
use ephemeral_services::error::{Phase, ProvisionError};
use ephemeral_services::provision::{Provisioner, ServiceHandle};
use ephemeral_services::services::{minio, postgres, redis};
use ephemeral_services::spec::with_image;
use ephemeral_services::testing::init_tracing;

async fn provisioner() -> Provisioner {
    init_tracing();
    Provisioner::docker(ProvisionConfig::from_env().unwrap())
        .await
        .expect("Docker daemon must be reachable for integration tests")
}

#[tokio::test]
async fn redis_accepts_connections() {
    let provisioner = provisioner().await;
    let handle = redis::run(&provisioner, &CancellationToken::new(), &[])
        .await
        .unwrap();

    let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(handle.address()))
        .await
        .unwrap();
    assert!(stream.is_ok());
    assert!(handle.container().is_running().await.unwrap());

    handle.terminate().await.unwrap();
    assert!(!handle.container().is_running().await.unwrap_or(false));
}

#[tokio::test]
async fn postgres_answers_queries_with_custom_credentials() {
    let provisioner = provisioner().await;
    let handle = postgres::run(
        &provisioner,
        &CancellationToken::new(),
        &[
            postgres::with_username("tester"),
            postgres::with_password("p@ss word"),
            postgres::with_database("fixtures"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(handle.user(), "tester");
    assert_eq!(handle.database(), "fixtures");
    assert!(handle.uri().starts_with("postgres://tester:p%40ss%20word@"));

    let client = handle.sql().await.unwrap();
    let row = client.query_one("SELECT current_database()", &[]).await.unwrap();
    let name: String = row.get(0);
    assert_eq!(name, "fixtures");

    // The client is cached.
    let again = handle.sql().await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&client, &again));

    handle.terminate().await.unwrap();
}

#[tokio::test]
async fn minio_health_endpoint_is_up() {
    let provisioner = provisioner().await;
    let handle = minio::run(&provisioner, &CancellationToken::new(), &[])
        .await
        .unwrap();

    let response = reqwest::get(format!("{}/minio/health/live", handle.endpoint_url()))
        .await
        .unwrap();
    assert!(response.status().is_success());

    handle.terminate().await.unwrap();
}

#[tokio::test]
async fn unknown_image_fails_during_create() {
    let provisioner = provisioner().await;
    let err = redis::run(
        &provisioner,
        &CancellationToken::new(),
        &[with_image("ephemeral-services/does-not-exist:never")],
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Acquisition {
            phase: Phase::Create,
            ..
        }
    ));
}
