//! Kafka in KRaft mode on the confluent-local image.
//!
//! The advertised listener must carry the mapped host port, which only
//! exists once the container has started. The container therefore starts on
//! an entrypoint that waits for a start script, and the script is uploaded
//! from [`Service::after_start`] with the resolved address filled in.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Phase, ProvisionError, Result};
use crate::image::ImageRewriter;
use crate::provision::coordinates::authority;
use crate::provision::{Container, Coordinates, LaunchPlan, Provisioner, Service, ServiceHandle};
use crate::readiness::{ReadinessPolicy, WaitStrategy};
use crate::spec::{ContainerPort, Customization, LaunchSpec, LaunchSpecBuilder};

pub const DEFAULT_IMAGE: &str = "confluentinc/confluent-local:7.6.0";
/// Listener published to clients.
pub const PORT: ContainerPort = ContainerPort::tcp(9093);

pub const CLUSTER_ID: &str = "kraftCluster";
const STARTER_SCRIPT: &str = "/usr/sbin/testcontainers_start.sh";
const READY_LOG: &str = "Kafka Server started";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// KRaft single-node broker and controller configuration.
const KRAFT_ENV: [(&str, &str); 16] = [
    (
        "KAFKA_LISTENERS",
        "PLAINTEXT://0.0.0.0:9093,BROKER://0.0.0.0:9092,CONTROLLER://0.0.0.0:9094",
    ),
    (
        "KAFKA_REST_BOOTSTRAP_SERVERS",
        "PLAINTEXT://0.0.0.0:9093,BROKER://0.0.0.0:9092,CONTROLLER://0.0.0.0:9094",
    ),
    (
        "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP",
        "BROKER:PLAINTEXT,PLAINTEXT:PLAINTEXT,CONTROLLER:PLAINTEXT",
    ),
    ("KAFKA_INTER_BROKER_LISTENER_NAME", "BROKER"),
    ("KAFKA_BROKER_ID", "1"),
    ("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1"),
    ("KAFKA_OFFSETS_TOPIC_NUM_PARTITIONS", "1"),
    ("KAFKA_TRANSACTION_STATE_LOG_MIN_ISR", "1"),
    ("KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR", "1"),
    ("KAFKA_LOG_FLUSH_INTERVAL_MESSAGES", "9223372036854775807"),
    ("KAFKA_GROUP_INITIAL_REBALANCE_DELAY_MS", "0"),
    ("KAFKA_NODE_ID", "1"),
    ("KAFKA_PROCESS_ROLES", "broker,controller"),
    ("KAFKA_CONTROLLER_LISTENER_NAMES", "CONTROLLER"),
    ("KAFKA_CONTROLLER_QUORUM_VOTERS", "1@localhost:9094"),
    ("CLUSTER_ID", CLUSTER_ID),
];

/// Kafka launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kafka;

#[async_trait]
impl Service for Kafka {
    type Handle = KafkaHandle;

    fn name(&self) -> &str {
        "kafka"
    }

    fn launch_spec(&self, images: &ImageRewriter) -> LaunchSpecBuilder {
        let wait_for_script = format!(
            "while [ ! -f {STARTER_SCRIPT} ]; do sleep 0.1; done; bash {STARTER_SCRIPT}"
        );

        KRAFT_ENV.iter().fold(
            LaunchSpecBuilder::new(images.rewrite(DEFAULT_IMAGE))
                .expose(PORT)
                .entrypoint(["sh"])
                .default_cmd(["-c".to_string(), wait_for_script]),
            |builder, (key, value)| builder.default_env(*key, *value),
        )
    }

    fn readiness(&self, _spec: &LaunchSpec) -> ReadinessPolicy {
        ReadinessPolicy::Declared(WaitStrategy::log(READY_LOG, STARTUP_TIMEOUT))
    }

    async fn after_start(&self, container: &Container, _plan: &LaunchPlan) -> Result<()> {
        let host = container
            .host()
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Start, e))?;
        let port = container
            .mapped_port(PORT)
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Start, e))?;

        let script = starter_script(&authority(&host, port));
        tracing::debug!("Uploading Kafka start script advertising {}:{}", host, port);

        container
            .copy_file(STARTER_SCRIPT, script.as_bytes(), 0o755)
            .await
            .map_err(|e| ProvisionError::acquisition(Phase::Start, e))
    }

    fn handle(&self, _plan: &LaunchPlan, coordinates: Coordinates) -> Result<KafkaHandle> {
        let port = coordinates.require(PORT)?;
        Ok(KafkaHandle {
            brokers: vec![coordinates.address(PORT)?],
            port,
            coordinates,
        })
    }
}

fn starter_script(advertised: &str) -> String {
    format!(
        "#!/bin/bash\n\
         source /etc/confluent/docker/bash-config\n\
         export KAFKA_ADVERTISED_LISTENERS=PLAINTEXT://{advertised},BROKER://localhost:9092\n\
         echo Starting Kafka KRaft mode\n\
         sed -i '/KAFKA_ZOOKEEPER_CONNECT/d' /etc/confluent/docker/configure\n\
         echo 'kafka-storage format --ignore-formatted -t \"$(kafka-storage random-uuid)\" -c /etc/kafka/kafka.properties' >> /etc/confluent/docker/configure\n\
         echo '' > /etc/confluent/docker/ensure\n\
         /etc/confluent/docker/configure\n\
         /etc/confluent/docker/launch\n"
    )
}

/// A running Kafka broker.
#[derive(Debug, Clone)]
pub struct KafkaHandle {
    coordinates: Coordinates,
    /// Bootstrap `host:port` entries.
    pub brokers: Vec<String>,
    port: u16,
}

impl KafkaHandle {
    /// Brokers joined with `,`, as client configs expect.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ServiceHandle for KafkaHandle {
    fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }
}

/// Start a single-node Kafka and wait until the broker reports started.
pub async fn run(
    provisioner: &Provisioner,
    cancel: &CancellationToken,
    customizations: &[Customization],
) -> Result<KafkaHandle> {
    provisioner.run(&Kafka, cancel, customizations).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::with_env;

    #[test]
    fn test_kraft_defaults() {
        let spec = Kafka
            .launch_spec(&ImageRewriter::disabled())
            .build(&[with_env("KAFKA_NODE_ID", "3")])
            .unwrap();

        assert_eq!(spec.exposed_ports, vec![PORT]);
        assert_eq!(spec.entrypoint, Some(vec!["sh".to_string()]));
        assert_eq!(spec.env_var("KAFKA_PROCESS_ROLES"), Some("broker,controller"));
        assert_eq!(spec.env_var("KAFKA_NODE_ID"), Some("3"));
        assert!(spec.cmd.as_ref().unwrap()[1].contains(STARTER_SCRIPT));
    }

    #[test]
    fn test_starter_script_advertises_mapped_port() {
        let script = starter_script("localhost:49160");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains(
            "KAFKA_ADVERTISED_LISTENERS=PLAINTEXT://localhost:49160,BROKER://localhost:9092"
        ));
        assert!(script.ends_with("/etc/confluent/docker/launch\n"));
    }
}
