use std::time::Duration;

use super::*;
use crate::dispatcher::DispatcherMode;
use crate::protocol::{
    DeploymentRecord, Intent, ProcessInstanceCreationRecord, Record, RecordType, RecordValue,
    RejectionType, NO_KEY,
};
use crate::test_utils::one_task_process;

fn node_config() -> Config {
    let mut config = Config::for_test();
    config.messaging.cluster_id = "node-tests".to_string();
    config
}

fn client() -> MessagingService {
    let mut config = node_config().messaging;
    config.port = 0;
    match MessagingService::new(config) {
        Ok(service) => service,
        Err(e) => panic!("client config invalid: {e}"),
    }
}

async fn submit(client: &MessagingService, node: &Address, command: &Record) -> Record {
    let payload = serde_json::to_vec(command).unwrap();
    let reply = client
        .send_and_receive(node, COMMAND_SUBJECT, payload, true, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    serde_json::from_slice(&reply).unwrap()
}

fn deploy_command() -> Record {
    Record::command(
        NO_KEY,
        Intent::Create,
        RecordValue::Deployment(DeploymentRecord {
            resources: vec![one_task_process("order")],
            processes: Vec::new(),
        }),
    )
}

#[tokio::test]
async fn test_commands_over_transport() {
    let node = Node::start(node_config()).await.unwrap();
    let client = client();
    client.start().await.unwrap();

    let deployed = submit(&client, &node.address(), &deploy_command()).await;
    assert!(deployed.is_event());
    assert_eq!(deployed.intent(), Intent::Created);

    let create = Record::command(
        NO_KEY,
        Intent::Create,
        RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord::latest("order")),
    );
    let created = submit(&client, &node.address(), &create).await;
    assert!(created.is_event());
    assert!(created.key > 0);

    let unknown = Record::command(
        NO_KEY,
        Intent::Create,
        RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord::latest("missing")),
    );
    let rejected = submit(&client, &node.address(), &unknown).await;
    assert_eq!(rejected.record_type(), RecordType::CommandRejection);
    assert_eq!(rejected.metadata.rejection_type, Some(RejectionType::NotFound));

    assert_eq!(node.gateway().pending_requests(), 0);
    client.stop().await;
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_command_is_handler_failure() {
    let node = Node::start(node_config()).await.unwrap();
    let client = client();
    client.start().await.unwrap();

    let err = client
        .send_and_receive(&node.address(), COMMAND_SUBJECT, &b"not json"[..], true, None)
        .await
        .unwrap_err();
    match err {
        MessagingError::RemoteHandlerFailure(message) => {
            assert!(message.starts_with("malformed command"), "{message}")
        }
        other => panic!("unexpected error: {other}"),
    }

    client.stop().await;
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gateway_rejects_events() {
    let node = Node::start(node_config()).await.unwrap();

    let event = Record::event(NO_KEY, Intent::Created, deploy_command().value);
    let err = node.gateway().execute(event).await.unwrap_err();
    assert!(matches!(err, NodeError::InvalidCommand(_)));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exporting_node_and_peer_ping() {
    let mut config = node_config();
    config.dispatcher.mode = DispatcherMode::Pipeline;
    config.node.export_records = true;
    let first = Node::start(config).await.unwrap();

    let mut config = node_config();
    config.node.peers = vec![first.address().to_string(), "peer:notaport".to_string()];
    let second = Node::start(config).await.unwrap();

    let reachable = second.ping_peers().await;
    assert_eq!(reachable, vec![first.address()]);

    let deployed = first.gateway().execute(deploy_command()).await.unwrap();
    assert!(deployed.is_event());

    second.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
}
