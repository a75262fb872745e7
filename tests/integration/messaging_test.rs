//! Two cluster members talking over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use keel::transport::{
    Address, CompressionAlgorithm, MessagingConfig, MessagingError, MessagingService,
};

fn member(compression: CompressionAlgorithm) -> MessagingService {
    let config = MessagingConfig {
        cluster_id: "integration".to_string(),
        port: 0,
        compression,
        ..Default::default()
    };
    MessagingService::new(config).unwrap()
}

async fn pair(compression: CompressionAlgorithm) -> (MessagingService, MessagingService) {
    let server = member(compression);
    let client = member(compression);
    server.start().await.unwrap();
    client.start().await.unwrap();
    (server, client)
}

#[tokio::test]
async fn test_concurrent_requests_on_pooled_connections() {
    let (server, client) = pair(CompressionAlgorithm::Lz4).await;
    server.register_async_handler("upper", |_sender: Address, payload: Bytes| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Bytes::from(payload.to_ascii_uppercase()))
    });

    let client = Arc::new(client);
    let address = server.address();
    let mut requests = Vec::new();
    for i in 0..64 {
        let client = Arc::clone(&client);
        let address = address.clone();
        requests.push(tokio::spawn(async move {
            let reply = client
                .request(&address, "upper", format!("message-{i}"))
                .await
                .unwrap();
            assert_eq!(reply, Bytes::from(format!("MESSAGE-{i}")));
        }));
    }
    for request in requests {
        request.await.unwrap();
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_large_payload_compressed() {
    let (server, client) = pair(CompressionAlgorithm::Gzip).await;
    server.register_sync_handler("length", |_sender: Address, payload: Bytes| {
        Ok(Bytes::from(payload.len().to_string()))
    });

    let payload = "abc".repeat(200_000);
    let reply = client
        .send_and_receive(&server.address(), "length", payload, false, None)
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from("600000"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_fire_and_forget_and_missing_handler() {
    let (server, client) = pair(CompressionAlgorithm::None).await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    server.register_handler("event", move |_sender: Address, _payload: Bytes| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..5 {
        client
            .send_async(&server.address(), "event", Bytes::from_static(b"tick"))
            .await
            .unwrap();
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received.load(Ordering::SeqCst), 5);

    let err = client
        .request(&server.address(), "nobody-listens", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoRemoteHandler(subject) if subject == "nobody-listens"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_member_fails_to_connect() {
    let client = member(CompressionAlgorithm::None);
    client.start().await.unwrap();

    // bind and drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = client
        .request(&Address::new("127.0.0.1", port), "anything", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::ConnectFailed { .. }), "{err}");

    client.stop().await;
}
