use dynamic_grpc::{
    CachedChannel, ChannelRegistry, ChannelState, DynamicGrpcError, HostPort, StaticBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tests::test_server::TestServer;
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

fn registry(backend: &Arc<StaticBackend>) -> ChannelRegistry {
    ChannelRegistry::builder()
        .shared_discovery_backend(backend.clone())
        .connect_timeout(Duration::from_secs(2))
        .build()
        .expect("failed to build registry")
}

fn endpoint(server: &TestServer) -> HostPort {
    HostPort::parse(server.address()).expect("invalid server address")
}

async fn serving(
    client: &mut HealthClient<CachedChannel<Channel>>,
    name: &str,
) -> Result<bool, tonic::Status> {
    let response = client
        .check(HealthCheckRequest {
            service: name.to_string(),
        })
        .await?;
    Ok(response.into_inner().status == ServingStatus::Serving as i32)
}

#[tokio::test]
async fn get_client_calls_the_discovered_server() {
    // Arrange
    let server = TestServer::start("orders-a").await;
    let backend = Arc::new(StaticBackend::new());
    backend.set_instances("orders", vec![endpoint(&server)]);
    let registry = registry(&backend);

    // Act
    let mut client = registry
        .get_client("orders", HealthClient::new)
        .await
        .expect("failed to resolve orders");

    // Assert
    assert!(serving(&mut client, server.name()).await.expect("health check failed"));
    assert_eq!(registry.state("orders").unwrap(), ChannelState::Cached);
}

#[tokio::test]
async fn repeated_lookups_reuse_the_channel_of_one_instance() {
    // Arrange
    let server_a = TestServer::start("orders-a").await;
    let server_b = TestServer::start("orders-b").await;
    let backend = Arc::new(StaticBackend::new());
    backend.set_instances("orders", vec![endpoint(&server_a), endpoint(&server_b)]);
    let registry = registry(&backend);

    // Act
    let first = registry.get_channel("orders").await.expect("failed to resolve orders");
    let second = registry.get_channel("orders").await.expect("failed to resolve orders");

    // Assert
    assert!(first.same_channel(&second));
    assert!([endpoint(&server_a), endpoint(&server_b)].contains(first.endpoint()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_share_one_connection() {
    // Arrange
    let server = TestServer::start("orders-a").await;
    let backend = Arc::new(StaticBackend::new());
    backend.set_instances("orders", vec![endpoint(&server)]);
    let registry = registry(&backend);

    // Act
    let lookups: Vec<_> = (0..20)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_channel("orders").await })
        })
        .collect();

    let mut channels = Vec::new();
    for lookup in lookups {
        channels.push(lookup.await.unwrap().expect("failed to resolve orders"));
    }

    // Assert
    assert!(channels.iter().all(|channel| channel.same_channel(&channels[0])));
}

#[tokio::test]
async fn shut_down_server_is_evicted_and_replaced() {
    // Steps:
    //  1. Resolve a channel to one of two servers.
    //  2. Remove that server from discovery and shut it down.
    //  3. Call it through the cached channel.
    //  4. Resolve again.
    // What we want to test:
    //  A transport failure evicts the channel, and the next lookup
    //  connects to the remaining server.

    // Arrange
    let server_a = TestServer::start("orders-a").await;
    let server_b = TestServer::start("orders-b").await;
    let backend = Arc::new(StaticBackend::new());
    backend.set_instances("orders", vec![endpoint(&server_a), endpoint(&server_b)]);
    let registry = registry(&backend);

    let first = registry.get_channel("orders").await.expect("failed to resolve orders");
    let (gone, survivor) = if first.endpoint() == &endpoint(&server_a) {
        (server_a, server_b)
    } else {
        (server_b, server_a)
    };
    let mut client = HealthClient::new(first.clone());
    assert!(serving(&mut client, gone.name()).await.expect("health check failed"));

    // Act
    backend.set_instances("orders", vec![endpoint(&survivor)]);
    gone.shutdown_sync().await;
    let result = serving(&mut client, "orders").await;

    let second = registry.get_channel("orders").await.expect("failed to resolve orders");
    let mut client = HealthClient::new(second.clone());

    // Assert
    assert!(result.is_err());
    assert!(first.is_broken());
    assert!(first.is_closed());
    assert!(!second.same_channel(&first));
    assert_eq!(second.endpoint(), &endpoint(&survivor));
    assert!(serving(&mut client, survivor.name()).await.expect("health check failed"));
}

#[tokio::test]
async fn unreachable_instance_is_a_channel_creation_error() {
    // Arrange
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let backend = Arc::new(
        StaticBackend::new()
            .with_addresses("orders", [address.as_str()])
            .unwrap(),
    );
    let registry = registry(&backend);

    // Act
    let err = registry.get_channel("orders").await.unwrap_err();

    // Assert
    match err {
        DynamicGrpcError::ChannelCreation {
            service, endpoint, ..
        } => {
            assert_eq!(service, "orders");
            assert_eq!(endpoint.map(|e| e.to_string()), Some(address));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(registry.state("orders").unwrap(), ChannelState::Unresolved);
}

#[tokio::test]
async fn recovering_instance_is_picked_up_on_retry() {
    // Arrange
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let backend = Arc::new(
        StaticBackend::new()
            .with_addresses("orders", [address.as_str()])
            .unwrap(),
    );
    let registry = registry(&backend);
    assert!(registry.get_channel("orders").await.is_err());

    // Act
    let server = TestServer::start_on("orders-a", address.clone()).await;
    let mut client = registry
        .get_client("orders", HealthClient::new)
        .await
        .expect("failed to resolve orders after recovery");

    // Assert
    assert!(serving(&mut client, server.name()).await.expect("health check failed"));
}
