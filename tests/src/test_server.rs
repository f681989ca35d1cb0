use futures::future::FutureExt;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::ServingStatus;

/// Manages construction and destruction of a tonic gRPC server for testing.
///
/// The server exposes the standard `grpc.health.v1.Health` service and reports
/// its own name as a serving service, so a health check for that name tells
/// which server answered.
pub struct TestServer {
    name: String,
    shutdown_handle: Option<tokio::sync::oneshot::Sender<()>>,
    server_addr: String,
    server_future:
        Option<tokio::task::JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }
    }
}

impl TestServer {
    /// Bootstrap a tonic `TestServer` named `name` on an ephemeral local port.
    ///
    /// This function will run the server asynchronously, and
    /// tear it down when `Self` is dropped.
    pub async fn start<N: Into<String>>(name: N) -> Self {
        Self::start_on(name, None::<String>).await
    }

    /// Bootstrap a tonic `TestServer` named `name` listening on `address`,
    /// or on an ephemeral local port if `address` is `None`.
    pub async fn start_on<N: Into<String>, T: Into<Option<String>>>(name: N, address: T) -> Self {
        let name = name.into();
        let (mut reporter, health_service) = tonic_health::server::health_reporter();
        reporter
            .set_service_status(&name, ServingStatus::Serving)
            .await;

        let (shutdown_handle, shutdown) = tokio::sync::oneshot::channel::<()>();

        let listener =
            TcpListener::bind(address.into().unwrap_or_else(|| "127.0.0.1:0".to_string()))
                .await
                .expect("failed to bind tcplistener");
        let listener_addr = listener
            .local_addr()
            .expect("failed to retrieve sockeaddr from tokio listener");

        let server_addr = format!("127.0.0.1:{}", listener_addr.port());
        tracing::info!("server {} address: {}", name, server_addr);

        let server_future = tokio::spawn(
            Server::builder()
                .add_service(health_service)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    shutdown.map(|_| ()),
                ),
        );

        // await connectivity
        let wait_start = Instant::now();
        while let Err(e) = TcpStream::connect(listener_addr).await {
            if wait_start.elapsed() > Duration::from_secs(10) {
                panic!("Cannot connect to {listener_addr}: {e}");
            }
            tokio::task::yield_now().await;
        }

        TestServer {
            name,
            shutdown_handle: Some(shutdown_handle),
            server_addr,
            server_future: Some(server_future),
        }
    }

    /// The name the server reports as serving.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the address `TestServer` is listening on.
    pub fn address(&self) -> &str {
        &self.server_addr
    }

    /// Shut the server down and wait until it stopped accepting connections.
    pub async fn shutdown_sync(mut self) {
        // Gracefully shutdown the gRPC Server.
        if let Some(sender) = self.shutdown_handle.take() {
            let _res = sender.send(());
        }

        if let Some(server_future) = self.server_future.take() {
            server_future
                .await
                .expect("server did not exit gracefully")
                .expect("server failed");
        }
    }
}
