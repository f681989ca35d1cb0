//! The transport boundary: how channels to an endpoint are opened and closed.

use crate::HostPort;
use anyhow::Context as _;
use std::time::Duration;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

/// Interface to the transport that turns an endpoint into a channel.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection handle handed out to callers.
    type Channel: Clone + Send + Sync + 'static;

    /// Establish a connection to `endpoint`.
    async fn connect(&self, endpoint: &HostPort) -> Result<Self::Channel, anyhow::Error>;

    /// Release the registry's hold on `channel`.
    ///
    /// Called at most once per channel.
    fn close(&self, _channel: &Self::Channel) {}
}

/// Implements [`Connector`] with tonic [`Channel`]s.
///
/// A tonic channel is closed once every clone of it has been dropped, so closing
/// a cached channel leaves clones that callers still hold working.
#[derive(Debug, Clone, Default)]
pub struct TonicConnector {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    tls_config: Option<ClientTlsConfig>,
}

impl TonicConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a request timeout that will be applied to every new `Endpoint`.
    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Set a connection timeout that will be applied to every new `Endpoint`.
    ///
    /// Defaults to the overall request `timeout` if not set.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
            ..self
        }
    }

    /// Configure the channel to use tls.
    /// A `tls_config` MUST be specified to use the `HTTPS` scheme.
    pub fn with_tls(self, tls_config: ClientTlsConfig) -> Self {
        Self {
            tls_config: Some(tls_config),
            ..self
        }
    }

    fn endpoint(&self, endpoint: &HostPort) -> Result<Endpoint, anyhow::Error> {
        let scheme = if self.tls_config.is_some() {
            "https"
        } else {
            "http"
        };

        let mut tonic_endpoint = Endpoint::from_shared(format!("{scheme}://{endpoint}"))
            .with_context(|| format!("'{endpoint}' is not a valid uri authority"))?;

        if let Some(timeout) = self.timeout {
            tonic_endpoint = tonic_endpoint.timeout(timeout);
        }

        if let Some(connect_timeout) = self.connect_timeout.or(self.timeout) {
            tonic_endpoint = tonic_endpoint.connect_timeout(connect_timeout);
        }

        if let Some(tls_config) = &self.tls_config {
            tonic_endpoint = tonic_endpoint
                .tls_config(tls_config.clone())
                .context("invalid tls configuration")?;
        }

        Ok(tonic_endpoint)
    }
}

#[async_trait::async_trait]
impl Connector for TonicConnector {
    type Channel = Channel;

    #[tracing::instrument(level = "debug", skip(self, endpoint), fields(endpoint = %endpoint))]
    async fn connect(&self, endpoint: &HostPort) -> Result<Channel, anyhow::Error> {
        self.endpoint(endpoint)?
            .connect()
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_http_without_tls() {
        let connector = TonicConnector::new().timeout(Duration::from_secs(1));
        let endpoint = connector
            .endpoint(&HostPort::parse("10.0.0.1:9000").unwrap())
            .unwrap();

        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(
            endpoint.uri().authority().map(|authority| authority.as_str()),
            Some("10.0.0.1:9000")
        );
    }

    #[tokio::test]
    async fn connecting_to_a_closed_port_fails() {
        let connector = TonicConnector::new().connect_timeout(Duration::from_secs(1));

        // Nothing listens on the discard port.
        let result = connector
            .connect(&HostPort::parse("127.0.0.1:9").unwrap())
            .await;

        assert!(result.is_err());
    }
}
