//! The seam between routing and the network: transport clients and the
//! factories that create them.

use crate::error::BoxError;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::body::Body;

/// Sends requests that have already been rewritten to a concrete endpoint.
///
/// One client is shared by every endpoint of a service that uses the same
/// scheme, so implementations have to dispatch on the request uri.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>, BoxError>;

    /// Release the client's resources. Called once, after the client has been
    /// replaced and its grace period has elapsed.
    async fn shutdown(&self) -> Result<(), BoxError>;
}

/// What a [`TransportClientFactory`] gets to know about the client it builds.
#[derive(Debug, Clone, Copy)]
pub struct TransportClientConfig<'a> {
    pub service_name: &'a str,
    pub scheme: &'a str,
    pub properties: &'a HashMap<String, String>,
}

/// Creates the transport client of one scheme for one service.
pub trait TransportClientFactory: Send + Sync {
    fn client(
        &self,
        config: &TransportClientConfig<'_>,
    ) -> Result<Arc<dyn TransportClient>, anyhow::Error>;
}

impl<F> TransportClientFactory for F
where
    F: Fn(&TransportClientConfig<'_>) -> Result<Arc<dyn TransportClient>, anyhow::Error>
        + Send
        + Sync,
{
    fn client(
        &self,
        config: &TransportClientConfig<'_>,
    ) -> Result<Arc<dyn TransportClient>, anyhow::Error> {
        self(config)
    }
}
