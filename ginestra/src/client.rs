//! Clients handed out by routing, and a channel that routes every call.

use crate::balancer::SimpleLoadBalancer;
use crate::error::{BoxError, Reason, ServiceUnavailable};
use crate::request::RouteRequest;
use crate::tracker_client::TrackerClient;
use crate::transport::TransportClient;
use http::Uri;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::Body;
use tower_service::Service;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A transport client bound to the endpoint routing picked.
///
/// Every request sent through it has its logical uri rewritten onto the
/// endpoint: `d2://svc/items?id=1` becomes `<base uri>/items?id=1`.
#[derive(Clone)]
pub struct RoutedClient {
    service: String,
    base: Uri,
    transport: Arc<dyn TransportClient>,
    tracker_client: Option<Arc<TrackerClient>>,
}

impl fmt::Debug for RoutedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedClient")
            .field("service", &self.service)
            .field("base", &self.base)
            .finish()
    }
}

impl RoutedClient {
    pub(crate) fn new(
        service: String,
        base: Uri,
        transport: Arc<dyn TransportClient>,
        tracker_client: Option<Arc<TrackerClient>>,
    ) -> Self {
        Self {
            service,
            base,
            transport,
            tracker_client,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Endpoint uri followed by the service path.
    pub fn base_uri(&self) -> &Uri {
        &self.base
    }

    /// The chosen endpoint, `None` when the request named its target explicitly.
    pub fn tracker_client(&self) -> Option<&Arc<TrackerClient>> {
        self.tracker_client.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn TransportClient> {
        &self.transport
    }

    /// Move the path and query of `uri` under the base uri.
    pub fn rewrite(&self, uri: &Uri) -> Result<Uri, http::Error> {
        let path = join_paths(self.base.path(), uri.path());
        let path_and_query = match uri.query().or_else(|| self.base.query()) {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let mut builder = Uri::builder();
        if let Some(scheme) = self.base.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.base.authority() {
            builder = builder.authority(authority.clone());
        }
        builder.path_and_query(path_and_query).build()
    }

    /// Rewrite `request` and send it through the transport client.
    pub async fn send(&self, mut request: http::Request<Body>) -> Result<http::Response<Body>, ServiceUnavailable> {
        let uri = self
            .rewrite(request.uri())
            .map_err(|e| ServiceUnavailable::new(&self.service, Reason::InvalidUri(e.to_string())))?;
        tracing::trace!(service = self.service.as_str(), %uri, "sending routed request");
        *request.uri_mut() = uri;
        self.transport
            .send(request)
            .await
            .map_err(|e| ServiceUnavailable::new(&self.service, Reason::Transport(e)))
    }
}

impl Service<http::Request<Body>> for RoutedClient {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { Ok(client.send(request).await?) })
    }
}

/// Routes every request through a [`SimpleLoadBalancer`] and sends it to
/// the endpoint it picked.
///
/// Requests carry logical uris (`d2://<service>/<path>`). The channel can be
/// handed to tonic generated clients.
///
/// ```rust,no_run
/// # async fn example(balancer: ginestra::SimpleLoadBalancer) -> Result<(), tower::BoxError> {
/// use ginestra::RoutingChannel;
/// use tower_service::Service;
///
/// let mut channel = RoutingChannel::new(balancer);
/// let request = http::Request::builder()
///     .uri("d2://articles/items/1")
///     .body(tonic::body::Body::empty())?;
/// let response = channel.call(request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RoutingChannel {
    balancer: SimpleLoadBalancer,
}

impl RoutingChannel {
    pub fn new(balancer: SimpleLoadBalancer) -> Self {
        Self { balancer }
    }

    pub fn balancer(&self) -> &SimpleLoadBalancer {
        &self.balancer
    }
}

impl From<SimpleLoadBalancer> for RoutingChannel {
    fn from(balancer: SimpleLoadBalancer) -> Self {
        Self::new(balancer)
    }
}

impl Service<http::Request<Body>> for RoutingChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let balancer = self.balancer.clone();
        Box::pin(async move {
            let client = balancer.resolve(&RouteRequest::from(&request)).await?;
            Ok(client.send(request).await?)
        })
    }
}

/// `base` and `path` joined by exactly one slash.
pub(crate) fn join_paths(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (base.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => base.to_string(),
        _ => format!("{}/{}", base, path),
    }
}

/// `uri` with its path extended by `path`, dropping any query.
pub(crate) fn extend_path(uri: &Uri, path: &str) -> Result<Uri, http::Error> {
    let mut builder = Uri::builder();
    if let Some(scheme) = uri.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = uri.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.path_and_query(join_paths(uri.path(), path)).build()
}
