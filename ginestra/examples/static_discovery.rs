use ginestra::{
    BoxError, ClusterProperties, PartitionData, PropertySource, PropertySources, PropertySubscriber,
    RoutingChannel, ServiceProperties, SimpleLoadBalancer, StoreProperties, TransportClient,
    TransportClientConfig, UriProperties,
};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::body::Body;
use tower_service::Service;

/// Discovery that knows a fixed set of properties and never changes.
struct StaticSource<T> {
    values: HashMap<String, T>,
}

impl<T: Clone + Send + Sync + 'static> PropertySource<T> for StaticSource<T> {
    fn register(&self, names: &[String], subscriber: PropertySubscriber<T>) {
        for name in names {
            subscriber.on_initialize(name, self.values.get(name).cloned());
        }
    }

    fn unregister(&self, _names: &[String], _subscriber: &PropertySubscriber<T>) {}
}

/// Answers every request itself instead of going to the network.
struct EchoTransport;

#[async_trait::async_trait]
impl TransportClient for EchoTransport {
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>, BoxError> {
        println!("sending {} {}", request.method(), request.uri());
        Ok(http::Response::new(Body::empty()))
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

fn echo(_config: &TransportClientConfig<'_>) -> Result<Arc<dyn TransportClient>, anyhow::Error> {
    Ok(Arc::new(EchoTransport))
}

fn sources() -> PropertySources {
    let cluster = ClusterProperties::new("echo-cluster").with_prioritized_schemes(["http"]);
    let service = ServiceProperties::new("echo", "echo-cluster", "/echo")
        .with_strategy_list(["random"])
        .with_prioritized_schemes(["http"]);
    let endpoints = ["http://localhost:5000/", "http://localhost:5001/"]
        .iter()
        .map(|uri| (uri.parse::<http::Uri>().unwrap(), HashMap::from([(0, PartitionData::new(1.0))])))
        .collect();

    PropertySources {
        clusters: Arc::new(StaticSource {
            values: HashMap::from([("echo-cluster".to_string(), StoreProperties::stable(cluster))]),
        }),
        services: Arc::new(StaticSource {
            values: HashMap::from([("echo".to_string(), StoreProperties::stable(service))]),
        }),
        uris: Arc::new(StaticSource {
            values: HashMap::from([(
                "echo-cluster".to_string(),
                UriProperties::new("echo-cluster", endpoints),
            )]),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let balancer = SimpleLoadBalancer::builder(sources())
        .transport_factory("http", echo)
        .build()?;
    let mut channel = RoutingChannel::new(balancer.clone());

    for id in 0..4 {
        let request = http::Request::builder()
            .uri(format!("d2://echo/messages/{}", id))
            .body(Body::empty())?;
        let response = channel.call(request).await?;
        println!("RESPONSE={:?}", response.status());
    }

    println!("routed {} requests", balancer.stats().available());
    balancer.shutdown().await;
    Ok(())
}
