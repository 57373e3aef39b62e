use ginestra::{
    ClusterProperties, LoadBalancerBuilder, LoadBalancerState, PartitionData, PropertySources,
    RouteRequest, RoutedClient, ServiceProperties, ServiceUnavailable, SimpleLoadBalancer,
    StoreProperties, UriProperties,
};
use http::Uri;
use std::collections::HashMap;
use std::sync::Arc;
use tests::{FirstStrategyFactory, MockStore, RecordingTransportFactory, RejectingStrategyFactory};
use tokio::time::Duration;

pub const HOST1: &str = "http://host1:8080/";
pub const HOST2: &str = "http://host2:8080/";
pub const HOST3: &str = "http://host3:8080/";

/// A load balancer wired to in-memory discovery stores.
pub struct Harness {
    pub clusters: Arc<MockStore<StoreProperties<ClusterProperties>>>,
    pub services: Arc<MockStore<StoreProperties<ServiceProperties>>>,
    pub uris: Arc<MockStore<UriProperties>>,
    pub transports: RecordingTransportFactory,
    pub strategies: FirstStrategyFactory,
    pub balancer: SimpleLoadBalancer,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(|builder| builder)
    }

    pub fn start_with(configure: impl FnOnce(LoadBalancerBuilder) -> LoadBalancerBuilder) -> Self {
        let clusters: Arc<MockStore<StoreProperties<ClusterProperties>>> = MockStore::new();
        let services: Arc<MockStore<StoreProperties<ServiceProperties>>> = MockStore::new();
        let uris: Arc<MockStore<UriProperties>> = MockStore::new();
        let sources = PropertySources {
            clusters: clusters.clone(),
            services: services.clone(),
            uris: uris.clone(),
        };
        let transports = RecordingTransportFactory::default();
        let strategies = FirstStrategyFactory::default();
        let builder = SimpleLoadBalancer::builder(sources)
            .transport_factory("http", transports.clone())
            .transport_factory("https", transports.clone())
            .strategy_factory(strategies.clone())
            .strategy_factory(RejectingStrategyFactory)
            .timeout(Duration::from_secs(2))
            .teardown_delay(Duration::from_millis(50));
        let balancer = configure(builder)
            .build()
            .expect("failed to build the load balancer");
        Self {
            clusters,
            services,
            uris,
            transports,
            strategies,
            balancer,
        }
    }

    pub fn state(&self) -> &LoadBalancerState {
        self.balancer.state()
    }

    /// Wait for every published event to be applied.
    pub async fn settle(&self) {
        self.state().settle().await
    }

    pub async fn resolve(&self, uri: &str) -> Result<RoutedClient, ServiceUnavailable> {
        let uri: Uri = uri.parse().expect("invalid test uri");
        self.balancer.resolve(&RouteRequest::from_uri(&uri)).await
    }

    /// Publish `service` on `cluster`, the cluster and its endpoints.
    pub fn publish(&self, service: &str, cluster: &str, endpoints: &[(&str, i32, f64)]) {
        self.clusters.put(cluster, cluster_properties(cluster).into());
        self.services.put(service, service_properties(service, cluster).into());
        self.uris.put(cluster, uri_properties(cluster, endpoints));
    }
}

pub fn cluster_properties(cluster: &str) -> ClusterProperties {
    ClusterProperties::new(cluster).with_prioritized_schemes(["http"])
}

/// Served over http under `/<service>`, balanced by the `first` strategy.
pub fn service_properties(service: &str, cluster: &str) -> ServiceProperties {
    ServiceProperties::new(service, cluster, format!("/{}", service))
        .with_strategy_list([FirstStrategyFactory::NAME])
        .with_prioritized_schemes(["http"])
}

/// Endpoints as `(uri, partition, weight)`.
pub fn uri_properties(cluster: &str, endpoints: &[(&str, i32, f64)]) -> UriProperties {
    let mut partitions: HashMap<Uri, HashMap<i32, PartitionData>> = HashMap::new();
    for (uri, partition, weight) in endpoints {
        partitions
            .entry(uri.parse().expect("invalid endpoint uri"))
            .or_default()
            .insert(*partition, PartitionData::new(*weight));
    }
    UriProperties::new(cluster, partitions)
}

pub fn uri(uri: &str) -> Uri {
    uri.parse().expect("invalid test uri")
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
