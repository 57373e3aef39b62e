use crate::fixtures::{cluster_properties, service_properties, uri_properties, Harness, HOST1, HOST2};
use ginestra::{
    CanaryDistributionStrategy, ClusterListener, Distribution, HostCanaryDistributionProvider,
    LoadBalancerStateListener, LoadBalancerStrategy, StoreProperties, TrackerClient,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl LoadBalancerStateListener for Recorder {
    fn on_strategy_added(&self, service: &str, scheme: &str, _strategy: &Arc<dyn LoadBalancerStrategy>) {
        self.record(format!("strategy added {} {}", service, scheme));
    }

    fn on_strategy_removed(&self, service: &str, scheme: &str, _strategy: &Arc<dyn LoadBalancerStrategy>) {
        self.record(format!("strategy removed {} {}", service, scheme));
    }

    fn on_client_added(&self, service: &str, client: &Arc<TrackerClient>) {
        self.record(format!("client added {} {}", service, client.uri()));
    }

    fn on_client_removed(&self, service: &str, client: &Arc<TrackerClient>) {
        self.record(format!("client removed {} {}", service, client.uri()));
    }
}

impl ClusterListener for Recorder {
    fn on_cluster_added(&self, cluster: &str) {
        self.record(format!("cluster added {}", cluster));
    }

    fn on_cluster_removed(&self, cluster: &str) {
        self.record(format!("cluster removed {}", cluster));
    }
}

#[tokio::test]
async fn listeners_see_strategies_clients_and_clusters() {
    let harness = Harness::start();
    let recorder = Arc::new(Recorder::default());
    harness.state().register_listener(recorder.clone());
    harness.state().register_cluster_listener(recorder.clone());
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);

    harness.resolve("d2://svc1/items").await.unwrap();
    harness.settle().await;

    let events = recorder.events();
    assert!(events.contains(&"strategy added svc1 http".to_string()), "{:?}", events);
    assert!(events.contains(&format!("client added svc1 {}", HOST1)), "{:?}", events);
    assert!(events.contains(&"cluster added cluster1".to_string()), "{:?}", events);
}

#[tokio::test]
async fn old_strategies_are_removed_before_new_ones_are_added() {
    let harness = Harness::start();
    let recorder = Arc::new(Recorder::default());
    harness.state().register_listener(recorder.clone());
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
    harness.resolve("d2://svc1/items").await.unwrap();
    harness.settle().await;
    let before = recorder.events().len();

    harness
        .services
        .put("svc1", service_properties("svc1", "cluster1").into());
    harness.settle().await;

    let strategy_events: Vec<String> = recorder.events()[before..]
        .iter()
        .filter(|event| event.starts_with("strategy"))
        .cloned()
        .collect();
    assert_eq!(
        strategy_events,
        vec!["strategy removed svc1 http", "strategy added svc1 http"]
    );
    assert_eq!(harness.strategies.shutdowns(), 1);
}

#[tokio::test]
async fn unregistered_listeners_are_not_notified() {
    let harness = Harness::start();
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn ClusterListener> = recorder.clone();
    harness.state().register_cluster_listener(listener.clone());
    harness.state().unregister_cluster_listener(listener);
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);

    harness.resolve("d2://svc1/items").await.unwrap();
    harness.settle().await;

    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn removed_endpoints_are_reported() {
    let harness = Harness::start();
    let recorder = Arc::new(Recorder::default());
    harness.state().register_listener(recorder.clone());
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 1.0)]);
    harness.resolve("d2://svc1/items").await.unwrap();

    harness
        .uris
        .put("cluster1", uri_properties("cluster1", &[(HOST2, 0, 1.0)]));
    harness.settle().await;

    assert!(recorder
        .events()
        .contains(&format!("client removed svc1 {}", HOST1)));
    assert_eq!(harness.state().tracker_client_count("cluster1"), 1);
}

#[tokio::test]
async fn canary_properties_apply_to_targeted_hosts() {
    for (host, expected) in [("canary-box", Distribution::Canary), ("other-box", Distribution::Stable)] {
        let harness = Harness::start_with(|builder| {
            builder.canary_provider(HostCanaryDistributionProvider::new(host, "reader"))
        });
        harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
        let stable = service_properties("svc1", "cluster1");
        let canary = ginestra::ServiceProperties::new("svc1", "cluster1", "/svc1-canary")
            .with_strategy_list([tests::FirstStrategyFactory::NAME])
            .with_prioritized_schemes(["http"]);
        harness.services.put(
            "svc1",
            StoreProperties::stable(stable)
                .with_canary(canary, CanaryDistributionStrategy::target_hosts(["canary-box"])),
        );

        let client = harness.resolve("d2://svc1/items").await.unwrap();

        let entry = harness.state().service_entry("svc1").unwrap();
        assert_eq!(entry.distribution(), expected);
        let expected_base = match expected {
            Distribution::Canary => "http://host1:8080/svc1-canary",
            Distribution::Stable => "http://host1:8080/svc1",
        };
        assert_eq!(client.base_uri().to_string(), expected_base);
    }
}

#[tokio::test]
async fn canary_clusters_without_a_provider_stay_stable() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
    harness.clusters.put(
        "cluster1",
        StoreProperties::stable(cluster_properties("cluster1")).with_canary(
            cluster_properties("cluster1").with_properties(HashMap::from([(
                "canary".to_string(),
                "true".to_string(),
            )])),
            CanaryDistributionStrategy::percentage(1.0),
        ),
    );

    harness.resolve("d2://svc1/items").await.unwrap();

    let entry = harness.state().cluster_entry("cluster1").unwrap();
    assert_eq!(entry.distribution(), Distribution::Stable);
    assert!(entry.properties().value().unwrap().properties().is_empty());
}
