use crate::fixtures::{
    cluster_properties, service_properties, uri, uri_properties, Harness, HOST1, HOST2, HOST3,
};
use ginestra::{
    PropertyKind, Reason, RouteRequest, RoutingChannel, TargetHostHint, TargetServiceHint,
};
use std::time::Instant;
use tests::{RejectingStrategyFactory, ENDPOINT_HEADER};
use tokio::time::Duration;
use tonic::body::Body;
use tower_service::Service;

fn picked(client: &ginestra::RoutedClient) -> String {
    client
        .tracker_client()
        .expect("no endpoint was chosen")
        .uri()
        .to_string()
}

#[tokio::test]
async fn resolves_to_a_registered_endpoint() {
    // Arrange
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 2.0)]);

    // Act
    let client = harness.resolve("d2://svc1/items/7").await.expect("failed to resolve");

    // Assert
    assert_eq!(picked(&client), HOST1);
    assert_eq!(client.service_name(), "svc1");
    assert_eq!(client.base_uri().to_string(), "http://host1:8080/svc1");
    assert_eq!(harness.balancer.stats().available(), 1);
}

#[tokio::test]
async fn random_strategy_only_picks_registered_endpoints() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 2.0)]);
    harness.services.put(
        "svc1",
        service_properties("svc1", "cluster1")
            .with_strategy_list(["random"])
            .into(),
    );

    for _ in 0..50 {
        let client = harness.resolve("d2://svc1/items").await.expect("failed to resolve");
        let picked = picked(&client);
        assert!(picked == HOST1 || picked == HOST2, "picked unknown endpoint {}", picked);
    }
}

#[tokio::test]
async fn banned_endpoints_are_never_picked() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 1.0)]);
    harness.services.put(
        "svc1",
        service_properties("svc1", "cluster1")
            .with_strategy_list(["random"])
            .with_banned([uri(HOST1)])
            .into(),
    );

    for _ in 0..50 {
        let client = harness.resolve("d2://svc1/items").await.expect("failed to resolve");
        assert_eq!(picked(&client), HOST2);
    }
}

#[tokio::test]
async fn endpoints_banned_by_the_cluster_are_never_picked() {
    let harness = Harness::start_with(|builder| builder.enable_routing_table(false));
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 1.0)]);
    harness.clusters.put(
        "cluster1",
        cluster_properties("cluster1").with_banned([uri(HOST1)]).into(),
    );

    let client = harness.resolve("d2://svc1/items").await.expect("failed to resolve");

    assert_eq!(picked(&client), HOST2);
}

#[tokio::test]
async fn unknown_services_fail_fast_without_a_timeout() {
    let harness = Harness::start_with(|builder| builder.timeout(Duration::ZERO));
    let started = Instant::now();

    let error = harness.resolve("d2://unknown/items").await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(error.service(), "unknown");
    assert!(
        matches!(
            error.reason(),
            Reason::ServiceUnknown | Reason::PropertyUnavailable { kind: PropertyKind::Service, .. }
        ),
        "unexpected reason: {}",
        error
    );
    assert_eq!(harness.balancer.stats().unavailable(), 1);
}

#[tokio::test]
async fn services_without_data_are_unavailable() {
    let harness = Harness::start();
    harness.services.put_empty("svc1");

    let error = harness.resolve("d2://svc1/items").await.unwrap_err();

    assert!(matches!(
        error.reason(),
        Reason::PropertyUnavailable { kind: PropertyKind::Service, name } if name == "svc1"
    ));
}

#[tokio::test]
async fn only_the_routing_scheme_is_accepted() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);

    let error = harness.resolve("http://svc1/items").await.unwrap_err();

    assert!(matches!(error.reason(), Reason::UnsupportedScheme(scheme) if scheme == "http"));
    assert!(harness.resolve("D2://svc1/items").await.is_ok());
}

#[tokio::test]
async fn empty_partitions_and_rejecting_strategies_fail_differently() {
    let harness = Harness::start();
    harness.publish("empty", "cluster1", &[]);
    harness.publish("shedding", "cluster2", &[(HOST1, 0, 1.0)]);
    harness.services.put(
        "shedding",
        service_properties("shedding", "cluster2")
            .with_strategy_list([RejectingStrategyFactory::NAME])
            .into(),
    );

    let empty = harness.resolve("d2://empty/items").await.unwrap_err();
    let shedding = harness.resolve("d2://shedding/items").await.unwrap_err();

    assert!(matches!(empty.reason(), Reason::NoAvailableHost { partition: 0 }));
    assert!(matches!(shedding.reason(), Reason::AllCandidatesRejected { partition: 0 }));
}

#[tokio::test]
async fn services_without_a_known_strategy_are_unavailable() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
    harness.services.put(
        "svc1",
        service_properties("svc1", "cluster1")
            .with_strategy_list(["does-not-exist"])
            .into(),
    );

    let error = harness.resolve("d2://svc1/items").await.unwrap_err();

    assert!(matches!(error.reason(), Reason::NoStrategyConfigured));
}

#[tokio::test]
async fn https_is_skipped_unless_ssl_is_enabled() {
    let endpoints = [("https://host1:8443/", 0, 1.0), (HOST2, 0, 1.0)];
    for (ssl_enabled, expected) in [(false, HOST2), (true, "https://host1:8443/")] {
        let harness = Harness::start_with(|builder| builder.ssl_enabled(ssl_enabled));
        harness.publish("svc1", "cluster1", &endpoints);
        harness.services.put(
            "svc1",
            service_properties("svc1", "cluster1")
                .with_prioritized_schemes(["https", "http"])
                .into(),
        );

        let client = harness.resolve("d2://svc1/items").await.expect("failed to resolve");

        assert_eq!(picked(&client), expected, "ssl enabled: {}", ssl_enabled);
        let schemes: Vec<String> = harness
            .transports
            .created_for("svc1")
            .iter()
            .map(|client| client.scheme().to_string())
            .collect();
        assert_eq!(schemes.contains(&"https".to_string()), ssl_enabled);
    }
}

#[tokio::test]
async fn target_service_hint_bypasses_the_strategy() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
    let mut request = http::Request::builder().uri("d2://svc1/items").body(()).unwrap();
    request
        .extensions_mut()
        .insert(TargetServiceHint(uri("http://elsewhere:9000/direct")));

    let client = harness
        .balancer
        .resolve(&RouteRequest::from(&request))
        .await
        .expect("failed to resolve");

    assert!(client.tracker_client().is_none());
    assert_eq!(client.base_uri().to_string(), "http://elsewhere:9000/direct");
}

#[tokio::test]
async fn target_host_hint_picks_one_of_the_hosts_partitions() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 1, 1.0), (HOST3, 1, 1.0)]);

    let mut request = http::Request::builder().uri("d2://svc1/items").body(()).unwrap();
    request.extensions_mut().insert(TargetHostHint(uri(HOST3)));
    let client = harness
        .balancer
        .resolve(&RouteRequest::from(&request))
        .await
        .expect("failed to resolve");
    // Host 3 only serves partition 1, whose lowest endpoint is host 2.
    assert_eq!(picked(&client), HOST2);

    let mut request = http::Request::builder().uri("d2://svc1/items").body(()).unwrap();
    request
        .extensions_mut()
        .insert(TargetHostHint(uri("http://unknown:8080/")));
    let error = harness
        .balancer
        .resolve(&RouteRequest::from(&request))
        .await
        .unwrap_err();
    assert!(matches!(error.reason(), Reason::PartitionResolutionFailed(_)));
}

#[tokio::test]
async fn routing_channel_sends_requests_to_the_chosen_endpoint() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);
    let mut channel = RoutingChannel::new(harness.balancer.clone());

    let request = http::Request::builder()
        .uri("d2://svc1/items/7?fields=name")
        .body(Body::empty())
        .unwrap();
    let response = channel.call(request).await.expect("request failed");

    assert_eq!(
        response.headers()[ENDPOINT_HEADER],
        "http://host1:8080/svc1/items/7?fields=name"
    );
    let transports = harness.transports.created_for("svc1");
    assert_eq!(transports.len(), 1);
    assert_eq!(
        transports[0].sent(),
        vec![uri("http://host1:8080/svc1/items/7?fields=name")]
    );
}

#[tokio::test]
async fn routing_channel_reports_unavailable_services() {
    let harness = Harness::start_with(|builder| builder.timeout(Duration::ZERO));
    let mut channel = RoutingChannel::new(harness.balancer.clone());

    let request = http::Request::builder()
        .uri("d2://unknown/items")
        .body(Body::empty())
        .unwrap();
    let error = channel.call(request).await.unwrap_err();

    let error = error
        .downcast_ref::<ginestra::ServiceUnavailable>()
        .expect("not a routing error");
    assert_eq!(error.service(), "unknown");
}

#[tokio::test]
async fn endpoint_updates_are_picked_up() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0), (HOST2, 0, 1.0)]);
    let client = harness.resolve("d2://svc1/items").await.unwrap();
    assert_eq!(picked(&client), HOST1);

    harness
        .uris
        .put("cluster1", uri_properties("cluster1", &[(HOST2, 0, 1.0)]));
    harness.settle().await;

    let client = harness.resolve("d2://svc1/items").await.unwrap();
    assert_eq!(picked(&client), HOST2);
    assert!(harness.state().tracker_client("svc1", &uri(HOST1)).is_none());
}

#[tokio::test]
async fn warming_up_listens_to_the_service_and_its_cluster() {
    let harness = Harness::start();
    harness.publish("svc1", "cluster1", &[(HOST1, 0, 1.0)]);

    harness
        .balancer
        .warm_up_service("svc1")
        .await
        .expect("failed to warm up");

    assert!(harness.state().is_listening_to_service("svc1"));
    assert!(harness.state().is_listening_to_cluster("cluster1"));
    assert_eq!(harness.state().tracker_client_count("cluster1"), 1);
}
