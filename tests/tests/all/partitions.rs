use crate::fixtures::{service_properties, uri, uri_properties, Harness, HOST1, HOST2, HOST3};
use ginestra::{ClusterProperties, CustomPartitionAccessor, PartitionAccessError, PartitionProperties, Reason};
use std::collections::HashSet;

const ARTICLES: &str = "d2://articles";

/// Keys 0..100 live in partition 0, 100..200 in partition 1. Host 3 serves both.
fn publish_articles(harness: &Harness) {
    harness.clusters.put(
        "articles-cluster",
        ClusterProperties::new("articles-cluster")
            .with_prioritized_schemes(["http"])
            .with_partition(PartitionProperties::Range {
                key_regex: r"^d2://articles/items/(\d+)".to_string(),
                key_range_start: 0,
                partition_size: 100,
                partition_count: 2,
            })
            .into(),
    );
    harness.services.put(
        "articles",
        service_properties("articles", "articles-cluster").into(),
    );
    harness.uris.put(
        "articles-cluster",
        uri_properties(
            "articles-cluster",
            &[(HOST1, 0, 1.0), (HOST2, 1, 1.0), (HOST3, 0, 1.0), (HOST3, 1, 1.0)],
        ),
    );
}

fn hosts(uris: &[&str]) -> HashSet<http::Uri> {
    uris.iter().map(|u| uri(u)).collect()
}

#[tokio::test]
async fn requests_are_routed_by_their_partition_key() {
    let harness = Harness::start();
    publish_articles(&harness);

    let low = harness.resolve("d2://articles/items/20").await.unwrap();
    let high = harness.resolve("d2://articles/items/150").await.unwrap();

    assert_eq!(low.tracker_client().unwrap().uri(), &uri(HOST1));
    assert_eq!(high.tracker_client().unwrap().uri(), &uri(HOST2));
}

#[tokio::test]
async fn keys_outside_of_the_range_cannot_be_routed() {
    let harness = Harness::start();
    publish_articles(&harness);

    let out_of_range = harness.resolve("d2://articles/items/999").await.unwrap_err();
    let no_key = harness.resolve("d2://articles/search").await.unwrap_err();

    assert!(matches!(
        out_of_range.reason(),
        Reason::PartitionResolutionFailed(PartitionAccessError::OutOfRange { key: 999, .. })
    ));
    assert!(matches!(
        no_key.reason(),
        Reason::PartitionResolutionFailed(PartitionAccessError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn resolve_all_returns_one_ring_per_partition() {
    let harness = Harness::start();
    publish_articles(&harness);

    let rings = harness.balancer.resolve_all(&uri(ARTICLES)).await.unwrap();

    assert_eq!(rings.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(rings[&0].hosts(), hosts(&[HOST1, HOST3]));
    assert_eq!(rings[&1].hosts(), hosts(&[HOST2, HOST3]));
}

#[tokio::test]
async fn keys_are_grouped_by_partition() {
    let harness = Harness::start();
    publish_articles(&harness);

    let result = harness
        .balancer
        .map_keys_to_partitions(&uri(ARTICLES), vec![5, 150, 42, 1000])
        .await
        .unwrap();

    assert_eq!(result.mapped[&0].keys, vec![5, 42]);
    assert_eq!(result.mapped[&1].keys, vec![150]);
    assert_eq!(result.mapped[&1].ring.hosts(), hosts(&[HOST2, HOST3]));
    assert_eq!(result.unmapped.len(), 1);
    assert_eq!(result.unmapped[0].key, 1000);
}

#[tokio::test]
async fn partition_information_lists_hosts_per_partition() {
    let harness = Harness::start();
    publish_articles(&harness);

    let all = harness
        .balancer
        .partition_information::<u64>(&uri(ARTICLES), None, 3, 0)
        .await
        .unwrap();
    assert_eq!(all.partition_count, 2);
    assert_eq!(all.limit_per_partition, 3);
    assert_eq!(all.partitions.len(), 2);
    let hosts_of_0: HashSet<_> = all.partitions[&0].hosts.iter().cloned().collect();
    assert_eq!(hosts_of_0, hosts(&[HOST1, HOST3]));
    // Every partition has two hosts, one short of the limit.
    assert_eq!(all.partitions_without_enough_hosts.get(&0), Some(&1));
    assert_eq!(all.partitions_without_enough_hosts.get(&1), Some(&1));

    let some = harness
        .balancer
        .partition_information(&uri(ARTICLES), Some(vec![120u64, 130, 500]), 1, 7)
        .await
        .unwrap();
    assert_eq!(some.partitions.len(), 1);
    assert_eq!(some.partitions[&1].keys, vec![120, 130]);
    assert_eq!(some.partitions[&1].hosts.len(), 1);
    assert!(some.partitions_without_enough_hosts.is_empty());
    assert_eq!(some.unmapped.len(), 1);
}

#[tokio::test]
async fn cluster_count_counts_endpoints_of_a_partition() {
    let harness = Harness::start();
    publish_articles(&harness);

    assert_eq!(harness.balancer.cluster_count("articles-cluster", "http", 0).await.unwrap(), 2);
    assert_eq!(harness.balancer.cluster_count("articles-cluster", "https", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn partition_accessor_of_a_service() {
    let harness = Harness::start();
    publish_articles(&harness);

    let accessor = harness.balancer.partition_accessor("articles").await.unwrap();

    assert_eq!(accessor.max_partition_id(), 1);
    assert_eq!(accessor.partition_id_for_key("101").unwrap(), 1);
}

struct EvenOdd;

impl CustomPartitionAccessor for EvenOdd {
    fn name(&self) -> &str {
        "even-odd"
    }

    fn partition_id(&self, key: &str) -> Result<i32, anyhow::Error> {
        let key: i64 = key.parse()?;
        Ok((key % 2) as i32)
    }

    fn partition_id_for_uri(&self, uri: &http::Uri) -> Result<i32, anyhow::Error> {
        let key = uri
            .path()
            .rsplit('/')
            .next()
            .ok_or_else(|| anyhow::anyhow!("no key in {}", uri))?;
        self.partition_id(key)
    }
}

#[tokio::test]
async fn custom_partition_accessors_are_used_when_registered() {
    let harness =
        Harness::start_with(|builder| builder.partition_accessor("numbers-cluster", EvenOdd));
    harness.clusters.put(
        "numbers-cluster",
        ClusterProperties::new("numbers-cluster")
            .with_partition(PartitionProperties::Custom {
                partition_count: 2,
                accessors: vec!["even-odd".to_string()],
            })
            .into(),
    );
    harness.services.put(
        "numbers",
        service_properties("numbers", "numbers-cluster").into(),
    );
    harness.uris.put(
        "numbers-cluster",
        uri_properties("numbers-cluster", &[(HOST1, 0, 1.0), (HOST2, 1, 1.0)]),
    );

    let even = harness.resolve("d2://numbers/items/4").await.unwrap();
    let odd = harness.resolve("d2://numbers/items/7").await.unwrap();

    assert_eq!(even.tracker_client().unwrap().uri(), &uri(HOST1));
    assert_eq!(odd.tracker_client().unwrap().uri(), &uri(HOST2));
}

#[tokio::test]
async fn invalid_partitioning_is_not_applied() {
    let harness = Harness::start();
    publish_articles(&harness);
    harness.resolve("d2://articles/items/20").await.unwrap();

    harness.clusters.put(
        "articles-cluster",
        ClusterProperties::new("articles-cluster")
            .with_partition(PartitionProperties::Range {
                key_regex: "(unclosed".to_string(),
                key_range_start: 0,
                partition_size: 100,
                partition_count: 2,
            })
            .into(),
    );
    harness.settle().await;

    let client = harness.resolve("d2://articles/items/150").await.unwrap();
    assert_eq!(client.tracker_client().unwrap().uri(), &uri(HOST2));
}
