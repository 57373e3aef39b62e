//! The three kinds of property published by discovery: clusters, services and
//! the endpoint set ("uris") of a cluster.

use crate::canary::CanaryDistributionStrategy;
use http::Uri;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifies which of the three property kinds a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Cluster,
    Service,
    Uri,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Cluster => f.write_str("cluster"),
            PropertyKind::Service => f.write_str("service"),
            PropertyKind::Uri => f.write_str("uri"),
        }
    }
}

/// Lower-cased scheme of an endpoint uri, if it has one.
pub(crate) fn scheme_of(uri: &Uri) -> Option<String> {
    uri.scheme_str().map(str::to_ascii_lowercase)
}

/// How a cluster's key space is split into partitions.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionProperties {
    /// The cluster is not partitioned, every key lives in partition 0.
    None,
    /// Contiguous numeric key ranges of `partition_size` keys each.
    Range {
        key_regex: String,
        key_range_start: i64,
        partition_size: i64,
        partition_count: i32,
    },
    /// Keys are hashed onto `partition_count` partitions.
    Hash {
        key_regex: String,
        partition_count: i32,
        algorithm: HashAlgorithm,
    },
    /// Partitioning is done by an accessor registered for the cluster in the
    /// [`PartitionAccessorRegistry`](crate::PartitionAccessorRegistry).
    Custom {
        partition_count: i32,
        accessors: Vec<String>,
    },
}

impl Default for PartitionProperties {
    fn default() -> Self {
        PartitionProperties::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// The key is parsed as an integer and taken modulo the partition count.
    Modulo,
    /// FNV-1a over the key bytes, modulo the partition count.
    Fnv,
}

/// Weight of an endpoint within one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionData {
    weight: f64,
}

impl PartitionData {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Cluster-wide configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterProperties {
    cluster_name: String,
    prioritized_schemes: Vec<String>,
    properties: HashMap<String, String>,
    banned: HashSet<Uri>,
    partition: PartitionProperties,
}

impl ClusterProperties {
    pub fn new<T: ToString>(cluster_name: T) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_prioritized_schemes<I, S>(self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            prioritized_schemes: schemes.into_iter().map(|s| s.to_string()).collect(),
            ..self
        }
    }

    pub fn with_properties(self, properties: HashMap<String, String>) -> Self {
        Self { properties, ..self }
    }

    pub fn with_banned<I: IntoIterator<Item = Uri>>(self, banned: I) -> Self {
        Self {
            banned: banned.into_iter().collect(),
            ..self
        }
    }

    pub fn with_partition(self, partition: PartitionProperties) -> Self {
        Self { partition, ..self }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn prioritized_schemes(&self) -> &[String] {
        &self.prioritized_schemes
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn banned(&self) -> &HashSet<Uri> {
        &self.banned
    }

    pub fn is_banned(&self, uri: &Uri) -> bool {
        self.banned.contains(uri)
    }

    pub fn partition(&self) -> &PartitionProperties {
        &self.partition
    }
}

/// Configuration of one logical service hosted by a cluster.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceProperties {
    service_name: String,
    cluster_name: String,
    path: String,
    strategy_list: Vec<String>,
    strategy_properties: HashMap<String, String>,
    transport_client_properties: HashMap<String, String>,
    prioritized_schemes: Vec<String>,
    banned: HashSet<Uri>,
    metadata: HashMap<String, String>,
}

impl ServiceProperties {
    /// A service named `service_name`, hosted by `cluster_name`, served under `path`.
    pub fn new<S: ToString, C: ToString, P: ToString>(
        service_name: S,
        cluster_name: C,
        path: P,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            cluster_name: cluster_name.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Set the strategy names in order of preference. The first one with a
    /// registered factory is used.
    pub fn with_strategy_list<I, S>(self, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            strategy_list: strategies.into_iter().map(|s| s.to_string()).collect(),
            ..self
        }
    }

    pub fn with_strategy_properties(self, strategy_properties: HashMap<String, String>) -> Self {
        Self {
            strategy_properties,
            ..self
        }
    }

    pub fn with_transport_client_properties(
        self,
        transport_client_properties: HashMap<String, String>,
    ) -> Self {
        Self {
            transport_client_properties,
            ..self
        }
    }

    /// Set the transport schemes in order of preference, e.g. `["https", "http"]`.
    pub fn with_prioritized_schemes<I, S>(self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            prioritized_schemes: schemes.into_iter().map(|s| s.to_string()).collect(),
            ..self
        }
    }

    pub fn with_banned<I: IntoIterator<Item = Uri>>(self, banned: I) -> Self {
        Self {
            banned: banned.into_iter().collect(),
            ..self
        }
    }

    pub fn with_metadata(self, metadata: HashMap<String, String>) -> Self {
        Self { metadata, ..self }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn strategy_list(&self) -> &[String] {
        &self.strategy_list
    }

    pub fn strategy_properties(&self) -> &HashMap<String, String> {
        &self.strategy_properties
    }

    pub fn transport_client_properties(&self) -> &HashMap<String, String> {
        &self.transport_client_properties
    }

    pub fn prioritized_schemes(&self) -> &[String] {
        &self.prioritized_schemes
    }

    pub fn banned(&self) -> &HashSet<Uri> {
        &self.banned
    }

    pub fn is_banned(&self, uri: &Uri) -> bool {
        self.banned.contains(uri)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// The live endpoints of a cluster and the partitions each of them serves.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UriProperties {
    cluster_name: String,
    partitions: HashMap<Uri, HashMap<i32, PartitionData>>,
    uri_specific_properties: HashMap<Uri, HashMap<String, String>>,
}

impl UriProperties {
    pub fn new<T: ToString>(
        cluster_name: T,
        partitions: HashMap<Uri, HashMap<i32, PartitionData>>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            partitions,
            uri_specific_properties: HashMap::new(),
        }
    }

    pub fn with_uri_specific_properties(
        self,
        uri_specific_properties: HashMap<Uri, HashMap<String, String>>,
    ) -> Self {
        Self {
            uri_specific_properties,
            ..self
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn uris(&self) -> impl Iterator<Item = &Uri> {
        self.partitions.keys()
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.partitions.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partition_data(&self) -> &HashMap<Uri, HashMap<i32, PartitionData>> {
        &self.partitions
    }

    /// The partition to weight map announced by `uri`.
    pub fn partition_data_for(&self, uri: &Uri) -> Option<&HashMap<i32, PartitionData>> {
        self.partitions.get(uri)
    }

    pub fn uri_specific_properties(&self, uri: &Uri) -> Option<&HashMap<String, String>> {
        self.uri_specific_properties.get(uri)
    }

    /// All endpoints with the given scheme serving `partition_id`.
    pub fn uris_by_scheme_and_partition(&self, scheme: &str, partition_id: i32) -> HashSet<Uri> {
        self.partitions
            .iter()
            .filter(|(uri, partitions)| {
                partitions.contains_key(&partition_id)
                    && scheme_of(uri).map_or(false, |s| s.eq_ignore_ascii_case(scheme))
            })
            .map(|(uri, _)| uri.clone())
            .collect()
    }
}

/// What discovery publishes for clusters and services: the stable
/// configuration plus an optional canary variant and the policy deciding
/// which of the two this client uses.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreProperties<T> {
    stable: T,
    canary: Option<T>,
    distribution: Option<CanaryDistributionStrategy>,
}

impl<T> StoreProperties<T> {
    pub fn stable(stable: T) -> Self {
        Self {
            stable,
            canary: None,
            distribution: None,
        }
    }

    pub fn with_canary(self, canary: T, distribution: CanaryDistributionStrategy) -> Self {
        Self {
            canary: Some(canary),
            distribution: Some(distribution),
            ..self
        }
    }

    pub fn stable_properties(&self) -> &T {
        &self.stable
    }

    pub fn canary_properties(&self) -> Option<&T> {
        self.canary.as_ref()
    }

    pub fn distribution_strategy(&self) -> Option<&CanaryDistributionStrategy> {
        self.distribution.as_ref()
    }

    pub(crate) fn into_parts(self) -> (T, Option<T>, Option<CanaryDistributionStrategy>) {
        (self.stable, self.canary, self.distribution)
    }
}

impl<T> From<T> for StoreProperties<T> {
    fn from(stable: T) -> Self {
        Self::stable(stable)
    }
}
