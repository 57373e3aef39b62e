//! Name-keyed snapshots of everything discovery told us, plus the state
//! derived from it.
//!
//! Values are `Arc` snapshots: readers clone the `Arc` out of the map and
//! never hold a map guard while working with it. Writers, which only run on
//! the event queue, always insert a complete new snapshot.

use crate::canary::Distribution;
use crate::partition::PartitionAccessor;
use crate::properties::{ClusterProperties, ServiceProperties, UriProperties};
use crate::routing_table::PartitionRoutingTable;
use crate::strategy::{LoadBalancerStrategy, SchemeStrategyPair};
use crate::tracker_client::TrackerClient;
use crate::transport::TransportClient;
use crate::versioned::{VersionCounter, VersionedItem};
use dashmap::DashMap;
use http::Uri;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type TrackerClients = HashMap<Uri, Arc<TrackerClient>>;
pub type TransportClients = HashMap<String, Arc<dyn TransportClient>>;
pub type Strategies = HashMap<String, Arc<dyn LoadBalancerStrategy>>;

/// Cluster properties together with the partition accessor built from them.
#[derive(Debug, Clone)]
pub struct ClusterEntry {
    properties: VersionedItem<ClusterProperties>,
    accessor: VersionedItem<dyn PartitionAccessor>,
    distribution: Distribution,
}

impl ClusterEntry {
    /// Both halves are stamped with `version`.
    pub(crate) fn new(
        properties: Option<Arc<ClusterProperties>>,
        accessor: Option<Arc<dyn PartitionAccessor>>,
        version: u64,
        distribution: Distribution,
    ) -> Self {
        Self {
            properties: VersionedItem::new(properties, version),
            accessor: VersionedItem::new(accessor, version),
            distribution,
        }
    }

    pub fn properties(&self) -> &VersionedItem<ClusterProperties> {
        &self.properties
    }

    pub fn accessor(&self) -> &VersionedItem<dyn PartitionAccessor> {
        &self.accessor
    }

    /// Whether the stable or the canary payload was applied.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    properties: VersionedItem<ServiceProperties>,
    distribution: Distribution,
}

impl ServiceEntry {
    pub(crate) fn new(
        properties: VersionedItem<ServiceProperties>,
        distribution: Distribution,
    ) -> Self {
        Self {
            properties,
            distribution,
        }
    }

    pub fn properties(&self) -> &VersionedItem<ServiceProperties> {
        &self.properties
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
}

/// Ordered strategies of a service, valid only while `source` is the
/// installed strategy map of that service.
#[derive(Clone)]
struct CachedStrategies {
    source: Arc<Strategies>,
    schemes: Vec<String>,
    ssl_enabled: bool,
    pairs: Arc<Vec<SchemeStrategyPair>>,
}

#[derive(Default)]
pub(crate) struct PropertyStore {
    pub(crate) clusters: DashMap<String, Arc<ClusterEntry>>,
    pub(crate) services: DashMap<String, Arc<ServiceEntry>>,
    pub(crate) uris: DashMap<String, VersionedItem<UriProperties>>,
    pub(crate) tracker_clients: DashMap<String, Arc<TrackerClients>>,
    pub(crate) transport_clients: DashMap<String, Arc<TransportClients>>,
    pub(crate) services_per_cluster: DashMap<String, Arc<HashSet<String>>>,
    pub(crate) strategies: DashMap<String, Arc<Strategies>>,
    strategy_cache: DashMap<String, CachedStrategies>,
    pub(crate) routing_tables: DashMap<String, Arc<PartitionRoutingTable>>,
    pub(crate) version: VersionCounter,
}

impl PropertyStore {
    pub(crate) fn cluster(&self, name: &str) -> Option<Arc<ClusterEntry>> {
        self.clusters.get(name).map(|e| e.clone())
    }

    pub(crate) fn service(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(name).map(|e| e.clone())
    }

    pub(crate) fn service_properties(&self, name: &str) -> Option<Arc<ServiceProperties>> {
        self.service(name)?.properties().value().cloned()
    }

    pub(crate) fn uri_item(&self, cluster: &str) -> Option<VersionedItem<UriProperties>> {
        self.uris.get(cluster).map(|e| e.clone())
    }

    pub(crate) fn uri_properties(&self, cluster: &str) -> Option<Arc<UriProperties>> {
        self.uri_item(cluster)?.value().cloned()
    }

    pub(crate) fn cluster_properties(&self, cluster: &str) -> Option<Arc<ClusterProperties>> {
        self.cluster(cluster)?.properties().value().cloned()
    }

    pub(crate) fn tracker_clients(&self, service: &str) -> Option<Arc<TrackerClients>> {
        self.tracker_clients.get(service).map(|e| e.clone())
    }

    pub(crate) fn transport_clients(&self, service: &str) -> Option<Arc<TransportClients>> {
        self.transport_clients.get(service).map(|e| e.clone())
    }

    pub(crate) fn services_for_cluster(&self, cluster: &str) -> Arc<HashSet<String>> {
        self.services_per_cluster
            .get(cluster)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub(crate) fn routing_table(&self, service: &str) -> Option<Arc<PartitionRoutingTable>> {
        self.routing_tables.get(service).map(|e| e.clone())
    }

    pub(crate) fn add_service_to_cluster(&self, cluster: &str, service: &str) {
        let mut services = (*self.services_for_cluster(cluster)).clone();
        services.insert(service.to_string());
        self.services_per_cluster
            .insert(cluster.to_string(), Arc::new(services));
    }

    pub(crate) fn remove_service_from_cluster(&self, cluster: &str, service: &str) {
        let mut services = (*self.services_for_cluster(cluster)).clone();
        if services.remove(service) {
            if services.is_empty() {
                self.services_per_cluster.remove(cluster);
            } else {
                self.services_per_cluster
                    .insert(cluster.to_string(), Arc::new(services));
            }
        }
    }

    /// Install new strategies for `service`, returning the replaced ones.
    pub(crate) fn replace_strategies(
        &self,
        service: &str,
        strategies: Arc<Strategies>,
    ) -> Option<Arc<Strategies>> {
        let old = self.strategies.insert(service.to_string(), strategies);
        self.strategy_cache.remove(service);
        old
    }

    pub(crate) fn remove_strategies(&self, service: &str) -> Option<Arc<Strategies>> {
        self.strategy_cache.remove(service);
        self.strategies.remove(service).map(|(_, s)| s)
    }

    /// The strategies of `service` in the order of `schemes`, skipping
    /// schemes without a strategy and `https` unless `ssl_enabled`.
    ///
    /// Non-empty results are cached per service. A cached list is only
    /// returned if it was derived from the strategy map that is installed now.
    pub(crate) fn strategies_for_service(
        &self,
        service: &str,
        schemes: &[String],
        ssl_enabled: bool,
    ) -> Arc<Vec<SchemeStrategyPair>> {
        let current = match self.strategies.get(service).map(|e| e.clone()) {
            Some(current) => current,
            None => {
                tracing::warn!(service, "strategies requested for an unknown service");
                return Arc::new(Vec::new());
            }
        };

        if let Some(cached) = self.strategy_cache.get(service) {
            if Arc::ptr_eq(&cached.source, &current)
                && cached.schemes == schemes
                && cached.ssl_enabled == ssl_enabled
            {
                return cached.pairs.clone();
            }
        }

        let pairs: Vec<SchemeStrategyPair> = schemes
            .iter()
            .filter(|scheme| ssl_enabled || !scheme.eq_ignore_ascii_case("https"))
            .filter_map(|scheme| match current.get(&scheme.to_ascii_lowercase()) {
                Some(strategy) => Some(SchemeStrategyPair::new(scheme, strategy.clone())),
                None => {
                    tracing::warn!(service, scheme = scheme.as_str(), "no load balancer strategy for scheme");
                    None
                }
            })
            .collect();
        let pairs = Arc::new(pairs);
        if !pairs.is_empty() {
            self.strategy_cache.insert(
                service.to_string(),
                CachedStrategies {
                    source: current,
                    schemes: schemes.to_vec(),
                    ssl_enabled,
                    pairs: pairs.clone(),
                },
            );
        }
        pairs
    }
}
