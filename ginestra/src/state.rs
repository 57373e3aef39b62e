//! The load balancer state: the property store, its subscription managers
//! and every query routing needs.

use crate::canary::CanaryDistributionProvider;
use crate::config::LoadBalancerConfig;
use crate::executor::PropertyEventExecutor;
use crate::listener::{ClusterListener, Listeners, LoadBalancerStateListener};
use crate::partition::PartitionAccessorRegistry;
use crate::properties::{ClusterProperties, PropertyKind, ServiceProperties, StoreProperties, UriProperties};
use crate::routing_table::PartitionRoutingTable;
use crate::store::{ClusterEntry, PropertyStore, ServiceEntry, TrackerClients};
use crate::strategy::{Candidates, LoadBalancerStrategy, LoadBalancerStrategyFactory, SchemeStrategyPair};
use crate::subscription::{Callback, PropertySource, SubscriptionManager};
use crate::tracker_client::TrackerClient;
use crate::transport::{TransportClient, TransportClientFactory};
use crate::versioned::VersionedItem;
use http::Uri;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

/// The discovery feeds of the three property kinds.
pub struct PropertySources {
    pub clusters: Arc<dyn PropertySource<StoreProperties<ClusterProperties>>>,
    pub services: Arc<dyn PropertySource<StoreProperties<ServiceProperties>>>,
    pub uris: Arc<dyn PropertySource<UriProperties>>,
}

/// Everything the property handlers need. Shared by the handlers of all
/// three kinds, owned by none of the subscription managers.
pub(crate) struct StateCore {
    pub(crate) store: PropertyStore,
    pub(crate) executor: PropertyEventExecutor,
    pub(crate) transport_factories: HashMap<String, Arc<dyn TransportClientFactory>>,
    pub(crate) strategy_factories: HashMap<String, Arc<dyn LoadBalancerStrategyFactory>>,
    pub(crate) listeners: Listeners<dyn LoadBalancerStateListener>,
    pub(crate) cluster_listeners: Listeners<dyn ClusterListener>,
    pub(crate) canary: Option<Arc<dyn CanaryDistributionProvider>>,
    pub(crate) accessors: Arc<PartitionAccessorRegistry>,
    pub(crate) config: LoadBalancerConfig,
}

/// Topology known to the load balancer, continuously updated from discovery.
///
/// All mutations run on a single event queue. Reads go straight to the
/// store and never wait for the queue.
pub struct LoadBalancerState {
    core: Arc<StateCore>,
    clusters: SubscriptionManager<StoreProperties<ClusterProperties>>,
    services: SubscriptionManager<StoreProperties<ServiceProperties>>,
    uris: SubscriptionManager<UriProperties>,
}

impl std::fmt::Debug for LoadBalancerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerState")
            .field("clusters", &self.clusters)
            .field("services", &self.services)
            .field("uris", &self.uris)
            .field("version", &self.version())
            .finish()
    }
}

/// Runs a callback once it has been counted down `count` times.
struct CountDown {
    remaining: AtomicUsize,
    callback: Mutex<Option<Callback>>,
}

impl CountDown {
    fn new(count: usize, callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(callback) = self.callback.lock().take() {
                callback();
            }
        }
    }

    fn signal(self: &Arc<Self>) -> Callback {
        let countdown = self.clone();
        Box::new(move || countdown.count_down())
    }
}

impl LoadBalancerState {
    pub(crate) fn new(core: StateCore, sources: PropertySources) -> Self {
        let core = Arc::new(core);
        let clusters = {
            let (put, remove) = (core.clone(), core.clone());
            SubscriptionManager::new(
                PropertyKind::Cluster,
                sources.clusters,
                core.executor.clone(),
                Box::new(move |name: &str, value: Option<StoreProperties<ClusterProperties>>| {
                    put.cluster_put(name, value)
                }),
                Box::new(move |name: &str| remove.cluster_remove(name)),
            )
        };
        let services = {
            let (put, remove) = (core.clone(), core.clone());
            SubscriptionManager::new(
                PropertyKind::Service,
                sources.services,
                core.executor.clone(),
                Box::new(move |name: &str, value: Option<StoreProperties<ServiceProperties>>| {
                    put.service_put(name, value)
                }),
                Box::new(move |name: &str| remove.service_remove(name)),
            )
        };
        let uris = {
            let (put, remove) = (core.clone(), core.clone());
            SubscriptionManager::new(
                PropertyKind::Uri,
                sources.uris,
                core.executor.clone(),
                Box::new(move |name: &str, value: Option<UriProperties>| put.uri_put(name, value)),
                Box::new(move |name: &str| remove.uri_remove(name)),
            )
        };
        Self {
            core,
            clusters,
            services,
            uris,
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.core.config
    }

    pub fn executor(&self) -> &PropertyEventExecutor {
        &self.core.executor
    }

    /// Resolves once every event queued so far has been processed.
    pub async fn settle(&self) {
        self.core.executor.barrier().await
    }

    /// Listen to service `name`. `callback` runs once its properties have
    /// been delivered.
    pub fn listen_to_service(&self, name: &str, callback: Callback) {
        self.services.ensure_listening(name, callback);
    }

    /// Listen to cluster `name` and to its endpoints. `callback` runs once
    /// both have been delivered.
    pub fn listen_to_cluster(&self, name: &str, callback: Callback) {
        let countdown = CountDown::new(2, callback);
        self.clusters.ensure_listening(name, countdown.signal());
        self.uris.ensure_listening(name, countdown.signal());
    }

    pub fn is_listening_to_service(&self, name: &str) -> bool {
        self.services.is_listening(name)
    }

    pub fn is_listening_to_cluster(&self, name: &str) -> bool {
        self.clusters.is_listening(name) && self.uris.is_listening(name)
    }

    pub fn stop_listening_to_service(&self, name: &str, callback: Callback) {
        self.services.try_stop_listening(name, callback);
    }

    /// Stop listening to the cluster and to its endpoints. `callback` runs
    /// after both attempts.
    pub fn stop_listening_to_cluster(&self, name: &str, callback: Callback) {
        let countdown = CountDown::new(2, callback);
        self.clusters.try_stop_listening(name, countdown.signal());
        self.uris.try_stop_listening(name, countdown.signal());
    }

    /// Wait up to `timeout` for service `name` to be delivered.
    ///
    /// A zero timeout only registers interest. Expiry is not an error: the
    /// caller finds out from the store whether the property arrived.
    pub async fn wait_for_service(&self, name: &str, timeout: Duration) {
        if timeout.is_zero() {
            self.listen_to_service(name, Box::new(|| {}));
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.listen_to_service(
            name,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        if tokio::time::timeout(timeout, rx).await.is_err() {
            tracing::warn!(service = name, ?timeout, "timed out waiting for service properties");
        }
    }

    /// Wait up to `timeout` for cluster `name` and its endpoints to be delivered.
    pub async fn wait_for_cluster(&self, name: &str, timeout: Duration) {
        if timeout.is_zero() {
            self.listen_to_cluster(name, Box::new(|| {}));
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.listen_to_cluster(
            name,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        if tokio::time::timeout(timeout, rx).await.is_err() {
            tracing::warn!(cluster = name, ?timeout, "timed out waiting for cluster properties");
        }
    }

    /// Reset the version counter. Applied on the event queue.
    pub fn set_version(&self, version: u64) {
        let core = self.core.clone();
        self.core
            .executor
            .execute(move || core.store.version.set(version));
    }

    pub fn version(&self) -> u64 {
        self.core.store.version.current()
    }

    pub fn cluster_entry(&self, cluster: &str) -> Option<Arc<ClusterEntry>> {
        self.core.store.cluster(cluster)
    }

    pub fn service_entry(&self, service: &str) -> Option<Arc<ServiceEntry>> {
        self.core.store.service(service)
    }

    pub fn service_properties(&self, service: &str) -> Option<Arc<ServiceProperties>> {
        self.core.store.service_properties(service)
    }

    pub fn cluster_properties(&self, cluster: &str) -> Option<Arc<ClusterProperties>> {
        self.core.store.cluster_properties(cluster)
    }

    pub fn uri_item(&self, cluster: &str) -> Option<VersionedItem<UriProperties>> {
        self.core.store.uri_item(cluster)
    }

    pub fn tracker_client(&self, service: &str, uri: &Uri) -> Option<Arc<TrackerClient>> {
        self.core.store.tracker_clients(service)?.get(uri).cloned()
    }

    pub fn tracker_clients(&self, service: &str) -> Option<Arc<TrackerClients>> {
        self.core.store.tracker_clients(service)
    }

    pub fn transport_client(&self, service: &str, scheme: &str) -> Option<Arc<dyn TransportClient>> {
        let clients = self.core.store.transport_clients(service);
        if clients.is_none() {
            tracing::warn!(service, "transport client requested for an unknown service");
        }
        clients?.get(&scheme.to_ascii_lowercase()).cloned()
    }

    pub fn strategy(&self, service: &str, scheme: &str) -> Option<Arc<dyn LoadBalancerStrategy>> {
        self.core
            .store
            .strategies
            .get(service)
            .and_then(|s| s.get(scheme).cloned())
    }

    /// The strategies of `service` ordered by `schemes`.
    pub fn strategies_for_service(&self, service: &str, schemes: &[String]) -> Arc<Vec<SchemeStrategyPair>> {
        self.core
            .store
            .strategies_for_service(service, schemes, self.core.config.ssl_enabled)
    }

    pub fn services_for_cluster(&self, cluster: &str) -> Arc<HashSet<String>> {
        self.core.store.services_for_cluster(cluster)
    }

    pub fn routing_table(&self, service: &str) -> Option<Arc<PartitionRoutingTable>> {
        if !self.core.config.enable_routing_table {
            return None;
        }
        self.core.store.routing_table(service)
    }

    /// Routing table candidates for `(scheme, partition_id)`.
    ///
    /// `None` if there is no table for the service, or the table has no entry
    /// for the pair.
    pub fn potential_clients(&self, service: &str, scheme: &str, partition_id: i32) -> Option<Arc<Candidates>> {
        self.routing_table(service)?
            .clients(scheme, partition_id)
            .cloned()
    }

    pub fn cluster_count(&self) -> usize {
        self.core.store.clusters.len()
    }

    pub fn service_count(&self) -> usize {
        self.core.store.services.len()
    }

    pub fn uri_count(&self) -> usize {
        self.core.store.uris.len()
    }

    pub fn service_listen_count(&self) -> usize {
        self.services.listen_count()
    }

    pub fn cluster_listen_count(&self) -> usize {
        self.clusters.listen_count()
    }

    /// Tracker clients across every service of `cluster`.
    pub fn tracker_client_count(&self, cluster: &str) -> usize {
        self.services_for_cluster(cluster)
            .iter()
            .filter_map(|service| self.core.store.tracker_clients(service))
            .map(|clients| clients.len())
            .sum()
    }

    pub fn supported_schemes(&self) -> Vec<String> {
        self.core.transport_factories.keys().cloned().collect()
    }

    pub fn supported_strategies(&self) -> Vec<String> {
        self.core.strategy_factories.keys().cloned().collect()
    }

    pub fn partition_accessor_registry(&self) -> &Arc<PartitionAccessorRegistry> {
        &self.core.accessors
    }

    pub fn register_listener(&self, listener: Arc<dyn LoadBalancerStateListener>) {
        let core = self.core.clone();
        self.core.executor.execute(move || core.listeners.add(listener));
    }

    pub fn unregister_listener(&self, listener: Arc<dyn LoadBalancerStateListener>) {
        let core = self.core.clone();
        self.core
            .executor
            .execute(move || core.listeners.remove(&listener));
    }

    pub fn register_cluster_listener(&self, listener: Arc<dyn ClusterListener>) {
        let core = self.core.clone();
        self.core
            .executor
            .execute(move || core.cluster_listeners.add(listener));
    }

    pub fn unregister_cluster_listener(&self, listener: Arc<dyn ClusterListener>) {
        let core = self.core.clone();
        self.core
            .executor
            .execute(move || core.cluster_listeners.remove(&listener));
    }

    /// Shut down every strategy and transport client.
    ///
    /// Listeners are told about every strategy, tracker client and cluster
    /// going away. Resolves once all transport clients have shut down.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let core = self.core.clone();
        self.core.executor.execute(move || {
            let _ = tx.send(core.release_all());
        });
        let transports = match rx.await {
            Ok(transports) => transports,
            Err(_) => {
                tracing::warn!("event queue gone before shutdown ran");
                return;
            }
        };
        for (service, scheme, client) in transports {
            match client.shutdown().await {
                Ok(()) => tracing::info!(service = service.as_str(), scheme = scheme.as_str(), "shut down transport client"),
                Err(error) => {
                    tracing::warn!(service = service.as_str(), scheme = scheme.as_str(), error = %error, "failed to shut down transport client")
                }
            }
        }
    }
}
