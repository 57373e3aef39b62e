//! Provides the builder of the load balancer and the routing algorithm on
//! top of [`LoadBalancerState`].
use crate::canary::CanaryDistributionProvider;
use crate::client::{extend_path, RoutedClient};
use crate::config::LoadBalancerConfig;
use crate::error::{PartitionAccessError, Reason, ServiceUnavailable};
use crate::executor::PropertyEventExecutor;
use crate::listener::Listeners;
use crate::partition::{CustomPartitionAccessor, PartitionAccessor, PartitionAccessorRegistry};
use crate::properties::{scheme_of, ClusterProperties, PropertyKind, ServiceProperties, UriProperties};
use crate::request::RouteRequest;
use crate::state::{LoadBalancerState, PropertySources, StateCore};
use crate::store::{ClusterEntry, PropertyStore};
use crate::strategy::{
    Candidates, LoadBalancerStrategyFactory, RandomStrategyFactory, Ring, SchemeStrategyPair,
};
use crate::tracker_client::TrackerClient;
use crate::transport::TransportClientFactory;
use anyhow::Context as _;
use http::Uri;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Routes logical `d2://<service>/<path>` requests to concrete endpoints.
///
/// Cheap to clone: clones share the same [`LoadBalancerState`].
///
/// ```rust,no_run
/// # async fn example(sources: ginestra::PropertySources) -> Result<(), anyhow::Error> {
/// use ginestra::{RouteRequest, SimpleLoadBalancer};
///
/// let balancer = SimpleLoadBalancer::builder(sources)
///     .timeout(std::time::Duration::from_secs(2))
///     .build()?;
///
/// let uri = "d2://articles/items/1".parse()?;
/// let client = balancer.resolve(&RouteRequest::from_uri(&uri)).await?;
/// println!("routing to {}", client.base_uri());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SimpleLoadBalancer {
    state: Arc<LoadBalancerState>,
    stats: Arc<RoutingStats>,
    timeout: Duration,
}

/// How many routing calls succeeded and failed.
#[derive(Debug, Default)]
pub struct RoutingStats {
    available: AtomicU64,
    unavailable: AtomicU64,
}

impl RoutingStats {
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }

    pub fn unavailable(&self) -> u64 {
        self.unavailable.load(Ordering::Relaxed)
    }
}

/// Keys routed to one partition, together with that partition's ring.
#[derive(Debug, Clone)]
pub struct RingKeys<K> {
    pub ring: Ring,
    pub keys: Vec<K>,
}

/// Outcome of [`SimpleLoadBalancer::map_keys_to_partitions`].
#[derive(Debug)]
pub struct MapKeyResult<K> {
    pub mapped: BTreeMap<i32, RingKeys<K>>,
    /// Keys no partition could be found for.
    pub unmapped: Vec<UnmappedKey<K>>,
}

/// A key together with the reason it could not be mapped to a partition.
#[derive(Debug)]
pub struct UnmappedKey<K> {
    pub key: K,
    pub error: PartitionAccessError,
}

/// Keys of one partition and the hosts that serve them, in ring order.
#[derive(Debug, Clone)]
pub struct KeysAndHosts<K> {
    pub keys: Vec<K>,
    pub hosts: Vec<Uri>,
}

/// Outcome of [`SimpleLoadBalancer::partition_information`].
#[derive(Debug)]
pub struct HostToKeyMapper<K> {
    pub partitions: BTreeMap<i32, KeysAndHosts<K>>,
    pub unmapped: Vec<UnmappedKey<K>>,
    pub limit_per_partition: usize,
    pub partition_count: i32,
    /// Partition id to the number of hosts it fell short of the limit by.
    pub partitions_without_enough_hosts: BTreeMap<i32, usize>,
}

// What every routing call needs once the service and its cluster are known.
struct Route {
    service_name: String,
    service: Arc<ServiceProperties>,
    cluster: Arc<ClusterProperties>,
    accessor: Arc<dyn PartitionAccessor>,
    uris: Arc<UriProperties>,
    version: u64,
}

impl SimpleLoadBalancer {
    /// Start configuring a `SimpleLoadBalancer` fed by the given discovery sources.
    pub fn builder(sources: PropertySources) -> LoadBalancerBuilder {
        LoadBalancerBuilder::new(sources)
    }

    pub fn state(&self) -> &Arc<LoadBalancerState> {
        &self.state
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// Route `request` to an endpoint of the service named by its uri authority.
    #[tracing::instrument(level = "debug", skip(self, request), fields(uri = %request.uri()))]
    pub async fn resolve(&self, request: &RouteRequest<'_>) -> Result<RoutedClient, ServiceUnavailable> {
        match self.resolve_inner(request).await {
            Ok(client) => {
                self.stats.available.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(base = %client.base_uri(), "resolved request");
                Ok(client)
            }
            Err(error) => Err(self.unavailable(error)),
        }
    }

    async fn resolve_inner(&self, request: &RouteRequest<'_>) -> Result<RoutedClient, ServiceUnavailable> {
        let service_name = self.service_name(request.uri())?;
        let (service, cluster_entry) = self.service_and_cluster(&service_name).await?;
        Self::cluster_properties(&service_name, service.cluster_name(), &cluster_entry)?;

        if let Some(target) = request.target_service() {
            let scheme = scheme_of(target).ok_or_else(|| {
                ServiceUnavailable::new(&service_name, Reason::InvalidUri(target.to_string()))
            })?;
            let transport = self
                .state
                .transport_client(&service_name, &scheme)
                .ok_or_else(|| ServiceUnavailable::new(&service_name, Reason::NoTransportClient(scheme)))?;
            tracing::debug!(service = service_name.as_str(), %target, "routing to the requested target");
            return Ok(RoutedClient::new(service_name, target.clone(), transport, None));
        }

        let route = self.route(service_name, service, &cluster_entry)?;
        let strategies = self.strategies(&route)?;
        let tracker_client = self.choose_tracker_client(&route, &strategies, request)?;
        let base = extend_path(tracker_client.uri(), route.service.path()).map_err(|e| {
            ServiceUnavailable::new(&route.service_name, Reason::InvalidUri(e.to_string()))
        })?;
        Ok(RoutedClient::new(
            route.service_name,
            base,
            tracker_client.transport().clone(),
            Some(tracker_client),
        ))
    }

    /// The ring of every partition of the service, `0..=max_partition_id`.
    ///
    /// Per partition, the ring of the first scheme with a non-empty ring wins.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_all(&self, service_uri: &Uri) -> Result<BTreeMap<i32, Ring>, ServiceUnavailable> {
        let rings = self.resolve_all_inner(service_uri).await;
        self.record(rings)
    }

    async fn resolve_all_inner(&self, service_uri: &Uri) -> Result<BTreeMap<i32, Ring>, ServiceUnavailable> {
        let route = self.route_for_uri(service_uri).await?;
        let strategies = self.strategies(&route)?;
        Ok((0..=route.accessor.max_partition_id())
            .map(|partition| (partition, self.first_ring(&route, &strategies, partition)))
            .collect())
    }

    /// Group `keys` by partition, each group with its partition's ring.
    ///
    /// Keys whose partition cannot be resolved are reported in
    /// [`MapKeyResult::unmapped`] instead of failing the call.
    pub async fn map_keys_to_partitions<K, I>(
        &self,
        service_uri: &Uri,
        keys: I,
    ) -> Result<MapKeyResult<K>, ServiceUnavailable>
    where
        K: fmt::Display,
        I: IntoIterator<Item = K>,
    {
        let route = match self.route_for_uri(service_uri).await {
            Ok(route) => route,
            Err(error) => return self.record(Err(error)),
        };
        let strategies = self.record(self.strategies(&route))?;
        let (grouped, unmapped) = group_keys(route.accessor.as_ref(), keys);
        let mapped = grouped
            .into_iter()
            .map(|(partition, keys)| {
                let ring = self.first_ring(&route, &strategies, partition);
                (partition, RingKeys { ring, keys })
            })
            .collect();
        Ok(MapKeyResult { mapped, unmapped })
    }

    /// Up to `limit_per_partition` distinct hosts per partition, walked
    /// clockwise from `hash` on the partition's ring.
    ///
    /// With `keys == None` every partition is reported, with no keys.
    pub async fn partition_information<K: fmt::Display>(
        &self,
        service_uri: &Uri,
        keys: Option<Vec<K>>,
        limit_per_partition: usize,
        hash: u64,
    ) -> Result<HostToKeyMapper<K>, ServiceUnavailable> {
        let route = match self.route_for_uri(service_uri).await {
            Ok(route) => route,
            Err(error) => return self.record(Err(error)),
        };
        let strategies = self.record(self.strategies(&route))?;
        let max_partition_id = route.accessor.max_partition_id();
        let (grouped, unmapped) = match keys {
            Some(keys) => group_keys(route.accessor.as_ref(), keys),
            None => ((0..=max_partition_id).map(|p| (p, Vec::new())).collect(), Vec::new()),
        };

        let mut partitions = BTreeMap::new();
        let mut partitions_without_enough_hosts = BTreeMap::new();
        for (partition, keys) in grouped {
            let mut hosts = Vec::new();
            for pair in strategies.iter() {
                let candidates = self.candidates(&route, pair.scheme(), partition);
                let ring = pair.strategy().ring(route.version, partition, &candidates);
                let wanted = limit_per_partition.min(candidates.len());
                hosts = ring.hosts_from(hash).into_iter().take(wanted).collect();
                if !hosts.is_empty() {
                    break;
                }
            }
            if hosts.len() < limit_per_partition {
                partitions_without_enough_hosts.insert(partition, limit_per_partition - hosts.len());
            }
            partitions.insert(partition, KeysAndHosts { keys, hosts });
        }

        Ok(HostToKeyMapper {
            partitions,
            unmapped,
            limit_per_partition,
            partition_count: max_partition_id + 1,
            partitions_without_enough_hosts,
        })
    }

    /// The properties of service `name`, waiting for them if needed.
    pub async fn service_properties(&self, name: &str) -> Result<Arc<ServiceProperties>, ServiceUnavailable> {
        self.state.wait_for_service(name, self.timeout).await;
        let entry = self
            .state
            .service_entry(name)
            .ok_or_else(|| ServiceUnavailable::new(name, Reason::ServiceUnknown))?;
        entry.properties().value().cloned().ok_or_else(|| {
            ServiceUnavailable::new(
                name,
                Reason::PropertyUnavailable {
                    kind: PropertyKind::Service,
                    name: name.to_string(),
                },
            )
        })
    }

    /// The partition accessor of the cluster serving `service_name`.
    pub async fn partition_accessor(
        &self,
        service_name: &str,
    ) -> Result<Arc<dyn PartitionAccessor>, ServiceUnavailable> {
        let (service, cluster_entry) = self.service_and_cluster(service_name).await?;
        Self::accessor(service_name, service.cluster_name(), &cluster_entry)
    }

    /// Listen to service `name` and its cluster, so that the first request
    /// does not pay for discovery.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn warm_up_service(&self, name: &str) -> Result<(), ServiceUnavailable> {
        self.service_and_cluster(name).await.map(|_| ())
    }

    /// How many endpoints of `cluster` serve `partition_id` over `scheme`.
    pub async fn cluster_count(
        &self,
        cluster: &str,
        scheme: &str,
        partition_id: i32,
    ) -> Result<usize, ServiceUnavailable> {
        self.state.wait_for_cluster(cluster, self.timeout).await;
        let item = self
            .state
            .uri_item(cluster)
            .ok_or_else(|| ServiceUnavailable::new(cluster, Reason::ClusterUnknown(cluster.to_string())))?;
        Ok(item
            .value()
            .map_or(0, |uris| uris.uris_by_scheme_and_partition(scheme, partition_id).len()))
    }

    /// Shut down every strategy and transport client.
    pub async fn shutdown(&self) {
        self.state.shutdown().await
    }

    fn unavailable(&self, error: ServiceUnavailable) -> ServiceUnavailable {
        self.stats.unavailable.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(error = %error, "service unavailable");
        error
    }

    fn record<T>(&self, result: Result<T, ServiceUnavailable>) -> Result<T, ServiceUnavailable> {
        result.map_err(|error| self.unavailable(error))
    }

    fn service_name(&self, uri: &Uri) -> Result<String, ServiceUnavailable> {
        let routing_scheme = &self.state.config().routing_scheme;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case(routing_scheme) => {}
            scheme => {
                return Err(ServiceUnavailable::new(
                    uri,
                    Reason::UnsupportedScheme(scheme.unwrap_or_default().to_string()),
                ))
            }
        }
        uri.host()
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ServiceUnavailable::new(uri, Reason::InvalidUri(uri.to_string())))
    }

    async fn service_and_cluster(
        &self,
        service_name: &str,
    ) -> Result<(Arc<ServiceProperties>, Arc<ClusterEntry>), ServiceUnavailable> {
        let service = self.service_properties(service_name).await?;
        let cluster_name = service.cluster_name();
        self.state.wait_for_cluster(cluster_name, self.timeout).await;
        let entry = self.state.cluster_entry(cluster_name).ok_or_else(|| {
            ServiceUnavailable::new(service_name, Reason::ClusterUnknown(cluster_name.to_string()))
        })?;
        Ok((service, entry))
    }

    async fn route_for_uri(&self, uri: &Uri) -> Result<Route, ServiceUnavailable> {
        let service_name = self.service_name(uri)?;
        let (service, cluster_entry) = self.service_and_cluster(&service_name).await?;
        self.route(service_name, service, &cluster_entry)
    }

    fn route(
        &self,
        service_name: String,
        service: Arc<ServiceProperties>,
        cluster_entry: &ClusterEntry,
    ) -> Result<Route, ServiceUnavailable> {
        let cluster_name = service.cluster_name();
        let cluster = Self::cluster_properties(&service_name, cluster_name, cluster_entry)?;
        let accessor = Self::accessor(&service_name, cluster_name, cluster_entry)?;
        let unavailable = || {
            ServiceUnavailable::new(
                &service_name,
                Reason::PropertyUnavailable {
                    kind: PropertyKind::Uri,
                    name: cluster_name.to_string(),
                },
            )
        };
        let item = self.state.uri_item(cluster_name).ok_or_else(unavailable)?;
        let uris = item.value().cloned().ok_or_else(unavailable)?;
        Ok(Route {
            version: item.version(),
            service_name,
            service,
            cluster,
            accessor,
            uris,
        })
    }

    fn cluster_properties(
        service_name: &str,
        cluster_name: &str,
        entry: &ClusterEntry,
    ) -> Result<Arc<ClusterProperties>, ServiceUnavailable> {
        entry.properties().value().cloned().ok_or_else(|| {
            ServiceUnavailable::new(
                service_name,
                Reason::PropertyUnavailable {
                    kind: PropertyKind::Cluster,
                    name: cluster_name.to_string(),
                },
            )
        })
    }

    fn accessor(
        service_name: &str,
        cluster_name: &str,
        entry: &ClusterEntry,
    ) -> Result<Arc<dyn PartitionAccessor>, ServiceUnavailable> {
        entry.accessor().value().cloned().ok_or_else(|| {
            ServiceUnavailable::new(
                service_name,
                Reason::PropertyUnavailable {
                    kind: PropertyKind::Cluster,
                    name: cluster_name.to_string(),
                },
            )
        })
    }

    fn strategies(&self, route: &Route) -> Result<Arc<Vec<SchemeStrategyPair>>, ServiceUnavailable> {
        let strategies = self
            .state
            .strategies_for_service(&route.service_name, route.service.prioritized_schemes());
        if strategies.is_empty() {
            return Err(ServiceUnavailable::new(&route.service_name, Reason::NoStrategyConfigured));
        }
        Ok(strategies)
    }

    fn choose_tracker_client(
        &self,
        route: &Route,
        strategies: &[SchemeStrategyPair],
        request: &RouteRequest<'_>,
    ) -> Result<Arc<TrackerClient>, ServiceUnavailable> {
        let partition = match request.target_host() {
            // Any of the host's partitions will do.
            Some(host) => {
                let partitions: Vec<i32> = route
                    .uris
                    .partition_data_for(host)
                    .map(|data| data.keys().copied().collect())
                    .unwrap_or_default();
                match partitions.choose(&mut rand::thread_rng()) {
                    Some(partition) => *partition,
                    None => {
                        return Err(ServiceUnavailable::new(
                            &route.service_name,
                            Reason::PartitionResolutionFailed(PartitionAccessError::UnknownHost(
                                host.to_string(),
                            )),
                        ))
                    }
                }
            }
            None => route
                .accessor
                .partition_id_for_uri(request.uri())
                .map_err(|e| {
                    ServiceUnavailable::new(&route.service_name, Reason::PartitionResolutionFailed(e))
                })?,
        };

        let mut last_candidates_empty = true;
        for pair in strategies {
            let candidates = self.candidates(route, pair.scheme(), partition);
            last_candidates_empty = candidates.is_empty();
            tracing::trace!(
                service = route.service_name.as_str(),
                scheme = pair.scheme(),
                partition,
                candidates = candidates.len(),
                "asking strategy for a host"
            );
            if let Some(client) = pair
                .strategy()
                .pick(request, route.version, partition, &candidates)
            {
                return Ok(client);
            }
        }

        let reason = if last_candidates_empty {
            Reason::NoAvailableHost { partition }
        } else {
            Reason::AllCandidatesRejected { partition }
        };
        Err(ServiceUnavailable::new(&route.service_name, reason))
    }

    /// Candidates of `(scheme, partition)`: the routing table entry if there
    /// is one, otherwise the unbanned endpoints that have a tracker client.
    fn candidates(&self, route: &Route, scheme: &str, partition: i32) -> Arc<Candidates> {
        if let Some(candidates) = self.state.potential_clients(&route.service_name, scheme, partition) {
            return candidates;
        }
        let Some(tracker_clients) = self.state.tracker_clients(&route.service_name) else {
            return Arc::default();
        };
        let candidates = route
            .uris
            .uris_by_scheme_and_partition(scheme, partition)
            .into_iter()
            .filter(|uri| !route.service.is_banned(uri) && !route.cluster.is_banned(uri))
            .filter_map(|uri| {
                let client = tracker_clients.get(&uri)?.clone();
                Some((uri, client))
            })
            .collect();
        Arc::new(candidates)
    }

    fn first_ring(&self, route: &Route, strategies: &[SchemeStrategyPair], partition: i32) -> Ring {
        for pair in strategies {
            let candidates = self.candidates(route, pair.scheme(), partition);
            let ring = pair.strategy().ring(route.version, partition, &candidates);
            if !ring.is_empty() {
                return ring;
            }
        }
        Ring::default()
    }
}

fn group_keys<K, I>(accessor: &dyn PartitionAccessor, keys: I) -> (BTreeMap<i32, Vec<K>>, Vec<UnmappedKey<K>>)
where
    K: fmt::Display,
    I: IntoIterator<Item = K>,
{
    let mut grouped: BTreeMap<i32, Vec<K>> = BTreeMap::new();
    let mut unmapped = Vec::new();
    for key in keys {
        match accessor.partition_id_for_key(&key.to_string()) {
            Ok(partition) => grouped.entry(partition).or_default().push(key),
            Err(error) => unmapped.push(UnmappedKey { key, error }),
        }
    }
    (grouped, unmapped)
}

/// Builder to configure and create a [`SimpleLoadBalancer`].
pub struct LoadBalancerBuilder {
    sources: PropertySources,
    transport_factories: HashMap<String, Arc<dyn TransportClientFactory>>,
    strategy_factories: HashMap<String, Arc<dyn LoadBalancerStrategyFactory>>,
    canary: Option<Arc<dyn CanaryDistributionProvider>>,
    accessors: Arc<PartitionAccessorRegistry>,
    config: LoadBalancerConfig,
}

impl LoadBalancerBuilder {
    /// Start from the default configuration with the `random` strategy
    /// registered and no transport client factories.
    pub fn new(sources: PropertySources) -> Self {
        let random: Arc<dyn LoadBalancerStrategyFactory> = Arc::new(RandomStrategyFactory);
        Self {
            sources,
            transport_factories: HashMap::new(),
            strategy_factories: HashMap::from([(random.name().to_string(), random)]),
            canary: None,
            accessors: Arc::new(PartitionAccessorRegistry::new()),
            config: LoadBalancerConfig::default(),
        }
    }

    /// Register the factory of transport clients for `scheme`, e.g. `http`.
    pub fn transport_factory<F>(mut self, scheme: &str, factory: F) -> Self
    where
        F: TransportClientFactory + 'static,
    {
        self.transport_factories
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    /// Register a strategy factory under its [`name`](LoadBalancerStrategyFactory::name).
    pub fn strategy_factory<F>(mut self, factory: F) -> Self
    where
        F: LoadBalancerStrategyFactory + 'static,
    {
        self.strategy_factories
            .insert(factory.name().to_string(), Arc::new(factory));
        self
    }

    /// Set the provider deciding between stable and canary properties.
    /// Without one, the stable properties are always used.
    pub fn canary_provider<P>(self, provider: P) -> Self
    where
        P: CanaryDistributionProvider + 'static,
    {
        Self {
            canary: Some(Arc::new(provider)),
            ..self
        }
    }

    /// Register a custom partition accessor for `cluster`.
    pub fn partition_accessor<A>(self, cluster: &str, accessor: A) -> Self
    where
        A: CustomPartitionAccessor + 'static,
    {
        self.accessors.register(cluster, Arc::new(accessor));
        self
    }

    /// How long routing waits for properties it has not received yet.
    /// Default is 5 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// How long a replaced transport client stays alive before it is shut down.
    /// Default is 1 second.
    pub fn teardown_delay(mut self, delay: Duration) -> Self {
        self.config.teardown_delay = delay;
        self
    }

    pub fn enable_routing_table(mut self, enabled: bool) -> Self {
        self.config.enable_routing_table = enabled;
        self
    }

    /// Allow `https` endpoints. Disabled by default.
    pub fn ssl_enabled(mut self, enabled: bool) -> Self {
        self.config.ssl_enabled = enabled;
        self
    }

    /// The scheme of logical request uris. Default is `d2`.
    pub fn routing_scheme(mut self, scheme: &str) -> Self {
        self.config.routing_scheme = scheme.to_string();
        self
    }

    pub fn config(self, config: LoadBalancerConfig) -> Self {
        Self { config, ..self }
    }

    /// Construct a [`SimpleLoadBalancer`]. Must be called within a tokio runtime.
    pub fn build(self) -> Result<SimpleLoadBalancer, anyhow::Error> {
        anyhow::ensure!(
            !self.config.routing_scheme.is_empty(),
            "the routing scheme must not be empty"
        );
        if self.transport_factories.is_empty() {
            tracing::warn!("no transport client factory registered, no endpoint will be reachable");
        }
        let executor = PropertyEventExecutor::spawn()
            .context("the load balancer must be built within a tokio runtime")?;
        let timeout = self.config.timeout;
        let core = StateCore {
            store: PropertyStore::default(),
            executor,
            transport_factories: self.transport_factories,
            strategy_factories: self.strategy_factories,
            listeners: Listeners::default(),
            cluster_listeners: Listeners::default(),
            canary: self.canary,
            accessors: self.accessors,
            config: self.config,
        };
        Ok(SimpleLoadBalancer {
            state: Arc::new(LoadBalancerState::new(core, self.sources)),
            stats: Arc::default(),
            timeout,
        })
    }
}

const _: () = {
    const fn assert_is_send<T: Send + Sync>() {}
    assert_is_send::<LoadBalancerBuilder>();
    assert_is_send::<SimpleLoadBalancer>();
};
