//! Reactions to discovery events. Every function here runs on the event
//! queue, so it is the only writer of the store while it runs.

use crate::canary::{self, Distribution};
use crate::error::HandlerError;
use crate::partition::build_accessor;
use crate::properties::{scheme_of, ClusterProperties, PartitionData, ServiceProperties, StoreProperties, UriProperties};
use crate::routing_table::PartitionRoutingTable;
use crate::state::StateCore;
use crate::store::{ClusterEntry, ServiceEntry, Strategies, TrackerClients, TransportClients};
use crate::tracker_client::TrackerClient;
use crate::transport::{TransportClient, TransportClientConfig};
use crate::versioned::VersionedItem;
use http::Uri;
use std::collections::HashMap;
use std::sync::Arc;

impl StateCore {
    pub(crate) fn cluster_put(
        &self,
        name: &str,
        value: Option<StoreProperties<ClusterProperties>>,
    ) -> Result<(), HandlerError> {
        let value = match value {
            Some(value) => value,
            None => {
                tracing::warn!(cluster = name, "received cluster without data");
                let version = self.store.version.next();
                self.store.clusters.insert(
                    name.to_string(),
                    Arc::new(ClusterEntry::new(None, None, version, Distribution::Stable)),
                );
                return Ok(());
            }
        };

        let (cluster, distribution) = canary::select(value, self.canary.as_deref());
        let accessor = build_accessor(&cluster, &self.accessors)?;
        let version = self.store.version.next();
        self.store.clusters.insert(
            name.to_string(),
            Arc::new(ClusterEntry::new(
                Some(Arc::new(cluster)),
                Some(accessor),
                version,
                distribution,
            )),
        );
        tracing::info!(cluster = name, version, ?distribution, "installed cluster properties");

        // Services lose their clients when their cluster is removed.
        for service in self.store.services_for_cluster(name).iter() {
            if !self.store.transport_clients.contains_key(service) {
                if let Some(properties) = self.store.service_properties(service) {
                    match self.build_transport_clients(service, &properties) {
                        Ok(clients) => {
                            self.store
                                .transport_clients
                                .insert(service.clone(), Arc::new(clients));
                            self.rebuild_tracker_clients(service, &properties);
                        }
                        Err(error) => {
                            tracing::error!(service = service.as_str(), error = %error, "failed to restore transport clients")
                        }
                    }
                }
            }
            self.rebuild_routing_table(service);
        }

        self.cluster_listeners.for_each(|l| l.on_cluster_added(name));
        Ok(())
    }

    pub(crate) fn cluster_remove(&self, name: &str) {
        self.store.version.next();
        if self.store.clusters.remove(name).is_none() {
            tracing::debug!(cluster = name, "removal of unknown cluster");
        }
        for service in self.store.services_for_cluster(name).iter() {
            self.shutdown_service_clients(service);
            self.store.routing_tables.remove(service);
        }
        tracing::info!(cluster = name, "removed cluster");
        self.cluster_listeners.for_each(|l| l.on_cluster_removed(name));
    }

    pub(crate) fn service_put(
        &self,
        name: &str,
        value: Option<StoreProperties<ServiceProperties>>,
    ) -> Result<(), HandlerError> {
        let value = match value {
            Some(value) => value,
            None => {
                tracing::warn!(service = name, "received service without data");
                if let Some(previous) = self.store.service_properties(name) {
                    self.store
                        .remove_service_from_cluster(previous.cluster_name(), name);
                }
                let item = self.store.version.stamp(None);
                self.store.services.insert(
                    name.to_string(),
                    Arc::new(ServiceEntry::new(item, Distribution::Stable)),
                );
                return Ok(());
            }
        };

        let (service, distribution) = canary::select(value, self.canary.as_deref());
        let transports = self.build_transport_clients(name, &service)?;
        let service = Arc::new(service);

        let previous = self.store.service_properties(name);
        let item = self.store.version.stamp(Some(service.clone()));
        let version = item.version();
        self.store.services.insert(
            name.to_string(),
            Arc::new(ServiceEntry::new(item, distribution)),
        );

        let previous_cluster = previous.as_ref().map(|p| p.cluster_name());
        if previous_cluster != Some(service.cluster_name()) {
            if let Some(previous_cluster) = previous_cluster {
                tracing::info!(
                    service = name,
                    from = previous_cluster,
                    to = service.cluster_name(),
                    "service moved to another cluster"
                );
                self.store.remove_service_from_cluster(previous_cluster, name);
            }
            self.store.add_service_to_cluster(service.cluster_name(), name);
        }

        self.refresh_strategies(name, &service);
        let replaced = self
            .store
            .transport_clients
            .insert(name.to_string(), Arc::new(transports));
        self.rebuild_tracker_clients(name, &service);
        if let Some(replaced) = replaced {
            self.schedule_transport_shutdown(name, replaced);
        }
        self.rebuild_routing_table(name);
        tracing::info!(service = name, version, ?distribution, "installed service properties");
        Ok(())
    }

    pub(crate) fn service_remove(&self, name: &str) {
        self.store.version.next();
        if let Some((_, entry)) = self.store.services.remove(name) {
            if let Some(properties) = entry.properties().value() {
                self.store
                    .remove_service_from_cluster(properties.cluster_name(), name);
            }
        }
        self.shutdown_service_clients(name);
        if let Some(strategies) = self.store.remove_strategies(name) {
            self.release_strategies(name, &strategies);
        }
        self.store.routing_tables.remove(name);
        tracing::info!(service = name, "removed service");
    }

    pub(crate) fn uri_put(&self, cluster: &str, value: Option<UriProperties>) -> Result<(), HandlerError> {
        let version = self.store.version.next();
        let uris = match value {
            Some(uris) => Arc::new(uris),
            None => {
                tracing::warn!(cluster, "received endpoints without data");
                self.store
                    .uris
                    .insert(cluster.to_string(), VersionedItem::new(None, version));
                return Ok(());
            }
        };

        let services = self.store.services_for_cluster(cluster);
        for service in services.iter() {
            self.update_tracker_clients(service, &uris);
        }
        tracing::debug!(cluster, version, endpoints = uris.len(), "installed endpoints");
        self.store
            .uris
            .insert(cluster.to_string(), VersionedItem::new(Some(uris), version));
        for service in services.iter() {
            self.rebuild_routing_table(service);
        }
        Ok(())
    }

    pub(crate) fn uri_remove(&self, cluster: &str) {
        self.store.version.next();
        self.store.uris.remove(cluster);
        tracing::warn!(cluster, "removing all tracker clients of cluster");
        for service in self.store.services_for_cluster(cluster).iter() {
            if let Some((_, clients)) = self.store.tracker_clients.remove(service) {
                self.notify_clients_removed(service, clients.values());
            }
            self.rebuild_routing_table(service);
        }
    }

    /// Tear down everything, returning the transport clients left to shut down.
    pub(crate) fn release_all(&self) -> Vec<(String, String, Arc<dyn TransportClient>)> {
        let strategies: Vec<(String, Arc<Strategies>)> = self
            .store
            .strategies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (service, strategies) in &strategies {
            self.release_strategies(service, strategies);
        }

        let trackers: Vec<(String, Arc<TrackerClients>)> = self
            .store
            .tracker_clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (service, clients) in &trackers {
            self.notify_clients_removed(service, clients.values());
        }

        let transports = self
            .store
            .transport_clients
            .iter()
            .flat_map(|e| {
                let service = e.key().clone();
                e.value()
                    .iter()
                    .map(|(scheme, client)| (service.clone(), scheme.clone(), client.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let clusters: Vec<String> = self.store.clusters.iter().map(|e| e.key().clone()).collect();
        for cluster in &clusters {
            self.cluster_listeners.for_each(|l| l.on_cluster_removed(cluster));
        }
        transports
    }

    fn build_transport_clients(
        &self,
        service_name: &str,
        service: &ServiceProperties,
    ) -> Result<TransportClients, HandlerError> {
        let mut clients = TransportClients::new();
        if service.prioritized_schemes().is_empty() {
            tracing::warn!(service = service_name, "service has no prioritized schemes");
        }
        for scheme in service.prioritized_schemes() {
            let scheme = scheme.to_ascii_lowercase();
            if !self.config.supports_scheme(&scheme) {
                tracing::debug!(service = service_name, scheme = scheme.as_str(), "ssl disabled, skipping scheme");
                continue;
            }
            let factory = match self.transport_factories.get(&scheme) {
                Some(factory) => factory,
                None => {
                    tracing::warn!(service = service_name, scheme = scheme.as_str(), "no transport client factory for scheme");
                    continue;
                }
            };
            let config = TransportClientConfig {
                service_name,
                scheme: &scheme,
                properties: service.transport_client_properties(),
            };
            match factory.client(&config) {
                Ok(client) => {
                    clients.insert(scheme, client);
                }
                Err(source) => {
                    // Clients created so far are not installed anywhere.
                    self.schedule_transport_shutdown(service_name, Arc::new(clients));
                    return Err(HandlerError::TransportClient { scheme, source });
                }
            }
        }
        Ok(clients)
    }

    fn refresh_strategies(&self, name: &str, service: &ServiceProperties) {
        let factory = service
            .strategy_list()
            .iter()
            .find_map(|strategy| self.strategy_factories.get(strategy));

        let mut strategies = Strategies::new();
        match factory {
            Some(factory) => {
                for scheme in service.prioritized_schemes() {
                    match factory.new_strategy(service) {
                        Ok(strategy) => {
                            strategies.insert(scheme.to_ascii_lowercase(), strategy);
                        }
                        Err(source) => {
                            let error = HandlerError::Strategy {
                                name: factory.name().to_string(),
                                source,
                            };
                            tracing::error!(service = name, scheme = scheme.as_str(), error = %error, "failed to create strategy");
                        }
                    }
                }
            }
            None => tracing::warn!(
                service = name,
                strategies = ?service.strategy_list(),
                "no registered strategy factory for service"
            ),
        }

        let strategies = Arc::new(strategies);
        if let Some(old) = self.store.replace_strategies(name, strategies.clone()) {
            self.release_strategies(name, &old);
        }
        // Removals are announced before additions.
        self.listeners.for_each(|l| {
            for (scheme, strategy) in strategies.iter() {
                l.on_strategy_added(name, scheme, strategy);
            }
        });
    }

    fn release_strategies(&self, service: &str, strategies: &Strategies) {
        for strategy in strategies.values() {
            strategy.shutdown();
        }
        self.listeners.for_each(|l| {
            for (scheme, strategy) in strategies.iter() {
                l.on_strategy_removed(service, scheme, strategy);
            }
        });
    }

    fn build_tracker_client(
        &self,
        service: &str,
        uri: &Uri,
        partitions: &HashMap<i32, PartitionData>,
        transports: Option<&TransportClients>,
    ) -> Option<Arc<TrackerClient>> {
        let transports = match transports {
            Some(transports) => transports,
            None => {
                tracing::error!(service, %uri, "no transport clients for service");
                return None;
            }
        };
        let scheme = match scheme_of(uri) {
            Some(scheme) => scheme,
            None => {
                tracing::error!(service, %uri, "endpoint has no scheme");
                return None;
            }
        };
        match transports.get(&scheme) {
            Some(transport) => Some(Arc::new(TrackerClient::new(
                uri.clone(),
                partitions.clone(),
                transport.clone(),
            ))),
            None => {
                tracing::debug!(service, %uri, scheme = scheme.as_str(), "no transport client for the endpoint's scheme");
                None
            }
        }
    }

    /// Replace every tracker client of `service` with ones built from the
    /// current endpoints of its cluster.
    fn rebuild_tracker_clients(&self, name: &str, service: &ServiceProperties) {
        let transports = self.store.transport_clients(name);
        let mut clients = TrackerClients::new();
        if let Some(uris) = self.store.uri_properties(service.cluster_name()) {
            for (uri, partitions) in uris.partition_data() {
                if let Some(client) = self.build_tracker_client(name, uri, partitions, transports.as_deref()) {
                    clients.insert(uri.clone(), client);
                }
            }
        }
        let clients = Arc::new(clients);
        if let Some(old) = self.store.tracker_clients.insert(name.to_string(), clients.clone()) {
            self.notify_clients_removed(name, old.values());
        }
        self.notify_clients_added(name, clients.values());
    }

    /// Apply a new endpoint set to the tracker clients of `service`.
    ///
    /// A tracker client is only rebuilt when its partition weights changed.
    fn update_tracker_clients(&self, service: &str, uris: &UriProperties) {
        if !self.store.services.contains_key(service) {
            return;
        }
        let transports = self.store.transport_clients(service);
        let current = self.store.tracker_clients(service).unwrap_or_default();
        let mut next = (*current).clone();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for (uri, partitions) in uris.partition_data() {
            let unchanged = current
                .get(uri)
                .map_or(false, |client| client.partition_data() == partitions);
            if unchanged {
                continue;
            }
            let replaced = match self.build_tracker_client(service, uri, partitions, transports.as_deref()) {
                Some(client) => {
                    added.push(client.clone());
                    next.insert(uri.clone(), client)
                }
                None => next.remove(uri),
            };
            removed.extend(replaced);
        }
        for uri in current.keys() {
            if !uris.contains(uri) {
                removed.extend(next.remove(uri));
            }
        }

        if added.is_empty() && removed.is_empty() && self.store.tracker_clients.contains_key(service) {
            return;
        }
        self.store
            .tracker_clients
            .insert(service.to_string(), Arc::new(next));
        self.notify_clients_removed(service, removed.iter());
        self.notify_clients_added(service, added.iter());
    }

    /// Drop the tracker clients of `service` and shut its transport clients
    /// down after the grace period.
    fn shutdown_service_clients(&self, service: &str) {
        tracing::warn!(service, "shutting down tracker and transport clients");
        if let Some((_, clients)) = self.store.tracker_clients.remove(service) {
            self.notify_clients_removed(service, clients.values());
        }
        if let Some((_, transports)) = self.store.transport_clients.remove(service) {
            self.schedule_transport_shutdown(service, transports);
        }
    }

    /// Requests that already hold one of `clients` get `teardown_delay` to finish.
    fn schedule_transport_shutdown(&self, service: &str, clients: Arc<TransportClients>) {
        if clients.is_empty() {
            return;
        }
        let service = service.to_string();
        self.executor.schedule(self.config.teardown_delay, move || {
            for (scheme, client) in clients.iter() {
                let (service, scheme, client) = (service.clone(), scheme.clone(), client.clone());
                tokio::spawn(async move {
                    match client.shutdown().await {
                        Ok(()) => tracing::info!(service = service.as_str(), scheme = scheme.as_str(), "shut down old transport client"),
                        Err(error) => {
                            tracing::warn!(service = service.as_str(), scheme = scheme.as_str(), error = %error, "failed to shut down old transport client")
                        }
                    }
                });
            }
        });
    }

    fn rebuild_routing_table(&self, service: &str) {
        if !self.config.enable_routing_table {
            return;
        }
        let properties = self.store.service_properties(service);
        let (cluster, uris) = match &properties {
            Some(p) => (
                self.store.cluster_properties(p.cluster_name()),
                self.store.uri_properties(p.cluster_name()),
            ),
            None => (None, None),
        };
        let trackers = self.store.tracker_clients(service);
        match PartitionRoutingTable::build(
            uris.as_deref(),
            properties.as_deref(),
            cluster.as_deref(),
            trackers.as_deref(),
        ) {
            Some(table) => {
                self.store
                    .routing_tables
                    .insert(service.to_string(), Arc::new(table));
            }
            None => {
                self.store.routing_tables.remove(service);
            }
        }
    }

    fn notify_clients_added<'a>(&self, service: &str, clients: impl Iterator<Item = &'a Arc<TrackerClient>> + Clone) {
        self.listeners.for_each(|l| {
            for client in clients.clone() {
                l.on_client_added(service, client);
            }
        });
    }

    fn notify_clients_removed<'a>(&self, service: &str, clients: impl Iterator<Item = &'a Arc<TrackerClient>> + Clone) {
        self.listeners.for_each(|l| {
            for client in clients.clone() {
                l.on_client_removed(service, client);
            }
        });
    }
}
