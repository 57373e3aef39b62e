use crate::properties::{scheme_of, ClusterProperties, ServiceProperties, UriProperties};
use crate::strategy::Candidates;
use crate::tracker_client::TrackerClient;
use http::Uri;
use std::collections::HashMap;
use std::sync::Arc;

/// Precomputed candidates of a service, per scheme and partition.
///
/// A table is built in one go and never modified afterwards. Handlers
/// replace the table of a service whenever one of its inputs changes.
#[derive(Debug, Default)]
pub struct PartitionRoutingTable {
    clients: HashMap<String, HashMap<i32, Arc<Candidates>>>,
    weights: HashMap<String, HashMap<i32, Arc<HashMap<Uri, f64>>>>,
}

impl PartitionRoutingTable {
    /// Build the table of a service, `None` if any input is missing.
    ///
    /// Endpoints banned by the service or the cluster are left out. Weights
    /// are recorded for every other endpoint, clients only for endpoints that
    /// currently have a tracker client.
    pub fn build(
        uris: Option<&UriProperties>,
        service: Option<&ServiceProperties>,
        cluster: Option<&ClusterProperties>,
        tracker_clients: Option<&HashMap<Uri, Arc<TrackerClient>>>,
    ) -> Option<Self> {
        let (uris, service, cluster, tracker_clients) = (uris?, service?, cluster?, tracker_clients?);

        let mut clients: HashMap<String, HashMap<i32, Candidates>> = HashMap::new();
        let mut weights: HashMap<String, HashMap<i32, HashMap<Uri, f64>>> = HashMap::new();
        for (uri, partitions) in uris.partition_data() {
            if service.is_banned(uri) || cluster.is_banned(uri) {
                continue;
            }
            let scheme = match scheme_of(uri) {
                Some(scheme) => scheme,
                None => continue,
            };
            let tracker_client = tracker_clients.get(uri);
            for (partition_id, data) in partitions {
                weights
                    .entry(scheme.clone())
                    .or_default()
                    .entry(*partition_id)
                    .or_default()
                    .insert(uri.clone(), data.weight());
                if let Some(tracker_client) = tracker_client {
                    clients
                        .entry(scheme.clone())
                        .or_default()
                        .entry(*partition_id)
                        .or_default()
                        .insert(uri.clone(), tracker_client.clone());
                }
            }
        }

        Some(Self {
            clients: freeze(clients),
            weights: freeze(weights),
        })
    }

    /// Candidates for `(scheme, partition_id)`.
    pub fn clients(&self, scheme: &str, partition_id: i32) -> Option<&Arc<Candidates>> {
        self.clients.get(scheme)?.get(&partition_id)
    }

    pub fn weights(&self, scheme: &str, partition_id: i32) -> Option<&Arc<HashMap<Uri, f64>>> {
        self.weights.get(scheme)?.get(&partition_id)
    }

    /// Every `(scheme, partition)` pair that has at least one weighted endpoint.
    pub fn keys(&self) -> impl Iterator<Item = (&str, i32)> {
        self.weights
            .iter()
            .flat_map(|(scheme, partitions)| partitions.keys().map(move |p| (scheme.as_str(), *p)))
    }
}

fn freeze<V>(maps: HashMap<String, HashMap<i32, V>>) -> HashMap<String, HashMap<i32, Arc<V>>> {
    maps.into_iter()
        .map(|(scheme, partitions)| {
            let partitions = partitions.into_iter().map(|(p, v)| (p, Arc::new(v))).collect();
            (scheme, partitions)
        })
        .collect()
}
