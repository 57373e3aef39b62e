use crate::properties::PartitionData;
use crate::transport::TransportClient;
use http::Uri;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Binds one endpoint of a service to its partition weights and to the
/// service's transport client for the endpoint's scheme.
///
/// Tracker clients are never updated: a change of the partition weights
/// produces a new tracker client.
pub struct TrackerClient {
    uri: Uri,
    partitions: HashMap<i32, PartitionData>,
    transport: Arc<dyn TransportClient>,
}

impl fmt::Debug for TrackerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerClient")
            .field("uri", &self.uri)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl TrackerClient {
    pub fn new(
        uri: Uri,
        partitions: HashMap<i32, PartitionData>,
        transport: Arc<dyn TransportClient>,
    ) -> Self {
        Self {
            uri,
            partitions,
            transport,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn partition_data(&self) -> &HashMap<i32, PartitionData> {
        &self.partitions
    }

    /// Weight in `partition_id`, `None` if the endpoint does not serve it.
    pub fn weight(&self, partition_id: i32) -> Option<f64> {
        self.partitions.get(&partition_id).map(PartitionData::weight)
    }

    pub fn transport(&self) -> &Arc<dyn TransportClient> {
        &self.transport
    }
}
