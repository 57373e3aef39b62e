//! Error types surfaced by routing and by property handling.

use crate::properties::PropertyKind;

/// Boxed error returned by transport clients.
pub use tower::BoxError;

/// The only error a routing call returns: the service could not be served.
#[derive(Debug, thiserror::Error)]
#[error("service `{service}` is unavailable: {reason}")]
pub struct ServiceUnavailable {
    service: String,
    #[source]
    reason: Reason,
}

impl ServiceUnavailable {
    pub fn new<T: ToString>(service: T, reason: Reason) -> Self {
        Self {
            service: service.to_string(),
            reason,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn reason(&self) -> &Reason {
        &self.reason
    }
}

/// Why a service could not be routed to.
#[derive(Debug, thiserror::Error)]
pub enum Reason {
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("no service properties have ever been received")]
    ServiceUnknown,
    #[error("no properties have ever been received for cluster `{0}`")]
    ClusterUnknown(String),
    #[error("{kind} `{name}` was received without data")]
    PropertyUnavailable { kind: PropertyKind, name: String },
    #[error("could not resolve a partition: {0}")]
    PartitionResolutionFailed(#[source] PartitionAccessError),
    #[error("no host available for partition {partition}")]
    NoAvailableHost { partition: i32 },
    #[error("every host of partition {partition} was rejected by the strategy")]
    AllCandidatesRejected { partition: i32 },
    #[error("no load balancer strategy is configured for any supported scheme")]
    NoStrategyConfigured,
    #[error("no transport client for scheme `{0}`")]
    NoTransportClient(String),
    #[error("transport failure: {0}")]
    Transport(#[source] BoxError),
}

/// Failure to map a key or uri onto a partition.
#[derive(Debug, thiserror::Error)]
pub enum PartitionAccessError {
    #[error("no partition key found in `{0}`")]
    KeyNotFound(String),
    #[error("partition key `{0}` is not numeric")]
    InvalidKey(String),
    #[error("no partition data for host `{0}`")]
    UnknownHost(String),
    #[error("partition key {key} is outside of [{start}, {end})")]
    OutOfRange { key: i64, start: i64, end: i64 },
    #[error(transparent)]
    Custom(#[from] anyhow::Error),
}

/// Failure while applying a discovery event. Logged by the event queue, never
/// returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid partition key regex `{pattern}`")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid partition layout: {0}")]
    InvalidPartitioning(String),
    #[error("failed to create a transport client for scheme `{scheme}`")]
    TransportClient {
        scheme: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create strategy `{name}`")]
    Strategy {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}
