//! Mapping request uris and keys onto cluster partitions.

use crate::error::{HandlerError, PartitionAccessError};
use crate::properties::{ClusterProperties, HashAlgorithm, PartitionProperties};
use dashmap::DashMap;
use http::Uri;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Resolves the partition a key (or a request uri) belongs to.
pub trait PartitionAccessor: Send + Sync + fmt::Debug {
    fn partition_id_for_key(&self, key: &str) -> Result<i32, PartitionAccessError>;

    /// The partition of the key carried by `uri`.
    ///
    /// The default treats the whole uri as the key.
    fn partition_id_for_uri(&self, uri: &Uri) -> Result<i32, PartitionAccessError> {
        self.partition_id_for_key(&uri.to_string())
    }

    /// The highest partition id, partitions are numbered `0..=max_partition_id()`.
    fn max_partition_id(&self) -> i32;
}

/// User supplied partitioning logic for [`PartitionProperties::Custom`] clusters.
pub trait CustomPartitionAccessor: Send + Sync {
    /// Name matched against the accessor names listed in the cluster properties.
    fn name(&self) -> &str;

    fn partition_id(&self, key: &str) -> Result<i32, anyhow::Error>;

    fn partition_id_for_uri(&self, uri: &Uri) -> Result<i32, anyhow::Error> {
        self.partition_id(&uri.to_string())
    }
}

/// Custom accessors, registered per cluster.
#[derive(Default)]
pub struct PartitionAccessorRegistry {
    accessors: DashMap<String, Vec<Arc<dyn CustomPartitionAccessor>>>,
}

impl fmt::Debug for PartitionAccessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionAccessorRegistry")
            .field("clusters", &self.accessors.len())
            .finish()
    }
}

impl PartitionAccessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ToString>(&self, cluster_name: T, accessor: Arc<dyn CustomPartitionAccessor>) {
        self.accessors
            .entry(cluster_name.to_string())
            .or_default()
            .push(accessor);
    }

    /// The first accessor registered for `cluster_name` whose name is in `allowed`.
    pub fn find(&self, cluster_name: &str, allowed: &[String]) -> Option<Arc<dyn CustomPartitionAccessor>> {
        self.accessors.get(cluster_name).and_then(|accessors| {
            accessors
                .iter()
                .find(|a| allowed.iter().any(|name| name == a.name()))
                .cloned()
        })
    }
}

/// Build the accessor described by a cluster's partition properties.
pub(crate) fn build_accessor(
    cluster: &ClusterProperties,
    registry: &PartitionAccessorRegistry,
) -> Result<Arc<dyn PartitionAccessor>, HandlerError> {
    let accessor: Arc<dyn PartitionAccessor> = match cluster.partition() {
        PartitionProperties::None => Arc::new(DefaultPartitionAccessor),
        PartitionProperties::Range {
            key_regex,
            key_range_start,
            partition_size,
            partition_count,
        } => {
            if *partition_size <= 0 || *partition_count <= 0 {
                return Err(HandlerError::InvalidPartitioning(format!(
                    "range partitioning needs a positive size and count, got {} and {}",
                    partition_size, partition_count
                )));
            }
            Arc::new(RangePartitionAccessor {
                key_regex: compile(key_regex)?,
                start: *key_range_start,
                size: *partition_size,
                count: *partition_count,
            })
        }
        PartitionProperties::Hash {
            key_regex,
            partition_count,
            algorithm,
        } => {
            if *partition_count <= 0 {
                return Err(HandlerError::InvalidPartitioning(format!(
                    "hash partitioning needs a positive count, got {}",
                    partition_count
                )));
            }
            Arc::new(HashPartitionAccessor {
                key_regex: compile(key_regex)?,
                count: *partition_count,
                algorithm: *algorithm,
            })
        }
        PartitionProperties::Custom {
            partition_count,
            accessors,
        } => match registry.find(cluster.cluster_name(), accessors) {
            Some(inner) => Arc::new(CustomAccessorAdapter {
                inner,
                max_partition_id: partition_count.saturating_sub(1).max(0),
            }),
            None => {
                tracing::warn!(
                    cluster = cluster.cluster_name(),
                    ?accessors,
                    "no custom partition accessor registered, using a single partition"
                );
                Arc::new(DefaultPartitionAccessor)
            }
        },
    };
    Ok(accessor)
}

fn compile(pattern: &str) -> Result<Regex, HandlerError> {
    Regex::new(pattern).map_err(|source| HandlerError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

fn extract_key<'a>(regex: &Regex, uri: &'a str) -> Result<&'a str, PartitionAccessError> {
    regex
        .captures(uri)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| PartitionAccessError::KeyNotFound(uri.to_string()))
}

fn parse_key(key: &str) -> Result<i64, PartitionAccessError> {
    key.trim()
        .parse()
        .map_err(|_| PartitionAccessError::InvalidKey(key.to_string()))
}

/// The accessor of unpartitioned clusters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitionAccessor;

impl PartitionAccessor for DefaultPartitionAccessor {
    fn partition_id_for_key(&self, _key: &str) -> Result<i32, PartitionAccessError> {
        Ok(0)
    }

    fn partition_id_for_uri(&self, _uri: &Uri) -> Result<i32, PartitionAccessError> {
        Ok(0)
    }

    fn max_partition_id(&self) -> i32 {
        0
    }
}

#[derive(Debug)]
struct RangePartitionAccessor {
    key_regex: Regex,
    start: i64,
    size: i64,
    count: i32,
}

impl PartitionAccessor for RangePartitionAccessor {
    fn partition_id_for_key(&self, key: &str) -> Result<i32, PartitionAccessError> {
        let key = parse_key(key)?;
        let end = self
            .start
            .saturating_add(self.size.saturating_mul(i64::from(self.count)));
        let out_of_range = || PartitionAccessError::OutOfRange {
            key,
            start: self.start,
            end,
        };
        if key < self.start || key >= end {
            return Err(out_of_range());
        }
        let offset = key.checked_sub(self.start).ok_or_else(out_of_range)?;
        // In range, so the quotient is below `count` and fits an i32.
        Ok((offset / self.size) as i32)
    }

    fn partition_id_for_uri(&self, uri: &Uri) -> Result<i32, PartitionAccessError> {
        let uri = uri.to_string();
        self.partition_id_for_key(extract_key(&self.key_regex, &uri)?)
    }

    fn max_partition_id(&self) -> i32 {
        self.count - 1
    }
}

#[derive(Debug)]
struct HashPartitionAccessor {
    key_regex: Regex,
    count: i32,
    algorithm: HashAlgorithm,
}

impl PartitionAccessor for HashPartitionAccessor {
    fn partition_id_for_key(&self, key: &str) -> Result<i32, PartitionAccessError> {
        let partition = match self.algorithm {
            HashAlgorithm::Modulo => (parse_key(key)? % i64::from(self.count)).abs(),
            HashAlgorithm::Fnv => (fnv1a_64(key.as_bytes()) % self.count as u64) as i64,
        };
        Ok(partition as i32)
    }

    fn partition_id_for_uri(&self, uri: &Uri) -> Result<i32, PartitionAccessError> {
        let uri = uri.to_string();
        self.partition_id_for_key(extract_key(&self.key_regex, &uri)?)
    }

    fn max_partition_id(&self) -> i32 {
        self.count - 1
    }
}

pub(crate) fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

struct CustomAccessorAdapter {
    inner: Arc<dyn CustomPartitionAccessor>,
    max_partition_id: i32,
}

impl fmt::Debug for CustomAccessorAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomAccessorAdapter")
            .field("name", &self.inner.name())
            .field("max_partition_id", &self.max_partition_id)
            .finish()
    }
}

impl PartitionAccessor for CustomAccessorAdapter {
    fn partition_id_for_key(&self, key: &str) -> Result<i32, PartitionAccessError> {
        Ok(self.inner.partition_id(key)?)
    }

    fn partition_id_for_uri(&self, uri: &Uri) -> Result<i32, PartitionAccessError> {
        Ok(self.inner.partition_id_for_uri(uri)?)
    }

    fn max_partition_id(&self) -> i32 {
        self.max_partition_id
    }
}
