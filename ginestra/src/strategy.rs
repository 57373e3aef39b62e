//! Load balancer strategies: the pluggable policy that picks one endpoint out
//! of the candidates of a partition.

use crate::partition::fnv1a_64;
use crate::properties::ServiceProperties;
use crate::request::RouteRequest;
use crate::tracker_client::TrackerClient;
use http::Uri;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Candidate endpoints of one (scheme, partition), keyed by endpoint uri.
pub type Candidates = HashMap<Uri, Arc<TrackerClient>>;

/// Picks the endpoint a request is sent to.
pub trait LoadBalancerStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Pick one of `candidates`, or `None` to reject all of them (e.g. while
    /// shedding load).
    ///
    /// `version` is the state version the candidates were read at.
    fn pick(
        &self,
        request: &RouteRequest<'_>,
        version: u64,
        partition_id: i32,
        candidates: &Candidates,
    ) -> Option<Arc<TrackerClient>>;

    /// The hash ring over `candidates`, used for key affinity queries.
    fn ring(&self, version: u64, partition_id: i32, candidates: &Candidates) -> Ring;

    /// Called once the strategy has been replaced.
    fn shutdown(&self) {}
}

/// Creates the strategy instance of one scheme of one service.
pub trait LoadBalancerStrategyFactory: Send + Sync {
    /// The name services list in their strategy list.
    fn name(&self) -> &str;

    fn new_strategy(
        &self,
        service: &ServiceProperties,
    ) -> Result<Arc<dyn LoadBalancerStrategy>, anyhow::Error>;
}

/// A scheme together with the strategy balancing its endpoints.
#[derive(Clone)]
pub struct SchemeStrategyPair {
    scheme: String,
    strategy: Arc<dyn LoadBalancerStrategy>,
}

impl fmt::Debug for SchemeStrategyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeStrategyPair")
            .field("scheme", &self.scheme)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl SchemeStrategyPair {
    pub fn new<T: ToString>(scheme: T, strategy: Arc<dyn LoadBalancerStrategy>) -> Self {
        Self {
            scheme: scheme.to_string(),
            strategy,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn strategy(&self) -> &Arc<dyn LoadBalancerStrategy> {
        &self.strategy
    }
}

/// A consistent hash ring over endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ring {
    points: BTreeMap<u64, Uri>,
}

impl Ring {
    /// Place `points` hash points for every endpoint on the ring.
    pub fn new<I: IntoIterator<Item = (Uri, u32)>>(endpoints: I) -> Self {
        let mut points = BTreeMap::new();
        for (uri, count) in endpoints {
            let name = uri.to_string();
            for i in 0..count {
                points.insert(fnv1a_64(format!("{}-{}", name, i).as_bytes()), uri.clone());
            }
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// The endpoint owning `hash`: the first point at or after it, wrapping around.
    pub fn get(&self, hash: u64) -> Option<&Uri> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, uri)| uri)
    }

    /// Distinct endpoints in ring order, starting at `hash`.
    pub fn hosts_from(&self, hash: u64) -> Vec<Uri> {
        let mut seen = HashSet::new();
        self.points
            .range(hash..)
            .chain(self.points.range(..hash))
            .filter(|(_, uri)| seen.insert(*uri))
            .map(|(_, uri)| uri.clone())
            .collect()
    }

    pub fn hosts(&self) -> HashSet<Uri> {
        self.points.values().cloned().collect()
    }
}

/// Creates [`RandomStrategy`] instances, registered as `"random"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategyFactory;

impl RandomStrategyFactory {
    pub const NAME: &'static str = "random";
}

impl LoadBalancerStrategyFactory for RandomStrategyFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_strategy(
        &self,
        _service: &ServiceProperties,
    ) -> Result<Arc<dyn LoadBalancerStrategy>, anyhow::Error> {
        Ok(Arc::new(RandomStrategy))
    }
}

/// Picks a candidate at random, proportionally to its weight in the partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStrategy;

const POINTS_PER_WEIGHT: f64 = 100.0;

impl LoadBalancerStrategy for RandomStrategy {
    fn name(&self) -> &str {
        RandomStrategyFactory::NAME
    }

    fn pick(
        &self,
        _request: &RouteRequest<'_>,
        _version: u64,
        partition_id: i32,
        candidates: &Candidates,
    ) -> Option<Arc<TrackerClient>> {
        let weighted: Vec<(&Arc<TrackerClient>, f64)> = candidates
            .values()
            .filter_map(|c| c.weight(partition_id).map(|w| (c, w)))
            .filter(|(_, w)| *w > 0.0)
            .collect();
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if weighted.is_empty() || total <= 0.0 {
            return None;
        }

        let mut target = rand::thread_rng().gen_range(0.0..total);
        for (client, weight) in &weighted {
            if target < *weight {
                return Some(Arc::clone(client));
            }
            target -= weight;
        }
        // Rounding can leave `target` just above the last weight.
        weighted.last().map(|(c, _)| Arc::clone(c))
    }

    fn ring(&self, _version: u64, partition_id: i32, candidates: &Candidates) -> Ring {
        Ring::new(candidates.values().filter_map(|c| {
            let points = (c.weight(partition_id)? * POINTS_PER_WEIGHT).round();
            (points >= 1.0).then(|| (c.uri().clone(), points as u32))
        }))
    }
}
