use ginestra::{
    Candidates, LoadBalancerStrategy, LoadBalancerStrategyFactory, Ring, RouteRequest, ServiceProperties,
    TrackerClient,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Always picks the candidate with the lowest uri, registered as `"first"`.
#[derive(Debug, Clone, Default)]
pub struct FirstStrategyFactory {
    shutdowns: Arc<AtomicUsize>,
}

impl FirstStrategyFactory {
    pub const NAME: &'static str = "first";

    /// How many strategies created by this factory have been shut down.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl LoadBalancerStrategyFactory for FirstStrategyFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_strategy(&self, _service: &ServiceProperties) -> Result<Arc<dyn LoadBalancerStrategy>, anyhow::Error> {
        Ok(Arc::new(FirstStrategy {
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

pub struct FirstStrategy {
    shutdowns: Arc<AtomicUsize>,
}

impl LoadBalancerStrategy for FirstStrategy {
    fn name(&self) -> &str {
        FirstStrategyFactory::NAME
    }

    fn pick(
        &self,
        _request: &RouteRequest<'_>,
        _version: u64,
        _partition_id: i32,
        candidates: &Candidates,
    ) -> Option<Arc<TrackerClient>> {
        candidates
            .iter()
            .min_by_key(|(uri, _)| uri.to_string())
            .map(|(_, client)| client.clone())
    }

    fn ring(&self, _version: u64, _partition_id: i32, candidates: &Candidates) -> Ring {
        Ring::new(candidates.keys().map(|uri| (uri.clone(), 10)))
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Declines every candidate, like a strategy shedding all load. Registered
/// as `"reject"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingStrategyFactory;

impl RejectingStrategyFactory {
    pub const NAME: &'static str = "reject";
}

impl LoadBalancerStrategyFactory for RejectingStrategyFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_strategy(&self, _service: &ServiceProperties) -> Result<Arc<dyn LoadBalancerStrategy>, anyhow::Error> {
        Ok(Arc::new(RejectingStrategy))
    }
}

pub struct RejectingStrategy;

impl LoadBalancerStrategy for RejectingStrategy {
    fn name(&self) -> &str {
        RejectingStrategyFactory::NAME
    }

    fn pick(
        &self,
        _request: &RouteRequest<'_>,
        _version: u64,
        _partition_id: i32,
        _candidates: &Candidates,
    ) -> Option<Arc<TrackerClient>> {
        None
    }

    fn ring(&self, _version: u64, _partition_id: i32, _candidates: &Candidates) -> Ring {
        Ring::default()
    }
}
