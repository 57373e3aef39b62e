//! Observers of state changes. All notifications are sent from the event queue.

use crate::strategy::LoadBalancerStrategy;
use crate::tracker_client::TrackerClient;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Notified when strategies and tracker clients of a service come and go.
pub trait LoadBalancerStateListener: Send + Sync {
    fn on_strategy_added(&self, service: &str, scheme: &str, strategy: &Arc<dyn LoadBalancerStrategy>);

    fn on_strategy_removed(&self, service: &str, scheme: &str, strategy: &Arc<dyn LoadBalancerStrategy>);

    fn on_client_added(&self, service: &str, client: &Arc<TrackerClient>);

    fn on_client_removed(&self, service: &str, client: &Arc<TrackerClient>);
}

/// Notified when cluster properties are received or removed.
pub trait ClusterListener: Send + Sync {
    fn on_cluster_added(&self, cluster: &str);

    fn on_cluster_removed(&self, cluster: &str);
}

/// Copy-on-write list of listeners.
pub(crate) struct Listeners<L: ?Sized> {
    inner: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub(crate) fn add(&self, listener: Arc<L>) {
        self.inner.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    /// Remove `listener`, compared by pointer.
    pub(crate) fn remove(&self, listener: &Arc<L>) {
        self.inner.rcu(|current| {
            current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&L)) {
        for listener in self.inner.load().iter() {
            f(listener);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.load().len()
    }
}
