//! Stable versus canary selection for cluster and service properties.

use crate::properties::StoreProperties;
use std::collections::HashMap;

/// Which variant of a property payload this client should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    #[default]
    Stable,
    Canary,
}

/// How a canary rollout is spread over clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanaryStrategyKind {
    Disabled,
    Percentage,
    TargetHosts,
    TargetApplications,
}

/// The canary rollout policy published next to a canary payload.
///
/// Interpreting it is the job of a [`CanaryDistributionProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryDistributionStrategy {
    pub strategy: CanaryStrategyKind,
    /// Share of clients, in `[0, 1]`, that should pick the canary.
    pub percentage: f64,
    pub target_hosts: Vec<String>,
    pub target_applications: Vec<String>,
    pub properties: HashMap<String, String>,
}

impl CanaryDistributionStrategy {
    pub fn new(strategy: CanaryStrategyKind) -> Self {
        Self {
            strategy,
            percentage: 0.0,
            target_hosts: Vec::new(),
            target_applications: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn percentage(percentage: f64) -> Self {
        Self {
            percentage,
            ..Self::new(CanaryStrategyKind::Percentage)
        }
    }

    pub fn target_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            target_hosts: hosts.into_iter().map(|h| h.to_string()).collect(),
            ..Self::new(CanaryStrategyKind::TargetHosts)
        }
    }
}

/// Decides, for this client, whether a canary configuration applies.
pub trait CanaryDistributionProvider: Send + Sync {
    fn distribute(&self, strategy: &CanaryDistributionStrategy) -> Distribution;
}

/// Targets this client by host name and application name.
///
/// Percentage rollouts are decided by hashing the host name so that a given
/// host always lands on the same side of the split.
#[derive(Debug, Clone)]
pub struct HostCanaryDistributionProvider {
    host_name: String,
    application: String,
}

impl HostCanaryDistributionProvider {
    pub fn new<H: ToString, A: ToString>(host_name: H, application: A) -> Self {
        Self {
            host_name: host_name.to_string(),
            application: application.to_string(),
        }
    }

    fn bucket(&self) -> f64 {
        let hash = self
            .host_name
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        f64::from(hash % 100) / 100.0
    }
}

impl CanaryDistributionProvider for HostCanaryDistributionProvider {
    fn distribute(&self, strategy: &CanaryDistributionStrategy) -> Distribution {
        let canary = match strategy.strategy {
            CanaryStrategyKind::Disabled => false,
            CanaryStrategyKind::Percentage => self.bucket() < strategy.percentage,
            CanaryStrategyKind::TargetHosts => strategy
                .target_hosts
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&self.host_name)),
            CanaryStrategyKind::TargetApplications => strategy
                .target_applications
                .iter()
                .any(|a| a == &self.application),
        };
        if canary {
            Distribution::Canary
        } else {
            Distribution::Stable
        }
    }
}

/// Pick the payload to apply from `properties`.
///
/// Falls back to the stable payload whenever there is no canary payload, no
/// distribution policy, or no provider.
pub(crate) fn select<T>(
    properties: StoreProperties<T>,
    provider: Option<&dyn CanaryDistributionProvider>,
) -> (T, Distribution) {
    let (stable, canary, distribution) = properties.into_parts();
    match (canary, distribution, provider) {
        (Some(canary), Some(distribution), Some(provider)) => {
            match provider.distribute(&distribution) {
                Distribution::Canary => (canary, Distribution::Canary),
                Distribution::Stable => (stable, Distribution::Stable),
            }
        }
        _ => (stable, Distribution::Stable),
    }
}
