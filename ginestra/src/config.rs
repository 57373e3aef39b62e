use tokio::time::Duration;

/// The scheme of logical request uris, `d2://<service>/<path>`.
pub const DEFAULT_ROUTING_SCHEME: &str = "d2";

// How long a replaced transport client stays alive for requests that
// already hold it.
const DEFAULT_TEARDOWN_DELAY: Duration = Duration::from_secs(1);

/// Knobs of the load balancer. Built through
/// [`LoadBalancerBuilder`](crate::LoadBalancerBuilder).
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// How long routing waits for properties that have not been received yet.
    /// Zero registers interest without waiting.
    pub timeout: Duration,
    /// Grace period before a replaced transport client is shut down.
    pub teardown_delay: Duration,
    pub enable_routing_table: bool,
    /// Without SSL, `https` endpoints get neither transport clients nor strategies.
    pub ssl_enabled: bool,
    pub routing_scheme: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            teardown_delay: DEFAULT_TEARDOWN_DELAY,
            enable_routing_table: true,
            ssl_enabled: false,
            routing_scheme: DEFAULT_ROUTING_SCHEME.to_string(),
        }
    }
}

impl LoadBalancerConfig {
    /// Whether transport clients and strategies are built for `scheme`.
    pub(crate) fn supports_scheme(&self, scheme: &str) -> bool {
        self.ssl_enabled || !scheme.eq_ignore_ascii_case("https")
    }
}
