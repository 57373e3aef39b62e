//! `ginestra` is a client-side, partition-aware load balancer fed by a pluggable
//! service discovery.
//!
//! Discovery publishes three kinds of properties:
//! - cluster properties: schemes, banned endpoints and the partitioning scheme of a cluster,
//! - service properties: the cluster serving a service, its path and its strategies,
//! - uri properties: the endpoints of a cluster with their per-partition weights.
//!
//! A [`SimpleLoadBalancer`] listens to whatever requests ask for, keeps the
//! derived state (tracker clients, strategies, routing tables) up to date on a
//! single event queue, and routes logical `d2://<service>/<path>` requests to
//! concrete endpoints.
//!
//! # Simple example
//!
//! ```rust,no_run
//! use ginestra::{
//!     PropertySources, RouteRequest, SimpleLoadBalancer, TransportClient, TransportClientConfig,
//! };
//! use std::sync::Arc;
//!
//! # fn sources() -> PropertySources { unimplemented!() }
//! fn http_client(config: &TransportClientConfig<'_>) -> Result<Arc<dyn TransportClient>, anyhow::Error> {
//!     // Build a client for `config.service_name` from `config.properties`.
//! #   unimplemented!()
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anyhow::Error> {
//!     let balancer = SimpleLoadBalancer::builder(sources())
//!         .transport_factory("http", http_client)
//!         .timeout(std::time::Duration::from_secs(5))
//!         .build()?;
//!
//!     let uri = "d2://articles/items/1".parse()?;
//!     let client = balancer.resolve(&RouteRequest::from_uri(&uri)).await?;
//!     println!("articles are served by {}", client.base_uri());
//!     Ok(())
//! }
//! ```
//!
//! Requests can also be sent through a [`RoutingChannel`], which resolves every
//! call and can be handed to tonic generated clients.
//!
//! The routing decision itself is delegated to a [`LoadBalancerStrategy`]. A
//! weighted random strategy is registered as `random`; others are plugged in
//! with [`LoadBalancerBuilder::strategy_factory`].
//!
//! # Internals
//! Every discovery event, listener registration and delayed transport
//! shutdown runs on one [`PropertyEventExecutor`] task. Readers never wait for
//! it: every value in the store is an immutable snapshot swapped wholesale.

mod balancer;
mod canary;
mod client;
mod config;
mod error;
mod executor;
mod handlers;
mod listener;
mod partition;
mod properties;
mod request;
mod routing_table;
mod state;
mod store;
mod strategy;
mod subscription;
mod tracker_client;
mod transport;
mod versioned;

pub use balancer::*;
pub use canary::{
    CanaryDistributionProvider, CanaryDistributionStrategy, CanaryStrategyKind, Distribution,
    HostCanaryDistributionProvider,
};
pub use client::{RoutedClient, RoutingChannel};
pub use config::{LoadBalancerConfig, DEFAULT_ROUTING_SCHEME};
pub use error::*;
pub use executor::PropertyEventExecutor;
pub use listener::{ClusterListener, LoadBalancerStateListener};
pub use partition::{
    CustomPartitionAccessor, DefaultPartitionAccessor, PartitionAccessor, PartitionAccessorRegistry,
};
pub use properties::{
    ClusterProperties, HashAlgorithm, PartitionData, PartitionProperties, PropertyKind,
    ServiceProperties, StoreProperties, UriProperties,
};
pub use request::{RouteRequest, TargetHostHint, TargetServiceHint};
pub use routing_table::PartitionRoutingTable;
pub use state::{LoadBalancerState, PropertySources};
pub use store::{ClusterEntry, ServiceEntry, Strategies, TrackerClients, TransportClients};
pub use strategy::{
    Candidates, LoadBalancerStrategy, LoadBalancerStrategyFactory, RandomStrategy,
    RandomStrategyFactory, Ring, SchemeStrategyPair,
};
pub use subscription::{Callback, PropertySource, PropertySubscriber};
pub use tracker_client::TrackerClient;
pub use transport::{TransportClient, TransportClientConfig, TransportClientFactory};
pub use versioned::{VersionCounter, VersionedItem};
