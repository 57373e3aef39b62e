//! Fixtures shared by the integration tests: an in-memory discovery feed,
//! transport clients that record what they are asked to do, and
//! deterministic strategies.

pub mod strategies;

pub use mock_store::MockStore;
pub use strategies::{FirstStrategyFactory, RejectingStrategyFactory};
pub use transport::{RecordingTransport, RecordingTransportFactory, ENDPOINT_HEADER};
