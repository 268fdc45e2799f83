//! Transport connectors shipped with the crate.
//!
//! AMQP transports are not implemented here; inject a [`TransportConnector`]
//! that speaks them.
//!
//! [`TransportConnector`]: crate::client::TransportConnector

pub mod http;
pub mod memory;

pub use http::{HttpTransportConnector, ServiceBusHttpProvider};
pub use memory::{InMemoryBroker, InMemoryConfig, InMemoryQueueProvider};
