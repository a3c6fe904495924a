//! Bus connection layer.
//!
//! - [`transport`]: `Transport` / `Connector` seams and shared message types
//! - [`memory`]: in-process bus implementing the seams
//! - [`encoded`]: JSON-encoding wrapper over a transport
//! - [`active`]: callbacks replayed on every (re)connect
//! - [`connection`]: `ConnectionManager`, owner of the live connection
//! - [`config`]: connection settings

pub mod active;
pub mod config;
pub mod connection;
pub mod encoded;
pub mod memory;
pub mod transport;

pub use config::BusConfig;
pub use connection::{ConnectionError, ConnectionManager};
pub use encoded::JsonConnection;
pub use memory::{MemoryBus, MemoryConnector, MemoryTransport};
pub use transport::{
    BusError, BusEvent, Connector, Message, PendingLimits, Subscription, Transport,
};
