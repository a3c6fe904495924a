//! Buskit server runtime: one managed bus connection plus internal and
//! external request/reply routers layered on it.

pub mod bus;
pub mod logging;
pub mod service;

pub use bus::{BusConfig, BusError, ConnectionError, ConnectionManager, Connector, Transport};
pub use logging::{init_tracing, LogFormat};
pub use service::{
    ExternalClient, ExternalRouter, InternalClient, InternalRouter, ServiceConfig, ServiceContext,
};
