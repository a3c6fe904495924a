//! Request/reply dispatch over the bus.
//!
//! 1. **Dispatch** (`dispatch`): subscription pump, failure isolation, replies
//! 2. **Middleware** (`middleware`): tower layers around each message (latency audit)
//! 3. **Routers** (`internal`, `external`): function-name and method/path routing
//! 4. **Callers** (`client`): publish and request/reply with one retry on timeout
//! 5. **Support** (`context`, `config`, `notify`, `response`, `status`)

pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod external;
pub mod internal;
pub mod middleware;
pub mod notify;
pub mod response;
pub mod status;

// Re-export key types for convenient access.
pub use client::{ExternalClient, InternalClient};
pub use config::{RuntimeArgs, ServiceConfig};
pub use context::{HandlerContext, ServiceContext};
pub use dispatch::{Dispatcher, HandlerFailure};
pub use external::{ExternalHandler, ExternalRouter, Route, RouteError};
pub use internal::{InternalHandler, InternalRouter, HANDLER_NOT_FOUND};
pub use notify::{ErrorNotifier, TracingNotifier};
pub use response::respond_error;
pub use status::{setup_status, HealthProbe, PrimaryStatus};
