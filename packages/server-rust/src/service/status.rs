//! `Status` internal function used by health checks.

use std::sync::Arc;

use async_trait::async_trait;
use buskit_core::{InternalRequest, InternalResponse};
use tracing::{error, info};

use super::context::HandlerContext;
use super::internal::InternalRouter;

/// Replication view reported by the document store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryStatus {
    /// Whether the probed node is the primary.
    pub is_primary: bool,
    /// Address of the current primary, if one is known.
    pub primary: Option<String>,
}

impl PrimaryStatus {
    /// A primary is reachable: either this node or a known other one.
    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.is_primary || self.primary.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Document-store health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an error when the store cannot be reached.
    async fn primary_status(&self) -> anyhow::Result<PrimaryStatus>;
}

/// Health answers of the `Status` function.
pub mod answers {
    pub const OK: &str = "OK";
    pub const DB_DOWN: &str = "DBDOWN";
    pub const PRIMARY_DB_DOWN: &str = "PRIMARYDBDOWN";
}

/// Registers the `Status` function on `router`. Without a probe it always
/// answers `"OK"`.
pub fn setup_status(router: &InternalRouter, probe: Option<Arc<dyn HealthProbe>>) {
    router.add_handler("Status", move |_ctx: HandlerContext, _req: InternalRequest| {
        let probe = probe.clone();
        async move { Ok(InternalResponse::ok(check(probe.as_deref()).await)) }
    });
}

async fn check(probe: Option<&dyn HealthProbe>) -> &'static str {
    let Some(probe) = probe else {
        info!("status check reported OK");
        return answers::OK;
    };
    match probe.primary_status().await {
        Err(err) => {
            error!(error = %err, "status check reported DBDOWN");
            answers::DB_DOWN
        }
        Ok(status) if !status.has_primary() => {
            error!(?status, "status check reported PRIMARYDBDOWN");
            answers::PRIMARY_DB_DOWN
        }
        Ok(_) => {
            info!("status check reported OK");
            answers::OK
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use buskit_core::Value;

    use super::*;
    use crate::bus::connection::ConnectionManager;
    use crate::bus::memory::MemoryBus;
    use crate::bus::transport::Message;
    use crate::service::config::ServiceConfig;
    use crate::service::context::ServiceContext;
    use crate::service::dispatch::Dispatcher;

    enum StubProbe {
        Down,
        NoPrimary,
        Secondary,
    }

    #[async_trait]
    impl HealthProbe for StubProbe {
        async fn primary_status(&self) -> anyhow::Result<PrimaryStatus> {
            match self {
                StubProbe::Down => anyhow::bail!("server selection timeout"),
                StubProbe::NoPrimary => Ok(PrimaryStatus::default()),
                StubProbe::Secondary => Ok(PrimaryStatus {
                    is_primary: false,
                    primary: Some("db-0:27017".to_string()),
                }),
            }
        }
    }

    async fn status_with(probe: Option<Arc<dyn HealthProbe>>) -> Option<Value> {
        let bus = MemoryBus::new();
        let connection = ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10));
        let service = ServiceContext::new(connection, ServiceConfig::default());
        let router = InternalRouter::new(&service, "users");
        setup_status(&router, probe);

        let request = InternalRequest::new("users", "Status", Value::Null);
        let msg = Message::new("users.internal", serde_json::to_vec(&request).unwrap());
        router.dispatch(&msg).await.body
    }

    #[tokio::test]
    async fn reports_ok_without_probe() {
        assert_eq!(status_with(None).await, Some(Value::from("OK")));
    }

    #[tokio::test]
    async fn reports_db_state_from_probe() {
        assert_eq!(
            status_with(Some(Arc::new(StubProbe::Down))).await,
            Some(Value::from("DBDOWN"))
        );
        assert_eq!(
            status_with(Some(Arc::new(StubProbe::NoPrimary))).await,
            Some(Value::from("PRIMARYDBDOWN"))
        );
        assert_eq!(
            status_with(Some(Arc::new(StubProbe::Secondary))).await,
            Some(Value::from("OK"))
        );
    }
}
