//! Registry of callbacks replayed every time the bus connection becomes live.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::connection::ConnectionError;

/// Zero-argument fallible callback run on connect and on every reconnect.
pub type ActiveHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Boxes an async closure into an [`ActiveHandler`].
pub fn active_handler<F, Fut>(f: F) -> ActiveHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f()) })
}

/// Name-keyed handler set. Names are unique; registration order is kept so
/// replays are deterministic.
#[derive(Default)]
pub struct ActiveHandlers {
    by_name: HashMap<String, ActiveHandler>,
    order: Vec<String>,
}

impl ActiveHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::DuplicateActiveHandler` if `name` is taken;
    /// the existing handler is left in place.
    pub fn register(&mut self, name: String, handler: ActiveHandler) -> Result<(), ConnectionError> {
        if self.by_name.contains_key(&name) {
            return Err(ConnectionError::DuplicateActiveHandler { name });
        }
        self.order.push(name.clone());
        self.by_name.insert(name, handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ActiveHandler> {
        self.by_name.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.order.clear();
    }

    /// Handlers in registration order, cloned out so they can run unlocked.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ActiveHandler)> {
        self.order
            .iter()
            .filter_map(|name| self.get(name).map(|h| (name.clone(), h)))
            .collect()
    }
}
