//! Ownership of the process's single bus connection.
//!
//! `ConnectionManager` holds the bare transport, a lazily created JSON
//! wrapper around it, and the active-handler registry, all behind one
//! reader/writer lock. It is built by the composition root and shared as
//! `Arc<ConnectionManager>`.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::active::{active_handler, ActiveHandlers};
use super::config::BusConfig;
use super::encoded::JsonConnection;
use super::transport::{BusError, BusEvent, Connector, Transport};

/// Configuration and lifecycle errors of the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("active handler '{name}' has already been registered")]
    DuplicateActiveHandler { name: String },
    #[error("connection must already be established")]
    NotConnected,
}

#[derive(Default)]
struct ConnectionState {
    bare: Option<Arc<dyn Transport>>,
    /// Derived from `bare`; reset whenever `bare` changes.
    encoded: Option<Arc<JsonConnection>>,
    /// Bumped on every install/clear so stale event watchers can stop.
    generation: u64,
    active: ActiveHandlers,
}

impl ConnectionState {
    fn replace(&mut self, bare: Option<Arc<dyn Transport>>) -> u64 {
        self.bare = bare;
        self.encoded = None;
        self.generation += 1;
        self.generation
    }
}

/// Owns the live bus connection and replays active handlers on (re)connect.
pub struct ConnectionManager {
    state: RwLock<ConnectionState>,
    connector: Arc<dyn Connector>,
    retry_delay: Duration,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ConnectionState::default()),
            connector,
            retry_delay,
        })
    }

    #[must_use]
    pub fn from_config(connector: Arc<dyn Connector>, config: &BusConfig) -> Arc<Self> {
        Self::new(connector, config.connect_retry_delay())
    }

    /// Connects, retrying with a fixed delay until an attempt succeeds, then
    /// runs every active handler.
    ///
    /// A service must not process anything without a transport, so this
    /// only returns once connected.
    pub async fn connect(self: &Arc<Self>, urls: &[String], name: &str) {
        let mut attempt: u64 = 0;
        let transport = loop {
            attempt += 1;
            match self.connector.connect(urls, name).await {
                Ok(transport) => break transport,
                Err(err) => {
                    warn!(
                        attempt,
                        error = %err,
                        retry_in_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "bus connect failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        };
        info!(name, attempt, "bus connection established");
        self.install(transport).await;
    }

    /// [`connect`](Self::connect) using the URLs and name from `config`.
    pub async fn connect_with(self: &Arc<Self>, config: &BusConfig) {
        self.connect(&config.urls, &config.name).await;
    }

    /// Adopts an already established, externally owned transport.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NotConnected` if `transport` is not live.
    pub async fn set_connection(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), ConnectionError> {
        if !transport.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.install(transport).await;
        Ok(())
    }

    async fn install(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let generation = self.state.write().replace(Some(transport.clone()));
        self.watch_events(transport.as_ref(), generation);
        self.run_active_handlers().await;
    }

    /// Replays active handlers on every `Reconnected` event of the transport
    /// installed at `generation`.
    fn watch_events(self: &Arc<Self>, transport: &dyn Transport, generation: u64) {
        let mut events = transport.events();
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus event watcher lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.generation() != generation {
                    break;
                }
                match event {
                    BusEvent::Reconnected => {
                        info!("bus connection re-established");
                        manager.run_active_handlers().await;
                    }
                    BusEvent::Disconnected => warn!("bus connection lost"),
                    BusEvent::Closed => {
                        debug!("bus connection closed");
                        break;
                    }
                }
            }
        });
    }

    fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Non-blocking health probe.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .bare
            .as_ref()
            .is_some_and(|bare| bare.is_connected())
    }

    /// The bare transport, if one is installed.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state.read().bare.clone()
    }

    /// Cached JSON wrapper of the current transport, created on first use.
    ///
    /// # Errors
    ///
    /// Returns `BusError::NotConnected` when no transport is installed.
    pub fn encoded(&self) -> Result<Arc<JsonConnection>, BusError> {
        if let Some(encoded) = self.state.read().encoded.clone() {
            return Ok(encoded);
        }
        let mut state = self.state.write();
        if let Some(encoded) = &state.encoded {
            return Ok(encoded.clone());
        }
        let bare = state.bare.clone().ok_or(BusError::NotConnected)?;
        let encoded = Arc::new(JsonConnection::new(bare));
        state.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    /// Registers a callback to run whenever the connection becomes live.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::DuplicateActiveHandler` if `name` is already
    /// registered. Callers treat this as a fatal startup misconfiguration.
    pub fn add_active_handler<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), ConnectionError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state
            .write()
            .active
            .register(name.into(), active_handler(f))
    }

    /// Removes every active handler.
    pub fn clear_active_handlers(&self) {
        self.state.write().active.clear();
    }

    /// Runs every active handler; failures are logged and never stop the others.
    pub async fn run_active_handlers(&self) {
        let handlers = self.state.read().active.snapshot();
        for (name, handler) in handlers {
            if let Err(err) = handler().await {
                error!(name = %name, error = %err, "error running active handler");
            }
        }
    }

    /// Runs the active handler registered as `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns the handler's own error.
    pub async fn run_active_handler(&self, name: &str) -> anyhow::Result<()> {
        let handler = self.state.read().active.get(name);
        match handler {
            Some(handler) => handler().await,
            None => Ok(()),
        }
    }

    /// Closes the transport and releases it.
    pub async fn disconnect(&self) {
        warn!("called disconnect");
        if let Some(bare) = self.unset() {
            bare.close().await;
        }
    }

    /// Releases the transport without closing it, for transports whose
    /// lifecycle is owned elsewhere. Returns the released transport.
    pub fn unset(&self) -> Option<Arc<dyn Transport>> {
        let mut state = self.state.write();
        let bare = state.bare.take();
        state.replace(None);
        bare
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::bus::memory::MemoryBus;

    fn manager(bus: &MemoryBus) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(bus.connector()), Duration::from_millis(10))
    }

    fn counter_handler(
        counter: &Arc<AtomicU32>,
    ) -> impl Fn() -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    /// Connector that refuses a fixed number of attempts before delegating.
    struct FlakyConnector {
        inner: crate::bus::memory::MemoryConnector,
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, urls: &[String], name: &str) -> Result<Arc<dyn Transport>, BusError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BusError::Transport("connection refused".into()));
            }
            self.inner.connect(urls, name).await
        }
    }

    #[tokio::test]
    async fn connect_retries_until_success() {
        let bus = MemoryBus::new();
        let connector = Arc::new(FlakyConnector {
            inner: bus.connector(),
            failures_left: AtomicU32::new(3),
            attempts: AtomicU32::new(0),
        });
        let manager = ConnectionManager::new(connector.clone(), Duration::from_millis(5));

        manager.connect(&["mem://".to_string()], "svc").await;

        assert!(manager.is_connected());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn connect_runs_active_handlers_and_survives_failures() {
        let bus = MemoryBus::new();
        let manager = manager(&bus);
        let counter = Arc::new(AtomicU32::new(0));

        manager
            .add_active_handler("failing", || async { anyhow::bail!("subscribe failed") })
            .unwrap();
        manager.add_active_handler("counting", counter_handler(&counter)).unwrap();

        manager.connect(&[], "svc").await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[test]
    fn duplicate_active_handler_is_an_error() {
        let bus = MemoryBus::new();
        let manager = manager(&bus);
        let counter = Arc::new(AtomicU32::new(0));

        manager.add_active_handler("sub", counter_handler(&counter)).unwrap();
        let err = manager
            .add_active_handler("sub", counter_handler(&counter))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DuplicateActiveHandler { name } if name == "sub"));
    }

    #[tokio::test]
    async fn reconnect_replays_active_handlers() {
        let bus = MemoryBus::new();
        let transport = bus.connect_client("svc").unwrap();
        let manager = manager(&bus);
        let counter = Arc::new(AtomicU32::new(0));
        manager.add_active_handler("counting", counter_handler(&counter)).unwrap();

        manager.set_connection(transport.clone()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        transport.simulate_reconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn encoded_is_cached_and_invalidated_on_replace() {
        let bus = MemoryBus::new();
        let manager = manager(&bus);
        assert!(matches!(manager.encoded(), Err(BusError::NotConnected)));

        let first = bus.connect_client("one").unwrap();
        manager.set_connection(first).await.unwrap();
        let a = manager.encoded().unwrap();
        let b = manager.encoded().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let second = bus.connect_client("two").unwrap();
        let second_dyn: Arc<dyn Transport> = second;
        manager.set_connection(second_dyn.clone()).await.unwrap();
        let c = manager.encoded().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(c.transport(), &second_dyn));
    }

    #[tokio::test]
    async fn set_connection_requires_live_transport() {
        let bus = MemoryBus::new();
        let transport = bus.connect_client("svc").unwrap();
        transport.close().await;
        let manager = manager(&bus);
        assert!(matches!(
            manager.set_connection(transport).await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unset_releases_without_closing() {
        let bus = MemoryBus::new();
        let transport = bus.connect_client("svc").unwrap();
        let manager = manager(&bus);
        manager.set_connection(transport.clone()).await.unwrap();

        let released = manager.unset();
        assert!(released.is_some());
        assert!(!manager.is_connected());
        assert!(manager.encoded().is_err());
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn disconnect_closes_transport() {
        let bus = MemoryBus::new();
        let transport = bus.connect_client("svc").unwrap();
        let manager = manager(&bus);
        manager.set_connection(transport.clone()).await.unwrap();

        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert!(!transport.is_connected());
    }
}
