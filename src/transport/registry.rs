//! Connection registry keyed by broker URL
//!
//! Processes that build several buses against the same cluster can share one
//! connection per URL. The registry is itself a [`Broker`]: hand a clone of it
//! to every bus and each `connect` either opens the connection or takes a new
//! lease on the existing one.

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ClientProperties,
    ErrorHandler,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Error handlers per lease id, fanned out in lease order
type Handlers = Arc<Mutex<BTreeMap<u64, Vec<ErrorHandler>>>>;

struct Entry {
    connection: Arc<dyn BrokerConnection>,
    leases: usize,
    next_lease: u64,
    handlers: Handlers,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Explicit, cloneable URL → connection registry with lease counting
#[derive(Clone)]
pub struct ConnectionRegistry {
    broker: Arc<dyn Broker>,
    entries: Entries,
    connect_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ConnectionRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            entries: Arc::new(Mutex::new(HashMap::new())),
            connect_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Number of distinct URLs with a live shared connection
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding leases on the connection for `url`
    pub fn leases(&self, url: &str) -> usize {
        lock(&self.entries).get(url).map_or(0, |entry| entry.leases)
    }

    fn lease(&self, url: &str) -> Option<SharedConnection> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(url)?;
        entry.leases += 1;
        entry.next_lease += 1;
        Some(SharedConnection {
            url: url.to_string(),
            lease_id: entry.next_lease,
            inner: entry.connection.clone(),
            handlers: entry.handlers.clone(),
            entries: self.entries.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Arm the single underlying error handler that evicts the entry and fans
    /// the error out to every lease
    fn arm_eviction(&self, url: &str, connection: &Arc<dyn BrokerConnection>, handlers: Handlers) {
        let entries = Arc::downgrade(&self.entries);
        let evicted = Arc::downgrade(connection);
        let url = url.to_string();

        connection.on_error(Box::new(move |error: BrokerError| {
            if let Some(entries) = entries.upgrade() {
                let mut entries = lock(&entries);
                let same_connection = entries.get(&url).is_some_and(|entry| {
                    evicted
                        .upgrade()
                        .is_some_and(|conn| Arc::ptr_eq(&conn, &entry.connection))
                });
                if same_connection {
                    entries.remove(&url);
                    warn!(url = %url, error = %error, "Evicted shared connection after error");
                }
            }

            let mut handlers = lock(&handlers);
            for handler in handlers.values_mut().flatten() {
                handler(error.clone());
            }
        }));
    }
}

#[async_trait]
impl Broker for ConnectionRegistry {
    async fn connect(
        &self,
        url: &str,
        properties: &ClientProperties,
    ) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let _gate = self.connect_gate.lock().await;

        if let Some(shared) = self.lease(url) {
            debug!(url = %url, "Reusing shared broker connection");
            return Ok(Arc::new(shared));
        }

        let connection = self.broker.connect(url, properties).await?;
        let handlers: Handlers = Arc::new(Mutex::new(BTreeMap::new()));
        self.arm_eviction(url, &connection, handlers.clone());

        lock(&self.entries).insert(
            url.to_string(),
            Entry {
                connection,
                leases: 0,
                next_lease: 0,
                handlers,
            },
        );
        info!(url = %url, "Registered shared broker connection");

        self.lease(url)
            .map(|shared| Arc::new(shared) as Arc<dyn BrokerConnection>)
            .ok_or_else(|| {
                BrokerError::ConnectionLost(format!("connection to {url} was evicted while registering"))
            })
    }
}

/// One lease on a shared connection
pub struct SharedConnection {
    url: String,
    lease_id: u64,
    inner: Arc<dyn BrokerConnection>,
    handlers: Handlers,
    entries: Entries,
    released: AtomicBool,
}

#[async_trait]
impl BrokerConnection for SharedConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        self.inner.create_channel().await
    }

    fn on_error(&self, handler: ErrorHandler) {
        lock(&self.handlers)
            .entry(self.lease_id)
            .or_default()
            .push(handler);
    }

    /// Release this lease; the underlying connection closes with the last one
    async fn close(&self) -> BrokerResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.handlers).remove(&self.lease_id);

        let last_lease = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(&self.url) {
                Some(entry) if Arc::ptr_eq(&entry.connection, &self.inner) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    if entry.leases == 0 {
                        entries.remove(&self.url);
                        true
                    } else {
                        false
                    }
                }
                // Already evicted after a connection error
                _ => false,
            }
        };

        if last_lease {
            info!(url = %self.url, "Closing shared broker connection");
            self.inner.close().await
        } else {
            Ok(())
        }
    }
}
