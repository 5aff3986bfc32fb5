use super::{Connection, ConnectionConfig, ConnectionManager, ConnectionProvider, ExecuteResult};
use crate::core::{PersistError, Result, Value};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Connection pool
///
/// The only resource shared between sessions. A connection is held for one
/// statement round trip and handed back right after. Checkouts are bounded by
/// a semaphore with `max_connections` permits.
pub struct ConnectionPool {
    config: ConnectionConfig,
    manager: Arc<dyn ConnectionManager>,
    shared: Arc<Shared>,
}

struct Shared {
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    opened: AtomicUsize,
}

struct IdleConnection {
    connection: Box<dyn Connection>,
    created_at: Instant,
    idle_since: Instant,
}

impl IdleConnection {
    fn new(connection: Box<dyn Connection>, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            idle_since: Instant::now(),
        }
    }

    fn is_stale(&self, config: &ConnectionConfig) -> bool {
        let too_old = config
            .max_lifetime
            .is_some_and(|lifetime| self.created_at.elapsed() > lifetime);
        let idle_too_long = config
            .idle_timeout
            .is_some_and(|timeout| self.idle_since.elapsed() > timeout);
        too_old || idle_too_long
    }
}

impl ConnectionPool {
    /// Create a new connection pool over `manager`
    pub async fn new(config: ConnectionConfig, manager: impl ConnectionManager) -> Result<Self> {
        Self::with_manager(config, Arc::new(manager)).await
    }

    pub async fn with_manager(
        config: ConnectionConfig,
        manager: Arc<dyn ConnectionManager>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(config.max_connections)),
                opened: AtomicUsize::new(0),
            }),
            config,
            manager,
        };
        pool.open_min_connections().await?;
        Ok(pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Check out a connection, waiting up to `connect_timeout` for a free slot
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let permit = tokio::time::timeout(
            self.config.connect_timeout,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            PersistError::ConnectionUnavailable(format!(
                "no connection available within {:?} (max {})",
                self.config.connect_timeout, self.config.max_connections
            ))
        })?
        .map_err(|_| PersistError::ConnectionUnavailable("pool is shut down".to_string()))?;

        let (connection, created_at) = match self.take_idle().await {
            Some(idle) => (idle.connection, idle.created_at),
            None => {
                // The permit is dropped on failure, freeing the slot.
                let connection = self.manager.connect(&self.config).await?;
                self.shared.opened.fetch_add(1, Ordering::SeqCst);
                debug!("Opened pooled connection {}", connection.id());
                (connection, Instant::now())
            }
        };

        Ok(PoolGuard {
            connection: Some(connection),
            created_at,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    async fn take_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.shared.idle.lock().await;
        while let Some(candidate) = idle.pop_front() {
            if !candidate.is_stale(&self.config) {
                return Some(candidate);
            }
            self.shared.opened.fetch_sub(1, Ordering::SeqCst);
            debug!("Closing stale connection {}", candidate.connection.id());
            tokio::spawn(candidate.connection.release());
        }
        None
    }

    async fn open_min_connections(&self) -> Result<()> {
        let mut idle = self.shared.idle.lock().await;
        while self.shared.opened.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.manager.connect(&self.config).await?;
            idle.push_back(IdleConnection::new(connection, Instant::now()));
            self.shared.opened.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.shared.idle.lock().await.len();
        PoolStats {
            total_connections: self.shared.opened.load(Ordering::SeqCst),
            available_connections: available,
            active_connections: self.config.max_connections
                - self.shared.permits.available_permits(),
            max_connections: self.config.max_connections,
        }
    }
}

#[async_trait]
impl ConnectionProvider for ConnectionPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let guard = self.get_connection().await?;
        Ok(Box::new(guard))
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} checked out, {} idle, {} open (max {})",
            self.active_connections,
            self.available_connections,
            self.total_connections,
            self.max_connections
        )
    }
}

/// A checked-out connection
///
/// Goes back to the idle list on `release`, or on drop when the idle list is
/// not contended. The slot is freed in both cases.
pub struct PoolGuard {
    connection: Option<Box<dyn Connection>>,
    created_at: Instant,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    pub async fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            let mut idle = self.shared.idle.lock().await;
            idle.push_back(IdleConnection::new(connection, self.created_at));
        }
    }
}

#[async_trait]
impl Connection for PoolGuard {
    fn id(&self) -> u64 {
        self.connection.as_ref().map_or(0, |c| c.id())
    }

    async fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<ExecuteResult> {
        match self.connection.as_mut() {
            Some(connection) => connection.execute(sql, parameters).await,
            None => Err(PersistError::IllegalState(
                "Connection already returned to pool".to_string(),
            )),
        }
    }

    async fn release(self: Box<Self>) {
        self.close().await;
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match self.shared.idle.try_lock() {
            Ok(mut idle) => idle.push_back(IdleConnection::new(connection, self.created_at)),
            Err(_) => {
                warn!(
                    "Connection {} dropped while the idle list was busy and is discarded; use release().await",
                    connection.id()
                );
                self.shared.opened.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
