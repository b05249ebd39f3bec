//! The bounded connection pool.
//!
//! Connections are created lazily up to the maximum. `acquire` hands out
//! the first idle connection or enqueues the caller FIFO; `release`
//! (checkout drop) hands a healthy connection to the first waiter or parks
//! it, and discards a poisoned one so the next demand creates a
//! replacement. `close` drains the idle set and rejects waiters.

use std::{
    collections::VecDeque,
    ops::{
        Deref,
        DerefMut,
    },
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    Error,
    ErrorKind,
    Result,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    conn::{
        Connection,
        MySqlConfig,
    },
    metrics,
};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

pub struct TcpConnector {
    config: MySqlConfig,
}

impl TcpConnector {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connection> {
        Connection::connect(&self.config).await
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: *common::knobs::MYSQL_MAX_CONNECTIONS,
        }
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    waiters: VecDeque<oneshot::Sender<Connection>>,
    closed: bool,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    max_size: usize,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

enum Plan {
    Ready(Connection),
    Create,
    Wait(oneshot::Receiver<Connection>),
}

impl Pool {
    pub fn new(config: &MySqlConfig, pool_config: PoolConfig) -> Self {
        Self::with_connector(Arc::new(TcpConnector::new(config.clone())), pool_config)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, pool_config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                max_size: pool_config.max_size.max(1),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Open connections up front until the pool is at its bound. Each slot
    /// is reserved before the connect, exactly as `acquire` does, so
    /// concurrent acquires can never push the pool past `max_size`.
    pub async fn warm_up(&self) -> Result<()> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::new(ErrorKind::PoolClosed, "pool is closed"));
                }
                if state.total >= self.inner.max_size {
                    return Ok(());
                }
                state.total += 1;
            }
            let mut slot = CreateSlot {
                inner: self.inner.clone(),
                armed: true,
            };
            let conn = self.inner.connector.connect().await?;
            slot.armed = false;
            release(&self.inner, conn);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn total_count(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Check out a connection: first idle, else create below the bound,
    /// else wait FIFO.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        loop {
            let plan = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::new(ErrorKind::PoolClosed, "pool is closed"));
                }
                // Skip any connection that went unhealthy while parked.
                let mut ready = None;
                while let Some(conn) = state.idle.pop_front() {
                    if conn.is_healthy() {
                        ready = Some(conn);
                        break;
                    }
                    state.total -= 1;
                    metrics::log_pool_discard();
                }
                match ready {
                    Some(conn) => Plan::Ready(conn),
                    None if state.total < self.inner.max_size => {
                        state.total += 1;
                        Plan::Create
                    },
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        Plan::Wait(rx)
                    },
                }
            };
            match plan {
                Plan::Ready(conn) => {
                    metrics::log_pool_checkout();
                    return Ok(PooledConnection::new(self.inner.clone(), conn));
                },
                Plan::Create => {
                    // The slot guard gives the reserved slot back if the
                    // connect fails or this acquire is dropped mid-flight.
                    let mut slot = CreateSlot {
                        inner: self.inner.clone(),
                        armed: true,
                    };
                    match self.inner.connector.connect().await {
                        Ok(conn) => {
                            slot.armed = false;
                            metrics::log_pool_checkout();
                            return Ok(PooledConnection::new(self.inner.clone(), conn));
                        },
                        Err(e) => return Err(e),
                    }
                },
                Plan::Wait(rx) => match rx.await {
                    Ok(conn) => {
                        metrics::log_pool_checkout();
                        return Ok(PooledConnection::new(self.inner.clone(), conn));
                    },
                    // The sender was dropped: the pool closed or a slot
                    // opened up; loop and re-plan.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Like [`Pool::acquire`], but give up after `budget` instead of
    /// waiting indefinitely.
    pub async fn acquire_timeout(&self, budget: std::time::Duration) -> Result<PooledConnection> {
        tokio::select! {
            result = self.acquire() => result,
            _ = tokio::time::sleep(budget) => Err(Error::new(
                ErrorKind::PoolExhausted,
                format!("no connection became available within {budget:?}"),
            )),
        }
    }

    /// Close the pool: drain idle connections and reject waiters. Checked
    /// out connections are discarded as they come back.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.total -= idle.len();
            (idle, std::mem::take(&mut state.waiters))
        };
        for waiter in waiters {
            drop(waiter);
        }
        for mut conn in idle {
            let _ = conn.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

struct CreateSlot {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl Drop for CreateSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        state.total -= 1;
        // Unblock one waiter so it can retry the slot we just gave back.
        if let Some(waiter) = state.waiters.pop_front() {
            drop(waiter);
        }
    }
}

fn release(inner: &Arc<PoolInner>, conn: Connection) {
    let mut state = inner.state.lock();
    if state.closed || !conn.is_healthy() {
        state.total -= 1;
        if !conn.is_healthy() {
            metrics::log_pool_discard();
        }
        // A waiter, if any, gets to create the replacement on demand.
        if let Some(waiter) = state.waiters.pop_front() {
            drop(waiter);
        }
        return;
    }
    let mut conn = conn;
    while let Some(waiter) = state.waiters.pop_front() {
        match waiter.send(conn) {
            Ok(()) => return,
            // That waiter gave up; try the next one.
            Err(returned) => conn = returned,
        }
    }
    state.idle.push_back(conn);
}

/// Exclusive use of one pooled connection; returns it on drop.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(inner: Arc<PoolInner>, conn: Connection) -> Self {
        Self {
            inner,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            release(&self.inner, conn);
        }
    }
}
