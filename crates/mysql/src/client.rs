//! The shared client facade. Commands are serialized through a fair async
//! mutex, so concurrent callers queue FIFO per connection, and every
//! command runs under the global MySQL budget so a wedged server cannot
//! hang a caller forever.

use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use common::{
    knobs,
    Error,
    Result,
};
use tokio::sync::Mutex;

use crate::{
    conn::{
        Connection,
        IsolationLevel,
        MySqlConfig,
        QueryResult,
        Statement,
    },
    transaction::Transaction,
    value::Value,
};

pub(crate) async fn with_timeout<T, Fut>(fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let budget = Duration::from_secs(*knobs::MYSQL_TIMEOUT_SECS);
    tokio::select! {
        result = fut => result,
        _ = tokio::time::sleep(budget) => Err(Error::timeout("MySQL command timed out")),
    }
}

#[derive(Clone)]
pub struct MySqlClient {
    conn: Arc<Mutex<Connection>>,
}

impl MySqlClient {
    pub async fn connect(config: &MySqlConfig) -> Result<Self> {
        let conn = with_timeout(Connection::connect(config)).await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.query(sql)).await
    }

    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.prepare(sql)).await
    }

    pub async fn execute(&self, statement: &Statement, params: &[Value]) -> Result<QueryResult> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.execute(statement, params)).await
    }

    pub async fn close_statement(&self, statement: &Statement) -> Result<()> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.close_statement(statement)).await
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.ping()).await
    }

    pub async fn set_autocommit(&self, enabled: bool) -> Result<()> {
        let mut conn = self.conn.lock().await;
        with_timeout(conn.set_autocommit(enabled)).await
    }

    /// Open a transaction. The transaction holds the connection lock, so
    /// other callers queue until commit or rollback.
    pub async fn begin_transaction(
        &self,
        level: Option<IsolationLevel>,
    ) -> Result<Transaction<tokio::sync::OwnedMutexGuard<Connection>>> {
        let guard = self.conn.clone().lock_owned().await;
        Transaction::begin(guard, level).await
    }

    pub async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.close().await
    }
}
