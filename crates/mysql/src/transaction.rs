//! The transaction facade: isolation level, LIFO savepoints, and explicit
//! commit/rollback.

use std::ops::{
    Deref,
    DerefMut,
};

use common::{
    Error,
    Result,
};

use crate::{
    conn::{
        Connection,
        IsolationLevel,
        QueryResult,
        Statement,
    },
    value::Value,
};

fn validate_savepoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::usage(format!("invalid savepoint name {name:?}")))
    }
}

/// An open transaction over any exclusive handle on a connection (a mutex
/// guard, a pool checkout, a plain `&mut`).
pub struct Transaction<C: DerefMut<Target = Connection>> {
    conn: C,
    active: bool,
    savepoints: Vec<String>,
}

impl<C: DerefMut<Target = Connection>> Transaction<C> {
    /// `SET TRANSACTION ISOLATION LEVEL …` (when requested) followed by
    /// `START TRANSACTION`; the transaction is active only if both succeed.
    pub async fn begin(mut conn: C, level: Option<IsolationLevel>) -> Result<Self> {
        if let Some(level) = level {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            conn.query(&sql).await?;
            conn.record_isolation(Some(level));
        }
        conn.query("START TRANSACTION").await?;
        Ok(Self {
            conn,
            active: true,
            savepoints: Vec::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    fn check_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(Error::usage("transaction is no longer active"))
        }
    }

    // Any error on the transaction's connection deactivates it; the caller
    // decides whether a compensating rollback is needed.

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.check_active()?;
        let result = self.conn.query(sql).await;
        if result.is_err() {
            self.active = false;
        }
        result
    }

    pub async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.check_active()?;
        let result = self.conn.prepare(sql).await;
        if result.is_err() {
            self.active = false;
        }
        result
    }

    pub async fn execute(&mut self, statement: &Statement, params: &[Value]) -> Result<QueryResult> {
        self.check_active()?;
        let result = self.conn.execute(statement, params).await;
        if result.is_err() {
            self.active = false;
        }
        result
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.check_active()?;
        let sql = format!("SAVEPOINT {name}");
        let result = self.conn.query(&sql).await;
        match result {
            Ok(_) => {
                self.savepoints.push(name.to_owned());
                Ok(())
            },
            Err(e) => {
                self.active = false;
                Err(e)
            },
        }
    }

    /// Roll back to a savepoint, popping everything stacked above it.
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.check_active()?;
        let position = self
            .savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| Error::usage(format!("unknown savepoint {name}")))?;
        let sql = format!("ROLLBACK TO SAVEPOINT {name}");
        let result = self.conn.query(&sql).await;
        match result {
            Ok(_) => {
                self.savepoints.truncate(position + 1);
                Ok(())
            },
            Err(e) => {
                self.active = false;
                Err(e)
            },
        }
    }

    /// Commit; every savepoint is released with the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.check_active()?;
        let result = self.conn.query("COMMIT").await;
        self.active = false;
        self.savepoints.clear();
        result.map(|_| ())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.check_active()?;
        let result = self.conn.query("ROLLBACK").await;
        self.active = false;
        self.savepoints.clear();
        result.map(|_| ())
    }
}

impl<C: DerefMut<Target = Connection>> Deref for Transaction<C> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl<C: DerefMut<Target = Connection>> Drop for Transaction<C> {
    fn drop(&mut self) {
        if self.active {
            tracing::warn!(
                "transaction dropped while active; the server will roll it back when the \
                 connection closes, or the next caller must"
            );
        }
    }
}
