//! MySQL client speaking the binary wire protocol over non-blocking
//! sockets: handshake and authentication (native and caching_sha2
//! plugins, optional TLS upgrade), text and binary result sets, prepared
//! statements, transactions with savepoints, and a bounded FIFO connection
//! pool.

mod auth;
mod client;
mod conn;
pub mod constants;
mod metrics;
mod packet;
mod pool;
mod row;
mod transaction;
mod value;

#[cfg(test)]
mod test_server;

pub use client::MySqlClient;
pub use conn::{
    Connection,
    ConnectionState,
    IsolationLevel,
    MaybeTlsStream,
    MySqlConfig,
    QueryResult,
    Statement,
};
pub use pool::{
    Connector,
    Pool,
    PoolConfig,
    PooledConnection,
    TcpConnector,
};
pub use row::{
    Column,
    Row,
};
pub use transaction::Transaction;
pub use value::{
    FromValue,
    Value,
};
