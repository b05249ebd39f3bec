use std::sync::LazyLock;

use common::metrics::{
    register_counter,
    register_gauge,
};
use prometheus::{
    IntCounter,
    IntGauge,
};

static MYSQL_QUERIES_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("mysql_queries_total", "Text-protocol queries"));

static MYSQL_PREPARES_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("mysql_prepares_total", "COM_STMT_PREPARE commands"));

static MYSQL_EXECUTES_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("mysql_executes_total", "COM_STMT_EXECUTE commands"));

static MYSQL_CONNECTIONS_OPEN: LazyLock<IntGauge> =
    LazyLock::new(|| register_gauge("mysql_connections_open", "Connections currently open"));

static MYSQL_POOL_CHECKOUTS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("mysql_pool_checkouts_total", "Pool checkouts"));

static MYSQL_POOL_DISCARDS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_counter("mysql_pool_discards_total", "Connections discarded by the pool")
});

pub fn log_query() {
    MYSQL_QUERIES_TOTAL.inc();
}

pub fn log_prepare() {
    MYSQL_PREPARES_TOTAL.inc();
}

pub fn log_execute() {
    MYSQL_EXECUTES_TOTAL.inc();
}

pub fn log_connection_opened() {
    MYSQL_CONNECTIONS_OPEN.inc();
}

pub fn log_connection_closed() {
    MYSQL_CONNECTIONS_OPEN.dec();
}

pub fn log_pool_checkout() {
    MYSQL_POOL_CHECKOUTS_TOTAL.inc();
}

pub fn log_pool_discard() {
    MYSQL_POOL_DISCARDS_TOTAL.inc();
}
