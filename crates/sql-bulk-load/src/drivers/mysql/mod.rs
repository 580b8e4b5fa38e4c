//! MySQL/MariaDB driver.
//!
//! - [`MysqlDialect`]: SQL syntax strategy
//! - [`MysqlConnector`]: mysql_async pool handing out dedicated connections
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+
//!
//! Merges use `INSERT ... ON DUPLICATE KEY UPDATE`, so they always follow the
//! table's own unique keys and `merge_keys` is rejected.

mod connection;
mod dialect;

pub use connection::{MysqlConnection, MysqlConnector};
pub use dialect::MysqlDialect;
