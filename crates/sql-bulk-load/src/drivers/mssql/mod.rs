//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax strategy for MSSQL
//! - [`MssqlConnector`]: tiberius connections pooled by bb8

mod connection;
mod dialect;

pub use connection::{MssqlConnection, MssqlConnector, TiberiusConnectionManager};
pub use dialect::MssqlDialect;
