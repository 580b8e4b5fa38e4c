//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax strategy for PostgreSQL
//! - [`PostgresConnector`]: deadpool-postgres pool handing out dedicated connections
//! - [`CopyBatchInsert`]: `COPY ... FROM STDIN` row sink for `insert_method: copy`

mod connection;
mod copy;
mod dialect;

pub use connection::{PostgresConnection, PostgresConnector};
pub use copy::CopyBatchInsert;
pub use dialect::PostgresDialect;
