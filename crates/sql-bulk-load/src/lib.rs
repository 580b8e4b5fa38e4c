//! # sql-bulk-load
//!
//! Vendor-agnostic bulk loading of typed records into SQL tables.
//!
//! This library commits a stream of records into a destination table under
//! one of several consistency modes:
//!
//! - **Direct** loads (`insert_direct`, `merge_direct`) into the target
//! - **Per-worker staging tables** collected on commit (`insert`,
//!   `truncate_insert`, `merge`), resumable after a crash
//! - **Atomic replace** through a swap table (`replace`, `replace_inplace`)
//! - **Retry** of metadata and commit operations with exponential backoff
//! - **Coercion** of input values to the destination column types
//!
//! PostgreSQL, MySQL and SQL Server are supported out of the box.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_bulk_load::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> sql_bulk_load::Result<()> {
//!     let config = Config::load("load.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Loaded {} rows", result.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod coercion;
pub mod config;
pub mod connection;
pub mod core;
pub mod drivers;
pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod state;

// Re-exports for convenient access
pub use batch::{BatchInsert, StandardBatchInsert};
pub use config::{Config, ConnectionConfig, InputConfig, OutputConfig};
pub use connection::OutputConnection;
pub use core::{InputSchema, Mode, Record, TableIdentifier, TargetSchema, Value};
pub use drivers::{connector_for, Connector, DialectImpl};
pub use error::{LoadError, Result};
pub use loader::{BulkLoader, LoadWorker, TransactionPlan};
pub use orchestrator::{HealthCheckResult, LoadPreview, LoadResult, Orchestrator};
pub use retry::RetryExecutor;
pub use source::JsonLinesSource;
pub use state::LoadState;
