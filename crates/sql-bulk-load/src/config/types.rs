//! Configuration type definitions with auto-tuning based on system resources.

use crate::core::mode::Mode;
use crate::core::schema::InputType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination database connection.
    pub connection: ConnectionConfig,

    /// Output table and load behavior.
    pub output: OutputConfig,

    /// Record source for the bundled runner.
    #[serde(default)]
    pub input: InputConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.input = self.input.with_auto_tuning(&resources);
        self
    }
}

/// Database driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Postgres,
    Mysql,
    Mssql,
}

impl DriverKind {
    pub fn default_port(&self) -> u16 {
        match self {
            DriverKind::Postgres => 5432,
            DriverKind::Mysql => 3306,
            DriverKind::Mssql => 1433,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Mysql => "mysql",
            DriverKind::Mssql => "mssql",
        };
        f.write_str(name)
    }
}

/// Destination database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver family.
    pub driver: DriverKind,

    /// Database host. Mutually exclusive with `url`.
    #[serde(default)]
    pub host: String,

    /// Database port (default: the driver's standard port).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Full connection URL, used instead of host/port/database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password. Never serialized, so it stays out of the config hash.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Schema the output table lives in. Uses the connection default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// SSL mode (default: "disable").
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl ConnectionConfig {
    /// Effective port, falling back to the driver's standard port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.driver.default_port())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// How input columns are matched against an existing target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMatching {
    /// Match by column name (exact, then unique case-insensitive).
    #[default]
    ByName,
    /// Match the n-th input column to the n-th target column.
    ByPosition,
}

/// How rows are shipped to the load table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMethod {
    /// Prepared-statement batches.
    #[default]
    Normal,
    /// PostgreSQL COPY FROM STDIN.
    Copy,
}

/// Per-column override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnOption {
    /// Declared SQL type used when the table is created (e.g. `VARCHAR(32)`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    /// Setter used for this column, or `coerce` to pick one from the column's SQL type.
    #[serde(default = "default_value_type")]
    pub value_type: String,

    /// strftime format used when a timestamp is written to a text column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,

    /// Timezone used for timestamp rendering and temporal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Default for ColumnOption {
    fn default() -> Self {
        Self {
            type_name: None,
            value_type: default_value_type(),
            timestamp_format: None,
            timezone: None,
        }
    }
}

/// Output table and load behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target table name.
    pub table: String,

    /// Load mode.
    pub mode: Mode,

    /// Flush threshold in estimated bytes (default: 16 MiB).
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Merge key columns for merge modes. Uses the primary key if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_keys: Option<Vec<String>>,

    /// Custom SET expressions for merge modes (e.g. `"count" = "T"."count" + "S"."count"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_rule: Option<Vec<String>>,

    /// Per-column overrides keyed by column name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_options: BTreeMap<String, ColumnOption>,

    /// Default strftime format for timestamps written to text columns.
    #[serde(default = "default_timestamp_format")]
    pub default_timestamp_format: String,

    /// Default timezone for timestamps (default: "UTC").
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Column matching against an existing table.
    #[serde(default)]
    pub column_matching: ColumnMatching,

    /// SQL run in the commit transaction before rows are moved into the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_load: Option<String>,

    /// SQL run in the commit transaction after rows are moved into the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_load: Option<String>,

    /// Table constraint appended to generated CREATE TABLE statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_table_constraint: Option<String>,

    /// Table option appended after generated CREATE TABLE statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_table_option: Option<String>,

    /// Row shipping method (default: normal).
    #[serde(default)]
    pub insert_method: InsertMethod,

    /// Maximum retries for metadata and commit operations (default: 12).
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Initial retry wait in milliseconds (default: 1000).
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,

    /// Maximum retry wait in milliseconds (default: 1800000).
    #[serde(default = "default_max_retry_wait")]
    pub max_retry_wait: u64,
}

/// One column of the JSON Lines input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
}

/// Record source for the bundled runner.
/// Performance fields use Option<T> to distinguish between "not set"
/// (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSON Lines file with one object (or array) per record.
    #[serde(default)]
    pub path: String,

    /// Input schema, in order.
    #[serde(default)]
    pub columns: Vec<InputColumnConfig>,

    /// Parallel workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Records handed to a worker per page. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

impl InputConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;
        let ram_gb = resources.total_memory_gb;

        // Workers: half the cores, 1-16. Every worker holds its own connection.
        if self.workers.is_none() {
            self.workers = Some((cores / 2).clamp(1, 16));
        }

        // Page size: 1000 rows, +1000 per 8GB of RAM, cap at 10K
        if self.page_size.is_none() {
            let page = 1_000 + (ram_gb / 8.0) as usize * 1_000;
            self.page_size = Some(page.min(10_000));
        }

        info!(
            "Auto-tuned config: workers={}, page_size={}",
            self.get_workers(),
            self.get_page_size()
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(1)
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(1_000)
    }
}

// Default value functions for serde
fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "sql-bulk-load".to_string()
}

pub(crate) fn default_value_type() -> String {
    "coerce".to_string()
}

fn default_batch_size() -> u64 {
    16 * 1024 * 1024
}

pub(crate) fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S%.6f".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_retry_limit() -> u32 {
    12
}

fn default_retry_wait() -> u64 {
    1_000
}

fn default_max_retry_wait() -> u64 {
    30 * 60 * 1_000
}
