//! MySQL connections over a mysql_async pool.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Value};
use tracing::{debug, info, warn};

use super::dialect::MysqlDialect;
use crate::config::ConnectionConfig;
use crate::core::identifier::TableIdentifier;
use crate::core::schema::{TargetColumn, TargetSchema};
use crate::core::traits::{Dialect, DriverConnection};
use crate::core::value::BindValue;
use crate::drivers::common::SslMode;
use crate::drivers::{Connector, DialectImpl};
use crate::error::{LoadError, Result};

const TABLE_EXISTS_SQL: &str = "SELECT COUNT(*) FROM information_schema.tables \
     WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?";

const DESCRIBE_TABLE_SQL: &str = r#"
    SELECT column_name,
           data_type,
           CAST(character_maximum_length AS SIGNED),
           CAST(numeric_precision AS SIGNED),
           CAST(numeric_scale AS SIGNED),
           is_nullable,
           column_key
    FROM information_schema.columns
    WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?
    ORDER BY ordinal_position
"#;

type DescribeRow = (
    String,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    String,
    String,
);

/// Pool of MySQL connections.
pub struct MysqlConnector {
    pool: Pool,
    dialect: DialectImpl,
}

impl MysqlConnector {
    /// Create the pool and check that the server answers.
    pub async fn new(config: &ConnectionConfig, max_conns: usize) -> Result<Self> {
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;

        let mut builder = match &config.url {
            Some(url) => OptsBuilder::from_opts(
                Opts::from_url(url)
                    .map_err(|e| LoadError::Config(format!("Invalid MySQL url: {}", e)))?,
            ),
            None => OptsBuilder::default()
                .ip_or_hostname(config.host.clone())
                .tcp_port(config.port())
                .db_name(Some(config.database.clone()))
                .user(Some(config.user.clone()))
                .pass(Some(config.password.clone())),
        };
        // Use utf8mb4 for full Unicode support
        builder = builder
            .init(vec!["SET NAMES utf8mb4"])
            .tcp_keepalive(Some(30_000_u32));

        match ssl_mode.mysql_ssl_opts() {
            Some(ssl) => builder = builder.ssl_opts(ssl),
            None => warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext."),
        }

        let constraints = PoolConstraints::new(1, max_conns.max(1)).ok_or_else(|| {
            LoadError::Config(format!("Invalid MySQL pool size: {}", max_conns))
        })?;
        let opts: Opts = builder
            .pool_opts(PoolOpts::new().with_constraints(constraints))
            .into();
        let pool = Pool::new(opts);

        // Test connection
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| LoadError::pool(e, "creating MySQL pool"))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| LoadError::pool(e, "testing MySQL connection"))?;
        drop(conn);

        info!(
            "Connected to MySQL: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            pool,
            dialect: DialectImpl::Mysql(MysqlDialect::new()),
        })
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| LoadError::pool(e, "getting MySQL connection"))?;
        Ok(Box::new(MysqlConnection::new(conn)))
    }
}

/// One pooled MySQL connection.
pub struct MysqlConnection {
    conn: Option<Conn>,
}

impl MysqlConnection {
    pub fn new(conn: Conn) -> Self {
        Self { conn: Some(conn) }
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| LoadError::pool("connection already closed", "MySQL"))
    }

    async fn run_batch(&mut self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64> {
        let conn = self.conn()?;
        let statement = conn.prep(sql).await?;
        let mut count = 0;
        for row in rows {
            let params = Params::Positional(row.iter().map(to_mysql_value).collect());
            conn.exec_drop(&statement, params).await?;
            count += conn.affected_rows();
        }
        Ok(count)
    }
}

#[async_trait]
impl DriverConnection for MysqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let conn = self.conn()?;
        conn.query_drop(sql).await?;
        Ok(conn.affected_rows())
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn()?.query_drop("START TRANSACTION").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn()?.query_drop("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn()?.query_drop("ROLLBACK").await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool> {
        let count: Option<i64> = self
            .conn()?
            .exec_first(TABLE_EXISTS_SQL, (table.schema.clone(), table.table.clone()))
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>> {
        let rows: Vec<DescribeRow> = self
            .conn()?
            .exec(DESCRIBE_TABLE_SQL, (table.schema.clone(), table.table.clone()))
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let dialect = MysqlDialect::new();
        let columns: Vec<TargetColumn> = rows
            .into_iter()
            .map(|(name, type_name, char_length, precision, scale, nullable, key)| {
                let size = char_length.or(precision).unwrap_or(0);
                TargetColumn::generic(
                    name,
                    dialect.sql_type_of(&type_name),
                    type_name.to_uppercase(),
                    i32::try_from(size).unwrap_or(i32::MAX),
                    scale.and_then(|s| i32::try_from(s).ok()).unwrap_or(0),
                    nullable.eq_ignore_ascii_case("NO"),
                    key == "PRI",
                )
            })
            .collect();
        debug!("Described {} ({} columns)", table, columns.len());
        Ok(Some(TargetSchema::new(columns)))
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64> {
        self.begin().await?;
        match self.run_batch(sql, rows).await {
            Ok(count) => {
                self.commit().await?;
                Ok(count)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    return Err(e.with_suppressed(&rollback));
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the connection returns it to the pool.
        self.conn.take();
        Ok(())
    }
}

/// Convert a bound value to the MySQL wire value.
fn to_mysql_value(value: &BindValue) -> Value {
    match value {
        BindValue::Null(_) => Value::NULL,
        BindValue::Bool(b) => Value::Int(i64::from(*b)),
        BindValue::I8(v) => Value::Int(i64::from(*v)),
        BindValue::I16(v) => Value::Int(i64::from(*v)),
        BindValue::I32(v) => Value::Int(i64::from(*v)),
        BindValue::I64(v) => Value::Int(*v),
        BindValue::F32(v) => Value::Float(*v),
        BindValue::F64(v) => Value::Double(*v),
        BindValue::Decimal(d) => Value::Bytes(d.to_string().into_bytes()),
        BindValue::Text(s) | BindValue::NText(s) => Value::Bytes(s.as_bytes().to_vec()),
        BindValue::Bytes(b) => Value::Bytes(b.clone()),
        BindValue::Date(d) => Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0),
        BindValue::Time(t) => Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
        BindValue::Timestamp(ts) => datetime_value(ts),
        // DATETIME has no zone; store UTC.
        BindValue::TimestampTz(ts) => datetime_value(&ts.naive_utc()),
        BindValue::Json(j) => Value::Bytes(j.to_string().into_bytes()),
    }
}

fn datetime_value(ts: &chrono::NaiveDateTime) -> Value {
    Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.nanosecond() / 1_000,
    )
}
