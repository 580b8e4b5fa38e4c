//! SQL Server connections: tiberius clients pooled by bb8.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use tiberius::{AuthMethod, Client, Config, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::dialect::MssqlDialect;
use crate::config::ConnectionConfig;
use crate::core::identifier::TableIdentifier;
use crate::core::schema::{SqlType, TargetColumn, TargetSchema};
use crate::core::traits::{Dialect, DriverConnection};
use crate::core::value::BindValue;
use crate::drivers::common::SslMode;
use crate::drivers::{Connector, DialectImpl};
use crate::error::{LoadError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection pool timeouts.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const TABLE_EXISTS_SQL: &str = "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_SCHEMA = COALESCE(@P1, SCHEMA_NAME()) AND TABLE_NAME = @P2";

const DESCRIBE_TABLE_SQL: &str = r#"
    SELECT c.COLUMN_NAME,
           c.DATA_TYPE,
           CAST(c.CHARACTER_MAXIMUM_LENGTH AS INT),
           CAST(c.NUMERIC_PRECISION AS INT),
           CAST(c.NUMERIC_SCALE AS INT),
           c.IS_NULLABLE,
           CAST(CASE WHEN EXISTS (
               SELECT 1
               FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
               JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                 ON tc.CONSTRAINT_NAME = k.CONSTRAINT_NAME
                AND tc.TABLE_SCHEMA = k.TABLE_SCHEMA
                AND tc.TABLE_NAME = k.TABLE_NAME
               WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
                 AND tc.TABLE_SCHEMA = c.TABLE_SCHEMA
                 AND tc.TABLE_NAME = c.TABLE_NAME
                 AND k.COLUMN_NAME = c.COLUMN_NAME
           ) THEN 1 ELSE 0 END AS INT)
    FROM INFORMATION_SCHEMA.COLUMNS c
    WHERE c.TABLE_SCHEMA = COALESCE(@P1, SCHEMA_NAME()) AND c.TABLE_NAME = @P2
    ORDER BY c.ORDINAL_POSITION
"#;

type MssqlClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: ConnectionConfig,
    ssl_mode: SslMode,
}

impl TiberiusConnectionManager {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        Ok(Self { config, ssl_mode })
    }

    fn build_config(&self) -> std::result::Result<Config, tiberius::error::Error> {
        // A url is an ADO.NET connection string and carries its own encryption settings.
        if let Some(url) = &self.config.url {
            return Config::from_ado_string(url);
        }

        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.application_name(&self.config.application_name);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));
        self.ssl_mode.apply_to_mssql(&mut config);
        config.packet_size(TDS_MAX_PACKET_SIZE);
        Ok(config)
    }
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config()?;
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| io_error(e, "connecting to SQL Server"))?;
        tcp.set_nodelay(true).ok();

        // Keepalives let a dead server surface as an I/O error instead of a hang.
        let std_tcp = tcp
            .into_std()
            .map_err(|e| io_error(e, "Failed to convert socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "Failed to convert socket"))?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pool of SQL Server connections.
pub struct MssqlConnector {
    pool: Pool<TiberiusConnectionManager>,
    dialect: DialectImpl,
}

impl MssqlConnector {
    /// Create the pool and check that the server answers.
    pub async fn new(config: &ConnectionConfig, max_conns: usize) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone())?;
        let max_size = u32::try_from(max_conns.max(1)).unwrap_or(u32::MAX);
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| LoadError::pool(e, "creating MSSQL pool"))?;

        // Test connection
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| LoadError::pool(e, "testing MSSQL connection"))?;
            conn.simple_query("SELECT 1").await?.into_results().await?;
        }

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host,
            config.port(),
            config.database,
            max_size
        );

        Ok(Self {
            pool,
            dialect: DialectImpl::Mssql(MssqlDialect::new()),
        })
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| LoadError::pool(e, "getting MSSQL connection"))?;
        Ok(Box::new(MssqlConnection::new(conn)))
    }
}

/// One pooled SQL Server client.
pub struct MssqlConnection {
    conn: Option<PooledConnection<'static, TiberiusConnectionManager>>,
}

impl MssqlConnection {
    pub fn new(conn: PooledConnection<'static, TiberiusConnectionManager>) -> Self {
        Self { conn: Some(conn) }
    }

    fn client(&mut self) -> Result<&mut MssqlClient> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| LoadError::pool("connection already closed", "MSSQL"))
    }

    /// Run a statement outside `sp_executesql`, so transaction control sticks.
    async fn simple(&mut self, sql: &str) -> Result<()> {
        self.client()?.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn query_rows(&mut self, sql: &str, table: &TableIdentifier) -> Result<Vec<Row>> {
        let mut query = Query::new(sql);
        query.bind(table.schema.clone());
        query.bind(table.table.clone());
        Ok(query.query(self.client()?).await?.into_first_result().await?)
    }

    async fn run_batch(&mut self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64> {
        let client = self.client()?;
        let mut count = 0;
        for row in rows {
            let mut query = Query::new(sql);
            for value in row {
                bind_value(&mut query, value);
            }
            count += query.execute(&mut *client).await?.total();
        }
        Ok(count)
    }
}

#[async_trait]
impl DriverConnection for MssqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.client()?.execute(sql, &[]).await?.total())
    }

    async fn begin(&mut self) -> Result<()> {
        self.simple("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.simple("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.simple("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }

    async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool> {
        let rows = self.query_rows(TABLE_EXISTS_SQL, table).await?;
        let count = match rows.first() {
            Some(row) => row.try_get::<i32, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(count > 0)
    }

    async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>> {
        let rows = self.query_rows(DESCRIBE_TABLE_SQL, table).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let dialect = MssqlDialect::new();
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = row.try_get::<&str, _>(0)?.unwrap_or_default();
            let type_name = row.try_get::<&str, _>(1)?.unwrap_or_default();
            let char_length = row.try_get::<i32, _>(2)?;
            let precision = row.try_get::<i32, _>(3)?;
            let scale = row.try_get::<i32, _>(4)?;
            let nullable = row.try_get::<&str, _>(5)?.unwrap_or("YES");
            let primary_key = row.try_get::<i32, _>(6)?.unwrap_or(0) == 1;

            // -1 means (MAX)
            let size = match char_length {
                Some(-1) => i32::MAX,
                other => other.or(precision).unwrap_or(0),
            };
            columns.push(TargetColumn::generic(
                name,
                dialect.sql_type_of(type_name),
                type_name.to_uppercase(),
                size,
                scale.unwrap_or(0),
                nullable.eq_ignore_ascii_case("NO"),
                primary_key,
            ));
        }
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
        // Dropping the pooled connection returns it to the pool.
        self.conn.take();
        Ok(())
    }
}

/// Bind one value as the matching TDS parameter type.
fn bind_value(query: &mut Query<'_>, value: &BindValue) {
    match value {
        BindValue::Null(sql_type) => bind_null(query, *sql_type),
        BindValue::Bool(b) => query.bind(*b),
        BindValue::I8(v) => query.bind(i16::from(*v)),
        BindValue::I16(v) => query.bind(*v),
        BindValue::I32(v) => query.bind(*v),
        BindValue::I64(v) => query.bind(*v),
        BindValue::F32(v) => query.bind(*v),
        BindValue::F64(v) => query.bind(*v),
        BindValue::Decimal(d) => query.bind(tiberius::numeric::Numeric::new_with_scale(d.mantissa(), d.scale() as u8)),
        BindValue::Text(s) | BindValue::NText(s) => query.bind(s.clone()),
        BindValue::Bytes(b) => query.bind(b.clone()),
        BindValue::Date(d) => query.bind(*d),
        BindValue::Time(t) => query.bind(*t),
        BindValue::Timestamp(ts) => query.bind(*ts),
        BindValue::TimestampTz(ts) => query.bind(*ts),
        BindValue::Json(j) => query.bind(j.to_string()),
    }
}

/// Typed NULLs, so the server doesn't have to convert from NVARCHAR.
fn bind_null(query: &mut Query<'_>, sql_type: SqlType) {
    match sql_type {
        SqlType::Bit | SqlType::Boolean => query.bind(Option::<bool>::None),
        SqlType::TinyInt | SqlType::SmallInt => query.bind(Option::<i16>::None),
        SqlType::Integer => query.bind(Option::<i32>::None),
        SqlType::BigInt => query.bind(Option::<i64>::None),
        SqlType::Real | SqlType::Float | SqlType::Double => query.bind(Option::<f64>::None),
        SqlType::Binary | SqlType::VarBinary | SqlType::LongVarBinary | SqlType::Blob => {
            query.bind(Option::<Vec<u8>>::None)
        }
        SqlType::Timestamp => query.bind(Option::<chrono::NaiveDateTime>::None),
        _ => query.bind(Option::<String>::None),
    }
}
