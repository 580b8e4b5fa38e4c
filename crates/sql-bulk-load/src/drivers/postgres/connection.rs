//! PostgreSQL connections.
//!
//! Uses deadpool-postgres for connection pooling. Every [`PostgresConnection`]
//! owns one pooled client for its whole lifetime.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, Json, ToSql, Type};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::copy::CopyBatchInsert;
use super::dialect::PostgresDialect;
use crate::batch::BatchInsert;
use crate::config::ConnectionConfig;
use crate::core::identifier::TableIdentifier;
use crate::core::schema::{TargetColumn, TargetSchema};
use crate::core::traits::{Dialect, DriverConnection};
use crate::core::value::BindValue;
use crate::drivers::common::SslMode;
use crate::drivers::{Connector, DialectImpl};
use crate::error::{LoadError, Result};

// information_schema uses domain types; cast everything to plain types.
const TABLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema::text = COALESCE($1::text, current_schema()) AND table_name::text = $2::text)";

const DESCRIBE_TABLE_SQL: &str = r#"
    SELECT c.column_name::text,
           (CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name ELSE c.data_type END)::text,
           c.character_maximum_length::int4,
           c.numeric_precision::int4,
           c.numeric_scale::int4,
           c.is_nullable::text = 'NO',
           EXISTS (
               SELECT 1
               FROM information_schema.table_constraints tc
               JOIN information_schema.key_column_usage k
                 ON tc.constraint_name = k.constraint_name
                AND tc.table_schema = k.table_schema
                AND tc.table_name = k.table_name
               WHERE tc.constraint_type = 'PRIMARY KEY'
                 AND tc.table_schema = c.table_schema
                 AND tc.table_name = c.table_name
                 AND k.column_name = c.column_name
           )
    FROM information_schema.columns c
    WHERE c.table_schema::text = COALESCE($1::text, current_schema())
      AND c.table_name::text = $2::text
    ORDER BY c.ordinal_position
"#;

/// Pool of PostgreSQL connections.
pub struct PostgresConnector {
    pool: Pool,
    dialect: DialectImpl,
}

impl PostgresConnector {
    /// Create the pool and check that the server answers.
    pub async fn new(config: &ConnectionConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = match &config.url {
            Some(url) => url
                .parse::<PgConfig>()
                .map_err(|e| LoadError::Config(format!("Invalid PostgreSQL url: {}", e)))?,
            None => {
                let mut pg_config = PgConfig::new();
                pg_config.host(&config.host);
                pg_config.port(config.port());
                pg_config.dbname(&config.database);
                pg_config.user(&config.user);
                pg_config.password(&config.password);
                pg_config
            }
        };
        pg_config.application_name(&config.application_name);

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let mgr = match ssl_mode.postgres_connector()? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| LoadError::pool(e, "creating PostgreSQL pool"))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| LoadError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            pool,
            dialect: DialectImpl::Postgres(PostgresDialect::new()),
        })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| LoadError::pool(e, "getting PostgreSQL connection"))?;
        Ok(Box::new(PostgresConnection::new(client)))
    }

    fn copy_batch_insert(&self) -> Option<Box<dyn BatchInsert>> {
        Some(Box::new(CopyBatchInsert::new(self.pool.clone())))
    }
}

/// One pooled PostgreSQL client.
pub struct PostgresConnection {
    client: Option<Object>,
}

impl PostgresConnection {
    pub fn new(client: Object) -> Self {
        Self {
            client: Some(client),
        }
    }

    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| LoadError::pool("connection already closed", "PostgreSQL"))
    }

    async fn run_batch(&self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64> {
        let client = self.client()?;
        let statement = client.prepare(sql).await?;
        let mut count = 0;
        for row in rows {
            let params: Vec<PgParam<'_>> = row.iter().map(PgParam).collect();
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            count += client.execute(&statement, &refs).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.client()?.execute(sql, &[]).await?)
    }

    async fn begin(&mut self) -> Result<()> {
        self.client()?.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client()?.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client()?.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool> {
        let row = self
            .client()?
            .query_one(TABLE_EXISTS_SQL, &[&table.schema, &table.table])
            .await?;
        Ok(row.get::<_, bool>(0))
    }

    async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>> {
        let rows = self
            .client()?
            .query(DESCRIBE_TABLE_SQL, &[&table.schema, &table.table])
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let dialect = PostgresDialect::new();
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let type_name: String = row.get(1);
            let char_length: Option<i32> = row.get(2);
            let precision: Option<i32> = row.get(3);
            let scale: Option<i32> = row.get(4);
            let not_null: bool = row.get(5);
            let primary_key: bool = row.get(6);

            let simple_type_name = type_name.to_uppercase();
            let unbounded = simple_type_name == "CHARACTER VARYING" || simple_type_name == "NUMERIC";
            let size = char_length
                .or(precision)
                .unwrap_or(if unbounded { i32::MAX } else { 0 });
            columns.push(TargetColumn::generic(
                name,
                dialect.sql_type_of(&type_name),
                simple_type_name,
                size,
                scale.unwrap_or(0),
                not_null,
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
        // Dropping the object returns the client to the pool.
        self.client.take();
        Ok(())
    }
}

/// Binds a [`BindValue`] as whatever type the server inferred for the parameter.
#[derive(Debug)]
struct PgParam<'a>(&'a BindValue);

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self.0 {
            BindValue::Null(_) => Ok(IsNull::Yes),
            BindValue::Bool(v) => v.to_sql(ty, out),
            BindValue::I8(v) => integer_to_sql(i64::from(*v), ty, out),
            BindValue::I16(v) => integer_to_sql(i64::from(*v), ty, out),
            BindValue::I32(v) => integer_to_sql(i64::from(*v), ty, out),
            BindValue::I64(v) => integer_to_sql(*v, ty, out),
            BindValue::F32(v) if *ty == Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
            BindValue::F32(v) => v.to_sql(ty, out),
            BindValue::F64(v) if *ty == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            BindValue::F64(v) => v.to_sql(ty, out),
            BindValue::Decimal(d) => d.to_sql(ty, out),
            BindValue::Text(s) | BindValue::NText(s) => {
                if *ty == Type::JSON || *ty == Type::JSONB {
                    let parsed: serde_json::Value = serde_json::from_str(s)?;
                    Json(parsed).to_sql(ty, out)
                } else {
                    s.as_str().to_sql(ty, out)
                }
            }
            BindValue::Bytes(b) => b.as_slice().to_sql(ty, out),
            BindValue::Date(d) => d.to_sql(ty, out),
            BindValue::Time(t) => t.to_sql(ty, out),
            BindValue::Timestamp(ts) if *ty == Type::TIMESTAMPTZ => {
                Utc.from_utc_datetime(ts).to_sql(ty, out)
            }
            BindValue::Timestamp(ts) => ts.to_sql(ty, out),
            BindValue::TimestampTz(ts) if *ty == Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
            BindValue::TimestampTz(ts) => ts.to_sql(ty, out),
            BindValue::Json(j) if *ty == Type::JSON || *ty == Type::JSONB => Json(j).to_sql(ty, out),
            BindValue::Json(j) => j.to_string().as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Encode an integer at the width of the parameter's actual type.
fn integer_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::CHAR => i8::try_from(v)?.to_sql(ty, out),
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::FLOAT8 => (v as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        Type::BOOL => (v != 0).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().as_str().to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}
