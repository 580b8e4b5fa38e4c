//! `COPY ... FROM STDIN` batch insert.
//!
//! Rows are rendered into PostgreSQL's text COPY format in memory (tab
//! delimited, `\N` for NULL, one line per row) and streamed on flush. The
//! batch weight is the size of the rendered buffer.

use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use deadpool_postgres::{Object, Pool};
use futures::SinkExt;
use tracing::{info, warn};

use crate::batch::BatchInsert;
use crate::core::identifier::{quote_double, TableIdentifier};
use crate::core::schema::TargetSchema;
use crate::core::value::BindValue;
use crate::error::{LoadError, Result};

const NULL_STRING: &str = "\\N";
const DELIMITER: u8 = b'\t';
const NEWLINE: u8 = b'\n';

/// Streams rows with the COPY protocol over one dedicated pooled client.
pub struct CopyBatchInsert {
    pool: Pool,
    client: Option<Object>,
    sql: String,
    buffer: BytesMut,
    column_count: usize,
    index: usize,
    batch_rows: u64,
    total_rows: u64,
}

impl CopyBatchInsert {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            client: None,
            sql: String::new(),
            buffer: BytesMut::new(),
            column_count: 0,
            index: 0,
            batch_rows: 0,
            total_rows: 0,
        }
    }

    /// Build the COPY statement for `table`.
    pub fn copy_sql(table: &TableIdentifier, schema: &TargetSchema) -> Result<String> {
        let mut qualified = Vec::with_capacity(2);
        if let Some(s) = &table.schema {
            qualified.push(quote_double(s)?);
        }
        qualified.push(quote_double(&table.table)?);

        let mut columns = Vec::with_capacity(schema.len());
        for c in schema.columns.iter().filter(|c| !c.is_skip()) {
            columns.push(quote_double(c.name())?);
        }
        Ok(format!(
            "COPY {} ({}) FROM STDIN",
            qualified.join("."),
            columns.join(", ")
        ))
    }

    async fn client(&mut self) -> Result<&Object> {
        if self.client.is_none() {
            let client = self
                .pool
                .get()
                .await
                .map_err(|e| LoadError::pool(e, "getting PostgreSQL connection for COPY"))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| LoadError::pool("no connection after reconnect", "COPY flush"))
    }
}

#[async_trait]
impl BatchInsert for CopyBatchInsert {
    async fn prepare(&mut self, load_table: &TableIdentifier, insert_schema: &TargetSchema) -> Result<()> {
        self.sql = Self::copy_sql(load_table, insert_schema)?;
        info!("Copy SQL: {}", self.sql);
        self.column_count = insert_schema.insert_schema().len();
        self.client().await?;
        Ok(())
    }

    fn bind(&mut self, value: BindValue) -> Result<()> {
        if self.index >= self.column_count {
            return Err(LoadError::Config(format!(
                "Row already has all {} columns bound",
                self.column_count
            )));
        }
        if self.index != 0 {
            self.buffer.put_u8(DELIMITER);
        }
        self.index += 1;
        write_text_value(&mut self.buffer, &value);
        Ok(())
    }

    fn add(&mut self) -> Result<()> {
        if self.index != self.column_count {
            return Err(LoadError::Config(format!(
                "Row has {} bound columns, expected {}",
                self.index, self.column_count
            )));
        }
        self.buffer.put_u8(NEWLINE);
        self.batch_rows += 1;
        self.index = 0;
        Ok(())
    }

    fn batch_weight(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn total_rows(&self) -> u64 {
        self.total_rows
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch_rows == 0 {
            return Ok(());
        }
        info!("Loading {} rows ({} bytes)", self.batch_rows, self.buffer.len());
        let start = Instant::now();

        let data = Bytes::copy_from_slice(&self.buffer);
        let sql = self.sql.clone();
        let result = async {
            let client = self.client().await?;
            let sink = client.copy_in(sql.as_str()).await?;
            tokio::pin!(sink);
            sink.send(data).await?;
            Ok::<_, LoadError>(sink.finish().await?)
        }
        .await;

        match result {
            Ok(_) => {
                self.total_rows += self.batch_rows;
                self.batch_rows = 0;
                self.buffer.clear();
                info!(
                    "> {:.2} seconds (loaded {} rows in total)",
                    start.elapsed().as_secs_f64(),
                    self.total_rows
                );
                Ok(())
            }
            Err(e) => {
                // The failed COPY leaves the client unusable; keep the rows and reconnect next time.
                if e.is_connection_failure() {
                    warn!("COPY connection failed, reconnecting on the next flush");
                    self.client = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

/// Render one value in COPY text format.
fn write_text_value(buf: &mut BytesMut, value: &BindValue) {
    let text = match value {
        BindValue::Null(_) => {
            buf.put_slice(NULL_STRING.as_bytes());
            return;
        }
        BindValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        BindValue::I8(v) => v.to_string(),
        BindValue::I16(v) => v.to_string(),
        BindValue::I32(v) => v.to_string(),
        BindValue::I64(v) => v.to_string(),
        BindValue::F32(v) => v.to_string(),
        BindValue::F64(v) => v.to_string(),
        BindValue::Decimal(d) => d.to_string(),
        BindValue::Text(s) | BindValue::NText(s) => escape_copy_text(s),
        BindValue::Bytes(b) => format!("\\\\x{}", hex::encode(b)),
        BindValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        BindValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        BindValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        BindValue::TimestampTz(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        BindValue::Json(j) => escape_copy_text(&j.to_string()),
    };
    buf.put_slice(text.as_bytes());
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{SqlType, TargetColumn};
    use chrono::NaiveDate;

    fn render(values: &[BindValue]) -> String {
        let mut buf = BytesMut::new();
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                buf.put_u8(DELIMITER);
            }
            write_text_value(&mut buf, v);
        }
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_escape_copy_text() {
        assert_eq!(escape_copy_text("hello"), "hello");
        assert_eq!(escape_copy_text("a\tb"), "a\\tb");
        assert_eq!(escape_copy_text("line1\nline2"), "line1\\nline2");
        assert_eq!(escape_copy_text("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_text_row() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_micro_opt(3, 4, 5, 600)
            .unwrap();
        let line = render(&[
            BindValue::from("A001"),
            BindValue::Null(SqlType::BigInt),
            BindValue::Bool(true),
            BindValue::Timestamp(ts),
            BindValue::Bytes(vec![0xde, 0xad]),
        ]);
        assert_eq!(line, "A001\t\\N\tt\t2024-01-02 03:04:05.000600\t\\\\xdead");
    }

    #[test]
    fn test_copy_sql() {
        let schema = TargetSchema::new(vec![
            TargetColumn::generic("id", SqlType::BigInt, "BIGINT", 22, 0, false, false),
            TargetColumn::skip(),
            TargetColumn::generic("name", SqlType::Clob, "CLOB", 4000, 0, false, false),
        ]);
        let sql = CopyBatchInsert::copy_sql(&TableIdentifier::new(Some("public".into()), "t"), &schema)
            .unwrap();
        assert_eq!(sql, "COPY \"public\".\"t\" (\"id\", \"name\") FROM STDIN");
    }
}
