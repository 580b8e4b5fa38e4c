//! In-memory destination for the lifecycle tests.
//!
//! Executes the statements the standard dialect renders (CREATE / DROP /
//! ALTER ... RENAME / DELETE / INSERT ... VALUES / INSERT ... SELECT ... UNION
//! ALL / MERGE) against tables held in memory. Transactions snapshot the
//! tables and restore them on rollback. Faults can be injected per statement.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sql_bulk_load::core::traits::standard_sql_type_of;
use sql_bulk_load::core::{BindValue, DriverConnection, SqlType, TargetColumn, TargetSchema};
use sql_bulk_load::drivers::StandardDialect;
use sql_bulk_load::{Connector, DialectImpl, LoadError, Result, TableIdentifier};

#[derive(Debug, Clone)]
struct MemColumn {
    name: String,
    type_name: String,
}

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<MemColumn>,
    primary_key: Vec<String>,
    rows: Vec<Vec<BindValue>>,
}

impl MemTable {
    fn position(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| LoadError::database(Some("42703"), None, format!("column \"{}\" does not exist", column)))
    }
}

struct Fault {
    patterns: Vec<String>,
    remaining: usize,
    make: Box<dyn Fn() -> LoadError + Send>,
}

#[derive(Default)]
struct Engine {
    tables: BTreeMap<String, MemTable>,
    faults: Vec<Fault>,
    statements: Vec<String>,
    batch_calls: usize,
    open_connections: usize,
}

impl Engine {
    fn inject(&mut self, sql: &str) -> Result<()> {
        for fault in self.faults.iter_mut() {
            if fault.remaining > 0 && fault.patterns.iter().all(|p| sql.contains(p.as_str())) {
                fault.remaining -= 1;
                return Err((fault.make)());
            }
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| LoadError::database(Some("42P01"), None, format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| LoadError::database(Some("42P01"), None, format!("relation \"{}\" does not exist", name)))
    }

    fn execute(&mut self, sql: &str, params: Option<&[BindValue]>) -> Result<u64> {
        let affected = if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            self.create(rest)?
        } else if let Some(rest) = sql.strip_prefix("DROP TABLE ") {
            self.drop_table(rest)?
        } else if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
            self.rename(rest)?
        } else if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let table = self.table_mut(&table_name(rest))?;
            let count = table.rows.len() as u64;
            table.rows.clear();
            count
        } else if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            self.insert(rest, params)?
        } else if let Some(rest) = sql.strip_prefix("MERGE INTO ") {
            self.merge(rest, params)?
        } else if sql == "SELECT 1" {
            0
        } else {
            return Err(syntax_error(sql));
        };
        self.statements.push(sql.to_string());
        Ok(affected)
    }

    fn create(&mut self, rest: &str) -> Result<u64> {
        let (if_not_exists, rest) = match rest.strip_prefix("IF NOT EXISTS ") {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let open = rest.find(" (").ok_or_else(|| syntax_error(rest))?;
        let name = table_name(&rest[..open]);
        let body = enclosed(&rest[open + 1..]).ok_or_else(|| syntax_error(rest))?;

        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        for item in split_top_level(body) {
            if let Some(keys) = item.strip_prefix("PRIMARY KEY ") {
                primary_key = column_list(keys.trim().trim_start_matches('(').trim_end_matches(')'));
                continue;
            }
            let item = item.trim_start_matches('"');
            let end = item.find('"').ok_or_else(|| syntax_error(item))?;
            columns.push(MemColumn {
                name: item[..end].to_string(),
                type_name: item[end + 1..].trim().to_string(),
            });
        }

        if self.tables.contains_key(&name) {
            if if_not_exists {
                return Ok(0);
            }
            return Err(LoadError::database(Some("42P07"), None, format!("relation \"{}\" already exists", name)));
        }
        self.tables.insert(
            name,
            MemTable {
                columns,
                primary_key,
                rows: Vec::new(),
            },
        );
        Ok(0)
    }

    fn drop_table(&mut self, rest: &str) -> Result<u64> {
        let (if_exists, rest) = match rest.strip_prefix("IF EXISTS ") {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let name = table_name(rest);
        if self.tables.remove(&name).is_none() && !if_exists {
            self.table(&name)?;
        }
        Ok(0)
    }

    fn rename(&mut self, rest: &str) -> Result<u64> {
        let (from, to) = rest.split_once(" RENAME TO ").ok_or_else(|| syntax_error(rest))?;
        let (from, to) = (table_name(from), table_name(to));
        if self.tables.contains_key(&to) {
            return Err(LoadError::database(Some("42P07"), None, format!("relation \"{}\" already exists", to)));
        }
        let table = self
            .tables
            .remove(&from)
            .ok_or_else(|| LoadError::database(Some("42P01"), None, format!("relation \"{}\" does not exist", from)))?;
        self.tables.insert(to, table);
        Ok(0)
    }

    fn insert(&mut self, rest: &str, params: Option<&[BindValue]>) -> Result<u64> {
        let open = rest.find(" (").ok_or_else(|| syntax_error(rest))?;
        let name = table_name(&rest[..open]);
        let close = rest[open..].find(") ").ok_or_else(|| syntax_error(rest))? + open;
        let columns = column_list(&rest[open + 2..close]);
        let source = rest[close + 2..].trim();

        let rows = if source.starts_with("VALUES") {
            vec![params.ok_or_else(|| syntax_error(source))?.to_vec()]
        } else {
            self.select_union(source, &columns)?
        };
        let table = self.table_mut(&name)?;
        let positions = columns.iter().map(|c| table.position(c)).collect::<Result<Vec<_>>>()?;
        let count = rows.len() as u64;
        for row in rows {
            table.rows.push(place(table.columns.len(), &positions, row));
        }
        Ok(count)
    }

    fn merge(&mut self, rest: &str, params: Option<&[BindValue]>) -> Result<u64> {
        let (name, rest) = rest.split_once(" AS T USING (").ok_or_else(|| syntax_error(rest))?;
        let name = table_name(name);
        let (source, rest) = rest.split_once(") AS S ON (").ok_or_else(|| syntax_error(rest))?;
        let (on, rest) = rest.split_once(')').ok_or_else(|| syntax_error(rest))?;
        let keys: Vec<String> = on
            .split(" AND ")
            .filter_map(|cond| cond.trim().strip_prefix("T.").and_then(|c| c.split(" = ").next()))
            .map(unquote)
            .collect();
        let (_, insert) = rest
            .split_once(" WHEN NOT MATCHED THEN INSERT (")
            .ok_or_else(|| syntax_error(rest))?;
        let (insert_columns, _) = insert.split_once(')').ok_or_else(|| syntax_error(insert))?;
        let columns = column_list(insert_columns);

        let rows = if source.starts_with("SELECT ?") {
            vec![params.ok_or_else(|| syntax_error(source))?.to_vec()]
        } else {
            self.select_union(source, &columns)?
        };

        let table = self.table_mut(&name)?;
        let positions = columns.iter().map(|c| table.position(c)).collect::<Result<Vec<_>>>()?;
        let key_positions: Vec<(usize, usize)> = keys
            .iter()
            .map(|k| {
                let source_index = columns.iter().position(|c| c == k).ok_or_else(|| syntax_error(k))?;
                Ok((source_index, table.position(k)?))
            })
            .collect::<Result<_>>()?;

        let width = table.columns.len();
        let count = rows.len() as u64;
        for row in rows {
            let existing = table.rows.iter_mut().find(|target| {
                key_positions
                    .iter()
                    .all(|&(s, t)| target[t] == row[s])
            });
            match existing {
                Some(target) => {
                    for (value, &position) in row.into_iter().zip(&positions) {
                        target[position] = value;
                    }
                }
                None => table.rows.push(place(width, &positions, row)),
            }
        }
        Ok(count)
    }

    /// Rows of `SELECT cols FROM a UNION ALL SELECT cols FROM b ...`.
    fn select_union(&self, source: &str, columns: &[String]) -> Result<Vec<Vec<BindValue>>> {
        let mut rows = Vec::new();
        for select in source.split(" UNION ALL ") {
            let (_, from) = select.split_once(" FROM ").ok_or_else(|| syntax_error(select))?;
            let table = self.table(&table_name(from))?;
            let positions = columns.iter().map(|c| table.position(c)).collect::<Result<Vec<_>>>()?;
            for row in &table.rows {
                rows.push(positions.iter().map(|&p| row[p].clone()).collect());
            }
        }
        Ok(rows)
    }
}

/// Full-width row with `values` at `positions` and NULL elsewhere.
fn place(width: usize, positions: &[usize], values: Vec<BindValue>) -> Vec<BindValue> {
    let mut row = vec![BindValue::Null(SqlType::Null); width];
    for (value, &position) in values.into_iter().zip(positions) {
        row[position] = value;
    }
    row
}

fn syntax_error(sql: &str) -> LoadError {
    LoadError::database(Some("42601"), None, format!("syntax error at or near \"{}\"", sql))
}

fn unquote(name: &str) -> String {
    name.trim().trim_matches('"').replace("\"\"", "\"")
}

/// Last segment of a possibly qualified, quoted table name.
fn table_name(quoted: &str) -> String {
    unquote(quoted.trim().rsplit("\".\"").next().unwrap_or(quoted))
}

fn column_list(list: &str) -> Vec<String> {
    split_top_level(list).iter().map(|c| unquote(c)).collect()
}

/// Content of the parenthesized group `s` starts with.
fn enclosed(s: &str) -> Option<&str> {
    let mut depth = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for ch in s.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// `VARCHAR(8)` as (`VARCHAR`, 8, 0).
fn parse_type(type_name: &str) -> (String, i32, i32) {
    let Some((simple, params)) = type_name.split_once('(') else {
        return (type_name.to_string(), 0, 0);
    };
    let mut numbers = params
        .trim_end_matches(')')
        .split(',')
        .map(|n| n.trim().parse::<i32>().unwrap_or(0));
    let size = numbers.next().unwrap_or(0);
    let scale = numbers.next().unwrap_or(0);
    (simple.trim().to_string(), size, scale)
}

/// Shared in-memory database.
#[derive(Clone, Default)]
pub struct MemoryDb {
    engine: Arc<Mutex<Engine>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            db: self.clone(),
            dialect: DialectImpl::Standard(StandardDialect),
        })
    }

    pub fn create_table(&self, name: &str, columns: &[(&str, &str)], primary_key: &[&str]) {
        self.lock().tables.insert(
            name.to_string(),
            MemTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| MemColumn {
                        name: n.to_string(),
                        type_name: t.to_string(),
                    })
                    .collect(),
                primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn insert_row(&self, name: &str, row: Vec<BindValue>) {
        self.lock()
            .tables
            .get_mut(name)
            .expect("table exists")
            .rows
            .push(row);
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.lock().tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn column_names(&self, name: &str) -> Vec<String> {
        self.lock().tables[name]
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column_type(&self, table: &str, column: &str) -> String {
        self.lock().tables[table]
            .columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.type_name.clone())
            .expect("column exists")
    }

    /// Rows of `name`, sorted by their debug rendering for stable comparison.
    pub fn rows(&self, name: &str) -> Vec<Vec<BindValue>> {
        let mut rows = self.lock().tables[name].rows.clone();
        rows.sort_by_key(|r| format!("{:?}", r));
        rows
    }

    /// Fail the next `times` statements containing every one of `patterns` with `make()`.
    /// Table introspection is matched as `DESCRIBE <table>`.
    pub fn fail_next(
        &self,
        patterns: &[&str],
        times: usize,
        make: impl Fn() -> LoadError + Send + 'static,
    ) {
        self.lock().faults.push(Fault {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            remaining: times,
            make: Box::new(make),
        });
    }

    /// Faults that have not fired yet.
    pub fn pending_faults(&self) -> usize {
        self.lock().faults.iter().map(|f| f.remaining).sum()
    }

    /// Calls to `execute_batch` that reached the engine.
    pub fn batch_calls(&self) -> usize {
        self.lock().batch_calls
    }

    /// Successfully executed statements, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }
}

struct MemoryConnector {
    db: MemoryDb,
    dialect: DialectImpl,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        self.db.lock().open_connections += 1;
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            snapshot: None,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    db: MemoryDb,
    snapshot: Option<BTreeMap<String, MemTable>>,
    closed: bool,
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut engine = self.db.lock();
        engine.inject(sql)?;
        engine.execute(sql, None)
    }

    async fn begin(&mut self) -> Result<()> {
        self.snapshot = Some(self.db.lock().tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tables) = self.snapshot.take() {
            self.db.lock().tables = tables;
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableIdentifier) -> Result<bool> {
        Ok(self.db.lock().tables.contains_key(&table.table))
    }

    async fn describe_table(&mut self, table: &TableIdentifier) -> Result<Option<TargetSchema>> {
        let mut engine = self.db.lock();
        engine.inject(&format!("DESCRIBE {}", table.table))?;
        let Some(mem) = engine.tables.get(&table.table) else {
            return Ok(None);
        };
        let columns = mem
            .columns
            .iter()
            .map(|c| {
                let (simple, size, scale) = parse_type(&c.type_name);
                let key = mem.primary_key.contains(&c.name);
                TargetColumn::generic(&c.name, standard_sql_type_of(&simple), simple, size, scale, key, key)
            })
            .collect();
        Ok(Some(TargetSchema::new(columns)))
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<BindValue>]) -> Result<u64> {
        let mut engine = self.db.lock();
        engine.batch_calls += 1;
        engine.inject(sql)?;
        let before = engine.tables.clone();
        let mut count = 0;
        for row in rows {
            match engine.execute(sql, Some(row)) {
                Ok(n) => count += n,
                Err(e) => {
                    engine.tables = before;
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.lock().open_connections -= 1;
        }
        Ok(())
    }
}

/// A broken connection; retryable under every dialect.
pub fn connection_reset() -> LoadError {
    LoadError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

/// A statement error that is never retried.
pub fn permission_denied() -> LoadError {
    LoadError::database(Some("42501"), None, "permission denied")
}
