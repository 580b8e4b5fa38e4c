//! The load transaction: begin, per-worker open, commit, cleanup.
//!
//! [`BulkLoader::begin`] decides the table topology for the configured mode
//! and returns a [`TransactionPlan`]. Workers are opened from the plan,
//! [`BulkLoader::commit`] moves the loaded rows into the target, and
//! [`BulkLoader::cleanup`] drops whatever intermediate tables are left. Every
//! metadata operation runs on its own connection under the retry executor.
//!
//! | mode             | begin                          | commit                        |
//! |------------------|--------------------------------|-------------------------------|
//! | insert_direct    | create target if missing       | `after_load` only             |
//! | merge_direct     | create target, resolve keys    | `after_load` only             |
//! | insert           | create target, table prefix    | INSERT from worker tables     |
//! | truncate_insert  | create target, table prefix    | DELETE, then INSERT           |
//! | merge            | create target, table prefix    | MERGE from worker tables      |
//! | replace          | swap table from input          | drop target, rename swap      |
//! | replace_inplace  | swap table from target DDL     | drop target, rename swap      |

mod plan;
mod worker;

pub use plan::TransactionPlan;
pub use worker::{LoadWorker, WorkerReport};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchInsert, StandardBatchInsert};
use crate::coercion::SetterFactory;
use crate::config::{ColumnOption, InsertMethod, OutputConfig};
use crate::connection::{CreateTableOptions, OutputConnection};
use crate::core::identifier::{
    intermediate_table_prefix, retired_table, worker_suffix_width, TableIdentifier,
};
use crate::core::mode::Mode;
use crate::core::schema::{column_option, InputSchema, TargetSchema};
use crate::core::traits::{Dialect, DialectFeatures, MergeConfig};
use crate::drivers::{Connector, DialectImpl};
use crate::error::{LoadError, Result};
use crate::retry::{LoggingHooks, RetryExecutor};

/// Runs load transactions against one destination.
pub struct BulkLoader {
    connector: Arc<dyn Connector>,
    output: OutputConfig,
    /// Schema of the target table; the connection default when `None`.
    schema: Option<String>,
    retry: RetryExecutor,
}

impl BulkLoader {
    pub fn new(connector: Arc<dyn Connector>, output: OutputConfig, schema: Option<String>) -> Self {
        let retry = RetryExecutor::from_config(&output);
        Self {
            connector,
            output,
            schema,
            retry,
        }
    }

    /// Abort retry backoffs when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.retry = self.retry.with_cancellation(token);
        self
    }

    pub fn dialect(&self) -> &DialectImpl {
        self.connector.dialect()
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    /// Table named by the configuration, before case resolution.
    pub fn configured_table(&self) -> TableIdentifier {
        TableIdentifier::new(self.schema.clone(), &self.output.table)
    }

    /// Prepare the destination for `worker_count` workers loading `input`.
    pub async fn begin(&self, input: &InputSchema, worker_count: usize) -> Result<TransactionPlan> {
        check_mode(&self.dialect().features(), &self.output, input)?;
        if worker_count == 0 {
            return Err(LoadError::Config("At least one worker is required".into()));
        }

        // Fixed across attempts, so a retry reuses the swap table an earlier attempt created.
        let unique = Utc::now().timestamp_millis().unsigned_abs();
        let hooks = self.hooks("Begin transaction");
        let plan = self
            .retry
            .run(&hooks, || async {
                let mut con = self.connect().await?;
                let result = self.begin_with(&mut con, input, worker_count, unique).await;
                release(con, result).await
            })
            .await?;

        info!(
            "Using {} mode into {} ({} load table(s))",
            plan.mode,
            plan.actual_table,
            plan.worker_tables().len().max(1)
        );
        Ok(plan)
    }

    async fn begin_with(
        &self,
        con: &mut OutputConnection,
        input: &InputSchema,
        worker_count: usize,
        unique: u64,
    ) -> Result<TransactionPlan> {
        let mode = self.output.mode;
        let features = con.dialect().features();
        let options = &self.output.column_options;
        let actual_table = resolve_actual_table(con, &self.configured_table()).await?;

        let initial = if mode.ignore_target_table_schema() {
            None
        } else {
            con.describe_table(&actual_table).await?
        };
        let new_table_schema = match initial {
            Some(existing) => with_declared_types(existing, input, options),
            None => TargetSchema::for_new_table(input, options),
        };

        let mut swap_table = None;
        let mut table_prefix = None;
        let mut suffix_width = 0;

        let existing = if mode.commit_by_swap_table() {
            let name = intermediate_table_prefix(
                &actual_table.table,
                unique,
                0,
                features.max_table_name_length,
                features.length_semantics,
            )?;
            let swap = actual_table.with_table(name);
            con.drop_table_if_exists(&swap).await?;
            con.create_table_if_not_exists(&swap, &new_table_schema, self.create_options())
                .await?;
            let described = describe_created(con, &swap).await?;
            swap_table = Some(swap);
            described
        } else {
            con.create_table_if_not_exists(&actual_table, &new_table_schema, self.create_options())
                .await?;
            let described = describe_created(con, &actual_table).await?;
            if mode.temp_table_per_task() {
                suffix_width = worker_suffix_width(worker_count);
                table_prefix = Some(intermediate_table_prefix(
                    &actual_table.table,
                    unique,
                    suffix_width,
                    features.max_table_name_length,
                    features.length_semantics,
                )?);
            }
            described
        };

        let target_schema = existing.match_input(input, self.output.column_matching)?;
        let factory = self.setter_factory();
        for (input_column, target_column) in input.columns.iter().zip(&target_schema.columns) {
            factory.create(input_column, target_column)?;
        }
        if target_schema.insert_schema().is_empty() {
            return Err(LoadError::Config("No column to insert.".into()));
        }

        let merge = if mode.is_merge() {
            Some(merge_config(&features, &self.output, &target_schema)?)
        } else {
            None
        };

        if mode.is_direct_modify() {
            if let Some(sql) = &self.output.before_load {
                con.execute_in_transaction(std::slice::from_ref(sql)).await?;
            }
        }

        Ok(TransactionPlan {
            mode,
            actual_table,
            input_schema: input.clone(),
            target_schema,
            swap_table,
            table_prefix,
            suffix_width,
            worker_count,
            merge,
        })
    }

    /// Open worker `worker_index`: create its load table if the mode has one
    /// per worker, then prepare its batch insert.
    pub async fn open(&self, plan: &TransactionPlan, worker_index: usize) -> Result<LoadWorker> {
        if worker_index >= plan.worker_count {
            return Err(LoadError::Config(format!(
                "Worker index {} is out of range for {} workers",
                worker_index, plan.worker_count
            )));
        }
        let load_table = plan.load_table(worker_index);
        let insert_schema = plan.insert_schema();

        if plan.table_prefix.is_some() {
            let description = format!("Create load table {}", load_table);
            let hooks = self.hooks(&description);
            self.retry
                .run(&hooks, || async {
                    let mut con = self.connect().await?;
                    let result = async {
                        con.drop_table_if_exists(&load_table).await?;
                        con.create_table(&load_table, &insert_schema, CreateTableOptions::default())
                            .await
                    }
                    .await;
                    release(con, result).await
                })
                .await?;
        }

        let factory = self.setter_factory();
        let setters = plan
            .input_schema
            .columns
            .iter()
            .zip(&plan.target_schema.columns)
            .map(|(input, target)| factory.create(input, target))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = self.new_batch(plan)?;
        if let Err(e) = batch.prepare(&load_table, &insert_schema).await {
            return Err(match batch.close().await {
                Ok(()) => e,
                Err(close) => e.with_suppressed(&close),
            });
        }
        debug!("Worker {} writes into {}", worker_index, load_table);

        let retry = (!plan.mode.is_direct_modify()).then(|| self.retry.clone());
        Ok(LoadWorker::new(
            worker_index,
            load_table,
            batch,
            setters,
            self.output.batch_size,
            self.dialect().clone(),
            retry,
        ))
    }

    fn new_batch(&self, plan: &TransactionPlan) -> Result<Box<dyn BatchInsert>> {
        match self.output.insert_method {
            InsertMethod::Copy => self.connector.copy_batch_insert().ok_or_else(|| {
                LoadError::Config(format!(
                    "insert_method 'copy' is not supported by the {} dialect",
                    self.dialect().name()
                ))
            }),
            InsertMethod::Normal => {
                let merge = match plan.mode {
                    Mode::MergeDirect => plan.merge.clone(),
                    _ => None,
                };
                Ok(Box::new(StandardBatchInsert::new(self.connector.clone(), merge)))
            }
        }
    }

    /// Move the loaded rows into the target. Direct modes only run `after_load`.
    pub async fn commit(&self, plan: &TransactionPlan) -> Result<()> {
        if plan.mode.is_direct_modify() && self.output.after_load.is_none() {
            return Ok(());
        }
        let hooks = self.hooks("Commit transaction");
        self.retry
            .run(&hooks, || async {
                let mut con = self.connect().await?;
                let result = self.commit_with(&mut con, plan).await;
                release(con, result).await
            })
            .await
    }

    async fn commit_with(&self, con: &mut OutputConnection, plan: &TransactionPlan) -> Result<()> {
        let before = self.output.before_load.as_deref();
        let after = self.output.after_load.as_deref();
        let insert_schema = plan.insert_schema();

        match plan.mode {
            Mode::InsertDirect | Mode::MergeDirect => {
                if let Some(sql) = after {
                    con.execute_in_transaction(&[sql.to_string()]).await?;
                }
            }
            Mode::Insert | Mode::TruncateInsert => {
                con.collect_insert(
                    &plan.worker_tables(),
                    &insert_schema,
                    &plan.actual_table,
                    plan.mode.truncate_before_commit(),
                    before,
                    after,
                )
                .await?;
            }
            Mode::Merge => {
                let merge = plan
                    .merge
                    .as_ref()
                    .ok_or_else(|| LoadError::State("Merge plan has no merge keys".into()))?;
                con.collect_merge(
                    &plan.worker_tables(),
                    &insert_schema,
                    &plan.actual_table,
                    merge,
                    before,
                    after,
                )
                .await?;
            }
            Mode::Replace | Mode::ReplaceInplace => {
                let swap = plan
                    .swap_table
                    .as_ref()
                    .ok_or_else(|| LoadError::State("Replace plan has no swap table".into()))?;
                // A retried commit may find the swap already done.
                if !con.table_exists(swap).await? && con.table_exists(&plan.actual_table).await? {
                    info!("{} was already renamed to {}", swap, plan.actual_table);
                    if let Some(sql) = after {
                        con.execute_in_transaction(&[sql.to_string()]).await?;
                    }
                    return Ok(());
                }
                con.replace_table(swap, &plan.actual_table, after).await?;
            }
        }
        Ok(())
    }

    /// Drop the swap table and every worker table of `plan`. Dropping a table
    /// that is already gone is a no-op, so cleanup can run any number of times.
    pub async fn cleanup(&self, plan: &TransactionPlan) -> Result<()> {
        if plan.mode.is_direct_modify() {
            return Ok(());
        }
        let mut tables = plan.worker_tables();
        if let Some(swap) = &plan.swap_table {
            tables.push(swap.clone());
            tables.push(retired_table(swap));
        }
        if tables.is_empty() {
            return Ok(());
        }

        let hooks = self.hooks("Clean up intermediate tables");
        self.retry
            .run(&hooks, || async {
                let mut con = self.connect().await?;
                let result = async {
                    for table in &tables {
                        con.drop_table_if_exists(table).await?;
                    }
                    Ok(())
                }
                .await;
                release(con, result).await
            })
            .await
    }

    async fn connect(&self) -> Result<OutputConnection> {
        let connection = self.connector.connect().await?;
        Ok(OutputConnection::new(self.dialect().clone(), connection))
    }

    fn hooks<'a>(&'a self, description: &'a str) -> LoggingHooks<'a, impl Fn(&LoadError) -> bool + Sync + 'a> {
        let dialect = self.dialect();
        LoggingHooks::new(description, move |e: &LoadError| dialect.is_retryable(e))
    }

    fn setter_factory(&self) -> SetterFactory {
        SetterFactory::new(
            self.dialect().setter_overrides(),
            self.output.column_options.clone(),
            self.output.default_timestamp_format.clone(),
            self.output.default_timezone.clone(),
        )
    }

    fn create_options(&self) -> CreateTableOptions<'_> {
        CreateTableOptions {
            constraint: self.output.create_table_constraint.as_deref(),
            option: self.output.create_table_option.as_deref(),
        }
    }
}

/// Refuse to resume a plan whose mode loads directly or through a swap table.
pub fn check_resumable(plan: &TransactionPlan) -> Result<()> {
    if plan.mode.is_resumable() {
        return Ok(());
    }
    Err(LoadError::Config(format!(
        "{} mode is not resumable. You need to delete partially-loaded records from the database \
         and restart the entire transaction.",
        plan.mode
    )))
}

/// Checks that need no connection.
fn check_mode(features: &DialectFeatures, output: &OutputConfig, input: &InputSchema) -> Result<()> {
    if input.is_empty() {
        return Err(LoadError::Config("No column.".into()));
    }
    if !features.supported_modes.contains(&output.mode) {
        let supported: Vec<&str> = features.supported_modes.iter().map(|m| m.as_str()).collect();
        return Err(LoadError::Config(format!(
            "This output type doesn't support '{}'. Supported modes are: {}",
            output.mode,
            supported.join(", ")
        )));
    }
    if output.insert_method == InsertMethod::Copy && output.mode == Mode::MergeDirect {
        return Err(LoadError::Config(
            "insert_method 'copy' cannot be used with merge_direct mode".into(),
        ));
    }
    Ok(())
}

/// Resolve the merge keys against the matched target schema.
fn merge_config(
    features: &DialectFeatures,
    output: &OutputConfig,
    target: &TargetSchema,
) -> Result<MergeConfig> {
    let merge_keys = if features.ignore_merge_keys {
        if output.merge_keys.is_some() {
            return Err(LoadError::Config(
                "This output type does not accept 'merge_key' option.".into(),
            ));
        }
        Vec::new()
    } else if let Some(keys) = &output.merge_keys {
        if keys.is_empty() {
            return Err(LoadError::Config("Empty 'merge_keys' option is invalid.".into()));
        }
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            let column = target.find_column(key)?.ok_or_else(|| {
                LoadError::Config(format!("Merge key '{}' does not exist in the target table.", key))
            })?;
            resolved.push(column.name().to_string());
        }
        resolved
    } else {
        let keys = target.unique_key_names();
        if keys.is_empty() {
            return Err(LoadError::Config(
                "Merging mode is used but the target table does not have primary keys. \
                 Please set merge_keys option."
                    .into(),
            ));
        }
        keys
    };
    Ok(MergeConfig {
        merge_keys,
        merge_rule: output.merge_rule.clone(),
    })
}

/// The configured table if it exists, else its upper-case, else its
/// lower-case spelling. A table that exists in neither form keeps the
/// configured name.
async fn resolve_actual_table(
    con: &mut OutputConnection,
    configured: &TableIdentifier,
) -> Result<TableIdentifier> {
    if con.table_exists(configured).await? {
        return Ok(configured.clone());
    }
    let upper = configured.with_table(configured.table.to_uppercase());
    let lower = configured.with_table(configured.table.to_lowercase());
    let upper_exists = upper != *configured && con.table_exists(&upper).await?;
    let lower_exists = lower != *configured && con.table_exists(&lower).await?;

    match (upper_exists, lower_exists) {
        (true, true) => Err(LoadError::Config(format!(
            "Cannot specify table '{}' because both '{}' and '{}' exist.",
            configured.table, upper.table, lower.table
        ))),
        (true, false) => Ok(upper),
        (false, true) => Ok(lower),
        (false, false) => Ok(configured.clone()),
    }
}

async fn describe_created(con: &mut OutputConnection, table: &TableIdentifier) -> Result<TargetSchema> {
    con.describe_table(table)
        .await?
        .ok_or_else(|| LoadError::load(table.to_string(), "table not found after creation"))
}

/// Apply column `type` options to an introspected schema.
fn with_declared_types(
    mut schema: TargetSchema,
    input: &InputSchema,
    options: &BTreeMap<String, ColumnOption>,
) -> TargetSchema {
    for column in input.columns.iter() {
        let Some(declared) = column_option(options, &column.name).and_then(|o| o.type_name.clone())
        else {
            continue;
        };
        match schema.find_column(&column.name) {
            Ok(Some(found)) => {
                let name = found.name().to_string();
                if let Some(target) = schema.columns.iter_mut().find(|c| c.name() == name) {
                    target.declared_type = Some(declared);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Column type option for '{}' ignored: {}", column.name, e),
        }
    }
    schema
}

/// Close `con`, keeping `result` as the reported outcome.
async fn release<T>(con: OutputConnection, result: Result<T>) -> Result<T> {
    match (result, con.close().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(value), Err(e)) => {
            warn!("Failed to close metadata connection: {}", e);
            Ok(value)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => Err(e.with_suppressed(&close)),
    }
}
