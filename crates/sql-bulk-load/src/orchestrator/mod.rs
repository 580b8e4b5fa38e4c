//! Load orchestrator - the host side of the transaction lifecycle.
//!
//! Reads the JSON Lines input, deals records round-robin to one tokio task per
//! worker, and drives begin, commit and cleanup on the [`BulkLoader`]. The
//! transaction plan and per-worker progress go to the state file after every
//! phase, so an interrupted run can be resumed or cleaned up later.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::mode::Mode;
use crate::core::traits::{Dialect, DriverConnection};
use crate::core::value::Record;
use crate::drivers::{connector_for, Connector};
use crate::error::{LoadError, Result};
use crate::loader::{check_resumable, BulkLoader, TransactionPlan, WorkerReport};
use crate::source::JsonLinesSource;
use crate::state::{LoadState, RunStatus};

/// Pages buffered per worker before the reader waits.
const WORKER_CHANNEL_CAPACITY: usize = 4;

/// Records between two progress log lines.
const PROGRESS_INTERVAL: u64 = 100_000;

/// Load orchestrator.
pub struct Orchestrator {
    config: Config,
    connector: Arc<dyn Connector>,
    source: JsonLinesSource,
    state_file: Option<PathBuf>,
}

/// Result of a load run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    pub mode: String,

    /// Destination table after case resolution.
    pub table: String,

    pub workers: usize,

    /// Rows written by all workers (including workers finished before a resume).
    pub rows_loaded: u64,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl LoadResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What a run of a configuration would do, derived without connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadPreview {
    pub driver: String,
    pub table: String,
    pub mode: String,
    pub workers: usize,
    pub page_size: usize,
    pub batch_size: u64,
    /// Where workers write their rows.
    pub load_tables: String,
    /// What commit does with them.
    pub commit: String,
    pub resumable: bool,
    pub retry_limit: u32,
}

impl LoadPreview {
    pub fn from_config(config: &Config) -> Self {
        let mode = config.output.mode;
        let workers = config.input.get_workers();
        let table = match &config.connection.schema {
            Some(schema) => format!("{}.{}", schema, config.output.table),
            None => config.output.table.clone(),
        };

        let load_tables = if mode.is_direct_modify() {
            "target table".to_string()
        } else if mode.commit_by_swap_table() {
            "one swap table shared by all workers".to_string()
        } else {
            format!("{} intermediate table(s), one per worker", workers)
        };
        let commit = match mode {
            Mode::Insert => "INSERT ... SELECT into the target",
            Mode::TruncateInsert => "delete target rows, then INSERT ... SELECT",
            Mode::Merge => "merge into the target by merge keys",
            Mode::Replace | Mode::ReplaceInplace => "drop the target and rename the swap table",
            Mode::InsertDirect | Mode::MergeDirect => "nothing to move; after_load only",
        };

        Self {
            driver: config.connection.driver.to_string(),
            table,
            mode: mode.to_string(),
            workers,
            page_size: config.input.get_page_size(),
            batch_size: config.output.batch_size,
            load_tables,
            commit: commit.to_string(),
            resumable: mode.is_resumable(),
            retry_limit: config.output.retry_limit,
        }
    }
}

/// Result of a destination connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub dialect: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub table_exists: bool,
}

impl Orchestrator {
    /// Connect to the destination described by `config`.
    pub async fn new(config: Config) -> Result<Self> {
        // One connection per worker plus the metadata connection.
        let connector = connector_for(&config.connection, config.input.get_workers() + 1).await?;
        Ok(Self::with_connector(config, connector))
    }

    /// Use an existing connector.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let source = JsonLinesSource::from_config(&config.input);
        Self {
            config,
            connector,
            source,
            state_file: None,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Run a new load transaction.
    pub async fn run(&self, cancel: CancellationToken) -> Result<LoadResult> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting load run: {}", run_id);

        let loader = self.loader(Some(&cancel));
        let workers = self.config.input.get_workers();

        info!("Phase 1: Preparing {} (mode: {})", self.config.output.table, self.config.output.mode);
        let plan = loader.begin(self.source.schema(), workers).await?;

        let mut state = LoadState::new(run_id, self.config.hash(), plan.clone());
        if let Err(e) = self.save_state(&mut state) {
            return Err(self.abandon(&loader, &plan, e).await);
        }

        let pending: Vec<usize> = (0..plan.worker_count).collect();
        self.complete(&loader, &plan, &mut state, &pending, &cancel, started)
            .await
    }

    /// Finish the transaction recorded in the state file: reload the
    /// partitions of unfinished workers, then commit and clean up.
    pub async fn resume(&self, cancel: CancellationToken) -> Result<LoadResult> {
        let started = Instant::now();
        let mut state = self.load_state()?;
        check_resumable(&state.plan)?;
        info!("Resuming load run: {}", state.run_id);

        let loader = self.loader(Some(&cancel));
        let plan = state.plan.clone();

        if state.status == RunStatus::Committed {
            info!("Run {} is already committed; cleaning up", state.run_id);
            loader.cleanup(&plan).await?;
            state.status = RunStatus::CleanedUp;
            self.save_state(&mut state)?;
            return Ok(self.result(&state, started));
        }

        let pending = state.pending_workers();
        info!(
            "{} of {} workers left to load",
            pending.len(),
            plan.worker_count
        );
        self.complete(&loader, &plan, &mut state, &pending, &cancel, started)
            .await
    }

    /// Drop the intermediate tables of the transaction in the state file.
    pub async fn cleanup(&self) -> Result<()> {
        let mut state = self.load_state()?;
        info!("Cleaning up load run: {}", state.run_id);
        self.loader(None).cleanup(&state.plan).await?;
        state.status = RunStatus::CleanedUp;
        self.save_state(&mut state)
    }

    /// Open one connection, run a trivial statement and look up the output table.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let loader = self.loader(None);
        let dialect = self.connector.dialect().name().to_string();
        let started = Instant::now();

        let check = async {
            let mut con = self.connector.connect().await?;
            let result = async {
                con.execute("SELECT 1").await?;
                con.table_exists(&loader.configured_table()).await
            }
            .await;
            let closed = con.close().await;
            let exists = result?;
            closed?;
            Ok::<bool, LoadError>(exists)
        };

        let result = match check.await {
            Ok(table_exists) => HealthCheckResult {
                dialect,
                connected: true,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
                table_exists,
            },
            Err(e) => {
                warn!("Health check failed: {}", e);
                HealthCheckResult {
                    dialect,
                    connected: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    table_exists: false,
                }
            }
        };
        Ok(result)
    }

    /// Load `pending` workers, commit, and clean up.
    async fn complete(
        &self,
        loader: &Arc<BulkLoader>,
        plan: &TransactionPlan,
        state: &mut LoadState,
        pending: &[usize],
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<LoadResult> {
        info!("Phase 2: Loading with {} workers", pending.len());
        let loaded = self
            .load_workers(loader, plan, state, pending, cancel)
            .await;
        self.save_state_or_warn(state);
        if let Err(e) = loaded {
            state.status = if e.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            self.save_state_or_warn(state);
            return Err(self.abandon(loader, plan, e).await);
        }

        state.status = RunStatus::Loaded;
        self.save_state(state)?;

        info!("Phase 3: Committing into {}", plan.actual_table);
        if let Err(e) = loader.commit(plan).await {
            state.status = RunStatus::Failed;
            self.save_state_or_warn(state);
            return Err(self.abandon(loader, plan, e).await);
        }
        state.mark_committed();
        self.save_state(state)?;

        info!("Phase 4: Cleaning up");
        loader.cleanup(plan).await?;
        state.status = RunStatus::CleanedUp;
        self.save_state(state)?;

        let result = self.result(state, started);
        info!(
            "Load {}: {} rows into {} in {:.1}s ({} rows/s)",
            result.status,
            result.rows_loaded,
            result.table,
            result.duration_seconds,
            result.rows_per_second
        );
        Ok(result)
    }

    /// Clean up after a failure, keeping per-worker tables when the run can
    /// still be resumed from the state file.
    async fn abandon(&self, loader: &BulkLoader, plan: &TransactionPlan, err: LoadError) -> LoadError {
        if self.state_file.is_some() && plan.mode.is_resumable() {
            info!("Keeping load tables for resume; run `cleanup` to discard them");
            return err;
        }
        match loader.cleanup(plan).await {
            Ok(()) => err,
            Err(cleanup) => {
                warn!("Cleanup after failure also failed: {}", cleanup);
                err.with_suppressed(&cleanup)
            }
        }
    }

    /// Stream the input to the `pending` workers. Record `n` belongs to worker
    /// `n % worker_count`, so a resumed run deals the same partitions.
    async fn load_workers(
        &self,
        loader: &Arc<BulkLoader>,
        plan: &TransactionPlan,
        state: &mut LoadState,
        pending: &[usize],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let abort = cancel.child_token();
        let page_size = self.config.input.get_page_size().max(1);

        let mut senders: Vec<Option<mpsc::Sender<Vec<Record>>>> = vec![None; plan.worker_count];
        let mut handles: Vec<(usize, JoinHandle<Result<WorkerReport>>)> = Vec::new();
        for &worker_index in pending {
            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            senders[worker_index] = Some(tx);
            handles.push((
                worker_index,
                tokio::spawn(run_worker(
                    loader.clone(),
                    plan.clone(),
                    worker_index,
                    rx,
                    abort.clone(),
                )),
            ));
        }

        // Workers only finish on a closed channel once every record was dealt;
        // on any early stop they are cancelled first so they stay pending.
        let dispatched = self.dispatch(plan, &senders, page_size, &abort).await;
        if !matches!(dispatched, Ok(Dispatch::Complete)) {
            abort.cancel();
        }
        drop(senders);

        let mut first_error: Option<LoadError> = None;
        for (worker_index, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(LoadError::load(
                    plan.load_table(worker_index).to_string(),
                    format!("worker task failed: {}", e),
                ))
            });
            match outcome {
                Ok(report) => state.mark_worker_completed(worker_index, report.rows),
                Err(e) => {
                    if !e.is_cancelled() {
                        error!("Worker {} failed: {}", worker_index, e);
                    }
                    state.mark_worker_failed(worker_index, &e.to_string());
                    // A worker's own failure explains the cancellation of the others.
                    if first_error.as_ref().map_or(true, |f| f.is_cancelled() && !e.is_cancelled()) {
                        first_error = Some(e);
                    }
                }
            }
        }

        match (dispatched?, first_error) {
            (_, Some(e)) => Err(e),
            (Dispatch::Complete, None) => Ok(()),
            (Dispatch::WorkerStopped(worker_index), None) => Err(LoadError::load(
                plan.load_table(worker_index).to_string(),
                "worker stopped before receiving all of its records",
            )),
        }
    }

    /// Read every record and send it, in pages, to the worker that owns it.
    async fn dispatch(
        &self,
        plan: &TransactionPlan,
        senders: &[Option<mpsc::Sender<Vec<Record>>>],
        page_size: usize,
        abort: &CancellationToken,
    ) -> Result<Dispatch> {
        let mut reader = self.source.open().await?;
        let mut pages: Vec<Vec<Record>> = vec![Vec::new(); plan.worker_count];
        let mut count: u64 = 0;

        while let Some(record) = reader.next_record().await? {
            if abort.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let worker_index = (count % plan.worker_count as u64) as usize;
            count += 1;
            if count % PROGRESS_INTERVAL == 0 {
                info!("Read {} records", count);
            }

            let Some(tx) = &senders[worker_index] else {
                continue;
            };
            let page = &mut pages[worker_index];
            page.push(record);
            if page.len() >= page_size {
                let full = std::mem::take(page);
                if tx.send(full).await.is_err() {
                    // The worker stopped; its error is collected on join.
                    debug!("Worker {} is gone, stopping input", worker_index);
                    return Ok(Dispatch::WorkerStopped(worker_index));
                }
            }
        }

        for (worker_index, page) in pages.into_iter().enumerate() {
            if page.is_empty() {
                continue;
            }
            if let Some(tx) = &senders[worker_index] {
                if tx.send(page).await.is_err() {
                    debug!("Worker {} is gone, stopping input", worker_index);
                    return Ok(Dispatch::WorkerStopped(worker_index));
                }
            }
        }
        info!("Read {} records in total", count);
        Ok(Dispatch::Complete)
    }

    fn loader(&self, cancel: Option<&CancellationToken>) -> Arc<BulkLoader> {
        let loader = BulkLoader::new(
            self.connector.clone(),
            self.config.output.clone(),
            self.config.connection.schema.clone(),
        );
        Arc::new(match cancel {
            Some(token) => loader.with_cancellation(token.clone()),
            None => loader,
        })
    }

    fn load_state(&self) -> Result<LoadState> {
        let path = self
            .state_file
            .as_ref()
            .ok_or_else(|| LoadError::State("No state file given".into()))?;
        let state = LoadState::load(path)?;
        state.validate_config(&self.config.hash())?;
        Ok(state)
    }

    fn save_state(&self, state: &mut LoadState) -> Result<()> {
        match &self.state_file {
            Some(path) => state.save(path),
            None => Ok(()),
        }
    }

    /// Record `state` on a path that is already failing; the original error wins.
    fn save_state_or_warn(&self, state: &mut LoadState) {
        if let Err(e) = self.save_state(state) {
            warn!("Failed to save state: {}", e);
        }
    }

    fn result(&self, state: &LoadState, started: Instant) -> LoadResult {
        let duration = started.elapsed().as_secs_f64();
        let rows_loaded = state.rows_loaded();
        let rows_per_second = if duration > 0.0 {
            (rows_loaded as f64 / duration) as u64
        } else {
            0
        };
        let status = match state.status {
            RunStatus::CleanedUp | RunStatus::Committed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Loading | RunStatus::Loaded => "incomplete",
        };
        LoadResult {
            run_id: state.run_id.clone(),
            status: status.to_string(),
            mode: state.plan.mode.to_string(),
            table: state.plan.actual_table.to_string(),
            workers: state.plan.worker_count,
            rows_loaded,
            duration_seconds: duration,
            rows_per_second,
            started_at: state.started_at,
            completed_at: Utc::now(),
        }
    }
}

/// How far the input got before the senders were dropped.
enum Dispatch {
    /// Every record was sent to its worker.
    Complete,
    /// This worker hung up before the input ended.
    WorkerStopped(usize),
}

/// One worker task: open, add every page received, finish. A closed
/// channel only means end of input while `abort` is not cancelled.
async fn run_worker(
    loader: Arc<BulkLoader>,
    plan: TransactionPlan,
    worker_index: usize,
    mut pages: mpsc::Receiver<Vec<Record>>,
    abort: CancellationToken,
) -> Result<WorkerReport> {
    let mut worker = loader.open(&plan, worker_index).await?;
    loop {
        let page = tokio::select! {
            _ = abort.cancelled() => {
                worker.abort().await;
                return Err(LoadError::Cancelled);
            }
            page = pages.recv() => page,
        };
        let Some(page) = page else {
            break;
        };
        if let Err(e) = worker.add_page(&page).await {
            worker.abort().await;
            return Err(e);
        }
    }
    if abort.is_cancelled() {
        worker.abort().await;
        return Err(LoadError::Cancelled);
    }
    worker.finish().await
}
