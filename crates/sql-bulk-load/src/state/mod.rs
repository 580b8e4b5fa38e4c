//! File-based transaction state for resume and cleanup.
//!
//! The state file carries the [`TransactionPlan`] returned by `begin` plus the
//! progress of every worker, so that another process can finish (`resume`) or
//! abandon (`cleanup`) the same transaction.

use crate::error::{LoadError, Result};
use crate::loader::TransactionPlan;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Persisted state of one load transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the transaction began.
    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    pub plan: TransactionPlan,

    /// Per-worker progress keyed by worker index.
    #[serde(default)]
    pub workers: BTreeMap<usize, WorkerState>,

    /// When the transaction was committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized state (without this field), keyed by
    /// `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// `begin` done, workers loading.
    Loading,
    /// Every worker finished; commit pending.
    Loaded,
    Committed,
    Failed,
    Cancelled,
    /// Intermediate tables dropped.
    CleanedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadState {
    pub fn new(run_id: String, config_hash: String, plan: TransactionPlan) -> Self {
        let workers = (0..plan.worker_count)
            .map(|i| {
                (
                    i,
                    WorkerState {
                        status: WorkerStatus::Pending,
                        rows: 0,
                        error: None,
                    },
                )
            })
            .collect();
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Loading,
            plan,
            workers,
            completed_at: None,
            hmac: None, // Computed on save
        }
    }

    /// Uses config_hash as the key: a tampered file fails verification
    /// unless the configuration is known too.
    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| LoadError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| LoadError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load a state file and verify its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoadError::State(format!("Cannot read state file {}: {}", path.display(), e))
        })?;
        let state: Self = serde_json::from_str(&content)?;

        let Some(stored) = &state.hmac else {
            return Err(LoadError::State(
                "State file has no HMAC signature; integrity cannot be verified".into(),
            ));
        };
        if *stored != state.compute_hmac()? {
            return Err(LoadError::State(
                "State file integrity check failed: HMAC mismatch (possible tampering)".into(),
            ));
        }
        debug!("Loaded state of run {} from {}", state.run_id, path.display());
        Ok(state)
    }

    /// Sign and write the state (atomic write: temp file, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| LoadError::State(format!("Failed to serialize state: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Refuse to continue with a configuration other than the one that began the run.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(LoadError::ConfigChanged);
        }
        Ok(())
    }

    /// Workers that still have to (re)load their partition.
    pub fn pending_workers(&self) -> Vec<usize> {
        (0..self.plan.worker_count)
            .filter(|i| {
                self.workers
                    .get(i)
                    .map(|w| w.status != WorkerStatus::Completed)
                    .unwrap_or(true)
            })
            .collect()
    }

    pub fn mark_worker_completed(&mut self, worker_index: usize, rows: u64) {
        self.workers.insert(
            worker_index,
            WorkerState {
                status: WorkerStatus::Completed,
                rows,
                error: None,
            },
        );
    }

    pub fn mark_worker_failed(&mut self, worker_index: usize, error: &str) {
        let worker = self.workers.entry(worker_index).or_insert(WorkerState {
            status: WorkerStatus::Pending,
            rows: 0,
            error: None,
        });
        worker.status = WorkerStatus::Failed;
        worker.error = Some(error.to_string());
    }

    /// Rows loaded by completed workers.
    pub fn rows_loaded(&self) -> u64 {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Completed)
            .map(|w| w.rows)
            .sum()
    }

    pub fn mark_committed(&mut self) {
        self.status = RunStatus::Committed;
        self.completed_at = Some(Utc::now());
    }
}
