//! The transaction plan: everything `begin` decides, threaded unchanged into
//! every worker, `commit` and `cleanup`.

use serde::{Deserialize, Serialize};

use crate::core::identifier::{worker_table_name, TableIdentifier};
use crate::core::mode::Mode;
use crate::core::schema::{InputSchema, TargetSchema};
use crate::core::traits::MergeConfig;

/// Immutable result of `begin`. Serialized into the state file so that a
/// later process can open workers, commit, or clean up the same transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPlan {
    pub mode: Mode,

    /// The existing (or created) destination table, after case resolution.
    pub actual_table: TableIdentifier,

    pub input_schema: InputSchema,

    /// One target column per input column; unmatched input columns are skip columns.
    pub target_schema: TargetSchema,

    /// Staging table built in full and renamed over the target on commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_table: Option<TableIdentifier>,

    /// Name prefix of the per-worker load tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,

    #[serde(default)]
    pub suffix_width: usize,

    pub worker_count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeConfig>,
}

impl TransactionPlan {
    /// Columns bound into every statement.
    pub fn insert_schema(&self) -> TargetSchema {
        self.target_schema.insert_schema()
    }

    /// Table worker `worker_index` writes into.
    pub fn load_table(&self, worker_index: usize) -> TableIdentifier {
        if let Some(prefix) = &self.table_prefix {
            return self
                .actual_table
                .with_table(worker_table_name(prefix, worker_index, self.suffix_width));
        }
        match &self.swap_table {
            Some(swap) => swap.clone(),
            None => self.actual_table.clone(),
        }
    }

    /// Per-worker load tables, empty when the mode has none.
    pub fn worker_tables(&self) -> Vec<TableIdentifier> {
        if self.table_prefix.is_none() {
            return Vec::new();
        }
        (0..self.worker_count).map(|i| self.load_table(i)).collect()
    }
}
