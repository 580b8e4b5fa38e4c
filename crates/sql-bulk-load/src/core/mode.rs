//! Load modes and the table topology each one implies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Consistency strategy for one load transaction.
///
/// | mode             | load table            | commit                          |
/// |------------------|-----------------------|---------------------------------|
/// | insert           | per-worker tables     | INSERT ... SELECT into target   |
/// | insert_direct    | target                | none                            |
/// | truncate_insert  | per-worker tables     | DELETE target, then INSERT      |
/// | merge            | per-worker tables     | MERGE / upsert into target      |
/// | merge_direct     | target (upsert)       | none                            |
/// | replace          | swap table (new DDL)  | drop target, rename swap table  |
/// | replace_inplace  | swap table (same DDL) | drop target, rename swap table  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Insert,
    InsertDirect,
    TruncateInsert,
    Merge,
    MergeDirect,
    Replace,
    ReplaceInplace,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Insert,
        Mode::InsertDirect,
        Mode::TruncateInsert,
        Mode::Merge,
        Mode::MergeDirect,
        Mode::Replace,
        Mode::ReplaceInplace,
    ];

    /// Rows go straight into the target; there is nothing to commit.
    pub fn is_direct_modify(self) -> bool {
        matches!(self, Mode::InsertDirect | Mode::MergeDirect)
    }

    pub fn is_merge(self) -> bool {
        matches!(self, Mode::Merge | Mode::MergeDirect)
    }

    /// Every worker loads into its own intermediate table.
    pub fn temp_table_per_task(self) -> bool {
        matches!(self, Mode::Insert | Mode::TruncateInsert | Mode::Merge)
    }

    pub fn truncate_before_commit(self) -> bool {
        self == Mode::TruncateInsert
    }

    /// The swap table is created from the input schema rather than the
    /// existing target's definition.
    pub fn ignore_target_table_schema(self) -> bool {
        self == Mode::Replace
    }

    pub fn commit_by_swap_table(self) -> bool {
        matches!(self, Mode::Replace | Mode::ReplaceInplace)
    }

    /// Only per-worker table modes leave enough behind to continue after a crash.
    pub fn is_resumable(self) -> bool {
        self.temp_table_per_task()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Insert => "insert",
            Mode::InsertDirect => "insert_direct",
            Mode::TruncateInsert => "truncate_insert",
            Mode::Merge => "merge",
            Mode::MergeDirect => "merge_direct",
            Mode::Replace => "replace",
            Mode::ReplaceInplace => "replace_inplace",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
