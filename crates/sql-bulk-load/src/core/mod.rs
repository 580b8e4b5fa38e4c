//! Core abstractions of the bulk-load engine.
//!
//! - [`identifier`]: table identifiers, quoting, intermediate table naming
//! - [`mode`]: load modes and their table topology
//! - [`schema`]: input and target column metadata
//! - [`value`]: input values and driver bind values
//! - [`traits`]: the dialect strategy and the driver connection seam

pub mod identifier;
pub mod mode;
pub mod schema;
pub mod traits;
pub mod value;

pub use identifier::{LengthSemantics, TableIdentifier};
pub use mode::Mode;
pub use schema::{InputColumn, InputSchema, InputType, SqlType, TargetColumn, TargetSchema};
pub use traits::{ColumnDeclareType, Dialect, DialectFeatures, DriverConnection, MergeConfig};
pub use value::{BindValue, Record, Value};
