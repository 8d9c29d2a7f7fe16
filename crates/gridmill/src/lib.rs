#![forbid(unsafe_code)]

//! Umbrella crate: one flat import surface over the `gm-*` workspace.
//!
//! ```
//! use gridmill::{
//!     CellValue, ColumnDescriptor, ColumnType, FilterSpec, GridEngine, NumberFilter,
//!     Row, SortSpec,
//! };
//!
//! # fn main() -> Result<(), gridmill::EngineError> {
//! let rows: Vec<Row> = (1_u64..=100)
//!     .map(|id| Row::from_pairs(id, [("age", CellValue::from(id as f64))]))
//!     .collect();
//!
//! let mut engine = GridEngine::new(vec![
//!     ColumnDescriptor::new("age", ColumnType::Number),
//! ])?;
//! engine.load_rows(rows)?;
//! engine.set_filter("age", Some(FilterSpec::Number(NumberFilter::GreaterThan(40.0))))?;
//! engine.set_sort(vec![SortSpec::descending("age")])?;
//! engine.set_viewport(600.0, 24.0);
//! let window = engine.window()?;
//! assert_eq!(window.rows.len(), 25);
//! # Ok(())
//! # }
//! ```

pub use gm_engine::{
    CancellationError, Command, EngineError, EngineStats, GridEngine, GroupSpec,
    PersistedState, RequestToken, STATE_VERSION, VersionError, Window, WindowObserver,
};
pub use gm_expr::{ConditionNode, GroupLogic};
pub use gm_filter::{FilterOutcome, FilterState, FilterWarnings};
pub use gm_groupby::{Aggregate, AggregateSpec, AggregateValue, GroupSummary};
pub use gm_index::{
    IndexOrder, SearchQuery, SelectionState, TreeNode, ValueIndex, ValueIndexCatalog,
    ValueIndexEntry, ValueTree,
};
pub use gm_predicate::{
    BoolFilter, ColumnStats, ConfigError, DateFilter, EvalError, FilterSpec, NumberFilter,
    SetSelection, TextFilter,
};
pub use gm_sort::{SortDirection, SortSpec};
pub use gm_types::{
    CellValue, ColumnDescriptor, ColumnType, Row, RowId, RowSet, RowSetError, TypeError,
};
pub use gm_window::{WindowPhase, WindowRange, compute_range};
