#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use gm_expr::ConditionNode;
use gm_predicate::{ColumnStats, ConfigError, EvalEnv, EvalError, FilterSpec, eval_filter};
use gm_types::{ColumnDescriptor, Row, RowId, RowSet};
use serde::{Deserialize, Serialize};

/// The three filter layers, AND-composed: a row survives only if the
/// quick filter, every column filter, and the condition tree all accept
/// it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub quick_filter: Option<String>,
    pub column_filters: BTreeMap<String, FilterSpec>,
    pub condition_tree: Option<ConditionNode>,
}

impl FilterState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quick_filter.is_none()
            && self.column_filters.is_empty()
            && self.condition_tree.is_none()
    }

    /// Replace or clear one column's filter.
    pub fn set_column_filter(&mut self, column: impl Into<String>, spec: Option<FilterSpec>) {
        let column = column.into();
        match spec {
            Some(spec) => {
                self.column_filters.insert(column, spec);
            }
            None => {
                self.column_filters.remove(&column);
            }
        }
    }

    /// Config-level check of every layer against the column descriptors.
    /// Rejection here happens at mutation time, before any row is
    /// visited.
    pub fn validate(
        &self,
        columns: &BTreeMap<String, ColumnDescriptor>,
    ) -> Result<(), ConfigError> {
        for (key, spec) in &self.column_filters {
            let descriptor = columns
                .get(key)
                .ok_or_else(|| ConfigError::UnknownColumn { key: key.clone() })?;
            spec.validate(descriptor)?;
        }
        if let Some(tree) = &self.condition_tree {
            tree.validate(columns)?;
        }
        Ok(())
    }
}

/// Aggregated row-level failures from one filter pass. Individual rows
/// that fail to evaluate are treated as non-matching instead of
/// aborting the pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterWarnings {
    pub skipped_rows: usize,
    pub first_detail: Option<String>,
}

impl FilterWarnings {
    fn record(&mut self, row: RowId, error: &EvalError) {
        self.skipped_rows += 1;
        if self.first_detail.is_none() {
            self.first_detail = Some(format!("row {row}: {error}"));
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped_rows == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    /// Surviving rows, in source order.
    pub row_ids: Vec<RowId>,
    pub warnings: FilterWarnings,
}

/// Run one full filter pass over the row set.
///
/// The pass prepares everything the predicates need up front (compiled
/// regexes, column statistics over the unfiltered data, an anchored
/// "today"), orders the column filters cheapest first, then walks rows
/// in source order.
pub fn apply(
    rows: &RowSet,
    columns: &BTreeMap<String, ColumnDescriptor>,
    state: &FilterState,
    today: NaiveDate,
) -> Result<FilterOutcome, ConfigError> {
    state.validate(columns)?;

    let env = prepare_env(rows, state, today)?;

    let mut ordered: Vec<(&String, &FilterSpec)> = state.column_filters.iter().collect();
    ordered.sort_by_key(|(_, spec)| spec.cost());

    let tree = state
        .condition_tree
        .as_ref()
        .map(ConditionNode::ordered_cheapest_first);
    let quick = state
        .quick_filter
        .as_deref()
        .filter(|needle| !needle.is_empty())
        .map(str::to_lowercase);

    let mut outcome = FilterOutcome::default();
    for row in rows.rows() {
        match row_matches(row, quick.as_deref(), columns, &ordered, tree.as_ref(), &env) {
            Ok(true) => outcome.row_ids.push(row.id()),
            Ok(false) => {}
            Err(error) => outcome.warnings.record(row.id(), &error),
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        total = rows.len(),
        matched = outcome.row_ids.len(),
        skipped = outcome.warnings.skipped_rows,
        "filter pass complete"
    );

    Ok(outcome)
}

/// Compile every regex and compute statistics for every column a
/// statistical predicate targets. Statistics always describe the
/// unfiltered column, so a filter's own output cannot shift its
/// baseline.
fn prepare_env(
    rows: &RowSet,
    state: &FilterState,
    today: NaiveDate,
) -> Result<EvalEnv, ConfigError> {
    let mut patterns = BTreeSet::new();
    let mut stats_columns = BTreeSet::new();

    let mut visit = |column: &str, spec: &FilterSpec| {
        if let Some(pattern) = spec.regex_pattern() {
            patterns.insert(pattern.to_owned());
        }
        if spec.needs_stats() {
            stats_columns.insert(column.to_owned());
        }
    };
    for (column, spec) in &state.column_filters {
        visit(column, spec);
    }
    if let Some(tree) = &state.condition_tree {
        tree.for_each_leaf(&mut visit);
    }

    let mut env = EvalEnv::new(today);
    for pattern in &patterns {
        env.regexes_mut().ensure(pattern)?;
    }
    for column in stats_columns {
        let values = rows
            .rows()
            .iter()
            .filter_map(|row| row.cell(&column))
            .filter_map(|value| value.to_number().ok());
        if let Some(stats) = ColumnStats::compute(values) {
            env.insert_stats(column, stats);
        }
    }
    Ok(env)
}

fn row_matches(
    row: &Row,
    quick: Option<&str>,
    columns: &BTreeMap<String, ColumnDescriptor>,
    ordered: &[(&String, &FilterSpec)],
    tree: Option<&ConditionNode>,
    env: &EvalEnv,
) -> Result<bool, EvalError> {
    if let Some(needle) = quick
        && !quick_matches(row, needle, columns)
    {
        return Ok(false);
    }
    for (column, spec) in ordered {
        let cx = env.cx_for(column);
        if !eval_filter(spec, row.cell(column), &cx)? {
            return Ok(false);
        }
    }
    if let Some(tree) = tree
        && !gm_expr::evaluate(tree, row, env)?
    {
        return Ok(false);
    }
    Ok(true)
}

/// Case-insensitive substring match over the formatted value of every
/// registered column. Cells for unregistered columns never match.
fn quick_matches(row: &Row, needle: &str, columns: &BTreeMap<String, ColumnDescriptor>) -> bool {
    columns.keys().any(|key| {
        row.cell(key).is_some_and(|value| {
            !value.is_missing() && value.to_string().to_lowercase().contains(needle)
        })
    })
}
