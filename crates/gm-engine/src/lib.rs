#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{Local, NaiveDate};
use gm_expr::ConditionNode;
use gm_filter::{FilterState, FilterWarnings};
use gm_groupby::{AggregateSpec, GroupSummary};
use gm_index::{IndexOrder, SearchQuery, ValueIndex, ValueIndexCatalog};
use gm_predicate::{ConfigError, FilterSpec, RegexCache};
use gm_sort::{SortSpec, sort_row_ids};
use gm_types::{ColumnDescriptor, Row, RowId, RowSet, RowSetError};
use gm_window::WindowManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted-state format this build reads and writes.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
    #[error(transparent)]
    RowSet(#[from] RowSetError),
    #[error("persisted state could not be encoded or decoded: {0}")]
    Persist(#[from] serde_json::Error),
    #[error("duplicate column key {key:?}")]
    DuplicateColumn { key: String },
}

/// Unsupported persisted-state version. No migration is guessed at:
/// the caller decides what to do with a newer or unknown format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("persisted state version {found} is not supported (this build reads version {supported})")]
pub struct VersionError {
    pub found: u32,
    pub supported: u32,
}

/// A request token was superseded before its result was admitted.
/// Last-writer-wins by generation counter, never by timestamp.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request {issued} was superseded by request {latest}")]
pub struct CancellationError {
    pub issued: u64,
    pub latest: u64,
}

/// Opaque handle for an offloadable pass. Only the most recently
/// issued token per slot is still admissible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken {
    generation: u64,
}

#[derive(Debug, Default)]
struct RequestSlot {
    latest: u64,
}

impl RequestSlot {
    fn issue(&mut self) -> RequestToken {
        self.latest += 1;
        RequestToken {
            generation: self.latest,
        }
    }

    fn admit(&self, token: RequestToken) -> Result<(), CancellationError> {
        if token.generation == self.latest {
            Ok(())
        } else {
            Err(CancellationError {
                issued: token.generation,
                latest: self.latest,
            })
        }
    }
}

/// Grouping configuration: the key column plus the aggregates shown on
/// each group header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub key: String,
    pub aggregates: Vec<AggregateSpec>,
}

impl GroupSpec {
    #[must_use]
    pub fn new(key: impl Into<String>, aggregates: Vec<AggregateSpec>) -> Self {
        Self {
            key: key.into(),
            aggregates,
        }
    }
}

/// Materialized slice of the presented order, handed to rendering.
/// Ephemeral: recomputed wholesale on every scroll, filter or sort
/// event rather than patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Window {
    pub start_index: usize,
    pub end_index: usize,
    pub rows: Vec<Row>,
}

impl Window {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Mutation requested by a window observer during a refresh. Applied
/// after the refresh completes, so the observer always sees a window
/// that predates its own commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetQuickFilter(Option<String>),
    SetColumnFilter {
        column: String,
        spec: Option<FilterSpec>,
    },
    SetSort(Vec<SortSpec>),
    ScrollTo(f64),
    ClearFilters,
}

pub type WindowObserver = Box<dyn FnMut(&Window, &mut Vec<Command>)>;

/// Durable filter / sort / group configuration. Row data, scroll
/// position and caches are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub column_filters: BTreeMap<String, FilterSpec>,
    pub quick_filter: Option<String>,
    pub condition_tree: Option<ConditionNode>,
    pub sort: Vec<SortSpec>,
    pub group: Option<GroupSpec>,
}

/// Recompute counters, one per staged cache. Diagnostic surface: lets
/// callers (and the engine's own tests) confirm that a mutation only
/// invalidated the stages downstream of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub filter_passes: u64,
    pub sort_passes: u64,
    pub summary_passes: u64,
}

#[derive(Debug)]
struct FilteredCache {
    row_ids: Vec<RowId>,
    warnings: FilterWarnings,
    data_generation: u64,
    filter_generation: u64,
}

#[derive(Debug)]
struct SortedCache {
    row_ids: Vec<RowId>,
    data_generation: u64,
    filter_generation: u64,
    sort_generation: u64,
    group_generation: u64,
}

#[derive(Debug)]
struct SummariesCache {
    summaries: Vec<GroupSummary>,
    data_generation: u64,
    filter_generation: u64,
    group_generation: u64,
}

/// The facade. Owns every piece of state; single-threaded and
/// synchronous, every public operation completes before returning.
///
/// Derived results live in staged caches (filtered ids, sorted ids,
/// group summaries, window), each stamped with the generations of its
/// inputs. Mutators only bump generations; accessors recompute exactly
/// the stale stages, wholesale.
pub struct GridEngine {
    columns: BTreeMap<String, ColumnDescriptor>,
    rows: RowSet,
    filter_state: FilterState,
    sort: Vec<SortSpec>,
    group: Option<GroupSpec>,

    scroll_offset: f64,
    viewport_height: f64,
    row_height: f64,
    today_override: Option<NaiveDate>,

    op_generation: u64,
    data_generation: u64,
    filter_generation: u64,
    sort_generation: u64,
    group_generation: u64,

    filtered: Option<FilteredCache>,
    sorted: Option<SortedCache>,
    summaries: Option<SummariesCache>,
    window_manager: WindowManager,
    index_catalog: ValueIndexCatalog,
    search_slot: RequestSlot,
    search_regexes: RegexCache,
    observer: Option<WindowObserver>,
    stats: EngineStats,
}

impl GridEngine {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Result<Self, EngineError> {
        let mut keyed = BTreeMap::new();
        for descriptor in columns {
            let key = descriptor.key.clone();
            if keyed.insert(key.clone(), descriptor).is_some() {
                return Err(EngineError::DuplicateColumn { key });
            }
        }
        Ok(Self {
            columns: keyed,
            rows: RowSet::empty(),
            filter_state: FilterState::default(),
            sort: Vec::new(),
            group: None,
            scroll_offset: 0.0,
            viewport_height: 0.0,
            row_height: 0.0,
            today_override: None,
            op_generation: 0,
            data_generation: 0,
            filter_generation: 0,
            sort_generation: 0,
            group_generation: 0,
            filtered: None,
            sorted: None,
            summaries: None,
            window_manager: WindowManager::new(),
            index_catalog: ValueIndexCatalog::new(IndexOrder::CountDescending),
            search_slot: RequestSlot::default(),
            search_regexes: RegexCache::new(),
            observer: None,
            stats: EngineStats::default(),
        })
    }

    // --- mutators -------------------------------------------------------

    /// Replace the column descriptors. The active filter configuration
    /// must still validate against the new descriptors; clear the
    /// offending filters first otherwise.
    pub fn set_columns(&mut self, columns: Vec<ColumnDescriptor>) -> Result<u64, EngineError> {
        let mut keyed = BTreeMap::new();
        for descriptor in columns {
            let key = descriptor.key.clone();
            if keyed.insert(key.clone(), descriptor).is_some() {
                return Err(EngineError::DuplicateColumn { key });
            }
        }
        self.filter_state.validate(&keyed)?;
        self.validate_sort_and_group(&keyed)?;
        self.columns = keyed;
        self.data_generation += 1;
        self.index_catalog.invalidate_all(self.data_generation);
        Ok(self.bump())
    }

    /// Replace the row set wholesale. Caches and value indexes are
    /// invalidated, not patched.
    pub fn load_rows(&mut self, rows: Vec<Row>) -> Result<u64, EngineError> {
        self.rows = RowSet::new(rows)?;
        self.data_generation += 1;
        self.index_catalog.invalidate_all(self.data_generation);
        Ok(self.bump())
    }

    /// Set or clear one column's filter. The spec is checked against
    /// the column's declared type here, before any row is touched.
    pub fn set_filter(
        &mut self,
        column: &str,
        spec: Option<FilterSpec>,
    ) -> Result<u64, EngineError> {
        if let Some(spec) = &spec {
            let descriptor = self
                .columns
                .get(column)
                .ok_or_else(|| ConfigError::UnknownColumn {
                    key: column.to_owned(),
                })?;
            spec.validate(descriptor)?;
        }
        self.filter_state.set_column_filter(column, spec);
        self.filter_generation += 1;
        Ok(self.bump())
    }

    pub fn set_quick_filter(&mut self, needle: Option<String>) -> u64 {
        self.filter_state.quick_filter = needle;
        self.filter_generation += 1;
        self.bump()
    }

    pub fn set_condition_tree(
        &mut self,
        tree: Option<ConditionNode>,
    ) -> Result<u64, EngineError> {
        if let Some(tree) = &tree {
            tree.validate(&self.columns)?;
        }
        self.filter_state.condition_tree = tree;
        self.filter_generation += 1;
        Ok(self.bump())
    }

    pub fn clear_filters(&mut self) -> u64 {
        self.filter_state = FilterState::default();
        self.filter_generation += 1;
        self.bump()
    }

    pub fn set_sort(&mut self, sort: Vec<SortSpec>) -> Result<u64, EngineError> {
        for spec in &sort {
            self.require_column(&spec.column)?;
        }
        self.sort = sort;
        self.sort_generation += 1;
        Ok(self.bump())
    }

    pub fn set_group_by(&mut self, group: Option<GroupSpec>) -> Result<u64, EngineError> {
        if let Some(group) = &group {
            self.require_column(&group.key)?;
            for aggregate in &group.aggregates {
                self.require_column(&aggregate.column)?;
            }
        }
        self.group = group;
        self.group_generation += 1;
        // The group key is forced into sort priority 0, so the
        // presented order moves with it.
        self.sort_generation += 1;
        Ok(self.bump())
    }

    pub fn scroll_to(&mut self, offset: f64) -> u64 {
        self.scroll_offset = offset;
        self.bump()
    }

    pub fn set_viewport(&mut self, viewport_height: f64, row_height: f64) -> u64 {
        self.viewport_height = viewport_height;
        self.row_height = row_height;
        self.bump()
    }

    /// Pin "today" for relative date predicates. Without an override,
    /// each filter pass anchors to the wall clock once.
    pub fn set_today(&mut self, today: NaiveDate) -> u64 {
        self.today_override = Some(today);
        self.filter_generation += 1;
        self.bump()
    }

    pub fn set_window_observer(&mut self, observer: WindowObserver) {
        self.observer = Some(observer);
    }

    // --- accessors ------------------------------------------------------

    /// Post-filter row count (what the grid reports as its total).
    pub fn total_row_count(&mut self) -> Result<usize, EngineError> {
        self.ensure_filtered()?;
        Ok(self.filtered.as_ref().map_or(0, |c| c.row_ids.len()))
    }

    /// Aggregated row-level failures from the latest filter pass.
    pub fn warnings(&mut self) -> Result<FilterWarnings, EngineError> {
        self.ensure_filtered()?;
        Ok(self
            .filtered
            .as_ref()
            .map(|c| c.warnings.clone())
            .unwrap_or_default())
    }

    /// Group header summaries, in presented (group-key) order. Empty
    /// when no grouping is active.
    pub fn group_summaries(&mut self) -> Result<&[GroupSummary], EngineError> {
        self.ensure_summaries()?;
        Ok(self.summaries.as_ref().map_or(&[], |c| &c.summaries))
    }

    /// Materialize the visible window for the current scroll and
    /// viewport metrics, then notify the observer and drain any
    /// commands it queued.
    pub fn window(&mut self) -> Result<Window, EngineError> {
        self.ensure_sorted()?;
        let total = self.sorted.as_ref().map_or(0, |c| c.row_ids.len());
        let range = self.window_manager.ensure(
            self.op_generation,
            self.scroll_offset,
            self.viewport_height,
            self.row_height,
            total,
        );

        let window = match (range, self.sorted.as_ref()) {
            (Some(range), Some(sorted)) => {
                let rows = sorted.row_ids[range.start_index..=range.end_index]
                    .iter()
                    .filter_map(|id| self.rows.get(*id))
                    .cloned()
                    .collect();
                Window {
                    start_index: range.start_index,
                    end_index: range.end_index,
                    rows,
                }
            }
            _ => Window::default(),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            start = window.start_index,
            end = window.end_index,
            rows = window.rows.len(),
            "window refreshed"
        );

        self.notify_and_drain(&window)?;
        Ok(window)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, ColumnDescriptor> {
        &self.columns
    }

    #[must_use]
    pub fn filter_state(&self) -> &FilterState {
        &self.filter_state
    }

    // --- value index ----------------------------------------------------

    /// Distinct-value catalog for one column (set-filter popup), built
    /// lazily and rebuilt only when the data generation moved on.
    pub fn value_index(&mut self, column: &str) -> Result<&ValueIndex, EngineError> {
        self.require_column(column)?;
        Ok(self.index_catalog.index_for(column, &self.rows))
    }

    /// Issue a token for a value-index search. A newer issue supersedes
    /// every outstanding token.
    pub fn begin_index_search(&mut self) -> RequestToken {
        self.search_slot.issue()
    }

    /// Run a value-index search under `token`. Superseded tokens are
    /// rejected before any work happens.
    pub fn run_index_search(
        &mut self,
        token: RequestToken,
        column: &str,
        query: &SearchQuery,
    ) -> Result<Vec<usize>, EngineError> {
        self.search_slot.admit(token)?;
        self.require_column(column)?;
        let index = self.index_catalog.index_for(column, &self.rows);
        Ok(index.search(query, &mut self.search_regexes)?)
    }

    // --- persistence ----------------------------------------------------

    #[must_use]
    pub fn export_state(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            column_filters: self.filter_state.column_filters.clone(),
            quick_filter: self.filter_state.quick_filter.clone(),
            condition_tree: self.filter_state.condition_tree.clone(),
            sort: self.sort.clone(),
            group: self.group.clone(),
        }
    }

    pub fn export_state_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(&self.export_state())?)
    }

    /// Restore a persisted configuration. All-or-nothing: the state is
    /// validated in full before any of it is applied.
    pub fn import_state(&mut self, state: PersistedState) -> Result<u64, EngineError> {
        if state.version != STATE_VERSION {
            return Err(VersionError {
                found: state.version,
                supported: STATE_VERSION,
            }
            .into());
        }
        let candidate = FilterState {
            quick_filter: state.quick_filter,
            column_filters: state.column_filters,
            condition_tree: state.condition_tree,
        };
        candidate.validate(&self.columns)?;
        for spec in &state.sort {
            self.require_column(&spec.column)?;
        }
        if let Some(group) = &state.group {
            self.require_column(&group.key)?;
            for aggregate in &group.aggregates {
                self.require_column(&aggregate.column)?;
            }
        }

        self.filter_state = candidate;
        self.sort = state.sort;
        self.group = state.group;
        self.filter_generation += 1;
        self.sort_generation += 1;
        self.group_generation += 1;
        Ok(self.bump())
    }

    pub fn import_state_json(&mut self, json: &str) -> Result<u64, EngineError> {
        let state: PersistedState = serde_json::from_str(json)?;
        self.import_state(state)
    }

    // --- internals ------------------------------------------------------

    fn bump(&mut self) -> u64 {
        self.op_generation += 1;
        self.window_manager.invalidate();
        self.op_generation
    }

    fn require_column(&self, key: &str) -> Result<&ColumnDescriptor, EngineError> {
        self.columns
            .get(key)
            .ok_or_else(|| ConfigError::UnknownColumn { key: key.to_owned() }.into())
    }

    fn validate_sort_and_group(
        &self,
        columns: &BTreeMap<String, ColumnDescriptor>,
    ) -> Result<(), EngineError> {
        for spec in &self.sort {
            if !columns.contains_key(&spec.column) {
                return Err(ConfigError::UnknownColumn {
                    key: spec.column.clone(),
                }
                .into());
            }
        }
        if let Some(group) = &self.group
            && !columns.contains_key(&group.key)
        {
            return Err(ConfigError::UnknownColumn {
                key: group.key.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Effective sort: the group key, when set, is forced into
    /// priority 0 (keeping a user-chosen direction for it), followed by
    /// the remaining user keys.
    fn effective_sort(&self) -> Vec<SortSpec> {
        match &self.group {
            None => self.sort.clone(),
            Some(group) => {
                let mut specs = Vec::with_capacity(self.sort.len() + 1);
                let key_spec = self
                    .sort
                    .iter()
                    .find(|spec| spec.column == group.key)
                    .cloned()
                    .unwrap_or_else(|| SortSpec::ascending(group.key.clone()));
                specs.push(key_spec);
                specs.extend(
                    self.sort
                        .iter()
                        .filter(|spec| spec.column != group.key)
                        .cloned(),
                );
                specs
            }
        }
    }

    fn ensure_filtered(&mut self) -> Result<(), EngineError> {
        let fresh = self.filtered.as_ref().is_some_and(|cache| {
            cache.data_generation == self.data_generation
                && cache.filter_generation == self.filter_generation
        });
        if fresh {
            return Ok(());
        }
        let today = self
            .today_override
            .unwrap_or_else(|| Local::now().date_naive());
        let outcome = gm_filter::apply(&self.rows, &self.columns, &self.filter_state, today)?;
        self.stats.filter_passes += 1;
        self.filtered = Some(FilteredCache {
            row_ids: outcome.row_ids,
            warnings: outcome.warnings,
            data_generation: self.data_generation,
            filter_generation: self.filter_generation,
        });
        Ok(())
    }

    fn ensure_sorted(&mut self) -> Result<(), EngineError> {
        self.ensure_filtered()?;
        let fresh = self.sorted.as_ref().is_some_and(|cache| {
            cache.data_generation == self.data_generation
                && cache.filter_generation == self.filter_generation
                && cache.sort_generation == self.sort_generation
                && cache.group_generation == self.group_generation
        });
        if fresh {
            return Ok(());
        }
        let filtered_ids: &[RowId] = self.filtered.as_ref().map_or(&[], |c| &c.row_ids);
        let row_ids = sort_row_ids(&self.rows, filtered_ids, &self.effective_sort());
        self.stats.sort_passes += 1;
        self.sorted = Some(SortedCache {
            row_ids,
            data_generation: self.data_generation,
            filter_generation: self.filter_generation,
            sort_generation: self.sort_generation,
            group_generation: self.group_generation,
        });
        Ok(())
    }

    /// Summaries depend on the filtered membership and the grouping
    /// configuration but not on the user's secondary sort keys, so a
    /// sort-only change never recomputes them.
    fn ensure_summaries(&mut self) -> Result<(), EngineError> {
        let Some(group) = self.group.clone() else {
            self.summaries = None;
            return Ok(());
        };
        let fresh = self.summaries.as_ref().is_some_and(|cache| {
            cache.data_generation == self.data_generation
                && cache.filter_generation == self.filter_generation
                && cache.group_generation == self.group_generation
        });
        if fresh {
            return Ok(());
        }
        self.ensure_sorted()?;
        let ids: &[RowId] = self.sorted.as_ref().map_or(&[], |c| &c.row_ids);
        let summaries = gm_groupby::summarize(&self.rows, ids, &group.key, &group.aggregates);
        self.stats.summary_passes += 1;
        self.summaries = Some(SummariesCache {
            summaries,
            data_generation: self.data_generation,
            filter_generation: self.filter_generation,
            group_generation: self.group_generation,
        });
        Ok(())
    }

    /// Observer callback and command drain. The observer cannot touch
    /// the engine directly (it only receives the finished window and a
    /// queue), which is what makes re-entrant mutation impossible
    /// rather than merely detected.
    fn notify_and_drain(&mut self, window: &Window) -> Result<(), EngineError> {
        let Some(mut observer) = self.observer.take() else {
            return Ok(());
        };
        let mut commands = Vec::new();
        observer(window, &mut commands);
        self.observer = Some(observer);
        for command in commands {
            self.apply_command(command)?;
        }
        Ok(())
    }

    fn apply_command(&mut self, command: Command) -> Result<u64, EngineError> {
        match command {
            Command::SetQuickFilter(needle) => Ok(self.set_quick_filter(needle)),
            Command::SetColumnFilter { column, spec } => self.set_filter(&column, spec),
            Command::SetSort(sort) => self.set_sort(sort),
            Command::ScrollTo(offset) => Ok(self.scroll_to(offset)),
            Command::ClearFilters => Ok(self.clear_filters()),
        }
    }
}
