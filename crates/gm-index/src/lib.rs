#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use gm_predicate::{ConfigError, RegexCache, SetSelection, similarity};
use gm_types::{CellValue, RowSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    CountDescending,
    Lexical,
}

impl Default for IndexOrder {
    fn default() -> Self {
        Self::CountDescending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueIndexEntry {
    pub value: CellValue,
    pub count: usize,
    /// Canonical key ([`CellValue::set_key`]): selection membership and
    /// search both normalize through it.
    pub normalized: String,
}

/// Per-column catalog of distinct values with occurrence counts. Built
/// in one linear pass; the generation stamp ties it to the row set it
/// was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueIndex {
    column: String,
    order: IndexOrder,
    entries: Vec<ValueIndexEntry>,
    generation: u64,
}

impl ValueIndex {
    #[must_use]
    pub fn build(column: &str, rows: &RowSet, order: IndexOrder, generation: u64) -> Self {
        // First-seen ordering vec + count slots, then a presentation sort.
        let mut ordering = Vec::<String>::new();
        let mut slots = HashMap::<String, (CellValue, usize)>::new();

        for row in rows.rows() {
            let value = row.cell(column).cloned().unwrap_or(CellValue::Null);
            let key = value.set_key();
            slots
                .entry(key.clone())
                .and_modify(|(_, count)| *count += 1)
                .or_insert_with(|| {
                    ordering.push(key);
                    (value, 1)
                });
        }

        let mut entries = Vec::with_capacity(ordering.len());
        for key in ordering {
            if let Some((value, count)) = slots.remove(&key) {
                entries.push(ValueIndexEntry {
                    value,
                    count,
                    normalized: key,
                });
            }
        }

        match order {
            IndexOrder::CountDescending => {
                entries.sort_by(|a, b| {
                    b.count
                        .cmp(&a.count)
                        .then_with(|| a.normalized.cmp(&b.normalized))
                });
            }
            IndexOrder::Lexical => entries.sort_by(|a, b| a.normalized.cmp(&b.normalized)),
        }

        Self {
            column: column.to_owned(),
            order,
            entries,
            generation,
        }
    }

    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    #[must_use]
    pub fn order(&self) -> IndexOrder {
        self.order
    }

    #[must_use]
    pub fn entries(&self) -> &[ValueIndexEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of currently selected distinct values.
    #[must_use]
    pub fn selected_count(&self, selection: &SetSelection) -> usize {
        self.entries
            .iter()
            .filter(|entry| selection.is_selected(&entry.normalized))
            .count()
    }

    /// Narrow the *displayed* candidate list; the current selection is
    /// untouched. Returns indices into [`Self::entries`].
    pub fn search(
        &self,
        query: &SearchQuery,
        regexes: &mut RegexCache,
    ) -> Result<Vec<usize>, ConfigError> {
        let matches: Box<dyn Fn(&str) -> bool> = match query {
            SearchQuery::Substring(needle) => {
                let needle = needle.to_lowercase();
                Box::new(move |candidate: &str| candidate.to_lowercase().contains(&needle))
            }
            SearchQuery::Fuzzy { pattern, threshold } => {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(ConfigError::ThresholdOutOfRange { value: *threshold });
                }
                let pattern = pattern.clone();
                let threshold = *threshold;
                Box::new(move |candidate: &str| similarity(candidate, &pattern) >= threshold)
            }
            SearchQuery::Regex(pattern) => {
                regexes.ensure(pattern)?;
                let regex = regexes.get(pattern).cloned();
                Box::new(move |candidate: &str| {
                    regex.as_ref().is_some_and(|re| re.is_match(candidate))
                })
            }
        };

        Ok(self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches(&entry.normalized))
            .map(|(idx, _)| idx)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "args", rename_all = "snake_case")]
pub enum SearchQuery {
    Substring(String),
    Fuzzy { pattern: String, threshold: f64 },
    Regex(String),
}

/// Lazily maintained per-column indexes. Any row-set replacement bumps
/// the catalog generation; stale indexes are rebuilt on next access,
/// not eagerly.
#[derive(Debug, Default)]
pub struct ValueIndexCatalog {
    order: IndexOrder,
    generation: u64,
    indexes: HashMap<String, ValueIndex>,
}

impl ValueIndexCatalog {
    #[must_use]
    pub fn new(order: IndexOrder) -> Self {
        Self {
            order,
            generation: 0,
            indexes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Invalidate every column's index (data replacement).
    pub fn invalidate_all(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Drop one column's index (descriptor replacement).
    pub fn invalidate_column(&mut self, column: &str) {
        self.indexes.remove(column);
    }

    pub fn index_for(&mut self, column: &str, rows: &RowSet) -> &ValueIndex {
        match self.indexes.entry(column.to_owned()) {
            Entry::Occupied(mut slot) => {
                if slot.get().generation() != self.generation {
                    slot.insert(ValueIndex::build(column, rows, self.order, self.generation));
                }
                slot.into_mut()
            }
            Entry::Vacant(slot) => {
                slot.insert(ValueIndex::build(column, rows, self.order, self.generation))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionState {
    Checked,
    Unchecked,
    Indeterminate,
}

/// Arena node: children always carry a larger index than their parent,
/// and the parent back-reference is an index rather than an owning
/// pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub segment: String,
    pub count: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Set when a distinct value terminates at this node.
    pub leaf_key: Option<String>,
}

/// Hierarchical grouping of a value index: a key-derivation function
/// splits each distinct value into a path (e.g. domain-of-email) and
/// the arena maintains per-segment counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueTree {
    nodes: Vec<TreeNode>,
    roots: Vec<usize>,
}

impl ValueTree {
    #[must_use]
    pub fn build(index: &ValueIndex, split: impl Fn(&CellValue) -> Vec<String>) -> Self {
        let mut tree = Self::default();
        for entry in index.entries() {
            let path = split(&entry.value);
            if path.is_empty() {
                continue;
            }
            let mut parent: Option<usize> = None;
            for (depth, segment) in path.iter().enumerate() {
                let node = tree.child_with_segment(parent, segment).unwrap_or_else(|| {
                    tree.push_node(segment.clone(), parent)
                });
                tree.nodes[node].count += entry.count;
                if depth == path.len() - 1 {
                    tree.nodes[node].leaf_key = Some(entry.normalized.clone());
                }
                parent = Some(node);
            }
        }
        tree
    }

    fn push_node(&mut self, segment: String, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            segment,
            count: 0,
            parent,
            children: Vec::new(),
            leaf_key: None,
        });
        match parent {
            Some(parent_idx) => self.nodes[parent_idx].children.push(idx),
            None => self.roots.push(idx),
        }
        idx
    }

    fn child_with_segment(&self, parent: Option<usize>, segment: &str) -> Option<usize> {
        let candidates = match parent {
            Some(idx) => &self.nodes[idx].children,
            None => &self.roots,
        };
        candidates
            .iter()
            .copied()
            .find(|idx| self.nodes[*idx].segment == segment)
    }

    #[must_use]
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    #[must_use]
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tri-state per node, recomputed bottom-up: checked iff all
    /// descendant leaves are selected, unchecked iff none, otherwise
    /// indeterminate. One reverse pass suffices because children always
    /// follow their parents in the arena.
    #[must_use]
    pub fn states(&self, selection: &SetSelection) -> Vec<SelectionState> {
        let mut states = vec![SelectionState::Unchecked; self.nodes.len()];
        for idx in (0..self.nodes.len()).rev() {
            let node = &self.nodes[idx];
            let mut any_checked = false;
            let mut any_unchecked = false;
            let mut any_indeterminate = false;

            if let Some(key) = &node.leaf_key {
                if selection.is_selected(key) {
                    any_checked = true;
                } else {
                    any_unchecked = true;
                }
            }
            for child in &node.children {
                match states[*child] {
                    SelectionState::Checked => any_checked = true,
                    SelectionState::Unchecked => any_unchecked = true,
                    SelectionState::Indeterminate => any_indeterminate = true,
                }
            }

            states[idx] = if any_indeterminate || (any_checked && any_unchecked) {
                SelectionState::Indeterminate
            } else if any_checked {
                SelectionState::Checked
            } else {
                SelectionState::Unchecked
            };
        }
        states
    }

    #[must_use]
    pub fn state(&self, node: usize, selection: &SetSelection) -> SelectionState {
        self.states(selection)[node]
    }

    /// Parent checkbox click: select or deselect every leaf value under
    /// `node`.
    pub fn set_subtree(&self, node: usize, selected: bool, selection: &mut SetSelection) {
        let mut stack = vec![node];
        while let Some(idx) = stack.pop() {
            let current = &self.nodes[idx];
            if let Some(key) = &current.leaf_key {
                if selected {
                    selection.select(key);
                } else {
                    selection.deselect(key);
                }
            }
            stack.extend(current.children.iter().copied());
        }
    }
}
