#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use gm_predicate::{ConfigError, EvalEnv, EvalError, FilterSpec, eval_filter};
use gm_types::{ColumnDescriptor, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLogic {
    And,
    Or,
}

/// A recursive boolean expression over column-level filter specs.
///
/// A `Group` with zero children evaluates to match-all (the identity
/// element), so an emptied group never accidentally excludes every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionNode {
    Leaf {
        column: String,
        spec: FilterSpec,
    },
    Group {
        logic: GroupLogic,
        children: Vec<ConditionNode>,
    },
}

impl ConditionNode {
    #[must_use]
    pub fn leaf(column: impl Into<String>, spec: FilterSpec) -> Self {
        Self::Leaf {
            column: column.into(),
            spec,
        }
    }

    #[must_use]
    pub fn all_of(children: Vec<ConditionNode>) -> Self {
        Self::Group {
            logic: GroupLogic::And,
            children,
        }
    }

    #[must_use]
    pub fn any_of(children: Vec<ConditionNode>) -> Self {
        Self::Group {
            logic: GroupLogic::Or,
            children,
        }
    }

    /// The identity tree: matches every row.
    #[must_use]
    pub fn match_all() -> Self {
        Self::all_of(Vec::new())
    }

    /// Registration-time validation of every leaf against the column
    /// registry.
    pub fn validate(
        &self,
        columns: &BTreeMap<String, ColumnDescriptor>,
    ) -> Result<(), ConfigError> {
        match self {
            Self::Leaf { column, spec } => {
                let descriptor = columns
                    .get(column)
                    .ok_or_else(|| ConfigError::UnknownColumn {
                        key: column.clone(),
                    })?;
                spec.validate(descriptor)
            }
            Self::Group { children, .. } => {
                for child in children {
                    child.validate(columns)?;
                }
                Ok(())
            }
        }
    }

    pub fn for_each_leaf(&self, f: &mut impl FnMut(&str, &FilterSpec)) {
        match self {
            Self::Leaf { column, spec } => f(column, spec),
            Self::Group { children, .. } => {
                for child in children {
                    child.for_each_leaf(f);
                }
            }
        }
    }

    /// Estimated per-row cost: a leaf delegates to its spec, a group to
    /// its most expensive child (the subtree cannot be cheaper than the
    /// member that must run when nothing short-circuits).
    #[must_use]
    pub fn cost(&self) -> u8 {
        match self {
            Self::Leaf { spec, .. } => spec.cost(),
            Self::Group { children, .. } => {
                children.iter().map(ConditionNode::cost).max().unwrap_or(0)
            }
        }
    }

    /// Clone with every AND group's children stably reordered
    /// cheapest-first, so equality and set membership run before regex
    /// and fuzzy passes. Re-derived per filter application; a
    /// performance policy, never a correctness requirement.
    #[must_use]
    pub fn ordered_cheapest_first(&self) -> Self {
        match self {
            Self::Leaf { .. } => self.clone(),
            Self::Group { logic, children } => {
                let mut ordered: Vec<ConditionNode> = children
                    .iter()
                    .map(ConditionNode::ordered_cheapest_first)
                    .collect();
                if *logic == GroupLogic::And {
                    ordered.sort_by_key(ConditionNode::cost);
                }
                Self::Group {
                    logic: *logic,
                    children: ordered,
                }
            }
        }
    }
}

/// Single depth-first walk per row: AND groups short-circuit on the
/// first false, OR groups on the first true.
pub fn evaluate(node: &ConditionNode, row: &Row, env: &EvalEnv) -> Result<bool, EvalError> {
    match node {
        ConditionNode::Leaf { column, spec } => {
            eval_filter(spec, row.cell(column), &env.cx_for(column))
        }
        ConditionNode::Group { children, .. } if children.is_empty() => Ok(true),
        ConditionNode::Group {
            logic: GroupLogic::And,
            children,
        } => {
            for child in children {
                if !evaluate(child, row, env)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        ConditionNode::Group {
            logic: GroupLogic::Or,
            children,
        } => {
            for child in children {
                if evaluate(child, row, env)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}
