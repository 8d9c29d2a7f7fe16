#![forbid(unsafe_code)]

use std::cmp::Ordering;

use gm_types::{CellValue, RowId, RowSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One sort key. Priority is positional: earlier specs in the slice
/// win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
}

impl SortSpec {
    #[must_use]
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }

    #[must_use]
    pub fn ascending(column: impl Into<String>) -> Self {
        Self::new(column, SortDirection::Ascending)
    }

    #[must_use]
    pub fn descending(column: impl Into<String>) -> Self {
        Self::new(column, SortDirection::Descending)
    }
}

/// Order `ids` by the composite key. The comparator compares cell
/// values per spec in priority order and falls back to `RowId` so the
/// result is a strict total order: no two distinct rows ever compare
/// equal, which keeps repeated sorts byte-identical.
#[must_use]
pub fn sort_row_ids(rows: &RowSet, ids: &[RowId], specs: &[SortSpec]) -> Vec<RowId> {
    let mut ordered = ids.to_vec();
    if specs.is_empty() {
        return ordered;
    }
    ordered.sort_by(|a, b| compare_rows(rows, *a, *b, specs));
    ordered
}

fn compare_rows(rows: &RowSet, a: RowId, b: RowId, specs: &[SortSpec]) -> Ordering {
    for spec in specs {
        let left = rows.cell(a, &spec.column).unwrap_or(&CellValue::Null);
        let right = rows.cell(b, &spec.column).unwrap_or(&CellValue::Null);
        let mut ordering = left.sort_cmp(right);
        if spec.direction == SortDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.0.cmp(&b.0)
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use gm_types::{CellValue, Row, RowId, RowSet};
    use proptest::prelude::*;

    use super::{SortSpec, compare_rows, sort_row_ids};

    fn rows() -> RowSet {
        let data = [
            (1_u64, "Sales", 61_000.0),
            (2, "Engineering", 95_000.0),
            (3, "Sales", 54_000.0),
            (4, "Engineering", 72_000.0),
            (5, "Engineering", 95_000.0),
        ];
        let rows = data
            .into_iter()
            .map(|(id, dept, salary)| {
                Row::from_pairs(
                    id,
                    [
                        ("dept", CellValue::from(dept)),
                        ("salary", CellValue::from(salary)),
                    ],
                )
            })
            .collect();
        RowSet::new(rows).expect("rows")
    }

    fn all_ids(rows: &RowSet) -> Vec<RowId> {
        rows.rows().iter().map(|row| row.id()).collect()
    }

    #[test]
    fn multi_key_sort_orders_by_priority() {
        let rows = rows();
        let specs = [
            SortSpec::ascending("dept"),
            SortSpec::descending("salary"),
        ];
        let sorted = sort_row_ids(&rows, &all_ids(&rows), &specs);
        let ids: Vec<u64> = sorted.iter().map(|id| id.0).collect();
        // Engineering first (95k ties broken by RowId), then Sales.
        assert_eq!(ids, vec![2, 5, 4, 1, 3]);
    }

    #[test]
    fn descending_age_reverses_three_rows() {
        let rows = RowSet::new(
            [(1_u64, 30.0), (2, 45.0), (3, 60.0)]
                .into_iter()
                .map(|(id, age)| Row::from_pairs(id, [("age", CellValue::from(age))]))
                .collect(),
        )
        .expect("rows");
        let sorted = sort_row_ids(&rows, &all_ids(&rows), &[SortSpec::descending("age")]);
        assert_eq!(sorted, vec![RowId(3), RowId(2), RowId(1)]);
    }

    #[test]
    fn no_specs_means_source_order() {
        let rows = rows();
        let ids = all_ids(&rows);
        assert_eq!(sort_row_ids(&rows, &ids, &[]), ids);
    }

    #[test]
    fn equal_keys_fall_back_to_row_id() {
        let rows = rows();
        let sorted = sort_row_ids(&rows, &[RowId(5), RowId(2)], &[SortSpec::ascending("dept")]);
        assert_eq!(sorted, vec![RowId(2), RowId(5)]);
    }

    #[test]
    fn missing_cells_sort_last_ascending_first_descending() {
        let rows = RowSet::new(vec![
            Row::from_pairs(1_u64, [("score", CellValue::from(10.0))]),
            Row::from_pairs(2_u64, [("other", CellValue::from(1.0))]),
            Row::from_pairs(3_u64, [("score", CellValue::from(7.0))]),
        ])
        .expect("rows");
        let ids = all_ids(&rows);

        let ascending = sort_row_ids(&rows, &ids, &[SortSpec::ascending("score")]);
        assert_eq!(ascending, vec![RowId(3), RowId(1), RowId(2)]);

        let descending = sort_row_ids(&rows, &ids, &[SortSpec::descending("score")]);
        assert_eq!(descending, vec![RowId(2), RowId(1), RowId(3)]);
    }

    proptest! {
        #[test]
        fn comparator_is_a_strict_total_order(values in proptest::collection::vec(proptest::option::of(-100.0_f64..100.0), 2..30)) {
            let rows: Vec<Row> = values
                .iter()
                .enumerate()
                .map(|(idx, value)| {
                    let cell = value.map_or(CellValue::Null, CellValue::from);
                    Row::from_pairs(idx as u64, [("v", cell)])
                })
                .collect();
            let rows = RowSet::new(rows).expect("rows");
            let specs = [SortSpec::ascending("v")];
            let ids = all_ids(&rows);

            // Distinct rows never compare equal, and the order is
            // antisymmetric.
            for &a in &ids {
                for &b in &ids {
                    let forward = compare_rows(&rows, a, b, &specs);
                    let backward = compare_rows(&rows, b, a, &specs);
                    if a == b {
                        prop_assert_eq!(forward, Ordering::Equal);
                    } else {
                        prop_assert_ne!(forward, Ordering::Equal);
                        prop_assert_eq!(forward, backward.reverse());
                    }
                }
            }

            // Sorting twice is a no-op.
            let once = sort_row_ids(&rows, &ids, &specs);
            let twice = sort_row_ids(&rows, &once, &specs);
            prop_assert_eq!(once, twice);
        }
    }
}
