#![forbid(unsafe_code)]

use gm_types::{CellValue, RowId, RowSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub column: String,
    pub aggregate: Aggregate,
}

impl AggregateSpec {
    #[must_use]
    pub fn new(column: impl Into<String>, aggregate: Aggregate) -> Self {
        Self {
            column: column.into(),
            aggregate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateValue {
    pub column: String,
    pub aggregate: Aggregate,
    pub value: CellValue,
}

/// One group header row: the shared key, how many rows fell into the
/// run, and one value per requested aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub key: CellValue,
    pub key_label: String,
    pub row_count: usize,
    pub aggregates: Vec<AggregateValue>,
}

/// Partition an already-sorted id slice into contiguous runs of equal
/// group key and fold each run through the aggregate accumulators in a
/// single pass. Summaries come out in run order, which is first-seen
/// order once the caller has sorted on the group key.
#[must_use]
pub fn summarize(
    rows: &RowSet,
    ids: &[RowId],
    group_key: &str,
    specs: &[AggregateSpec],
) -> Vec<GroupSummary> {
    let mut summaries = Vec::new();
    let mut run: Option<Run> = None;

    for id in ids {
        let key_value = rows.cell(*id, group_key).cloned().unwrap_or(CellValue::Null);
        let key = key_value.set_key();

        let start_new = run.as_ref().is_none_or(|current| current.key != key);
        if start_new {
            if let Some(finished) = run.take() {
                summaries.push(finished.finish(specs));
            }
            run = Some(Run::new(key, key_value, specs.len()));
        }
        if let Some(current) = run.as_mut() {
            current.observe(rows, *id, specs);
        }
    }
    if let Some(finished) = run.take() {
        summaries.push(finished.finish(specs));
    }
    summaries
}

struct Run {
    key: String,
    key_value: CellValue,
    row_count: usize,
    accumulators: Vec<Accumulator>,
}

impl Run {
    fn new(key: String, key_value: CellValue, width: usize) -> Self {
        Self {
            key,
            key_value,
            row_count: 0,
            accumulators: (0..width).map(|_| Accumulator::default()).collect(),
        }
    }

    fn observe(&mut self, rows: &RowSet, id: RowId, specs: &[AggregateSpec]) {
        self.row_count += 1;
        for (accumulator, spec) in self.accumulators.iter_mut().zip(specs) {
            accumulator.observe(rows.cell(id, &spec.column));
        }
    }

    fn finish(self, specs: &[AggregateSpec]) -> GroupSummary {
        let aggregates = self
            .accumulators
            .into_iter()
            .zip(specs)
            .map(|(accumulator, spec)| AggregateValue {
                column: spec.column.clone(),
                aggregate: spec.aggregate,
                value: accumulator.finish(spec.aggregate),
            })
            .collect();
        GroupSummary {
            key_label: self.key,
            key: self.key_value,
            row_count: self.row_count,
            aggregates,
        }
    }
}

/// Fold state for one (column, aggregate) pair. Missing cells are
/// skipped by every accumulator except the non-missing count.
#[derive(Default)]
struct Accumulator {
    sum: f64,
    numeric: usize,
    non_missing: usize,
    min: Option<CellValue>,
    max: Option<CellValue>,
}

impl Accumulator {
    fn observe(&mut self, value: Option<&CellValue>) {
        let Some(value) = value else { return };
        if value.is_missing() {
            return;
        }
        self.non_missing += 1;
        if let Ok(number) = value.to_number() {
            self.sum += number;
            self.numeric += 1;
        }
        let replace_min = self
            .min
            .as_ref()
            .is_none_or(|current| value.sort_cmp(current).is_lt());
        if replace_min {
            self.min = Some(value.clone());
        }
        let replace_max = self
            .max
            .as_ref()
            .is_none_or(|current| value.sort_cmp(current).is_gt());
        if replace_max {
            self.max = Some(value.clone());
        }
    }

    fn finish(self, aggregate: Aggregate) -> CellValue {
        match aggregate {
            Aggregate::Sum if self.numeric > 0 => CellValue::Number(self.sum),
            Aggregate::Avg if self.numeric > 0 => {
                CellValue::Number(self.sum / self.numeric as f64)
            }
            Aggregate::Min => self.min.unwrap_or(CellValue::Null),
            Aggregate::Max => self.max.unwrap_or(CellValue::Null),
            Aggregate::Count => CellValue::Number(self.non_missing as f64),
            Aggregate::Sum | Aggregate::Avg => CellValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use gm_types::{CellValue, Row, RowId, RowSet};

    use super::{Aggregate, AggregateSpec, summarize};

    fn staff() -> RowSet {
        // Already in group order, as sorting on the key guarantees.
        let data = [
            (2_u64, "Engineering", Some(95_000.0)),
            (4, "Engineering", Some(72_000.0)),
            (6, "Engineering", None),
            (1, "Sales", Some(61_000.0)),
            (3, "Sales", Some(54_000.0)),
        ];
        let rows = data
            .into_iter()
            .map(|(id, dept, salary)| {
                Row::from_pairs(
                    id,
                    [
                        ("dept", CellValue::from(dept)),
                        ("salary", salary.map_or(CellValue::Null, CellValue::from)),
                    ],
                )
            })
            .collect();
        RowSet::new(rows).expect("rows")
    }

    fn ids(rows: &RowSet) -> Vec<RowId> {
        rows.rows().iter().map(|row| row.id()).collect()
    }

    #[test]
    fn runs_produce_one_summary_each_in_run_order() {
        let rows = staff();
        let specs = [
            AggregateSpec::new("salary", Aggregate::Avg),
            AggregateSpec::new("salary", Aggregate::Count),
        ];
        let summaries = summarize(&rows, &ids(&rows), "dept", &specs);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].key_label, "Engineering");
        assert_eq!(summaries[0].row_count, 3);
        // Missing salary skipped by avg, excluded from count.
        assert_eq!(
            summaries[0].aggregates[0].value,
            CellValue::Number(83_500.0)
        );
        assert_eq!(summaries[0].aggregates[1].value, CellValue::Number(2.0));

        assert_eq!(summaries[1].key_label, "Sales");
        assert_eq!(summaries[1].row_count, 2);
        assert_eq!(
            summaries[1].aggregates[0].value,
            CellValue::Number(57_500.0)
        );
    }

    #[test]
    fn single_group_sums_its_column() {
        let rows = RowSet::new(
            [(1_u64, 10.0), (2, 20.0), (3, 30.0)]
                .into_iter()
                .map(|(id, salary)| {
                    Row::from_pairs(
                        id,
                        [
                            ("dept", CellValue::from("Eng")),
                            ("salary", CellValue::from(salary)),
                        ],
                    )
                })
                .collect(),
        )
        .expect("rows");
        let specs = [AggregateSpec::new("salary", Aggregate::Sum)];
        let summaries = summarize(&rows, &ids(&rows), "dept", &specs);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].key_label, "Eng");
        assert_eq!(summaries[0].aggregates[0].value, CellValue::Number(60.0));
    }

    #[test]
    fn min_and_max_compare_with_the_sort_order() {
        let rows = staff();
        let specs = [
            AggregateSpec::new("salary", Aggregate::Min),
            AggregateSpec::new("salary", Aggregate::Max),
        ];
        let summaries = summarize(&rows, &ids(&rows), "dept", &specs);
        assert_eq!(
            summaries[0].aggregates[0].value,
            CellValue::Number(72_000.0)
        );
        assert_eq!(
            summaries[0].aggregates[1].value,
            CellValue::Number(95_000.0)
        );
    }

    #[test]
    fn all_missing_column_sums_to_null() {
        let rows = RowSet::new(vec![
            Row::from_pairs(1_u64, [("dept", CellValue::from("Ops"))]),
            Row::from_pairs(2_u64, [("dept", CellValue::from("Ops"))]),
        ])
        .expect("rows");
        let specs = [
            AggregateSpec::new("salary", Aggregate::Sum),
            AggregateSpec::new("salary", Aggregate::Count),
        ];
        let summaries = summarize(&rows, &ids(&rows), "dept", &specs);
        assert_eq!(summaries[0].aggregates[0].value, CellValue::Null);
        assert_eq!(summaries[0].aggregates[1].value, CellValue::Number(0.0));
    }

    #[test]
    fn rows_missing_the_group_key_form_a_null_run() {
        let rows = RowSet::new(vec![
            Row::from_pairs(1_u64, [("other", CellValue::from(1.0))]),
            Row::from_pairs(2_u64, [("other", CellValue::from(2.0))]),
        ])
        .expect("rows");
        let summaries = summarize(&rows, &ids(&rows), "dept", &[]);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].key, CellValue::Null);
        assert_eq!(summaries[0].key_label, "<null>");
        assert_eq!(summaries[0].row_count, 2);
    }

    #[test]
    fn empty_id_slice_yields_no_summaries() {
        let rows = staff();
        assert!(summarize(&rows, &[], "dept", &[]).is_empty());
    }

    #[test]
    fn interleaved_keys_split_into_separate_runs() {
        // Unsorted input: each key change starts a fresh run. The engine
        // always sorts on the key first, so this shows why.
        let rows = staff();
        let shuffled = [RowId(2), RowId(1), RowId(4)];
        let summaries = summarize(&rows, &shuffled, "dept", &[]);
        let labels: Vec<&str> = summaries.iter().map(|s| s.key_label.as_str()).collect();
        assert_eq!(labels, vec!["Engineering", "Sales", "Engineering"]);
    }
}
