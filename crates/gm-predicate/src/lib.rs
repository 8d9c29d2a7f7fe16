#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, Days, NaiveDate, Weekday};
use gm_types::{CellValue, ColumnDescriptor, ColumnType, TypeError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum TextFilter {
    Equals(String),
    NotEquals(String),
    Contains(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
    IsEmpty,
    IsNotEmpty,
    Fuzzy { pattern: String, threshold: f64 },
    Regex { pattern: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum NumberFilter {
    Equals(f64),
    NotEquals(f64),
    GreaterThan(f64),
    GreaterThanOrEqual(f64),
    LessThan(f64),
    LessThanOrEqual(f64),
    InRange { low: f64, high: f64 },
    NotInRange { low: f64, high: f64 },
    IsPrime,
    IsDivisibleBy(i64),
    IsOutlier { k: f64 },
    IsAboveAverage,
    IsBelowMedian,
    IsInTopPercentile(f64),
}

impl NumberFilter {
    /// Conventional outlier filter: outside mean ± 2·stddev.
    #[must_use]
    pub fn outlier() -> Self {
        Self::IsOutlier { k: 2.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum DateFilter {
    Equals(NaiveDate),
    Before(NaiveDate),
    After(NaiveDate),
    OnOrBefore(NaiveDate),
    OnOrAfter(NaiveDate),
    InRange { start: NaiveDate, end: NaiveDate },
    NotInRange { start: NaiveDate, end: NaiveDate },
    LastDays(u32),
    ThisMonth,
    BusinessDay { holidays: Vec<NaiveDate> },
    Weekend,
    Holiday { dates: Vec<NaiveDate> },
    FiscalYear { year: i32, start_month: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolFilter {
    IsTrue,
    IsFalse,
    IsNull,
}

/// Selected subset of a column's distinct values, keyed by
/// [`CellValue::set_key`]. The `inverted` flag represents "everything
/// except `values`" so select-all, clear-all, and invert never
/// materialize the full distinct set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSelection {
    values: BTreeSet<String>,
    inverted: bool,
}

impl SetSelection {
    /// Nothing selected: matches no row.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Everything selected: the identity filter.
    #[must_use]
    pub fn all() -> Self {
        Self {
            values: BTreeSet::new(),
            inverted: true,
        }
    }

    #[must_use]
    pub fn from_keys(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            values: keys.into_iter().map(Into::into).collect(),
            inverted: false,
        }
    }

    #[must_use]
    pub fn is_selected(&self, key: &str) -> bool {
        self.values.contains(key) != self.inverted
    }

    #[must_use]
    pub fn is_select_all(&self) -> bool {
        self.inverted && self.values.is_empty()
    }

    #[must_use]
    pub fn is_select_none(&self) -> bool {
        !self.inverted && self.values.is_empty()
    }

    pub fn select(&mut self, key: &str) {
        if self.inverted {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_owned());
        }
    }

    pub fn deselect(&mut self, key: &str) {
        if self.inverted {
            self.values.insert(key.to_owned());
        } else {
            self.values.remove(key);
        }
    }

    pub fn toggle(&mut self, key: &str) {
        if self.is_selected(key) {
            self.deselect(key);
        } else {
            self.select(key);
        }
    }

    pub fn select_all(&mut self) {
        *self = Self::all();
    }

    pub fn clear_all(&mut self) {
        *self = Self::none();
    }

    /// `selected' = allValues − selected`, in O(1): the exception set is
    /// unchanged, only the complement flag flips.
    pub fn invert(&mut self) {
        self.inverted = !self.inverted;
    }

    /// Number of selected entries out of `total` distinct values,
    /// assuming every exception key exists in the distinct set.
    #[must_use]
    pub fn selected_count(&self, total: usize) -> usize {
        if self.inverted {
            total.saturating_sub(self.values.len())
        } else {
            self.values.len().min(total)
        }
    }
}

/// A per-column filter: a closed tagged union matched exhaustively, so
/// every `(column type, operator)` pairing is compiler-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum FilterSpec {
    Text(TextFilter),
    Number(NumberFilter),
    Date(DateFilter),
    Boolean(BoolFilter),
    Set(SetSelection),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{filter} filter cannot apply to column {column:?} of type {column_type:?}")]
    OperatorTypeMismatch {
        column: String,
        column_type: ColumnType,
        filter: &'static str,
    },
    #[error("malformed regex pattern {pattern:?}: {detail}")]
    MalformedRegex { pattern: String, detail: String },
    #[error("fuzzy threshold {value} is outside 0.0..=1.0")]
    ThresholdOutOfRange { value: f64 },
    #[error("range lower bound {low} exceeds upper bound {high}")]
    InvertedRange { low: f64, high: f64 },
    #[error("date range start {start} is after end {end}")]
    InvertedDateRange { start: NaiveDate, end: NaiveDate },
    #[error("divisor must be non-zero")]
    ZeroDivisor,
    #[error("percentile {value} is outside 0.0..=100.0")]
    PercentileOutOfRange { value: f64 },
    #[error("outlier factor {value} must be positive and finite")]
    BadOutlierFactor { value: f64 },
    #[error("last-days span must be at least 1")]
    ZeroDaySpan,
    #[error("fiscal year start month {month} is outside 1..=12")]
    BadFiscalStartMonth { month: u32 },
    #[error("unknown column key {key:?}")]
    UnknownColumn { key: String },
}

/// Row-level evaluation failure. Recovered per row by the filter engine:
/// the row is treated as non-matching and counted in the aggregated
/// warnings, never aborting the pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("column statistics were not prepared for this filter application")]
    MissingStats,
    #[error("regex pattern {pattern:?} was not precompiled")]
    MissingRegex { pattern: String },
}

impl FilterSpec {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Date(_) => "date",
            Self::Boolean(_) => "boolean",
            Self::Set(_) => "set",
        }
    }

    /// Registration-time validation: operator/type pairing, operand
    /// sanity, and regex compilation. Raised at the call that introduced
    /// the bad config, never deferred into row evaluation.
    pub fn validate(&self, column: &ColumnDescriptor) -> Result<(), ConfigError> {
        self.check_column_pairing(column)?;
        match self {
            Self::Text(filter) => match filter {
                TextFilter::Fuzzy { threshold, .. } => {
                    if !(0.0..=1.0).contains(threshold) {
                        return Err(ConfigError::ThresholdOutOfRange { value: *threshold });
                    }
                    Ok(())
                }
                TextFilter::Regex { pattern } => Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|error| ConfigError::MalformedRegex {
                        pattern: pattern.clone(),
                        detail: error.to_string(),
                    }),
                _ => Ok(()),
            },
            Self::Number(filter) => match filter {
                NumberFilter::InRange { low, high } | NumberFilter::NotInRange { low, high } => {
                    if low > high {
                        return Err(ConfigError::InvertedRange {
                            low: *low,
                            high: *high,
                        });
                    }
                    Ok(())
                }
                NumberFilter::IsDivisibleBy(divisor) => {
                    if *divisor == 0 {
                        return Err(ConfigError::ZeroDivisor);
                    }
                    Ok(())
                }
                NumberFilter::IsOutlier { k } => {
                    if !k.is_finite() || *k <= 0.0 {
                        return Err(ConfigError::BadOutlierFactor { value: *k });
                    }
                    Ok(())
                }
                NumberFilter::IsInTopPercentile(p) => {
                    if !(0.0..=100.0).contains(p) {
                        return Err(ConfigError::PercentileOutOfRange { value: *p });
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            Self::Date(filter) => match filter {
                DateFilter::InRange { start, end } | DateFilter::NotInRange { start, end } => {
                    if start > end {
                        return Err(ConfigError::InvertedDateRange {
                            start: *start,
                            end: *end,
                        });
                    }
                    Ok(())
                }
                DateFilter::LastDays(days) => {
                    if *days == 0 {
                        return Err(ConfigError::ZeroDaySpan);
                    }
                    Ok(())
                }
                DateFilter::FiscalYear { start_month, .. } => {
                    if !(1..=12).contains(start_month) {
                        return Err(ConfigError::BadFiscalStartMonth {
                            month: *start_month,
                        });
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            Self::Boolean(_) | Self::Set(_) => Ok(()),
        }
    }

    fn check_column_pairing(&self, column: &ColumnDescriptor) -> Result<(), ConfigError> {
        let ok = match self {
            Self::Text(_) => matches!(
                column.column_type,
                ColumnType::Text | ColumnType::Enumerated
            ),
            Self::Number(_) => column.column_type == ColumnType::Number,
            Self::Date(_) => column.column_type == ColumnType::Date,
            Self::Boolean(_) => column.column_type == ColumnType::Boolean,
            // A set filter works over any column's distinct values.
            Self::Set(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::OperatorTypeMismatch {
                column: column.key.clone(),
                column_type: column.column_type,
                filter: self.kind_name(),
            })
        }
    }

    /// Whether evaluation needs a one-shot full-column statistical pass.
    #[must_use]
    pub fn needs_stats(&self) -> bool {
        matches!(
            self,
            Self::Number(
                NumberFilter::IsOutlier { .. }
                    | NumberFilter::IsAboveAverage
                    | NumberFilter::IsBelowMedian
                    | NumberFilter::IsInTopPercentile(_)
            )
        )
    }

    #[must_use]
    pub fn regex_pattern(&self) -> Option<&str> {
        match self {
            Self::Text(TextFilter::Regex { pattern }) => Some(pattern),
            _ => None,
        }
    }

    /// Relative per-row cost rank, used to order AND members
    /// cheapest-first. A performance policy, not a correctness
    /// requirement.
    #[must_use]
    pub fn cost(&self) -> u8 {
        match self {
            Self::Set(_) | Self::Boolean(_) => 0,
            Self::Number(filter) => {
                if self.needs_stats() {
                    3
                } else {
                    match filter {
                        NumberFilter::IsPrime => 2,
                        _ => 1,
                    }
                }
            }
            Self::Date(_) => 2,
            Self::Text(filter) => match filter {
                TextFilter::Regex { .. } => 4,
                TextFilter::Fuzzy { .. } => 5,
                _ => 2,
            },
        }
    }
}

/// User regex patterns compiled once and cached by pattern string.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: HashMap<String, Regex>,
}

impl RegexCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, pattern: &str) -> Result<(), ConfigError> {
        if self.compiled.contains_key(pattern) {
            return Ok(());
        }
        let regex = Regex::new(pattern).map_err(|error| ConfigError::MalformedRegex {
            pattern: pattern.to_owned(),
            detail: error.to_string(),
        })?;
        self.compiled.insert(pattern.to_owned(), regex);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// One-shot full-column statistics backing the statistical number
/// operators. Computed once per filter application and cached until the
/// data or the operator changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    mean: f64,
    stddev: f64,
    median: f64,
    sorted: Vec<f64>,
}

impl ColumnStats {
    /// `None` when the column holds no finite numeric values.
    #[must_use]
    pub fn compute(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        // Population variance.
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            mean,
            stddev,
            median,
            sorted,
        })
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    #[must_use]
    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    #[must_use]
    pub fn median(&self) -> f64 {
        self.median
    }

    /// Nearest-rank percentile over the sorted column values.
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        let n = self.sorted.len();
        let rank = ((p / 100.0) * n as f64).ceil() as usize;
        self.sorted[rank.saturating_sub(1).min(n - 1)]
    }
}

/// Per-application evaluation environment: the "now" anchor captured
/// once (never per row), compiled regexes, and per-column statistics.
#[derive(Debug)]
pub struct EvalEnv {
    today: NaiveDate,
    regexes: RegexCache,
    stats: HashMap<String, ColumnStats>,
}

impl EvalEnv {
    #[must_use]
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            regexes: RegexCache::new(),
            stats: HashMap::new(),
        }
    }

    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn regexes_mut(&mut self) -> &mut RegexCache {
        &mut self.regexes
    }

    pub fn insert_stats(&mut self, column: impl Into<String>, stats: ColumnStats) {
        self.stats.insert(column.into(), stats);
    }

    #[must_use]
    pub fn stats(&self, column: &str) -> Option<&ColumnStats> {
        self.stats.get(column)
    }

    #[must_use]
    pub fn cx_for(&self, column: &str) -> EvalCx<'_> {
        EvalCx {
            today: self.today,
            regexes: &self.regexes,
            stats: self.stats.get(column),
        }
    }
}

/// View of [`EvalEnv`] narrowed to one column.
#[derive(Debug, Clone, Copy)]
pub struct EvalCx<'a> {
    pub today: NaiveDate,
    pub regexes: &'a RegexCache,
    pub stats: Option<&'a ColumnStats>,
}

/// Evaluate a filter against one cell. Pure: no side effects, all
/// application-scoped inputs come through `cx`.
pub fn eval_filter(
    spec: &FilterSpec,
    value: Option<&CellValue>,
    cx: &EvalCx<'_>,
) -> Result<bool, EvalError> {
    match spec {
        FilterSpec::Text(filter) => eval_text(filter, value, cx),
        FilterSpec::Number(filter) => eval_number(filter, value, cx),
        FilterSpec::Date(filter) => eval_date(filter, value, cx),
        FilterSpec::Boolean(filter) => Ok(eval_bool(*filter, value)?),
        FilterSpec::Set(selection) => {
            let key = value.map_or_else(|| CellValue::Null.set_key(), CellValue::set_key);
            Ok(selection.is_selected(&key))
        }
    }
}

fn eval_text(
    filter: &TextFilter,
    value: Option<&CellValue>,
    cx: &EvalCx<'_>,
) -> Result<bool, EvalError> {
    let text = match value {
        Some(CellValue::Text(v)) => Some(v.as_str()),
        Some(CellValue::Null) | None => None,
        Some(other) => {
            return Err(EvalError::Type(TypeError::WrongKind {
                expected: "text",
                found: other.kind_name(),
            }));
        }
    };

    // Empty-ness treats a missing cell and "" alike; every other
    // operator rejects missing cells without erroring.
    match filter {
        TextFilter::IsEmpty => return Ok(text.is_none_or(str::is_empty)),
        TextFilter::IsNotEmpty => return Ok(text.is_some_and(|t| !t.is_empty())),
        _ => {}
    }
    let Some(text) = text else {
        return Ok(false);
    };
    let haystack = text.to_lowercase();

    Ok(match filter {
        TextFilter::Equals(needle) => haystack == needle.to_lowercase(),
        TextFilter::NotEquals(needle) => haystack != needle.to_lowercase(),
        TextFilter::Contains(needle) => haystack.contains(&needle.to_lowercase()),
        TextFilter::NotContains(needle) => !haystack.contains(&needle.to_lowercase()),
        TextFilter::StartsWith(needle) => haystack.starts_with(&needle.to_lowercase()),
        TextFilter::EndsWith(needle) => haystack.ends_with(&needle.to_lowercase()),
        TextFilter::Fuzzy { pattern, threshold } => similarity(text, pattern) >= *threshold,
        TextFilter::Regex { pattern } => {
            let regex = cx.regexes.get(pattern).ok_or_else(|| EvalError::MissingRegex {
                pattern: pattern.clone(),
            })?;
            regex.is_match(text)
        }
        TextFilter::IsEmpty | TextFilter::IsNotEmpty => unreachable!("handled above"),
    })
}

fn eval_number(
    filter: &NumberFilter,
    value: Option<&CellValue>,
    cx: &EvalCx<'_>,
) -> Result<bool, EvalError> {
    let value = match value {
        Some(v) if v.is_missing() => return Ok(false),
        None => return Ok(false),
        Some(v) => v.to_number()?,
    };

    Ok(match filter {
        NumberFilter::Equals(operand) => value == *operand,
        NumberFilter::NotEquals(operand) => value != *operand,
        NumberFilter::GreaterThan(operand) => value > *operand,
        NumberFilter::GreaterThanOrEqual(operand) => value >= *operand,
        NumberFilter::LessThan(operand) => value < *operand,
        NumberFilter::LessThanOrEqual(operand) => value <= *operand,
        NumberFilter::InRange { low, high } => value >= *low && value <= *high,
        NumberFilter::NotInRange { low, high } => value < *low || value > *high,
        NumberFilter::IsPrime => is_prime(value),
        NumberFilter::IsDivisibleBy(divisor) => {
            value.fract() == 0.0 && value.abs() < 9e15 && (value as i64) % divisor == 0
        }
        NumberFilter::IsOutlier { k } => {
            let stats = cx.stats.ok_or(EvalError::MissingStats)?;
            (value - stats.mean()).abs() > k * stats.stddev()
        }
        NumberFilter::IsAboveAverage => {
            let stats = cx.stats.ok_or(EvalError::MissingStats)?;
            value > stats.mean()
        }
        NumberFilter::IsBelowMedian => {
            let stats = cx.stats.ok_or(EvalError::MissingStats)?;
            value < stats.median()
        }
        NumberFilter::IsInTopPercentile(p) => {
            let stats = cx.stats.ok_or(EvalError::MissingStats)?;
            value >= stats.percentile(100.0 - p)
        }
    })
}

fn eval_date(
    filter: &DateFilter,
    value: Option<&CellValue>,
    cx: &EvalCx<'_>,
) -> Result<bool, EvalError> {
    let date = match value {
        Some(CellValue::Null) | None => return Ok(false),
        Some(v) => v.to_date()?,
    };
    let today = cx.today;

    Ok(match filter {
        DateFilter::Equals(operand) => date == *operand,
        DateFilter::Before(operand) => date < *operand,
        DateFilter::After(operand) => date > *operand,
        DateFilter::OnOrBefore(operand) => date <= *operand,
        DateFilter::OnOrAfter(operand) => date >= *operand,
        DateFilter::InRange { start, end } => date >= *start && date <= *end,
        DateFilter::NotInRange { start, end } => date < *start || date > *end,
        DateFilter::LastDays(days) => {
            // Inclusive window of `days` civil days ending today.
            let start = today
                .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
                .unwrap_or(NaiveDate::MIN);
            date >= start && date <= today
        }
        DateFilter::ThisMonth => date.year() == today.year() && date.month() == today.month(),
        DateFilter::BusinessDay { holidays } => {
            !is_weekend(date) && !holidays.contains(&date)
        }
        DateFilter::Weekend => is_weekend(date),
        DateFilter::Holiday { dates } => dates.contains(&date),
        DateFilter::FiscalYear { year, start_month } => {
            fiscal_year_contains(date, *year, *start_month)
        }
    })
}

fn eval_bool(filter: BoolFilter, value: Option<&CellValue>) -> Result<bool, EvalError> {
    Ok(match filter {
        BoolFilter::IsNull => value.is_none_or(CellValue::is_missing),
        BoolFilter::IsTrue | BoolFilter::IsFalse => match value {
            Some(CellValue::Null) | None => false,
            Some(v) => {
                let truth = v.to_bool()?;
                truth == matches!(filter, BoolFilter::IsTrue)
            }
        },
    })
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn fiscal_year_contains(date: NaiveDate, year: i32, start_month: u32) -> bool {
    let start_year = if start_month > 1 { year - 1 } else { year };
    let Some(start) = NaiveDate::from_ymd_opt(start_year, start_month, 1) else {
        return false;
    };
    let Some(end) = NaiveDate::from_ymd_opt(start_year + 1, start_month, 1) else {
        return false;
    };
    date >= start && date < end
}

fn is_prime(value: f64) -> bool {
    if value.fract() != 0.0 || value < 2.0 || value > 9e15 {
        return false;
    }
    let n = value as u64;
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3_u64;
    while d.saturating_mul(d) <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Edit-distance similarity in `0.0..=1.0` over lowercased strings:
/// `1 − levenshtein/max_len`, floored at the length ratio when one
/// string contains the other so type-ahead prefixes rank usefully.
#[must_use]
pub fn similarity(left: &str, right: &str) -> f64 {
    let a = left.to_lowercase();
    let b = right.to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    let base = 1.0 - levenshtein(&a_chars, &b_chars) as f64 / max_len as f64;

    let min_len = a_chars.len().min(b_chars.len());
    let containment = if a.contains(&b) || b.contains(&a) {
        min_len as f64 / max_len as f64
    } else {
        0.0
    };

    base.max(containment)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0_usize; b.len() + 1];

    for (i, a_ch) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_ch) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(a_ch != b_ch);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use gm_types::{CellValue, ColumnDescriptor, ColumnType};

    use super::{
        BoolFilter, ColumnStats, ConfigError, DateFilter, EvalEnv, FilterSpec, NumberFilter,
        SetSelection, TextFilter, eval_filter, similarity,
    };

    fn env() -> EvalEnv {
        EvalEnv::new(NaiveDate::from_ymd_opt(2024, 3, 15).expect("anchor date"))
    }

    fn eval(spec: &FilterSpec, value: &CellValue, env: &EvalEnv) -> bool {
        eval_filter(spec, Some(value), &env.cx_for("col")).expect("eval")
    }

    #[test]
    fn text_operators_are_case_insensitive() {
        let env = env();
        let value = CellValue::from("Hello World");
        assert!(eval(
            &FilterSpec::Text(TextFilter::Contains("WORLD".to_owned())),
            &value,
            &env
        ));
        assert!(eval(
            &FilterSpec::Text(TextFilter::StartsWith("hello".to_owned())),
            &value,
            &env
        ));
        assert!(!eval(
            &FilterSpec::Text(TextFilter::Equals("hello".to_owned())),
            &value,
            &env
        ));
    }

    #[test]
    fn is_empty_treats_missing_and_blank_alike() {
        let env = env();
        let spec = FilterSpec::Text(TextFilter::IsEmpty);
        assert!(eval(&spec, &CellValue::Null, &env));
        assert!(eval(&spec, &CellValue::from(""), &env));
        assert!(!eval(&spec, &CellValue::from("x"), &env));
        assert!(
            eval_filter(&spec, None, &env.cx_for("col")).expect("absent cell is empty")
        );
    }

    #[test]
    fn fuzzy_similarity_orders_close_matches_above_threshold() {
        assert_eq!(similarity("grid", "grid"), 1.0);
        assert!(similarity("gird", "grid") >= 0.5);
        assert!(similarity("grid", "gri") > 0.7);
        assert!(similarity("grid", "zzzz") < 0.3);
    }

    #[test]
    fn regex_requires_precompiled_pattern() {
        let mut env = env();
        let spec = FilterSpec::Text(TextFilter::Regex {
            pattern: "^ab+$".to_owned(),
        });
        env.regexes_mut().ensure("^ab+$").expect("compiles");
        assert!(eval(&spec, &CellValue::from("abb"), &env));
        assert!(!eval(&spec, &CellValue::from("ba"), &env));
    }

    #[test]
    fn number_range_bounds_are_inclusive() {
        let env = env();
        let spec = FilterSpec::Number(NumberFilter::InRange {
            low: 1.0,
            high: 5.0,
        });
        assert!(eval(&spec, &CellValue::from(1.0), &env));
        assert!(eval(&spec, &CellValue::from(5.0), &env));
        assert!(!eval(&spec, &CellValue::from(5.5), &env));
    }

    #[test]
    fn prime_and_divisibility_checks() {
        let env = env();
        let prime = FilterSpec::Number(NumberFilter::IsPrime);
        assert!(eval(&prime, &CellValue::from(2.0), &env));
        assert!(eval(&prime, &CellValue::from(97.0), &env));
        assert!(!eval(&prime, &CellValue::from(1.0), &env));
        assert!(!eval(&prime, &CellValue::from(91.0), &env));
        assert!(!eval(&prime, &CellValue::from(6.5), &env));

        let div = FilterSpec::Number(NumberFilter::IsDivisibleBy(3));
        assert!(eval(&div, &CellValue::from(9.0), &env));
        assert!(!eval(&div, &CellValue::from(10.0), &env));
    }

    #[test]
    fn statistical_operators_use_column_stats() {
        let mut env = env();
        let stats =
            ColumnStats::compute([10.0, 20.0, 30.0, 40.0, 100.0]).expect("stats");
        env.insert_stats("col", stats);

        let above = FilterSpec::Number(NumberFilter::IsAboveAverage);
        assert!(eval(&above, &CellValue::from(50.0), &env));
        assert!(!eval(&above, &CellValue::from(30.0), &env));

        let below_median = FilterSpec::Number(NumberFilter::IsBelowMedian);
        assert!(eval(&below_median, &CellValue::from(20.0), &env));
        assert!(!eval(&below_median, &CellValue::from(30.0), &env));

        let top = FilterSpec::Number(NumberFilter::IsInTopPercentile(20.0));
        assert!(eval(&top, &CellValue::from(100.0), &env));
        assert!(!eval(&top, &CellValue::from(30.0), &env));
    }

    #[test]
    fn outlier_uses_mean_plus_k_stddev() {
        let mut env = env();
        let stats = ColumnStats::compute([10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 30.0])
            .expect("stats");
        env.insert_stats("col", stats);

        let spec = FilterSpec::Number(NumberFilter::outlier());
        assert!(eval(&spec, &CellValue::from(30.0), &env));
        assert!(!eval(&spec, &CellValue::from(10.0), &env));
    }

    #[test]
    fn statistical_operator_without_stats_is_a_row_error() {
        let env = env();
        let spec = FilterSpec::Number(NumberFilter::IsAboveAverage);
        let err = eval_filter(&spec, Some(&CellValue::from(1.0)), &env.cx_for("col"))
            .expect_err("stats missing");
        assert_eq!(
            err.to_string(),
            "column statistics were not prepared for this filter application"
        );
    }

    #[test]
    fn relative_date_windows_anchor_to_captured_today() {
        let env = env(); // anchored 2024-03-15, a Friday
        let last_week = FilterSpec::Date(DateFilter::LastDays(7));
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).expect("date");
        assert!(eval(&last_week, &CellValue::Date(d(2024, 3, 9)), &env));
        assert!(eval(&last_week, &CellValue::Date(d(2024, 3, 15)), &env));
        assert!(!eval(&last_week, &CellValue::Date(d(2024, 3, 8)), &env));
        assert!(!eval(&last_week, &CellValue::Date(d(2024, 3, 16)), &env));

        let this_month = FilterSpec::Date(DateFilter::ThisMonth);
        assert!(eval(&this_month, &CellValue::Date(d(2024, 3, 1)), &env));
        assert!(!eval(&this_month, &CellValue::Date(d(2024, 2, 29)), &env));
    }

    #[test]
    fn business_day_excludes_weekends_and_holidays() {
        let env = env();
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).expect("date");
        let spec = FilterSpec::Date(DateFilter::BusinessDay {
            holidays: vec![d(2024, 3, 14)],
        });
        assert!(eval(&spec, &CellValue::Date(d(2024, 3, 15)), &env)); // Friday
        assert!(!eval(&spec, &CellValue::Date(d(2024, 3, 16)), &env)); // Saturday
        assert!(!eval(&spec, &CellValue::Date(d(2024, 3, 14)), &env)); // holiday
    }

    #[test]
    fn fiscal_year_honors_start_month() {
        let env = env();
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).expect("date");
        // FY2024 starting in April runs 2023-04-01 .. 2024-03-31.
        let spec = FilterSpec::Date(DateFilter::FiscalYear {
            year: 2024,
            start_month: 4,
        });
        assert!(eval(&spec, &CellValue::Date(d(2023, 4, 1)), &env));
        assert!(eval(&spec, &CellValue::Date(d(2024, 3, 31)), &env));
        assert!(!eval(&spec, &CellValue::Date(d(2024, 4, 1)), &env));
    }

    #[test]
    fn boolean_filter_is_three_state() {
        let env = env();
        assert!(eval(
            &FilterSpec::Boolean(BoolFilter::IsTrue),
            &CellValue::Bool(true),
            &env
        ));
        assert!(eval(
            &FilterSpec::Boolean(BoolFilter::IsNull),
            &CellValue::Null,
            &env
        ));
        assert!(!eval(
            &FilterSpec::Boolean(BoolFilter::IsFalse),
            &CellValue::Null,
            &env
        ));
    }

    #[test]
    fn select_all_then_invert_selects_nothing() {
        let mut selection = SetSelection::all();
        selection.invert();
        assert!(selection.is_select_none());
        assert!(!selection.is_selected("anything"));

        let mut selection = SetSelection::none();
        selection.invert();
        assert!(selection.is_select_all());
        assert!(selection.is_selected("anything"));
    }

    #[test]
    fn set_selection_counts_without_materializing() {
        let mut selection = SetSelection::all();
        selection.deselect("Sales");
        assert_eq!(selection.selected_count(2), 1);
        assert!(selection.is_selected("Eng"));
        assert!(!selection.is_selected("Sales"));
    }

    #[test]
    fn empty_selection_matches_nothing_select_all_is_identity() {
        let env = env();
        let none = FilterSpec::Set(SetSelection::none());
        assert!(!eval(&none, &CellValue::from("Eng"), &env));

        let all = FilterSpec::Set(SetSelection::all());
        assert!(eval(&all, &CellValue::from("Eng"), &env));
        assert!(eval(&all, &CellValue::Null, &env));
    }

    #[test]
    fn validation_rejects_operator_type_mismatch() {
        let column = ColumnDescriptor::new("age", ColumnType::Number);
        let spec = FilterSpec::Text(TextFilter::Contains("x".to_owned()));
        let err = spec.validate(&column).expect_err("mismatch");
        assert!(matches!(err, ConfigError::OperatorTypeMismatch { .. }));
    }

    #[test]
    fn validation_rejects_malformed_regex_and_bad_operands() {
        let column = ColumnDescriptor::new("name", ColumnType::Text);
        let bad_regex = FilterSpec::Text(TextFilter::Regex {
            pattern: "(".to_owned(),
        });
        assert!(matches!(
            bad_regex.validate(&column).expect_err("bad regex"),
            ConfigError::MalformedRegex { .. }
        ));

        let number_column = ColumnDescriptor::new("age", ColumnType::Number);
        let zero_divisor = FilterSpec::Number(NumberFilter::IsDivisibleBy(0));
        assert!(matches!(
            zero_divisor.validate(&number_column).expect_err("zero"),
            ConfigError::ZeroDivisor
        ));

        let inverted = FilterSpec::Number(NumberFilter::InRange {
            low: 5.0,
            high: 1.0,
        });
        assert!(matches!(
            inverted.validate(&number_column).expect_err("inverted"),
            ConfigError::InvertedRange { .. }
        ));
    }

    #[test]
    fn filter_spec_serde_round_trips_with_snake_case_tags() {
        let spec = FilterSpec::Number(NumberFilter::InRange {
            low: 1.0,
            high: 2.0,
        });
        let json = serde_json::to_string(&spec).expect("serialize");
        assert!(json.contains("\"kind\":\"number\""));
        assert!(json.contains("\"op\":\"in_range\""));
        let back: FilterSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, spec);
    }

    #[test]
    fn cost_model_ranks_fuzzy_above_equality() {
        let eq = FilterSpec::Text(TextFilter::Equals("a".to_owned()));
        let fuzzy = FilterSpec::Text(TextFilter::Fuzzy {
            pattern: "a".to_owned(),
            threshold: 0.5,
        });
        let set = FilterSpec::Set(SetSelection::all());
        assert!(set.cost() < eq.cost());
        assert!(eq.cost() < fuzzy.cost());
    }
}
