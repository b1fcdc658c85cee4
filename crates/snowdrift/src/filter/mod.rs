//! Record predicates and the per-batch transform chain.
//!
//! Operators form a closed enum and are evaluated by `match`. A condition on
//! a column that a record does not have is false for every operator.

mod transform;

pub use transform::{CountSummary, FilterTransform, Passthrough, Project, Transform, TransformChain};

use std::cmp::Ordering;

use regex::Regex;
use snafu::prelude::*;

use crate::config::{ConditionConfig, FilterConfig, MatchMode, OperatorConfig};
use crate::decode::Record;
use snowdrift_core::error::{ConfigError, InvalidPatternSnafu};

/// A compiled comparison.
#[derive(Debug, Clone)]
pub enum Operator {
    Eq(String),
    Neq(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    In(Vec<String>),
    /// Inclusive bounds, numeric when both sides parse as numbers.
    Range {
        min: Option<String>,
        max: Option<String>,
    },
    Matches(Regex),
    Exists,
}

impl Operator {
    pub fn compile(config: &OperatorConfig) -> Result<Self, ConfigError> {
        Ok(match config {
            OperatorConfig::Eq { value } => Operator::Eq(value.clone()),
            OperatorConfig::Neq { value } => Operator::Neq(value.clone()),
            OperatorConfig::Contains { value } => Operator::Contains(value.clone()),
            OperatorConfig::StartsWith { value } => Operator::StartsWith(value.clone()),
            OperatorConfig::EndsWith { value } => Operator::EndsWith(value.clone()),
            OperatorConfig::In { values } => Operator::In(values.clone()),
            OperatorConfig::Range { min, max } => Operator::Range {
                min: min.clone(),
                max: max.clone(),
            },
            OperatorConfig::Matches { pattern } => Operator::Matches(
                Regex::new(pattern).context(InvalidPatternSnafu {
                    pattern: pattern.clone(),
                })?,
            ),
            OperatorConfig::Exists => Operator::Exists,
        })
    }

    /// Evaluate against a column value, `None` when the column is absent.
    pub fn eval(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Operator::Eq(expected) => value == expected,
            Operator::Neq(expected) => value != expected,
            Operator::Contains(needle) => value.contains(needle.as_str()),
            Operator::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            Operator::EndsWith(suffix) => value.ends_with(suffix.as_str()),
            Operator::In(values) => values.iter().any(|v| v == value),
            Operator::Range { min, max } => {
                let above = min
                    .as_deref()
                    .is_none_or(|min| compare(value, min) != Ordering::Less);
                let below = max
                    .as_deref()
                    .is_none_or(|max| compare(value, max) != Ordering::Greater);
                above && below
            }
            Operator::Matches(regex) => regex.is_match(value),
            Operator::Exists => true,
        }
    }
}

fn compare(value: &str, bound: &str) -> Ordering {
    match (value.trim().parse::<f64>(), bound.trim().parse::<f64>()) {
        (Ok(v), Ok(b)) => v.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => value.cmp(bound),
    }
}

/// `column <op>`.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub op: Operator,
}

impl Condition {
    pub fn compile(config: &ConditionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            column: config.column.clone(),
            op: Operator::compile(&config.op)?,
        })
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.op.eval(record.get(&self.column).as_deref())
    }
}

/// A set of conditions combined with `all` or `any`.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    conditions: Vec<Condition>,
    mode: MatchMode,
}

impl RecordFilter {
    pub fn new(conditions: Vec<Condition>, mode: MatchMode) -> Self {
        Self { conditions, mode }
    }

    /// Compile the conditions of a filter config. Returns `None` when there
    /// are no conditions.
    pub fn from_config(config: &FilterConfig) -> Result<Option<Self>, ConfigError> {
        if config.conditions.is_empty() {
            return Ok(None);
        }
        let conditions = config
            .conditions
            .iter()
            .map(Condition::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Self::new(conditions, config.mode)))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self.mode {
            MatchMode::All => self.conditions.iter().all(|c| c.matches(record)),
            MatchMode::Any => self.conditions.iter().any(|c| c.matches(record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::LINE_COLUMN;
    use indexmap::IndexMap;

    fn fields(pairs: &[(&str, &str)]) -> Record {
        Record::Fields(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<IndexMap<_, _>>(),
        )
    }

    fn cond(column: &str, op: Operator) -> Condition {
        Condition {
            column: column.to_string(),
            op,
        }
    }

    #[test]
    fn test_string_operators() {
        let record = fields(&[("key", "logs/2024/app.log"), ("class", "STANDARD")]);

        assert!(cond("key", Operator::StartsWith("logs/".into())).matches(&record));
        assert!(cond("key", Operator::EndsWith(".log".into())).matches(&record));
        assert!(cond("key", Operator::Contains("2024".into())).matches(&record));
        assert!(cond("class", Operator::Eq("STANDARD".into())).matches(&record));
        assert!(!cond("class", Operator::Neq("STANDARD".into())).matches(&record));
        assert!(
            cond(
                "class",
                Operator::In(vec!["GLACIER".into(), "STANDARD".into()])
            )
            .matches(&record)
        );
        assert!(cond("key", Operator::Matches(Regex::new(r"\d{4}").unwrap())).matches(&record));
    }

    #[test]
    fn test_missing_column_never_matches() {
        let record = fields(&[("key", "a")]);
        assert!(!cond("size", Operator::Exists).matches(&record));
        assert!(!cond("size", Operator::Neq("1".into())).matches(&record));
        assert!(cond("key", Operator::Exists).matches(&record));
    }

    #[test]
    fn test_range_is_numeric_when_possible() {
        let range = Operator::Range {
            min: Some("100".into()),
            max: Some("2000".into()),
        };
        assert!(range.eval(Some("150")));
        assert!(range.eval(Some("2000")));
        // Lexicographically "99" > "2000", numerically it is below the range.
        assert!(!range.eval(Some("99")));

        let dates = Operator::Range {
            min: Some("2024-01-01".into()),
            max: None,
        };
        assert!(dates.eval(Some("2024-03-15")));
        assert!(!dates.eval(Some("2023-12-31")));
    }

    #[test]
    fn test_match_modes() {
        let record = Record::from("error: disk full");
        let conditions = vec![
            cond(LINE_COLUMN, Operator::StartsWith("error".into())),
            cond(LINE_COLUMN, Operator::Contains("network".into())),
        ];

        assert!(!RecordFilter::new(conditions.clone(), MatchMode::All).matches(&record));
        assert!(RecordFilter::new(conditions, MatchMode::Any).matches(&record));
    }

    #[test]
    fn test_bad_pattern_names_the_pattern() {
        let config = OperatorConfig::Matches {
            pattern: "(unclosed".into(),
        };
        match Operator::compile(&config) {
            Err(ConfigError::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "(unclosed"),
            other => panic!("expected invalid pattern, got {other:?}"),
        }
    }

    #[test]
    fn test_from_config_without_conditions() {
        assert!(
            RecordFilter::from_config(&FilterConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
