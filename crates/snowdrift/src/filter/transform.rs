//! Per-batch transforms.

use indexmap::IndexMap;

use super::RecordFilter;
use crate::config::FilterConfig;
use crate::decode::{Batch, Record};
use crate::error::{ConfigError, TransformError};

/// A stage applied to every batch between decoding and output.
pub trait Transform: Send {
    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError>;

    /// Records to emit once the input is exhausted.
    fn finish(&mut self) -> Result<Batch, TransformError> {
        Ok(Vec::new())
    }
}

/// Forwards batches untouched.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        Ok(batch)
    }
}

/// Keeps records that satisfy a predicate.
#[derive(Debug)]
pub struct FilterTransform {
    filter: RecordFilter,
}

impl FilterTransform {
    pub fn new(filter: RecordFilter) -> Self {
        Self { filter }
    }
}

impl Transform for FilterTransform {
    fn apply(&mut self, mut batch: Batch) -> Result<Batch, TransformError> {
        batch.retain(|record| self.filter.matches(record));
        Ok(batch)
    }
}

/// Keeps the named columns, in the given order.
///
/// Lines pass through unchanged since they have a single column.
#[derive(Debug)]
pub struct Project {
    columns: Vec<String>,
}

impl Project {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    fn project(&self, record: Record) -> Result<Record, TransformError> {
        match record {
            Record::Line(_) => Ok(record),
            Record::Fields(mut fields) => Ok(Record::Fields(
                self.columns
                    .iter()
                    .filter_map(|c| fields.swap_remove(c).map(|v| (c.clone(), v)))
                    .collect(),
            )),
            Record::Value(serde_json::Value::Object(mut object)) => {
                let picked: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .filter_map(|c| object.remove(c).map(|v| (c.clone(), v)))
                    .collect();
                Ok(Record::Value(serde_json::Value::Object(picked)))
            }
            other => Err(TransformError::NotProjectable { kind: other.kind() }),
        }
    }
}

impl Transform for Project {
    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        batch.into_iter().map(|r| self.project(r)).collect()
    }
}

/// Swallows records and emits a single `records` count at the end.
#[derive(Debug, Default)]
pub struct CountSummary {
    count: u64,
}

impl Transform for CountSummary {
    fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        self.count += batch.len() as u64;
        Ok(Vec::new())
    }

    fn finish(&mut self) -> Result<Batch, TransformError> {
        let summary = IndexMap::from([("records".to_string(), self.count.to_string())]);
        Ok(vec![Record::Fields(summary)])
    }
}

/// Transforms applied in order.
pub struct TransformChain {
    stages: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new(stages: Vec<Box<dyn Transform>>) -> Self {
        Self { stages }
    }

    pub fn passthrough() -> Self {
        Self::new(vec![Box::new(Passthrough)])
    }

    /// Build `filter -> project -> count` from config, skipping unset parts.
    pub fn from_config(config: &FilterConfig) -> Result<Self, ConfigError> {
        if config.is_passthrough() {
            return Ok(Self::passthrough());
        }

        let mut stages: Vec<Box<dyn Transform>> = Vec::new();
        if let Some(filter) = RecordFilter::from_config(config)? {
            stages.push(Box::new(FilterTransform::new(filter)));
        }
        if !config.select.is_empty() {
            stages.push(Box::new(Project::new(config.select.clone())));
        }
        if config.count {
            stages.push(Box::new(CountSummary::default()));
        }
        Ok(Self::new(stages))
    }

    pub fn apply(&mut self, batch: Batch) -> Result<Batch, TransformError> {
        self.run_from(0, batch)
    }

    /// Flush every stage; a stage's trailing records pass through the
    /// stages after it.
    pub fn finish(&mut self) -> Result<Batch, TransformError> {
        let mut out = Vec::new();
        for index in 0..self.stages.len() {
            let tail = self.stages[index].finish()?;
            if !tail.is_empty() {
                out.extend(self.run_from(index + 1, tail)?);
            }
        }
        Ok(out)
    }

    fn run_from(&mut self, start: usize, mut batch: Batch) -> Result<Batch, TransformError> {
        for stage in &mut self.stages[start..] {
            if batch.is_empty() {
                break;
            }
            batch = stage.apply(batch)?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConditionConfig, OperatorConfig};
    use serde_json::json;

    fn row(key: &str, size: &str) -> Record {
        Record::Fields(IndexMap::from([
            ("bucket".to_string(), "exports".to_string()),
            ("key".to_string(), key.to_string()),
            ("size".to_string(), size.to_string()),
        ]))
    }

    #[test]
    fn test_chain_filters_and_projects() {
        let config = FilterConfig {
            conditions: vec![ConditionConfig {
                column: "key".into(),
                op: OperatorConfig::StartsWith {
                    value: "logs/".into(),
                },
            }],
            select: vec!["size".into(), "key".into()],
            ..Default::default()
        };
        let mut chain = TransformChain::from_config(&config).unwrap();

        let out = chain
            .apply(vec![row("logs/a", "10"), row("data/b", "20"), row("logs/c", "30")])
            .unwrap();

        assert_eq!(out.len(), 2);
        match &out[0] {
            Record::Fields(fields) => {
                assert_eq!(fields.keys().collect::<Vec<_>>(), ["size", "key"]);
                assert_eq!(fields["key"], "logs/a");
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert!(chain.finish().unwrap().is_empty());
    }

    #[test]
    fn test_count_summary_after_filter() {
        let config = FilterConfig {
            conditions: vec![ConditionConfig {
                column: "size".into(),
                op: OperatorConfig::Range {
                    min: Some("15".into()),
                    max: None,
                },
            }],
            count: true,
            ..Default::default()
        };
        let mut chain = TransformChain::from_config(&config).unwrap();

        assert!(chain.apply(vec![row("a", "10"), row("b", "20")]).unwrap().is_empty());
        assert!(chain.apply(vec![row("c", "30")]).unwrap().is_empty());

        let summary = chain.finish().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].get("records").as_deref(), Some("2"));
    }

    #[test]
    fn test_project_json_objects_and_rejects_scalars() {
        let mut project = Project::new(vec!["key".into()]);
        let out = project
            .apply(vec![Record::Value(json!({"key": "a", "size": 1}))])
            .unwrap();
        assert_eq!(out, vec![Record::Value(json!({"key": "a"}))]);

        let err = project.apply(vec![Record::Value(json!(42))]).unwrap_err();
        assert!(matches!(err, TransformError::NotProjectable { kind: "scalar" }));
    }

    #[test]
    fn test_passthrough_chain() {
        let mut chain = TransformChain::from_config(&FilterConfig::default()).unwrap();
        let batch = vec![Record::from("a"), Record::from("b")];
        assert_eq!(chain.apply(batch.clone()).unwrap(), batch);
    }
}
