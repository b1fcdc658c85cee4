//! Records and batches flowing between pipeline stages.

use std::borrow::Cow;

use indexmap::IndexMap;

/// Pseudo-column that addresses the whole text of a [`Record::Line`].
pub const LINE_COLUMN: &str = "_line";

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// The raw text of a line.
    Line(String),
    /// Named fields from a delimited line, in column order.
    Fields(IndexMap<String, String>),
    /// An already-structured value.
    Value(serde_json::Value),
}

/// The unit of backpressure between stages.
pub type Batch = Vec<Record>;

impl Record {
    /// Look up a column. Lines expose only [`LINE_COLUMN`]; values expose
    /// their top-level keys, with non-string scalars rendered as JSON.
    pub fn get(&self, column: &str) -> Option<Cow<'_, str>> {
        match self {
            Record::Line(line) => (column == LINE_COLUMN).then_some(Cow::Borrowed(line.as_str())),
            Record::Fields(fields) => fields.get(column).map(|v| Cow::Borrowed(v.as_str())),
            Record::Value(value) => match value.get(column)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(Cow::Borrowed(s.as_str())),
                other => Some(Cow::Owned(other.to_string())),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Record::Line(_) => "line",
            Record::Fields(_) => "fields",
            Record::Value(serde_json::Value::Object(_)) => "object",
            Record::Value(_) => "scalar",
        }
    }
}

impl From<&str> for Record {
    fn from(line: &str) -> Self {
        Record::Line(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_lookup() {
        let line = Record::from("hello");
        assert_eq!(line.get(LINE_COLUMN).as_deref(), Some("hello"));
        assert_eq!(line.get("key"), None);

        let fields = Record::Fields(IndexMap::from([("key".to_string(), "a.txt".to_string())]));
        assert_eq!(fields.get("key").as_deref(), Some("a.txt"));

        let value = Record::Value(json!({"size": 42, "key": "b.txt", "gone": null}));
        assert_eq!(value.get("size").as_deref(), Some("42"));
        assert_eq!(value.get("key").as_deref(), Some("b.txt"));
        assert_eq!(value.get("gone"), None);
    }
}
