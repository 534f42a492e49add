//! Documents, filters, sort specifications and aggregate pipeline stages.

use core::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::r#trait::StoreError;

/// A stored document: field name -> primitive or nested value.
pub type Document = serde_json::Map<String, JsonValue>;

/// Field-equality filter. An empty filter matches every document.
///
/// A missing field compares equal to `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Document);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on a single field.
    pub fn by(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field).unwrap_or(&JsonValue::Null) == expected)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Multi-key sort specification. Empty means store order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort(Vec<(String, SortOrder)>);

impl Sort {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), SortOrder::Ascending)])
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self(vec![(field.into(), SortOrder::Descending)])
    }

    pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.0.push((field.into(), order));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[(String, SortOrder)] {
        &self.0
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, order) in &self.0 {
            let lhs = a.get(field).unwrap_or(&JsonValue::Null);
            let rhs = b.get(field).unwrap_or(&JsonValue::Null);
            let ord = compare_values(lhs, rhs);
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(_) => 1,
        JsonValue::Number(_) => 2,
        JsonValue::String(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Array(_), JsonValue::Array(_)) | (JsonValue::Object(_), JsonValue::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// One stage of an aggregate pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    Match(Filter),
    Sort(Sort),
    Skip(usize),
    Limit(usize),
    /// Replace the stream with a single `{field: count}` document.
    Count(String),
}

/// Evaluate a pipeline over an in-memory document stream.
pub fn run_pipeline(
    mut docs: Vec<Document>,
    stages: &[PipelineStage],
) -> Result<Vec<Document>, StoreError> {
    for stage in stages {
        docs = match stage {
            PipelineStage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            PipelineStage::Sort(sort) => {
                docs.sort_by(|a, b| sort.compare(a, b));
                docs
            }
            PipelineStage::Skip(n) => docs.into_iter().skip(*n).collect(),
            PipelineStage::Limit(n) => docs.into_iter().take(*n).collect(),
            PipelineStage::Count(field) => {
                if field.is_empty() {
                    return Err(StoreError::InvalidPipeline(
                        "count stage requires a field name".to_string(),
                    ));
                }
                let mut out = Document::new();
                out.insert(field.clone(), JsonValue::from(docs.len()));
                vec![out]
            }
        };
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn missing_fields_match_null() {
        let d = doc(json!({"_id": "1"}));
        assert!(Filter::by("parent_id", JsonValue::Null).matches(&d));
        assert!(!Filter::by("parent_id", "p1").matches(&d));
    }

    #[test]
    fn sort_orders_multiple_keys() {
        let mut docs = vec![
            doc(json!({"_id": "3", "rank": 1})),
            doc(json!({"_id": "1", "rank": 2})),
            doc(json!({"_id": "2", "rank": 1})),
        ];
        let sort = Sort::descending("rank").then("_id", SortOrder::Ascending);
        docs.sort_by(|a, b| sort.compare(a, b));
        let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("2"), json!("3")]);
    }

    #[test]
    fn pipeline_matches_sorts_and_limits() {
        let docs = vec![
            doc(json!({"_id": "b", "kind": "x"})),
            doc(json!({"_id": "a", "kind": "x"})),
            doc(json!({"_id": "c", "kind": "y"})),
        ];
        let out = run_pipeline(
            docs.clone(),
            &[
                PipelineStage::Match(Filter::by("kind", "x")),
                PipelineStage::Sort(Sort::descending("_id")),
                PipelineStage::Limit(1),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_id"], json!("b"));

        let counted = run_pipeline(docs, &[PipelineStage::Count("total".to_string())]).unwrap();
        assert_eq!(counted[0]["total"], json!(3));
    }

    #[test]
    fn count_without_field_is_rejected() {
        let err = run_pipeline(vec![], &[PipelineStage::Count(String::new())]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPipeline(_)));
    }
}
