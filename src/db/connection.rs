//! Physical connection abstraction.
//!
//! The pool, executor, validator and readiness gate only talk to the database
//! through these traits. [`PgConnector`](super::PgConnector) is the production
//! implementation.

use crate::error::DbResult;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::future::Future;

/// One decoded result row, keyed by column name.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arbitrary JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

/// How much of the result the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Every row.
    #[default]
    All,
    /// Exactly one row; no rows is an error.
    One,
    /// At most one row.
    Optional,
    /// First column of the first row.
    Scalar,
    /// No rows, only the affected-row count.
    None,
}

/// Result of running one statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    Rows(Vec<JsonRow>),
    Row(Option<JsonRow>),
    Scalar(Option<JsonValue>),
    Affected(u64),
}

impl QueryOutput {
    /// Collapse the output into a list of rows.
    pub fn into_rows(self) -> Vec<JsonRow> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Row(row) => row.into_iter().collect(),
            QueryOutput::Scalar(_) | QueryOutput::Affected(_) => Vec::new(),
        }
    }

    pub fn scalar(&self) -> Option<&JsonValue> {
        match self {
            QueryOutput::Scalar(value) => value.as_ref(),
            _ => None,
        }
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            QueryOutput::Affected(n) => Some(*n),
            _ => None,
        }
    }
}

/// One physical session to the database.
pub trait Connection: Send + 'static {
    /// Minimal round trip proving the session still works.
    fn ping(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Abandon any open transaction, including one left aborted by a failed statement.
    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Run a single statement.
    fn run(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        fetch: FetchMode,
    ) -> impl Future<Output = DbResult<QueryOutput>> + Send;

    /// Close the session.
    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;
}

/// Opens physical connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Human-readable target for logs. Must not contain secrets.
    fn target(&self) -> String {
        "database".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_deserialize_untagged() {
        let params: Vec<QueryParam> =
            serde_json::from_value(json!([null, true, 42, 1.5, "text", {"a": 1}])).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(42),
                QueryParam::Float(1.5),
                QueryParam::String("text".to_string()),
                QueryParam::Json(json!({"a": 1})),
            ]
        );
    }

    #[test]
    fn test_query_param_type_name() {
        assert_eq!(QueryParam::Null.type_name(), "null");
        assert_eq!(QueryParam::Json(json!([])).type_name(), "json");
    }

    #[test]
    fn test_query_output_into_rows() {
        let mut row = JsonRow::new();
        row.insert("id".to_string(), json!(1));

        assert_eq!(QueryOutput::Row(Some(row.clone())).into_rows(), vec![row.clone()]);
        assert!(QueryOutput::Row(None).into_rows().is_empty());
        assert_eq!(QueryOutput::Rows(vec![row.clone()]).into_rows().len(), 1);
        assert!(QueryOutput::Affected(3).into_rows().is_empty());
    }

    #[test]
    fn test_query_output_accessors() {
        assert_eq!(QueryOutput::Scalar(Some(json!(1))).scalar(), Some(&json!(1)));
        assert_eq!(QueryOutput::Affected(7).rows_affected(), Some(7));
        assert_eq!(QueryOutput::Rows(Vec::new()).rows_affected(), None);
    }
}
