//! Read access to the knowledge graph.
//!
//! Two stores are supported: an RDF triple store queried with SPARQL over the
//! Fuseki HTTP protocol, and a labeled property graph queried with Cypher over
//! Bolt. Both are exposed through [`GraphStore`];
//! which one is used is chosen once, from [`GraphStoreKind`], by
//! [`build_graph_store`].

pub mod fuseki;
pub mod neo4j;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, utils::config::AppConfig};

pub use fuseki::FusekiClient;
pub use neo4j::Neo4jClient;

/// One result row: variable / column name to its value rendered as text.
pub type GraphRow = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStoreKind {
    Fuseki,
    Neo4j,
}

impl GraphStoreKind {
    pub const fn dialect(self) -> QueryDialect {
        match self {
            Self::Fuseki => QueryDialect::Sparql,
            Self::Neo4j => QueryDialect::Cypher,
        }
    }
}

impl fmt::Display for GraphStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fuseki => f.write_str("fuseki"),
            Self::Neo4j => f.write_str("neo4j"),
        }
    }
}

/// Structured query language understood by a graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryDialect {
    Sparql,
    Cypher,
}

impl fmt::Display for QueryDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sparql => f.write_str("sparql"),
            Self::Cypher => f.write_str("cypher"),
        }
    }
}

/// Value bound to a named query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphParam {
    Text(String),
    TextList(Vec<String>),
    Integer(i64),
}

impl From<&str> for GraphParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for GraphParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for GraphParam {
    fn from(value: Vec<String>) -> Self {
        Self::TextList(value)
    }
}

impl From<i64> for GraphParam {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Query text plus the parameters it references (`$name` in Cypher).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphQuery {
    pub text: String,
    pub params: Vec<(String, GraphParam)>,
}

impl GraphQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, name: &str, value: impl Into<GraphParam>) -> Self {
        self.params.push((name.to_string(), value.into()));
        self
    }

    pub fn param_value(&self, name: &str) -> Option<&GraphParam> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

impl From<String> for GraphQuery {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn dialect(&self) -> QueryDialect;

    /// Runs a read-only query and returns its bindings.
    async fn execute(&self, query: &GraphQuery) -> Result<Vec<GraphRow>, AppError>;
}

/// Builds the graph store selected in configuration. Neo4j connects eagerly.
pub async fn build_graph_store(config: &AppConfig) -> Result<Arc<dyn GraphStore>, AppError> {
    let store: Arc<dyn GraphStore> = match config.graph_store {
        GraphStoreKind::Fuseki => {
            let timeout = Duration::from_millis(config.graph_http_timeout_ms);
            let http = reqwest::Client::builder().timeout(timeout).build()?;
            Arc::new(FusekiClient::new(
                http,
                config.fuseki_endpoint.clone(),
                credentials(config.fuseki_username.as_ref(), config.fuseki_password.as_ref()),
            ))
        }
        GraphStoreKind::Neo4j => Arc::new(
            Neo4jClient::new(
                &config.neo4j_uri,
                &config.neo4j_database,
                credentials(config.neo4j_username.as_ref(), config.neo4j_password.as_ref()),
            )
            .await?,
        ),
    };

    Ok(store)
}

/// Basic-auth pair, present only when a username is configured.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

fn credentials(username: Option<&String>, password: Option<&String>) -> Option<Credentials> {
    username.map(|username| Credentials {
        username: username.clone(),
        password: password.cloned(),
    })
}

/// Renders a JSON value the way rows expose it: strings verbatim, scalars via `to_string`.
pub(crate) fn value_to_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Bool(flag) => Some(flag.to_string()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_to_dialect() {
        assert_eq!(GraphStoreKind::Fuseki.dialect(), QueryDialect::Sparql);
        assert_eq!(GraphStoreKind::Neo4j.dialect(), QueryDialect::Cypher);
    }

    #[test]
    fn test_kind_deserializes_lowercase() {
        let kind: GraphStoreKind = serde_json::from_str("\"neo4j\"").expect("valid kind");
        assert_eq!(kind, GraphStoreKind::Neo4j);
        assert!(serde_json::from_str::<GraphStoreKind>("\"janus\"").is_err());
    }

    #[test]
    fn test_query_params_are_looked_up_by_name() {
        let query = GraphQuery::new("MATCH (a) WHERE a.name IN $names RETURN a LIMIT $limit")
            .param("names", vec!["curie".to_string()])
            .param("limit", 5_i64);

        assert_eq!(query.params.len(), 2);
        assert_eq!(
            query.param_value("names"),
            Some(&GraphParam::TextList(vec!["curie".to_string()]))
        );
        assert_eq!(query.param_value("limit"), Some(&GraphParam::Integer(5)));
        assert!(query.param_value("missing").is_none());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&serde_json::json!("a")), Some("a".to_string()));
        assert_eq!(value_to_text(&serde_json::json!(2)), Some("2".to_string()));
        assert_eq!(value_to_text(&serde_json::Value::Null), None);
    }
}
