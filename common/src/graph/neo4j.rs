use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::{query, BoltType, ConfigBuilder, Graph, Query};
use tracing::{debug, info};

use super::{value_to_text, Credentials, GraphParam, GraphQuery, GraphRow, GraphStore, QueryDialect};
use crate::error::AppError;

/// Cypher over Bolt, one pooled [`Graph`] per process.
pub struct Neo4jClient {
    graph: Graph,
}

impl Neo4jClient {
    /// Connects to `uri` (e.g. `127.0.0.1:7687`) and targets `database`.
    pub async fn new(
        uri: &str,
        database: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, AppError> {
        let (user, password) = credentials
            .map(|creds| (creds.username, creds.password.unwrap_or_default()))
            .unwrap_or_else(|| ("neo4j".to_string(), String::new()));

        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .build()?;
        let graph = Graph::connect(config).await?;
        info!(uri, database, "Connected to Neo4j");

        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphStore for Neo4jClient {
    fn dialect(&self) -> QueryDialect {
        QueryDialect::Cypher
    }

    async fn execute(&self, graph_query: &GraphQuery) -> Result<Vec<GraphRow>, AppError> {
        let mut stream = self.graph.execute(bolt_query(graph_query)).await?;

        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            let values: HashMap<String, serde_json::Value> = row
                .to()
                .map_err(|e| AppError::GraphQuery(format!("unreadable neo4j row: {e}")))?;
            rows.push(row_to_text(values));
        }

        debug!(rows = rows.len(), "Cypher query executed");
        Ok(rows)
    }
}

/// Driver query with every parameter bound.
fn bolt_query(graph_query: &GraphQuery) -> Query {
    graph_query
        .params
        .iter()
        .fold(query(&graph_query.text), |bolt, (name, value)| {
            bolt.param(name, bolt_value(value))
        })
}

fn bolt_value(value: &GraphParam) -> BoltType {
    match value {
        GraphParam::Text(text) => BoltType::from(text.as_str()),
        GraphParam::TextList(items) => BoltType::from(items.clone()),
        GraphParam::Integer(number) => BoltType::from(*number),
    }
}

/// Renders returned columns as text; nulls are dropped.
fn row_to_text(values: HashMap<String, serde_json::Value>) -> GraphRow {
    values
        .into_iter()
        .filter_map(|(column, value)| value_to_text(&value).map(|text| (column, text)))
        .collect()
}
