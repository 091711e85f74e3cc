use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{value_to_text, Credentials, GraphQuery, GraphRow, GraphStore, QueryDialect};
use crate::error::AppError;

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// SPARQL 1.1 protocol client for an Apache Jena Fuseki dataset.
pub struct FusekiClient {
    http: reqwest::Client,
    endpoint: String,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<HashMap<String, SparqlTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlTerm {
    value: serde_json::Value,
}

impl FusekiClient {
    pub fn new(http: reqwest::Client, endpoint: String, credentials: Option<Credentials>) -> Self {
        Self {
            http,
            endpoint,
            credentials,
        }
    }
}

#[async_trait]
impl GraphStore for FusekiClient {
    fn dialect(&self) -> QueryDialect {
        QueryDialect::Sparql
    }

    async fn execute(&self, query: &GraphQuery) -> Result<Vec<GraphRow>, AppError> {
        if !query.params.is_empty() {
            return Err(AppError::GraphQuery(
                "SPARQL queries take inline literals, not bound parameters".into(),
            ));
        }

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[("query", query.text.as_str())]);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, creds.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::GraphQuery(format!(
                "fuseki returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let rows = parse_sparql_results(&body)?;
        debug!(rows = rows.len(), "SPARQL query executed");
        Ok(rows)
    }
}

/// Flattens a `application/sparql-results+json` document into rows.
pub fn parse_sparql_results(body: &str) -> Result<Vec<GraphRow>, AppError> {
    let response: SparqlResponse = serde_json::from_str(body)
        .map_err(|e| AppError::GraphQuery(format!("malformed SPARQL results: {e}")))?;

    Ok(response
        .results
        .bindings
        .into_iter()
        .map(|binding| {
            binding
                .into_iter()
                .filter_map(|(name, term)| value_to_text(&term.value).map(|text| (name, text)))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sparql_results() {
        let body = r#"{
            "head": {"vars": ["chunk", "hop"]},
            "results": {"bindings": [
                {"chunk": {"type": "literal", "value": "c1"},
                 "hop": {"type": "literal", "datatype": "http://www.w3.org/2001/XMLSchema#integer", "value": "0"}},
                {"chunk": {"type": "literal", "value": "c2"}}
            ]}
        }"#;

        let rows = parse_sparql_results(body).expect("valid results");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("chunk").map(String::as_str), Some("c1"));
        assert_eq!(rows[0].get("hop").map(String::as_str), Some("0"));
        assert!(rows[1].get("hop").is_none());
    }

    #[test]
    fn test_parse_sparql_results_rejects_garbage() {
        let err = parse_sparql_results("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, AppError::GraphQuery(_)));
    }

    #[tokio::test]
    async fn test_bound_parameters_are_rejected_before_sending() {
        let client = FusekiClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/kg/sparql".to_string(),
            None,
        );
        let query = GraphQuery::new("SELECT ?chunk WHERE { ?s ?p ?chunk }").param("name", "curie");

        let err = client.execute(&query).await.unwrap_err();
        assert!(matches!(err, AppError::GraphQuery(message) if message.contains("inline literals")));
    }

    #[test]
    fn test_empty_bindings() {
        let rows = parse_sparql_results(r#"{"head":{"vars":[]},"results":{"bindings":[]}}"#)
            .expect("valid results");
        assert!(rows.is_empty());
    }
}
