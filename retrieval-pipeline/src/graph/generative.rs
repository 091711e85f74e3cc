use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    graph::{GraphQuery, GraphStore, QueryDialect},
    utils::llm::{complete_with_timeout, CompletionRequest, LanguageModel},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    collect_rows,
    schema::{schema_description, sparql_prefixes},
    GraphBackend, GraphQueryResult, GraphRequest,
};
use crate::{pipeline::GraphStrategy, query_analysis::strip_code_fence};

static SYSTEM_PROMPT: &str = "You translate questions about a knowledge graph into one read-only graph query. \
Only use the schema you are given. Never modify data. Reply with JSON containing the query and a one-sentence rationale.";

const SPARQL_WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "DELETE", "LOAD", "CLEAR", "DROP", "CREATE", "COPY", "MOVE", "ADD",
];
const CYPHER_WRITE_KEYWORDS: &[&str] = &[
    "CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP", "FOREACH",
];

#[derive(Debug, Deserialize)]
struct GeneratedQuery {
    query: String,
    #[serde(default)]
    rationale: String,
}

/// Asks the language model for a query and runs it over the whole graph.
pub struct GenerativeBackend<'a> {
    store: &'a dyn GraphStore,
    llm: &'a dyn LanguageModel,
    llm_timeout: Duration,
}

impl<'a> GenerativeBackend<'a> {
    pub fn new(store: &'a dyn GraphStore, llm: &'a dyn LanguageModel, llm_timeout: Duration) -> Self {
        Self {
            store,
            llm,
            llm_timeout,
        }
    }

    async fn generate(&self, request: &GraphRequest<'_>) -> Result<GeneratedQuery, AppError> {
        let prompt = build_prompt(self.store.dialect(), request);
        let reply = complete_with_timeout(self.llm, &prompt, self.llm_timeout).await?;
        let generated: GeneratedQuery = serde_json::from_str(strip_code_fence(&reply))
            .map_err(|e| AppError::LLMParsing(format!("generated query is not valid JSON: {e}")))?;
        if generated.query.trim().is_empty() {
            return Err(AppError::LLMParsing("generated query is empty".into()));
        }
        Ok(generated)
    }
}

#[async_trait]
impl GraphBackend for GenerativeBackend<'_> {
    fn strategy(&self) -> GraphStrategy {
        GraphStrategy::Generative
    }

    #[instrument(level = "trace", skip_all)]
    async fn query(&self, request: &GraphRequest<'_>) -> Result<GraphQueryResult, AppError> {
        let dialect = self.store.dialect();
        let generated = self.generate(request).await?;
        reject_writes(&generated.query, dialect)?;

        let query = match dialect {
            QueryDialect::Sparql => wrap_sparql(&generated.query, request.chunk_limit)?,
            QueryDialect::Cypher => wrap_cypher(&generated.query, request.chunk_limit),
        };
        debug!(%dialect, rationale = %generated.rationale, "Running generated graph query");

        let rows = self.store.execute(&GraphQuery::new(query.as_str())).await?;
        let (chunk_ids, triples) = collect_rows(
            &rows,
            request.max_hops,
            1,
            request.chunk_limit,
            request.triple_limit,
        );

        Ok(GraphQueryResult {
            chunk_ids,
            triples,
            raw_query: query,
        })
    }
}

fn generation_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" },
            "rationale": { "type": "string" }
        },
        "required": ["query", "rationale"],
        "additionalProperties": false
    })
}

fn build_prompt(dialect: QueryDialect, request: &GraphRequest<'_>) -> CompletionRequest {
    let hints = if request.entities.is_empty() {
        "none".to_string()
    } else {
        request.entities.join(", ")
    };
    let inverse_hint = match dialect {
        QueryDialect::Sparql => {
            "Relations may be stored under their inverse name and in either direction. \
             Express both in one pattern with alternation, e.g. (kg:teacherOf|^kg:studentOf)."
        }
        QueryDialect::Cypher => {
            "Relations may be stored under their inverse name and in either direction. \
             Express both in one pattern with an undirected alternation, e.g. -[:TEACHER_OF|STUDENT_OF]-."
        }
    };

    let user = format!(
        "Schema:\n{schema}\n\n\
         Question: {question}\n\
         Entity hints: {hints}\n\
         Follow at most {hops} relation steps from the named entities.\n\
         {inverse_hint}",
        schema = schema_description(dialect),
        question = request.query_text,
        hops = request.max_hops,
    );

    CompletionRequest::new(SYSTEM_PROMPT, user).with_schema(
        "graph_query",
        "A read-only graph query answering the question",
        generation_schema(),
    )
}

/// Upper-cased words of the query outside string literals. SPARQL IRIs and
/// `?var`/`$var` names are skipped too.
fn bare_words(query: &str, dialect: QueryDialect) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut iri_end: Option<usize> = None;
    let mut in_variable = false;

    for (index, c) in query.char_indices() {
        if let Some(end) = iri_end {
            if index <= end {
                continue;
            }
            iri_end = None;
        }
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == open {
                quote = None;
            }
            continue;
        }

        if c.is_alphanumeric() || c == '_' {
            if !in_variable {
                current.push(c.to_ascii_uppercase());
            }
            continue;
        }
        in_variable = false;
        if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '<' if dialect == QueryDialect::Sparql => iri_end = iri_close(query, index),
            '?' | '$' => in_variable = true,
            _ => {}
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Offset of the `>` closing an IRI opened at `open`, if the text there is an IRI.
fn iri_close(query: &str, open: usize) -> Option<usize> {
    let rest = &query[open + 1..];
    let end = rest.find(|c: char| c == '>' || c.is_whitespace())?;
    (rest[end..].starts_with('>') && end > 0).then_some(open + 1 + end)
}

fn reject_writes(query: &str, dialect: QueryDialect) -> Result<(), AppError> {
    let forbidden = match dialect {
        QueryDialect::Sparql => SPARQL_WRITE_KEYWORDS,
        QueryDialect::Cypher => CYPHER_WRITE_KEYWORDS,
    };
    match bare_words(query, dialect)
        .into_iter()
        .find(|word| forbidden.contains(&word.as_str()))
    {
        Some(word) => Err(AppError::Validation(format!(
            "generated query contains write keyword {word}"
        ))),
        None => Ok(()),
    }
}

fn has_keyword(query: &str, keyword: &str, dialect: QueryDialect) -> bool {
    bare_words(query, dialect).iter().any(|word| word == keyword)
}

/// Byte offsets of the first `{` and its matching `}`, skipping string literals.
fn outer_braces(query: &str) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut open = None;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (index, c) in query.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => {
                if depth == 0 && open.is_none() {
                    open = Some(index);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return open.map(|start| (start, index));
                }
            }
            _ => {}
        }
    }
    None
}

/// Injects missing prefixes, widens the pattern to the default graph and every
/// named graph, and caps the result size.
pub fn wrap_sparql(query: &str, limit: usize) -> Result<String, AppError> {
    let query = query.trim();
    let (open, close) = outer_braces(query).ok_or_else(|| {
        AppError::LLMParsing("generated SPARQL has no group graph pattern".into())
    })?;

    let upper = query.to_uppercase();
    let mut wrapped = String::new();
    for (prefix, iri) in sparql_prefixes() {
        if !upper.contains(&format!("PREFIX {}:", prefix.to_uppercase())) {
            wrapped.push_str(&format!("PREFIX {prefix}: <{iri}>\n"));
        }
    }

    let body = query[open + 1..close].trim();
    wrapped.push_str(&query[..open]);
    if has_keyword(body, "GRAPH", QueryDialect::Sparql) {
        wrapped.push_str(&query[open..=close]);
    } else {
        wrapped.push_str(&format!(
            "{{\n  {{ {body} }}\n  UNION\n  {{ GRAPH ?g {{ {body} }} }}\n}}"
        ));
    }

    let tail = query[close + 1..].trim_end().trim_end_matches(';');
    wrapped.push_str(tail);
    if !has_keyword(tail, "LIMIT", QueryDialect::Sparql) {
        wrapped.push_str(&format!("\nLIMIT {limit}"));
    }
    Ok(wrapped)
}

pub fn wrap_cypher(query: &str, limit: usize) -> String {
    let trimmed = query.trim().trim_end_matches(';').trim_end();
    if has_keyword(trimmed, "LIMIT", QueryDialect::Cypher) {
        trimmed.to_string()
    } else {
        format!("{trimmed}\nLIMIT {limit}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::graph::{
        test_support::{row, RecordingStore, ScriptedLlm},
        GraphSearcher, TemplatedBackend,
    };

    fn request<'q>(entities: &'q [String], keywords: &'q BTreeSet<String>) -> GraphRequest<'q> {
        GraphRequest {
            entities,
            keywords,
            max_hops: 2,
            query_text: "Who taught Marie Curie?",
            chunk_limit: 20,
            triple_limit: 5,
        }
    }

    #[test]
    fn test_wrap_sparql_widens_scope_and_injects_prefixes() {
        let generated = "PREFIX kg: <http://kg.local/schema#>\n\
                         SELECT ?chunk WHERE { ?e rdfs:label \"Marie Curie\" . ?e kg:mentionedIn ?chunk }";
        let wrapped = wrap_sparql(generated, 15).expect("wrap");

        assert_eq!(wrapped.matches("PREFIX kg:").count(), 1);
        assert!(wrapped.contains("PREFIX rdfs:"));
        assert!(wrapped.contains("UNION\n  { GRAPH ?g {"));
        assert!(wrapped.ends_with("LIMIT 15"));
    }

    #[test]
    fn test_wrap_sparql_keeps_existing_limit_and_graph() {
        let generated = "SELECT ?chunk WHERE { GRAPH ?g { ?e kg:mentionedIn ?chunk } } LIMIT 3";
        let wrapped = wrap_sparql(generated, 15).expect("wrap");
        assert!(!wrapped.contains("UNION"));
        assert!(wrapped.ends_with("LIMIT 3"));
        assert!(wrap_sparql("SELECT ?chunk", 5).is_err());
    }

    #[test]
    fn test_wrap_cypher_appends_limit() {
        assert_eq!(
            wrap_cypher("MATCH (c:Chunk) RETURN c.chunk_id AS chunk;", 10),
            "MATCH (c:Chunk) RETURN c.chunk_id AS chunk\nLIMIT 10"
        );
        assert!(wrap_cypher("MATCH (c) RETURN c LIMIT 2", 10).ends_with("LIMIT 2"));
    }

    #[test]
    fn test_write_keywords_rejected_outside_literals() {
        assert!(reject_writes("MATCH (n) DETACH DELETE n", QueryDialect::Cypher).is_err());
        assert!(reject_writes(
            "MATCH (e:Entity) WHERE e.name = 'Create Labs' RETURN e",
            QueryDialect::Cypher
        )
        .is_ok());
        assert!(reject_writes("INSERT DATA { <a> <b> <c> }", QueryDialect::Sparql).is_err());
        assert!(reject_writes(
            "SELECT ?c WHERE { ?e <http://x/add> ?c }",
            QueryDialect::Sparql
        )
        .is_ok());
    }

    #[test]
    fn test_variables_named_like_write_keywords_are_allowed() {
        assert!(reject_writes(
            "SELECT ?add ?move ?chunk WHERE { ?add kg:mentionedIn ?chunk . ?move rdfs:label ?copy }",
            QueryDialect::Sparql
        )
        .is_ok());
        assert!(reject_writes(
            "MATCH (e:Entity) WHERE e.name = $set RETURN e.name AS create",
            QueryDialect::Cypher
        )
        .is_err());
        assert!(reject_writes("MATCH (e:Entity) WHERE e.name IN $remove RETURN e", QueryDialect::Cypher).is_ok());
        assert!(reject_writes("SELECT ?c WHERE { ?c ?p ?o } ; ADD <a> TO <b>", QueryDialect::Sparql).is_err());
    }

    #[tokio::test]
    async fn test_generated_query_is_executed() {
        let store = RecordingStore::new(QueryDialect::Cypher, |_query| {
            Ok(vec![row(&[("chunk", "c7"), ("hop", "1")])])
        });
        let llm = ScriptedLlm(Ok(
            r#"{"query": "MATCH (e:Entity)-[:MENTIONED_IN]->(c:Chunk) RETURN c.chunk_id AS chunk", "rationale": "direct"}"#
                .to_string(),
        ));
        let backend = GenerativeBackend::new(&store, &llm, Duration::from_secs(1));
        let entities = vec!["Marie Curie".to_string()];
        let keywords = BTreeSet::new();

        let result = backend.query(&request(&entities, &keywords)).await.expect("query");
        assert_eq!(result.chunk_ids, vec![("c7".to_string(), 1)]);
        assert!(result.raw_query.ends_with("LIMIT 20"));
    }

    #[tokio::test]
    async fn test_generation_failure_falls_through_to_templated() {
        let store = RecordingStore::new(QueryDialect::Sparql, |query| {
            if query.contains("GROUP BY ?chunk") {
                Ok(vec![row(&[("chunk", "c1"), ("hop", "1")])])
            } else {
                Ok(Vec::new())
            }
        });
        let llm = ScriptedLlm(Ok("not json at all".to_string()));
        let generative = GenerativeBackend::new(&store, &llm, Duration::from_secs(1));
        let templated = TemplatedBackend::new(&store);
        let searcher = GraphSearcher::new(vec![&generative, &templated]);
        let entities = vec!["Marie Curie".to_string()];
        let keywords = BTreeSet::new();

        let outcome = searcher.search(&request(&entities, &keywords)).await;
        assert_eq!(outcome.strategy, Some(GraphStrategy::Templated));
        assert_eq!(outcome.result.chunk_ids, vec![("c1".to_string(), 1)]);
        assert!(outcome.attempts[0].error.is_some());
    }

    #[tokio::test]
    async fn test_empty_generated_query_is_an_error() {
        let store = RecordingStore::new(QueryDialect::Sparql, |_query| Ok(Vec::new()));
        let llm = ScriptedLlm(Ok(r#"{"query": "  ", "rationale": ""}"#.to_string()));
        let backend = GenerativeBackend::new(&store, &llm, Duration::from_secs(1));
        let entities = vec!["Curie".to_string()];
        let keywords = BTreeSet::new();

        assert!(backend.query(&request(&entities, &keywords)).await.is_err());
        assert!(store.queries().is_empty());
    }
}
