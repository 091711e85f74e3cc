use async_trait::async_trait;
use common::{
    error::AppError,
    graph::{GraphQuery, GraphStore, QueryDialect},
};
use tracing::{debug, instrument, warn};

use super::{
    collect_rows,
    schema::{
        keyword_alternation, sparql_literal, sparql_prefix_block,
        MENTIONED_IN_PREDICATE, MENTIONED_IN_RELATIONSHIP,
    },
    GraphBackend, GraphQueryResult, GraphRequest,
};
use crate::pipeline::GraphStrategy;

/// Fixed multi-hop traversal built from the analyzed entities and keywords.
pub struct TemplatedBackend<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> TemplatedBackend<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GraphBackend for TemplatedBackend<'_> {
    fn strategy(&self) -> GraphStrategy {
        GraphStrategy::Templated
    }

    #[instrument(level = "trace", skip_all)]
    async fn query(&self, request: &GraphRequest<'_>) -> Result<GraphQueryResult, AppError> {
        let (chunk_query, triple_query) = match self.store.dialect() {
            QueryDialect::Sparql => (
                GraphQuery::new(sparql_chunk_query(request)),
                GraphQuery::new(sparql_triple_query(request)),
            ),
            QueryDialect::Cypher => (cypher_chunk_query(request), cypher_triple_query(request)),
        };
        debug!(dialect = %self.store.dialect(), hops = request.max_hops, "Running templated graph query");

        let (chunk_rows, triple_rows) = tokio::join!(
            self.store.execute(&chunk_query),
            self.store.execute(&triple_query)
        );
        let chunk_rows = chunk_rows?;
        let triple_rows = triple_rows.unwrap_or_else(|err| {
            warn!(error = %err, "Triple lookup failed, returning chunks without provenance");
            Vec::new()
        });

        let (chunk_ids, _) = collect_rows(
            &chunk_rows,
            request.max_hops,
            request.max_hops,
            request.chunk_limit,
            0,
        );
        let (_, triples) = collect_rows(
            &triple_rows,
            request.max_hops,
            request.max_hops,
            0,
            request.triple_limit,
        );

        Ok(GraphQueryResult {
            chunk_ids,
            triples,
            raw_query: chunk_query.text,
        })
    }
}

fn lowercase_entities(request: &GraphRequest<'_>) -> Vec<String> {
    request
        .entities
        .iter()
        .map(|entity| entity.trim().to_lowercase())
        .filter(|entity| !entity.is_empty())
        .collect()
}

fn sparql_anchor_filter(entities: &[String]) -> String {
    let conditions: Vec<String> = entities
        .iter()
        .map(|entity| format!("CONTAINS(LCASE(STR(?anchorLabel)), {})", sparql_literal(entity)))
        .collect();
    format!(
        "?anchor rdfs:label ?anchorLabel .\n    FILTER({})",
        conditions.join(" || ")
    )
}

/// One hop block: anchor, `hop` relation steps in either direction, chunk link.
fn sparql_hop_block(hop: u32, anchor: &str, keyword_pattern: Option<&str>) -> String {
    let mut block = format!("  {{\n    {anchor}\n");
    let excluded = format!("{MENTIONED_IN_PREDICATE}, rdf:type, rdfs:label");

    let mut previous = "?anchor".to_string();
    for step in 1..=hop {
        let node = format!("?n{step}");
        let predicate = format!("?p{step}");
        block.push_str(&format!(
            "    {{ {previous} {predicate} {node} }} UNION {{ {node} {predicate} {previous} }}\n\
             \x20   FILTER(isIRI({node}) && {predicate} NOT IN ({excluded}))\n"
        ));
        previous = node;
    }

    if let (Some(pattern), true) = (keyword_pattern, hop > 0) {
        let literal = sparql_literal(pattern);
        let predicate_matches: Vec<String> = (1..=hop)
            .map(|step| format!("REGEX(STR(?p{step}), {literal}, \"i\")"))
            .collect();
        block.push_str(&format!(
            "    OPTIONAL {{ {previous} rdfs:label ?reachedLabel }}\n\
             \x20   FILTER({} || (BOUND(?reachedLabel) && REGEX(STR(?reachedLabel), {literal}, \"i\")))\n",
            predicate_matches.join(" || ")
        ));
    }

    block.push_str(&format!(
        "    {previous} {MENTIONED_IN_PREDICATE} ?chunkRef .\n\
         \x20   BIND(STR(?chunkRef) AS ?chunk)\n\
         \x20   BIND({hop} AS ?h)\n  }}"
    ));
    block
}

pub fn sparql_chunk_query(request: &GraphRequest<'_>) -> String {
    let anchor = sparql_anchor_filter(&lowercase_entities(request));
    let pattern = keyword_pattern(request);
    let blocks: Vec<String> = (0..=request.max_hops)
        .map(|hop| sparql_hop_block(hop, &anchor, pattern.as_deref()))
        .collect();

    format!(
        "{prefixes}SELECT ?chunk (MIN(?h) AS ?hop) WHERE {{\n{blocks}\n}}\n\
         GROUP BY ?chunk\nORDER BY ASC(MIN(?h)) ?chunk\nLIMIT {limit}",
        prefixes = sparql_prefix_block(),
        blocks = blocks.join("\n  UNION\n"),
        limit = request.chunk_limit,
    )
}

pub fn sparql_triple_query(request: &GraphRequest<'_>) -> String {
    let anchor = sparql_anchor_filter(&lowercase_entities(request));
    format!(
        "{prefixes}SELECT DISTINCT ?subject ?predicate ?object WHERE {{\n\
         \x20   {anchor}\n\
         \x20   {{ ?anchor ?rel ?other . BIND(?anchor AS ?s) BIND(?other AS ?o) }}\n\
         \x20   UNION\n\
         \x20   {{ ?other ?rel ?anchor . BIND(?other AS ?s) BIND(?anchor AS ?o) }}\n\
         \x20   FILTER(isIRI(?other) && ?rel NOT IN ({MENTIONED_IN_PREDICATE}, rdf:type, rdfs:label))\n\
         \x20   ?s rdfs:label ?subject .\n\
         \x20   ?o rdfs:label ?object .\n\
         \x20   BIND(STR(?rel) AS ?predicate)\n\
         }}\nLIMIT {limit}",
        prefixes = sparql_prefix_block(),
        limit = request.triple_limit,
    )
}

/// Anchor names are bound as `$entities`.
const CYPHER_ANCHOR: &str = "any(name IN $entities WHERE toLower(a.name) CONTAINS name)";

fn cypher_hop_block(hop: u32, with_keywords: bool) -> String {
    if hop == 0 {
        return format!(
            "  MATCH (a:Entity)-[:{MENTIONED_IN_RELATIONSHIP}]->(c:Chunk)\n\
             \x20 WHERE {CYPHER_ANCHOR}\n\
             \x20 RETURN c.chunk_id AS chunk, 0 AS hop"
        );
    }

    let mut conditions = vec![
        CYPHER_ANCHOR.to_string(),
        format!("all(r IN relationships(p) WHERE type(r) <> '{MENTIONED_IN_RELATIONSHIP}')"),
    ];
    if with_keywords {
        conditions.push(
            "(any(r IN relationships(p) WHERE toLower(type(r)) =~ $keyword_regex) OR toLower(n.name) =~ $keyword_regex)"
                .to_string(),
        );
    }

    format!(
        "  MATCH p = (a:Entity)-[*{hop}]-(n:Entity)\n\
         \x20 WHERE {conditions}\n\
         \x20 MATCH (n)-[:{MENTIONED_IN_RELATIONSHIP}]->(c:Chunk)\n\
         \x20 RETURN c.chunk_id AS chunk, {hop} AS hop",
        conditions = conditions.join(" AND "),
    )
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub fn cypher_chunk_query(request: &GraphRequest<'_>) -> GraphQuery {
    let pattern = keyword_pattern(request);
    let blocks: Vec<String> = (0..=request.max_hops)
        .map(|hop| cypher_hop_block(hop, pattern.is_some()))
        .collect();

    let query = GraphQuery::new(format!(
        "CALL {{\n{}\n}}\nRETURN chunk, min(hop) AS hop\nORDER BY hop, chunk\nLIMIT $limit",
        blocks.join("\n  UNION ALL\n"),
    ))
    .param("entities", lowercase_entities(request))
    .param("limit", limit_param(request.chunk_limit));

    match pattern {
        Some(pattern) => query.param("keyword_regex", format!(".*({pattern}).*")),
        None => query,
    }
}

pub fn cypher_triple_query(request: &GraphRequest<'_>) -> GraphQuery {
    GraphQuery::new(format!(
        "MATCH (a:Entity)-[r]-(:Entity)\n\
         WHERE {CYPHER_ANCHOR} AND type(r) <> '{MENTIONED_IN_RELATIONSHIP}'\n\
         RETURN DISTINCT startNode(r).name AS subject, type(r) AS predicate, endNode(r).name AS object\n\
         LIMIT $limit"
    ))
    .param("entities", lowercase_entities(request))
    .param("limit", limit_param(request.triple_limit))
}

fn keyword_pattern(request: &GraphRequest<'_>) -> Option<String> {
    if request.keywords.is_empty() {
        return None;
    }
    let lowered: Vec<String> = request.keywords.iter().map(|k| k.to_lowercase()).collect();
    Some(keyword_alternation(&lowered))
}
