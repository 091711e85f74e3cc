//! Graph layout shared by the query templates and the generation prompt.
//!
//! RDF: entities carry `rdfs:label`, relations are predicates in the `kg:`
//! namespace named in lower camel case, and `kg:mentionedIn` links an entity
//! to the id of every chunk that mentions it (a plain literal).
//!
//! Property graph: `(:Entity {name})` nodes, relationships typed in upper
//! snake case, and `(:Entity)-[:MENTIONED_IN]->(:Chunk {chunk_id})`.

use common::graph::QueryDialect;

pub const KG_NAMESPACE: &str = "http://kg.local/schema#";
pub const RDFS_NAMESPACE: &str = "http://www.w3.org/2000/01/rdf-schema#";
pub const RDF_NAMESPACE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";

pub const MENTIONED_IN_PREDICATE: &str = "kg:mentionedIn";
pub const MENTIONED_IN_RELATIONSHIP: &str = "MENTIONED_IN";

/// Result column holding the chunk id.
pub const CHUNK_COLUMN: &str = "chunk";
/// Result column holding the hop distance.
pub const HOP_COLUMN: &str = "hop";
pub const SUBJECT_COLUMN: &str = "subject";
pub const PREDICATE_COLUMN: &str = "predicate";
pub const OBJECT_COLUMN: &str = "object";

pub fn sparql_prefixes() -> [(&'static str, &'static str); 3] {
    [
        ("kg", KG_NAMESPACE),
        ("rdfs", RDFS_NAMESPACE),
        ("rdf", RDF_NAMESPACE),
    ]
}

pub fn sparql_prefix_block() -> String {
    sparql_prefixes()
        .iter()
        .map(|(prefix, iri)| format!("PREFIX {prefix}: <{iri}>\n"))
        .collect()
}

/// Schema summary handed to the language model.
pub fn schema_description(dialect: QueryDialect) -> String {
    match dialect {
        QueryDialect::Sparql => format!(
            "Dialect: SPARQL 1.1 (read-only SELECT).\n\
             Prefixes:\n{prefixes}\
             Entities are IRIs with a human readable name in rdfs:label (plain literal, original casing).\n\
             Relations between entities are kg: predicates in lowerCamelCase, e.g. kg:teacherOf, kg:memberOf, kg:worksFor.\n\
             Each entity is linked to the chunks that mention it with {mentioned} whose object is the chunk id literal.\n\
             Match names case-insensitively, e.g. FILTER(CONTAINS(LCASE(STR(?label)), \"curie\")).\n\
             The SELECT must project ?{chunk} (chunk id literal) and may project ?{hop} (relation steps from the named entity) \
             and ?{subject} ?{predicate} ?{object} (labels of a supporting triple).",
            prefixes = sparql_prefix_block(),
            mentioned = MENTIONED_IN_PREDICATE,
            chunk = CHUNK_COLUMN,
            hop = HOP_COLUMN,
            subject = SUBJECT_COLUMN,
            predicate = PREDICATE_COLUMN,
            object = OBJECT_COLUMN,
        ),
        QueryDialect::Cypher => format!(
            "Dialect: Cypher (read-only MATCH ... RETURN).\n\
             Nodes: (:Entity {{name}}) with the original casing of the name, (:Chunk {{chunk_id}}).\n\
             Relationships between entities are typed in UPPER_SNAKE_CASE, e.g. TEACHER_OF, MEMBER_OF, WORKS_FOR.\n\
             Each entity is linked to the chunks that mention it by (:Entity)-[:{mentioned}]->(:Chunk).\n\
             Match names case-insensitively, e.g. WHERE toLower(e.name) CONTAINS 'curie'.\n\
             RETURN must include c.chunk_id AS {chunk} and may include a hop count AS {hop} \
             and subject, predicate, object strings of a supporting relationship.",
            mentioned = MENTIONED_IN_RELATIONSHIP,
            chunk = CHUNK_COLUMN,
            hop = HOP_COLUMN,
        ),
    }
}

/// Double-quoted SPARQL string literal.
pub fn sparql_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len().saturating_add(2));
    escaped.push('"');
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped.push('"');
    escaped
}

/// `a|b|c` alternation of the escaped keywords.
pub fn keyword_alternation<'k, I>(keywords: I) -> String
where
    I: IntoIterator<Item = &'k String>,
{
    keywords
        .into_iter()
        .map(|keyword| regex::escape(keyword))
        .collect::<Vec<_>>()
        .join("|")
}
