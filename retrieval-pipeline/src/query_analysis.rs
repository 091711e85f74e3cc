use std::{
    collections::{BTreeSet, HashSet},
    time::Duration,
};

use common::{
    error::AppError,
    utils::llm::{complete_with_timeout, CompletionRequest, LanguageModel},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::{
    pipeline::{SearchConfig, TokenizerMode},
    tokenizer::{normalize_text, Tokenizer},
};

const MAX_SPAN_TOKENS: usize = 3;

/// Anchors and relation cues pulled out of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryAnalysis {
    /// Entity names in first-seen order, unique ignoring case.
    pub entities: Vec<String>,
    /// Lowercased relation keywords, inverse names included.
    pub keywords: BTreeSet<String>,
    pub llm_entities: usize,
}

impl QueryAnalysis {
    pub fn has_entities(&self) -> bool {
        !self.entities.is_empty()
    }
}

pub struct QueryAnalyzer<'a> {
    tokenizer: &'a Tokenizer,
    llm: Option<&'a dyn LanguageModel>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntityReply {
    Wrapped { entities: Vec<String> },
    Bare(Vec<String>),
}

impl<'a> QueryAnalyzer<'a> {
    pub fn new(tokenizer: &'a Tokenizer, llm: Option<&'a dyn LanguageModel>) -> Self {
        Self { tokenizer, llm }
    }

    pub async fn analyze(&self, query: &str, config: &SearchConfig) -> QueryAnalysis {
        let stoplist: HashSet<String> = config
            .entity_stoplist
            .iter()
            .map(|term| normalize_text(term))
            .collect();

        let mut entities = EntitySet::new(&stoplist);
        for span in rule_based_entities(query, self.tokenizer, &stoplist) {
            entities.insert(span);
        }

        let mut llm_entities = 0;
        if config.use_llm_entities {
            if let Some(llm) = self.llm {
                let timeout = Duration::from_millis(config.llm_timeout_ms);
                match llm_entities_for(llm, query, timeout).await {
                    Ok(found) => {
                        for name in found {
                            if entities.insert(name) {
                                llm_entities += 1;
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "LLM entity extraction failed, using rule-based entities"),
                }
            }
        }

        let keywords = self.relation_keywords(query, config);
        let analysis = QueryAnalysis {
            entities: entities.into_vec(),
            keywords,
            llm_entities,
        };
        debug!(
            entities = ?analysis.entities,
            keywords = ?analysis.keywords,
            "Query analyzed"
        );
        analysis
    }

    fn relation_keywords(&self, query: &str, config: &SearchConfig) -> BTreeSet<String> {
        let vocabulary: HashSet<String> = config
            .relation_keywords
            .iter()
            .map(|word| normalize_text(word.trim()))
            .collect();
        let excluded: HashSet<String> = config
            .keyword_stopwords
            .iter()
            .map(|word| normalize_text(word.trim()))
            .collect();

        let mut keywords = BTreeSet::new();
        for token in self.tokenizer.tokenize(query, TokenizerMode::Extended) {
            let singular = token.strip_suffix('s').unwrap_or(&token);
            let matched = if vocabulary.contains(&token) {
                token.clone()
            } else if vocabulary.contains(singular) {
                singular.to_string()
            } else {
                continue;
            };
            if !excluded.contains(&matched) {
                keywords.insert(matched);
            }
        }

        let mut inverses = Vec::new();
        for pair in &config.relation_inverses {
            let relation = normalize_text(&pair.relation);
            let inverse = normalize_text(&pair.inverse);
            if keywords.contains(&relation) {
                inverses.push(inverse);
            } else if keywords.contains(&inverse) {
                inverses.push(relation);
            }
        }
        keywords.extend(inverses);
        keywords
    }
}

/// Ordered, case-insensitively unique entity names minus the stop-list.
struct EntitySet<'s> {
    stoplist: &'s HashSet<String>,
    seen: HashSet<String>,
    names: Vec<String>,
}

impl<'s> EntitySet<'s> {
    fn new(stoplist: &'s HashSet<String>) -> Self {
        Self {
            stoplist,
            seen: HashSet::new(),
            names: Vec::new(),
        }
    }

    fn insert(&mut self, name: String) -> bool {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return false;
        }
        let key = normalize_text(trimmed);
        if self.stoplist.contains(&key) || !self.seen.insert(key) {
            return false;
        }
        self.names.push(trimmed.to_string());
        true
    }

    fn into_vec(self) -> Vec<String> {
        self.names
    }
}

/// Contiguous runs of name-like words. A run longer than three words is
/// emitted whole and as three-word spans. Stopwords, stop-listed terms,
/// clause punctuation and possessives end a run.
pub fn rule_based_entities(
    query: &str,
    tokenizer: &Tokenizer,
    stoplist: &HashSet<String>,
) -> Vec<String> {
    let mut spans = Vec::new();
    let mut run: Vec<String> = Vec::new();

    let flush = |run: &mut Vec<String>, spans: &mut Vec<String>| {
        if run.len() > MAX_SPAN_TOKENS {
            spans.push(run.join(" "));
        }
        for window in run.chunks(MAX_SPAN_TOKENS) {
            spans.push(window.join(" "));
        }
        run.clear();
    };

    for raw in query.split_whitespace() {
        let ends_clause = raw.ends_with(|c: char| matches!(c, ',' | '.' | '?' | '!' | ';' | ':'));
        let (word, possessive) = clean_word(raw);

        if word.is_empty() {
            flush(&mut run, &mut spans);
            continue;
        }

        if contains_cjk(&word) {
            flush(&mut run, &mut spans);
            spans.extend(cjk_runs(&word));
            continue;
        }

        let key = normalize_text(&word);
        if is_name_like(&word) && !tokenizer.is_stopword(&key) && !stoplist.contains(&key) {
            run.push(word);
        } else {
            flush(&mut run, &mut spans);
        }

        if ends_clause || possessive {
            flush(&mut run, &mut spans);
        }
    }
    flush(&mut run, &mut spans);

    spans
}

/// Strips surrounding punctuation and a trailing `'s`, reporting whether one was removed.
fn clean_word(raw: &str) -> (String, bool) {
    let trimmed = raw.trim_matches(|c: char| !c.is_alphanumeric());
    match trimmed
        .strip_suffix("'s")
        .or_else(|| trimmed.strip_suffix("’s"))
    {
        Some(stem) => (stem.nfkc().collect(), true),
        None => (trimmed.nfkc().collect(), false),
    }
}

fn is_name_like(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    if first.is_uppercase() {
        return true;
    }

    let has_digit = word.chars().any(|c| c.is_ascii_digit());
    let has_alpha = word.chars().any(char::is_alphabetic);
    has_digit && has_alpha
}

const fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{1100}'..='\u{11FF}')
}

fn contains_cjk(word: &str) -> bool {
    word.chars().any(is_cjk)
}

fn cjk_runs(word: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in word.chars() {
        if is_cjk(c) {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs.retain(|run| run.chars().count() >= 2);
    runs
}

fn entity_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["entities"],
        "additionalProperties": false
    })
}

async fn llm_entities_for(
    llm: &dyn LanguageModel,
    query: &str,
    timeout: Duration,
) -> Result<Vec<String>, AppError> {
    let request = CompletionRequest::new(
        "You extract named entities (people, organisations, places, works, concepts with proper names) \
         from a search question. Return only names that literally occur in the question.",
        format!("Question: {query}\n\nReturn JSON of the form {{\"entities\": [\"...\"]}}."),
    )
    .with_schema("query_entities", "Named entities mentioned in a question", entity_schema());

    let reply = complete_with_timeout(llm, &request, timeout).await?;
    parse_entity_reply(&reply)
}

fn parse_entity_reply(reply: &str) -> Result<Vec<String>, AppError> {
    let parsed: EntityReply = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| AppError::LLMParsing(format!("entity list is not valid JSON: {e}")))?;
    Ok(match parsed {
        EntityReply::Wrapped { entities } | EntityReply::Bare(entities) => entities,
    })
}

/// Removes a Markdown code fence some models put around JSON replies.
pub(crate) fn strip_code_fence(reply: &str) -> &str {
    reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
