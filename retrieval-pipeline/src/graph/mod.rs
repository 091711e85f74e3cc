pub mod generative;
pub mod schema;
pub mod templated;

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use common::{error::AppError, graph::GraphRow};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use generative::GenerativeBackend;
pub use templated::TemplatedBackend;

use crate::pipeline::GraphStrategy;
use schema::{CHUNK_COLUMN, HOP_COLUMN, OBJECT_COLUMN, PREDICATE_COLUMN, SUBJECT_COLUMN};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Chunks reachable from the query anchors, with the evidence shown to users.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphQueryResult {
    /// `(chunk_id, hop distance)`, unique by id, closest first.
    pub chunk_ids: Vec<(String, u32)>,
    pub triples: Vec<Triple>,
    pub raw_query: String,
}

impl GraphQueryResult {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }
}

/// Everything a backend needs to answer one query.
#[derive(Debug, Clone, Copy)]
pub struct GraphRequest<'q> {
    pub entities: &'q [String],
    pub keywords: &'q BTreeSet<String>,
    pub max_hops: u32,
    pub query_text: &'q str,
    pub chunk_limit: usize,
    pub triple_limit: usize,
}

#[async_trait]
pub trait GraphBackend: Send + Sync {
    fn strategy(&self) -> GraphStrategy;

    async fn query(&self, request: &GraphRequest<'_>) -> Result<GraphQueryResult, AppError>;
}

/// Outcome of walking the strategy list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSearchOutcome {
    pub result: GraphQueryResult,
    /// Strategy that produced `result`, `None` when every strategy came back empty.
    pub strategy: Option<GraphStrategy>,
    pub attempts: Vec<GraphAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphAttempt {
    pub strategy: GraphStrategy,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered list of backends tried until one finds chunks.
pub struct GraphSearcher<'a> {
    backends: Vec<&'a dyn GraphBackend>,
    budget: Option<Duration>,
}

impl<'a> GraphSearcher<'a> {
    pub fn new(backends: Vec<&'a dyn GraphBackend>) -> Self {
        Self {
            backends,
            budget: None,
        }
    }

    /// Bounds the whole walk. Each strategy gets an even share of what is left.
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub async fn search(&self, request: &GraphRequest<'_>) -> GraphSearchOutcome {
        let mut outcome = GraphSearchOutcome::default();
        if request.entities.is_empty() {
            debug!("No anchor entities, skipping graph search");
            return outcome;
        }

        let deadline = self
            .budget
            .and_then(|budget| Instant::now().checked_add(budget));
        for (position, backend) in self.backends.iter().enumerate() {
            let strategy = backend.strategy();
            let attempt = match deadline {
                Some(deadline) => {
                    let step = step_budget(deadline, self.backends.len().saturating_sub(position));
                    tokio::time::timeout(step, backend.query(request))
                        .await
                        .unwrap_or_else(|_| {
                            Err(AppError::Timeout(format!(
                                "{strategy} graph query exceeded {} ms",
                                step.as_millis()
                            )))
                        })
                }
                None => backend.query(request).await,
            };
            match attempt {
                Ok(result) if !result.is_empty() => {
                    info!(
                        %strategy,
                        chunks = result.chunk_ids.len(),
                        triples = result.triples.len(),
                        "Graph strategy produced evidence"
                    );
                    outcome.attempts.push(GraphAttempt {
                        strategy,
                        chunks: result.chunk_ids.len(),
                        error: None,
                    });
                    outcome.result = result;
                    outcome.strategy = Some(strategy);
                    return outcome;
                }
                Ok(result) => {
                    debug!(%strategy, "Graph strategy returned no chunks");
                    outcome.attempts.push(GraphAttempt {
                        strategy,
                        chunks: 0,
                        error: None,
                    });
                    if outcome.result.raw_query.is_empty() {
                        outcome.result.raw_query = result.raw_query;
                    }
                }
                Err(err) => {
                    if err.is_request_abort() {
                        warn!(%strategy, error = %err, "Graph strategy timed out");
                    } else {
                        warn!(%strategy, error = %err, "Graph strategy failed");
                    }
                    outcome.attempts.push(GraphAttempt {
                        strategy,
                        chunks: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        outcome
    }
}

/// Even share of the time left before `deadline` for the `remaining` strategies.
fn step_budget(deadline: Instant, remaining: usize) -> Duration {
    let left = deadline.saturating_duration_since(Instant::now());
    let share = u32::try_from(remaining.max(1)).unwrap_or(u32::MAX);
    left.checked_div(share).unwrap_or(left)
}

/// Collects chunk ids and triples from result rows.
///
/// Rows without a chunk id are skipped, distances are clamped to `max_hops`,
/// a missing distance counts as `default_hop`, and each chunk keeps its
/// smallest distance.
pub fn collect_rows(
    rows: &[GraphRow],
    max_hops: u32,
    default_hop: u32,
    chunk_limit: usize,
    triple_limit: usize,
) -> (Vec<(String, u32)>, Vec<Triple>) {
    let mut distances: HashMap<String, u32> = HashMap::new();
    let mut triples = Vec::new();
    let mut seen_triples = HashSet::new();

    for row in rows {
        if let Some(chunk_id) = row.get(CHUNK_COLUMN).map(|id| id.trim()).filter(|id| !id.is_empty()) {
            let hop = row
                .get(HOP_COLUMN)
                .and_then(|value| parse_hop(value))
                .unwrap_or(default_hop)
                .min(max_hops);
            distances
                .entry(chunk_id.to_string())
                .and_modify(|existing| *existing = (*existing).min(hop))
                .or_insert(hop);
        }

        if let Some(triple) = triple_from_row(row) {
            if triples.len() < triple_limit && seen_triples.insert(triple.clone()) {
                triples.push(triple);
            }
        }
    }

    (sorted_chunks(distances, chunk_limit), triples)
}

/// Closest first, then by id, capped at `limit`.
pub fn sorted_chunks(distances: HashMap<String, u32>, limit: usize) -> Vec<(String, u32)> {
    let mut chunks: Vec<(String, u32)> = distances.into_iter().collect();
    chunks.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    chunks.truncate(limit);
    chunks
}

pub fn triple_from_row(row: &GraphRow) -> Option<Triple> {
    Some(Triple {
        subject: row.get(SUBJECT_COLUMN)?.clone(),
        predicate: local_name(row.get(PREDICATE_COLUMN)?).to_string(),
        object: row.get(OBJECT_COLUMN)?.clone(),
    })
}

/// Accepts integers as well as decimal renderings such as `2.0`.
fn parse_hop(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    trimmed.parse::<u32>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|hop| hop.is_finite() && *hop >= 0.0)
            .map(|hop| hop.round() as u32)
    })
}

/// Last segment of an IRI, the value itself otherwise.
fn local_name(value: &str) -> &str {
    value
        .rsplit(['#', '/'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(value)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use common::{
        error::AppError,
        graph::{GraphQuery, GraphRow, GraphStore, QueryDialect},
        utils::llm::{CompletionRequest, LanguageModel},
    };

    /// Graph store answering with canned rows and remembering the queries it saw.
    pub struct RecordingStore {
        pub dialect: QueryDialect,
        pub respond: Box<dyn Fn(&str) -> Result<Vec<GraphRow>, AppError> + Send + Sync>,
        pub seen: Mutex<Vec<GraphQuery>>,
        stall_marker: Option<&'static str>,
    }

    impl RecordingStore {
        pub fn new<F>(dialect: QueryDialect, respond: F) -> Self
        where
            F: Fn(&str) -> Result<Vec<GraphRow>, AppError> + Send + Sync + 'static,
        {
            Self {
                dialect,
                respond: Box::new(respond),
                seen: Mutex::new(Vec::new()),
                stall_marker: None,
            }
        }

        /// Never answers queries whose text contains `marker`.
        pub fn stalling_on(mut self, marker: &'static str) -> Self {
            self.stall_marker = Some(marker);
            self
        }

        pub fn queries(&self) -> Vec<String> {
            self.recorded().into_iter().map(|query| query.text).collect()
        }

        pub fn recorded(&self) -> Vec<GraphQuery> {
            self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl GraphStore for RecordingStore {
        fn dialect(&self) -> QueryDialect {
            self.dialect
        }

        async fn execute(&self, query: &GraphQuery) -> Result<Vec<GraphRow>, AppError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(query.clone());
            }
            if self
                .stall_marker
                .is_some_and(|marker| query.text.contains(marker))
            {
                std::future::pending::<()>().await;
            }
            (self.respond)(&query.text)
        }
    }

    /// Language model replying with a fixed answer.
    pub struct ScriptedLlm(pub Result<String, String>);

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AppError> {
            self.0.clone().map_err(AppError::InternalError)
        }
    }

    pub fn row(pairs: &[(&str, &str)]) -> GraphRow {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }
}
