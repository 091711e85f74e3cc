use std::time::Duration;

use common::{
    error::AppError,
    utils::llm::{complete_with_timeout, CompletionRequest, LanguageModel},
};
use futures::{
    future::{BoxFuture, FutureExt},
    stream, StreamExt,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{query_analysis::strip_code_fence, scoring::clamp_unit, RetrievalResult};

/// Longest passage excerpt sent for scoring, in characters.
const MAX_PASSAGE_CHARS: usize = 4_000;

#[derive(Deserialize)]
#[serde(untagged)]
enum RelevanceReply {
    Wrapped { score: f32 },
    Bare(f32),
}

fn relevance_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "score": { "type": "number" }
        },
        "required": ["score"],
        "additionalProperties": false
    })
}

pub fn parse_relevance_reply(reply: &str) -> Result<f32, AppError> {
    let parsed: RelevanceReply = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| AppError::LLMParsing(format!("relevance score is not valid JSON: {e}")))?;
    let score = match parsed {
        RelevanceReply::Wrapped { score } | RelevanceReply::Bare(score) => score,
    };
    if score.is_finite() {
        Ok(clamp_unit(score))
    } else {
        Err(AppError::LLMParsing("relevance score is not a number".into()))
    }
}

/// Asks the model how well `passage` answers `query`, on a 0.0 to 1.0 scale.
pub async fn llm_relevance(
    llm: &dyn LanguageModel,
    query: &str,
    passage: &str,
    timeout: Duration,
) -> Result<f32, AppError> {
    let excerpt: String = passage.chars().take(MAX_PASSAGE_CHARS).collect();
    let request = CompletionRequest::new(
        "You judge search results. Rate how well the passage answers the question \
         with a number between 0.0 (irrelevant) and 1.0 (fully answers it).",
        format!("Question: {query}\n\nPassage:\n{excerpt}\n\nReturn JSON of the form {{\"score\": 0.0}}."),
    )
    .with_schema("relevance", "Relevance of a passage to a question", relevance_schema());

    let reply = complete_with_timeout(llm, &request, timeout).await?;
    parse_relevance_reply(&reply)
}

/// One score per result, in input order. Failed calls and missing content score 0.
pub(super) async fn llm_scores(
    llm: &dyn LanguageModel,
    query: &str,
    results: &[RetrievalResult],
    concurrency: usize,
    timeout: Duration,
) -> Vec<f32> {
    let mut scores = vec![0.0; results.len()];

    let jobs: Vec<BoxFuture<'_, (usize, f32)>> = results
        .iter()
        .enumerate()
        .filter(|(_, result)| !result.content_missing)
        .map(|(position, result)| {
            async move {
                let score = llm_relevance(llm, query, &result.content, timeout)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(chunk_id = %result.chunk_id, error = %err, "LLM relevance scoring failed, scoring 0");
                        0.0
                    });
                (position, score)
            }
            .boxed()
        })
        .collect();

    let scored: Vec<(usize, f32)> = stream::iter(jobs)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (position, score) in scored {
        scores[position] = score;
    }
    scores
}
