use std::collections::HashMap;

use common::{error::AppError, storage::store::LexicalCorpus};
use tracing::{debug, warn};

use crate::{
    pipeline::TokenizerMode,
    scoring::{sort_hits_desc, RawHit},
    tokenizer::Tokenizer,
};

/// Okapi BM25 parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25 {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25 {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl Bm25 {
    /// Scores every document against the distinct query terms.
    pub fn score_corpus(&self, query_terms: &[String], documents: &[Vec<String>]) -> Vec<f32> {
        if documents.is_empty() {
            return Vec::new();
        }

        let mut terms: Vec<&str> = query_terms.iter().map(String::as_str).collect();
        terms.sort_unstable();
        terms.dedup();
        if terms.is_empty() {
            return vec![0.0; documents.len()];
        }

        let doc_count = documents.len() as f32;
        let total_len: usize = documents.iter().map(Vec::len).sum();
        let avg_doc_len = (total_len as f32 / doc_count).max(1.0);

        let term_freqs: Vec<HashMap<&str, f32>> = documents
            .iter()
            .map(|tokens| {
                let mut freqs: HashMap<&str, f32> = HashMap::new();
                for token in tokens {
                    if terms.binary_search(&token.as_str()).is_ok() {
                        *freqs.entry(token.as_str()).or_insert(0.0) += 1.0;
                    }
                }
                freqs
            })
            .collect();

        let idf: Vec<f32> = terms
            .iter()
            .map(|term| {
                let df = term_freqs.iter().filter(|freqs| freqs.contains_key(term)).count() as f32;
                ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln()
            })
            .collect();

        documents
            .iter()
            .zip(term_freqs.iter())
            .map(|(tokens, freqs)| {
                let doc_len = tokens.len() as f32;
                let length_norm = self.k1 * (1.0 - self.b + self.b * doc_len / avg_doc_len);
                terms
                    .iter()
                    .zip(idf.iter())
                    .filter_map(|(term, term_idf)| {
                        freqs
                            .get(term)
                            .map(|tf| term_idf * (tf * (self.k1 + 1.0)) / (tf + length_norm))
                    })
                    .sum()
            })
            .collect()
    }
}

/// Term-frequency ranking over a full scan of the knowledge base.
pub struct LexicalSearcher<'a> {
    corpus: &'a dyn LexicalCorpus,
    tokenizer: &'a Tokenizer,
    bm25: Bm25,
}

impl<'a> LexicalSearcher<'a> {
    pub fn new(corpus: &'a dyn LexicalCorpus, tokenizer: &'a Tokenizer) -> Self {
        Self {
            corpus,
            tokenizer,
            bm25: Bm25::default(),
        }
    }

    /// Ranked chunks with a positive BM25 score. Failures yield an empty list.
    pub async fn search(
        &self,
        kb_id: &str,
        query: &str,
        take: usize,
        mode: TokenizerMode,
    ) -> Vec<RawHit> {
        self.try_search(kb_id, query, take, mode)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "Lexical search failed, continuing without lexical evidence");
                Vec::new()
            })
    }

    pub async fn try_search(
        &self,
        kb_id: &str,
        query: &str,
        take: usize,
        mode: TokenizerMode,
    ) -> Result<Vec<RawHit>, AppError> {
        let query_terms = self.tokenizer.tokenize(query, mode);
        if query_terms.is_empty() || take == 0 {
            return Ok(Vec::new());
        }

        let chunks = self.corpus.enumerate(kb_id).await?;
        let documents: Vec<Vec<String>> = chunks
            .iter()
            .map(|chunk| self.tokenizer.tokenize(&chunk.content, mode))
            .collect();
        let scores = self.bm25.score_corpus(&query_terms, &documents);

        let mut hits: Vec<RawHit> = chunks
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0)
            .map(|(chunk, raw_score)| RawHit { chunk, raw_score })
            .collect();

        sort_hits_desc(&mut hits);
        hits.truncate(take);
        debug!(
            kb_id,
            corpus = documents.len(),
            hits = hits.len(),
            "Lexical candidates collected"
        );
        Ok(hits)
    }
}
