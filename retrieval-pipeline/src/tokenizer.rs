use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;

use crate::pipeline::TokenizerMode;

const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
];

/// Suffixes that usually mark adverbs, adjectives or inflected verbs in English.
const NON_NOUN_SUFFIXES: &[&str] = &[
    "ly", "ing", "ed", "ous", "ful", "ive", "able", "ible", "less", "ish", "ize", "ise",
];

/// Shared text normalizer and splitter for lexical scoring and query analysis.
///
/// Built once per process and handed to every query by reference.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    stopwords: HashSet<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::with_stopwords(DEFAULT_STOPWORDS.iter().copied())
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stopwords<I, S>(stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stopwords: stopwords
                .into_iter()
                .map(|word| normalize_text(word.as_ref()))
                .collect(),
        }
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }

    /// NFKC-normalized, case-folded words with stopwords removed.
    pub fn tokenize(&self, text: &str, mode: TokenizerMode) -> Vec<String> {
        split_words(&normalize_text(text))
            .filter(|token| !self.is_stopword(token))
            .filter(|token| match mode {
                TokenizerMode::Extended => true,
                TokenizerMode::Strict => is_noun_like(token),
            })
            .map(str::to_owned)
            .collect()
    }
}

pub fn normalize_text(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Splits on anything that is not a letter or digit.
pub fn split_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
}

fn is_noun_like(token: &str) -> bool {
    if !token.chars().all(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    if token.chars().count() < 3 {
        return false;
    }
    !NON_NOUN_SUFFIXES.iter().any(|suffix| {
        token.len() > suffix.len().saturating_add(2) && token.ends_with(suffix)
    })
}
