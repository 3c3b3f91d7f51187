//! Lexical + importance relevance ranking shared by every backend.
//!
//! A query is reduced to lowercase alphanumeric terms with stopwords
//! removed. A memory's overlap is the fraction of those terms that match one
//! of its words, where a match is equality or a prefix relation of at least
//! three characters ("like" matches "likes"). The score blends overlap with
//! importance.

use jarvis_core::MemoryRecord;
use jarvis_core::memory::MAX_IMPORTANCE;
use std::cmp::Ordering;

const OVERLAP_WEIGHT: f32 = 0.7;
const IMPORTANCE_WEIGHT: f32 = 0.3;
const MIN_PREFIX: usize = 3;

const STOPWORDS: &[&str] = &[
    "a", "about", "am", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can",
    "could", "did", "do", "does", "for", "from", "had", "has", "have", "he", "her", "his",
    "how", "i", "if", "in", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or",
    "our", "please", "she", "should", "so", "tell", "than", "that", "the", "them", "then",
    "these", "they", "this", "those", "to", "us", "was", "we", "were", "what", "when",
    "where", "which", "who", "whom", "why", "will", "with", "would", "yes", "you", "your",
];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Usable search terms of a query, deduplicated, in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for w in words(query) {
        if w.chars().count() < 2 || STOPWORDS.contains(&w.as_str()) {
            continue;
        }
        if !terms.contains(&w) {
            terms.push(w);
        }
    }
    terms
}

fn term_matches(term: &str, word: &str) -> bool {
    if term == word {
        return true;
    }
    let (short, long) = if term.len() <= word.len() {
        (term, word)
    } else {
        (word, term)
    };
    short.chars().count() >= MIN_PREFIX && long.starts_with(short)
}

/// Fraction of `terms` found in `content`.
pub fn overlap(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let content_words: Vec<String> = words(content).collect();
    let hits = terms
        .iter()
        .filter(|t| content_words.iter().any(|w| term_matches(t, w)))
        .count();
    hits as f32 / terms.len() as f32
}

fn importance_score(importance: i32) -> f32 {
    importance.clamp(0, MAX_IMPORTANCE) as f32 / MAX_IMPORTANCE as f32
}

/// Newer first, then higher id.
fn recency(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
}

/// Rank `records` against `query` and keep the best `limit`.
///
/// With usable terms only records with some overlap are returned. Without
/// terms every record qualifies, ordered by importance then recency.
pub fn rank(records: Vec<MemoryRecord>, query: &str, limit: usize) -> Vec<MemoryRecord> {
    let terms = query_terms(query);

    let mut scored: Vec<MemoryRecord> = if terms.is_empty() {
        records
            .into_iter()
            .map(|mut r| {
                r.score = importance_score(r.importance);
                r
            })
            .collect()
    } else {
        records
            .into_iter()
            .filter_map(|mut r| {
                let o = overlap(&terms, &r.content);
                if o <= 0.0 {
                    return None;
                }
                r.score = OVERLAP_WEIGHT * o + IMPORTANCE_WEIGHT * importance_score(r.importance);
                Some(r)
            })
            .collect()
    };

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| recency(a, b)));
    scored.truncate(limit);
    scored
}
