//! Hybrid ranking.
//!
//! The query engine gathers one [`Candidate`] per chunk that matched
//! lexically, semantically, or both, and [`rank`] turns them into ordered
//! [`SearchHit`]s:
//!
//! | Matched by | Score |
//! |------------|-------|
//! | semantic only | cosine similarity |
//! | lexical only | `lexical_boost` |
//! | both | cosine similarity + `lexical_boost` |
//!
//! Ordering is total: score (desc), span length (asc), source path,
//! resource id, span start, chunk id. Equal inputs always produce equal
//! output order.

use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{MatchKind, SearchHit, Span};

/// Decides whether a chunk matches a query lexically.
#[derive(Debug, Clone)]
pub enum LexicalMatcher {
    /// Every whitespace-separated term occurs in the text (case-insensitive).
    Terms(Vec<String>),
    /// The regular expression matches somewhere in the text.
    Pattern(Regex),
}

impl LexicalMatcher {
    pub fn terms(query: &str) -> Self {
        LexicalMatcher::Terms(query.split_whitespace().map(|t| t.to_lowercase()).collect())
    }

    /// Compile a user-supplied pattern. The size limit keeps pathological
    /// patterns from exhausting memory.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        let re = RegexBuilder::new(pattern)
            .size_limit(1 << 20)
            .build()?;
        Ok(LexicalMatcher::Pattern(re))
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            LexicalMatcher::Terms(terms) => {
                if terms.is_empty() {
                    return false;
                }
                let lower = text.to_lowercase();
                terms.iter().all(|t| lower.contains(t.as_str()))
            }
            LexicalMatcher::Pattern(re) => re.is_match(text),
        }
    }
}

/// A chunk that matched at least one retrieval path.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub resource_id: String,
    pub chunk_id: String,
    pub source_path: String,
    pub span: Span,
    pub text: String,
    /// Cosine similarity when the chunk was among the semantic neighbours.
    pub semantic: Option<f32>,
    pub lexical: bool,
}

impl Candidate {
    /// Combined score and match kind, or `None` if nothing matched.
    pub fn score(&self, lexical_boost: f32) -> Option<(f32, MatchKind)> {
        match (self.semantic, self.lexical) {
            (Some(sim), true) => Some((sim + lexical_boost, MatchKind::Both)),
            (Some(sim), false) => Some((sim, MatchKind::Semantic)),
            (None, true) => Some((lexical_boost, MatchKind::Lexical)),
            (None, false) => None,
        }
    }
}

/// Total order used for results. Higher scores first.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.span.line_count().cmp(&b.span.line_count()))
        .then_with(|| a.source_path.cmp(&b.source_path))
        .then_with(|| a.resource_id.cmp(&b.resource_id))
        .then_with(|| a.span.start_line.cmp(&b.span.start_line))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Score, merge, sort, and truncate candidates.
///
/// Candidates for the same `(resource_id, chunk_id)` are merged keeping the
/// best score, which lets callers feed results of several queries at once.
pub fn rank(candidates: Vec<Candidate>, lexical_boost: f32, top_k: usize) -> Vec<SearchHit> {
    let mut best: HashMap<(String, String), SearchHit> = HashMap::new();

    for c in candidates {
        let Some((score, match_kind)) = c.score(lexical_boost) else {
            continue;
        };
        let key = (c.resource_id.clone(), c.chunk_id.clone());
        let hit = SearchHit {
            resource_id: c.resource_id,
            chunk_id: c.chunk_id,
            source_path: c.source_path,
            span: c.span,
            text: c.text,
            score,
            match_kind,
        };
        match best.get(&key) {
            Some(existing) if existing.score >= score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }

    let mut hits: Vec<SearchHit> = best.into_values().collect();
    hits.sort_by(compare_hits);
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(
        chunk: &str,
        path: &str,
        span: (u32, u32),
        semantic: Option<f32>,
        lexical: bool,
    ) -> Candidate {
        Candidate {
            resource_id: "r1".to_string(),
            chunk_id: chunk.to_string(),
            source_path: path.to_string(),
            span: Span::new(span.0, span.1),
            text: format!("text of {}", chunk),
            semantic,
            lexical,
        }
    }

    #[test]
    fn test_terms_are_conjunctive_and_case_insensitive() {
        let m = LexicalMatcher::terms("Retry  BACKOFF");
        assert!(m.is_match("exponential backoff with retry"));
        assert!(!m.is_match("retry only"));
        assert!(!LexicalMatcher::terms("   ").is_match("anything"));
    }

    #[test]
    fn test_pattern_matcher() {
        let m = LexicalMatcher::pattern(r"fn\s+parse_\w+").unwrap();
        assert!(m.is_match("pub fn parse_config() {}"));
        assert!(!m.is_match("fn build()"));
        assert!(LexicalMatcher::pattern("(unclosed").is_err());
    }

    #[test]
    fn test_scoring_table() {
        let both = cand("a", "p", (1, 1), Some(0.5), true);
        assert_eq!(both.score(0.25), Some((0.75, MatchKind::Both)));
        let semantic = cand("a", "p", (1, 1), Some(0.5), false);
        assert_eq!(semantic.score(0.25), Some((0.5, MatchKind::Semantic)));
        let lexical = cand("a", "p", (1, 1), None, true);
        assert_eq!(lexical.score(0.25), Some((0.25, MatchKind::Lexical)));
        assert_eq!(cand("a", "p", (1, 1), None, false).score(0.25), None);
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let hits = rank(
            vec![
                cand("lex", "z.rs", (1, 1), None, true),
                cand("both", "a.rs", (1, 10), Some(0.6), true),
                cand("sem", "b.rs", (1, 2), Some(0.9), false),
                cand("none", "c.rs", (1, 1), None, false),
            ],
            0.25,
            10,
        );
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["sem", "both", "lex"]);
        assert_eq!(hits[1].match_kind, MatchKind::Both);

        let candidates = vec![
            cand("x", "a", (1, 1), Some(0.1), false),
            cand("y", "a", (2, 2), Some(0.2), false),
        ];
        let top1 = rank(candidates, 0.25, 1);
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].chunk_id, "y");
    }

    #[test]
    fn test_tie_breaks_are_deterministic() {
        let input = vec![
            cand("c3", "b.rs", (5, 9), Some(0.5), false),
            cand("c2", "a.rs", (1, 5), Some(0.5), false),
            cand("c1", "a.rs", (10, 11), Some(0.5), false),
            cand("c0", "a.rs", (20, 21), Some(0.5), false),
        ];
        let mut reversed = input.clone();
        reversed.reverse();
        let a = rank(input, 0.25, 10);
        let b = rank(reversed, 0.25, 10);
        assert_eq!(a, b);
        let ids: Vec<&str> = a.iter().map(|h| h.chunk_id.as_str()).collect();
        // shorter spans first, then path, then start line
        assert_eq!(ids, vec!["c1", "c0", "c2", "c3"]);
    }

    #[test]
    fn test_duplicate_candidates_keep_best() {
        let hits = rank(
            vec![
                cand("c", "a.rs", (1, 1), Some(0.2), false),
                cand("c", "a.rs", (1, 1), Some(0.7), true),
            ],
            0.25,
            10,
        );
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.95).abs() < 1e-6);
    }
}
