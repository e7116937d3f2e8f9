//! Linear message search with a simple relevance heuristic.

use super::{ChatMessage, Conversation};
use regex::Regex;
use serde::Serialize;

const SCORE_EXACT: u32 = 100;
const SCORE_PREFIX: u32 = 80;
const SCORE_WHOLE_WORD: u32 = 60;
const SCORE_SUBSTRING: u32 = 40;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub conversation_id: String,
    pub conversation_title: String,
    pub message: ChatMessage,
    pub score: u32,
}

/// Query prepared once per search.
pub(crate) struct Query {
    lowered: String,
    word: Option<Regex>,
}

impl Query {
    /// `None` for blank queries.
    pub(crate) fn new(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        if lowered.is_empty() {
            return None;
        }
        let word = Regex::new(&format!(r"\b{}\b", regex::escape(&lowered))).ok();
        Some(Self { lowered, word })
    }

    fn score(&self, content: &str) -> Option<u32> {
        let content = content.to_lowercase();
        if !content.contains(&self.lowered) {
            return None;
        }

        let score = if content.trim() == self.lowered {
            SCORE_EXACT
        } else if content.starts_with(&self.lowered) {
            SCORE_PREFIX
        } else if self.word.as_ref().is_some_and(|re| re.is_match(&content)) {
            SCORE_WHOLE_WORD
        } else {
            SCORE_SUBSTRING
        };
        Some(score)
    }
}

/// Score `content` against `query`, case-insensitively.
///
/// Exact match beats prefix, prefix beats whole word, whole word beats a
/// bare substring. Returns `None` when the query does not occur at all.
#[must_use]
pub fn score_match(content: &str, query: &str) -> Option<u32> {
    Query::new(query)?.score(content)
}

/// Score every message of `conversations`, best first.
pub(crate) fn search<'a>(
    conversations: impl Iterator<Item = &'a Conversation>,
    query: &Query,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = conversations
        .flat_map(|conv| {
            conv.messages.iter().filter_map(move |message| {
                query.score(&message.content).map(|score| SearchResult {
                    conversation_id: conv.id.clone(),
                    conversation_title: conv.title.clone(),
                    message: message.clone(),
                    score,
                })
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.message.timestamp.cmp(&a.message.timestamp))
    });
    results
}
