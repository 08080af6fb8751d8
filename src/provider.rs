use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// One cited web source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub title: String,
    pub link: String,
}

/// Run-local source index → record. Keys stay stable once assigned.
pub type SourceMap = BTreeMap<usize, SourceRecord>;

/// Grounded search output: answer text with interleaved citation markers
/// plus the sources those markers refer to.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub text: String,
    pub sources: SourceMap,
}

/// Learnings and follow-up candidates distilled from one search result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Extraction {
    pub learnings: Vec<String>,
    pub follow_up_questions: Vec<String>,
}

/// Recommended research scope for a query.
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchPlan {
    pub breadth: u32,
    pub depth: u32,
    pub explanation: String,
}

/// The external AI capability the orchestrator schedules calls against.
///
/// Implementations own transport, recovery, and prompt wording; the
/// orchestrator only sees these seven operations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Recommend breadth/depth for researching `query`.
    async fn plan(&self, query: &str) -> Result<ResearchPlan, ClientError>;

    /// Clarifying questions to put to the user before researching.
    async fn followups(&self, query: &str, max_n: usize) -> Result<Vec<String>, ClientError>;

    /// Candidate sub-queries for `query`, avoiding anything in `history`.
    async fn subqueries(
        &self,
        query: &str,
        max_n: usize,
        learnings: &[String],
        history: &[String],
    ) -> Result<Vec<String>, ClientError>;

    /// Web-grounded search.
    async fn search(&self, query: &str) -> Result<SearchResult, ClientError>;

    /// Distill learnings and follow-up questions from a search result.
    async fn extract(
        &self,
        query: &str,
        text: &str,
        max_learnings: usize,
        max_followups: usize,
    ) -> Result<Extraction, ClientError>;

    /// Whether two queries would surface substantially the same results.
    async fn similar(&self, query_a: &str, query_b: &str) -> Result<bool, ClientError>;

    /// Long-form report over the aggregated findings.
    async fn report(
        &self,
        query: &str,
        learnings: &[String],
        sources: &SourceMap,
    ) -> Result<String, ClientError>;
}

/// Merge `new` into `seen`, deduplicating by link. First-seen entries keep
/// their index and title; new links are appended past the current maximum
/// index in their own index order.
pub fn merge_sources(seen: &mut SourceMap, new: &SourceMap) {
    let mut next_idx = seen.keys().max().map_or(0, |max| max + 1);
    for record in new.values() {
        if seen.values().any(|existing| existing.link == record.link) {
            continue;
        }
        seen.insert(next_idx, record.clone());
        next_idx += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, link: &str) -> SourceRecord {
        SourceRecord {
            title: title.to_string(),
            link: link.to_string(),
        }
    }

    #[test]
    fn test_merge_offsets_past_current_max() {
        let mut seen = SourceMap::new();
        seen.insert(0, record("a", "https://a.example"));
        seen.insert(1, record("b", "https://b.example"));

        let mut new = SourceMap::new();
        new.insert(0, record("c", "https://c.example"));
        merge_sources(&mut seen, &new);

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[&2].link, "https://c.example");
    }

    #[test]
    fn test_merge_dedups_by_link_first_seen_wins() {
        let mut seen = SourceMap::new();
        seen.insert(0, record("original title", "https://a.example"));

        let mut new = SourceMap::new();
        new.insert(0, record("different title", "https://a.example"));
        new.insert(1, record("fresh", "https://b.example"));
        merge_sources(&mut seen, &new);

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[&0].title, "original title");
        assert_eq!(seen[&1].title, "fresh");
    }

    #[test]
    fn test_merge_into_empty_preserves_order() {
        let mut seen = SourceMap::new();
        let mut new = SourceMap::new();
        new.insert(3, record("x", "https://x.example"));
        new.insert(7, record("y", "https://y.example"));
        merge_sources(&mut seen, &new);

        assert_eq!(seen[&0].link, "https://x.example");
        assert_eq!(seen[&1].link, "https://y.example");
    }

    #[test]
    fn test_merge_never_duplicates_links() {
        let mut seen = SourceMap::new();
        let mut new = SourceMap::new();
        new.insert(0, record("a", "https://a.example"));
        new.insert(1, record("a again", "https://a.example"));
        merge_sources(&mut seen, &new);
        merge_sources(&mut seen, &new);

        assert_eq!(seen.len(), 1);
        let links: Vec<_> = seen.values().map(|r| r.link.as_str()).collect();
        assert_eq!(links, vec!["https://a.example"]);
    }
}
