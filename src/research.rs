use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::ResearchConfig;
use crate::progress::{self, Kind};
use crate::provider::{merge_sources, Provider, SourceMap};
use crate::strategy::{FollowUpStrategy, GapAnalysis};
use crate::tree::{ProgressTree, TreeSnapshot};

/// Named parameter bundle controlling breadth, concurrency, and recursion
/// aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fast,
    Balanced,
    Comprehensive,
}

impl Mode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Mode::Fast,
            "comprehensive" => Mode::Comprehensive,
            _ => Mode::Balanced,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Balanced => "balanced",
            Mode::Comprehensive => "comprehensive",
        }
    }

    /// Upper bound on generated sub-queries per planning step.
    pub fn max_queries(self) -> usize {
        match self {
            Mode::Fast => 3,
            Mode::Balanced => 7,
            // kept lower than balanced: recursion multiplies the branch count
            Mode::Comprehensive => 5,
        }
    }

    /// Queries processed concurrently within one batch.
    pub fn max_concurrency(self) -> usize {
        match self {
            Mode::Fast => 5,
            Mode::Balanced => 3,
            Mode::Comprehensive => 2,
        }
    }

    /// Learnings requested per processed query.
    pub fn learning_density(self) -> usize {
        match self {
            Mode::Fast => 2,
            Mode::Balanced => 3,
            Mode::Comprehensive => 5,
        }
    }

    /// How many levels of recursive follow-up exploration are allowed.
    pub fn max_recursive_depth(self) -> u32 {
        match self {
            Mode::Fast => 1,
            Mode::Balanced => 2,
            Mode::Comprehensive => 3,
        }
    }

    /// Quality score a branch must reach before one follow-up is pursued.
    /// Comprehensive mode has no gate; it always pursues follow-ups.
    pub fn confidence_threshold(self) -> Option<f64> {
        match self {
            Mode::Fast => Some(0.5),
            Mode::Balanced => Some(0.6),
            Mode::Comprehensive => None,
        }
    }

    /// Follow-up question candidates requested per query, proportional to
    /// the learning density.
    pub fn followup_budget(self) -> usize {
        (self.learning_density() / 2).max(1)
    }

    pub fn batch_pause(self) -> Duration {
        match self {
            Mode::Fast => Duration::from_millis(500),
            Mode::Balanced => Duration::from_millis(1000),
            Mode::Comprehensive => Duration::from_millis(1500),
        }
    }

    /// Per-call timeout knob handed to the HTTP client. Not enforced per
    /// branch by the orchestrator.
    pub fn call_timeout(self) -> Duration {
        match self {
            Mode::Fast => Duration::from_secs(60),
            Mode::Balanced => Duration::from_secs(120),
            Mode::Comprehensive => Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResearchProgress {
    Started,
    Planning,
    BatchStarted(usize, usize),      // current batch, total batches
    QueryStarted(String),
    QueryCompleted(String, usize),   // query, learnings obtained
    Recursing(String, String),       // parent query, follow-up query
    Aggregating,
    Completed(usize, usize),         // completed nodes, total nodes
}

/// Runtime knobs that are not part of the mode table.
#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub batch_pause: Duration,
    /// Gate recursive follow-ups on a semantic-similarity check against
    /// the query history.
    pub similarity_gate: bool,
    pub results_dir: PathBuf,
    pub gap_threshold: usize,
    pub save_snapshot: bool,
}

impl ResearchSettings {
    pub fn for_mode(mode: Mode) -> Self {
        Self {
            batch_pause: mode.batch_pause(),
            similarity_gate: true,
            results_dir: PathBuf::from("results"),
            gap_threshold: 2,
            save_snapshot: true,
        }
    }

    /// Override with values from config.toml.
    pub fn apply_config(&mut self, config: &ResearchConfig) {
        self.results_dir = PathBuf::from(&config.results_dir);
        self.gap_threshold = config.gap_threshold;
    }
}

/// Aggregated output of one research run.
#[derive(Debug, Serialize)]
pub struct ResearchResult {
    pub learnings: Vec<String>,
    pub sources: SourceMap,
    pub sanitized_query: String,
    pub tree: Option<TreeSnapshot>,
}

#[derive(Debug, Clone)]
struct QueryTask {
    query: String,
    depth: u32,
    recursion_level: u32,
}

#[derive(Debug)]
struct QueryOutcome {
    task: QueryTask,
    learnings: Vec<String>,
    sources: SourceMap,
    follow_ups: Vec<String>,
    /// Learnings obtained over the learning-density target, in [0, 1].
    quality: f64,
}

#[derive(Default)]
struct Aggregates {
    learnings: Vec<String>,
    seen_learnings: HashSet<String>,
    sources: SourceMap,
}

/// The recursive fan-out/fan-in control loop: plans sub-queries, dispatches
/// them in bounded batches, pursues qualifying follow-ups through a work
/// queue, and reconciles everything into one aggregated result and progress
/// tree.
pub struct ResearchOrchestrator {
    provider: Arc<dyn Provider>,
    mode: Mode,
    settings: ResearchSettings,
    history: HashSet<String>,
    strategy: Option<Box<dyn FollowUpStrategy>>,
    gaps: Option<Box<dyn GapAnalysis>>,
    progress_tx: Option<mpsc::UnboundedSender<ResearchProgress>>,
}

impl ResearchOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, mode: Mode) -> Self {
        Self {
            provider,
            mode,
            settings: ResearchSettings::for_mode(mode),
            history: HashSet::new(),
            strategy: None,
            gaps: None,
            progress_tx: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn FollowUpStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_gap_analysis(mut self, gaps: Box<dyn GapAnalysis>) -> Self {
        self.gaps = Some(gaps);
        self
    }

    pub fn override_settings(&mut self, settings: ResearchSettings) {
        self.settings = settings;
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<ResearchProgress>) {
        self.progress_tx = Some(tx);
    }

    fn send_progress(&self, update: ResearchProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update);
        }
    }

    /// Run one research invocation. A failure while generating the initial
    /// sub-queries aborts the run; failures inside individual branches are
    /// contained and yield empty results for that branch only.
    pub async fn run(
        &mut self,
        query: &str,
        breadth: u32,
        depth: u32,
        prior_learnings: &[String],
    ) -> Result<ResearchResult> {
        self.send_progress(ResearchProgress::Started);
        let mut tree = ProgressTree::new();
        tree.start(query, depth, None);
        self.history.insert(query.to_string());

        self.send_progress(ResearchProgress::Planning);
        let max_queries = (breadth as usize).min(self.mode.max_queries());
        let history: Vec<String> = self.history.iter().cloned().collect();
        let candidates = self
            .provider
            .subqueries(query, max_queries, prior_learnings, &history)
            .await
            .context("sub-query generation failed")?;
        progress::log_with(
            Kind::Plan,
            format!("planned {} sub-queries for '{}'", candidates.len(), query),
        );
        for candidate in &candidates {
            self.history.insert(candidate.clone());
        }
        let sub_queries: Vec<String> = candidates
            .into_iter()
            .take(breadth as usize)
            .collect();
        // Register every planned sub-query before the first batch runs, so
        // the root cannot cascade to completed while later batches are
        // still waiting their turn.
        for sub_query in &sub_queries {
            tree.start(sub_query, depth, Some(query));
        }

        let mut aggregates = Aggregates::default();
        let batch_count = sub_queries
            .chunks(self.mode.max_concurrency())
            .count();
        let chunks: Vec<Vec<String>> = sub_queries
            .chunks(self.mode.max_concurrency())
            .map(|c| c.to_vec())
            .collect();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 && !self.settings.batch_pause.is_zero() {
                // breathe between batches so the provider's rate limiter
                // does not see a constant burst
                tokio::time::sleep(self.settings.batch_pause).await;
            }
            self.send_progress(ResearchProgress::BatchStarted(i + 1, batch_count));
            let seed: Vec<QueryTask> = chunk
                .into_iter()
                .map(|q| QueryTask {
                    query: q,
                    depth,
                    recursion_level: 0,
                })
                .collect();
            self.run_round(&mut tree, &mut aggregates, query, seed)
                .await;
        }

        self.send_progress(ResearchProgress::Aggregating);
        tree.complete(query);

        if let Some(gaps) = self.gaps.as_ref() {
            let flagged = gaps.gaps(self.settings.gap_threshold);
            if !flagged.is_empty() {
                progress::log_with(
                    Kind::Graph,
                    format!("under-explored entities: {}", flagged.join(", ")),
                );
            }
        }

        let sanitized_query = sanitize_query_name(query);
        let snapshot = tree.snapshot();
        if self.settings.save_snapshot {
            if let Some(snapshot) = &snapshot {
                let path = self.save_snapshot(&sanitized_query, snapshot)?;
                progress::log(format!("research tree saved to {}", path.display()));
            }
        }

        self.send_progress(ResearchProgress::Completed(tree.completed(), tree.total()));
        Ok(ResearchResult {
            learnings: aggregates.learnings,
            sources: aggregates.sources,
            sanitized_query,
            tree: snapshot,
        })
    }

    /// Drain one batch through the work queue: seed tasks run first, and
    /// qualifying follow-ups are enqueued into the same round, so the batch
    /// resolves only once every recursive sub-branch it spawned resolves.
    /// At most `max_concurrency` tasks are in flight at a time.
    async fn run_round(
        &mut self,
        tree: &mut ProgressTree,
        aggregates: &mut Aggregates,
        parent: &str,
        seed: Vec<QueryTask>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryOutcome>();
        let mut pending: VecDeque<QueryTask> = VecDeque::new();
        for task in seed {
            tree.start(&task.query, task.depth, Some(parent));
            pending.push_back(task);
        }

        let mut in_flight = 0usize;
        loop {
            while in_flight < self.mode.max_concurrency() {
                let Some(task) = pending.pop_front() else {
                    break;
                };
                self.send_progress(ResearchProgress::QueryStarted(task.query.clone()));
                let provider = self.provider.clone();
                let tx = tx.clone();
                let max_learnings = self.mode.learning_density();
                let max_followups = self.mode.followup_budget();
                tokio::spawn(async move {
                    let outcome =
                        process_query(provider, task, max_learnings, max_followups).await;
                    let _ = tx.send(outcome);
                });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Some(outcome) = rx.recv().await else {
                break;
            };
            in_flight -= 1;
            self.handle_outcome(tree, aggregates, &mut pending, outcome)
                .await;
        }
    }

    async fn handle_outcome(
        &mut self,
        tree: &mut ProgressTree,
        aggregates: &mut Aggregates,
        pending: &mut VecDeque<QueryTask>,
        outcome: QueryOutcome,
    ) {
        for learning in &outcome.learnings {
            tree.add_learning(&outcome.task.query, learning);
            if let Some(gaps) = self.gaps.as_mut() {
                gaps.ingest(learning);
            }
            if aggregates.seen_learnings.insert(learning.clone()) {
                aggregates.learnings.push(learning.clone());
            }
        }
        merge_sources(&mut aggregates.sources, &outcome.sources);

        if let Some(strategy) = self.strategy.as_mut() {
            strategy.observe(&outcome.task.query, outcome.quality);
        }

        let mut spawned_children = false;
        if self.recursion_allowed(&outcome.task) {
            for follow_up in self.choose_follow_ups(&outcome) {
                if !self.is_novel(&follow_up).await {
                    progress::log(format!("skipping near-duplicate follow-up: {}", follow_up));
                    continue;
                }
                self.history.insert(follow_up.clone());
                self.send_progress(ResearchProgress::Recursing(
                    outcome.task.query.clone(),
                    follow_up.clone(),
                ));
                let child = QueryTask {
                    query: follow_up,
                    depth: outcome.task.depth - 1,
                    recursion_level: outcome.task.recursion_level + 1,
                };
                tree.start(&child.query, child.depth, Some(&outcome.task.query));
                pending.push_back(child);
                spawned_children = true;
            }
        }

        // A branch with children is completed by the cascade once its last
        // child completes, preserving child-before-parent completion order.
        if !spawned_children {
            tree.complete(&outcome.task.query);
        }
        self.send_progress(ResearchProgress::QueryCompleted(
            outcome.task.query.clone(),
            outcome.learnings.len(),
        ));
    }

    fn recursion_allowed(&self, task: &QueryTask) -> bool {
        task.recursion_level < self.mode.max_recursive_depth() && task.depth > 1
    }

    /// Which of a branch's follow-up candidates to pursue. Comprehensive
    /// mode takes up to two, strategy-ranked; fast/balanced take one, and
    /// only when the branch's quality score clears the mode threshold.
    fn choose_follow_ups(&mut self, outcome: &QueryOutcome) -> Vec<String> {
        let candidates: Vec<String> = outcome
            .follow_ups
            .iter()
            .filter(|c| !c.trim().is_empty())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let take = match self.mode.confidence_threshold() {
            Some(threshold) if outcome.quality < threshold => return Vec::new(),
            Some(_) => 1,
            None => 2,
        };

        let mut remaining = candidates;
        let mut chosen = Vec::new();
        while chosen.len() < take && !remaining.is_empty() {
            let pick = match self.strategy.as_mut() {
                Some(strategy) => strategy.select(&remaining).map(str::to_string),
                None => remaining.first().cloned(),
            };
            let Some(pick) = pick else {
                break;
            };
            remaining.retain(|c| c != &pick);
            chosen.push(pick);
        }
        chosen
    }

    /// Reject follow-ups that exactly match, or are semantically similar
    /// to, anything already asked this run. A similarity-check failure
    /// counts as "not similar" so a flaky provider cannot silence a branch.
    async fn is_novel(&self, candidate: &str) -> bool {
        if self.history.contains(candidate) {
            return false;
        }
        if !self.settings.similarity_gate {
            return true;
        }
        for prior in &self.history {
            match self.provider.similar(candidate, prior).await {
                Ok(true) => return false,
                Ok(false) => {}
                Err(e) => {
                    progress::log_with(
                        Kind::Client,
                        format!("similarity check failed, assuming novel: {}", e),
                    );
                }
            }
        }
        true
    }

    fn save_snapshot(&self, sanitized: &str, snapshot: &TreeSnapshot) -> Result<PathBuf> {
        let dir = self.settings.results_dir.join("trees");
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("research_tree_{}.json", sanitized));
        fs::write(&path, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// One branch's processing: search, extract, score. Any failure is
/// contained here and yields an empty outcome; retries happen below this
/// layer, inside the provider client.
async fn process_query(
    provider: Arc<dyn Provider>,
    task: QueryTask,
    max_learnings: usize,
    max_followups: usize,
) -> QueryOutcome {
    match try_process(provider.as_ref(), &task.query, max_learnings, max_followups).await {
        Ok((learnings, sources, follow_ups)) => {
            let quality = if max_learnings == 0 {
                0.0
            } else {
                (learnings.len() as f64 / max_learnings as f64).min(1.0)
            };
            QueryOutcome {
                task,
                learnings,
                sources,
                follow_ups,
                quality,
            }
        }
        Err(e) => {
            eprintln!("[research] query '{}' failed: {:#}", task.query, e);
            progress::log_with(
                Kind::Search,
                format!("branch '{}' failed, continuing without it", task.query),
            );
            QueryOutcome {
                task,
                learnings: Vec::new(),
                sources: SourceMap::new(),
                follow_ups: Vec::new(),
                quality: 0.0,
            }
        }
    }
}

async fn try_process(
    provider: &dyn Provider,
    query: &str,
    max_learnings: usize,
    max_followups: usize,
) -> Result<(Vec<String>, SourceMap, Vec<String>)> {
    let result = provider.search(query).await?;
    progress::log_with(
        Kind::Search,
        format!("searched '{}' ({} sources)", query, result.sources.len()),
    );
    let extraction = provider
        .extract(query, &result.text, max_learnings, max_followups)
        .await?;
    progress::log_with(
        Kind::Extract,
        format!(
            "extracted {} learnings from '{}'",
            extraction.learnings.len(),
            query
        ),
    );
    Ok((
        extraction.learnings,
        result.sources,
        extraction.follow_up_questions,
    ))
}

static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new("_+").unwrap());

/// Filesystem-safe, run-unique name for a query: non-alphanumeric characters
/// become underscores, runs collapse, the stem is capped at 100 characters,
/// and a timestamp suffix keeps repeated runs of the same query distinct.
pub fn sanitize_query_name(query: &str) -> String {
    let replaced: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let stem: String = collapsed.trim_matches('_').chars().take(100).collect();
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}", stem, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::provider::{Extraction, ResearchPlan, SearchResult, SourceRecord};
    use crate::strategy::{KnowledgeGraph, QueryBandit};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockCalls {
        subqueries_max_n: Option<usize>,
        searched: Vec<String>,
    }

    #[derive(Default)]
    struct MockProvider {
        sub_queries: Vec<String>,
        extractions: HashMap<String, Extraction>,
        sources: HashMap<String, SourceRecord>,
        fail_extract: HashSet<String>,
        fail_subqueries: bool,
        similar_always: bool,
        calls: Mutex<MockCalls>,
    }

    impl MockProvider {
        fn with_sub_queries(queries: &[&str]) -> Self {
            MockProvider {
                sub_queries: queries.iter().map(|q| q.to_string()).collect(),
                ..Default::default()
            }
        }

        fn learn(mut self, query: &str, learnings: &[&str], follow_ups: &[&str]) -> Self {
            self.extractions.insert(
                query.to_string(),
                Extraction {
                    learnings: learnings.iter().map(|l| l.to_string()).collect(),
                    follow_up_questions: follow_ups.iter().map(|f| f.to_string()).collect(),
                },
            );
            self
        }

        fn source(mut self, query: &str, title: &str, link: &str) -> Self {
            self.sources.insert(
                query.to_string(),
                SourceRecord {
                    title: title.to_string(),
                    link: link.to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn plan(&self, _query: &str) -> Result<ResearchPlan, ClientError> {
            Ok(ResearchPlan {
                breadth: 4,
                depth: 2,
                explanation: String::new(),
            })
        }

        async fn followups(
            &self,
            _query: &str,
            _max_n: usize,
        ) -> Result<Vec<String>, ClientError> {
            Ok(Vec::new())
        }

        async fn subqueries(
            &self,
            _query: &str,
            max_n: usize,
            _learnings: &[String],
            _history: &[String],
        ) -> Result<Vec<String>, ClientError> {
            if self.fail_subqueries {
                return Err(ClientError::TransientServer("planner down".to_string()));
            }
            self.calls.lock().unwrap().subqueries_max_n = Some(max_n);
            Ok(self.sub_queries.iter().take(max_n).cloned().collect())
        }

        async fn search(&self, query: &str) -> Result<SearchResult, ClientError> {
            self.calls.lock().unwrap().searched.push(query.to_string());
            let mut sources = SourceMap::new();
            if let Some(record) = self.sources.get(query) {
                sources.insert(0, record.clone());
            }
            Ok(SearchResult {
                text: format!("search results for {}", query),
                sources,
            })
        }

        async fn extract(
            &self,
            query: &str,
            _text: &str,
            max_learnings: usize,
            max_followups: usize,
        ) -> Result<Extraction, ClientError> {
            if self.fail_extract.contains(query) {
                return Err(ClientError::TransientServer("extractor down".to_string()));
            }
            let mut extraction = self.extractions.get(query).cloned().unwrap_or_default();
            extraction.learnings.truncate(max_learnings);
            extraction.follow_up_questions.truncate(max_followups);
            Ok(extraction)
        }

        async fn similar(&self, _a: &str, _b: &str) -> Result<bool, ClientError> {
            Ok(self.similar_always)
        }

        async fn report(
            &self,
            _query: &str,
            _learnings: &[String],
            _sources: &SourceMap,
        ) -> Result<String, ClientError> {
            Ok(String::new())
        }
    }

    fn test_orchestrator(provider: MockProvider, mode: Mode) -> ResearchOrchestrator {
        let mut orchestrator = ResearchOrchestrator::new(Arc::new(provider), mode);
        orchestrator.override_settings(ResearchSettings {
            batch_pause: Duration::ZERO,
            similarity_gate: false,
            results_dir: PathBuf::from("results"),
            gap_threshold: 2,
            save_snapshot: false,
        });
        orchestrator
    }

    #[tokio::test]
    async fn test_balanced_run_aggregates_all_branches() {
        let provider = MockProvider::with_sub_queries(&["a", "b", "c"])
            .learn("a", &["learning a"], &["follow a"])
            .learn("b", &["learning b"], &["follow b"])
            .learn("c", &["learning c"], &["follow c"])
            .source("a", "A", "https://a.example")
            .source("b", "B", "https://b.example")
            .source("c", "C", "https://c.example");
        let mut orchestrator = test_orchestrator(provider, Mode::Balanced);

        let result = orchestrator.run("X", 5, 2, &[]).await.unwrap();

        // One learning against a density target of three is below the
        // balanced confidence threshold, so nothing recursed.
        assert_eq!(result.learnings.len(), 3);
        assert_eq!(result.sources.len(), 3);
        let tree = result.tree.unwrap();
        assert_eq!(tree.sub_queries.len(), 3);
        assert!(matches!(tree.status, crate::tree::NodeStatus::Completed));
        for child in &tree.sub_queries {
            assert!(matches!(child.status, crate::tree::NodeStatus::Completed));
            assert!(child.sub_queries.is_empty());
        }
    }

    #[tokio::test]
    async fn test_duplicate_links_merge_to_single_source() {
        let provider = MockProvider::with_sub_queries(&["a", "b"])
            .learn("a", &["learning a"], &[])
            .learn("b", &["learning b"], &[])
            .source("a", "title from a", "https://shared.example")
            .source("b", "title from b", "https://shared.example");
        let mut orchestrator = test_orchestrator(provider, Mode::Balanced);

        let result = orchestrator.run("X", 5, 2, &[]).await.unwrap();

        assert_eq!(result.sources.len(), 1);
        let record = &result.sources[&0];
        assert_eq!(record.link, "https://shared.example");
        // whichever branch landed first kept its title
        assert!(record.title == "title from a" || record.title == "title from b");
    }

    #[tokio::test]
    async fn test_branch_failure_is_contained() {
        let mut provider = MockProvider::with_sub_queries(&["a", "b", "c"])
            .learn("a", &["learning a"], &[])
            .learn("c", &["learning c"], &[]);
        provider.fail_extract.insert("b".to_string());
        let mut orchestrator = test_orchestrator(provider, Mode::Balanced);

        let result = orchestrator.run("X", 5, 2, &[]).await.unwrap();

        assert_eq!(result.learnings.len(), 2);
        let tree = result.tree.unwrap();
        assert!(matches!(tree.status, crate::tree::NodeStatus::Completed));
        let b = tree
            .sub_queries
            .iter()
            .find(|n| n.query == "b")
            .expect("failed branch still registered");
        assert!(matches!(b.status, crate::tree::NodeStatus::Completed));
        assert!(b.learnings.is_empty());
    }

    #[tokio::test]
    async fn test_plan_failure_aborts_run() {
        let provider = MockProvider {
            fail_subqueries: true,
            ..Default::default()
        };
        let mut orchestrator = test_orchestrator(provider, Mode::Balanced);
        assert!(orchestrator.run("X", 4, 2, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_fast_mode_caps_planner_and_recursion_depth() {
        // Two learnings hit the fast density target, so every branch
        // qualifies for one follow-up; the depth budget must still stop
        // recursion after one extra level.
        let provider = Arc::new(
            MockProvider::with_sub_queries(&["a", "b", "c", "d", "e"])
                .learn("a", &["a1", "a2"], &["f-a"])
                .learn("b", &["b1", "b2"], &["f-b"])
                .learn("c", &["c1", "c2"], &["f-c"])
                .learn("f-a", &["fa1", "fa2"], &["ff-a"])
                .learn("f-b", &["fb1", "fb2"], &["ff-b"])
                .learn("f-c", &["fc1", "fc2"], &["ff-c"]),
        );
        let mut orchestrator = ResearchOrchestrator::new(provider.clone(), Mode::Fast);
        orchestrator.override_settings(ResearchSettings {
            batch_pause: Duration::ZERO,
            similarity_gate: false,
            results_dir: PathBuf::from("results"),
            gap_threshold: 2,
            save_snapshot: false,
        });

        let result = orchestrator.run("X", 5, 3, &[]).await.unwrap();
        let tree = result.tree.unwrap();

        // breadth 5 in fast mode asks the planner for at most three queries
        assert_eq!(provider.calls.lock().unwrap().subqueries_max_n, Some(3));

        assert_eq!(tree.sub_queries.len(), 3);
        for child in &tree.sub_queries {
            assert_eq!(child.sub_queries.len(), 1, "one follow-up per branch");
            let grandchild = &child.sub_queries[0];
            assert!(
                grandchild.sub_queries.is_empty(),
                "recursion exceeded the fast-mode depth budget"
            );
        }
        assert!(matches!(tree.status, crate::tree::NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_comprehensive_mode_pursues_two_follow_ups() {
        let provider = MockProvider::with_sub_queries(&["a"])
            .learn("a", &["a1"], &["f1", "f2", "f3"])
            .learn("f1", &[], &[])
            .learn("f2", &[], &[])
            .learn("f3", &[], &[]);
        let mut orchestrator = test_orchestrator(provider, Mode::Comprehensive)
            .with_strategy(Box::new(QueryBandit::with_epsilon(0.0)));

        let result = orchestrator.run("X", 1, 2, &[]).await.unwrap();
        let tree = result.tree.unwrap();
        let a = &tree.sub_queries[0];
        assert_eq!(a.sub_queries.len(), 2);
    }

    #[tokio::test]
    async fn test_similarity_gate_blocks_near_duplicates() {
        let mut provider = MockProvider::with_sub_queries(&["a"])
            .learn("a", &["a1", "a2"], &["f-a"])
            .learn("f-a", &[], &[]);
        provider.similar_always = true;
        let mut orchestrator = test_orchestrator(provider, Mode::Fast);
        let mut settings = ResearchSettings::for_mode(Mode::Fast);
        settings.batch_pause = Duration::ZERO;
        settings.save_snapshot = false;
        settings.similarity_gate = true;
        orchestrator.override_settings(settings);

        let result = orchestrator.run("X", 3, 3, &[]).await.unwrap();
        let tree = result.tree.unwrap();
        assert!(tree.sub_queries[0].sub_queries.is_empty());
    }

    #[tokio::test]
    async fn test_history_contains_every_issued_query_once() {
        let provider = MockProvider::with_sub_queries(&["a", "b"])
            .learn("a", &["a1", "a2"], &["f-a"])
            .learn("b", &["b1", "b2"], &[])
            .learn("f-a", &[], &[]);
        let mut orchestrator = test_orchestrator(provider, Mode::Fast);

        orchestrator.run("X", 5, 3, &[]).await.unwrap();

        let expected: HashSet<String> = ["X", "a", "b", "f-a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(orchestrator.history, expected);
    }

    #[tokio::test]
    async fn test_gap_analysis_is_fed_but_advisory() {
        let provider = MockProvider::with_sub_queries(&["a"])
            .learn("a", &["Tokio powers Linkerd", "Hyper is fast"], &[]);
        let mut orchestrator =
            test_orchestrator(provider, Mode::Balanced).with_gap_analysis(Box::new(
                KnowledgeGraph::new(),
            ));

        let result = orchestrator.run("X", 2, 2, &[]).await.unwrap();
        // gap detection never alters dispatch
        assert_eq!(result.tree.unwrap().sub_queries.len(), 1);
    }

    #[test]
    fn test_mode_table() {
        assert_eq!(Mode::Fast.max_queries(), 3);
        assert_eq!(Mode::Balanced.max_queries(), 7);
        assert_eq!(Mode::Comprehensive.max_queries(), 5);
        assert_eq!(Mode::Fast.max_concurrency(), 5);
        assert_eq!(Mode::Balanced.learning_density(), 3);
        assert_eq!(Mode::Comprehensive.max_recursive_depth(), 3);
        assert_eq!(Mode::Comprehensive.followup_budget(), 2);
        assert_eq!(Mode::Fast.followup_budget(), 1);
        assert_eq!(Mode::parse("FAST"), Mode::Fast);
        assert_eq!(Mode::parse("unknown"), Mode::Balanced);
    }

    #[test]
    fn test_sanitize_query_name() {
        let name = sanitize_query_name("What's new in Rust async, 2025?!");
        assert!(name.starts_with("What_s_new_in_Rust_async_2025_"));
        assert!(!name.contains("__"));
        // stem capped at 100 chars plus a 15-char timestamp suffix
        let long = sanitize_query_name(&"x".repeat(500));
        assert!(long.len() <= 100 + 16);
        assert_eq!(&long[long.len() - 16..long.len() - 15], "_");
    }
}
