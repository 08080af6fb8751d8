use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

/// Scores follow-up candidates so the orchestrator can decide which branch
/// is worth recursing into. Optional: the control loop runs unchanged
/// without one.
pub trait FollowUpStrategy: Send {
    /// Expected reward for pursuing this query.
    fn score(&self, query: &str) -> f64;

    /// Record an observed reward in [0, 1] for a processed query.
    fn observe(&mut self, query: &str, reward: f64);

    /// Pick one candidate to pursue.
    fn select<'a>(&mut self, candidates: &'a [String]) -> Option<&'a str>;
}

/// Flags under-explored entities from accumulated learnings. Advisory only;
/// never redirects dispatch.
pub trait GapAnalysis: Send {
    fn ingest(&mut self, learning: &str);

    /// Entities whose co-occurrence degree is below `threshold`.
    fn gaps(&self, threshold: usize) -> Vec<String>;
}

/// Epsilon-greedy reward tracker over query texts.
///
/// Unseen queries carry a neutral prior of 1.0, so fresh follow-ups are
/// preferred over branches that already under-delivered.
pub struct QueryBandit {
    rewards: HashMap<String, Vec<f64>>,
    epsilon: f64,
}

impl QueryBandit {
    pub fn new() -> Self {
        Self::with_epsilon(0.1)
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        Self {
            rewards: HashMap::new(),
            epsilon,
        }
    }
}

impl Default for QueryBandit {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowUpStrategy for QueryBandit {
    fn score(&self, query: &str) -> f64 {
        match self.rewards.get(query) {
            Some(samples) if !samples.is_empty() => {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
            _ => 1.0,
        }
    }

    fn observe(&mut self, query: &str, reward: f64) {
        self.rewards
            .entry(query.to_string())
            .or_default()
            .push(reward.clamp(0.0, 1.0));
    }

    fn select<'a>(&mut self, candidates: &'a [String]) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.epsilon {
            return Some(&candidates[rng.gen_range(0..candidates.len())]);
        }
        candidates
            .iter()
            .max_by(|a, b| {
                self.score(a)
                    .partial_cmp(&self.score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(String::as_str)
    }
}

static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z][A-Za-z0-9]+(?:\s+[A-Z][A-Za-z0-9]+)*").unwrap());

// Sentence-leading words that the capitalization heuristic would otherwise
// mistake for entities.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "of", "and", "for", "with", "this", "that", "these", "those",
    "it", "its", "is", "are", "was", "were", "however", "although", "according", "during",
];

/// Co-occurrence graph over entities mentioned in learnings.
#[derive(Default)]
pub struct KnowledgeGraph {
    degrees: HashMap<String, usize>,
    edges: Vec<(String, String)>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.degrees.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn extract_entities(text: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        for m in ENTITY_RE.find_iter(text) {
            // Sentence-leading capitals drag stopwords into the match
            // ("The Tokio runtime" -> "The Tokio"); trim them off.
            let mut words: Vec<String> = m
                .as_str()
                .split_whitespace()
                .map(str::to_lowercase)
                .collect();
            while words
                .first()
                .map_or(false, |w| STOPWORDS.contains(&w.as_str()))
            {
                words.remove(0);
            }
            if words.is_empty() {
                continue;
            }
            let normalized = words.join(" ");
            if normalized.len() < 3 {
                continue;
            }
            seen.insert(normalized);
        }
        seen.into_iter().collect()
    }
}

impl GapAnalysis for KnowledgeGraph {
    fn ingest(&mut self, learning: &str) {
        let entities = Self::extract_entities(learning);
        for entity in &entities {
            self.degrees.entry(entity.clone()).or_insert(0);
        }
        // Pairwise co-occurrence among entities of the same learning.
        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                self.edges.push((entities[i].clone(), entities[j].clone()));
                *self.degrees.get_mut(&entities[i]).unwrap() += 1;
                *self.degrees.get_mut(&entities[j]).unwrap() += 1;
            }
        }
    }

    fn gaps(&self, threshold: usize) -> Vec<String> {
        let mut flagged: Vec<String> = self
            .degrees
            .iter()
            .filter(|(_, degree)| **degree < threshold)
            .map(|(entity, _)| entity.clone())
            .collect();
        flagged.sort();
        flagged
    }
}
