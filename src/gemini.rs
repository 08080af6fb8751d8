use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::GeminiConfig;
use crate::error::ClientError;
use crate::progress::{self, Kind};
use crate::provider::{
    Extraction, Provider, ResearchPlan, SearchResult, SourceMap, SourceRecord,
};
use crate::schema::Schema;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

macro_rules! debug_eprintln {
    ($($arg:tt)*) => {
        if std::env::var("DEEPSCOUT_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}

/// How much output the caller wants the provider to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Brief,
    Standard,
    Detailed,
}

impl Verbosity {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "brief" => Verbosity::Brief,
            "detailed" => Verbosity::Detailed,
            _ => Verbosity::Standard,
        }
    }

    pub fn max_output_tokens(self) -> u32 {
        match self {
            Verbosity::Brief => 1024,
            Verbosity::Standard => 4096,
            Verbosity::Detailed => 8192,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget per endpoint before it is skipped in rotation.
    pub max_retries: u32,
    /// How long a rate-limited endpoint sits out.
    pub cooldown: Duration,
    /// Base unit for the exponential backoff between attempts. One second
    /// in production; tests shrink it.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(60),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Endpoint {
    name: String,
    retries: u32,
    cooled_until: Option<Instant>,
}

#[derive(Debug)]
struct PoolState {
    endpoints: Vec<Endpoint>,
    current: usize,
}

impl PoolState {
    fn current_model(&self) -> String {
        self.endpoints[self.current].name.clone()
    }

    fn record_failure(&mut self, err: &ClientError, policy: &RetryPolicy) {
        let endpoint = &mut self.endpoints[self.current];
        endpoint.retries += 1;
        if matches!(err, ClientError::RateLimited(_)) {
            endpoint.cooled_until = Some(Instant::now() + policy.cooldown);
            progress::log_with(
                Kind::Client,
                format!("{} hit rate limit, cooling down", endpoint.name),
            );
        }
    }

    /// Advance to the next endpoint that is under its retry budget and not
    /// cooling down. Coming full circle forgives one retry on every
    /// endpoint and stays put.
    fn rotate(&mut self, policy: &RetryPolicy) {
        let original = self.current;
        loop {
            self.current = (self.current + 1) % self.endpoints.len();
            if self.current == original {
                for endpoint in &mut self.endpoints {
                    endpoint.retries = endpoint.retries.saturating_sub(1);
                }
                break;
            }
            let endpoint = &self.endpoints[self.current];
            if endpoint.retries >= policy.max_retries {
                continue;
            }
            if let Some(until) = endpoint.cooled_until {
                if Instant::now() < until {
                    continue;
                }
            }
            break;
        }
    }
}

fn backoff_delay(attempt: u32, unit: Duration) -> Duration {
    let capped = (1u64 << attempt.min(16)).min(60) as f64;
    let jitter = 0.5 + rand::thread_rng().gen::<f64>();
    Duration::from_secs_f64(unit.as_secs_f64() * capped * jitter)
}

/// Runs provider operations against an ordered list of model endpoints,
/// rotating away from failing ones with backoff. Endpoint health is shared
/// across concurrent callers, so a sibling's rate limit moves everyone to
/// the next model.
pub struct ResilientPool {
    state: Mutex<PoolState>,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl ResilientPool {
    pub fn new(models: Vec<String>, policy: RetryPolicy) -> Self {
        let endpoints: Vec<Endpoint> = models
            .into_iter()
            .map(|name| Endpoint {
                name,
                retries: 0,
                cooled_until: None,
            })
            .collect();
        assert!(!endpoints.is_empty(), "endpoint list must not be empty");
        let max_attempts = policy.max_retries * endpoints.len() as u32;
        Self {
            state: Mutex::new(PoolState {
                endpoints,
                current: 0,
            }),
            policy,
            max_attempts,
        }
    }

    #[allow(dead_code)]
    pub async fn current_model(&self) -> String {
        self.state.lock().await.current_model()
    }

    /// Run `op` against the currently selected endpoint, rotating and
    /// backing off on failure. Gives up after `max_retries × endpoints`
    /// cumulative attempts.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempts = 0u32;
        loop {
            let model = self.state.lock().await.current_model();
            match op(model.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempts += 1;
                    progress::log_with(
                        Kind::Client,
                        format!(
                            "{} failed ({}/{}): {}",
                            model, attempts, self.max_attempts, err
                        ),
                    );
                    if attempts >= self.max_attempts {
                        return Err(ClientError::Exhausted { attempts });
                    }
                    {
                        let mut state = self.state.lock().await;
                        state.record_failure(&err, &self.policy);
                        state.rotate(&self.policy);
                    }
                    tokio::time::sleep(backoff_delay(attempts, self.policy.backoff_unit)).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
    #[serde(default)]
    grounding_supports: Vec<GroundingSupport>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingSupport {
    segment: Option<Segment>,
    #[serde(default)]
    grounding_chunk_indices: Vec<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Segment {
    end_index: Option<usize>,
}

impl GenerateResponse {
    fn primary_text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .map(|part| part.text.as_str())
            .collect();
        Some(text)
    }
}

/// Insert `[[n]](link)` markers into `answer` at the character offsets the
/// provider reported, and build the local source map from the grounding
/// chunks. Overlapping offsets keep the first marker.
fn interleave_citations(answer: &str, metadata: &GroundingMetadata) -> (String, SourceMap) {
    let mut sources = SourceMap::new();
    for (i, chunk) in metadata.grounding_chunks.iter().enumerate() {
        if let Some(web) = &chunk.web {
            sources.insert(
                i,
                SourceRecord {
                    title: web.title.clone(),
                    link: web.uri.clone(),
                },
            );
        }
    }

    let mut citations: Vec<(usize, String)> = Vec::new();
    for support in &metadata.grounding_supports {
        let Some(end) = support.segment.as_ref().and_then(|s| s.end_index) else {
            continue;
        };
        let Some(&idx) = support.grounding_chunk_indices.first() else {
            continue;
        };
        if let Some(record) = sources.get(&idx) {
            citations.push((end, format!("[[{}]]({})", idx + 1, record.link)));
        }
    }
    citations.sort_by_key(|(pos, _)| *pos);

    let chars: Vec<char> = answer.chars().collect();
    let mut result = String::with_capacity(answer.len());
    let mut last = 0usize;
    for (pos, marker) in citations {
        let pos = pos.min(chars.len());
        if pos < last {
            continue;
        }
        result.extend(chars[last..pos].iter());
        result.push_str(&marker);
        last = pos;
    }
    result.extend(chars[last..].iter());

    (result, sources)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Gemini-backed implementation of the provider capability contract, with
/// model failover handled by [`ResilientPool`].
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    pool: ResilientPool,
    verbosity: Verbosity,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &GeminiConfig, timeout: Duration) -> Self {
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            cooldown: Duration::from_secs(config.cooldown_secs),
            ..RetryPolicy::default()
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            pool: ResilientPool::new(config.models.clone(), policy),
            verbosity: Verbosity::parse(&config.verbosity),
        }
    }

    fn text_config(&self, temperature: f32) -> GenerationConfig {
        GenerationConfig {
            temperature,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: self.verbosity.max_output_tokens(),
            response_mime_type: None,
            response_schema: None,
        }
    }

    fn json_config(&self, schema: &Schema, temperature: f32) -> GenerationConfig {
        GenerationConfig {
            temperature,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: self.verbosity.max_output_tokens(),
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(schema.to_value()),
        }
    }

    fn user_request(prompt: &str, config: GenerationConfig, tools: Option<Vec<Value>>) -> GenerateRequest {
        GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: config,
            tools,
        }
    }

    async fn call_model(
        &self,
        model: String,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, ClientError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClientError::Other(anyhow::Error::new(e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug_eprintln!("[gemini] {} -> {}: {}", model, status, body);
            return Err(ClientError::from_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Other(anyhow::Error::new(e)))
    }

    async fn structured_op(
        &self,
        model: String,
        request: GenerateRequest,
    ) -> Result<Value, ClientError> {
        let response = self.call_model(model, request).await?;
        let text = response
            .primary_text()
            .ok_or_else(|| ClientError::Other(anyhow!("response carried no candidates")))?;
        serde_json::from_str(&text)
            .map_err(|e| ClientError::Other(anyhow!("structured response was not JSON: {}", e)))
    }

    /// Generate output constrained to `schema`, retrying across endpoints.
    pub async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Schema,
    ) -> Result<Value, ClientError> {
        self.generate_structured_at(prompt, schema, 1.0).await
    }

    async fn generate_structured_at(
        &self,
        prompt: &str,
        schema: &Schema,
        temperature: f32,
    ) -> Result<Value, ClientError> {
        let request = Self::user_request(prompt, self.json_config(schema, temperature), None);
        self.pool
            .execute(|model| self.structured_op(model, request.clone()))
            .await
    }

    /// Like [`generate_structured`], but accepting a loose schema
    /// declaration which is repaired once at construction; a declaration
    /// that still does not parse fails the call.
    #[allow(dead_code)]
    pub async fn generate_structured_loose(
        &self,
        prompt: &str,
        loose_schema: &Value,
    ) -> Result<Value, ClientError> {
        let schema = Schema::from_value(loose_schema)
            .map_err(|e| ClientError::SchemaInvalid(e.to_string()))?;
        self.generate_structured(prompt, &schema).await
    }

    /// Plain text generation at the configured verbosity tier.
    pub async fn generate_text(&self, prompt: &str, temperature: f32) -> Result<String, ClientError> {
        let request = Self::user_request(prompt, self.text_config(temperature), None);
        let response = self
            .pool
            .execute(|model| self.call_model(model, request.clone()))
            .await?;
        response
            .primary_text()
            .ok_or_else(|| ClientError::Other(anyhow!("response carried no candidates")))
    }

    async fn search_op(
        &self,
        model: String,
        request: GenerateRequest,
    ) -> Result<SearchResult, ClientError> {
        let response = self.call_model(model, request).await?;
        let text = response
            .primary_text()
            .ok_or_else(|| ClientError::Other(anyhow!("search response carried no candidates")))?;
        let metadata = response
            .candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref());
        Ok(match metadata {
            Some(metadata) => {
                let (text, sources) = interleave_citations(&text, metadata);
                SearchResult { text, sources }
            }
            None => SearchResult {
                text,
                sources: SourceMap::new(),
            },
        })
    }
}

#[async_trait]
impl Provider for GeminiClient {
    async fn plan(&self, query: &str) -> Result<ResearchPlan, ClientError> {
        let prompt = format!(
            "You are a research planning assistant. Judge how wide and how deep the research \
             for the query below should go.\n\n\
             Breadth: 1 (very narrow) to 10 (extensive, multidisciplinary). Default 4.\n\
             Depth: 1 (basic overview) to 5 (highly detailed analysis). Default 2.\n\
             Harder or more open-ended questions warrant higher values on one or both scales. \
             Explain your recommendation briefly.\n\n\
             <query>{query}</query>"
        );
        let schema = Schema::object(vec![
            ("breadth", Schema::Number),
            ("depth", Schema::Number),
            ("explanation", Schema::String),
        ]);
        let value = self.generate_structured(&prompt, &schema).await?;
        let breadth = value["breadth"].as_f64().unwrap_or(4.0).round() as u32;
        let depth = value["depth"].as_f64().unwrap_or(2.0).round() as u32;
        Ok(ResearchPlan {
            breadth: breadth.clamp(1, 10),
            depth: depth.clamp(1, 5),
            explanation: value["explanation"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn followups(&self, query: &str, max_n: usize) -> Result<Vec<String>, ClientError> {
        let prompt = format!(
            "Given the user's research query, ask clarifying questions that would sharpen the \
             direction of the research. Return at most {max_n} questions, or fewer if the query \
             is already clear.\n\n<query>{query}</query>"
        );
        let schema = Schema::object(vec![(
            "follow_up_queries",
            Schema::array(Schema::String),
        )]);
        let value = self.generate_structured(&prompt, &schema).await?;
        Ok(string_array(&value["follow_up_queries"], max_n))
    }

    async fn subqueries(
        &self,
        query: &str,
        max_n: usize,
        learnings: &[String],
        history: &[String],
    ) -> Result<Vec<String>, ClientError> {
        let mut prompt = format!(
            "Given the user's prompt, generate a list of web search queries to research the \
             topic. Return at most {max_n} queries, or fewer if the prompt is already specific. \
             Each query must be unique and substantially different from the others AND from the \
             previously asked queries; avoid semantic duplicates that would surface the same \
             results.\n\n<prompt>{query}</prompt>"
        );
        if !history.is_empty() {
            prompt.push_str("\n\nPreviously asked queries (avoid generating similar ones):\n");
            for h in history {
                prompt.push_str(&format!("- {h}\n"));
            }
        }
        if !learnings.is_empty() {
            prompt.push_str(
                "\nLearnings from earlier research, use them to generate more specific queries:\n",
            );
            for l in learnings {
                prompt.push_str(&format!("- {l}\n"));
            }
        }
        let schema = Schema::object(vec![("queries", Schema::array(Schema::String))]);
        let value = self.generate_structured(&prompt, &schema).await?;
        Ok(string_array(&value["queries"], max_n))
    }

    async fn search(&self, query: &str) -> Result<SearchResult, ClientError> {
        let config = GenerationConfig {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: Verbosity::Detailed.max_output_tokens(),
            response_mime_type: None,
            response_schema: None,
        };
        let tools = Some(vec![serde_json::json!({"google_search": {}})]);
        let request = Self::user_request(query, config, tools);
        self.pool
            .execute(|model| self.search_op(model, request.clone()))
            .await
    }

    async fn extract(
        &self,
        query: &str,
        text: &str,
        max_learnings: usize,
        max_followups: usize,
    ) -> Result<Extraction, ClientError> {
        let prompt = format!(
            "Given the following result of a web search for <query>{query}</query>, distill a \
             list of learnings. Return at most {max_learnings} learnings, or fewer if the result \
             is thin. Each learning must be unique, concise, and as information-dense as \
             possible: keep every entity (people, places, companies, products), metric, number, \
             and date. Also propose up to {max_followups} follow-up questions that would deepen \
             the research.\n\nSearch result:\n{text}"
        );
        let schema = Schema::object(vec![
            ("learnings", Schema::array(Schema::String)),
            ("follow_up_questions", Schema::array(Schema::String)),
        ]);
        let value = self.generate_structured(&prompt, &schema).await?;
        let mut extraction: Extraction = serde_json::from_value(value)
            .map_err(|e| ClientError::Other(anyhow!("extraction shape mismatch: {}", e)))?;
        extraction.learnings.truncate(max_learnings);
        extraction.follow_up_questions.truncate(max_followups);
        Ok(extraction)
    }

    async fn similar(&self, query_a: &str, query_b: &str) -> Result<bool, ClientError> {
        let prompt = format!(
            "Compare these two search queries and decide whether they are semantically similar, \
             i.e. likely to surface substantially the same search results or cover the same \
             topic.\n\nQuery 1: {query_a}\nQuery 2: {query_b}\n\nConsider the key concepts and \
             entities, the intent behind each query, their scope and specificity, and how much \
             the core topics overlap. Answer true only if they are substantially similar."
        );
        let schema = Schema::object(vec![("are_similar", Schema::Boolean)]);
        // Low temperature keeps the judgement consistent across calls.
        let value = self.generate_structured_at(&prompt, &schema, 0.1).await?;
        Ok(value["are_similar"].as_bool().unwrap_or(false))
    }

    async fn report(
        &self,
        query: &str,
        learnings: &[String],
        sources: &SourceMap,
    ) -> Result<String, ClientError> {
        let learnings_text: String = learnings.iter().map(|l| format!("- {l}\n")).collect();
        let sources_text: String = sources
            .values()
            .map(|s| format!("- {}: {}\n", s.title, s.link))
            .collect();
        let prompt = format!(
            "You are a research analyst synthesizing findings into an engaging, informative \
             report. Write a comprehensive research report based on the query and findings \
             below. Structure it however best fits the material, include every relevant data \
             point while keeping the prose readable, stay factually accurate, close with clear \
             conclusions, and cite sources where appropriate.\n\n\
             Original query: {query}\n\nKey findings:\n{learnings_text}\n\
             Sources consulted:\n{sources_text}"
        );
        let mut report = self.generate_text(&prompt, 0.9).await?;
        report.push_str("\n\n# Sources\n");
        for record in sources.values() {
            report.push_str(&format!("- [{}]({})\n", record.title, record.link));
        }
        Ok(report)
    }
}

fn string_array(value: &Value, max_n: usize) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .take(max_n)
                .collect()
        })
        .unwrap_or_default()
}
