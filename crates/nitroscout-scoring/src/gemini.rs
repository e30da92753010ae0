use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::credentials::Credential;
use crate::oracle::{OracleError, OracleRequest, OracleScore, ScoringOracle};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Scoring oracle backed by the Gemini `generateContent` endpoint in JSON response mode.
#[derive(Debug, Clone)]
pub struct GeminiOracle {
    http: reqwest::Client,
    base_url: String,
    model: String,
    knowledge: String,
}

impl GeminiOracle {
    pub fn new(model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: GEMINI_API_URL.to_string(),
            model: model.to_string(),
            knowledge: String::new(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Product knowledge embedded in every prompt, cut to `max_bytes`.
    pub fn with_knowledge(mut self, knowledge: &str, max_bytes: usize) -> Self {
        self.knowledge = truncate_to_char_boundary(knowledge, max_bytes).to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn prompt(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let items = serde_json::to_string_pretty(&request.items)
            .map_err(|e| OracleError::Malformed(format!("encoding request items: {e}")))?;
        let knowledge = if self.knowledge.trim().is_empty() {
            "(no product notes available)"
        } else {
            self.knowledge.as_str()
        };
        Ok(format!(
            "You review developer-community discussions for a product team looking for \
             conversations where they can genuinely help.\n\n\
             PRODUCT NOTES:\n{knowledge}\n\n\
             COMMUNITY: {community}\n\n\
             Score every item below from 0 (irrelevant) to 10 (a developer actively asking \
             for what the product does). Favour concrete technical pain points, comparisons \
             with alternatives and questions about MCP servers/clients or SDKs. Penalise \
             announcements, job posts and off-topic threads.\n\n\
             Return ONLY a JSON array with exactly one object per item: \
             [{{\"id\": string, \"score\": integer, \"rationale\": string}}]. Use the ids \
             verbatim and keep each rationale under 25 words.\n\n\
             ITEMS:\n{items}",
            community = request.community,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

/// Classify a non-success response; Gemini reports quota errors as 429 and/or
/// `RESOURCE_EXHAUSTED` in the body.
fn classify_failure(status: StatusCode, body: &str) -> OracleError {
    let snippet = truncate_to_char_boundary(body, 300);
    let message = format!("Gemini API error ({status}): {snippet}");
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        OracleError::RateLimited(message)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        OracleError::Transport(message)
    } else {
        OracleError::Malformed(message)
    }
}

/// Pull the score array out of the model's text, tolerating a fenced code block.
pub fn parse_scores(text: &str) -> Result<Vec<OracleScore>, OracleError> {
    let cleaned = strip_code_blocks(text);
    serde_json::from_str::<Vec<OracleScore>>(cleaned)
        .or_else(|_| {
            // some responses wrap the array: {"scores": [...]}
            #[derive(Deserialize)]
            struct Wrapped {
                scores: Vec<OracleScore>,
            }
            serde_json::from_str::<Wrapped>(cleaned).map(|w| w.scores)
        })
        .map_err(|e| OracleError::Malformed(format!("unparseable score array: {e}")))
}

#[async_trait]
impl ScoringOracle for GeminiOracle {
    async fn score_batch(
        &self,
        credential: &Credential,
        request: &OracleRequest,
    ) -> Result<Vec<OracleScore>, OracleError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let prompt = self.prompt(request)?;
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.2,
            },
        });

        debug!(model = %self.model, community = %request.community, items = request.items.len(), credential = %credential.label, "Gemini scoring request");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &credential.secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Malformed(format!("decoding Gemini envelope: {e}")))?;
        let output = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .map(|p| p.text)
            .collect::<String>();
        if output.trim().is_empty() {
            return Err(OracleError::Malformed("Gemini returned no text".to_string()));
        }
        parse_scores(&output)
    }
}

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown code fences from a model response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
