/// Repair Oracle - External Code-Fix and Test-Generation Collaborator
///
/// Every call returns `Result<_, DegradedReason>`; callers decide the fallback
/// (unchanged code for repairs, the smoke test for generation).

use crate::error::DegradedReason;
use crate::sandbox::{truncate_chars, MAX_TEST_CASES};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, instrument};
use verifix_common::config::OracleConfig;
use verifix_common::types::{Language, TestCase};

/// Error context sent with a repair prompt is capped at this many characters.
pub const MAX_ERROR_CONTEXT_CHARS: usize = 3000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairRequest {
    pub code: String,
    pub error_text: String,
    pub language: Language,
    pub attempt_number: u32,
}

impl RepairRequest {
    pub fn new(code: &str, error_text: &str, language: Language, attempt_number: u32) -> Self {
        Self {
            code: code.to_string(),
            error_text: truncate_chars(error_text, MAX_ERROR_CONTEXT_CHARS),
            language,
            attempt_number,
        }
    }
}

#[async_trait]
pub trait RepairOracle: Send + Sync {
    /// Propose corrected source for a failed attempt. Returns bare code, fences stripped.
    async fn repair(&self, request: &RepairRequest) -> Result<String, DegradedReason>;

    /// Propose test cases for `code`.
    async fn generate_tests(&self, code: &str, language: Language) -> Result<Vec<TestCase>, DegradedReason>;
}

/// Oracle backed by an OpenAI-compatible chat-completions endpoint.
pub struct HttpRepairOracle {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

const REPAIR_SYSTEM_PROMPT: &str = "You fix broken programs. Reply with the complete corrected source file only, no explanation.";
const TESTS_SYSTEM_PROMPT: &str = "You write test cases for programs. Reply with a JSON array only.";

impl HttpRepairOracle {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build oracle HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key,
        })
    }

    /// `None` when no oracle URL is configured.
    pub fn from_config(config: &OracleConfig) -> Result<Option<Self>> {
        match &config.url {
            Some(url) => Ok(Some(Self::new(url.clone(), config.model.clone(), config.api_key.clone(), config.timeout)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, DegradedReason> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: 0.2,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(degrade)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DegradedReason::BadStatus(status.as_u16()));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                DegradedReason::Timeout
            } else {
                DegradedReason::Malformed(e.to_string())
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| DegradedReason::Malformed("response has no message content".to_string()))
    }
}

fn degrade(e: reqwest::Error) -> DegradedReason {
    if e.is_timeout() {
        DegradedReason::Timeout
    } else {
        DegradedReason::Unreachable(e.to_string())
    }
}

fn repair_prompt(request: &RepairRequest) -> String {
    format!(
        "The following {language} program failed on attempt {attempt}.\n\n\
         Code:\n```{language}\n{code}\n```\n\n\
         Error output:\n```\n{error}\n```\n\n\
         Return the full corrected program. Keep the same entry point and behaviour.",
        language = request.language,
        attempt = request.attempt_number,
        code = request.code,
        error = request.error_text,
    )
}

fn tests_prompt(code: &str, language: Language) -> String {
    format!(
        "Write up to 5 test cases for this {language} program.\n\n\
         ```{language}\n{code}\n```\n\n\
         Reply with a JSON array of objects shaped like \
         {{\"input\": {{\"arg\": value}}, \"expectedOutput\": value, \"description\": \"...\"}}. \
         `input` maps the entry point's parameter names to argument values."
    )
}

#[async_trait]
impl RepairOracle for HttpRepairOracle {
    #[instrument(skip(self, request), fields(language = %request.language, attempt = request.attempt_number))]
    async fn repair(&self, request: &RepairRequest) -> Result<String, DegradedReason> {
        let reply = self.complete(REPAIR_SYSTEM_PROMPT, &repair_prompt(request)).await?;
        let code = strip_code_fences(&reply);
        if code.trim().is_empty() {
            return Err(DegradedReason::Malformed("empty repair".to_string()));
        }
        debug!(bytes = code.len(), "Oracle proposed a repair");
        Ok(code)
    }

    #[instrument(skip(self, code), fields(language = %language))]
    async fn generate_tests(&self, code: &str, language: Language) -> Result<Vec<TestCase>, DegradedReason> {
        let reply = self.complete(TESTS_SYSTEM_PROMPT, &tests_prompt(code, language)).await?;
        parse_test_cases(&reply)
    }
}

/// Extract the body of the first fenced block, or the trimmed text when unfenced.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Skip the info string (```python).
    let body = match after_open.find('\n') {
        Some(newline) => &after_open[newline + 1..],
        None => after_open,
    };
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim_end().to_string()
}

/// Parse an oracle reply into test cases. Non-object inputs are wrapped as `{"input": value}`.
pub fn parse_test_cases(text: &str) -> Result<Vec<TestCase>, DegradedReason> {
    let body = strip_code_fences(text);
    let (Some(start), Some(end)) = (body.find('['), body.rfind(']')) else {
        return Err(DegradedReason::Malformed("no JSON array in reply".to_string()));
    };
    if end < start {
        return Err(DegradedReason::Malformed("no JSON array in reply".to_string()));
    }

    let items: Vec<Value> =
        serde_json::from_str(&body[start..=end]).map_err(|e| DegradedReason::Malformed(e.to_string()))?;

    let cases: Vec<TestCase> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(obj) => Some(obj),
            _ => None,
        })
        .take(MAX_TEST_CASES)
        .enumerate()
        .map(|(i, obj)| test_case_from(i, obj))
        .collect();

    if cases.is_empty() {
        return Err(DegradedReason::Malformed("reply contained no test cases".to_string()));
    }
    Ok(cases)
}

fn test_case_from(index: usize, mut obj: Map<String, Value>) -> TestCase {
    let input = match obj.remove("input") {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), other);
            wrapped
        }
    };
    let expected = obj
        .remove("expectedOutput")
        .or_else(|| obj.remove("expected_output"))
        .or_else(|| obj.remove("expected"))
        .unwrap_or(Value::Null);
    let description = match obj.remove("description") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => format!("Generated test case {}", index + 1),
    };
    TestCase::new(input, expected, description)
}
