use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Exit code reported when the wall-clock timeout fires (mirrors coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the resource monitor kills a process for memory.
pub const MEMORY_KILL_EXIT_CODE: i32 = 137;

/// Description carried by the default "runs without error" test case.
pub const SMOKE_TEST_DESCRIPTION: &str = "Code runs without errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Go,
    Rust,
    Bash,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Javascript,
        Language::Typescript,
        Language::Go,
        Language::Rust,
        Language::Bash,
    ];

    /// Parse a user-supplied language name. Accepts a few common aliases.
    pub fn from_str(s: &str) -> Option<Language> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::Javascript),
            "typescript" | "ts" => Some(Language::Typescript),
            "go" | "golang" => Some(Language::Go),
            "rust" | "rs" => Some(Language::Rust),
            "bash" | "sh" | "shell" => Some(Language::Bash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable input to a single verification or single-shot execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default)]
    pub test_cases: Option<Vec<TestCase>>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Per-attempt wall-clock override, clamped to the configured ceiling.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Per-attempt memory override, clamped to the configured ceiling.
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            test_cases: None,
            dependencies: Vec::new(),
            entry_point: None,
            timeout_seconds: None,
            memory_limit_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub expected_output: Value,
    #[serde(default)]
    pub description: String,
}

impl TestCase {
    pub fn new(input: Map<String, Value>, expected_output: Value, description: impl Into<String>) -> Self {
        Self {
            input,
            expected_output,
            description: description.into(),
        }
    }

    /// The default case used when no tests are supplied: asserts only that the code runs.
    pub fn smoke() -> Self {
        Self::new(Map::new(), Value::Null, SMOKE_TEST_DESCRIPTION)
    }

    pub fn is_smoke(&self) -> bool {
        self.input.is_empty()
            && self.expected_output.is_null()
            && self.description == SMOKE_TEST_DESCRIPTION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub test_case: TestCase,
    pub passed: bool,
    #[serde(default)]
    pub actual_output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of one sandboxed run.
///
/// `success` holds only if the process exited 0 and every test case passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: f64,
    pub memory_usage_mb: f64,
    #[serde(default)]
    pub test_results: Vec<TestCaseResult>,
}

impl ExecutionResult {
    /// A failed result for a request that never reached a process.
    pub fn client_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            execution_time_ms: 0.0,
            memory_usage_mb: 0.0,
            test_results: Vec::new(),
        }
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// Attach test verdicts and recompute `success`.
    pub fn apply_test_results(&mut self, results: Vec<TestCaseResult>) {
        self.success = self.exit_code == 0 && results.iter().all(|r| r.passed);
        self.test_results = results;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Verified,
    Failed,
    Timeout,
}

/// Durable output of one verification loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub id: Uuid,
    pub original_code: String,
    pub verified_code: String,
    pub language: Language,
    pub attempts: u32,
    pub all_results: Vec<ExecutionResult>,
    pub final_status: FinalStatus,
    pub fixes_applied: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl VerificationResult {
    /// Start an empty record for `code`; attempts are appended as they complete.
    pub fn begin(code: &str, language: Language) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_code: code.to_string(),
            verified_code: code.to_string(),
            language,
            attempts: 0,
            all_results: Vec::new(),
            final_status: FinalStatus::Failed,
            fixes_applied: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn record_attempt(&mut self, result: ExecutionResult) {
        self.all_results.push(result);
        self.attempts = self.all_results.len() as u32;
    }

    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.all_results.last()
    }
}
