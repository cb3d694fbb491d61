// Environment-driven configuration shared by the API, the CLI and the engine
use crate::redis::DEFAULT_RESULT_TTL_SECONDS;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceilings applied to per-request overrides.
pub const MAX_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_MEMORY_LIMIT_MB: u64 = 4096;

#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// OpenAI-compatible chat-completions endpoint. `None` disables the oracle.
    pub url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub redis_url: String,
    pub bind_addr: String,
    pub sandbox_root: PathBuf,
    pub execution_timeout: Duration,
    pub memory_limit_mb: u64,
    pub max_retries: u32,
    /// Overall bound on one verification; exceeding it yields `FinalStatus::Timeout`.
    pub verify_timeout: Option<Duration>,
    pub dependency_timeout: Duration,
    pub result_ttl_seconds: u64,
    pub llm_test_generation: bool,
    pub oracle: OracleConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            sandbox_root: std::env::temp_dir().join("verifix-sandbox"),
            execution_timeout: Duration::from_secs(30),
            memory_limit_mb: 512,
            max_retries: 3,
            verify_timeout: None,
            dependency_timeout: Duration::from_secs(60),
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
            llm_test_generation: false,
            oracle: OracleConfig {
                url: None,
                model: "gpt-4o-mini".to_string(),
                api_key: None,
                timeout: Duration::from_secs(60),
            },
        }
    }
}

impl VerifierConfig {
    /// Load configuration from `VERIFIX_*` / `REDIS_URL` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let execution_timeout = match get("VERIFIX_EXECUTION_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_u64("VERIFIX_EXECUTION_TIMEOUT_SECS", &v)?),
            None => defaults.execution_timeout,
        };
        let verify_timeout = get("VERIFIX_VERIFY_TIMEOUT_SECS")
            .map(|v| parse_u64("VERIFIX_VERIFY_TIMEOUT_SECS", &v).map(Duration::from_secs))
            .transpose()?;
        let dependency_timeout = match get("VERIFIX_DEPENDENCY_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_u64("VERIFIX_DEPENDENCY_TIMEOUT_SECS", &v)?),
            None => defaults.dependency_timeout,
        };
        let oracle_timeout = match get("VERIFIX_ORACLE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_u64("VERIFIX_ORACLE_TIMEOUT_SECS", &v)?),
            None => defaults.oracle.timeout,
        };

        Ok(Self {
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            bind_addr: get("VERIFIX_BIND_ADDR").unwrap_or(defaults.bind_addr),
            sandbox_root: get("VERIFIX_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_root),
            execution_timeout,
            memory_limit_mb: match get("VERIFIX_MEMORY_LIMIT_MB") {
                Some(v) => parse_u64("VERIFIX_MEMORY_LIMIT_MB", &v)?,
                None => defaults.memory_limit_mb,
            },
            max_retries: match get("VERIFIX_MAX_RETRIES") {
                Some(v) => v
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("VERIFIX_MAX_RETRIES must be a non-negative integer, got '{}'", v))?,
                None => defaults.max_retries,
            },
            verify_timeout,
            dependency_timeout,
            result_ttl_seconds: match get("VERIFIX_RESULT_TTL_SECS") {
                Some(v) => parse_u64("VERIFIX_RESULT_TTL_SECS", &v)?,
                None => defaults.result_ttl_seconds,
            },
            llm_test_generation: get("VERIFIX_LLM_TEST_GENERATION")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.llm_test_generation),
            oracle: OracleConfig {
                url: get("VERIFIX_ORACLE_URL"),
                model: get("VERIFIX_ORACLE_MODEL").unwrap_or(defaults.oracle.model),
                api_key: get("VERIFIX_ORACLE_API_KEY"),
                timeout: oracle_timeout,
            },
        })
    }

    /// `maxAttempts`: the first execution is not a retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Resolve a request's per-attempt timeout against the configured default and ceiling.
    pub fn effective_timeout(&self, requested_seconds: Option<u64>) -> Duration {
        match requested_seconds {
            Some(secs) => Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECONDS)),
            None => self.execution_timeout,
        }
    }

    pub fn effective_memory_limit_mb(&self, requested_mb: Option<u64>) -> u64 {
        match requested_mb {
            Some(mb) => mb.clamp(16, MAX_MEMORY_LIMIT_MB),
            None => self.memory_limit_mb,
        }
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, value))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
