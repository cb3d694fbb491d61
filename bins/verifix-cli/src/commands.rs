// CLI commands: local front end over the verification engine
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use verifix_common::config::VerifierConfig;
use verifix_common::types::{
    ExecutionRequest, ExecutionResult, FinalStatus, Language, TestCase, TestCaseResult, VerificationResult,
};
use verifix_engine::{
    validate_request, HttpRepairOracle, MemoryResultStore, RequestError, RunLimits, SandboxExecutor, TestRunner,
    VerificationLoop,
};

pub fn parse_language(name: &str) -> Result<Language, RequestError> {
    Language::from_str(name).ok_or_else(|| RequestError::UnsupportedLanguage(name.to_string()))
}

fn load_config() -> Result<VerifierConfig> {
    VerifierConfig::from_env().context("Failed to load configuration from environment")
}

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read source file {}", file.display()))
}

async fn read_cases(path: &Path) -> Result<Vec<TestCase>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read test cases {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse test cases {}", path.display()))
}

/// One sandboxed run. An unsupported language or invalid request is a failed result, not an error.
pub async fn execute(
    file: &Path,
    language: &str,
    timeout: Option<u64>,
    memory: Option<u64>,
    deps: Vec<String>,
) -> Result<ExecutionResult> {
    let language = match parse_language(language) {
        Ok(language) => language,
        Err(e) => return Ok(ExecutionResult::client_error(e.to_string())),
    };
    let config = load_config()?;

    let mut request = ExecutionRequest::new(read_source(file).await?, language);
    request.timeout_seconds = timeout;
    request.memory_limit_mb = memory;
    request.dependencies = deps;
    if let Err(e) = validate_request(&request) {
        return Ok(ExecutionResult::client_error(e.to_string()));
    }

    let executor = SandboxExecutor::from_config(&config);
    let limits = RunLimits::for_request(&config, &request);
    Ok(executor
        .execute(&request.code, request.language, limits, &request.dependencies)
        .await)
}

pub async fn test(file: &Path, language: &str, cases: &Path, entry_point: Option<String>) -> Result<Vec<TestCaseResult>> {
    let language = parse_language(language)?;
    let config = load_config()?;
    let code = read_source(file).await?;
    let cases = read_cases(cases).await?;
    if cases.is_empty() {
        bail!("No test cases in file");
    }

    let mut request = ExecutionRequest::new(code, language);
    request.test_cases = Some(cases);
    request.entry_point = entry_point;
    validate_request(&request)?;

    let runner = TestRunner::new(SandboxExecutor::from_config(&config));
    let limits = RunLimits::for_request(&config, &request);
    let cases = request.test_cases.as_deref().unwrap_or_default();
    Ok(runner
        .run_tests(&request.code, cases, language, request.entry_point.as_deref(), limits, &[])
        .await)
}

pub async fn verify(
    file: &Path,
    language: &str,
    cases: Option<&Path>,
    entry_point: Option<String>,
    max_retries: Option<u32>,
) -> Result<VerificationResult> {
    let language = parse_language(language)?;
    let mut config = load_config()?;
    if let Some(retries) = max_retries {
        config.max_retries = retries;
    }

    let mut request = ExecutionRequest::new(read_source(file).await?, language);
    request.entry_point = entry_point;
    if let Some(path) = cases {
        request.test_cases = Some(read_cases(path).await?);
    }

    let store = Arc::new(MemoryResultStore::new(Duration::from_secs(config.result_ttl_seconds)));
    let mut verifier = VerificationLoop::new(config.clone(), store);
    if let Some(oracle) = HttpRepairOracle::from_config(&config.oracle)? {
        verifier = verifier.with_oracle(Arc::new(oracle));
    }

    info!(file = %file.display(), language = %language, max_attempts = config.max_attempts(), "Verifying");
    Ok(verifier.verify(&request).await)
}

pub fn is_verified(record: &VerificationResult) -> bool {
    record.final_status == FinalStatus::Verified
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("Failed to write JSON output")?;
    writeln!(stdout)?;
    Ok(())
}
