/// Verification Loop - execute → test → regenerate → retry
///
/// **Loop Contract:**
/// - At most `max_retries + 1` executions per request
/// - Test cases come from the request, or are generated once before the first attempt
/// - A failed attempt with attempts remaining is sent to the repair oracle;
///   the unified diff of the change joins the fix trail
/// - The finished record is persisted with a TTL; persistence failures are logged only
/// - With an overall deadline configured, expiry returns the partial history as `timeout`

use crate::diff::unified_diff;
use crate::error::DegradedReason;
use crate::oracle::{RepairOracle, RepairRequest};
use crate::runner::TestRunner;
use crate::sandbox::{truncate_chars, validate_request, RunLimits, SandboxExecutor};
use crate::store::ResultStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use verifix_common::config::VerifierConfig;
use verifix_common::types::{
    ExecutionRequest, ExecutionResult, FinalStatus, Language, TestCase, TestCaseResult, VerificationResult,
};

/// Bound on a single persistence call so a hung store cannot stall a response.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failing cases listed individually in the stderr summary.
const MAX_SUMMARY_CASES: usize = 10;
const MAX_SUMMARY_VALUE_CHARS: usize = 200;

#[derive(Clone)]
pub struct VerificationLoop {
    config: VerifierConfig,
    executor: SandboxExecutor,
    runner: TestRunner,
    oracle: Option<Arc<dyn RepairOracle>>,
    store: Arc<dyn ResultStore>,
}

impl VerificationLoop {
    pub fn new(config: VerifierConfig, store: Arc<dyn ResultStore>) -> Self {
        let executor = SandboxExecutor::from_config(&config);
        let runner = TestRunner::new(executor.clone()).with_llm_test_generation(config.llm_test_generation);
        Self {
            config,
            executor,
            runner,
            oracle: None,
            store,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RepairOracle>) -> Self {
        self.runner = self.runner.with_oracle(oracle.clone());
        self.oracle = Some(oracle);
        self
    }

    pub fn with_executor(mut self, executor: SandboxExecutor) -> Self {
        let mut runner = TestRunner::new(executor.clone()).with_llm_test_generation(self.config.llm_test_generation);
        if let Some(oracle) = &self.oracle {
            runner = runner.with_oracle(oracle.clone());
        }
        self.executor = executor;
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    pub fn runner(&self) -> &TestRunner {
        &self.runner
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Run the full loop for `request`. Always returns a complete record.
    #[instrument(skip(self, request), fields(language = %request.language, verification_id = tracing::field::Empty))]
    pub async fn verify(&self, request: &ExecutionRequest) -> VerificationResult {
        let mut record = VerificationResult::begin(&request.code, request.language);
        tracing::Span::current().record("verification_id", tracing::field::display(record.id));
        info!(max_attempts = self.config.max_attempts(), "Verification started");

        if let Err(e) = validate_request(request) {
            warn!(error = %e, "Rejected verification request");
            record.record_attempt(ExecutionResult::client_error(e.to_string()));
            record.final_status = FinalStatus::Failed;
            self.persist(&record).await;
            return record;
        }

        match self.config.verify_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.run_loop(request, &mut record)).await.is_err() {
                    warn!(
                        attempts = record.attempts,
                        limit_secs = limit.as_secs_f64(),
                        "Verification exceeded overall deadline"
                    );
                    record.final_status = FinalStatus::Timeout;
                }
            }
            None => self.run_loop(request, &mut record).await,
        }

        info!(
            status = ?record.final_status,
            attempts = record.attempts,
            fixes = record.fixes_applied.len(),
            "Verification finished"
        );
        self.persist(&record).await;
        record
    }

    async fn run_loop(&self, request: &ExecutionRequest, record: &mut VerificationResult) {
        let language = request.language;
        let limits = RunLimits::for_request(&self.config, request);
        let entry_point = request.entry_point.as_deref();
        let max_attempts = self.config.max_attempts();

        let cases = match &request.test_cases {
            Some(cases) => cases.clone(),
            None => self.runner.auto_generate_tests(&request.code, language).await,
        };

        let mut current = request.code.clone();
        for attempt in 1..=max_attempts {
            let mut result = self
                .executor
                .execute(&current, language, limits, &request.dependencies)
                .await;

            if result.success && !cases.is_empty() {
                let test_results = self
                    .runner
                    .run_tests(&current, &cases, language, entry_point, limits, &request.dependencies)
                    .await;
                result.apply_test_results(test_results);
                if !result.success {
                    append_failure_summary(&mut result.stderr, &result.test_results);
                }
            }

            let success = result.success;
            info!(attempt, success, exit_code = result.exit_code, "Attempt finished");
            record.verified_code = current.clone();
            record.record_attempt(result);

            if success {
                record.final_status = FinalStatus::Verified;
                return;
            }
            if attempt == max_attempts {
                break;
            }

            let error_text = match record.last_result() {
                Some(last) if !last.stderr.trim().is_empty() => last.stderr.clone(),
                Some(last) => last.stdout.clone(),
                None => String::new(),
            };
            let next = self.regenerate(&current, &error_text, language, attempt).await;
            record.fixes_applied.push(unified_diff(&current, &next, attempt));
            current = next;
        }

        record.final_status = FinalStatus::Failed;
    }

    /// Ask the oracle for a fix. Any degradation returns `code` unchanged.
    #[instrument(skip(self, code, error_text), fields(language = %language, attempt = attempt_number))]
    pub async fn regenerate(&self, code: &str, error_text: &str, language: Language, attempt_number: u32) -> String {
        match self.try_regenerate(code, error_text, language, attempt_number).await {
            Ok(fixed) => {
                debug!(changed = fixed != code, "Regeneration produced code");
                fixed
            }
            Err(DegradedReason::Disabled) => {
                debug!("No repair oracle configured, keeping code unchanged");
                code.to_string()
            }
            Err(reason) => {
                warn!(reason = %reason, "Regeneration degraded, keeping code unchanged");
                code.to_string()
            }
        }
    }

    async fn try_regenerate(
        &self,
        code: &str,
        error_text: &str,
        language: Language,
        attempt_number: u32,
    ) -> Result<String, DegradedReason> {
        let oracle = self.oracle.as_ref().ok_or(DegradedReason::Disabled)?;
        let request = RepairRequest::new(code, error_text, language, attempt_number);
        tokio::time::timeout(self.config.oracle.timeout, oracle.repair(&request))
            .await
            .map_err(|_| DegradedReason::Timeout)?
    }

    async fn persist(&self, record: &VerificationResult) {
        match tokio::time::timeout(STORE_TIMEOUT, self.store.save(record)).await {
            Ok(Ok(())) => debug!(verification_id = %record.id, "Verification persisted"),
            Ok(Err(e)) => error!(verification_id = %record.id, error = %e, "Failed to persist verification"),
            Err(_) => error!(verification_id = %record.id, "Timed out persisting verification"),
        }
    }
}

/// Append a readable list of failing cases to an attempt's stderr.
fn append_failure_summary(stderr: &mut String, results: &[TestCaseResult]) {
    let failed: Vec<(usize, &TestCaseResult)> = results.iter().enumerate().filter(|(_, r)| !r.passed).collect();
    if failed.is_empty() {
        return;
    }

    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&format!("[Test failures: {} of {} failed]\n", failed.len(), results.len()));

    for (index, result) in failed.iter().take(MAX_SUMMARY_CASES) {
        stderr.push_str(&describe_failure(*index, &result.test_case, result));
        stderr.push('\n');
    }
    if failed.len() > MAX_SUMMARY_CASES {
        stderr.push_str(&format!("... and {} more\n", failed.len() - MAX_SUMMARY_CASES));
    }
}

fn describe_failure(index: usize, case: &TestCase, result: &TestCaseResult) -> String {
    let label = if case.description.is_empty() {
        format!("case {}", index + 1)
    } else {
        format!("case {} ({})", index + 1, case.description)
    };
    let input = truncate_chars(&serde_json::Value::Object(case.input.clone()).to_string(), MAX_SUMMARY_VALUE_CHARS);
    match &result.error {
        Some(error) => format!("- {}: input {} raised {}", label, input, truncate_chars(error, MAX_SUMMARY_VALUE_CHARS)),
        None => format!(
            "- {}: input {} expected {} but got {}",
            label,
            input,
            truncate_chars(&case.expected_output.to_string(), MAX_SUMMARY_VALUE_CHARS),
            truncate_chars(&result.actual_output.to_string(), MAX_SUMMARY_VALUE_CHARS),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResultStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies with queued code in order, then echoes the input code back.
    struct ScriptedOracle {
        replies: Mutex<VecDeque<Result<String, DegradedReason>>>,
        seen: Mutex<Vec<RepairRequest>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<String, DegradedReason>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<RepairRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RepairOracle for ScriptedOracle {
        async fn repair(&self, request: &RepairRequest) -> Result<String, DegradedReason> {
            self.seen.lock().unwrap().push(request.clone());
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(request.code.clone()))
        }

        async fn generate_tests(&self, _code: &str, _language: Language) -> Result<Vec<TestCase>, DegradedReason> {
            Err(DegradedReason::Disabled)
        }
    }

    fn config(root: &tempfile::TempDir, max_retries: u32) -> VerifierConfig {
        VerifierConfig {
            sandbox_root: root.path().to_path_buf(),
            execution_timeout: Duration::from_secs(10),
            memory_limit_mb: 256,
            max_retries,
            ..VerifierConfig::default()
        }
    }

    fn case(input: Value, expected: Value) -> TestCase {
        let Value::Object(input) = input else {
            panic!("input must be an object")
        };
        TestCase::new(input, expected, "")
    }

    fn assert_invariants(v: &VerificationResult) {
        assert_eq!(v.attempts as usize, v.all_results.len());
        let last_success = v.last_result().map(|r| r.success).unwrap_or(false);
        assert_eq!(v.final_status == FinalStatus::Verified, last_success);
        if v.final_status != FinalStatus::Timeout {
            assert_eq!(v.fixes_applied.len() as u32, v.attempts - 1);
        }
        for r in &v.all_results {
            if r.success {
                assert_eq!(r.exit_code, 0);
                assert!(r.test_results.iter().all(|t| t.passed));
            }
        }
    }

    #[tokio::test]
    async fn test_verified_first_try_keeps_code() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let verifier = VerificationLoop::new(config(&root, 3), store.clone());

        let request = ExecutionRequest::new("echo ok", Language::Bash);
        let v = verifier.verify(&request).await;

        assert_eq!(v.final_status, FinalStatus::Verified);
        assert_eq!(v.attempts, 1);
        assert_eq!(v.verified_code, v.original_code);
        // Smoke test from auto-generation was applied.
        assert_eq!(v.all_results[0].test_results.len(), 1);
        assert_invariants(&v);
        assert!(store.load(&v.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repair_on_second_attempt() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let oracle = ScriptedOracle::new(vec![Ok("echo fixed\n".to_string())]);
        let verifier = VerificationLoop::new(config(&root, 3), store).with_oracle(oracle.clone());

        let request = ExecutionRequest::new("echo broken >&2\nexit 1\n", Language::Bash);
        let v = verifier.verify(&request).await;

        assert_eq!(v.final_status, FinalStatus::Verified);
        assert_eq!(v.attempts, 2);
        assert_eq!(v.fixes_applied.len(), 1);
        assert_ne!(v.verified_code, v.original_code);
        assert_eq!(v.verified_code, "echo fixed\n");
        assert!(v.fixes_applied[0].contains("+echo fixed"));
        assert!(v.fixes_applied[0].contains("+++ attempt-1"));
        assert_invariants(&v);

        let seen = oracle.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].attempt_number, 1);
        assert!(seen[0].error_text.contains("broken"));
    }

    #[tokio::test]
    async fn test_unchanged_repairs_exhaust_attempts() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let oracle = ScriptedOracle::new(Vec::new());
        let verifier = VerificationLoop::new(config(&root, 2), store).with_oracle(oracle.clone());

        let v = verifier.verify(&ExecutionRequest::new("exit 1", Language::Bash)).await;

        assert_eq!(v.final_status, FinalStatus::Failed);
        assert_eq!(v.attempts, verifier.config().max_attempts());
        assert_eq!(v.attempts, 3);
        assert_eq!(oracle.seen().len(), 2);
        assert!(v.fixes_applied.iter().all(|d| d.is_empty()));
        assert_invariants(&v);
    }

    #[tokio::test]
    async fn test_degraded_oracle_keeps_code() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let oracle = ScriptedOracle::new(vec![
            Err(DegradedReason::Unreachable("connection refused".to_string())),
            Err(DegradedReason::BadStatus(500)),
        ]);
        let verifier = VerificationLoop::new(config(&root, 2), store).with_oracle(oracle);

        let v = verifier.verify(&ExecutionRequest::new("exit 4", Language::Bash)).await;

        assert_eq!(v.final_status, FinalStatus::Failed);
        assert_eq!(v.verified_code, "exit 4");
        assert!(v.all_results.iter().all(|r| r.exit_code == 4));
        assert_invariants(&v);
    }

    #[tokio::test]
    async fn test_no_oracle_fails_after_max_attempts() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let verifier = VerificationLoop::new(config(&root, 0), store);

        let v = verifier.verify(&ExecutionRequest::new("exit 1", Language::Bash)).await;

        assert_eq!(v.final_status, FinalStatus::Failed);
        assert_eq!(v.attempts, 1);
        assert!(v.fixes_applied.is_empty());
        assert_invariants(&v);
    }

    #[tokio::test]
    async fn test_failing_tests_drive_repair() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let oracle = ScriptedOracle::new(vec![Ok("echo 2\n".to_string())]);
        let verifier = VerificationLoop::new(config(&root, 3), store).with_oracle(oracle.clone());

        let mut request = ExecutionRequest::new("echo 1\n", Language::Bash);
        request.test_cases = Some(vec![TestCase::new(
            serde_json::Map::new(),
            json!(2),
            "prints two",
        )]);
        let v = verifier.verify(&request).await;

        assert_eq!(v.final_status, FinalStatus::Verified);
        assert_eq!(v.attempts, 2);
        let first = &v.all_results[0];
        assert_eq!(first.exit_code, 0);
        assert!(!first.success);
        assert!(first.stderr.contains("[Test failures: 1 of 1 failed]"));
        assert!(first.stderr.contains("prints two"));
        assert!(oracle.seen()[0].error_text.contains("expected 2 but got 1"));
        assert_invariants(&v);
    }

    #[tokio::test]
    async fn test_overall_deadline_returns_partial_history() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let mut cfg = config(&root, 3);
        cfg.verify_timeout = Some(Duration::from_secs(1));
        let verifier = VerificationLoop::new(cfg, store.clone());

        let started = std::time::Instant::now();
        let v = verifier.verify(&ExecutionRequest::new("sleep 30", Language::Bash)).await;

        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(v.final_status, FinalStatus::Timeout);
        assert_eq!(v.attempts as usize, v.all_results.len());
        assert!(store.load(&v.id).await.unwrap().is_some());
        // The abandoned attempt's working directory is still removed.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_single_failed_attempt() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let verifier = VerificationLoop::new(config(&root, 3), store);

        let v = verifier.verify(&ExecutionRequest::new("   ", Language::Python)).await;

        assert_eq!(v.final_status, FinalStatus::Failed);
        assert_eq!(v.attempts, 1);
        assert_eq!(v.all_results[0].exit_code, -1);
        assert_invariants(&v);
    }

    #[tokio::test]
    async fn test_python_harness_verifies_entry_point() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let verifier = VerificationLoop::new(config(&root, 1), store);

        let mut request = ExecutionRequest::new("def main(a, b):\n    return a + b\n", Language::Python);
        request.test_cases = Some(vec![case(json!({"a": 1, "b": 2}), json!(3))]);
        let v = verifier.verify(&request).await;

        assert_eq!(v.final_status, FinalStatus::Verified);
        let results = &v.all_results[0].test_results;
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert_eq!(results[0].actual_output, json!(3));
    }

    #[test]
    fn test_failure_summary_lists_cases() {
        let failing = TestCaseResult {
            test_case: TestCase::new(serde_json::Map::new(), json!([1]), "sorts"),
            passed: false,
            actual_output: json!([2]),
            error: None,
        };
        let crashed = TestCaseResult {
            test_case: TestCase::new(serde_json::Map::new(), json!(1), ""),
            passed: false,
            actual_output: Value::Null,
            error: Some("ZeroDivisionError: division by zero".to_string()),
        };
        let mut stderr = String::from("warning");

        append_failure_summary(&mut stderr, &[failing, crashed]);

        assert!(stderr.starts_with("warning\n[Test failures: 2 of 2 failed]\n"));
        assert!(stderr.contains("- case 1 (sorts): input {} expected [1] but got [2]"));
        assert!(stderr.contains("- case 2: input {} raised ZeroDivisionError"));
    }
}
