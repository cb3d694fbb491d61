/// Test Runner - Scores Candidate Code Against Test Cases
///
/// **Two judging modes, chosen by the language runner:**
/// - Embedded (Python, JavaScript, TypeScript): one sandboxed run of a
///   generated harness that calls the entry point per case and prints verdict lines
/// - Stdio (Go, Rust, Bash): one sandboxed run per case, input as JSON on
///   stdin, stdout judged with canonical equality
///
/// The runner never spawns processes itself; every run goes through `SandboxExecutor`.

use crate::error::DegradedReason;
use crate::harness::{generate_harness, judge_stdio, parse_verdicts, stdio_input};
use crate::language::{runner_for, HarnessStyle};
use crate::oracle::RepairOracle;
use crate::sandbox::{RunLimits, SandboxExecutor};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use verifix_common::types::{Language, TestCase, TestCaseResult};

#[derive(Clone)]
pub struct TestRunner {
    executor: SandboxExecutor,
    oracle: Option<Arc<dyn RepairOracle>>,
    llm_test_generation: bool,
}

impl TestRunner {
    pub fn new(executor: SandboxExecutor) -> Self {
        Self {
            executor,
            oracle: None,
            llm_test_generation: false,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RepairOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_llm_test_generation(mut self, enabled: bool) -> Self {
        self.llm_test_generation = enabled;
        self
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Run `cases` against `code`. Empty input yields empty output without running anything.
    #[instrument(skip(self, code, cases, dependencies), fields(language = %language, cases = cases.len()))]
    pub async fn run_tests(
        &self,
        code: &str,
        cases: &[TestCase],
        language: Language,
        entry_point: Option<&str>,
        limits: RunLimits,
        dependencies: &[String],
    ) -> Vec<TestCaseResult> {
        if cases.is_empty() {
            return Vec::new();
        }

        let style = runner_for(language).harness_style();
        let results = match generate_harness(style, code, cases, entry_point) {
            Some(harness) => {
                let run = self.executor.execute(&harness, language, limits, dependencies).await;
                debug!(exit_code = run.exit_code, "Harness finished");
                parse_verdicts(&run.stdout, &run.stderr, cases)
            }
            None => {
                debug_assert_eq!(style, HarnessStyle::Stdio);
                let mut results = Vec::with_capacity(cases.len());
                for case in cases {
                    let input = stdio_input(case);
                    let run = self
                        .executor
                        .execute_with_stdin(code, language, limits, dependencies, Some(&input))
                        .await;
                    results.push(judge_stdio(case, &run));
                }
                results
            }
        };

        let passed = results.iter().filter(|r| r.passed).count();
        info!(passed, total = results.len(), "Test cases scored");
        results
    }

    /// Test cases for code that arrived without any. Falls back to a single
    /// smoke case when generation is disabled or the oracle degrades.
    #[instrument(skip(self, code), fields(language = %language))]
    pub async fn auto_generate_tests(&self, code: &str, language: Language) -> Vec<TestCase> {
        match self.try_generate_tests(code, language).await {
            Ok(cases) => {
                info!(count = cases.len(), "Generated test cases");
                cases
            }
            Err(DegradedReason::Disabled) => vec![TestCase::smoke()],
            Err(reason) => {
                warn!(reason = %reason, "Test generation degraded, using smoke test");
                vec![TestCase::smoke()]
            }
        }
    }

    async fn try_generate_tests(&self, code: &str, language: Language) -> Result<Vec<TestCase>, DegradedReason> {
        if !self.llm_test_generation {
            return Err(DegradedReason::Disabled);
        }
        let oracle = self.oracle.as_ref().ok_or(DegradedReason::Disabled)?;
        oracle.generate_tests(code, language).await
    }
}
