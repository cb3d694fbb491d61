/// Sandbox Executor - Isolated, Resource-Capped Code Execution
///
/// **Core Responsibility:**
/// Take source code + language + limits and produce exactly one `ExecutionResult`.
///
/// **Execution Rules:**
/// 1. Fresh, uniquely named working directory under the sandbox root
/// 2. Optional dependency install into that directory (never a shared cache)
/// 3. Typed invocations from the language runner, spawned directly (no shell)
/// 4. CPU-time, address-space and file-size rlimits applied before exec
/// 5. Each child leads its own process group; kills target the whole group
/// 6. Wall-clock timeout via `tokio::time::timeout`, exit code 124 on expiry
/// 7. Resident memory polled by the `ResourceMonitor`, exit code 137 on breach
/// 8. stdout/stderr captured and capped
/// 9. Working directory removed on every path, including cancellation
///
/// Infrastructure failures become failed results; `execute` never errors.

use crate::error::{RequestError, SandboxError};
use crate::language::{runner_for, Invocation, LanguageRunner, Stage};
use crate::monitor::{kill_process_group, kill_process_tree, ResourceMonitor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use verifix_common::config::VerifierConfig;
use verifix_common::types::{ExecutionRequest, ExecutionResult, Language, MEMORY_KILL_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// Safety limits to prevent pathological inputs from reaching a process
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_CASES: usize = 100;
/// Per-stream capture limit, in characters.
pub const MAX_OUTPUT_CHARS: usize = 50_000;
/// Largest file a sandboxed program may write.
const MAX_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Exit code reported when the program could not be started at all.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long to wait for output pipes to drain after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);
/// Memory ceiling for compile stages never drops below this; toolchains
/// fork helpers whose usage counts against the group.
const COMPILE_MEMORY_FLOOR_MB: u64 = 2048;
/// Slack before the independent timeout backstop fires.
const BACKSTOP_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Per-attempt limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub memory_limit_mb: u64,
}

impl RunLimits {
    pub fn new(timeout: Duration, memory_limit_mb: u64) -> Self {
        Self { timeout, memory_limit_mb }
    }

    /// Limits for `request`, resolved against configured defaults and ceilings.
    pub fn for_request(config: &VerifierConfig, request: &ExecutionRequest) -> Self {
        Self {
            timeout: config.effective_timeout(request.timeout_seconds),
            memory_limit_mb: config.effective_memory_limit_mb(request.memory_limit_mb),
        }
    }
}

/// Reject requests that should never reach a sandbox.
pub fn validate_request(request: &ExecutionRequest) -> Result<(), RequestError> {
    if request.code.trim().is_empty() {
        return Err(RequestError::EmptyCode);
    }
    if request.code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(RequestError::CodeTooLarge { max: MAX_SOURCE_CODE_BYTES });
    }
    if let Some(cases) = &request.test_cases {
        if cases.len() > MAX_TEST_CASES {
            return Err(RequestError::TooManyTestCases {
                count: cases.len(),
                max: MAX_TEST_CASES,
            });
        }
    }
    for dep in &request.dependencies {
        // Dependencies become installer arguments; refuse anything that parses as a flag.
        let valid = !dep.is_empty()
            && dep.len() <= 214
            && !dep.starts_with('-')
            && !dep.chars().any(|c| c.is_whitespace() || c.is_control());
        if !valid {
            return Err(RequestError::InvalidDependency(dep.clone()));
        }
    }
    Ok(())
}

/// Working directory guard - guarantees removal on drop.
/// The happy path removes it asynchronously via `cleanup`; drop covers
/// early returns and cancelled futures.
struct WorkDir {
    path: Option<PathBuf>,
}

impl WorkDir {
    async fn create(root: &Path) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(root).await.map_err(|source| SandboxError::WorkDir {
            path: root.to_path_buf(),
            source,
        })?;
        let path = root.join(format!("run-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir(&path).await.map_err(|source| SandboxError::WorkDir {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path: Some(path) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    async fn cleanup(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove working directory");
            }
        }
    }
}

impl Drop for WorkDir {
    // Only reached on early return or cancellation; blocking removal here is a backstop.
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove working directory");
                }
            }
        }
    }
}

/// Kills the child's process group on drop unless disarmed after reaping.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_tree(pid);
        }
    }
}

/// Aborts a helper task when the supervising future goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Limits applied to one spawned process.
#[derive(Debug, Clone, Copy)]
struct ProcessLimits {
    timeout: Duration,
    cpu_seconds: u64,
    address_space_bytes: Option<u64>,
    file_size_bytes: Option<u64>,
    /// Resident-memory ceiling enforced by the monitor.
    monitored_memory_mb: Option<u64>,
}

/// Raw outcome of one spawned process.
#[derive(Debug, Clone, Default)]
struct ProcessOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
    elapsed: Duration,
    timed_out: bool,
    killed_for_memory: bool,
    peak_memory_mb: f64,
}

impl ProcessOutcome {
    fn failed(&self) -> bool {
        self.exit_code != 0 || self.timed_out || self.killed_for_memory
    }
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct RLimits {
    cpu_seconds: u64,
    address_space_bytes: Option<u64>,
    file_size_bytes: Option<u64>,
}

/// Runs in the forked child before exec; only async-signal-safe calls.
#[cfg(unix)]
fn apply_rlimits(limits: &RLimits) -> std::io::Result<()> {
    unsafe {
        let cpu = libc::rlimit {
            rlim_cur: limits.cpu_seconds as libc::rlim_t,
            rlim_max: limits.cpu_seconds as libc::rlim_t,
        };
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(bytes) = limits.address_space_bytes {
            let as_limit = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &as_limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = limits.address_space_bytes;
        }

        if let Some(bytes) = limits.file_size_bytes {
            let fsize = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        let core = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read to EOF, keeping at most `cap` bytes but draining the rest so the child never blocks.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (buf, truncated)
}

async fn collect_output(task: Option<JoinHandle<(Vec<u8>, bool)>>, limit_chars: usize) -> String {
    let Some(mut handle) = task else {
        return String::new();
    };
    let (bytes, truncated) = match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            // Some descendant escaped the process group and still holds the pipe.
            handle.abort();
            (Vec::new(), true)
        }
    };
    let text = String::from_utf8_lossy(&bytes);
    let mut out = truncate_chars(&text, limit_chars);
    if truncated || text.chars().count() > limit_chars {
        out.push_str("\n[output truncated]");
    }
    out
}

/// Longest prefix of `s` with at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn describe_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Process-based sandbox rooted at a shared directory; each run gets a disjoint subdirectory.
#[derive(Clone)]
pub struct SandboxExecutor {
    root: PathBuf,
    monitor: ResourceMonitor,
    dependency_timeout: Duration,
    output_limit_chars: usize,
}

impl SandboxExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            monitor: ResourceMonitor::default(),
            dependency_timeout: Duration::from_secs(60),
            output_limit_chars: MAX_OUTPUT_CHARS,
        }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        Self::new(config.sandbox_root.clone()).with_dependency_timeout(config.dependency_timeout)
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, chars: usize) -> Self {
        self.output_limit_chars = chars;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `code` once under `limits`.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        limits: RunLimits,
        dependencies: &[String],
    ) -> ExecutionResult {
        self.execute_with_stdin(code, language, limits, dependencies, None).await
    }

    /// Run `code` once, feeding `stdin` to the run stage.
    #[instrument(skip(self, code, dependencies, stdin), fields(language = %language, timeout_ms = limits.timeout.as_millis() as u64, memory_mb = limits.memory_limit_mb))]
    pub async fn execute_with_stdin(
        &self,
        code: &str,
        language: Language,
        limits: RunLimits,
        dependencies: &[String],
        stdin: Option<&str>,
    ) -> ExecutionResult {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return ExecutionResult::client_error(format!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            ));
        }

        match self.try_execute(code, runner_for(language), limits, dependencies, stdin).await {
            Ok(result) => {
                info!(
                    success = result.success,
                    exit_code = result.exit_code,
                    execution_ms = result.execution_time_ms as u64,
                    memory_mb = result.memory_usage_mb,
                    "Execution completed"
                );
                result
            }
            Err(e) => {
                error!(error = %e, "Sandbox infrastructure failure");
                let mut result = ExecutionResult::client_error(e.to_string());
                if matches!(e, SandboxError::Spawn { .. }) {
                    result.exit_code = SPAWN_FAILURE_EXIT_CODE;
                }
                result
            }
        }
    }

    async fn try_execute(
        &self,
        code: &str,
        runner: &dyn LanguageRunner,
        limits: RunLimits,
        dependencies: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecutionResult, SandboxError> {
        let workdir = WorkDir::create(&self.root).await?;
        debug!(workdir = %workdir.path().display(), "Working directory created");

        let source_path = workdir.path().join(runner.source_file());
        tokio::fs::write(&source_path, code)
            .await
            .map_err(|source| SandboxError::WriteSource {
                path: source_path.clone(),
                source,
            })?;

        let env = self.environment(runner, workdir.path());

        if !dependencies.is_empty() {
            self.install_dependencies(runner, workdir.path(), &env, dependencies).await;
        }

        let deadline = Instant::now() + limits.timeout;
        let mut elapsed = Duration::ZERO;
        let mut peak_memory_mb: f64 = 0.0;
        let mut last = ProcessOutcome::default();

        for invocation in runner.invocations(workdir.path()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last = ProcessOutcome {
                    timed_out: true,
                    ..ProcessOutcome::default()
                };
                break;
            }

            let process_limits = ProcessLimits {
                timeout: remaining,
                cpu_seconds: limits.timeout.as_secs() + 2,
                address_space_bytes: invocation
                    .cap_address_space
                    .then_some(limits.memory_limit_mb * 1024 * 1024),
                file_size_bytes: Some(MAX_FILE_SIZE_BYTES),
                monitored_memory_mb: Some(match invocation.stage {
                    Stage::Compile => limits.memory_limit_mb.max(COMPILE_MEMORY_FLOOR_MB),
                    Stage::Run => limits.memory_limit_mb,
                }),
            };
            let input = if invocation.stage == Stage::Run { stdin } else { None };

            let outcome = self
                .spawn_and_wait(&invocation, workdir.path(), &env, process_limits, input)
                .await?;
            elapsed += outcome.elapsed;
            peak_memory_mb = peak_memory_mb.max(outcome.peak_memory_mb);

            let failed = outcome.failed();
            if failed && invocation.stage == Stage::Compile {
                warn!(
                    program = %invocation.program,
                    exit_code = outcome.exit_code,
                    "Compilation failed"
                );
            }
            last = outcome;
            if failed {
                break;
            }
        }

        workdir.cleanup().await;

        let mut stderr = last.stderr;
        let exit_code = if last.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "[Timeout: execution timed out after {}]",
                describe_duration(limits.timeout)
            ));
            TIMEOUT_EXIT_CODE
        } else if last.killed_for_memory && last.exit_code != 0 {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "[Process killed: memory limit of {} MB exceeded]",
                limits.memory_limit_mb
            ));
            MEMORY_KILL_EXIT_CODE
        } else {
            last.exit_code
        };

        Ok(ExecutionResult {
            success: exit_code == 0,
            stdout: last.stdout,
            stderr,
            exit_code,
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            memory_usage_mb: peak_memory_mb,
            test_results: Vec::new(),
        })
    }

    /// Base environment: nothing inherited except PATH.
    fn environment(&self, runner: &dyn LanguageRunner, workdir: &Path) -> Vec<(String, String)> {
        let workdir_str = workdir.to_string_lossy().into_owned();
        let mut env = vec![
            (
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            ),
            ("HOME".to_string(), workdir_str.clone()),
            ("TMPDIR".to_string(), workdir_str),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(runner.environment(workdir));
        env
    }

    /// Best effort: a failed install is logged and the run proceeds.
    async fn install_dependencies(
        &self,
        runner: &dyn LanguageRunner,
        workdir: &Path,
        env: &[(String, String)],
        dependencies: &[String],
    ) {
        let Some(steps) = runner.dependency_steps(workdir, dependencies) else {
            warn!(
                language = %runner.language(),
                dependencies = ?dependencies,
                "No isolated dependency installer for language - skipping"
            );
            return;
        };

        let limits = ProcessLimits {
            timeout: self.dependency_timeout,
            cpu_seconds: self.dependency_timeout.as_secs() + 2,
            address_space_bytes: None,
            file_size_bytes: None,
            monitored_memory_mb: None,
        };

        for step in steps {
            info!(command = %step.display(), "Installing dependencies");
            match self.spawn_and_wait(&step, workdir, env, limits, None).await {
                Ok(outcome) if !outcome.failed() => {
                    debug!(elapsed_ms = outcome.elapsed.as_millis() as u64, "Dependency step succeeded");
                }
                Ok(outcome) => {
                    warn!(
                        exit_code = outcome.exit_code,
                        timed_out = outcome.timed_out,
                        error_preview = outcome.stderr.lines().next().unwrap_or(""),
                        "Dependency install failed - continuing without it"
                    );
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Dependency install could not start - continuing without it");
                    return;
                }
            }
        }
    }

    /// Spawn one invocation and supervise it to completion.
    async fn spawn_and_wait(
        &self,
        invocation: &Invocation,
        workdir: &Path,
        env: &[(String, String)],
        limits: ProcessLimits,
        stdin: Option<&str>,
    ) -> Result<ProcessOutcome, SandboxError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(workdir)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            let rlimits = RLimits {
                cpu_seconds: limits.cpu_seconds,
                address_space_bytes: limits.address_space_bytes,
                file_size_bytes: limits.file_size_bytes,
            };
            // SAFETY: apply_rlimits only calls setrlimit, which is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_rlimits(&rlimits));
            }
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        let mut group = ProcessGroupGuard { pid: Some(pid) };
        debug!(pid, command = %invocation.display(), "Process spawned");

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_owned();
            tokio::spawn(async move {
                // A child that exits without reading its input closes the pipe; not an error.
                let _ = pipe.write_all(input.as_bytes()).await;
            });
        }

        let byte_cap = self.output_limit_chars.saturating_mul(4);
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, byte_cap)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s, byte_cap)));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let monitor = self.monitor.clone();
        let memory_limit = limits.monitored_memory_mb;
        let monitor_task = tokio::spawn(async move {
            monitor
                .watch(pid, memory_limit, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let backstop_monitor = self.monitor.clone();
        let backstop_after = limits.timeout + BACKSTOP_GRACE;
        let backstop = AbortOnDrop(tokio::spawn(async move {
            backstop_monitor.check_timeout(pid, backstop_after).await
        }));

        let (status, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
            Ok(status) => (status.map_err(SandboxError::Wait)?, false),
            Err(_) => {
                warn!(
                    pid,
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Execution timed out - killing process tree"
                );
                kill_process_tree(pid);
                (child.wait().await.map_err(SandboxError::Wait)?, true)
            }
        };
        let elapsed = start.elapsed();

        // The leader is reaped and its pid may be reused: only group-wide signals from here on.
        drop(backstop);
        group.disarm();
        kill_process_group(pid);

        let _ = stop_tx.send(());
        let usage = monitor_task.await.unwrap_or_default();

        let stdout = collect_output(stdout_task, self.output_limit_chars).await;
        let stderr = collect_output(stderr_task, self.output_limit_chars).await;

        Ok(ProcessOutcome {
            exit_code: exit_code_of(&status),
            stdout,
            stderr,
            elapsed,
            timed_out,
            killed_for_memory: usage.killed_for_memory,
            peak_memory_mb: usage.peak_memory_mb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verifix_common::types::TestCase;

    fn have(program: &str) -> bool {
        std::process::Command::new(program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn limits(timeout_secs: u64) -> RunLimits {
        RunLimits::new(Duration::from_secs(timeout_secs), 256)
    }

    fn assert_root_empty(root: &Path) {
        let leftover: Vec<_> = std::fs::read_dir(root)
            .map(|entries| entries.filter_map(Result::ok).collect())
            .unwrap_or_default();
        assert!(leftover.is_empty(), "working directories left behind: {:?}", leftover);
    }

    #[test]
    fn test_validate_request() {
        let ok = ExecutionRequest::new("echo hi", Language::Bash);
        assert!(validate_request(&ok).is_ok());

        let empty = ExecutionRequest::new("   ", Language::Bash);
        assert_eq!(validate_request(&empty), Err(RequestError::EmptyCode));

        let huge = ExecutionRequest::new("x".repeat(MAX_SOURCE_CODE_BYTES + 1), Language::Bash);
        assert!(matches!(validate_request(&huge), Err(RequestError::CodeTooLarge { .. })));

        let mut flags = ExecutionRequest::new("print(1)", Language::Python);
        flags.dependencies = vec!["--index-url=http://evil".to_string()];
        assert!(matches!(validate_request(&flags), Err(RequestError::InvalidDependency(_))));

        let mut many = ExecutionRequest::new("print(1)", Language::Python);
        many.test_cases = Some(vec![TestCase::smoke(); MAX_TEST_CASES + 1]);
        assert!(matches!(validate_request(&many), Err(RequestError::TooManyTestCases { .. })));
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(Duration::from_secs(2)), "2s");
        assert_eq!(describe_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[tokio::test]
    async fn test_bash_hello_world() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor.execute("echo 'hello world'", Language::Bash, limits(10), &[]).await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello world"));
        assert!(result.execution_time_ms > 0.0);
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor.execute("echo oops >&2; exit 3", Language::Bash, limits(10), &[]).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("oops"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_bash_syntax_error() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor.execute("if then fi (", Language::Bash, limits(10), &[]).await;

        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("syntax error"), "stderr: {}", result.stderr);
    }

    #[tokio::test]
    async fn test_timeout_kills_process_and_reports_124() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let started = Instant::now();
        let result = executor.execute("echo before; sleep 60", Language::Bash, limits(1), &[]).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.success);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.timed_out());
        assert!(result.stderr.contains("timed out"));
        assert!(result.stdout.contains("before"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_run() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let started = Instant::now();
        let result = executor.execute("sleep 100 &\necho started", Language::Bash, limits(10), &[]).await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path()).with_output_limit(1_000);

        let result = executor
            .execute("head -c 20000 /dev/zero | tr '\\0' 'a'", Language::Bash, limits(10), &[])
            .await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.stdout.starts_with(&"a".repeat(1_000)));
        assert!(result.stdout.ends_with("[output truncated]"));
        assert!(result.stdout.len() < 1_100);
    }

    #[tokio::test]
    async fn test_stdin_reaches_program() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute_with_stdin("read line; echo \"got $line\"", Language::Bash, limits(10), &[], Some("ping\n"))
            .await;

        assert!(result.success);
        assert_eq!(result.stdout.trim(), "got ping");
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        std::env::set_var("VERIFIX_TEST_SECRET", "hunter2");
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute("echo \"secret=${VERIFIX_TEST_SECRET:-none} home=$HOME\"", Language::Bash, limits(10), &[])
            .await;

        assert!(result.stdout.contains("secret=none"));
        assert!(result.stdout.contains(root.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_identical_runs_produce_identical_stdout() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());
        let code = "for i in 1 2 3; do echo line $i; done";

        let first = executor.execute(code, Language::Bash, limits(10), &[]).await;
        let second = executor.execute(code, Language::Bash, limits(10), &[]).await;

        assert_eq!(first.stdout, second.stdout);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_address_space_cap_stops_large_allocation() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute(
                "x=$(head -c 300000000 /dev/zero | tr '\\0' a); echo ${#x}",
                Language::Bash,
                RunLimits::new(Duration::from_secs(20), 64),
                &[],
            )
            .await;

        assert!(!result.success);
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_dependencies_for_bash_are_skipped_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute("echo ok", Language::Bash, limits(10), &["jq".to_string()])
            .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_python_hello_world() {
        if !have("python3") {
            eprintln!("python3 not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor.execute("print(\"hello world\")", Language::Python, limits(10), &[]).await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello world"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_python_syntax_error() {
        if !have("python3") {
            eprintln!("python3 not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor.execute("print((1, 2)", Language::Python, limits(10), &[]).await;

        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("SyntaxError"), "stderr: {}", result.stderr);
    }

    #[tokio::test]
    async fn test_python_sleep_times_out() {
        if !have("python3") {
            eprintln!("python3 not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let started = Instant::now();
        let result = executor
            .execute("import time; time.sleep(60)", Language::Python, limits(2), &[])
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.success);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.to_lowercase().contains("timeout"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_python_memory_hog_is_stopped() {
        if !have("python3") {
            eprintln!("python3 not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute(
                "data = bytearray(1024 * 1024 * 1024)\nprint(len(data))",
                Language::Python,
                RunLimits::new(Duration::from_secs(20), 128),
                &[],
            )
            .await;

        assert!(!result.success);
        assert!(!result.stdout.contains("1073741824"));
    }

    #[tokio::test]
    async fn test_rust_hello_world() {
        if !have("rustc") {
            eprintln!("rustc not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute(
                "fn main() { println!(\"hello world\"); }",
                Language::Rust,
                RunLimits::new(Duration::from_secs(60), 512),
                &[],
            )
            .await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "hello world");
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_node_memory_breach_reports_137() {
        if !have("node") {
            eprintln!("node not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());

        let result = executor
            .execute(
                "const b = Buffer.alloc(512 * 1024 * 1024, 1);\nsetTimeout(() => console.log(b.length), 3000);\n",
                Language::Javascript,
                RunLimits::new(Duration::from_secs(20), 64),
                &[],
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, MEMORY_KILL_EXIT_CODE, "stderr: {}", result.stderr);
        assert!(result.stderr.contains("[Process killed: memory limit"));
        assert!(!result.stdout.contains("536870912"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_child_process_memory_counts_against_limit() {
        if !have("node") {
            eprintln!("node not installed; skipping");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(root.path());
        let code = r#"const { execFileSync } = require("child_process");
execFileSync(process.execPath, ["-e", "const b = Buffer.alloc(512 * 1024 * 1024, 1); setTimeout(() => console.log(b.length), 3000);"], { stdio: "inherit" });
console.log("parent done");
"#;

        let result = executor
            .execute(code, Language::Javascript, RunLimits::new(Duration::from_secs(20), 128), &[])
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, MEMORY_KILL_EXIT_CODE, "stderr: {}", result.stderr);
        assert!(result.stderr.contains("[Process killed: memory limit"));
        assert!(!result.stdout.contains("parent done"));
        assert!(result.memory_usage_mb > 128.0);
    }
}
