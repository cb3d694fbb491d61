// Per-language process recipes
//
// Each supported language is one `LanguageRunner` implementation. The sandbox
// never builds shell strings: a runner hands back typed `Invocation`s that the
// sandbox spawns directly with resource limits applied.

use std::path::{Path, PathBuf};
use verifix_common::types::Language;

/// Which phase of a run an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

/// One process to spawn inside the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stage: Stage,
    /// Apply RLIMIT_AS. Runtimes that reserve large virtual ranges up front
    /// (V8, Go, LLVM) are capped by the resident-memory monitor instead.
    pub cap_address_space: bool,
}

impl Invocation {
    pub fn run<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stage: Stage::Run,
            cap_address_space: true,
        }
    }

    pub fn compile<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage: Stage::Compile,
            cap_address_space: false,
            ..Self::run(program, args)
        }
    }

    pub fn without_address_space_cap(mut self) -> Self {
        self.cap_address_space = false;
        self
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the test runner drives code in this language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessStyle {
    /// Harness source wraps the candidate and calls the entry point in-process.
    EmbeddedPython,
    EmbeddedJavascript,
    /// Program runs once per case with the input as JSON on stdin.
    Stdio,
}

pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> Language;

    /// Canonical filename the candidate code is written to.
    fn source_file(&self) -> &'static str;

    /// Processes to run, in order, to execute the source file.
    fn invocations(&self, workdir: &Path) -> Vec<Invocation>;

    /// Extra environment on top of the sandbox base environment.
    fn environment(&self, _workdir: &Path) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Steps installing `dependencies` into the working directory.
    /// `None` means this language has no isolated installer.
    fn dependency_steps(&self, _workdir: &Path, _dependencies: &[String]) -> Option<Vec<Invocation>> {
        None
    }

    fn harness_style(&self) -> HarnessStyle;
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub struct PythonRunner;

impl LanguageRunner for PythonRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        "main.py"
    }

    fn invocations(&self, _workdir: &Path) -> Vec<Invocation> {
        vec![Invocation::run("python3", ["-u", "main.py"])]
    }

    fn environment(&self, workdir: &Path) -> Vec<(String, String)> {
        vec![
            ("PYTHONPATH".to_string(), path_str(&workdir.join(".deps"))),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ]
    }

    fn dependency_steps(&self, workdir: &Path, dependencies: &[String]) -> Option<Vec<Invocation>> {
        let mut args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            "--no-input".to_string(),
            "--quiet".to_string(),
            "--no-cache-dir".to_string(),
            "--target".to_string(),
            path_str(&workdir.join(".deps")),
        ];
        args.extend(dependencies.iter().cloned());
        Some(vec![Invocation::run("python3", args).without_address_space_cap()])
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::EmbeddedPython
    }
}

fn npm_install(workdir: &Path, dependencies: &[String]) -> Vec<Invocation> {
    let mut args = vec![
        "install".to_string(),
        "--no-audit".to_string(),
        "--no-fund".to_string(),
        "--silent".to_string(),
        "--prefix".to_string(),
        path_str(workdir),
    ];
    args.extend(dependencies.iter().cloned());
    vec![Invocation::run("npm", args).without_address_space_cap()]
}

fn node_environment(workdir: &Path) -> Vec<(String, String)> {
    vec![
        ("NODE_PATH".to_string(), path_str(&workdir.join("node_modules"))),
        ("npm_config_cache".to_string(), path_str(&workdir.join(".npm"))),
    ]
}

pub struct JavascriptRunner;

impl LanguageRunner for JavascriptRunner {
    fn language(&self) -> Language {
        Language::Javascript
    }

    fn source_file(&self) -> &'static str {
        "main.js"
    }

    fn invocations(&self, _workdir: &Path) -> Vec<Invocation> {
        vec![Invocation::run("node", ["main.js"]).without_address_space_cap()]
    }

    fn environment(&self, workdir: &Path) -> Vec<(String, String)> {
        node_environment(workdir)
    }

    fn dependency_steps(&self, workdir: &Path, dependencies: &[String]) -> Option<Vec<Invocation>> {
        Some(npm_install(workdir, dependencies))
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::EmbeddedJavascript
    }
}

/// TypeScript runs on node's built-in type stripping (node >= 22.6).
pub struct TypescriptRunner;

impl LanguageRunner for TypescriptRunner {
    fn language(&self) -> Language {
        Language::Typescript
    }

    fn source_file(&self) -> &'static str {
        "main.ts"
    }

    fn invocations(&self, _workdir: &Path) -> Vec<Invocation> {
        vec![Invocation::run("node", ["--experimental-strip-types", "--no-warnings", "main.ts"])
            .without_address_space_cap()]
    }

    fn environment(&self, workdir: &Path) -> Vec<(String, String)> {
        node_environment(workdir)
    }

    fn dependency_steps(&self, workdir: &Path, dependencies: &[String]) -> Option<Vec<Invocation>> {
        Some(npm_install(workdir, dependencies))
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::EmbeddedJavascript
    }
}

pub struct GoRunner;

impl LanguageRunner for GoRunner {
    fn language(&self) -> Language {
        Language::Go
    }

    fn source_file(&self) -> &'static str {
        "main.go"
    }

    /// Build, then run the binary directly so it leads the process group.
    fn invocations(&self, workdir: &Path) -> Vec<Invocation> {
        vec![
            Invocation::compile("go", ["build", "-o", "main", "main.go"]),
            Invocation::run(path_str(&workdir.join("main")), Vec::<String>::new()).without_address_space_cap(),
        ]
    }

    fn environment(&self, workdir: &Path) -> Vec<(String, String)> {
        vec![
            ("GOCACHE".to_string(), path_str(&workdir.join(".cache").join("go-build"))),
            ("GOPATH".to_string(), path_str(&workdir.join(".gopath"))),
            ("GOMODCACHE".to_string(), path_str(&workdir.join(".gopath").join("pkg").join("mod"))),
            ("GOFLAGS".to_string(), "-mod=mod".to_string()),
            ("GOTELEMETRY".to_string(), "off".to_string()),
        ]
    }

    fn dependency_steps(&self, _workdir: &Path, dependencies: &[String]) -> Option<Vec<Invocation>> {
        let mut get_args = vec!["get".to_string()];
        get_args.extend(dependencies.iter().cloned());
        Some(vec![
            Invocation::run("go", ["mod", "init", "sandbox"]).without_address_space_cap(),
            Invocation::run("go", get_args).without_address_space_cap(),
        ])
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::Stdio
    }
}

/// rustup proxies locate their toolchains through these, and the sandbox
/// replaces HOME. Unset values fall back to rustup's defaults under the host HOME.
fn rust_toolchain_environment<F>(get: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let host_home = get("HOME").filter(|home| !home.is_empty()).map(PathBuf::from);
    let mut env = Vec::new();
    for (var, default_dir) in [("RUSTUP_HOME", ".rustup"), ("CARGO_HOME", ".cargo")] {
        let value = get(var)
            .filter(|value| !value.is_empty())
            .or_else(|| host_home.as_ref().map(|home| path_str(&home.join(default_dir))));
        if let Some(value) = value {
            env.push((var.to_string(), value));
        }
    }
    if let Some(toolchain) = get("RUSTUP_TOOLCHAIN").filter(|t| !t.is_empty()) {
        env.push(("RUSTUP_TOOLCHAIN".to_string(), toolchain));
    }
    env
}

/// Single-file rustc build; crates.io dependencies are not supported.
pub struct RustRunner;

impl LanguageRunner for RustRunner {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn source_file(&self) -> &'static str {
        "main.rs"
    }

    fn invocations(&self, workdir: &Path) -> Vec<Invocation> {
        vec![
            Invocation::compile("rustc", ["--edition", "2021", "-O", "-o", "main", "main.rs"]),
            Invocation::run(path_str(&workdir.join("main")), Vec::<String>::new()),
        ]
    }

    fn environment(&self, _workdir: &Path) -> Vec<(String, String)> {
        rust_toolchain_environment(|key| std::env::var(key).ok())
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::Stdio
    }
}

pub struct BashRunner;

impl LanguageRunner for BashRunner {
    fn language(&self) -> Language {
        Language::Bash
    }

    fn source_file(&self) -> &'static str {
        "main.sh"
    }

    fn invocations(&self, _workdir: &Path) -> Vec<Invocation> {
        vec![Invocation::run("bash", ["main.sh"])]
    }

    fn harness_style(&self) -> HarnessStyle {
        HarnessStyle::Stdio
    }
}

static PYTHON: PythonRunner = PythonRunner;
static JAVASCRIPT: JavascriptRunner = JavascriptRunner;
static TYPESCRIPT: TypescriptRunner = TypescriptRunner;
static GO: GoRunner = GoRunner;
static RUST: RustRunner = RustRunner;
static BASH: BashRunner = BashRunner;

/// The runner for `language`. Adding a language means adding a variant and an impl here.
pub fn runner_for(language: Language) -> &'static dyn LanguageRunner {
    match language {
        Language::Python => &PYTHON,
        Language::Javascript => &JAVASCRIPT,
        Language::Typescript => &TYPESCRIPT,
        Language::Go => &GO,
        Language::Rust => &RUST,
        Language::Bash => &BASH,
    }
}
