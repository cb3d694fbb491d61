use std::path::PathBuf;
use thiserror::Error;

/// Infrastructure failures while preparing or supervising a sandboxed run.
///
/// These never escape `SandboxExecutor::execute`; they are folded into a
/// failed `ExecutionResult` so the verification loop can keep going.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write source file {path}: {source}")]
    WriteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Why a call to an external collaborator degraded to its fallback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DegradedReason {
    #[error("collaborator is disabled")]
    Disabled,

    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    #[error("collaborator timed out")]
    Timeout,

    #[error("collaborator answered with HTTP {0}")]
    BadStatus(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Result store failures. Never fatal to a verification.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Request-shape validation failures, the only errors surfaced to HTTP callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("code must not be empty")]
    EmptyCode,

    #[error("code exceeds maximum size of {max} bytes")]
    CodeTooLarge { max: usize },

    #[error("too many test cases: {count} (maximum {max})")]
    TooManyTestCases { count: usize, max: usize },

    #[error("invalid dependency name: {0:?}")]
    InvalidDependency(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}
