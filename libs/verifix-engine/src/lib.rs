pub mod diff;
pub mod error;
pub mod harness;
pub mod language;
pub mod monitor;
pub mod oracle;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod verifier;

pub use error::{DegradedReason, RequestError, SandboxError, StoreError};
pub use oracle::{HttpRepairOracle, RepairOracle, RepairRequest};
pub use runner::TestRunner;
pub use sandbox::{validate_request, RunLimits, SandboxExecutor};
pub use store::{MemoryResultStore, RedisResultStore, ResultStore};
pub use verifier::VerificationLoop;
