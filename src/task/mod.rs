//! Task module - defines tasks, executions, and verification.
//!
//! This module is designed with the ledger invariants in mind:
//! - Status enums are matched exhaustively
//! - Invariants are documented on the types and checkable via methods
//! - Pure data; all IO lives in `store` and `market`

pub mod task;
mod execution;
mod verification;

pub use execution::{Actor, Claim, Execution, ExecutionId, ExecutionStatus};
pub use task::{CancellationRecord, Task, TaskId, TaskSpec, TaskStatus, TaskType};
pub use verification::{
    verify_with_timeout, HttpVerifier, StaticVerifier, VerificationMode, VerificationOutcome,
    VerificationResult, Verifier, VerifierError, VerifierRef,
};
