//! Job scheduling and lifecycle management.
//!
//! A fixed pool of long-lived worker tasks pulls job ids from an in-memory
//! FIFO, drives each job through its state machine, and writes the terminal
//! state back to the store. Cancellation is cooperative at the worker level
//! (a per-job flag polled between subprocess joins) and preemptive at the
//! subprocess level (the runner terminates the child).

pub mod worker;

pub use worker::{WorkerPool, WorkerSettings};

use thiserror::Error;

/// Why a job did not reach `success`. Every variant maps to exactly one
/// terminal write in the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    /// The per-job cancel flag fired.
    #[error("Cancelled by user")]
    Cancelled,

    /// The job row carried no payload to execute.
    #[error("{0}")]
    MissingPayload(String),

    /// The payload was rejected before the subprocess was spawned. This is
    /// reported as `failed`, not `cancelled`: the submission needs user
    /// action.
    #[error("{0}")]
    Validation(String),

    /// The run itself failed (error event, bad exit code, corrupt result).
    #[error("{0}")]
    Execution(String),

    /// Store or spawn failure outside the executor's control.
    #[error("{0}")]
    Internal(#[from] crate::Error),
}

/// Job message set when a worker begins payload validation.
pub const MSG_VALIDATING: &str = "Validating payload";

/// Job message set when the optimization subprocess starts.
pub const MSG_RUNNING: &str = "Running optimization";

/// Job message for the success terminal state.
pub const MSG_SUCCESS: &str = "Optimization completed successfully";

/// Job message for user-requested cancellation.
pub const MSG_CANCELLED: &str = "Cancelled by user";
