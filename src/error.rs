use indicatif::style::TemplateError;
use thiserror::Error;

pub type PopdynResult<T> = Result<T, PopdynError>;

#[derive(Debug, Error)]
pub enum PopdynError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Math(#[from] MathError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Errors detected while validating a task at engine construction.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Transition {transition} references unknown state id {id}")]
    UnknownState { transition: usize, id: i32 },

    #[error("State id {0} is reserved for the external state")]
    ReservedStateId(i32),

    #[error("Duplicate state id {0}")]
    DuplicateStateId(i32),

    #[error("Transition {transition} has malformed {name} = {value}")]
    MalformedCoefficient {
        transition: usize,
        name: &'static str,
        value: f64,
    },

    #[error("State {id} has malformed initial count {value}")]
    MalformedInitialCount { id: i32, value: f64 },
}

/// Domain failures of the arbitrary-precision kernel.
#[derive(Debug, Error)]
pub enum MathError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Exponent {0} does not fit into a 64-bit integer")]
    ExponentOverflow(String),
}

/// Errors related to worker execution and run callbacks.
///
/// Cancelled transition tasks never surface here: the driver absorbs them
/// silently and the step completes with whatever the remaining tasks
/// produced.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to build worker pool: {0}")]
    Pool(String),

    #[error("Failed to spawn engine worker: {0}")]
    Spawn(String),

    #[error("Result sink failed: {0}")]
    ResultSink(String),

    #[error("Progress sink failed: {0}")]
    ProgressSink(String),

    #[error("Progress bar error")]
    ProgressBar(#[from] TemplateError),
}
