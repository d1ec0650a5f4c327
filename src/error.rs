use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected in task graph at: {task}")]
    CyclicGraph { task: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No worker registered for capability: {0}")]
    WorkerUnavailable(String),

    #[error("Worker timed out after {0:?}")]
    WorkerTimeout(std::time::Duration),

    #[error("Worker rejected task: {0}")]
    WorkerRejected(String),

    #[error("Quality gate failed: {0}")]
    QualityGateFailure(String),

    #[error("Conflict detected on {resource} (held by {holder})")]
    ConflictDetected { resource: String, holder: String },

    #[error("Retry limit exhausted for {task} after {attempts} attempts")]
    RetryExhausted { task: String, attempts: u32 },

    #[error("Malformed finding: {0}")]
    MalformedFinding(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Event log error: {0}")]
    EventLog(String),
}

pub type Result<T> = std::result::Result<T, Error>;
