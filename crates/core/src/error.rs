use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Target lost: {0}")]
    TargetLost(String),

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this failure may mean the browser destroyed the target the
    /// call was issued against (as opposed to a bad request from the caller).
    pub fn is_target_loss(&self) -> bool {
        matches!(self, Error::Driver(_) | Error::TargetLost(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
