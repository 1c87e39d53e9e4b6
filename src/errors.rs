use thiserror::Error;

/// Typed failures for the runtime core. Every subsystem maps its faults onto
/// one of these kinds so the orchestrator boundary can log them with context
/// and reply with a generic message.
#[derive(Debug, Error)]
pub enum CoreError {
    /// CLI subprocess spawn failure, abnormal exit, result parse failure, timeout.
    #[error("cli error: {0}")]
    Cli(String),

    /// Session persistence or lifecycle failure.
    #[error("session error: {0}")]
    Session(String),

    /// Bad schedule expression, missing task folder, dependency lock failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Premature end-of-stream or missing result event.
    #[error("stream error: {0}")]
    Stream(String),

    /// Path traversal, control characters in paths.
    #[error("security error: {0}")]
    Security(String),

    /// Webhook template render or dispatch failure.
    #[error("webhook error: {0}")]
    Webhook(String),

    /// PID lock collision, atomic-write failure, workspace setup failure.
    #[error("infrastructure error: {0}")]
    Infra(String),
}

impl CoreError {
    /// Short tag for log correlation.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Cli(_) => "cli",
            CoreError::Session(_) => "session",
            CoreError::Scheduler(_) => "scheduler",
            CoreError::Stream(_) => "stream",
            CoreError::Security(_) => "security",
            CoreError::Webhook(_) => "webhook",
            CoreError::Infra(_) => "infra",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Infra(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Session(format!("json: {err}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
