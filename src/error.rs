use thiserror::Error;

/// Main error type for the Vigil process supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    // Process-related errors
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("App already registered: {0}")]
    DuplicateApp(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("App {0} did not exit within the kill timeout")]
    ShutdownTimeout(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("Invalid cron expression '{0}': {1}")]
    InvalidCronExpr(String, String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    // Control surface errors
    #[error("App {0} is in invalid state for this operation: {1}")]
    InvalidAppState(String, String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
