use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Poller error: {0}")]
    Poller(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
