use crate::diagnostic::DiagnosticCode;
use crate::handle::ObjectType;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("handle 0x{0:x} is already registered as a live {1}")]
    DuplicateHandle(u64, ObjectType),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rejected API call. The same text has already been delivered to the
/// message sink when this value is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub code: DiagnosticCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
