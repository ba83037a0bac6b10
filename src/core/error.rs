use crate::core::types::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Coordination service error: {0}")]
    CoordinationService(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Method '{0}' not found")]
    MethodNotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Cluster directory is closed")]
    DirectoryClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Wire error code carried back to the caller in a response frame.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            Self::CoordinationService(_) => ErrorCode::ZookeeperOperation,
            Self::InvalidData(_) | Self::Decode(_) => ErrorCode::InvalidData,
            Self::MethodNotFound(_) => ErrorCode::HandlerNotFound,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::DirectoryClosed => ErrorCode::ServiceNotActive,
            Self::Encode(_) | Self::Config(_) | Self::LockError(_) | Self::Io(_) => {
                ErrorCode::Unknown
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl<T> From<std::sync::PoisonError<T>> for ProxyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_taxonomy() {
        assert_eq!(
            ProxyError::ObjectNotFound("t".into()).error_code(),
            ErrorCode::ObjectNotFound
        );
        assert_eq!(
            ProxyError::CoordinationService("down".into()).error_code(),
            ErrorCode::ZookeeperOperation
        );
        assert_eq!(
            ProxyError::InvalidData("json".into()).error_code(),
            ErrorCode::InvalidData
        );
        assert_eq!(
            ProxyError::MethodNotFound("RPC_X".into()).error_code(),
            ErrorCode::HandlerNotFound
        );
    }
}
