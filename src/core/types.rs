use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one shard of one table: `(app_id, partition_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartitionId {
    pub app_id: u32,
    pub partition_index: u32,
}

impl PartitionId {
    pub fn new(app_id: u32, partition_index: u32) -> Self {
        Self {
            app_id,
            partition_index,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Error codes carried in response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Unknown,
    ServiceNotActive,
    HandlerNotFound,
    ObjectNotFound,
    InvalidData,
    InvalidParameters,
    NotImplemented,
    ZookeeperOperation,
}

impl ErrorCode {
    const ALL: [ErrorCode; 9] = [
        ErrorCode::Ok,
        ErrorCode::Unknown,
        ErrorCode::ServiceNotActive,
        ErrorCode::HandlerNotFound,
        ErrorCode::ObjectNotFound,
        ErrorCode::InvalidData,
        ErrorCode::InvalidParameters,
        ErrorCode::NotImplemented,
        ErrorCode::ZookeeperOperation,
    ];

    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Unknown => 1,
            ErrorCode::ServiceNotActive => 3,
            ErrorCode::HandlerNotFound => 8,
            ErrorCode::ObjectNotFound => 9,
            ErrorCode::InvalidData => 24,
            ErrorCode::InvalidParameters => 27,
            ErrorCode::NotImplemented => 39,
            ErrorCode::ZookeeperOperation => 64,
        }
    }

    /// Unknown codes collapse to `ErrorCode::Unknown`.
    pub fn from_i32(code: i32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_i32() == code)
            .unwrap_or(ErrorCode::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ERR_OK",
            ErrorCode::Unknown => "ERR_UNKNOWN",
            ErrorCode::ServiceNotActive => "ERR_SERVICE_NOT_ACTIVE",
            ErrorCode::HandlerNotFound => "ERR_HANDLER_NOT_FOUND",
            ErrorCode::ObjectNotFound => "ERR_OBJECT_NOT_FOUND",
            ErrorCode::InvalidData => "ERR_INVALID_DATA",
            ErrorCode::InvalidParameters => "ERR_INVALID_PARAMETERS",
            ErrorCode::NotImplemented => "ERR_NOT_IMPLEMENTED",
            ErrorCode::ZookeeperOperation => "ERR_ZOOKEEPER_OPERATION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values_are_distinct() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), code);
        }
        assert_eq!(ErrorCode::from_i32(-7), ErrorCode::Unknown);
    }

    #[test]
    fn test_partition_display() {
        assert_eq!(PartitionId::new(3, 4).to_string(), "3.4");
    }
}
