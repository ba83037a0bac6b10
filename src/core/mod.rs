pub mod error;
pub mod types;

pub use error::{ProxyError, Result};
pub use types::{ErrorCode, PartitionId};
