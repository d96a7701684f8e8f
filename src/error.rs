use thiserror::Error;

use crate::kv::KvError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock acquisition deadline exceeded for {0}")]
    Cancelled(String),

    #[error("malformed stored value: {0}")]
    Decode(String),

    #[error("kv store error: {0}")]
    Kv(#[from] KvError),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
