use std::io;
use thiserror::Error;

use crate::graph::Delta;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("database is not initialized")]
    NotInitialized,
    #[error("database already exists")]
    DatabaseExists,
    #[error("data version mismatch: stored {stored}, supported {supported}")]
    VersionMismatch { stored: i64, supported: i64 },
    #[error("no bucket")]
    NoBucket,
    #[error("quad exists")]
    QuadExists,
    #[error("quad does not exist")]
    QuadNotExist,
    #[error("invalid action")]
    InvalidAction,
    #[error("error processing delta: {cause}")]
    Delta {
        delta: Box<Delta>,
        #[source]
        cause: Box<StoreError>,
    },
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl StoreError {
    /// Wraps an error with the delta that caused it.
    pub fn for_delta(delta: Delta, cause: StoreError) -> StoreError {
        StoreError::Delta {
            delta: Box::new(delta),
            cause: Box::new(cause),
        }
    }

    /// The underlying error kind, unwrapping a `Delta` wrapper if present.
    pub fn cause(&self) -> &StoreError {
        match self {
            StoreError::Delta { cause, .. } => cause,
            other => other,
        }
    }
}
