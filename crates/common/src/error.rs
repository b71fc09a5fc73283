//! Shared error vocabulary for CodeCell services.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
