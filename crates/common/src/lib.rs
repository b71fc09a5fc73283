//! Common types shared across CodeCell services.

pub mod error;

pub use error::{Error, Result};
