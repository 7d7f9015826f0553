#![forbid(unsafe_code)]
//! Error types for KeelStore.
//!
//! Defines `KeelError` and a `Result<T>` alias used throughout the
//! workspace. Commit conflicts have their own error type next to the
//! extent cache; everything else funnels through here.

use keel_types::Paddr;
use thiserror::Error;

/// Unified error type for KeelStore operations.
#[derive(Debug, Error)]
pub enum KeelError {
    #[error("extent not found at {0}")]
    ExtentNotFound(Paddr),

    #[error("corrupt extent at {paddr}: {detail}")]
    Corruption { paddr: Paddr, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("physical address space exhausted")]
    NoSpace,
}

/// Result alias using `KeelError`.
pub type Result<T> = std::result::Result<T, KeelError>;
