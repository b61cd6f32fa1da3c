//! Unified error handling for vramforge
//!
//! This module provides a centralized error type covering the whole
//! allocation surface. Errors are categorized so callers can decide whether
//! to fix a request, retry after releasing memory, or report a bug:
//! - User errors (malformed requests, bad configuration)
//! - Capacity errors (allocator exhausted, may succeed after releasing)
//! - Budget errors (residency budget cannot be satisfied)
//! - Device errors (driver call failures, propagated verbatim)
//! - Internal errors (invariant violations, bugs)

use std::fmt;

use crate::device::DeviceError;

/// Unified error type for vramforge
///
/// Out-of-capacity conditions inside sub-allocators are NOT errors: the
/// `try_allocate` path reports them as a silent `None` so the caller can
/// fall back to a committed allocation. Only exhausted fallback chains
/// surface as `OutOfMemory`.
#[derive(Debug, thiserror::Error)]
pub enum GmmError {
    /// Malformed allocation request (zero size, bad alignment, over limit)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid allocator or residency configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Driver reported the resource as unallocatable or all paths exhausted
    #[error("Out of GPU memory: {0}")]
    OutOfMemory(String),

    /// No eviction candidate exists to bring the request under budget
    #[error("Insufficient residency budget: {0}")]
    InsufficientBudget(String),

    /// Driver call failed; the underlying error is preserved
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Lock poisoned (indicates a panicked thread mid-operation)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl GmmError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GmmError::InvalidRequest(_) | GmmError::InvalidConfiguration(_) => ErrorCategory::User,
            GmmError::OutOfMemory(_) => ErrorCategory::Capacity,
            GmmError::InsufficientBudget(_) => ErrorCategory::Budget,
            GmmError::Device(_) => ErrorCategory::Device,
            GmmError::Internal(_) | GmmError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition).
    ///
    /// Capacity and budget errors may succeed after the caller releases
    /// memory or trims pools. Device errors may be transient depending on
    /// the driver.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Capacity | ErrorCategory::Budget | ErrorCategory::Device
        )
    }

    /// Check if this is a user-facing error (actionable by callers).
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug).
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid request or configuration
    User,
    /// Capacity error - allocator exhausted
    Capacity,
    /// Budget error - residency budget cannot be met
    Budget,
    /// Device error - driver call failure
    Device,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Budget => write!(f, "Budget"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GmmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GmmError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type GmmResult<T> = std::result::Result<T, GmmError>;
