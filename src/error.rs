//! Unified error types for the introspection engine using thiserror

use thiserror::Error;

use crate::kern::sched_prim::Unresolved;
use crate::types::KAddr;

/// Failure of the address-space reader primitive
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("{len} bytes at {address} are not mapped")]
    Unmapped { address: KAddr, len: usize },

    #[error("remote stub answered {request:?} with error {code:#04x}")]
    Remote { request: String, code: u8 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown register or expression: {0}")]
    UnknownExpression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for introspection operations
#[derive(Error, Debug)]
pub enum IntrospectError {
    #[error("null {what} pointer")]
    NullAddress { what: &'static str },

    #[error("unreadable memory at {address}: {source}")]
    UnreadableMemory {
        address: KAddr,
        #[source]
        source: ReadError,
    },

    #[error("cannot evaluate {expr}: {source}")]
    Evaluate {
        expr: String,
        #[source]
        source: ReadError,
    },

    /// A field needed to continue was degraded to unknown during decode
    #[error("{what} at {address} could not be read")]
    UnreadableField { what: &'static str, address: KAddr },

    #[error("layout {build} does not match the target: {what} at {address}: expected {expected}, observed {observed}")]
    LayoutMismatch {
        build: String,
        what: &'static str,
        address: KAddr,
        expected: String,
        observed: String,
    },

    #[error("unresolved control flow for thread {thread}: {reason}")]
    UnresolvedControlFlow { thread: KAddr, reason: Unresolved },

    #[error("{table} at {address} declares capacity {capacity}, above the limit of {limit}")]
    BadTableCapacity {
        table: &'static str,
        address: KAddr,
        capacity: u64,
        limit: u64,
    },

    #[error("index {index} is outside {table} of capacity {capacity}")]
    IndexOutOfRange {
        table: &'static str,
        index: u64,
        capacity: u64,
    },

    #[error("no layout for kernel build {build:?} (supported: {supported})")]
    UnsupportedBuild { build: String, supported: String },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("invalid layout file: {0}")]
    LayoutFile(#[from] toml::de::Error),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntrospectError {
    /// Wrap a reader failure at `address`
    pub fn unreadable(address: KAddr, source: ReadError) -> Self {
        IntrospectError::UnreadableMemory { address, source }
    }

    /// Whether the whole session should stop rather than just this operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IntrospectError::LayoutMismatch { .. }
                | IntrospectError::UnsupportedBuild { .. }
                | IntrospectError::InvalidLayout(_)
        )
    }
}

/// Result type for introspection operations
pub type Result<T> = core::result::Result<T, IntrospectError>;
