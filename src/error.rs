//! Error types for the transaction pipeline and the event subscriber

use std::time::Duration;

use alloy_primitives::B256;
use serde_json::Value;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the library
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Connection failure, request timeout, or a transient HTTP status
    #[error("Network error calling {method}: {reason}")]
    Network { method: String, reason: String },

    /// Error object returned by the node
    #[error("RPC error {code} from {method}({params}): {message}")]
    Rpc {
        method: String,
        params: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Malformed response or payload
    #[error("Decoding error ({context}): {reason}")]
    Decode { context: String, reason: String },

    /// Private key is not a valid secp256k1 scalar
    #[error("Invalid private key: not a valid secp256k1 scalar")]
    InvalidKey,

    /// Fee or gas parameters violate the EIP-1559 invariants
    #[error("Invalid fee parameters: {0}")]
    InvalidFee(String),

    /// eth_estimateGas failed
    #[error("Gas estimation failed: {0}")]
    Estimation(String),

    /// Node rejected eth_sendRawTransaction
    #[error("Transaction rejected by node ({code}): {message}")]
    Submission { code: i64, message: String },

    /// No receipt before the deadline; the transaction may still be mined
    #[error("Timed out after {waited:?} waiting for receipt of {tx_hash}")]
    Timeout { tx_hash: B256, waited: Duration },

    /// Operation stopped by a cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Signing failure
    #[error("Signature error: {0}")]
    Signature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cursor store failure
    #[error("Cursor store error: {0}")]
    Cursor(String),

    /// Log handler refused a batch
    #[error("Log handler error: {0}")]
    Handler(String),
}

impl PipelineError {
    pub(crate) fn decode(context: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Node-reported error code, if any
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            PipelineError::Rpc { code, .. } | PipelineError::Submission { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the RPC layer may retry this error under the given allowlist
    pub fn is_transient(&self, retryable_codes: &[i64]) -> bool {
        match self {
            PipelineError::Network { .. } => true,
            PipelineError::Rpc { code, .. } => retryable_codes.contains(code),
            _ => false,
        }
    }
}
