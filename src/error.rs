//! Error types for the plugin
//!
//! One enum covers every failure the ADD/CHECK/DEL paths can surface. Each
//! variant maps onto a CNI error code so the binary can print a conforming
//! error document.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using CniError
pub type Result<T> = std::result::Result<T, CniError>;

/// Unified error type for plugin operations
#[derive(Debug, Error)]
pub enum CniError {
    // -------------------------------------------------------------------------
    // Fatal, surfaced verbatim
    // -------------------------------------------------------------------------
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("segment resolution failed: {0}")]
    Resolver(String),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    // -------------------------------------------------------------------------
    // Address pool
    // -------------------------------------------------------------------------
    #[error("address pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("key {0} is already locked")]
    LockContention(String),

    // -------------------------------------------------------------------------
    // Store transport
    // -------------------------------------------------------------------------
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    // -------------------------------------------------------------------------
    // Links and namespaces
    // -------------------------------------------------------------------------
    #[error("interface error: {0}")]
    Interface(String),

    #[error("check failed: {0}")]
    Validation(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CniError {
    /// CNI error code for this failure.
    ///
    /// Codes below 100 are the well-known codes from the CNI spec, the rest
    /// are plugin specific.
    pub fn code(&self) -> u32 {
        match self {
            CniError::Io(_) => 5,
            CniError::Decode { .. } => 6,
            CniError::Config(_) => 7,
            CniError::StoreUnavailable(_) | CniError::LockContention(_) => 11,
            CniError::Resolver(_) => 101,
            CniError::PoolExhausted(_) => 102,
            CniError::Interface(_) => 103,
            CniError::Validation(_) => 104,
            CniError::Cancelled(_) => 105,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CniError::StoreUnavailable(_) | CniError::LockContention(_))
    }

    pub(crate) fn decode(what: impl Into<String>, reason: impl ToString) -> Self {
        CniError::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<tonic::Status> for CniError {
    fn from(status: tonic::Status) -> Self {
        CniError::StoreUnavailable(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for CniError {
    fn from(err: tonic::transport::Error) -> Self {
        CniError::StoreUnavailable(err.to_string())
    }
}

/// CNI error document printed on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Error code
    pub code: u32,
    /// Short message
    pub msg: String,
    /// Longer description, usually the error chain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    /// Build the error document for an anyhow error, using the code of the
    /// innermost `CniError` if there is one.
    pub fn from_anyhow(cni_version: &str, err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<CniError>())
            .map(CniError::code)
            .unwrap_or(999);

        let details = err
            .chain()
            .skip(1)
            .map(|cause| cause.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        Self {
            cni_version: cni_version.to_string(),
            code,
            msg: err.to_string(),
            details,
        }
    }

    /// Print the error document as JSON on stdout
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string(self)?;
        println!("{}", json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn codes_follow_cni_conventions() {
        assert_eq!(CniError::Config("x".into()).code(), 7);
        assert_eq!(CniError::StoreUnavailable("x".into()).code(), 11);
        assert_eq!(CniError::PoolExhausted("x".into()).code(), 102);
        assert!(CniError::LockContention("k".into()).is_retryable());
        assert!(!CniError::Resolver("x".into()).is_retryable());
    }

    #[test]
    fn error_result_uses_inner_code() {
        let err: anyhow::Result<()> = Err(CniError::PoolExhausted("172.17.11.0".into()))
            .context("ADD failed");
        let doc = ErrorResult::from_anyhow("1.0.0", &err.unwrap_err());

        assert_eq!(doc.code, 102);
        assert_eq!(doc.msg, "ADD failed");
        assert!(doc.details.contains("172.17.11.0"));
    }
}
