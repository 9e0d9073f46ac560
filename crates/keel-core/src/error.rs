//! Error types shared across keel crates.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("non-standard OP_RETURN script: {len} > {max} bytes")]
    NonStandard { len: usize, max: usize },

    #[error("push data too large: {0} bytes")]
    PushTooLarge(usize),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid public key in redeem script")]
    InvalidPublicKey,

    #[error("malformed redeem script: {0}")]
    MalformedRedeemScript(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount overflow")]
    Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("page must be >= 1")]
    InvalidPage,

    #[error("limit {limit} outside 1..={max}")]
    InvalidLimit { limit: u32, max: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid derivation path: {0}")]
    Malformed(String),

    #[error("child index out of range: {0}")]
    IndexOutOfRange(u32),
}

/// Remote collaborator that produced a [`RemoteServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Blockchain,
    Wallet,
    Cosigner,
    FeeOracle,
    Webhook,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Blockchain => "blockchain",
            Self::Wallet => "wallet",
            Self::Cosigner => "cosigner",
            Self::FeeOracle => "fee oracle",
            Self::Webhook => "webhook",
        };
        f.write_str(name)
    }
}

/// Failure of a remote call. Always names the service and the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteServiceError {
    /// The request never produced a response (connection, timeout, TLS).
    #[error("{service} {operation}: transport failure: {message}")]
    Transport { service: Service, operation: String, message: String },

    /// The service answered with an error status.
    #[error("{service} {operation}: rejected with status {status}: {message}")]
    Application { service: Service, operation: String, status: u16, message: String },

    /// The requested resource does not exist.
    #[error("{service} {operation}: not found: {resource}")]
    NotFound { service: Service, operation: String, resource: String },

    /// The response body could not be decoded.
    #[error("{service} {operation}: malformed response: {message}")]
    Decode { service: Service, operation: String, message: String },
}

impl RemoteServiceError {
    pub fn service(&self) -> Service {
        match self {
            Self::Transport { service, .. }
            | Self::Application { service, .. }
            | Self::NotFound { service, .. }
            | Self::Decode { service, .. } => *service,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            Self::Transport { operation, .. }
            | Self::Application { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Decode { operation, .. } => operation,
        }
    }

    pub fn not_found(service: Service, operation: &str, resource: impl Into<String>) -> Self {
        Self::NotFound { service, operation: operation.to_string(), resource: resource.into() }
    }

    pub fn application(service: Service, operation: &str, status: u16, message: impl Into<String>) -> Self {
        Self::Application { service, operation: operation.to_string(), status, message: message.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error("unknown webhook event type: {0}")]
    UnknownEvent(String),
}

/// Aggregate error for callers that handle every core failure uniformly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeelError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Remote(#[from] RemoteServiceError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_names_service_and_operation() {
        let err = RemoteServiceError::application(Service::Wallet, "send_transaction", 500, "boom");
        let msg = err.to_string();
        assert!(msg.contains("wallet"));
        assert!(msg.contains("send_transaction"));
        assert!(msg.contains("500"));
        assert_eq!(err.service(), Service::Wallet);
        assert_eq!(err.operation(), "send_transaction");
    }

    #[test]
    fn not_found_carries_resource() {
        let err = RemoteServiceError::not_found(Service::Blockchain, "transaction", "abcd");
        assert!(matches!(err, RemoteServiceError::NotFound { ref resource, .. } if resource == "abcd"));
    }

    #[test]
    fn keel_error_wraps_transparently() {
        let err: KeelError = ScriptError::NonStandard { len: 50, max: 40 }.into();
        assert_eq!(err.to_string(), "non-standard OP_RETURN script: 50 > 40 bytes");
    }
}
