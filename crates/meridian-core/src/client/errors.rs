use thiserror::Error;

/// Classification of JSON-RPC errors returned by an endpoint.
///
/// Decides whether a failed call may be retried on another node:
/// - Client errors are the caller's fault and are returned as-is
/// - Provider errors and rate limits are the endpoint's fault and fail over
/// - Execution errors (reverts) are deterministic and are returned as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCategory {
    /// Invalid request, method not found, invalid params.
    ClientError,
    /// Internal or server error on the endpoint.
    ProviderError,
    /// Rate limiting at the JSON-RPC level (-32005).
    RateLimit,
    /// Malformed response.
    ParseError,
    /// Reverts, out of gas and similar transaction-level failures.
    ExecutionError,
}

impl RpcErrorCategory {
    /// Classifies a JSON-RPC error code and message.
    ///
    /// In the -32000 to -32099 server range the message is inspected to tell
    /// execution failures apart from endpoint failures.
    #[must_use]
    pub fn from_code_and_message(code: i32, message: &str) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32602..=-32600 => Self::ClientError,
            -32603 => Self::ProviderError,
            -32005 => Self::RateLimit,
            -32099..=-32000 => {
                let message_lower = message.to_lowercase();
                if message_lower.contains("execution reverted") ||
                    message_lower.contains("out of gas") ||
                    message_lower.contains("revert") ||
                    message_lower.contains("insufficient funds") ||
                    message_lower.contains("nonce too low") ||
                    message_lower.contains("gas too low")
                {
                    Self::ExecutionError
                } else {
                    Self::ProviderError
                }
            }
            _ => Self::ProviderError,
        }
    }

    /// Returns `true` if the same call may succeed on a different node.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError | Self::ParseError)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::ProviderError => "provider_error",
            Self::RateLimit => "rate_limit",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
        }
    }
}

/// Errors raised by a [`NodeClient`](super::NodeClient) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// Could not reach the endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The request did not complete in time.
    #[error("request timeout")]
    Timeout,

    /// Non-2xx HTTP status. Fields are the status code and a truncated body.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error object returned by the endpoint.
    #[error("RPC error {0}: {1}")]
    Rpc(i32, String),

    /// The endpoint does not offer a capability the caller needs.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The client was closed.
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Returns the RPC error category if this is an RPC error.
    #[must_use]
    pub fn rpc_category(&self) -> Option<RpcErrorCategory> {
        match self {
            Self::Rpc(code, message) => Some(RpcErrorCategory::from_code_and_message(*code, message)),
            _ => None,
        }
    }

    /// Returns `true` for failures of the transport rather than of the request.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout | Self::Closed => true,
            Self::HttpError(status, _) => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// Returns `true` if the call should be retried against another node.
    ///
    /// Transport failures, malformed responses and transient RPC categories are
    /// retryable. Client and execution errors would fail identically elsewhere.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        if self.is_transport() {
            return true;
        }
        match self {
            Self::InvalidResponse(_) => true,
            Self::Rpc(..) => self.rpc_category().is_some_and(|c| c.is_transient()),
            _ => false,
        }
    }

    /// Returns a static label for metrics.
    #[must_use]
    pub fn as_metric_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Timeout => "timeout",
            Self::HttpError(..) => "http_error",
            Self::Rpc(..) => self.rpc_category().map_or("rpc_error", |c| c.as_str()),
            Self::Unsupported(_) => "unsupported",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Closed => "closed",
        }
    }
}
