//! The error taxonomy of the server.
//!
//! Every failure a request can run into falls into exactly one
//! [`ServerError`] kind; none are collapsed. Errors are answered locally
//! (one response, one log line) and never escape a worker.

use marlin_types::soap::SoapParseError;

/// Crash reporting collaborator.
///
/// Captures crashes in user code (filters, handlers, heartbeat callbacks)
/// without poisoning the pool. Implementations must not panic; a nested
/// crash during reporting is downgraded by the caller to a minimal log
/// line.
pub trait ErrorReport: Send + Sync {
    /// Records one crash with the scene it happened in.
    fn report(&self, scene: &str, description: &str);
}

/// Default report sink writing through `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorReport;

impl ErrorReport for TracingErrorReport {
    fn report(&self, scene: &str, description: &str) {
        tracing::error!(scene, "crash captured: {description}");
    }
}

/// Transport failures on the client channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection lost")]
    ConnectionLost,
    /// Writing a response or chunk failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    /// The response channel is gone (cleared request id or cancelled stream).
    #[error("no channel for request id {0}")]
    NoChannel(u64),
}

/// Everything that can go wrong while serving one request.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Connection lost, write failed, chunk write failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed header, unsupported verb, oversized body.
    #[error("HTTP protocol error ({status}): {reason}")]
    ProtocolHttp {
        /// The 4xx status to answer with.
        status: u16,
        /// Human readable reason.
        reason: String,
    },

    /// Not XML, bad envelope, wrong SOAP version.
    #[error("SOAP protocol error: {0}")]
    ProtocolSoap(#[from] SoapParseError),

    /// Wrong sequence, missing offer, late LastMessage.
    #[error("reliable-messaging fault: {string}")]
    ProtocolRm {
        /// Fault actor.
        actor: String,
        /// Fault string.
        string: String,
        /// Fault detail.
        detail: String,
    },

    /// Signature mismatch, decryption failure, stale nonce, failed login.
    #[error("security check failed: {0}")]
    Security(String),

    /// No handler for the verb, unknown scheme, unsupported mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A panic inside a filter or handler, captured at the pipeline rim.
    #[error("crash in user code: {0}")]
    UserCrash(String),

    /// The request arrived after shutdown had begun.
    #[error("server is shutting down")]
    Shutdown,
}

impl ServerError {
    /// The HTTP status this error answers with when no response exists yet.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::Transport(_) => 0, // nothing can be written anymore
            ServerError::ProtocolHttp { status, .. } => *status,
            ServerError::ProtocolSoap(_) => 400,
            ServerError::ProtocolRm { .. } => 500,
            ServerError::Security(_) => 401,
            ServerError::Configuration(_) => 400,
            ServerError::UserCrash(_) => 500,
            ServerError::Shutdown => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_status() {
        let http = ServerError::ProtocolHttp { status: 413, reason: "too big".into() };
        assert_eq!(http.status(), 413);
        assert_eq!(ServerError::Shutdown.status(), 503);
        assert_eq!(ServerError::UserCrash("boom".into()).status(), 500);
        assert_eq!(ServerError::Security("stale nonce".into()).status(), 401);
    }
}
