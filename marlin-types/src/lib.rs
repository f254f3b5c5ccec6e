#![deny(missing_docs)]
//! Core type definitions for the Marlin application server.
//!
//! This crate groups together the strongly-typed values and message
//! structures used across the server and its clients. It provides:
//!
//! * The HTTP data model: verbs, status reason texts, cracked URLs,
//!   header collections, cookies, and the request/response pair that
//!   travels through a site pipeline (see [`http`] module).
//! * SOAP envelopes with the WS-ReliableMessaging and WS-Security header
//!   blocks the server acts on, plus the fault structure and a plain-text
//!   envelope codec (see [`soap`] module).
//! * Server-Sent Events records with their exact wire encoding (see
//!   [`sse`] module).
//! * The session address that keys reliable-messaging sessions and
//!   per-client throttling (see [`session`] module).
//!
//! Use these types to pass, store, and serialize protocol values in a
//! type-safe way; none of them perform I/O.

pub mod http;
pub mod session;
pub mod soap;
pub mod sse;

pub use http::{
    BodyBuffer, CrackedUrl, HeaderMap, HttpCookie, HttpRequest, HttpResponse, SameSite, Verb,
    reason_text,
};
pub use session::SessionAddress;
pub use soap::{SoapFault, SoapMessage, SoapVersion, XmlElement};
pub use sse::ServerEvent;

/// Opaque identifier correlating one request with its response channel.
///
/// Assigned by the reactor when the request arrives; a cleared id (zero)
/// means the response channel is gone and further sends are no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

use serde::{Deserialize, Serialize};

impl RequestId {
    /// A cleared request id; sends against it are silently dropped.
    pub const NONE: RequestId = RequestId(0);

    /// Wraps a raw id handed out by the reactor.
    pub fn new(value: u64) -> Self {
        RequestId(value)
    }

    /// Returns the raw id.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// True when the id still points at a live response channel.
    pub fn is_live(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
