//! The HTTP data model of the server.
//!
//! One [`HttpRequest`] is built by the reactor for every request that
//! arrives on a listener and is handed by exclusive ownership to the site
//! pipeline. The matching [`HttpResponse`] shares the request's opaque id
//! and is extinguished by exactly one successful write to the response
//! sink, guarded by the [`HttpResponse::mark_answered`] latch.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::RequestId;

/// All request verbs the server recognizes.
///
/// Includes the WebDAV set; anything that does not parse maps to an
/// immediate `501 Not supported` at the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Verb {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Move,
    Copy,
    PropFind,
    PropPatch,
    MkCol,
    Lock,
    Unlock,
    Search,
    Merge,
    Patch,
}

/// Error for a method token the server does not speak.
#[derive(Debug, thiserror::Error)]
#[error("unknown HTTP verb: {0}")]
pub struct UnknownVerb(pub String);

impl Verb {
    /// The canonical uppercase token of this verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Options => "OPTIONS",
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Trace => "TRACE",
            Verb::Connect => "CONNECT",
            Verb::Move => "MOVE",
            Verb::Copy => "COPY",
            Verb::PropFind => "PROPFIND",
            Verb::PropPatch => "PROPPATCH",
            Verb::MkCol => "MKCOL",
            Verb::Lock => "LOCK",
            Verb::Unlock => "UNLOCK",
            Verb::Search => "SEARCH",
            Verb::Merge => "MERGE",
            Verb::Patch => "PATCH",
        }
    }

    /// Every verb, in a stable order. Used to assemble `Allow:` lists.
    pub fn all() -> &'static [Verb] {
        &[
            Verb::Options,
            Verb::Get,
            Verb::Head,
            Verb::Post,
            Verb::Put,
            Verb::Delete,
            Verb::Trace,
            Verb::Connect,
            Verb::Move,
            Verb::Copy,
            Verb::PropFind,
            Verb::PropPatch,
            Verb::MkCol,
            Verb::Lock,
            Verb::Unlock,
            Verb::Search,
            Verb::Merge,
            Verb::Patch,
        ]
    }
}

impl std::str::FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let verb = match token {
            "OPTIONS" => Verb::Options,
            "GET" => Verb::Get,
            "HEAD" => Verb::Head,
            "POST" => Verb::Post,
            "PUT" => Verb::Put,
            "DELETE" => Verb::Delete,
            "TRACE" => Verb::Trace,
            "CONNECT" => Verb::Connect,
            "MOVE" => Verb::Move,
            "COPY" => Verb::Copy,
            "PROPFIND" => Verb::PropFind,
            "PROPPATCH" => Verb::PropPatch,
            "MKCOL" => Verb::MkCol,
            "LOCK" => Verb::Lock,
            "UNLOCK" => Verb::Unlock,
            "SEARCH" => Verb::Search,
            // Less known verbs may come in any casing
            _ if token.eq_ignore_ascii_case("MERGE") => Verb::Merge,
            _ if token.eq_ignore_ascii_case("PATCH") => Verb::Patch,
            _ => return Err(UnknownVerb(token.to_owned())),
        };
        Ok(verb)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed reason-text table for status codes the server emits.
pub fn reason_text(status: u16) -> &'static str {
    match status {
        // 100
        100 => "Continue with request",
        101 => "Switching protocols",
        // 200
        200 => "OK",
        201 => "Created new object",
        202 => "Accepted for processing",
        204 => "No info",
        206 => "Partial content answered",
        // 300
        301 => "Moved resource",
        302 => "Redirect to moved resource",
        303 => "Redirect to new access method",
        304 => "Not modified since time",
        307 => "HTTP/1.1: Keep same verb",
        // 400
        400 => "Invalid syntax",
        401 => "Access denied",
        402 => "Payment required",
        403 => "Request forbidden",
        404 => "URL/Object not found",
        405 => "Method is not allowed",
        406 => "No acceptable response found",
        407 => "Proxy authentication required",
        408 => "Server timed out",
        409 => "Conflict",
        410 => "Resource is no longer available",
        411 => "Length required",
        412 => "Precondition failed",
        413 => "Request body too large",
        414 => "URI too long",
        415 => "Unsupported media type",
        // 500
        500 => "Internal server error",
        501 => "Not supported",
        502 => "Error from gateway",
        503 => "Temporarily overloaded",
        504 => "Gateway timeout",
        505 => "HTTP version not supported",
        _ => "Unknown HTTP Status",
    }
}

/// An ordered, case-insensitive header collection.
///
/// Holds the headers the request model does not crack into dedicated
/// fields. Insertion order is preserved on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets `name` to `value`, replacing any previous values.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Appends a value without touching existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Removes every value for `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A URL cracked into its constituent parts.
///
/// The absolute path keeps its original casing; routing lowercases its own
/// copy. Query parameters are percent-decoded and kept in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrackedUrl {
    /// `http` or `https`.
    pub scheme: String,
    /// True for `https`.
    pub secure: bool,
    /// Host name or address, without the port.
    pub host: String,
    /// Port, defaulted from the scheme when absent.
    pub port: u16,
    /// Absolute path, always starting with `/`.
    pub abs_path: String,
    /// Decoded query parameters in wire order.
    pub query: Vec<(String, String)>,
    /// Fragment after `#`, if any.
    pub fragment: Option<String>,
}

/// Error from [`CrackedUrl::parse`].
#[derive(Debug, thiserror::Error)]
#[error("malformed URL: {0}")]
pub struct UrlError(pub String);

impl CrackedUrl {
    /// Cracks an absolute URL (`http://host:port/path?q#f`) or an
    /// origin-form request target (`/path?q`).
    pub fn parse(raw: &str) -> Result<CrackedUrl, UrlError> {
        if raw.is_empty() {
            return Err(UrlError(raw.to_owned()));
        }
        let (scheme, secure, rest) = if let Some(rest) = strip_scheme(raw, "https://") {
            ("https".to_owned(), true, rest)
        } else if let Some(rest) = strip_scheme(raw, "http://") {
            ("http".to_owned(), false, rest)
        } else if raw.starts_with('/') {
            // Origin form: no authority present
            ("http".to_owned(), false, raw)
        } else {
            return Err(UrlError(raw.to_owned()));
        };

        let (authority, target) = if rest.starts_with('/') {
            ("", rest)
        } else {
            match rest.find('/') {
                Some(pos) => (&rest[..pos], &rest[pos..]),
                None => (rest, "/"),
            }
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| UrlError(raw.to_owned()))?;
                (host.to_owned(), port)
            }
            _ => (authority.to_owned(), if secure { 443 } else { 80 }),
        };

        let (target, fragment) = match target.split_once('#') {
            Some((before, frag)) => (before, Some(frag.to_owned())),
            None => (target, None),
        };
        let (abs_path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let mut query = Vec::new();
        if let Some(raw_query) = raw_query {
            for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                query.push((decode_component(name), decode_component(value)));
            }
        }

        Ok(CrackedUrl {
            scheme,
            secure,
            host,
            port,
            abs_path: abs_path.to_owned(),
            query,
            fragment,
        })
    }

    /// First query value for `name` (case-sensitive per RFC 3986).
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The absolute URL this was cracked from, without query or fragment.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.abs_path)
    }
}

fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    if raw.len() >= scheme.len() && raw[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&raw[scheme.len()..])
    } else {
        None
    }
}

fn decode_component(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_owned(),
    }
}

/// `SameSite` attribute of a cookie.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// One cookie with its attributes.
///
/// Attributes left `None` inherit the site-wide defaults when the response
/// is assembled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpCookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// `Secure` attribute.
    pub secure: Option<bool>,
    /// `HttpOnly` attribute.
    pub http_only: Option<bool>,
    /// `SameSite` attribute.
    pub same_site: Option<SameSite>,
    /// `Path` attribute.
    pub path: Option<String>,
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Max-Age` attribute in seconds.
    pub max_age: Option<i64>,
    /// `Expires` attribute.
    pub expires: Option<DateTime<Utc>>,
}

impl HttpCookie {
    /// A cookie with just a name and value; attributes inherit later.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        HttpCookie {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Parses the pairs of a request `Cookie:` header.
    pub fn parse_request_header(header: &str) -> Vec<HttpCookie> {
        header
            .split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                let (name, value) = pair.split_once('=')?;
                Some(HttpCookie::new(name.trim(), value.trim()))
            })
            .collect()
    }

    /// Renders the value of one `Set-Cookie:` response header.
    pub fn to_set_cookie_value(&self) -> String {
        let mut line = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            line.push_str("; Path=");
            line.push_str(path);
        }
        if let Some(domain) = &self.domain {
            line.push_str("; Domain=");
            line.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            line.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(expires) = self.expires {
            line.push_str("; Expires=");
            line.push_str(&format_http_date(expires));
        }
        if let Some(same_site) = self.same_site {
            line.push_str("; SameSite=");
            line.push_str(same_site.as_str());
        }
        if self.secure == Some(true) {
            line.push_str("; Secure");
        }
        if self.http_only == Some(true) {
            line.push_str("; HttpOnly");
        }
        line
    }
}

/// The body of a request or response.
///
/// Owned by the message; the sink releases it after a successful write.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BodyBuffer {
    /// No body.
    #[default]
    Empty,
    /// An in-memory body, possibly assembled from multiple parts.
    Bytes(Vec<u8>),
    /// A file-backed body served from the filesystem.
    File(PathBuf),
}

impl BodyBuffer {
    /// Body length in bytes, if knowable without touching the filesystem.
    pub fn len(&self) -> Option<u64> {
        match self {
            BodyBuffer::Empty => Some(0),
            BodyBuffer::Bytes(bytes) => Some(bytes.len() as u64),
            BodyBuffer::File(_) => None,
        }
    }

    /// Whether there is no body at all.
    pub fn is_empty(&self) -> bool {
        match self {
            BodyBuffer::Empty => true,
            BodyBuffer::Bytes(bytes) => bytes.is_empty(),
            BodyBuffer::File(_) => false,
        }
    }

    /// The in-memory bytes, empty for `Empty` and `File` variants.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            BodyBuffer::Bytes(bytes) => bytes,
            _ => &[],
        }
    }

    /// Appends a part to the in-memory buffer, converting `Empty` first.
    ///
    /// Appending to a `File` body replaces it with the given bytes.
    pub fn append(&mut self, part: &[u8]) {
        match self {
            BodyBuffer::Bytes(bytes) => bytes.extend_from_slice(part),
            _ => *self = BodyBuffer::Bytes(part.to_vec()),
        }
    }

    /// Drops the body.
    pub fn reset(&mut self) {
        *self = BodyBuffer::Empty;
    }
}

/// The parsed form of one HTTP request.
///
/// Created by the reactor when bytes arrive and destroyed by the pipeline's
/// cleanup path after the response sink has answered.
#[derive(Debug)]
pub struct HttpRequest {
    /// The request verb (possibly rewritten by verb tunneling).
    pub verb: Verb,
    /// The raw request target as received.
    pub raw_url: String,
    /// The cracked URL.
    pub url: CrackedUrl,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// `Content-Length` header.
    pub content_length: Option<u64>,
    /// `Accept` header.
    pub accept: Option<String>,
    /// `Accept-Encoding` header.
    pub accept_encoding: Option<String>,
    /// `Authorization` header.
    pub authorization: Option<String>,
    /// Parsed `If-Modified-Since` header.
    pub if_modified_since: Option<DateTime<Utc>>,
    /// `Referer` header.
    pub referer: Option<String>,
    /// Cookies from the `Cookie:` header.
    pub cookies: Vec<HttpCookie>,
    /// Remote socket address of the client.
    pub remote_addr: SocketAddr,
    /// Remote desktop id (zero when the client sent none).
    pub desktop: u32,
    /// Authenticated principal (SID string), when authentication ran.
    pub user: Option<String>,
    /// Opaque id correlating the response channel.
    pub request_id: RequestId,
    /// Id of the underlying connection (stable across keep-alive requests).
    pub connection_id: u64,
    /// Headers not cracked into a dedicated field.
    pub headers: HeaderMap,
    /// The request body.
    pub body: BodyBuffer,
    /// False until the body has been pulled from the channel.
    pub body_read: bool,
    /// Respond with a UTF-8 BOM (set by inbound UTF-16 transcoding).
    pub send_bom: bool,
}

impl HttpRequest {
    /// A minimal GET request; fields are filled in by the reactor.
    pub fn new(verb: Verb, raw_url: &str, url: CrackedUrl, remote_addr: SocketAddr) -> Self {
        HttpRequest {
            verb,
            raw_url: raw_url.to_owned(),
            url,
            content_type: None,
            content_length: None,
            accept: None,
            accept_encoding: None,
            authorization: None,
            if_modified_since: None,
            referer: None,
            cookies: Vec::new(),
            remote_addr,
            desktop: 0,
            user: None,
            request_id: RequestId::NONE,
            connection_id: 0,
            headers: HeaderMap::new(),
            body: BodyBuffer::Empty,
            body_read: true,
            send_bom: false,
        }
    }

    /// Whether the client accepts a gzip response body.
    pub fn accepts_gzip(&self) -> bool {
        self.accept_encoding
            .as_deref()
            .map(|enc| enc.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false)
    }
}

/// The response being assembled for one request.
#[derive(Debug)]
pub struct HttpResponse {
    /// Shares the opaque id of the request it answers.
    pub request_id: RequestId,
    /// Status code.
    pub status: u16,
    /// Reason text override; the fixed table applies when `None`.
    pub reason: Option<String>,
    /// Response headers.
    pub headers: HeaderMap,
    /// Cookies to set.
    pub cookies: Vec<HttpCookie>,
    /// The response body.
    pub body: BodyBuffer,
    /// Prefix the body with a UTF-8 BOM.
    pub send_bom: bool,
    answered: bool,
}

impl HttpResponse {
    /// An empty 200 response correlated with `request_id`.
    pub fn new(request_id: RequestId) -> Self {
        HttpResponse {
            request_id,
            status: 200,
            reason: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: BodyBuffer::Empty,
            send_bom: false,
            answered: false,
        }
    }

    /// The reason text that goes on the status line.
    pub fn reason_text(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| reason_text(self.status))
    }

    /// Flips the answered latch.
    ///
    /// Returns true exactly once; emitters that observe false must not
    /// write to the sink again.
    pub fn mark_answered(&mut self) -> bool {
        !std::mem::replace(&mut self.answered, true)
    }

    /// Whether a response has already been written for this request.
    pub fn is_answered(&self) -> bool {
        self.answered
    }
}

/// Formats a timestamp as an RFC 1123 HTTP date (`Tue, 02 Jan 2024 03:04:05 GMT`).
pub fn format_http_date(stamp: DateTime<Utc>) -> String {
    stamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses the HTTP date formats allowed in request headers.
///
/// RFC 1123 is the normal case; the obsolete RFC 850 and asctime forms are
/// accepted for old clients.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    for format in [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// A placeholder socket address for messages built outside a connection.
pub fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_round_trip_their_token() {
        for verb in Verb::all() {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), *verb);
        }
    }

    #[test]
    fn lowercase_merge_and_patch_resolve() {
        assert_eq!("merge".parse::<Verb>().unwrap(), Verb::Merge);
        assert_eq!("Patch".parse::<Verb>().unwrap(), Verb::Patch);
        assert!("get".parse::<Verb>().is_err());
        assert!("BREW".parse::<Verb>().is_err());
    }

    #[test]
    fn reason_table_matches_the_fixed_texts() {
        assert_eq!(reason_text(200), "OK");
        assert_eq!(reason_text(204), "No info");
        assert_eq!(reason_text(304), "Not modified since time");
        assert_eq!(reason_text(400), "Invalid syntax");
        assert_eq!(reason_text(404), "URL/Object not found");
        assert_eq!(reason_text(413), "Request body too large");
        assert_eq!(reason_text(500), "Internal server error");
        assert_eq!(reason_text(503), "Temporarily overloaded");
        assert_eq!(reason_text(999), "Unknown HTTP Status");
    }

    #[test]
    fn crack_absolute_url() {
        let url = CrackedUrl::parse("https://example.com:8443/a/b?x=1&y=%20z#frag").unwrap();
        assert!(url.secure);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8443);
        assert_eq!(url.abs_path, "/a/b");
        assert_eq!(url.query_value("x"), Some("1"));
        assert_eq!(url.query_value("y"), Some(" z"));
        assert_eq!(url.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn crack_origin_form_defaults_the_authority() {
        let url = CrackedUrl::parse("/hello/world").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.port, 80);
        assert_eq!(url.abs_path, "/hello/world");
        assert!(url.query.is_empty());
    }

    #[test]
    fn header_map_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("X-HTTP-Method", "DELETE");
        assert_eq!(headers.get("x-http-method"), Some("DELETE"));
        headers.set("x-http-method", "PUT");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-HTTP-Method"), Some("PUT"));
    }

    #[test]
    fn cookie_header_parses_pairs() {
        let cookies = HttpCookie::parse_request_header("session=abc; theme=dark");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[1].value, "dark");
    }

    #[test]
    fn set_cookie_value_renders_attributes() {
        let mut cookie = HttpCookie::new("id", "42");
        cookie.path = Some("/".to_owned());
        cookie.secure = Some(true);
        cookie.http_only = Some(true);
        cookie.same_site = Some(SameSite::Lax);
        let line = cookie.to_set_cookie_value();
        assert!(line.starts_with("id=42"));
        assert!(line.contains("; Path=/"));
        assert!(line.contains("; SameSite=Lax"));
        assert!(line.ends_with("; Secure; HttpOnly"));
    }

    #[test]
    fn answered_latch_flips_once() {
        let mut response = HttpResponse::new(RequestId::new(7));
        assert!(response.mark_answered());
        assert!(!response.mark_answered());
        assert!(response.is_answered());
    }

    #[test]
    fn http_dates_round_trip() {
        let stamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rendered = format_http_date(stamp);
        assert_eq!(rendered, "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(parse_http_date(&rendered), Some(stamp));
    }
}
