//! The per-request site pipeline.
//!
//! All stages of one request run on the same worker, in program order:
//! body check, CORS, async early-answer, filters, handler resolution,
//! security validation, reliability, the handler itself, and the
//! post-handle step that always runs, panic or not. Exactly one response
//! leaves through the sink; the answered latch makes every further
//! emitter a logged no-op.

use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};

use flate2::Compression;
use flate2::write::GzEncoder;
use marlin_types::{
    BodyBuffer, HttpRequest, HttpResponse, RequestId, SessionAddress, SoapMessage, SoapVersion,
    Verb, reason_text,
};

use crate::ServerCore;
use crate::error::ServerError;
use crate::metrics::{METRICS_ID_REQUESTS_DISPATCHED, METRICS_ID_REQUESTS_FAILED};
use crate::reliable::{RmOutcome, reliable_check};
use crate::security;
use crate::site::{EncryptionLevel, FilterOutcome, ReliableType, Site, XFrameOption};

/// Everything a filter or handler can see and touch for one request.
pub struct Exchange<'a> {
    /// The request, owned by the pipeline.
    pub request: &'a mut HttpRequest,
    /// The response being assembled.
    pub response: &'a mut HttpResponse,
    /// The site the request resolved to.
    pub site: &'a Site,
    /// The validated SOAP message, when the site runs SOAP protocols.
    pub soap: Option<SoapMessage>,
    core: &'a ServerCore,
}

impl<'a> Exchange<'a> {
    /// The session address of the requesting client.
    pub fn session_address(&self) -> SessionAddress {
        SessionAddress::new(
            self.request.user.clone().unwrap_or_default(),
            self.request.desktop,
            self.request.remote_addr,
            &self.request.url.abs_path,
        )
    }

    /// Answers 200 with `body`.
    pub fn respond_ok(&mut self, content_type: &str, body: impl Into<Vec<u8>>) {
        self.response.status = 200;
        self.response.reason = None;
        self.response.headers.set("Content-Type", content_type);
        self.response.body = BodyBuffer::Bytes(body.into());
        self.send();
    }

    /// Answers 304 Not Modified with an empty body.
    pub fn respond_304(&mut self) {
        self.response.status = 304;
        self.response.reason = None;
        self.response.body = BodyBuffer::Empty;
        self.send();
    }

    /// Answers a 4xx with the site's client error page.
    pub fn respond_client_error(&mut self, status: u16, reason: Option<&str>) {
        self.response.status = status;
        self.response.reason = reason.map(str::to_owned);
        self.response.body = BodyBuffer::Empty;
        if self.site.auth.scheme != crate::site::AuthScheme::Anonymous && status == 401 {
            self.response
                .headers
                .set("WWW-Authenticate", challenge(self.site));
        }
        self.send();
    }

    /// Answers a 5xx with the site's server error page.
    pub fn respond_server_error(&mut self, status: u16, reason: Option<&str>) {
        self.response.status = status;
        self.response.reason = reason.map(str::to_owned);
        self.response.body = BodyBuffer::Empty;
        self.send();
    }

    /// Answers with a SOAP fault envelope.
    pub fn respond_soap_fault(&mut self, code: &str, actor: &str, string: &str, detail: &str) {
        let version = self
            .soap
            .as_ref()
            .map(|soap| soap.version)
            .unwrap_or_default();
        let mut fault = SoapMessage::new(version, "", "");
        fault.set_fault(code, actor, string, detail);
        self.send_soap(&fault);
    }

    /// Destroys the RM session for `address`, then answers with a fault.
    pub fn respond_rm_fault(
        &mut self,
        address: &SessionAddress,
        code: &str,
        actor: &str,
        string: &str,
        detail: &str,
    ) {
        let mut message = SoapMessage::new(SoapVersion::V12, "", "");
        message.set_fault(code, actor, string, detail);
        // A fault ends the session; the client must open a new sequence
        self.site.rm_sessions.remove_address(address);
        self.send_soap(&message);
    }

    /// Serializes a SOAP envelope into the response and sends it.
    pub fn send_soap(&mut self, message: &SoapMessage) {
        let content_type = match message.version {
            SoapVersion::V11 => "text/xml; charset=utf-8",
            SoapVersion::V12 => "application/soap+xml; charset=utf-8",
        };
        self.response.status = 200;
        self.response.headers.set("Content-Type", content_type);
        self.response.body = BodyBuffer::Bytes(message.to_xml().into_bytes());
        self.response.send_bom = self.site.respond_soap_bom;
        self.send();
    }

    /// Finalizes and writes the current response, once.
    pub fn send(&mut self) {
        finalize_and_send(self.core, self.site, self.request, self.response);
    }

    /// Opens a chunked transfer-encoding response.
    ///
    /// The head counts as the one answer for this request; stream the
    /// body with [`Exchange::send_as_chunk`] afterwards.
    pub fn open_chunked(&mut self) -> Result<(), ServerError> {
        if !self.response.mark_answered() {
            tracing::warn!("chunked response after an answer was already sent");
            return Err(ServerError::Configuration("response already sent".to_owned()));
        }
        apply_auto_headers(self.site, self.response);
        self.core.sink.open_chunked(self.response)?;
        Ok(())
    }

    /// Streams one body chunk; `last` closes the chunked body.
    pub fn send_as_chunk(&mut self, bytes: &[u8], last: bool) -> Result<(), ServerError> {
        self.core
            .sink
            .send_chunk(self.response.request_id, bytes, last)?;
        Ok(())
    }

    /// Whether a response has already gone out.
    pub fn is_answered(&self) -> bool {
        self.response.is_answered()
    }
}

fn challenge(site: &Site) -> String {
    use crate::site::AuthScheme;
    match site.auth.scheme {
        AuthScheme::Basic => format!("Basic realm=\"{}\"", site.auth.realm),
        AuthScheme::Digest => format!("Digest realm=\"{}\"", site.auth.realm),
        AuthScheme::Ntlm => "NTLM".to_owned(),
        AuthScheme::Negotiate => "Negotiate".to_owned(),
        AuthScheme::Kerberos => "Kerberos".to_owned(),
        AuthScheme::Anonymous => String::new(),
    }
}

/// Runs the full pipeline for one routed request.
///
/// The request is consumed; its resources are released on every path,
/// crash included.
pub(crate) fn run(core: &ServerCore, site: &Site, request: &mut HttpRequest) {
    metrics::counter!(METRICS_ID_REQUESTS_DISPATCHED).increment(1);
    let mut response = HttpResponse::new(request.request_id);
    response.send_bom = request.send_bom;

    let crashed = {
        let mut exchange = Exchange {
            request: &mut *request,
            response: &mut response,
            site,
            soap: None,
            core,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| run_stages(&mut exchange)));
        match outcome {
            Ok(()) => false,
            Err(panic) => {
                let description = crate::pool::panic_text(&panic);
                // A crash inside the reporter itself must not recurse;
                // downgrade it to a minimal log line
                let reported = catch_unwind(AssertUnwindSafe(|| {
                    core.report.report(&site.prefix_url, &description);
                }));
                if reported.is_err() {
                    tracing::error!("DOUBLE INTERNAL ERROR while making an error report");
                }
                true
            }
        }
    };

    if crashed {
        metrics::counter!(METRICS_ID_REQUESTS_FAILED).increment(1);
        post_handle_crash(core, site, request, &mut response);
    }

    // End of the line: drop impersonation and release the request body
    request.user = None;
    request.body.reset();
}

/// The ordered pipeline stages; panics unwind to the caller's guard.
fn run_stages(exchange: &mut Exchange<'_>) {
    // A body that could not be pulled from the channel
    if !exchange.request.body_read {
        tracing::warn!("request body was not readable; answering 410");
        exchange.respond_client_error(410, None);
        return;
    }

    // Cross-origin gate
    let auto = &exchange.site.auto_headers;
    if auto.use_cors {
        if let Some(allow) = auto.allow_origin.as_deref() {
            let origin = exchange.request.headers.get("Origin").unwrap_or_default();
            if allow != "*" && !allow.eq_ignore_ascii_case(origin) {
                tracing::warn!("CORS origin rejected: {origin}");
                exchange.respond_client_error(403, None);
                return;
            }
        }
    }

    // Asynchronous sites answer before they process
    if exchange.site.async_site {
        exchange.respond_ok("text/plain", Vec::new());
        exchange.response.request_id = RequestId::NONE;
        exchange.request.request_id = RequestId::NONE;
        tracing::debug!("sent early 200 for asynchronous site");
    }

    // Filters, in ascending priority order
    for filter in exchange.site.filter_chain() {
        match filter.filter(exchange) {
            Ok(FilterOutcome::Continue) => {}
            Ok(FilterOutcome::Handled) => return,
            Err(error) => {
                answer_error(exchange, &error);
                return;
            }
        }
    }

    // Resolve the handler for the verb before running protocol checks
    let handler = exchange.site.handler(exchange.request.verb);
    let handler = match handler {
        Some(handler) => handler,
        None if exchange.request.verb == Verb::Options => {
            let allow = exchange.site.allow_list();
            exchange.response.headers.set("Allow", allow);
            exchange.respond_ok("text/plain", Vec::new());
            return;
        }
        None => {
            tracing::debug!(
                "no handler for {} on {}",
                exchange.request.verb,
                exchange.site.prefix_url
            );
            exchange.respond_client_error(400, None);
            return;
        }
    };

    // Message security
    if exchange.site.encryption_level != EncryptionLevel::Plain {
        let body = exchange.request.body.as_bytes().to_vec();
        match security::unwrap_and_validate(exchange.site, &body) {
            Ok(message) => exchange.soap = Some(message),
            Err(fault) => {
                exchange.respond_soap_fault("Client", "Configuration", &fault.string, &fault.detail);
                return;
            }
        }
        if let Some(message) = exchange.soap.as_ref() {
            match security::validate_username_token(exchange.site, message) {
                Ok(Some(principal)) => exchange.request.user = Some(principal),
                Ok(None) => {}
                Err(fault) => {
                    tracing::warn!("UsernameToken rejected: {}", fault.detail);
                    exchange.respond_client_error(401, None);
                    return;
                }
            }
        }
    }

    // Reliable messaging
    if exchange.site.reliable != ReliableType::None {
        let mut message = match exchange.soap.take() {
            Some(message) => message,
            None => {
                let body = exchange.request.body.as_bytes().to_vec();
                let text = String::from_utf8_lossy(&body).into_owned();
                match SoapMessage::parse(&text) {
                    Ok(message) => message,
                    Err(error) => {
                        exchange.respond_soap_fault(
                            "Client",
                            "Client program",
                            "Not a valid SOAP/XML message",
                            &format!("Ill formed XML message. Review your program logic. Reported: {error}"),
                        );
                        return;
                    }
                }
            }
        };
        if message.version != SoapVersion::V12 {
            exchange.respond_soap_fault(
                "Client",
                "Settings",
                "Must use SOAP 1.2",
                "WS-ReliableMessaging requires SOAP 1.2 envelopes.",
            );
            return;
        }
        message.url = exchange.request.url.base_url();
        let address = exchange.session_address();
        let namespace = exchange.core.config.reliable_namespace.clone();
        match reliable_check(exchange.site, &namespace, &address, &mut message) {
            RmOutcome::Handled => {
                let reply = message;
                exchange.send_soap(&reply);
                return;
            }
            RmOutcome::Continue => exchange.soap = Some(message),
        }
    }

    // The user handler
    if let Err(error) = handler.handle(exchange) {
        answer_error(exchange, &error);
        return;
    }

    // Handlers that only filled the response rely on the post-handle send
    if !exchange.is_answered() {
        exchange.send();
    }
}

fn answer_error(exchange: &mut Exchange<'_>, error: &ServerError) {
    metrics::counter!(METRICS_ID_REQUESTS_FAILED).increment(1);
    tracing::warn!("pipeline error on {}: {error}", exchange.site.prefix_url);
    let status = error.status();
    match error {
        ServerError::Transport(_) => {} // nothing can be written anymore
        _ if status >= 500 => exchange.respond_server_error(status, None),
        _ => exchange.respond_client_error(status, None),
    }
}

/// The crash path: respond 500 without a stack trace, resources intact.
fn post_handle_crash(
    core: &ServerCore,
    site: &Site,
    request: &mut HttpRequest,
    response: &mut HttpResponse,
) {
    if response.is_answered() {
        return;
    }
    response.status = 500;
    response.reason = None;
    response.body = BodyBuffer::Empty;
    response.headers.remove("Content-Encoding");
    finalize_and_send(core, site, request, response);
}

/// Applies site policy to the assembled response and writes it, once.
pub(crate) fn finalize_and_send(
    core: &ServerCore,
    site: &Site,
    request: &HttpRequest,
    response: &mut HttpResponse,
) {
    if !response.mark_answered() {
        tracing::warn!(
            "second response suppressed for request {}",
            response.request_id
        );
        return;
    }

    // Error pages for empty 4xx/5xx bodies
    if response.status >= 400 && response.body.is_empty() {
        let reason = response.reason_text().to_owned();
        response.body = BodyBuffer::Bytes(site.error_page(response.status, &reason).into_bytes());
        response.headers.set("Content-Type", "text/html");
    }

    apply_auto_headers(site, response);
    apply_cache_policy(site, response);

    let mut cookies = std::mem::take(&mut response.cookies);
    for cookie in &mut cookies {
        site.finish_cookie(cookie);
    }
    response.cookies = cookies;

    if site.respond_json_bom
        && response
            .headers
            .get("Content-Type")
            .is_some_and(|kind| kind.to_ascii_lowercase().contains("json"))
    {
        response.send_bom = true;
    }

    // Forced UTF-16 output: transcode text bodies and mark the charset
    if site.respond_unicode {
        if let BodyBuffer::Bytes(bytes) = &response.body {
            if let Ok(text) = std::str::from_utf8(bytes) {
                let mut wide = vec![0xFF, 0xFE];
                for unit in text.encode_utf16() {
                    wide.extend_from_slice(&unit.to_le_bytes());
                }
                response.body = BodyBuffer::Bytes(wide);
                response.send_bom = false;
                if let Some(kind) = response.headers.get("Content-Type").map(str::to_owned) {
                    let base = kind.split(';').next().unwrap_or(&kind).trim().to_owned();
                    response.headers.set("Content-Type", format!("{base}; charset=utf-16"));
                }
            }
        }
    }

    // Gzip when the site allows it and the client asked for it
    if site.http_compression
        && request.accepts_gzip()
        && !response.headers.contains("Content-Encoding")
    {
        if let BodyBuffer::Bytes(bytes) = &response.body {
            if !bytes.is_empty() && bytes.len() as u64 <= core.config.compress_limit {
                match gzip(bytes) {
                    Ok(compressed) => {
                        response.body = BodyBuffer::Bytes(compressed);
                        response.headers.set("Content-Encoding", "gzip");
                    }
                    Err(error) => tracing::warn!("gzip failed, sending identity: {error}"),
                }
            }
        }
    }

    if let Err(error) = core.sink.send_response(response) {
        match error {
            crate::error::TransportError::NoChannel(0) => {
                // Cleared request id: deliberate no-op
            }
            error => tracing::warn!("response write failed: {error}"),
        }
    }
}

fn apply_auto_headers(site: &Site, response: &mut HttpResponse) {
    let auto = &site.auto_headers;
    match &auto.x_frame {
        XFrameOption::NotSet => {}
        XFrameOption::Deny => response.headers.set("X-Frame-Options", "DENY"),
        XFrameOption::SameOrigin => response.headers.set("X-Frame-Options", "SAMEORIGIN"),
        XFrameOption::AllowFrom(uri) => response
            .headers
            .set("X-Frame-Options", format!("ALLOW-FROM {uri}")),
    }
    if let Some(max_age) = auto.hsts_max_age {
        let mut value = format!("max-age={max_age}");
        if auto.hsts_sub_domains {
            value.push_str("; includeSubDomains");
        }
        response.headers.set("Strict-Transport-Security", value);
    }
    if auto.no_sniff {
        response.headers.set("X-Content-Type-Options", "nosniff");
    }
    if auto.xss_protection {
        let value = if auto.xss_block { "1; mode=block" } else { "1" };
        response.headers.set("X-XSS-Protection", value);
    }
    if auto.no_cache_control {
        response.headers.set(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, max-age=0, post-check=0, pre-check=0",
        );
        response.headers.set("Pragma", "no-cache");
        response.headers.set("Expires", "0");
    }
    if auto.use_cors {
        let origin = auto.allow_origin.clone().unwrap_or_else(|| "*".to_owned());
        response.headers.set("Access-Control-Allow-Origin", origin);
    }
}

fn apply_cache_policy(site: &Site, response: &mut HttpResponse) {
    use crate::config::CachePolicy;
    if response.headers.contains("Cache-Control") {
        return;
    }
    match site.cache_policy {
        CachePolicy::Nocache => {}
        CachePolicy::UserInvalidates => {
            response.headers.set("Cache-Control", "no-cache");
        }
        CachePolicy::TimeToLive(seconds) => {
            response.headers.set("Cache-Control", format!("max-age={seconds}"));
        }
        CachePolicy::Maximum => {
            response.headers.set("Cache-Control", "max-age=31536000, immutable");
        }
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Answers 304 Not Modified without running any handler.
pub(crate) fn respond_not_modified(core: &ServerCore, request_id: RequestId) {
    let mut response = HttpResponse::new(request_id);
    response.status = 304;
    if !response.mark_answered() {
        return;
    }
    if let Err(error) = core.sink.send_response(&response) {
        tracing::debug!("304 write failed: {error}");
    }
}

/// Answers a request with no site context (router miss, early failure).
pub(crate) fn respond_plain_error(core: &ServerCore, request_id: RequestId, status: u16) {
    let mut response = HttpResponse::new(request_id);
    response.status = status;
    response.headers.set("Content-Type", "text/plain");
    response.body = BodyBuffer::Bytes(
        format!("{} {}", status, reason_text(status)).into_bytes(),
    );
    if !response.mark_answered() {
        return;
    }
    metrics::counter!(METRICS_ID_REQUESTS_FAILED).increment(1);
    if let Err(error) = core.sink.send_response(&response) {
        tracing::debug!("error response write failed: {error}");
    }
}
