//! The reactor: listening endpoints, request construction, and dispatch.
//!
//! One accept thread per port turns inbound connections into pool work
//! items. The work item owns the connection for its lifetime: it reads
//! request heads through the [`parser::MessageParser`] collaborator,
//! builds [`HttpRequest`] values, routes them through the site registry,
//! and runs the pipeline, honoring HTTP/1.1 keep-alive. Subscribing GETs
//! on event-stream sites divert to the event registry and leave the
//! channel open. The reactor never calls user handlers directly.

pub mod parser;
pub mod sink;

use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use marlin_types::{CrackedUrl, HttpCookie, HttpRequest, SessionAddress, Verb};

use crate::ServerCore;
use crate::pipeline;
use parser::{ParseError, RequestHead};

/// Verbs accepted through the `X-HTTP-Method` override header.
const TUNNELABLE: [Verb; 4] = [Verb::Put, Verb::Delete, Verb::Merge, Verb::Patch];

/// Handle of one listening endpoint.
pub(crate) struct ListenerHandle {
    port: u16,
    local_addr: SocketAddr,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// The port this listener serves.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Unblocks and joins the accept thread.
    pub(crate) fn stop(&mut self) {
        // A throw-away connection pops the accept loop out of its wait
        let _ = TcpStream::connect(("127.0.0.1", self.local_addr.port()));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Binds the listener for `port` and starts its accept thread.
pub(crate) fn start_listener(core: Arc<ServerCore>, port: u16) -> std::io::Result<ListenerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let local_addr = listener.local_addr()?;
    tracing::info!("listening on {local_addr} (backlog {})", core.config.queue_length);

    let thread = std::thread::Builder::new()
        .name(format!("marlin-accept-{port}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if !core.running.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let connection_core = Arc::clone(&core);
                        let job = Box::new(move || handle_connection(connection_core, stream));
                        if core.pool.submit_work(job).is_err() {
                            // Closing down: the connection is simply dropped
                            break;
                        }
                    }
                    Err(error) => tracing::warn!("accept failed on port {port}: {error}"),
                }
            }
            tracing::debug!("accept loop for port {port} ended");
        })?;

    Ok(ListenerHandle {
        port,
        local_addr,
        thread: Some(thread),
    })
}

/// Serves one connection until close, error, or stream subscription.
fn handle_connection(core: Arc<ServerCore>, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(error) => {
            tracing::debug!("connection lost before first request: {error}");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
    let connection_id = core.next_connection.fetch_add(1, Ordering::SeqCst);

    let reader_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(error) => {
            tracing::warn!("could not clone connection stream: {error}");
            return;
        }
    };
    let mut reader = BufReader::new(reader_stream);

    // Registered so shutdown can sever a blocked keep-alive read
    let _connection_entry = match stream.try_clone() {
        Ok(clone) => Some(ConnectionEntry::register(&core, connection_id, clone)),
        Err(_) => None,
    };

    loop {
        let head = match core.parser.read_head(&mut reader) {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(ParseError::Io(error)) => {
                tracing::debug!("connection read failed: {error}");
                break;
            }
            Err(error) => {
                tracing::warn!("malformed request from {peer}: {error}");
                let request_id = register_channel(&core, &stream);
                if let Some(request_id) = request_id {
                    pipeline::respond_plain_error(&core, request_id, 400);
                    core.channels.forget(request_id);
                }
                break;
            }
        };

        let Some(request_id) = register_channel(&core, &stream) else {
            break;
        };

        // The verb; unknown tokens answer 501 and end the connection
        let verb: Verb = match head.method.parse() {
            Ok(verb) => verb,
            Err(error) => {
                tracing::warn!("{error}");
                pipeline::respond_plain_error(&core, request_id, 501);
                core.channels.forget(request_id);
                break;
            }
        };

        let mut request = match build_request(&core, &head, verb, peer, port, connection_id) {
            Ok(request) => request,
            Err(status) => {
                pipeline::respond_plain_error(&core, request_id, status);
                core.channels.forget(request_id);
                break;
            }
        };
        request.request_id = request_id;

        // Body reception: pull the declared length off the channel
        let declared = request.content_length.unwrap_or(0);
        if declared > 0 {
            match parser::read_sized_body(&mut reader, declared, core.config.streaming_limit) {
                Ok(body) => {
                    request.body.append(&body);
                    request.body_read = true;
                }
                Err(ParseError::Malformed(reason)) => {
                    tracing::warn!("{reason}");
                    pipeline::respond_plain_error(&core, request_id, 413);
                    core.channels.forget(request_id);
                    break;
                }
                Err(error) => {
                    tracing::warn!("body read failed: {error}");
                    request.body_read = false;
                }
            }
            if request.verb == Verb::Post {
                if let marlin_types::BodyBuffer::Bytes(bytes) = &mut request.body {
                    if charset_permits_utf16(request.content_type.as_deref())
                        && parser::transcode_utf16(bytes)
                    {
                        request.send_bom = true;
                    }
                }
            }
        }

        let keep_alive = connection_keeps_alive(&head);

        // Route to the owning site
        let Some((_, site)) = core.registry.find(port, &request.url.abs_path) else {
            tracing::debug!("no site for {port}:{}", request.url.abs_path);
            pipeline::respond_plain_error(&core, request_id, 404);
            core.channels.forget(request_id);
            if keep_alive {
                continue;
            }
            break;
        };

        // If-Modified-Since short-circuit against the site's webroot
        if request.verb == Verb::Get {
            if let Some(since) = request.if_modified_since {
                if !modified_since(&core, &site, &request.url.abs_path, since) {
                    pipeline::respond_not_modified(&core, request_id);
                    core.channels.forget(request_id);
                    if keep_alive {
                        continue;
                    }
                    break;
                }
            }
        }

        // Verb tunneling rewrites POST before dispatch
        if request.verb == Verb::Post && site.verb_tunneling {
            if let Some(tunneled) = request.headers.get("X-HTTP-Method") {
                match tunneled.parse::<Verb>() {
                    Ok(verb) if TUNNELABLE.contains(&verb) => {
                        tracing::debug!("verb tunneling rewrote POST to {verb}");
                        request.verb = verb;
                    }
                    _ => tracing::warn!("ignored verb tunneling to {tunneled}"),
                }
            }
        }

        // Server push subscriptions keep the channel and end the loop
        if site.is_event_stream && request.verb == Verb::Get {
            let user = request.user.clone().unwrap_or_default();
            match core.events.subscribe(
                &site,
                &request.url.abs_path,
                &request.url.abs_path,
                request_id,
                &user,
            ) {
                Ok(stream_id) => {
                    core.ensure_event_heartbeat();
                    tracing::debug!("connection parked on event stream {stream_id}");
                }
                Err(error) => {
                    tracing::warn!("event stream subscription failed: {error}");
                    pipeline::respond_plain_error(&core, request_id, 503);
                    core.channels.forget(request_id);
                }
            }
            return;
        }

        // The pipeline, behind the per-address throttle when configured
        if site.throttling {
            let address = SessionAddress::new(
                request.user.clone().unwrap_or_default(),
                request.desktop,
                request.remote_addr,
                &request.url.abs_path,
            );
            let throttle = site.throttle_for(&address);
            let _serialized = throttle.lock();
            pipeline::run(&core, &site, &mut request);
            drop(_serialized);
            if site.throttle_count() > crate::site::MAX_HTTP_THROTTLES {
                site.flush_throttles();
            }
        } else {
            pipeline::run(&core, &site, &mut request);
        }

        core.channels.forget(request_id);
        if !keep_alive {
            break;
        }
    }
}

/// RAII entry in the live-connection table.
struct ConnectionEntry {
    core: Arc<ServerCore>,
    id: u64,
}

impl ConnectionEntry {
    fn register(core: &Arc<ServerCore>, id: u64, stream: TcpStream) -> ConnectionEntry {
        core.connections.lock().insert(id, stream);
        ConnectionEntry {
            core: Arc::clone(core),
            id,
        }
    }
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        self.core.connections.lock().remove(&self.id);
    }
}

fn register_channel(core: &ServerCore, stream: &TcpStream) -> Option<marlin_types::RequestId> {
    match stream.try_clone() {
        Ok(clone) => Some(core.channels.register(clone)),
        Err(error) => {
            tracing::warn!("could not clone response channel: {error}");
            None
        }
    }
}

/// Builds the request model from a parsed head, cracking known headers.
fn build_request(
    core: &ServerCore,
    head: &RequestHead,
    verb: Verb,
    peer: SocketAddr,
    port: u16,
    connection_id: u64,
) -> Result<HttpRequest, u16> {
    let mut url = CrackedUrl::parse(&head.target).map_err(|error| {
        tracing::warn!("{error}");
        400u16
    })?;
    if url.host.is_empty() {
        url.host = head
            .header("Host")
            .map(|host| host.split(':').next().unwrap_or(host).to_owned())
            .unwrap_or_else(|| "localhost".to_owned());
        url.port = port;
    }

    let mut request = HttpRequest::new(verb, &head.target, url, peer);
    request.connection_id = connection_id;

    for (name, value) in &head.headers {
        match name.to_ascii_lowercase().as_str() {
            "accept" => request.accept = Some(value.clone()),
            "content-type" => request.content_type = Some(value.clone()),
            "content-length" => {
                let length: u64 = value.parse().map_err(|_| 400u16)?;
                if length > core.config.streaming_limit {
                    return Err(413);
                }
                request.content_length = Some(length);
            }
            "accept-encoding" => request.accept_encoding = Some(value.clone()),
            "cookie" => request.cookies = HttpCookie::parse_request_header(value),
            "authorization" => {
                request.authorization = Some(value.clone());
                request.user = basic_principal(value);
            }
            "if-modified-since" => {
                request.if_modified_since = marlin_types::http::parse_http_date(value);
            }
            "referer" => request.referer = Some(value.clone()),
            // Extra header for remote desktop (terminal server) clients
            "remotedesktop" => request.desktop = value.parse().unwrap_or(0),
            "host" => {}
            _ => request.headers.append(name.clone(), value.clone()),
        }
    }
    Ok(request)
}

/// The principal of a Basic authorization header, when one is carried.
///
/// Credential verification itself belongs to the hosting process or the
/// UsernameToken profile; this only surfaces the identity.
fn basic_principal(authorization: &str) -> Option<String> {
    let encoded = authorization.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, _password) = text.split_once(':')?;
    Some(user.to_owned())
}

fn connection_keeps_alive(head: &RequestHead) -> bool {
    let connection = head.header("Connection").unwrap_or_default();
    if connection.eq_ignore_ascii_case("close") {
        return false;
    }
    if head.version.eq_ignore_ascii_case("HTTP/1.0") {
        return connection.eq_ignore_ascii_case("keep-alive");
    }
    true
}

fn charset_permits_utf16(content_type: Option<&str>) -> bool {
    match content_type {
        Some(content_type) => {
            let lowered = content_type.to_ascii_lowercase();
            match lowered.split_once("charset=") {
                Some((_, charset)) => {
                    let charset = charset.split(';').next().unwrap_or(charset).trim();
                    charset.starts_with("utf-16") || charset == "unicode"
                }
                // No declared charset: sniffing is allowed
                None => true,
            }
        }
        None => true,
    }
}

/// Whether the target file changed after `since`.
///
/// A missing file is not a 404 at this layer: the site handler may reach
/// files the server itself cannot, so the request continues instead.
fn modified_since(
    core: &ServerCore,
    site: &crate::site::Site,
    abs_path: &str,
    since: DateTime<Utc>,
) -> bool {
    let webroot = site.webroot.as_ref().unwrap_or(&core.config.webroot);
    let path = webroot.join(abs_path.trim_start_matches('/'));
    let Ok(metadata) = std::fs::metadata(&path) else {
        return true;
    };
    let Ok(modified) = metadata.modified() else {
        return true;
    };
    let modified: DateTime<Utc> = modified.into();
    // Header precision is one second
    modified.timestamp() > since.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_principal_is_extracted() {
        let header = format!("Basic {}", BASE64.encode("alice:secret"));
        assert_eq!(basic_principal(&header).as_deref(), Some("alice"));
        assert_eq!(basic_principal("Bearer token"), None);
        assert_eq!(basic_principal("Basic not-base64!!"), None);
    }

    #[test]
    fn keep_alive_follows_the_version_defaults() {
        let head = |version: &str, connection: Option<&str>| RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: version.into(),
            headers: connection
                .map(|value| vec![("Connection".to_owned(), value.to_owned())])
                .unwrap_or_default(),
        };
        assert!(connection_keeps_alive(&head("HTTP/1.1", None)));
        assert!(!connection_keeps_alive(&head("HTTP/1.1", Some("close"))));
        assert!(!connection_keeps_alive(&head("HTTP/1.0", None)));
        assert!(connection_keeps_alive(&head("HTTP/1.0", Some("keep-alive"))));
    }

    #[test]
    fn utf16_charset_gate() {
        assert!(charset_permits_utf16(None));
        assert!(charset_permits_utf16(Some("text/xml")));
        assert!(charset_permits_utf16(Some("text/xml; charset=UTF-16")));
        assert!(!charset_permits_utf16(Some("text/xml; charset=utf-8")));
    }
}
