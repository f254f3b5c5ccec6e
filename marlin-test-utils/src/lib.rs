//! Test scaffolding for the Marlin application server.
//!
//! Spawns fully wired servers on ephemeral ports and talks to them with a
//! raw HTTP/1.1 client over `TcpStream`, so tests can observe the wire
//! byte-exactly (SSE frames, gzip bodies, keep-alive behavior) instead of
//! going through a client library that normalizes it away.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::time::Duration;

use eyre::{Context as _, eyre};
use marlin_server::{Server, ServerConfig, SiteBuilder};
use marlin_types::soap::NS_RELIABLE;
use marlin_types::{SoapMessage, SoapVersion, XmlElement};

/// Installs a tracing subscriber honoring `RUST_LOG`, once per process.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Reserves a free TCP port by binding and dropping an ephemeral socket.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("can bind an ephemeral port");
    listener.local_addr().expect("bound socket has an address").port()
}

/// A running server bound to an ephemeral port, stopped on drop.
pub struct TestServer {
    /// The server under test.
    pub server: Server,
    /// The port it listens on.
    pub port: u16,
}

impl TestServer {
    /// Spawns a server after letting `configure` register its sites.
    ///
    /// The closure receives the server and the reserved port so site
    /// registrations can name it.
    pub fn spawn(
        config: ServerConfig,
        configure: impl FnOnce(&Server, u16) -> eyre::Result<()>,
    ) -> eyre::Result<TestServer> {
        init_test_logging();
        let port = free_port();
        let server = Server::new(config);
        configure(&server, port)?;
        server.run().context("server did not start")?;
        Ok(TestServer { server, port })
    }

    /// Spawns a server with default configuration and one site.
    pub fn spawn_site(
        build: impl FnOnce(u16) -> SiteBuilder,
    ) -> eyre::Result<TestServer> {
        Self::spawn(ServerConfig::default(), |server, port| {
            server.register_site(build(port))?;
            Ok(())
        })
    }

    /// A client connected to this server.
    pub fn client(&self) -> eyre::Result<TestClient> {
        TestClient::connect(self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// One parsed HTTP/1.1 response.
#[derive(Clone, Debug)]
pub struct TestResponse {
    /// Status code from the status line.
    pub status: u16,
    /// Reason text from the status line.
    pub reason: String,
    /// Header lines in wire order.
    pub headers: Vec<(String, String)>,
    /// The raw body bytes.
    pub body: Vec<u8>,
}

impl TestResponse {
    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body gunzipped, for responses with `Content-Encoding: gzip`.
    pub fn gunzipped(&self) -> eyre::Result<Vec<u8>> {
        let mut decoder = flate2::read::GzDecoder::new(&self.body[..]);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).context("body is not gzip")?;
        Ok(plain)
    }

    /// The body parsed as a SOAP envelope.
    pub fn soap(&self) -> eyre::Result<SoapMessage> {
        let text = self.text();
        SoapMessage::parse(text.trim_start_matches('\u{feff}'))
            .map_err(|error| eyre!("response is not SOAP: {error}"))
    }
}

/// A raw HTTP/1.1 client over one keep-alive connection.
pub struct TestClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    /// Connects to `127.0.0.1:port`.
    pub fn connect(port: u16) -> eyre::Result<TestClient> {
        let stream = TcpStream::connect(("127.0.0.1", port)).context("connect failed")?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(TestClient { stream, reader })
    }

    /// Sends one request and reads the response.
    pub fn request(
        &mut self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> eyre::Result<TestResponse> {
        self.send_request(method, target, headers, body)?;
        self.read_response()
    }

    /// A bare GET.
    pub fn get(&mut self, target: &str) -> eyre::Result<TestResponse> {
        self.request("GET", target, &[], &[])
    }

    /// POSTs a SOAP envelope and parses the enveloped answer.
    pub fn post_soap(&mut self, target: &str, message: &SoapMessage) -> eyre::Result<SoapMessage> {
        let body = message.to_xml();
        let response = self.request(
            "POST",
            target,
            &[("Content-Type", "application/soap+xml; charset=utf-8")],
            body.as_bytes(),
        )?;
        response.soap()
    }

    /// Writes a request without waiting for the answer.
    pub fn send_request(
        &mut self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> eyre::Result<()> {
        let mut wire = format!("{method} {target} HTTP/1.1\r\nHost: 127.0.0.1\r\n");
        for (name, value) in headers {
            wire.push_str(&format!("{name}: {value}\r\n"));
        }
        if !body.is_empty() || method == "POST" || method == "PUT" {
            wire.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        wire.push_str("\r\n");
        self.stream.write_all(wire.as_bytes())?;
        self.stream.write_all(body)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads one complete response off the connection.
    pub fn read_response(&mut self) -> eyre::Result<TestResponse> {
        let status_line = self.read_line()?;
        let mut pieces = status_line.splitn(3, ' ');
        let _version = pieces.next().ok_or_else(|| eyre!("empty status line"))?;
        let status: u16 = pieces
            .next()
            .ok_or_else(|| eyre!("no status code in {status_line:?}"))?
            .parse()?;
        let reason = pieces.next().unwrap_or("").to_owned();

        let mut headers = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| eyre!("bad header line {line:?}"))?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        let length: usize = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| value.parse())
            .transpose()?
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).context("short body")?;

        Ok(TestResponse {
            status,
            reason,
            headers,
            body,
        })
    }

    /// Reads a response head only, for bodies that never end (SSE).
    pub fn read_response_head(&mut self) -> eyre::Result<(u16, Vec<(String, String)>)> {
        let status_line = self.read_line()?;
        let status: u16 = status_line
            .split(' ')
            .nth(1)
            .ok_or_else(|| eyre!("bad status line {status_line:?}"))?
            .parse()?;
        let mut headers = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_owned(), value.trim().to_owned()));
            }
        }
        Ok((status, headers))
    }

    /// Reads one SSE frame (through the blank-line terminator).
    ///
    /// Returns the raw frame text, comments included.
    pub fn read_sse_frame(&mut self) -> eyre::Result<String> {
        let mut frame = String::new();
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                if frame.is_empty() {
                    continue;
                }
                return Ok(frame);
            }
            frame.push_str(&line);
            frame.push('\n');
        }
    }

    /// Half-closes the connection so the server sees a dead peer.
    pub fn shutdown_write(&self) -> eyre::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn read_line(&mut self) -> eyre::Result<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(eyre!("connection closed"));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

/// Builders for the reliable-messaging envelopes the protocol expects.
pub mod rm {
    use super::*;

    /// A `CreateSequence` offering `client_nonce`.
    pub fn create_sequence(client_nonce: &str) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, NS_RELIABLE, "CreateSequence");
        let mut offer = XmlElement::new("Offer");
        offer.add_child(XmlElement::with_text("Identifier", client_nonce));
        message.parameters.push(offer);
        message
    }

    /// A normal in-sequence application message.
    pub fn message(
        namespace: &str,
        action: &str,
        server_nonce: &str,
        client_nonce: &str,
        number: u64,
    ) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, namespace, action);
        message.reliability = true;
        message.client_sequence = server_nonce.to_owned();
        message.server_sequence = client_nonce.to_owned();
        message.client_message_number = number;
        message
    }

    /// A `LastMessage` marker for the sequence.
    pub fn last_message(server_nonce: &str, number: u64) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, NS_RELIABLE, "LastMessage");
        message.reliability = true;
        message.client_sequence = server_nonce.to_owned();
        message.client_message_number = number;
        message
    }

    /// A `TerminateSequence` naming the server's identifier.
    pub fn terminate_sequence(server_nonce: &str) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, NS_RELIABLE, "TerminateSequence");
        message.set_parameter("Identifier", server_nonce);
        message
    }

    /// A fresh client nonce.
    pub fn client_nonce() -> String {
        format!("urn:uuid:{}", uuid::Uuid::new_v4())
    }
}
