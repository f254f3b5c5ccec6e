#![deny(missing_docs)]
//! This crate provides the core of Marlin, an embeddable HTTP application
//! server.
//!
//! Hosting applications construct a [`Server`] from a
//! [`config::ServerConfig`], register one or more sites with
//! [`site::SiteBuilder`] (port, base path, a handler per verb, an ordered
//! filter chain, and the per-site policy: authentication, WS-Security
//! level, reliable messaging, CORS, compression, throttling, automatic
//! security headers), and call [`Server::run`]. From that point every
//! request received on a listening port is parsed by the message-parser
//! collaborator, routed by longest URL prefix to the owning site, and
//! executed on a worker of the elastic thread pool; no handler ever
//! blocks the reactor.
//!
//! On top of plain request/response the engine runs three protocol
//! machines: WS-ReliableMessaging ordered sessions (see [`reliable`]),
//! long-lived Server-Sent-Events streams with heartbeat keep-alives (see
//! [`events`]), and the WS-Security request validator covering body
//! signing, body encryption, envelope encryption, and the UsernameToken
//! profile (see [`security`]).
//!
//! Call [`Server::shutdown`] for a graceful stop: listeners close first,
//! event streams get their final `close` event, reliable-messaging
//! sessions are destroyed, and the worker pool drains with a bounded
//! wait, so the call returns even when user code misbehaves.
//!
//! The engine performs no payload parsing of its own beyond envelope
//! structure: SOAP/JSON payload handling, WSDL caching, and schema
//! validation belong to the hosting application.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use marlin_types::ServerEvent;
use parking_lot::Mutex;

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod reliable;
pub mod security;
pub mod site;

pub use config::ServerConfig;
pub use error::{ErrorReport, ServerError, TracingErrorReport, TransportError};
pub use pipeline::Exchange;
pub use registry::{RouterError, SiteId};
pub use site::{Site, SiteBuilder, SiteFilter, SiteHandler};

use events::EventStreamRegistry;
use pool::WorkerPool;
use reactor::ListenerHandle;
use reactor::parser::{Http11Parser, MessageParser};
use reactor::sink::{ChannelRegistry, ResponseSink, TcpResponseSink};
use registry::SiteRegistry;

/// Error from registering a site with a running server.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The site configuration does not build.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// The registry rejected the site.
    #[error(transparent)]
    Router(#[from] RouterError),
    /// The listener for the site's port could not be bound.
    #[error("could not bind listener: {0}")]
    Listener(#[from] std::io::Error),
}

/// Shared state of one server instance.
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) pool: WorkerPool,
    pub(crate) registry: SiteRegistry,
    pub(crate) channels: Arc<ChannelRegistry>,
    pub(crate) sink: Arc<dyn ResponseSink>,
    pub(crate) parser: Arc<dyn MessageParser>,
    pub(crate) events: EventStreamRegistry,
    pub(crate) report: Arc<dyn ErrorReport>,
    pub(crate) listeners: Mutex<Vec<ListenerHandle>>,
    pub(crate) running: AtomicBool,
    pub(crate) next_connection: AtomicU64,
    /// Live connection sockets, severed on shutdown so workers blocked
    /// in a keep-alive read come back promptly.
    pub(crate) connections: Mutex<std::collections::HashMap<u64, std::net::TcpStream>>,
    weak_self: Mutex<std::sync::Weak<ServerCore>>,
}

impl ServerCore {
    /// Starts the event heartbeat unless one is already beating.
    ///
    /// The heartbeat stops itself when the stream registry drains; a
    /// fresh subscription simply starts it again.
    pub(crate) fn ensure_event_heartbeat(&self) {
        // A stopping-but-not-yet-gone heartbeat refuses replacement for
        // a few milliseconds; retry briefly instead of losing the beat
        let period = self.config.event_keep_alive;
        for _ in 0..50 {
            let weak = self.weak_self.lock().clone();
            let callback: pool::heartbeat::HeartbeatFn = Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    if core.events.heartbeat_tick() == 0 {
                        core.pool.request_heartbeat_stop();
                    }
                }
            });
            if self.pool.create_heartbeat(callback, period) {
                return;
            }
            if self.events.is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

/// An embeddable HTTP application server instance.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// A server with the default collaborators: the built-in HTTP/1.1
    /// parser, the TCP response sink, and tracing-backed crash reports.
    pub fn new(config: ServerConfig) -> Server {
        Self::with_collaborators(config, Arc::new(Http11Parser), Arc::new(TracingErrorReport))
    }

    /// A server with a custom message parser and error reporter.
    pub fn with_collaborators(
        config: ServerConfig,
        parser: Arc<dyn MessageParser>,
        report: Arc<dyn ErrorReport>,
    ) -> Server {
        let channels = Arc::new(ChannelRegistry::new());
        let sink: Arc<dyn ResponseSink> = Arc::new(TcpResponseSink::new(Arc::clone(&channels)));
        let pool = WorkerPool::with_bounds(config.min_threads, config.max_threads, Arc::clone(&report));
        pool.set_stack_size(config.stack_size);
        let events = EventStreamRegistry::new(Arc::clone(&sink), config.event_keep_alive);

        let core = Arc::new_cyclic(|weak| ServerCore {
            config,
            pool,
            registry: SiteRegistry::new(),
            channels,
            sink,
            parser,
            events,
            report,
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
            connections: Mutex::new(std::collections::HashMap::new()),
            weak_self: Mutex::new(weak.clone()),
        });
        Server { core }
    }

    /// Registers a site; on a running server the listener for a new port
    /// is bound immediately.
    pub fn register_site(&self, builder: SiteBuilder) -> Result<SiteId, RegisterError> {
        let (site, parent) = builder.build()?;
        let port = site.port;
        let id = self.core.registry.register(site, parent)?;
        if self.core.running.load(Ordering::SeqCst) {
            self.ensure_listener(port)?;
        }
        Ok(id)
    }

    /// Removes a site; `force` also severs its sub-sites.
    pub fn unregister_site(&self, port: u16, base: &str, force: bool) -> Result<(), RouterError> {
        self.core.registry.unregister(port, base, force)
    }

    /// The site stored under an id.
    pub fn site(&self, id: SiteId) -> Option<Arc<Site>> {
        self.core.registry.get(id)
    }

    /// Longest-prefix lookup of the site owning `(port, path)`.
    pub fn find_site(&self, port: u16, path: &str) -> Option<Arc<Site>> {
        self.core.registry.find(port, path).map(|(_, site)| site)
    }

    /// Starts the pool and binds a listener for every registered port.
    pub fn run(&self) -> std::io::Result<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("starting server '{}'", self.core.config.name);
        self.core.pool.run();
        for port in self.core.registry.ports() {
            self.ensure_listener(port)?;
        }
        Ok(())
    }

    /// Stops the server: listeners first, then streams, sessions, the
    /// pool, and finally every client channel. Returns when everything
    /// is down; never blocks indefinitely.
    pub fn shutdown(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping server '{}'", self.core.config.name);

        let mut listeners = std::mem::take(&mut *self.core.listeners.lock());
        for listener in &mut listeners {
            listener.stop();
        }

        // Workers waiting on a keep-alive read come back once the
        // underlying socket is severed
        for (_, stream) in self.core.connections.lock().iter() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        self.core.events.close_all();
        for site in self.core.registry.all() {
            site.rm_sessions.clear();
        }

        self.core.pool.shutdown();
        self.core.channels.close_all();
        tracing::info!("server '{}' stopped", self.core.config.name);
    }

    /// Whether the server is accepting traffic.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Broadcasts a push event to the streams of `(port, url)`.
    ///
    /// The user filter is case-insensitive; `None` matches every stream.
    /// Returns the number of streams written.
    pub fn send_event(&self, port: u16, url: &str, event: ServerEvent, user: Option<&str>) -> usize {
        self.core.events.send_event(port, url, event, user)
    }

    /// Closes the push streams of `(port, url)` with a final `close` event.
    pub fn close_event_streams(&self, port: u16, url: &str, user: Option<&str>) -> usize {
        self.core.events.close_streams(port, url, user)
    }

    /// Number of live push streams on `(port, url)`.
    pub fn has_event_streams(&self, port: u16, url: &str, user: Option<&str>) -> usize {
        self.core.events.has_streams(port, url, user)
    }

    /// The worker pool, for advanced hosting scenarios (sleep/wake,
    /// cleanup jobs, extra heartbeats).
    pub fn pool(&self) -> &WorkerPool {
        &self.core.pool
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    fn ensure_listener(&self, port: u16) -> std::io::Result<()> {
        let mut listeners = self.core.listeners.lock();
        if listeners.iter().any(|listener| listener.port() == port) {
            return Ok(());
        }
        let handle = reactor::start_listener(Arc::clone(&self.core), port)?;
        listeners.push(handle);
        Ok(())
    }
}
