//! The server push event stream registry.
//!
//! Every subscribed client holds one long-lived `text/event-stream`
//! response. The registry serializes writes per stream under one coarse
//! lock, keeps per-stream liveness and chunk counters, and relies on the
//! pool heartbeat for keep-alive comments and dead-stream eviction. A
//! stream is in the registry iff it is alive; once it goes dead exactly
//! one eviction path runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marlin_types::{HttpResponse, RequestId, ServerEvent};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::metrics::{METRICS_ID_EVENTS_SENT, METRICS_ID_EVENT_STREAMS_LIVE};
use crate::reactor::sink::ResponseSink;
use crate::site::Site;

/// Chunk budget of one stream before it is recycled.
///
/// Bounds the chunk count a single long-lived connection can accumulate;
/// the stream receives a final `close` event when it runs out.
pub const MAX_DATACHUNKS: u32 = 49152;

/// The wake-up margin subtracted from the keep-alive interval.
const KEEP_ALIVE_MARGIN: Duration = Duration::from_millis(500);

/// One live push stream.
#[derive(Clone, Debug)]
pub struct EventStream {
    /// Stable stream handle.
    pub id: u64,
    /// Response channel of the subscribing request.
    pub request_id: RequestId,
    /// Registered (lowercased, trimmed) URL of the stream set.
    pub base_url: String,
    /// Absolute path the client subscribed on.
    pub abs_path: String,
    /// Listening port.
    pub port: u16,
    /// Authenticated user, for user-filtered sends.
    pub user: String,
    /// Highest event id written to this stream.
    pub last_id: u64,
    /// Moment of the last successful write.
    pub last_pulse: Instant,
    /// Chunks written so far (events and keep-alives).
    pub chunks_sent: u32,
    /// False after the first failed write.
    pub alive: bool,
}

#[derive(Default)]
struct EventsInner {
    streams: HashMap<u64, EventStream>,
    next_id: u64,
}

/// The registry of all live event streams of one server.
pub struct EventStreamRegistry {
    inner: Mutex<EventsInner>,
    sink: Arc<dyn ResponseSink>,
    keep_alive: Duration,
    max_chunks: u32,
}

impl EventStreamRegistry {
    /// A registry writing through `sink`.
    pub fn new(sink: Arc<dyn ResponseSink>, keep_alive: Duration) -> Self {
        EventStreamRegistry {
            inner: Mutex::new(EventsInner::default()),
            sink,
            keep_alive,
            max_chunks: MAX_DATACHUNKS,
        }
    }

    /// Overrides the per-stream chunk budget (test support).
    pub fn set_max_chunks(&mut self, max_chunks: u32) {
        self.max_chunks = max_chunks;
    }

    /// Subscribes a request to the stream set of `url`.
    ///
    /// Writes the stream response head (`text/event-stream`, never cached,
    /// optional BOM) and returns the stable stream handle. A still-alive
    /// stream for the same site and request id is reused.
    pub fn subscribe(
        &self,
        site: &Site,
        url: &str,
        abs_path: &str,
        request_id: RequestId,
        user: &str,
    ) -> Result<u64, TransportError> {
        let base_url = canonical_url(url);
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.streams.values().find(|stream| {
            stream.base_url == base_url && stream.request_id == request_id && stream.alive
        }) {
            tracing::debug!("reusing still-alive stream {} for {base_url}", existing.id);
            return Ok(existing.id);
        }

        let mut head = HttpResponse::new(request_id);
        head.headers.set("Content-Type", "text/event-stream");
        head.headers.set("Cache-Control", "no-store, no-cache, must-revalidate");
        head.headers.set("Pragma", "no-cache");
        head.headers.set("Connection", "keep-alive");
        head.send_bom = site.respond_soap_bom;
        self.sink.open_stream(&head)?;

        inner.next_id += 1;
        let id = inner.next_id;
        inner.streams.insert(
            id,
            EventStream {
                id,
                request_id,
                base_url: base_url.clone(),
                abs_path: abs_path.to_owned(),
                port: site.port,
                user: user.to_owned(),
                last_id: 0,
                last_pulse: Instant::now(),
                chunks_sent: 0,
                alive: true,
            },
        );
        metrics::gauge!(METRICS_ID_EVENT_STREAMS_LIVE).set(inner.streams.len() as f64);
        tracing::info!("subscribed event stream {id} on {base_url}");
        Ok(id)
    }

    /// Broadcasts `event` to the streams of `(port, url)`.
    ///
    /// The user filter is case-insensitive; an empty filter matches all.
    /// Returns the number of streams written.
    pub fn send_event(&self, port: u16, url: &str, event: ServerEvent, user: Option<&str>) -> usize {
        let base_url = canonical_url(url);
        let targets: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .streams
                .values()
                .filter(|stream| stream.port == port && stream.base_url == base_url)
                .filter(|stream| match user {
                    Some(user) if !user.is_empty() => stream.user.eq_ignore_ascii_case(user),
                    _ => true,
                })
                .map(|stream| stream.id)
                .collect()
        };

        let mut sent = 0;
        for id in targets {
            if self.send_to_stream(id, event.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Writes one event to one stream, in total submission order.
    ///
    /// The event id defaults to `last_id + 1`; a caller-specified id wins
    /// and advances `last_id`. Returns whether the write succeeded.
    pub fn send_to_stream(&self, stream_id: u64, mut event: ServerEvent) -> bool {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            tracing::warn!("send to unknown event stream {stream_id}");
            return false;
        };
        if !stream.alive {
            return false;
        }

        if event.id == 0 {
            event.id = stream.last_id + 1;
        }
        stream.last_id = stream.last_id.max(event.id);

        let frame = event.to_wire();
        match self.sink.send_stream_chunk(stream.request_id, frame.as_bytes()) {
            Ok(()) => {
                stream.last_pulse = Instant::now();
                stream.chunks_sent += 1;
                metrics::counter!(METRICS_ID_EVENTS_SENT).increment(1);
                tracing::debug!(
                    "sent event id {} to stream {} on {}",
                    event.id,
                    stream.id,
                    stream.base_url
                );
                true
            }
            Err(error) => {
                // Eviction happens on the next heartbeat pass
                tracing::debug!("stream {} went dead: {error}", stream.id);
                stream.alive = false;
                false
            }
        }
    }

    /// Sends a final `close` event and tears the stream down.
    pub fn close_stream(&self, stream_id: u64) -> bool {
        let exists = {
            let inner = self.inner.lock();
            inner.streams.get(&stream_id).map(|s| s.alive)
        };
        match exists {
            Some(true) => {
                self.send_to_stream(stream_id, ServerEvent::named("close", ""));
                self.evict(stream_id);
                true
            }
            Some(false) => {
                self.evict(stream_id);
                true
            }
            None => false,
        }
    }

    /// Closes every stream of `(port, url)`, optionally one user's only.
    pub fn close_streams(&self, port: u16, url: &str, user: Option<&str>) -> usize {
        let base_url = canonical_url(url);
        let targets: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .streams
                .values()
                .filter(|stream| stream.port == port && stream.base_url == base_url)
                .filter(|stream| match user {
                    Some(user) if !user.is_empty() => stream.user.eq_ignore_ascii_case(user),
                    _ => true,
                })
                .map(|stream| stream.id)
                .collect()
        };
        let mut closed = 0;
        for id in targets {
            if self.close_stream(id) {
                closed += 1;
            }
        }
        closed
    }

    /// Number of live streams on `(port, url)`, optionally per user.
    pub fn has_streams(&self, port: u16, url: &str, user: Option<&str>) -> usize {
        let base_url = canonical_url(url);
        let inner = self.inner.lock();
        inner
            .streams
            .values()
            .filter(|stream| stream.port == port && stream.base_url == base_url && stream.alive)
            .filter(|stream| match user {
                Some(user) if !user.is_empty() => stream.user.eq_ignore_ascii_case(user),
                _ => true,
            })
            .count()
    }

    /// One heartbeat pass: keep-alives for quiet streams, eviction for
    /// dead or exhausted ones. Returns the number of remaining streams.
    pub fn heartbeat_tick(&self) -> usize {
        let keep_alive = self.keep_alive.saturating_sub(KEEP_ALIVE_MARGIN);
        let mut pulsed = 0u32;
        {
            let mut inner = self.inner.lock();
            for stream in inner.streams.values_mut() {
                if !stream.alive {
                    continue;
                }
                if stream.last_pulse.elapsed() > keep_alive {
                    match self
                        .sink
                        .send_stream_chunk(stream.request_id, b":keepalive\r\n\r\n")
                    {
                        Ok(()) => {
                            stream.last_pulse = Instant::now();
                            stream.chunks_sent += 1;
                            pulsed += 1;
                        }
                        Err(_) => stream.alive = false,
                    }
                }
            }
        }
        if pulsed > 0 {
            tracing::debug!("sent heartbeat to {pulsed} push-event clients");
        }

        // Eviction pass: exhausted streams get a final close event first
        let (exhausted, dead): (Vec<u64>, Vec<u64>) = {
            let inner = self.inner.lock();
            let exhausted = inner
                .streams
                .values()
                .filter(|s| s.alive && s.chunks_sent > self.max_chunks)
                .map(|s| s.id)
                .collect();
            let dead = inner
                .streams
                .values()
                .filter(|s| !s.alive)
                .map(|s| s.id)
                .collect();
            (exhausted, dead)
        };
        for id in exhausted {
            tracing::debug!("push-event stream {id} out of data chunks");
            self.send_to_stream(id, ServerEvent::named("close", ""));
            self.evict(id);
        }
        for id in dead {
            tracing::debug!("evicting abandoned push-event stream {id}");
            self.evict(id);
        }

        self.inner.lock().streams.len()
    }

    /// Tears down every stream; used during shutdown.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.inner.lock().streams.keys().copied().collect();
        for id in ids {
            self.close_stream(id);
        }
    }

    /// A snapshot of one stream's bookkeeping (test support).
    pub fn stream_state(&self, stream_id: u64) -> Option<EventStream> {
        self.inner.lock().streams.get(&stream_id).cloned()
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().streams.is_empty()
    }

    fn evict(&self, stream_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.remove(&stream_id) {
            self.sink.cancel_stream(stream.request_id);
            metrics::gauge!(METRICS_ID_EVENT_STREAMS_LIVE).set(inner.streams.len() as f64);
        }
    }
}

fn canonical_url(url: &str) -> String {
    url.to_ascii_lowercase().trim_end_matches('/').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that records stream chunks and can simulate a dead peer.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<(u64, Vec<u8>)>>,
        fail_writes: AtomicBool,
        cancelled: Mutex<Vec<u64>>,
    }

    impl RecordingSink {
        fn wire_for(&self, id: RequestId) -> String {
            let chunks = self.chunks.lock();
            let bytes: Vec<u8> = chunks
                .iter()
                .filter(|(chunk_id, _)| *chunk_id == id.into_inner())
                .flat_map(|(_, bytes)| bytes.clone())
                .collect();
            String::from_utf8(bytes).unwrap()
        }
    }

    impl ResponseSink for RecordingSink {
        fn send_response(&self, _response: &HttpResponse) -> Result<(), TransportError> {
            Ok(())
        }

        fn open_stream(&self, _response: &HttpResponse) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_stream_chunk(&self, id: RequestId, bytes: &[u8]) -> Result<(), TransportError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionLost);
            }
            self.chunks.lock().push((id.into_inner(), bytes.to_vec()));
            Ok(())
        }

        fn open_chunked(&self, _response: &HttpResponse) -> Result<(), TransportError> {
            Ok(())
        }

        fn send_chunk(&self, id: RequestId, bytes: &[u8], _last: bool) -> Result<(), TransportError> {
            self.send_stream_chunk(id, bytes)
        }

        fn cancel_stream(&self, id: RequestId) {
            self.cancelled.lock().push(id.into_inner());
        }
    }

    fn registry_with_sink(keep_alive: Duration) -> (EventStreamRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = EventStreamRegistry::new(Arc::clone(&sink) as Arc<dyn ResponseSink>, keep_alive);
        (registry, sink)
    }

    fn events_site() -> Site {
        SiteBuilder::new(8080, "/events/")
            .event_stream(true)
            .build()
            .unwrap()
            .0
    }

    #[test]
    fn events_arrive_in_order_with_monotonic_ids() {
        let (registry, sink) = registry_with_sink(Duration::from_secs(30));
        let site = events_site();
        let request = RequestId::new(11);
        let id = registry
            .subscribe(&site, "/events/", "/events/", request, "")
            .unwrap();

        registry.send_to_stream(id, ServerEvent::new("one"));
        registry.send_to_stream(id, ServerEvent::new("two"));
        registry.send_to_stream(id, ServerEvent::new("three"));

        let wire = sink.wire_for(request);
        assert_eq!(
            wire,
            "retry: 1\nid: 1\ndata: one\n\nid: 2\ndata: two\n\nid: 3\ndata: three\n\n"
        );
        let state = registry.stream_state(id).unwrap();
        assert_eq!(state.last_id, 3);
        assert_eq!(state.chunks_sent, 3);
        assert!(state.alive);
    }

    #[test]
    fn caller_specified_ids_win_and_advance() {
        let (registry, _sink) = registry_with_sink(Duration::from_secs(30));
        let site = events_site();
        let id = registry
            .subscribe(&site, "/events/", "/events/", RequestId::new(12), "")
            .unwrap();

        let mut event = ServerEvent::new("jump");
        event.id = 10;
        registry.send_to_stream(id, event);
        registry.send_to_stream(id, ServerEvent::new("next"));
        let state = registry.stream_state(id).unwrap();
        assert_eq!(state.last_id, 11);
    }

    #[test]
    fn broadcast_respects_the_user_filter() {
        let (registry, _sink) = registry_with_sink(Duration::from_secs(30));
        let site = events_site();
        registry
            .subscribe(&site, "/events/", "/events/", RequestId::new(21), "Alice")
            .unwrap();
        registry
            .subscribe(&site, "/events/", "/events/", RequestId::new(22), "bob")
            .unwrap();

        assert_eq!(registry.send_event(8080, "/Events/", ServerEvent::new("x"), None), 2);
        assert_eq!(
            registry.send_event(8080, "/events/", ServerEvent::new("y"), Some("ALICE")),
            1
        );
        assert_eq!(
            registry.send_event(8080, "/events/", ServerEvent::new("z"), Some("nobody")),
            0
        );
        assert_eq!(registry.send_event(9090, "/events/", ServerEvent::new("w"), None), 0);
    }

    #[test]
    fn quiet_streams_get_a_keepalive_and_stay_alive() {
        let (registry, sink) = registry_with_sink(Duration::from_millis(50));
        let site = events_site();
        let request = RequestId::new(31);
        let id = registry
            .subscribe(&site, "/events/", "/events/", request, "")
            .unwrap();
        let chunks_before = registry.stream_state(id).unwrap().chunks_sent;

        std::thread::sleep(Duration::from_millis(100));
        registry.heartbeat_tick();

        let state = registry.stream_state(id).unwrap();
        assert!(state.alive);
        assert_eq!(state.chunks_sent, chunks_before + 1);
        assert!(sink.wire_for(request).contains(":keepalive\r\n\r\n"));
    }

    #[test]
    fn dead_streams_are_evicted_once_by_the_heartbeat() {
        let (registry, sink) = registry_with_sink(Duration::from_millis(20));
        let site = events_site();
        let request = RequestId::new(41);
        let id = registry
            .subscribe(&site, "/events/", "/events/", request, "")
            .unwrap();

        sink.fail_writes.store(true, Ordering::SeqCst);
        assert!(!registry.send_to_stream(id, ServerEvent::new("lost")));
        assert!(!registry.stream_state(id).unwrap().alive);

        registry.heartbeat_tick();
        assert!(registry.stream_state(id).is_none());
        assert_eq!(sink.cancelled.lock().as_slice(), &[request.into_inner()]);
    }

    #[test]
    fn exhausted_streams_get_a_final_close_event() {
        let (mut registry, sink) = registry_with_sink(Duration::from_secs(30));
        registry.set_max_chunks(2);
        let site = events_site();
        let request = RequestId::new(51);
        let id = registry
            .subscribe(&site, "/events/", "/events/", request, "")
            .unwrap();

        for _ in 0..3 {
            registry.send_to_stream(id, ServerEvent::new("tick"));
        }
        registry.heartbeat_tick();

        assert!(registry.stream_state(id).is_none());
        let wire = sink.wire_for(request);
        assert!(wire.contains("event: close\n"));
    }

    #[test]
    fn close_stream_announces_itself() {
        let (registry, sink) = registry_with_sink(Duration::from_secs(30));
        let site = events_site();
        let request = RequestId::new(61);
        let id = registry
            .subscribe(&site, "/events/", "/events/", request, "")
            .unwrap();

        assert!(registry.close_stream(id));
        assert!(registry.is_empty());
        assert!(sink.wire_for(request).contains("event: close\n"));
        assert!(!registry.close_stream(id));
    }
}
