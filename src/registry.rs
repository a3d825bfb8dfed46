// Copyright 2020 Joyent, Inc.

//! Server-side route table and dispatcher.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_derive::Serialize;
use slog::{debug, error, o, warn, Logger};
use tokio::time::Instant;

use crate::config::FastConfig;
use crate::error::RemoteError;
use crate::handler::{encode_reply, Context, Handler, Middleware, MiddlewareChain, Next};
use crate::protocol::{FastMessage, FastMessageKind};
use crate::transport::UdpTransport;

/// Exact-match mapping from route to handler. Later registrations for the
/// same route replace earlier ones.
///
/// The registry also holds the middleware stack that wraps every handler.
#[derive(Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Arc<dyn Handler>>>,
    middleware: RwLock<MiddlewareChain>,
}

impl RouteRegistry {
    pub fn new() -> RouteRegistry {
        RouteRegistry::default()
    }

    /// Returns the handler that was replaced, if any.
    pub fn on(&self, route: impl Into<String>, handler: Arc<dyn Handler>) -> Option<Arc<dyn Handler>> {
        self.routes.write().insert(route.into(), handler)
    }

    pub fn get(&self, route: &str) -> Option<Arc<dyn Handler>> {
        self.routes.read().get(route).cloned()
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.read().keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Append `middleware` inside everything registered before it.
    pub fn wrap(&self, middleware: Arc<dyn Middleware>) {
        let mut chain = self.middleware.write();
        let mut extended: Vec<Arc<dyn Middleware>> = chain.iter().cloned().collect();
        extended.push(middleware);
        *chain = Arc::new(extended);
    }

    pub fn middleware(&self) -> MiddlewareChain {
        Arc::clone(&self.middleware.read())
    }
}

/// Counters kept by a running server.
#[derive(Default)]
pub struct ServerStats {
    received: AtomicU64,
    malformed: AtomicU64,
    dispatched: AtomicU64,
    route_not_found: AtomicU64,
    handler_errors: AtomicU64,
    duplicates: AtomicU64,
    ignored: AtomicU64,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Datagrams read from the socket.
    pub received: u64,
    /// Datagrams dropped because they did not decode.
    pub malformed: u64,
    /// Messages whose handler was invoked.
    pub dispatched: u64,
    pub route_not_found: u64,
    pub handler_errors: u64,
    /// Retransmitted requests that did not reach a handler again.
    pub duplicates: u64,
    /// Response messages sent to the server, which it never expects.
    pub ignored: u64,
}

impl ServerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self) {
        ServerStats::bump(&self.received);
    }

    pub(crate) fn malformed(&self) {
        ServerStats::bump(&self.malformed);
    }

    pub(crate) fn ignored(&self) {
        ServerStats::bump(&self.ignored);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            route_not_found: self.route_not_found.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

type SeenKey = (SocketAddr, u64);

enum Seen {
    InFlight,
    Answered(Instant, Bytes),
}

/// Requests the server has admitted, keyed by sender and correlation id.
///
/// In-flight entries stay until their handler finishes. Answered entries
/// keep the Response datagram for replay and leave after the
/// de-duplication window or when more than `capacity` are held, oldest
/// first.
#[derive(Default)]
struct SeenCache {
    entries: HashMap<SeenKey, Seen>,
    answered: VecDeque<(SeenKey, Instant)>,
}

impl SeenCache {
    fn answer(&mut self, key: SeenKey, at: Instant, datagram: Bytes, capacity: usize) -> usize {
        self.entries.insert(key, Seen::Answered(at, datagram));
        self.answered.push_back((key, at));
        let mut evicted = 0;
        while self.answered.len() > capacity {
            if self.pop_oldest() {
                evicted += 1;
            }
        }
        evicted
    }

    fn purge(&mut self, now: Instant, window: Duration) -> usize {
        let mut purged = 0;
        while let Some((_, at)) = self.answered.front() {
            if now.saturating_duration_since(*at) < window {
                break;
            }
            if self.pop_oldest() {
                purged += 1;
            }
        }
        purged
    }

    fn pop_oldest(&mut self) -> bool {
        match self.answered.pop_front() {
            Some((key, at)) => match self.entries.get(&key) {
                Some(Seen::Answered(answered_at, _)) if *answered_at == at => {
                    self.entries.remove(&key);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }
}

enum Admission {
    New,
    InFlight,
    Replay(Bytes),
}

/// Resolves inbound messages to handlers and sends Responses back.
///
/// Requests are remembered per `(peer, correlation id)` so a retransmitted
/// Request never runs its handler a second time. While the first copy is
/// still being handled the duplicate is dropped; once it is answered, the
/// stored Response datagram is sent again for the de-duplication window.
pub struct Dispatcher {
    registry: Arc<RouteRegistry>,
    transport: Arc<UdpTransport>,
    config: Arc<FastConfig>,
    stats: Arc<ServerStats>,
    seen: Mutex<SeenCache>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RouteRegistry>,
        transport: Arc<UdpTransport>,
        config: Arc<FastConfig>,
        stats: Arc<ServerStats>,
        log: &Logger,
    ) -> Dispatcher {
        Dispatcher {
            registry,
            transport,
            config,
            stats,
            seen: Mutex::new(SeenCache::default()),
            log: log.new(o!("component" => "dispatcher")),
        }
    }

    pub async fn dispatch(&self, msg: FastMessage, peer: SocketAddr) {
        match msg.kind {
            FastMessageKind::Request => self.dispatch_request(msg, peer).await,
            FastMessageKind::Fire => self.dispatch_fire(msg, peer).await,
            FastMessageKind::Response => {
                self.stats.ignored();
                debug!(self.log, "ignoring response sent to server"; "peer" => %peer);
            }
        }
    }

    async fn dispatch_request(&self, msg: FastMessage, peer: SocketAddr) {
        let log = self.log.new(o!("peer" => peer.to_string(), "id" => msg.id));
        match self.admit(peer, msg.id) {
            Admission::New => (),
            Admission::InFlight => {
                ServerStats::bump(&self.stats.duplicates);
                debug!(log, "dropping duplicate of in-flight request");
                return;
            }
            Admission::Replay(datagram) => {
                ServerStats::bump(&self.stats.duplicates);
                debug!(log, "replaying stored response");
                self.send(&log, peer, &datagram).await;
                return;
            }
        }

        let outcome = match self.registry.get(&msg.route) {
            Some(handler) => self.invoke(&log, handler, &msg, peer).await,
            None => {
                ServerStats::bump(&self.stats.route_not_found);
                warn!(log, "route not found"; "route" => &msg.route);
                Err(RemoteError::route_not_found(&msg.route))
            }
        };

        let datagram = self.encode_response(&log, &msg, outcome);
        let evicted = self.seen.lock().answer(
            (peer, msg.id),
            Instant::now(),
            datagram.clone(),
            self.config.dedup_capacity,
        );
        if evicted > 0 {
            debug!(log, "evicted remembered responses"; "count" => evicted);
        }
        self.send(&log, peer, &datagram).await;
    }

    async fn dispatch_fire(&self, msg: FastMessage, peer: SocketAddr) {
        let log = self.log.new(o!("peer" => peer.to_string()));
        match self.registry.get(&msg.route) {
            Some(handler) => {
                if let Err(err) = self.invoke(&log, handler, &msg, peer).await {
                    error!(log, "fire handler failed"; "route" => &msg.route, "err" => %err.message);
                }
            }
            None => {
                ServerStats::bump(&self.stats.route_not_found);
                debug!(log, "dropping fire for unknown route"; "route" => &msg.route);
            }
        }
    }

    /// Run a handler inside the middleware chain, turning both errors and
    /// panics into a `RemoteError`.
    async fn invoke(
        &self,
        log: &Logger,
        handler: Arc<dyn Handler>,
        msg: &FastMessage,
        peer: SocketAddr,
    ) -> std::result::Result<Bytes, RemoteError> {
        ServerStats::bump(&self.stats.dispatched);
        debug!(log, "invoking handler"; "route" => &msg.route, "bytes" => msg.payload.len());

        let ctx = Context::new(msg, peer);
        let next = Next::new(self.registry.middleware(), handler);
        // Synchronous handlers and middleware run inside `run`, so it is
        // called from within the guarded future.
        let result = AssertUnwindSafe(async move { next.run(ctx).await })
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(response)) => Ok(response.into_payload()),
            Ok(Err(err)) => {
                ServerStats::bump(&self.stats.handler_errors);
                if msg.kind == FastMessageKind::Request {
                    warn!(log, "handler failed"; "route" => &msg.route, "err" => %err);
                }
                Err(RemoteError::handler_failed(&msg.route, err.to_string()))
            }
            Err(_) => {
                ServerStats::bump(&self.stats.handler_errors);
                error!(log, "handler panicked"; "route" => &msg.route);
                Err(RemoteError::handler_failed(
                    &msg.route,
                    String::from("handler panicked"),
                ))
            }
        }
    }

    fn encode_response(
        &self,
        log: &Logger,
        msg: &FastMessage,
        outcome: std::result::Result<Bytes, RemoteError>,
    ) -> Bytes {
        let limit = self.config.max_datagram_size;
        let response = FastMessage::response(msg.id, msg.route.clone(), encode_reply(outcome));
        match response.to_datagram(limit) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(log, "response does not fit a datagram"; "err" => %err);
                let fallback = RemoteError::handler_failed(&msg.route, err.to_string());
                let reply = encode_reply(Err(fallback));
                // An error reply is a few hundred bytes at most, so this
                // only fails for a datagram limit below that.
                FastMessage::response(msg.id, msg.route.clone(), reply)
                    .to_datagram(limit)
                    .unwrap_or_default()
            }
        }
    }

    async fn send(&self, log: &Logger, peer: SocketAddr, datagram: &Bytes) {
        if datagram.is_empty() {
            return;
        }
        if let Err(err) = self.transport.send(peer, datagram).await {
            error!(log, "failed to send response"; "err" => %err);
        }
    }

    fn admit(&self, peer: SocketAddr, id: u64) -> Admission {
        let mut seen = self.seen.lock();
        match seen.entries.get(&(peer, id)) {
            Some(Seen::InFlight) => Admission::InFlight,
            Some(Seen::Answered(_, datagram)) => Admission::Replay(datagram.clone()),
            None => {
                seen.entries.insert((peer, id), Seen::InFlight);
                Admission::New
            }
        }
    }

    /// Forget Responses answered longer ago than the de-duplication window.
    /// Requests whose handler is still running are kept.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.seen.lock().purge(now, self.config.dedup_window())
    }

    pub fn remembered(&self) -> usize {
        self.seen.lock().entries.len()
    }
}
