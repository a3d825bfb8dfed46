// Copyright 2020 Joyent, Inc.

//! Route-dispatching Fast server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::sync::Semaphore;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::FastConfig;
use crate::error::{FastError, HandlerError, Result};
use crate::handler::{Context, Handler, HandlerResult, Middleware, Response, SyncHandler};
use crate::protocol::FastMessage;
use crate::registry::{Dispatcher, RouteRegistry, ServerStats, StatsSnapshot};
use crate::transport::UdpTransport;

/// A Fast server: a route registry plus a receive loop.
///
/// Handlers are registered with `on`/`on_fn` (chainable) and may be added
/// or replaced while the server is listening. `listen` runs until `stop`
/// is called; the same server may then `listen` again.
pub struct Server {
    config: Arc<FastConfig>,
    registry: Arc<RouteRegistry>,
    stats: Arc<ServerStats>,
    shutdown: Mutex<CancellationToken>,
    local_addr: Mutex<Option<SocketAddr>>,
    log: Logger,
}

impl Server {
    pub fn new(config: FastConfig, log: Option<&Logger>) -> Server {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        Server {
            config: Arc::new(config),
            registry: Arc::new(RouteRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: Mutex::new(CancellationToken::new()),
            local_addr: Mutex::new(None),
            log,
        }
    }

    /// Register an async handler for `route`.
    pub fn on<F, Fut>(&self, route: &str, handler: F) -> &Server
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Response, HandlerError>> + Send + 'static,
    {
        self.on_handler(route, Arc::new(handler))
    }

    /// Register a synchronous handler for `route`.
    pub fn on_fn<F>(&self, route: &str, handler: F) -> &Server
    where
        F: Fn(Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_handler(route, Arc::new(SyncHandler(handler)))
    }

    pub fn on_handler(&self, route: &str, handler: Arc<dyn Handler>) -> &Server {
        if self.registry.on(route, handler).is_some() {
            warn!(self.log, "replaced handler"; "route" => route);
        } else {
            debug!(self.log, "registered route"; "route" => route);
        }
        self
    }

    /// Wrap every handler in `middleware`. Middleware added earlier runs
    /// first and sees the result last.
    pub fn with_middleware(&self, middleware: impl Middleware) -> &Server {
        self.registry.wrap(Arc::new(middleware));
        self
    }

    pub fn routes(&self) -> Vec<String> {
        self.registry.routes()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Address of the socket once the server is bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Ask a running `listen` to return.
    pub fn stop(&self) {
        self.shutdown.lock().cancel();
    }

    /// Token that stops the current run when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    /// Bind `address` and serve until stopped.
    pub async fn listen(&self, address: &str) -> Result<()> {
        self.config.validate()?;
        let transport = UdpTransport::bind(address).await?;
        self.serve(transport).await
    }

    /// Serve on an already bound transport until stopped.
    ///
    /// A token cancelled by an earlier `stop` is replaced, so each run
    /// starts fresh.
    pub async fn serve(&self, transport: UdpTransport) -> Result<()> {
        self.config.validate()?;
        let shutdown = {
            let mut token = self.shutdown.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let addr = transport.local_addr();
        *self.local_addr.lock() = Some(addr);
        let log = self.log.new(o!("address" => addr.to_string()));
        info!(log, "listening for fast requests"; "routes" => self.routes().join(","));

        let transport = Arc::new(transport);
        let mut inbound = transport.incoming();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&transport),
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            &log,
        ));
        let workers = Arc::new(Semaphore::new(self.config.max_concurrent_handlers));
        let mut purge = time::interval(self.config.dedup_window());
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = purge.tick() => {
                    let purged = dispatcher.purge_expired(Instant::now());
                    if purged > 0 {
                        debug!(log, "purged remembered requests"; "count" => purged);
                    }
                }
                item = inbound.next() => match item {
                    Some(Ok((peer, datagram))) => {
                        self.stats.received();
                        let msg = match FastMessage::parse(&datagram) {
                            Ok(msg) => msg,
                            Err(err) => {
                                self.stats.malformed();
                                warn!(log, "dropping malformed datagram";
                                    "peer" => %peer, "err" => %err);
                                continue;
                            }
                        };
                        let permit = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            permit = Arc::clone(&workers).acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            dispatcher.dispatch(msg, peer).await;
                            drop(permit);
                        });
                    }
                    Some(Err(FastError::Receive(err))) => {
                        error!(log, "failed to receive datagram"; "err" => %err);
                    }
                    Some(Err(err)) => {
                        error!(log, "inbound stream error"; "err" => %err);
                    }
                    None => break,
                },
            }
        }

        info!(log, "stopped listening"; "stats" => format!("{:?}", self.stats.snapshot()));
        *self.local_addr.lock() = None;
        Ok(())
    }
}
