// Copyright 2020 Joyent, Inc.

//! Types seen by route handlers, the middleware that wraps them, and the
//! status byte that prefixes every Response payload.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{info, o, warn, Logger};

use crate::error::{FastError, HandlerError, RemoteError, Result};
use crate::protocol::{FastMessage, FastMessageKind};

/// First payload byte of a Response produced by a successful handler.
pub const REPLY_OK: u8 = 0x0;
/// First payload byte of a Response carrying a `RemoteError` as JSON.
pub const REPLY_ERROR: u8 = 0x1;

/// Read-only view of one inbound message, built per invocation.
#[derive(Clone, Debug)]
pub struct Context {
    route: String,
    payload: Bytes,
    peer: SocketAddr,
    kind: FastMessageKind,
}

impl Context {
    pub fn new(msg: &FastMessage, peer: SocketAddr) -> Context {
        Context {
            route: msg.route.clone(),
            payload: msg.payload.clone(),
            peer,
            kind: msg.kind,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True when the sender does not expect a reply.
    pub fn is_fire(&self) -> bool {
        self.kind == FastMessageKind::Fire
    }

    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.to_vec())?)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// What a handler hands back to the dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    payload: Bytes,
}

impl Response {
    pub fn new(payload: Bytes) -> Response {
        Response { payload }
    }

    pub fn empty() -> Response {
        Response::default()
    }

    pub fn text(text: impl Into<String>) -> Response {
        Response {
            payload: Bytes::from(text.into()),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Response {
        Response {
            payload: Bytes::from(data.into()),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Response> {
        Ok(Response {
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

pub type HandlerResult = std::result::Result<Response, HandlerError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A route handler.
///
/// Implemented for every `Fn(Context) -> impl Future<Output = HandlerResult>`
/// closure; wrap synchronous closures in `SyncHandler`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: Context) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: Context) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

pub struct SyncHandler<F>(pub F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Context) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, ctx: Context) -> HandlerFuture {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

/// Wraps every handler invocation on a server.
///
/// A middleware either passes the context on with `next.run(ctx)` or
/// answers itself, in which case nothing later in the chain runs.
/// Implemented for every `Fn(Context, Next) -> impl Future<Output =
/// HandlerResult>` closure.
pub trait Middleware: Send + Sync + 'static {
    fn process(&self, ctx: Context, next: Next) -> HandlerFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn process(&self, ctx: Context, next: Next) -> HandlerFuture {
        Box::pin((self)(ctx, next))
    }
}

/// Ordered middleware stack, outermost first.
pub type MiddlewareChain = Arc<Vec<Arc<dyn Middleware>>>;

/// The rest of the chain after the current middleware, ending in the
/// route handler.
pub struct Next {
    chain: MiddlewareChain,
    position: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    pub fn new(chain: MiddlewareChain, handler: Arc<dyn Handler>) -> Next {
        Next {
            chain,
            position: 0,
            handler,
        }
    }

    pub fn run(self, ctx: Context) -> HandlerFuture {
        match self.chain.get(self.position) {
            Some(middleware) => {
                let middleware = Arc::clone(middleware);
                let next = Next {
                    chain: self.chain,
                    position: self.position + 1,
                    handler: self.handler,
                };
                middleware.process(ctx, next)
            }
            None => self.handler.handle(ctx),
        }
    }
}

/// Logs every invocation with its route, peer, outcome and duration.
pub struct LoggingMiddleware {
    log: Logger,
}

impl LoggingMiddleware {
    pub fn new(log: &Logger) -> LoggingMiddleware {
        LoggingMiddleware {
            log: log.new(o!("component" => "middleware")),
        }
    }
}

impl Middleware for LoggingMiddleware {
    fn process(&self, ctx: Context, next: Next) -> HandlerFuture {
        let log = self.log.new(o!(
            "route" => ctx.route().to_string(),
            "peer" => ctx.peer().to_string()
        ));
        Box::pin(async move {
            let started = Instant::now();
            let result = next.run(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(resp) => info!(log, "handled";
                    "bytes" => resp.payload().len(), "elapsed_ms" => elapsed_ms),
                Err(err) => warn!(log, "handler returned error";
                    "err" => %err, "elapsed_ms" => elapsed_ms),
            }
            result
        })
    }
}

/// Prefix a handler outcome with its status byte.
pub fn encode_reply(outcome: std::result::Result<Bytes, RemoteError>) -> Bytes {
    match outcome {
        Ok(body) => {
            let mut buf = BytesMut::with_capacity(body.len() + 1);
            buf.put_u8(REPLY_OK);
            buf.put_slice(&body);
            buf.freeze()
        }
        Err(err) => {
            let body = serde_json::to_vec(&err)
                .unwrap_or_else(|_| err.message.clone().into_bytes());
            let mut buf = BytesMut::with_capacity(body.len() + 1);
            buf.put_u8(REPLY_ERROR);
            buf.put_slice(&body);
            buf.freeze()
        }
    }
}

/// Strip the status byte from a Response payload.
pub fn decode_reply(payload: Bytes) -> Result<Bytes> {
    match payload.first() {
        Some(&REPLY_OK) => Ok(payload.slice(1..)),
        Some(&REPLY_ERROR) => {
            let err: RemoteError =
                serde_json::from_slice(&payload[1..]).map_err(|e| {
                    FastError::MalformedMessage(format!("bad error reply: {}", e))
                })?;
            Err(FastError::Remote(err))
        }
        Some(tag) => Err(FastError::MalformedMessage(format!(
            "unknown reply status {}",
            tag
        ))),
        None => Err(FastError::MalformedMessage(String::from(
            "empty reply payload",
        ))),
    }
}
