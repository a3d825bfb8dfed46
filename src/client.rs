// Copyright 2020 Joyent, Inc.

//! Fast client: request/response and fire-and-forget calls to one server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::FastConfig;
use crate::error::{FastError, Result};
use crate::handler::decode_reply;
use crate::pending::PendingTable;
use crate::protocol::{FastMessage, FastMessageId};
use crate::transport::{resolve, Inbound, UdpTransport};

/// State that exists only between `connect` and `disconnect`.
struct Connection {
    transport: Arc<UdpTransport>,
    server_addr: SocketAddr,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    fn close(&self) -> usize {
        let cancelled = self.pending.cancel_all();
        self.shutdown.cancel();
        cancelled
    }
}

/// Client for one Fast server.
///
/// There is no handshake: `connect` binds a local socket and starts the
/// background receive and retry tasks, and `disconnect` fails whatever is
/// still outstanding with `Cancelled` and releases the socket.
pub struct Client {
    server: String,
    config: Arc<FastConfig>,
    ids: FastMessageId,
    conn: RwLock<Option<Arc<Connection>>>,
    log: Logger,
}

impl Client {
    pub fn new(server: impl Into<String>, config: FastConfig, log: Option<&Logger>) -> Client {
        let server = server.into();
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        Client {
            log: log.new(o!("server" => server.clone())),
            server,
            config: Arc::new(config),
            ids: FastMessageId::new(),
            conn: RwLock::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.read().as_ref().map(|c| c.transport.local_addr())
    }

    /// Requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.conn.read().as_ref().map_or(0, |c| c.pending.len())
    }

    /// Bind the local endpoint. Connecting an already connected client is a
    /// no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.config.validate()?;
        let server_addr = resolve(&self.server).await?;
        let transport = Arc::new(UdpTransport::bind(&self.config.bind_address).await?);
        let pending = Arc::new(PendingTable::new(Arc::clone(&self.config), &self.log));
        let shutdown = CancellationToken::new();

        let receiver = tokio::spawn(receive_loop(
            transport.incoming(),
            Arc::clone(&pending),
            shutdown.clone(),
            self.log.clone(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&transport),
            Arc::clone(&pending),
            self.config.sweep_interval(),
            shutdown.clone(),
            self.log.clone(),
        ));

        let conn = Arc::new(Connection {
            transport,
            server_addr,
            pending,
            shutdown,
            tasks: Mutex::new(vec![receiver, sweeper]),
        });
        let local = conn.transport.local_addr();

        let mut slot = self.conn.write();
        if slot.is_some() {
            // Lost a race with a concurrent connect.
            conn.close();
            return Ok(());
        }
        *slot = Some(conn);
        info!(self.log, "connected"; "local" => %local, "peer" => %server_addr);
        Ok(())
    }

    /// Cancel every outstanding request and release the local endpoint.
    pub async fn disconnect(&self) {
        let conn = self.conn.write().take();
        if let Some(conn) = conn {
            let cancelled = conn.close();
            let tasks: Vec<JoinHandle<()>> = conn.tasks.lock().drain(..).collect();
            for task in tasks {
                let _ = task.await;
            }
            info!(self.log, "disconnected"; "cancelled" => cancelled);
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.conn.read().as_ref().cloned().ok_or(FastError::NotConnected)
    }

    /// Send a Request and wait for the handler's reply.
    pub async fn request(&self, route: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.request_with_timeout(route, payload, None).await
    }

    /// Like `request`, overriding the per-attempt timeout.
    pub async fn request_with_timeout(
        &self,
        route: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let conn = self.connection()?;
        let id = self.ids.next_id();
        let reply = conn
            .pending
            .submit(
                &conn.transport,
                conn.server_addr,
                route,
                payload.into(),
                id,
                timeout,
            )
            .await?;
        decode_reply(reply)
    }

    pub async fn request_text(&self, route: &str, text: &str) -> Result<String> {
        let reply = self.request(route, Bytes::copy_from_slice(text.as_bytes())).await?;
        Ok(String::from_utf8(reply.to_vec())?)
    }

    pub async fn request_json<T, R>(&self, route: &str, value: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(value)?;
        let reply = self.request(route, payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Fire-and-forget. Succeeds once the datagram is handed to the socket.
    pub async fn send(&self, route: &str, payload: impl Into<Bytes>) -> Result<()> {
        let conn = self.connection()?;
        let datagram = FastMessage::fire(route, payload.into())
            .to_datagram(self.config.max_datagram_size)?;
        debug!(self.log, "sending fire"; "route" => route);
        conn.transport.send(conn.server_addr, &datagram).await
    }

    pub async fn send_json<T: Serialize>(&self, route: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(route, payload).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            conn.close();
        }
    }
}

async fn receive_loop(
    mut inbound: Inbound,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
    log: Logger,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            item = inbound.next() => match item {
                Some(Ok((peer, datagram))) => match FastMessage::parse(&datagram) {
                    Ok(msg) => {
                        pending.on_inbound(msg, peer);
                    }
                    Err(err) => {
                        warn!(log, "dropping malformed datagram"; "peer" => %peer, "err" => %err);
                    }
                },
                Some(Err(err)) => {
                    warn!(log, "receive failed"; "err" => %err);
                }
                None => break,
            },
        }
    }
}

async fn sweep_loop(
    transport: Arc<UdpTransport>,
    pending: Arc<PendingTable>,
    period: Duration,
    shutdown: CancellationToken,
    log: Logger,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                for resend in pending.sweep(Instant::now()) {
                    if let Err(err) = transport.send(resend.peer, &resend.datagram).await {
                        warn!(log, "retransmission failed"; "id" => resend.id, "err" => %err);
                        pending.fail(resend.id, err);
                    }
                }
            }
        }
    }
}
