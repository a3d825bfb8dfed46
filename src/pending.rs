// Copyright 2020 Joyent, Inc.

//! Client-side table of requests awaiting a Response.
//!
//! An entry moves `Sent -> Retried(n) -> ... -> Exhausted`, or leaves early
//! when a matching Response arrives (`Resolved`) or the client disconnects
//! (`Cancelled`). Whichever of those happens first removes the entry, so each
//! waiter is released exactly once and late or duplicate Responses find
//! nothing to match.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use slog::{debug, o, warn, Logger};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::FastConfig;
use crate::error::{FastError, Result};
use crate::protocol::{FastMessage, FastMessageKind};
use crate::transport::UdpTransport;

type ResultSlot = oneshot::Sender<Result<Bytes>>;

struct PendingEntry {
    route: String,
    peer: SocketAddr,
    datagram: Bytes,
    timeout: Duration,
    submitted: Instant,
    deadline: Instant,
    retries_remaining: u32,
    attempts: u32,
    slot: ResultSlot,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<u64, PendingEntry>,
    closed: bool,
}

/// A datagram the sweep wants sent again.
#[derive(Debug, Clone)]
pub struct Retransmit {
    pub id: u64,
    pub peer: SocketAddr,
    pub datagram: Bytes,
}

pub struct PendingTable {
    state: Mutex<TableState>,
    config: Arc<FastConfig>,
    log: Logger,
}

/// Removes an entry whose caller stopped waiting for it.
struct AbandonGuard<'a> {
    table: &'a PendingTable,
    id: u64,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.state.lock().entries.remove(&self.id);
        }
    }
}

impl PendingTable {
    pub fn new(config: Arc<FastConfig>, log: &Logger) -> PendingTable {
        PendingTable {
            state: Mutex::new(TableState::default()),
            config,
            log: log.new(o!("component" => "pending")),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an already-encoded Request and hand back the receiving half
    /// of its result slot.
    pub fn register(
        &self,
        id: u64,
        route: &str,
        peer: SocketAddr,
        datagram: Bytes,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(FastError::NotConnected);
        }
        if state.entries.contains_key(&id) {
            return Err(FastError::DuplicateCorrelationId(id));
        }
        if state.entries.len() >= self.config.max_pending_requests {
            return Err(FastError::TooManyPendingRequests(
                self.config.max_pending_requests,
            ));
        }

        let (slot, rx) = oneshot::channel();
        let now = Instant::now();
        state.entries.insert(
            id,
            PendingEntry {
                route: route.to_string(),
                peer,
                datagram,
                timeout,
                submitted: now,
                deadline: now + timeout,
                retries_remaining: self.config.max_retries,
                attempts: 1,
                slot,
            },
        );
        Ok(rx)
    }

    /// Send a Request and wait until it resolves, exhausts its retries or
    /// is cancelled.
    pub async fn submit(
        &self,
        transport: &UdpTransport,
        peer: SocketAddr,
        route: &str,
        payload: Bytes,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let datagram = FastMessage::request(id, route, payload)
            .to_datagram(self.config.max_datagram_size)?;
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        let rx = self.register(id, route, peer, datagram.clone(), timeout)?;
        let mut guard = AbandonGuard {
            table: self,
            id,
            armed: true,
        };

        debug!(self.log, "sending request"; "id" => id, "route" => route, "peer" => %peer);
        transport.send(peer, &datagram).await?;

        let result = rx.await;
        guard.armed = false;
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(FastError::Cancelled),
        }
    }

    /// Offer a message received from `from` to the table. Returns true if
    /// it resolved an outstanding entry; anything else is dropped. Only the
    /// peer a request was sent to can answer it.
    pub fn on_inbound(&self, msg: FastMessage, from: SocketAddr) -> bool {
        if msg.kind != FastMessageKind::Response {
            return false;
        }
        let entry = {
            let mut state = self.state.lock();
            let expected = state.entries.get(&msg.id).map(|entry| entry.peer);
            match expected {
                Some(expected) if expected != from => {
                    debug!(self.log, "dropping response from unexpected peer";
                        "id" => msg.id, "from" => %from, "expected" => %expected);
                    return false;
                }
                _ => state.entries.remove(&msg.id),
            }
        };
        match entry {
            Some(entry) => {
                debug!(self.log, "request resolved";
                    "id" => msg.id,
                    "route" => &entry.route,
                    "attempts" => entry.attempts,
                    "elapsed_ms" => entry.submitted.elapsed().as_millis() as u64);
                let _ = entry.slot.send(Ok(msg.payload));
                true
            }
            None => {
                debug!(self.log, "dropping unmatched response"; "id" => msg.id);
                false
            }
        }
    }

    /// Fail one entry, e.g. when its retransmission could not be sent.
    pub fn fail(&self, id: u64, err: FastError) -> bool {
        let entry = self.state.lock().entries.remove(&id);
        match entry {
            Some(entry) => {
                let _ = entry.slot.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Expire entries past their deadline.
    ///
    /// Entries with retries left get a new deadline and are returned for
    /// retransmission under the same correlation id; the rest fail with
    /// `RequestTimedOut`.
    pub fn sweep(&self, now: Instant) -> Vec<Retransmit> {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut state = self.state.lock();
            for (id, entry) in state.entries.iter_mut() {
                if entry.deadline > now {
                    continue;
                }
                if entry.retries_remaining > 0 {
                    entry.retries_remaining -= 1;
                    entry.attempts += 1;
                    entry.deadline = now + entry.timeout;
                    resend.push(Retransmit {
                        id: *id,
                        peer: entry.peer,
                        datagram: entry.datagram.clone(),
                    });
                } else {
                    exhausted.push(*id);
                }
            }
            for id in exhausted {
                if let Some(entry) = state.entries.remove(&id) {
                    warn!(self.log, "request timed out";
                        "id" => id, "route" => &entry.route, "attempts" => entry.attempts);
                    let _ = entry.slot.send(Err(FastError::RequestTimedOut {
                        id,
                        route: entry.route,
                        attempts: entry.attempts,
                    }));
                }
            }
        }
        for r in &resend {
            debug!(self.log, "retransmitting request"; "id" => r.id);
        }
        resend
    }

    /// Fail every outstanding entry with `Cancelled` and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Err(FastError::Cancelled));
        }
        if count > 0 {
            debug!(self.log, "cancelled pending requests"; "count" => count);
        }
        count
    }
}
