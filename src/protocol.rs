// Copyright 2020 Joyent, Inc.

//! Wire codec for Fast datagrams.
//!
//! Each datagram holds exactly one message; nothing is ever split across
//! datagrams, so the format needs no payload length field.

use std::str;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rand::Rng;

use crate::error::{FastError, Result};

const FP_OFF_KIND: usize = 0x0;
const FP_OFF_MSGID: usize = 0x1;
const FP_OFF_ROUTELEN: usize = 0x9;
const FP_OFF_ROUTE: usize = 0xa;

/// Fixed header: kind, correlation id and route length.
pub const FP_HEADER_SZ: usize = FP_OFF_ROUTE;

/// Longest route that fits the one byte length field.
pub const MAX_ROUTE_LEN: usize = u8::MAX as usize;

/// Largest UDP payload deliverable over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Correlation id carried by every Fire message.
pub const FIRE_MSGID: u64 = 0;

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastMessageKind {
    Request = 0,
    Response = 1,
    Fire = 2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastMessage {
    pub kind: FastMessageKind,
    pub id: u64,
    pub route: String,
    pub payload: Bytes,
}

impl FastMessage {
    pub fn request(id: u64, route: impl Into<String>, payload: Bytes) -> FastMessage {
        FastMessage {
            kind: FastMessageKind::Request,
            id,
            route: route.into(),
            payload,
        }
    }

    pub fn response(id: u64, route: impl Into<String>, payload: Bytes) -> FastMessage {
        FastMessage {
            kind: FastMessageKind::Response,
            id,
            route: route.into(),
            payload,
        }
    }

    pub fn fire(route: impl Into<String>, payload: Bytes) -> FastMessage {
        FastMessage {
            kind: FastMessageKind::Fire,
            id: FIRE_MSGID,
            route: route.into(),
            payload,
        }
    }

    /// Size of this message once framed.
    pub fn encoded_len(&self) -> usize {
        FP_HEADER_SZ + self.route.len() + self.payload.len()
    }

    /// Parse one datagram.
    ///
    /// Routes that no server knows about still parse; only the framing is
    /// checked here.
    pub fn parse(buf: &[u8]) -> Result<FastMessage> {
        FastMessage::check_buffer_size(buf)?;
        let kind = FastMessage::parse_kind(buf[FP_OFF_KIND])?;
        let id = match kind {
            FastMessageKind::Fire => FIRE_MSGID,
            _ => BigEndian::read_u64(&buf[FP_OFF_MSGID..FP_OFF_ROUTELEN]),
        };
        let route_len = buf[FP_OFF_ROUTELEN] as usize;
        let route = FastMessage::parse_route(&buf[FP_OFF_ROUTE..], route_len)?;
        let payload = Bytes::copy_from_slice(&buf[FP_OFF_ROUTE + route_len..]);

        Ok(FastMessage {
            kind,
            id,
            route,
            payload,
        })
    }

    fn check_buffer_size(buf: &[u8]) -> Result<()> {
        if buf.len() < FP_HEADER_SZ {
            let msg = format!(
                "not enough bytes for header: got {}, need {}",
                buf.len(),
                FP_HEADER_SZ
            );
            Err(FastError::MalformedMessage(msg))
        } else {
            Ok(())
        }
    }

    fn parse_kind(tag: u8) -> Result<FastMessageKind> {
        FromPrimitive::from_u8(tag).ok_or_else(|| {
            FastError::MalformedMessage(format!("unknown message kind {}", tag))
        })
    }

    fn parse_route(rest: &[u8], route_len: usize) -> Result<String> {
        if rest.len() < route_len {
            let msg = format!(
                "route length {} exceeds remaining {} bytes",
                route_len,
                rest.len()
            );
            return Err(FastError::MalformedMessage(msg));
        }
        str::from_utf8(&rest[..route_len])
            .map(String::from)
            .map_err(|_| {
                FastError::MalformedMessage(String::from("route is not valid UTF-8"))
            })
    }

    /// Append the framed message to `buf`, refusing anything larger than
    /// `limit` bytes.
    pub fn encode(&self, buf: &mut BytesMut, limit: usize) -> Result<()> {
        if self.route.len() > MAX_ROUTE_LEN {
            return Err(FastError::RouteTooLong(self.route.len()));
        }
        let size = self.encoded_len();
        if size > limit {
            return Err(FastError::PayloadTooLarge { size, limit });
        }
        let id = match self.kind {
            FastMessageKind::Fire => FIRE_MSGID,
            _ => self.id,
        };

        buf.reserve(size);
        buf.put_u8(self.kind as u8);
        buf.put_u64(id);
        buf.put_u8(self.route.len() as u8);
        buf.put_slice(self.route.as_bytes());
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh datagram.
    pub fn to_datagram(&self, limit: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf, limit)?;
        Ok(buf.freeze())
    }
}

/// Correlation id source for one client.
///
/// Ids start at a random point and increase with wrap-around; zero is
/// skipped because Fire messages use it. Uniqueness only matters among
/// requests outstanding at the same time, which the pending table enforces.
pub struct FastMessageId {
    next: AtomicU64,
}

impl FastMessageId {
    pub fn new() -> FastMessageId {
        FastMessageId::starting_at(rand::thread_rng().gen())
    }

    pub fn starting_at(start: u64) -> FastMessageId {
        FastMessageId {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != FIRE_MSGID {
                return id;
            }
        }
    }
}

impl Default for FastMessageId {
    fn default() -> Self {
        FastMessageId::new()
    }
}
