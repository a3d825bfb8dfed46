// Copyright 2020 Joyent, Inc.

//! Error types shared by the client, the server and the wire codec.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by Fast protocol operations.
///
/// The variants fall into four families: transport (`Bind`, `SendFailed`,
/// `Receive`), framing (`MalformedMessage`, `PayloadTooLarge`,
/// `RouteTooLong`), correlation (`DuplicateCorrelationId`, `RequestTimedOut`,
/// `Cancelled`, `TooManyPendingRequests`) and application (`Remote`).
#[derive(Error, Debug)]
pub enum FastError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send datagram to {peer}: {source}")]
    SendFailed {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("encoded message is {size} bytes, datagram limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("route is {0} bytes, maximum is 255")]
    RouteTooLong(usize),

    #[error("correlation id {0} is already outstanding")]
    DuplicateCorrelationId(u64),

    #[error("request {id} to {route} timed out after {attempts} attempts")]
    RequestTimedOut {
        id: u64,
        route: String,
        attempts: u32,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("too many pending requests (limit {0})")]
    TooManyPendingRequests(usize),

    #[error("client is not connected")]
    NotConnected,

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FastError>;

pub type BindError = FastError;
pub type ConnectError = FastError;
pub type RequestError = FastError;
pub type SendError = FastError;
pub type ListenError = FastError;

/// Error type handlers may return; anything implementing `std::error::Error`
/// converts into it with `?`.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Why the server could not produce a successful reply.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorCode {
    RouteNotFound,
    HandlerFailed,
}

/// Body of an error-tagged Response, as sent by the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub route: String,
    pub message: String,
}

impl RemoteError {
    pub fn route_not_found(route: &str) -> RemoteError {
        RemoteError {
            code: RemoteErrorCode::RouteNotFound,
            route: route.to_string(),
            message: format!("route not found: {}", route),
        }
    }

    pub fn handler_failed(route: &str, message: String) -> RemoteError {
        RemoteError {
            code: RemoteErrorCode::HandlerFailed,
            route: route.to_string(),
            message,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} on {}: {}", self.code, self.route, self.message)
    }
}
