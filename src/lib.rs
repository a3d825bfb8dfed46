// Copyright 2020 Joyent, Inc.

//! Fast: routed request/response RPC over UDP
//!
//! A server registers handlers under route names; a client sends a request
//! to a route and waits for the correlated response, or fires a message that
//! expects no reply. Payloads are opaque bytes (text, JSON or binary are the
//! application's business).
//!
//! Protocol definition
//!
//! Every Fast message travels in exactly one datagram:
//!
//! ```text
//! +------+----------------+-----------+-------------+-----------------+
//! | KIND | CORRELATION ID | ROUTE LEN | ROUTE       | PAYLOAD         |
//! | 1    | 8              | 1         | 0..=255     | rest of datagram|
//! +------+----------------+-----------+-------------+-----------------+
//! ```
//!
//! * KIND            1-byte integer:
//!
//!     * REQUEST  0x0  the sender waits for a Response with the same id
//!
//!     * RESPONSE 0x1  the reply to a Request
//!
//!     * FIRE     0x2  fire-and-forget, no reply is ever sent
//!
//! * CORRELATION ID  8-byte big-endian unsigned integer chosen by the client,
//!                   unique among its outstanding requests.  Always 0 for
//!                   FIRE messages.
//!
//! * ROUTE LEN       1-byte length of the UTF-8 route that follows.
//!
//! * PAYLOAD         Everything after the route.  A Response payload starts
//!                   with a status byte: 0x0 followed by the handler's bytes,
//!                   or 0x1 followed by a JSON error document.
//!
//! Datagrams can be lost, duplicated or reordered.  The client retransmits a
//! Request under the same correlation id until it sees a Response or runs
//! out of retries; the server remembers recently answered ids and replays
//! the stored Response rather than running the handler twice.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use client::Client;
pub use config::FastConfig;
pub use error::{FastError, HandlerError, RemoteError, RemoteErrorCode, Result};
pub use handler::{Context, Handler, LoggingMiddleware, Middleware, Next, Response};
pub use protocol::{FastMessage, FastMessageKind};
pub use registry::StatsSnapshot;
pub use server::Server;
