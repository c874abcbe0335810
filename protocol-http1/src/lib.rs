//! protocol-http1 — sans-io HTTP/1.1 codec.
//!
//! Wire bytes in, stream events out. [`ServerConnection`] parses requests
//! and encodes responses; [`ClientConnection`] encodes requests and parses
//! responses. Neither touches a socket or a clock: feed received bytes via
//! `dispatch()`, drain [`StreamEvent`]s with `poll_event()`, and write out
//! whatever `take_pending_send()` returns.
//!
//! The parser consumes one message at a time and pauses itself at each
//! message end so the connection owner can apply backpressure before
//! admitting the next message.

mod client;
mod error;
mod headers;
mod parser;
mod server;

use bytes::Bytes;

pub use client::ClientConnection;
pub use error::CodecError;
pub use headers::{HeaderEntry, HeaderMap, InlineName};
pub use server::ServerConnection;

/// Protocol tag reported for a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

/// Stream events produced by a codec connection.
///
/// Per stream the order is: `Headers`, zero or more `Data`, then either a
/// final `Data { end_stream: true }` or `Trailers` (which implies end of
/// stream). A message with no body arrives as a single
/// `Headers { end_stream: true }`.
#[derive(Debug)]
pub enum StreamEvent {
    Headers {
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers {
        trailers: HeaderMap,
    },
}

/// Reason phrase for a status code, for response start lines.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
