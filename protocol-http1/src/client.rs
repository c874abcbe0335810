//! Client-side HTTP/1.1 connection: encodes requests, parses responses.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::headers::{HeaderMap, InlineName};
use crate::parser::{
    BodyFraming, HeadersDisposition, MessageKind, Parser, ParserCallbacks,
};
use crate::server::encode_header_block;
use crate::StreamEvent;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Client side of one upstream connection.
///
/// Requests are encoded with `encode_headers` / `encode_data` /
/// `encode_trailers`; response bytes are fed through `dispatch()` and come
/// back as [`StreamEvent`]s. A FIFO of pending responses tracks whether the
/// next response may carry a body (HEAD, 204, 304 cannot). A response with
/// no outstanding request is a protocol violation unless the stream was
/// reset.
pub struct ClientConnection {
    parser: Parser,
    inner: Inner,
}

struct Inner {
    events: VecDeque<StreamEvent>,
    out: BytesMut,
    pending: VecDeque<PendingResponse>,

    headers: Option<HeaderMap>,
    deferred_headers: Option<HeaderMap>,
    trailers: Option<HeaderMap>,
    status_code: u16,
    reset_called: bool,
    saw_close_header: bool,

    chunk_encoding: bool,
    head_request: bool,
}

struct PendingResponse {
    head_request: bool,
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConnection {
    pub fn new() -> ClientConnection {
        ClientConnection {
            parser: Parser::new(MessageKind::Response),
            inner: Inner {
                events: VecDeque::new(),
                out: BytesMut::new(),
                pending: VecDeque::new(),
                headers: None,
                deferred_headers: None,
                trailers: None,
                status_code: 0,
                reset_called: false,
                saw_close_header: false,
                chunk_encoding: false,
                head_request: false,
            },
        }
    }

    /// Consume response bytes, queueing stream events.
    pub fn dispatch(&mut self, data: &[u8]) -> Result<usize, CodecError> {
        if self.parser.paused() {
            self.parser.unpause();
        }
        self.parser.dispatch(data, &mut self.inner)
    }

    /// Signal that the peer closed the connection. Completes an
    /// until-close response body; errors if the peer quit mid-message.
    pub fn on_close(&mut self) -> Result<(), CodecError> {
        self.parser.finish(&mut self.inner)
    }

    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.inner.events.pop_front()
    }

    pub fn take_pending_send(&mut self) -> Bytes {
        self.inner.out.split().freeze()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.inner.out.is_empty()
    }

    /// Whether a response is still outstanding.
    pub fn response_pending(&self) -> bool {
        !self.inner.pending.is_empty()
    }

    /// Whether the last completed response carried `connection: close`.
    pub fn saw_close_header(&self) -> bool {
        self.inner.saw_close_header
    }

    /// Stop emitting events; subsequent responses are parsed and dropped.
    pub fn reset(&mut self) {
        self.inner.reset_called = true;
        self.inner.pending.clear();
        self.inner.events.clear();
    }

    /// Encode the request line and headers. Requires `:method` and
    /// `:path`; `:authority` egresses as `host` and other pseudo-names are
    /// dropped. Registers a pending response slot.
    pub fn encode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let method = headers
            .get_inline(InlineName::Method)
            .ok_or(CodecError::MissingRequiredHeader)?;
        let path = headers
            .get_inline(InlineName::Path)
            .ok_or(CodecError::MissingRequiredHeader)?;
        if headers.contains(InlineName::TransferEncoding) {
            return Err(CodecError::FramingConflict);
        }

        self.inner.head_request = method.eq_ignore_ascii_case("HEAD");

        let out = &mut self.inner.out;
        out.extend_from_slice(method.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        encode_header_block(out, headers);

        if headers.contains(InlineName::ContentLength) {
            self.inner.chunk_encoding = false;
        } else if end_stream {
            self.inner.chunk_encoding = false;
        } else {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            self.inner.chunk_encoding = true;
        }
        out.extend_from_slice(b"\r\n");

        self.inner.pending.push_back(PendingResponse {
            head_request: self.inner.head_request,
        });
        Ok(())
    }

    pub fn encode_data(&mut self, data: &[u8], end_stream: bool) {
        if !data.is_empty() {
            if self.inner.chunk_encoding {
                self.inner
                    .out
                    .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            }
            self.inner.out.extend_from_slice(data);
            if self.inner.chunk_encoding {
                self.inner.out.extend_from_slice(b"\r\n");
            }
        }
        if end_stream {
            self.end_encode(None);
        }
    }

    pub fn encode_trailers(&mut self, trailers: &HeaderMap) {
        self.end_encode(Some(trailers));
    }

    fn end_encode(&mut self, trailers: Option<&HeaderMap>) {
        if self.inner.chunk_encoding {
            match trailers {
                Some(trailers) if !trailers.is_empty() => {
                    self.inner.out.extend_from_slice(b"0\r\n");
                    encode_header_block(&mut self.inner.out, trailers);
                    self.inner.out.extend_from_slice(b"\r\n");
                }
                _ => self.inner.out.extend_from_slice(LAST_CHUNK),
            }
            self.inner.chunk_encoding = false;
        }
    }
}

impl Inner {
    fn emit(&mut self, event: StreamEvent) {
        if !self.reset_called && !self.pending.is_empty() {
            self.events.push_back(event);
        }
    }

    fn cannot_have_body(&self) -> bool {
        self.pending.front().is_some_and(|p| p.head_request)
            || self.status_code == 204
            || self.status_code == 304
    }
}

impl ParserCallbacks for Inner {
    fn on_message_begin(&mut self) {
        self.headers = Some(HeaderMap::new());
        self.deferred_headers = None;
        self.trailers = None;
        self.status_code = 0;
        self.saw_close_header = false;
    }

    fn on_request_line(&mut self, _m: &str, _u: &str, _minor: u8) -> Result<(), CodecError> {
        unreachable!("response parser")
    }

    fn on_status_line(&mut self, code: u16, _minor: u8) -> Result<(), CodecError> {
        self.status_code = code;
        Ok(())
    }

    fn on_header(&mut self, name: &str, value: &str) -> Result<(), CodecError> {
        if let Some(headers) = self.headers.as_mut() {
            headers.insert(name, value);
        }
        Ok(())
    }

    fn on_headers_complete(
        &mut self,
        framing: BodyFraming,
    ) -> Result<HeadersDisposition, CodecError> {
        if self.pending.is_empty() && !self.reset_called {
            return Err(CodecError::PrematureResponse);
        }

        let mut headers = self.headers.take().unwrap_or_default();
        headers.set_inline(InlineName::Status, self.status_code.to_string());

        if headers.get_inline(InlineName::Connection).is_some_and(|v| {
            v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
        }) {
            self.saw_close_header = true;
        }

        let skip_body = self.cannot_have_body();
        if skip_body || framing == BodyFraming::None {
            self.deferred_headers = Some(headers);
        } else {
            self.emit(StreamEvent::Headers {
                headers,
                end_stream: false,
            });
        }
        Ok(if skip_body {
            HeadersDisposition::SkipBody
        } else {
            HeadersDisposition::Normal
        })
    }

    fn on_body(&mut self, data: &[u8]) {
        let data = Bytes::copy_from_slice(data);
        self.emit(StreamEvent::Data {
            data,
            end_stream: false,
        });
    }

    fn on_trailer(&mut self, name: &str, value: &str) -> Result<(), CodecError> {
        self.trailers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value);
        Ok(())
    }

    fn on_message_complete(&mut self) {
        if let Some(headers) = self.deferred_headers.take() {
            self.emit(StreamEvent::Headers {
                headers,
                end_stream: true,
            });
        } else if let Some(trailers) = self.trailers.take() {
            self.emit(StreamEvent::Trailers { trailers });
        } else {
            self.emit(StreamEvent::Data {
                data: Bytes::new(),
                end_stream: true,
            });
        }
        self.pending.pop_front();
    }
}
