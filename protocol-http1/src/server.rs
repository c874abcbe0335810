//! Server-side HTTP/1.1 connection: parses requests, encodes responses.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::headers::{HeaderMap, InlineName};
use crate::parser::{
    BodyFraming, HeadersDisposition, MessageKind, Parser, ParserCallbacks,
};
use crate::{reason_phrase, Protocol, StreamEvent};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Server side of one downstream connection.
///
/// `dispatch()` consumes request bytes and queues [`StreamEvent`]s; the
/// encode methods serialize the response into the pending send buffer.
/// One request is admitted at a time: after a message completes, further
/// input is not consumed until the response has been fully encoded.
pub struct ServerConnection {
    parser: Parser,
    inner: Inner,
}

struct Inner {
    events: VecDeque<StreamEvent>,
    out: BytesMut,

    // Decode state for the in-flight request.
    headers: Option<HeaderMap>,
    deferred_headers: Option<HeaderMap>,
    trailers: Option<HeaderMap>,
    method: String,
    uri: String,
    protocol: Protocol,
    remote_complete: bool,
    reset_called: bool,
    should_close: bool,

    // Encode state for the in-flight response.
    started_response: bool,
    chunk_encoding: bool,
    response_complete: bool,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConnection {
    pub fn new() -> ServerConnection {
        ServerConnection {
            parser: Parser::new(MessageKind::Request),
            inner: Inner {
                events: VecDeque::new(),
                out: BytesMut::new(),
                headers: None,
                deferred_headers: None,
                trailers: None,
                method: String::new(),
                uri: String::new(),
                protocol: Protocol::Http11,
                remote_complete: false,
                reset_called: false,
                should_close: false,
                started_response: true, // nothing in flight yet
                chunk_encoding: false,
                response_complete: true,
            },
        }
    }

    /// Consume request bytes. Returns bytes consumed; unconsumed bytes must
    /// be re-offered after the current response completes. On a protocol
    /// error the inline 400 has already been queued (unless a response had
    /// begun) and the connection must be flushed then closed.
    pub fn dispatch(&mut self, data: &[u8]) -> Result<usize, CodecError> {
        if self.parser.paused() {
            if !self.inner.response_complete {
                return Ok(0);
            }
            self.parser.unpause();
        }
        match self.parser.dispatch(data, &mut self.inner) {
            Ok(n) => Ok(n),
            Err(e) => {
                if !self.inner.started_response {
                    self.inner.out.extend_from_slice(BAD_REQUEST_RESPONSE);
                }
                self.inner.should_close = true;
                Err(e)
            }
        }
    }

    /// Next queued stream event, if any.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.inner.events.pop_front()
    }

    /// All bytes waiting to be written to the socket.
    pub fn take_pending_send(&mut self) -> Bytes {
        self.inner.out.split().freeze()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.inner.out.is_empty()
    }

    /// Protocol tag of the request being served.
    pub fn active_protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Whether the request side of the current message is complete.
    pub fn request_complete(&self) -> bool {
        self.inner.remote_complete
    }

    /// Whether the current response has been fully encoded.
    pub fn response_complete(&self) -> bool {
        self.inner.response_complete
    }

    /// Whether the connection must close once pending output drains
    /// (`connection: close`, HTTP/1.0, protocol error, or an early reply).
    pub fn wants_close(&self) -> bool {
        self.inner.should_close
    }

    /// Stop emitting events for the in-flight request. The owner closes the
    /// connection afterwards.
    pub fn reset(&mut self) {
        self.inner.reset_called = true;
        self.inner.events.clear();
    }

    /// Encode the response status line and headers. Requires `:status`.
    /// Framing is inferred: explicit `content-length` means identity,
    /// `end_stream` means `content-length: 0`, otherwise chunked.
    pub fn encode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let status = headers
            .get_inline(InlineName::Status)
            .ok_or(CodecError::MissingStatus)?;
        let code: u16 = status.parse().map_err(|_| CodecError::MissingStatus)?;
        if headers.contains(InlineName::TransferEncoding) {
            return Err(CodecError::FramingConflict);
        }

        self.inner.started_response = true;
        self.inner.response_complete = false;
        let out = &mut self.inner.out;
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(code.to_string().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(reason_phrase(code).as_bytes());
        out.extend_from_slice(b"\r\n");

        encode_header_block(out, headers);

        if headers.contains(InlineName::ContentLength) {
            self.inner.chunk_encoding = false;
        } else if end_stream {
            out.extend_from_slice(b"content-length: 0\r\n");
            self.inner.chunk_encoding = false;
        } else {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            self.inner.chunk_encoding = true;
        }
        out.extend_from_slice(b"\r\n");

        if headers
            .get_inline(InlineName::Connection)
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            self.inner.should_close = true;
        }
        if end_stream {
            self.end_encode(None);
        }
        Ok(())
    }

    /// Encode response body bytes. A zero-length call with `end_stream`
    /// just terminates the message.
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

    /// Encode response trailers and terminate the message. Trailer fields
    /// only exist in chunked framing; with identity framing they are
    /// dropped.
    pub fn encode_trailers(&mut self, trailers: &HeaderMap) {
        self.end_encode(Some(trailers));
    }

    /// Write a preassembled response verbatim. Used for byte-literal error
    /// replies that must not allocate on the failure path. The bytes must
    /// be a complete, self-framed HTTP/1.1 response.
    pub fn encode_raw_response(&mut self, bytes: &[u8]) {
        self.inner.started_response = true;
        self.inner.chunk_encoding = false;
        self.inner.out.extend_from_slice(bytes);
        self.inner.response_complete = true;
        if !self.inner.remote_complete {
            self.inner.should_close = true;
        }
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
        }
        self.inner.response_complete = true;
        // Replying before the request finished: the only sane follow-up is
        // closing, since the parser cannot resync mid-body.
        if !self.inner.remote_complete {
            self.inner.should_close = true;
        }
    }
}

impl Inner {
    fn emit(&mut self, event: StreamEvent) {
        if !self.reset_called {
            self.events.push_back(event);
        }
    }
}

impl ParserCallbacks for Inner {
    fn on_message_begin(&mut self) {
        self.headers = Some(HeaderMap::new());
        self.deferred_headers = None;
        self.trailers = None;
        self.remote_complete = false;
        self.reset_called = false;
        self.started_response = false;
        self.response_complete = false;
        self.chunk_encoding = false;
    }

    fn on_request_line(&mut self, method: &str, uri: &str, minor: u8) -> Result<(), CodecError> {
        self.method = method.to_string();
        self.uri = uri.to_string();
        // Good enough for upper layers, which only care about 1.1 or not.
        self.protocol = if minor == 1 {
            Protocol::Http11
        } else {
            Protocol::Http10
        };
        Ok(())
    }

    fn on_status_line(&mut self, _code: u16, _minor: u8) -> Result<(), CodecError> {
        unreachable!("request parser")
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
        let mut headers = self.headers.take().unwrap_or_default();
        headers.set_inline(InlineName::Path, self.uri.clone());
        headers.set_inline(InlineName::Method, self.method.clone());
        if let Some(host) = headers.remove_inline(InlineName::Host) {
            headers.set_inline(InlineName::Authority, host);
        }

        // Reply to expect: 100-continue inline; upper layers would never say
        // anything else.
        if headers
            .get_inline(InlineName::Expect)
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
        {
            self.out.extend_from_slice(CONTINUE_RESPONSE);
            headers.remove_inline(InlineName::Expect);
        }

        if self.protocol == Protocol::Http10
            || headers.get_inline(InlineName::Connection).is_some_and(|v| {
                v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
            })
        {
            self.should_close = true;
        }

        match framing {
            // Defer header-only requests so they are emitted together with
            // end-of-stream at message complete; upper layers then never
            // see a dangling end_stream=false that would force chunked
            // framing on an empty body.
            BodyFraming::None => self.deferred_headers = Some(headers),
            _ => self.emit(StreamEvent::Headers {
                headers,
                end_stream: false,
            }),
        }
        Ok(HeadersDisposition::Normal)
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
        self.remote_complete = true;
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
    }
}

/// Write `name: value\r\n` lines: pseudo-names are dropped, with
/// `:authority` translated back to `host` first.
pub(crate) fn encode_header_block(out: &mut BytesMut, headers: &HeaderMap) {
    for entry in headers.iter() {
        let name = if entry.name() == ":authority" {
            "host"
        } else if entry.name().starts_with(':') {
            continue;
        } else {
            entry.name()
        };
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(entry.value().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(conn: &mut ServerConnection) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(e) = conn.poll_event() {
            events.push(e);
        }
        events
    }

    #[test]
    fn header_only_request_deferred_to_end_stream() {
        let mut conn = ServerConnection::new();
        let n = conn.dispatch(b"GET /x HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        assert_eq!(n, 28);
        let events = drain(&mut conn);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Headers { headers, end_stream } => {
                assert!(end_stream);
                assert_eq!(headers.get_inline(InlineName::Method), Some("GET"));
                assert_eq!(headers.get_inline(InlineName::Path), Some("/x"));
                assert_eq!(headers.get_inline(InlineName::Authority), Some("h"));
                assert_eq!(headers.get_inline(InlineName::Host), None);
            }
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn body_request_streams_data() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"POST /u HTTP/1.1\r\nhost: h\r\ncontent-length: 3\r\n\r\nabc")
            .unwrap();
        let events = drain(&mut conn);
        assert!(matches!(
            events[0],
            StreamEvent::Headers { end_stream: false, .. }
        ));
        assert!(
            matches!(&events[1], StreamEvent::Data { data, end_stream: false } if &data[..] == b"abc")
        );
        assert!(
            matches!(&events[2], StreamEvent::Data { data, end_stream: true } if data.is_empty())
        );
    }

    #[test]
    fn expect_100_continue_synthesized_and_stripped() {
        let mut conn = ServerConnection::new();
        conn.dispatch(
            b"POST /u HTTP/1.1\r\nhost: h\r\nexpect: 100-continue\r\ncontent-length: 1\r\n\r\nx",
        )
        .unwrap();
        assert_eq!(&conn.take_pending_send()[..], CONTINUE_RESPONSE);
        let events = drain(&mut conn);
        match &events[0] {
            StreamEvent::Headers { headers, .. } => {
                assert_eq!(headers.get_inline(InlineName::Expect), None)
            }
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn protocol_error_emits_400_and_close() {
        let mut conn = ServerConnection::new();
        assert!(conn.dispatch(b"NOT A REQUEST\r\n\r\n").is_err());
        assert_eq!(&conn.take_pending_send()[..], BAD_REQUEST_RESPONSE);
        assert!(conn.wants_close());
    }

    #[test]
    fn one_message_at_a_time() {
        let mut conn = ServerConnection::new();
        let input = b"GET /a HTTP/1.1\r\nhost: h\r\n\r\nGET /b HTTP/1.1\r\nhost: h\r\n\r\n";
        let n = conn.dispatch(input).unwrap();
        assert!(n < input.len());
        // Until the response completes, nothing more is consumed.
        assert_eq!(conn.dispatch(&input[n..]).unwrap(), 0);

        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        conn.encode_headers(&headers, true).unwrap();
        assert_eq!(conn.dispatch(&input[n..]).unwrap(), input.len() - n);
        let events = drain(&mut conn);
        assert_eq!(events.len(), 2); // headers for /a and /b
    }

    #[test]
    fn response_content_length_zero_on_end_stream_headers() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "204");
        conn.encode_headers(&headers, true).unwrap();
        assert_eq!(
            &conn.take_pending_send()[..],
            b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n".as_slice()
        );
        assert!(conn.response_complete());
    }

    #[test]
    fn chunked_response_framing() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        conn.encode_headers(&headers, false).unwrap();
        conn.encode_data(b"hello", false);
        conn.encode_data(b"", true);
        assert_eq!(
            &conn.take_pending_send()[..],
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                .as_slice()
        );
    }

    #[test]
    fn identity_framing_with_content_length() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        headers.set_inline(InlineName::ContentLength, "3");
        conn.encode_headers(&headers, false).unwrap();
        conn.encode_data(b"abc", true);
        assert_eq!(
            &conn.take_pending_send()[..],
            b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nabc".as_slice()
        );
    }

    #[test]
    fn transfer_encoding_on_egress_rejected() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        headers.set_inline(InlineName::TransferEncoding, "chunked");
        assert_eq!(
            conn.encode_headers(&headers, false),
            Err(CodecError::FramingConflict)
        );
    }

    #[test]
    fn pseudo_headers_never_hit_the_wire() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        headers.set_inline(InlineName::Scheme, "http");
        headers.insert("x-out", "1");
        conn.encode_headers(&headers, true).unwrap();
        let wire = conn.take_pending_send();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(!text.contains(":scheme"));
        assert!(!text.contains(":status"));
        assert!(text.contains("x-out: 1\r\n"));
    }

    #[test]
    fn http10_downgrade_and_close() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(conn.active_protocol(), Protocol::Http10);
        assert!(conn.wants_close());
    }

    #[test]
    fn trailers_written_in_chunked_framing() {
        let mut conn = ServerConnection::new();
        conn.dispatch(b"GET / HTTP/1.1\r\nhost: h\r\n\r\n").unwrap();
        let mut headers = HeaderMap::new();
        headers.set_inline(InlineName::Status, "200");
        conn.encode_headers(&headers, false).unwrap();
        conn.encode_data(b"ab", false);
        let mut trailers = HeaderMap::new();
        trailers.insert("x-sum", "2");
        conn.encode_trailers(&trailers);
        let wire = conn.take_pending_send();
        assert!(std::str::from_utf8(&wire)
            .unwrap()
            .ends_with("2\r\nab\r\n0\r\nx-sum: 2\r\n\r\n"));
    }
}
