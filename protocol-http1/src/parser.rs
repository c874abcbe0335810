//! Incremental HTTP/1.1 message parser.
//!
//! [`Parser`] consumes as many complete protocol elements as the input
//! holds and invokes [`ParserCallbacks`] for each: start line, header
//! lines, body slices, trailers, message complete. It never buffers
//! message payload itself; partial lines stay in the caller's receive
//! buffer and are re-offered on the next call.
//!
//! The parser pauses itself at every message end so the connection owner
//! can process one message at a time and apply backpressure; leftover
//! bytes are consumed on a later call after [`Parser::unpause`].

use crate::error::CodecError;

/// Total header block size limit (start line + headers).
const MAX_HEADERS_SIZE: usize = 80 * 1024;
/// Chunk-size lines are tiny; anything longer is garbage.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Whether this parser reads requests or responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Request,
    Response,
}

/// Body framing inferred from the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body follows the headers.
    None,
    /// Identity framing with a known length.
    ContentLength(u64),
    /// `transfer-encoding: chunked`.
    Chunked,
    /// Response without explicit framing: body runs until connection close.
    UntilClose,
}

/// Returned from [`ParserCallbacks::on_headers_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeadersDisposition {
    /// Follow the inferred framing.
    Normal,
    /// This message cannot have a body regardless of framing headers
    /// (HEAD responses, 204, 304).
    SkipBody,
}

pub(crate) trait ParserCallbacks {
    fn on_message_begin(&mut self);
    fn on_request_line(&mut self, method: &str, uri: &str, minor: u8) -> Result<(), CodecError>;
    fn on_status_line(&mut self, code: u16, minor: u8) -> Result<(), CodecError>;
    fn on_header(&mut self, name: &str, value: &str) -> Result<(), CodecError>;
    fn on_headers_complete(
        &mut self,
        framing: BodyFraming,
    ) -> Result<HeadersDisposition, CodecError>;
    fn on_body(&mut self, data: &[u8]);
    fn on_trailer(&mut self, name: &str, value: &str) -> Result<(), CodecError>;
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between messages; leading CRLFs are tolerated.
    Idle,
    StartLine,
    Headers,
    Body { remaining: u64 },
    UntilClose,
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataCrlf,
    Trailers,
    /// Message complete; paused until [`Parser::unpause`].
    Done,
}

pub(crate) struct Parser {
    kind: MessageKind,
    state: State,
    header_bytes: usize,
    content_length: Option<u64>,
    chunked: bool,
}

impl Parser {
    pub(crate) fn new(kind: MessageKind) -> Parser {
        Parser {
            kind,
            state: State::Idle,
            header_bytes: 0,
            content_length: None,
            chunked: false,
        }
    }

    /// Whether the parser is paused at a message boundary.
    pub(crate) fn paused(&self) -> bool {
        self.state == State::Done
    }

    /// Leave the paused state and prepare for the next message.
    pub(crate) fn unpause(&mut self) {
        if self.state == State::Done {
            self.state = State::Idle;
            self.header_bytes = 0;
            self.content_length = None;
            self.chunked = false;
        }
    }

    /// Signal connection close. Completes an until-close body; errors if
    /// the peer quit mid-message.
    pub(crate) fn finish(&mut self, cb: &mut impl ParserCallbacks) -> Result<(), CodecError> {
        match self.state {
            State::Idle | State::Done => Ok(()),
            State::UntilClose => {
                self.state = State::Done;
                cb.on_message_complete();
                Ok(())
            }
            _ => Err(CodecError::PartialMessage),
        }
    }

    /// Consume as many complete elements from `data` as possible, invoking
    /// callbacks. Returns the number of bytes consumed. Stops early when
    /// paused at a message end.
    pub(crate) fn dispatch(
        &mut self,
        data: &[u8],
        cb: &mut impl ParserCallbacks,
    ) -> Result<usize, CodecError> {
        let mut off = 0;
        loop {
            let rest = &data[off..];
            match self.state {
                State::Done => break,
                State::Idle => {
                    // Skip CRLF between messages.
                    let skip = rest
                        .iter()
                        .take_while(|&&b| b == b'\r' || b == b'\n')
                        .count();
                    off += skip;
                    if off == data.len() {
                        break;
                    }
                    cb.on_message_begin();
                    self.state = State::StartLine;
                }
                State::StartLine => {
                    match take_line(rest, MAX_HEADERS_SIZE, CodecError::InvalidStartLine)? {
                        None => break,
                        Some((line, n)) => {
                            off += n;
                            self.header_bytes += n;
                            self.parse_start_line(line, cb)?;
                            self.state = State::Headers;
                        }
                    }
                }
                State::Headers => {
                    let budget = MAX_HEADERS_SIZE.saturating_sub(self.header_bytes);
                    match take_line(rest, budget, CodecError::HeadersTooLarge)? {
                        None => break,
                        Some((line, n)) => {
                            off += n;
                            self.header_bytes += n;
                            if line.is_empty() {
                                self.finish_headers(cb)?;
                            } else {
                                let (name, value) = parse_header_line(line)?;
                                self.note_framing_header(name, value)?;
                                cb.on_header(name, value)?;
                            }
                        }
                    }
                }
                State::Body { remaining } => {
                    if rest.is_empty() {
                        break;
                    }
                    let take = rest.len().min(remaining as usize);
                    cb.on_body(&rest[..take]);
                    off += take;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = State::Done;
                        cb.on_message_complete();
                    } else {
                        self.state = State::Body { remaining };
                        break;
                    }
                }
                State::UntilClose => {
                    if rest.is_empty() {
                        break;
                    }
                    cb.on_body(rest);
                    off = data.len();
                    break;
                }
                State::ChunkSize => {
                    match take_line(rest, MAX_CHUNK_SIZE_LINE, CodecError::InvalidChunkSize)? {
                        None => break,
                        Some((line, n)) => {
                            off += n;
                            let size = parse_chunk_size(line)?;
                            self.state = if size == 0 {
                                State::Trailers
                            } else {
                                State::ChunkData { remaining: size }
                            };
                        }
                    }
                }
                State::ChunkData { remaining } => {
                    if rest.is_empty() {
                        break;
                    }
                    let take = rest.len().min(remaining as usize);
                    cb.on_body(&rest[..take]);
                    off += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataCrlf
                    } else {
                        State::ChunkData { remaining }
                    };
                    if remaining != 0 {
                        break;
                    }
                }
                State::ChunkDataCrlf => {
                    if rest.len() < 2 {
                        break;
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunkSize);
                    }
                    off += 2;
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let budget = MAX_HEADERS_SIZE.saturating_sub(self.header_bytes);
                    match take_line(rest, budget, CodecError::HeadersTooLarge)? {
                        None => break,
                        Some((line, n)) => {
                            off += n;
                            self.header_bytes += n;
                            if line.is_empty() {
                                self.state = State::Done;
                                cb.on_message_complete();
                            } else {
                                let (name, value) = parse_header_line(line)?;
                                cb.on_trailer(name, value)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(off)
    }

    fn parse_start_line(
        &mut self,
        line: &[u8],
        cb: &mut impl ParserCallbacks,
    ) -> Result<(), CodecError> {
        let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidStartLine)?;
        match self.kind {
            MessageKind::Request => {
                let mut parts = line.splitn(3, ' ');
                let method = parts.next().ok_or(CodecError::InvalidStartLine)?;
                let uri = parts.next().ok_or(CodecError::InvalidStartLine)?;
                let version = parts.next().ok_or(CodecError::InvalidStartLine)?;
                if method.is_empty() || !method.bytes().all(is_token_byte) || uri.is_empty() {
                    return Err(CodecError::InvalidStartLine);
                }
                cb.on_request_line(method, uri, parse_version(version)?)
            }
            MessageKind::Response => {
                let mut parts = line.splitn(3, ' ');
                let version = parts.next().ok_or(CodecError::InvalidStartLine)?;
                let code = parts.next().ok_or(CodecError::InvalidStartLine)?;
                let minor = parse_version(version)?;
                if code.len() != 3 {
                    return Err(CodecError::InvalidStartLine);
                }
                let code: u16 = code.parse().map_err(|_| CodecError::InvalidStartLine)?;
                cb.on_status_line(code, minor)
            }
        }
    }

    fn note_framing_header(&mut self, name: &str, value: &str) -> Result<(), CodecError> {
        if name == "content-length" {
            if self.content_length.is_some() {
                return Err(CodecError::InvalidContentLength);
            }
            let n: u64 = value
                .parse()
                .map_err(|_| CodecError::InvalidContentLength)?;
            self.content_length = Some(n);
        } else if name == "transfer-encoding"
            && value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            self.chunked = true;
        }
        Ok(())
    }

    fn finish_headers(&mut self, cb: &mut impl ParserCallbacks) -> Result<(), CodecError> {
        let framing = if self.chunked {
            BodyFraming::Chunked
        } else {
            match (self.content_length, self.kind) {
                (Some(0) | None, MessageKind::Request) => BodyFraming::None,
                (Some(0), MessageKind::Response) => BodyFraming::None,
                (Some(n), _) => BodyFraming::ContentLength(n),
                (None, MessageKind::Response) => BodyFraming::UntilClose,
            }
        };

        let disposition = cb.on_headers_complete(framing)?;
        let framing = match disposition {
            HeadersDisposition::SkipBody => BodyFraming::None,
            HeadersDisposition::Normal => framing,
        };

        match framing {
            BodyFraming::None => {
                self.state = State::Done;
                cb.on_message_complete();
            }
            BodyFraming::ContentLength(n) => self.state = State::Body { remaining: n },
            BodyFraming::Chunked => self.state = State::ChunkSize,
            BodyFraming::UntilClose => self.state = State::UntilClose,
        }
        Ok(())
    }
}

/// Find the next CRLF-terminated line. Returns (line-without-CRLF, bytes
/// consumed), or None if no full line is buffered yet. `err` is returned
/// when the line is malformed or exceeds `limit`.
fn take_line(data: &[u8], limit: usize, err: CodecError) -> Result<Option<(&[u8], usize)>, CodecError> {
    match data.iter().position(|&b| b == b'\n') {
        Some(0) => Err(err),
        Some(i) => {
            if data[i - 1] != b'\r' {
                return Err(err);
            }
            if i + 1 > limit {
                return Err(err);
            }
            Ok(Some((&data[..i - 1], i + 1)))
        }
        None => {
            if data.len() > limit {
                return Err(err);
            }
            Ok(None)
        }
    }
}

fn parse_version(version: &str) -> Result<u8, CodecError> {
    let minor = version
        .strip_prefix("HTTP/1.")
        .ok_or(CodecError::InvalidStartLine)?;
    minor.parse().map_err(|_| CodecError::InvalidStartLine)
}

fn parse_header_line(line: &[u8]) -> Result<(&str, &str), CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidHeader)?;
    let (name, value) = line.split_once(':').ok_or(CodecError::InvalidHeader)?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(CodecError::InvalidHeader);
    }
    let value = value.trim_matches([' ', '\t']);
    if value.bytes().any(|b| b < 0x20 && b != b'\t') {
        return Err(CodecError::InvalidHeader);
    }
    Ok((name, value))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidChunkSize)?;
    // Chunk extensions (";key=value") are tolerated and ignored.
    let hex = line.split(';').next().unwrap_or("").trim();
    if hex.is_empty() || hex.len() > 16 {
        return Err(CodecError::InvalidChunkSize);
    }
    u64::from_str_radix(hex, 16).map_err(|_| CodecError::InvalidChunkSize)
}

/// RFC 7230 tchar.
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' |
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        begins: usize,
        request_line: Option<(String, String, u8)>,
        status: Option<u16>,
        headers: Vec<(String, String)>,
        trailers: Vec<(String, String)>,
        body: Vec<u8>,
        framing: Option<BodyFraming>,
        completes: usize,
        skip_body: bool,
    }

    impl ParserCallbacks for Recorder {
        fn on_message_begin(&mut self) {
            self.begins += 1;
        }
        fn on_request_line(&mut self, m: &str, u: &str, minor: u8) -> Result<(), CodecError> {
            self.request_line = Some((m.into(), u.into(), minor));
            Ok(())
        }
        fn on_status_line(&mut self, code: u16, _minor: u8) -> Result<(), CodecError> {
            self.status = Some(code);
            Ok(())
        }
        fn on_header(&mut self, n: &str, v: &str) -> Result<(), CodecError> {
            self.headers.push((n.into(), v.into()));
            Ok(())
        }
        fn on_headers_complete(
            &mut self,
            framing: BodyFraming,
        ) -> Result<HeadersDisposition, CodecError> {
            self.framing = Some(framing);
            Ok(if self.skip_body {
                HeadersDisposition::SkipBody
            } else {
                HeadersDisposition::Normal
            })
        }
        fn on_body(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn on_trailer(&mut self, n: &str, v: &str) -> Result<(), CodecError> {
            self.trailers.push((n.into(), v.into()));
            Ok(())
        }
        fn on_message_complete(&mut self) {
            self.completes += 1;
        }
    }

    #[test]
    fn get_without_body() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        let input = b"GET /x HTTP/1.1\r\nhost: h\r\n\r\n";
        let n = p.dispatch(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(r.request_line, Some(("GET".into(), "/x".into(), 1)));
        assert_eq!(r.headers, vec![("host".into(), "h".into())]);
        assert_eq!(r.framing, Some(BodyFraming::None));
        assert_eq!(r.completes, 1);
        assert!(p.paused());
    }

    #[test]
    fn content_length_body_split_across_feeds() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        let input = b"POST /u HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
        // Feed one byte at a time to exercise every boundary.
        let mut consumed = 0;
        for end in 1..=input.len() {
            consumed += p.dispatch(&input[consumed..end], &mut r).unwrap();
        }
        assert_eq!(consumed, input.len());
        assert_eq!(r.framing, Some(BodyFraming::ContentLength(5)));
        assert_eq!(r.body, b"hello");
        assert_eq!(r.completes, 1);
    }

    #[test]
    fn chunked_body_with_trailers() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        let input = b"POST /u HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n3;ext=1\r\nabc\r\n0\r\nx-sum: 8\r\n\r\n";
        let n = p.dispatch(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(r.framing, Some(BodyFraming::Chunked));
        assert_eq!(r.body, b"helloabc");
        assert_eq!(r.trailers, vec![("x-sum".into(), "8".into())]);
        assert_eq!(r.completes, 1);
    }

    #[test]
    fn pauses_between_pipelined_messages() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let n = p.dispatch(input, &mut r).unwrap();
        assert_eq!(r.completes, 1);
        assert!(p.paused());
        p.unpause();
        let n2 = p.dispatch(&input[n..], &mut r).unwrap();
        assert_eq!(n + n2, input.len());
        assert_eq!(r.completes, 2);
        assert_eq!(r.request_line.as_ref().unwrap().1, "/b");
    }

    #[test]
    fn response_until_close() {
        let mut p = Parser::new(MessageKind::Response);
        let mut r = Recorder::default();
        p.dispatch(b"HTTP/1.1 200 OK\r\n\r\nsome bo", &mut r).unwrap();
        p.dispatch(b"dy", &mut r).unwrap();
        assert_eq!(r.framing, Some(BodyFraming::UntilClose));
        assert_eq!(r.completes, 0);
        p.finish(&mut r).unwrap();
        assert_eq!(r.body, b"some body");
        assert_eq!(r.completes, 1);
    }

    #[test]
    fn skip_body_ignores_content_length() {
        let mut p = Parser::new(MessageKind::Response);
        let mut r = Recorder {
            skip_body: true,
            ..Default::default()
        };
        let input = b"HTTP/1.1 304 Not Modified\r\ncontent-length: 10\r\n\r\n";
        let n = p.dispatch(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(r.completes, 1);
        assert!(r.body.is_empty());
    }

    #[test]
    fn close_mid_message_is_partial() {
        let mut p = Parser::new(MessageKind::Response);
        let mut r = Recorder::default();
        p.dispatch(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nab", &mut r)
            .unwrap();
        assert_eq!(p.finish(&mut r), Err(CodecError::PartialMessage));
    }

    #[test]
    fn bad_start_line_rejected() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        assert!(p.dispatch(b"GARBAGE\r\n\r\n", &mut r).is_err());
    }

    #[test]
    fn duplicate_content_length_rejected() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        let input = b"POST / HTTP/1.1\r\ncontent-length: 2\r\ncontent-length: 3\r\n\r\n";
        assert_eq!(
            p.dispatch(input, &mut r),
            Err(CodecError::InvalidContentLength)
        );
    }

    #[test]
    fn http10_version_reported() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        p.dispatch(b"GET / HTTP/1.0\r\n\r\n", &mut r).unwrap();
        assert_eq!(r.request_line, Some(("GET".into(), "/".into(), 0)));
    }

    #[test]
    fn bare_lf_rejected() {
        let mut p = Parser::new(MessageKind::Request);
        let mut r = Recorder::default();
        assert!(p.dispatch(b"GET / HTTP/1.1\nhost: h\r\n\r\n", &mut r).is_err());
    }
}
