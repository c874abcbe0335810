//! Stream filter pipeline.
//!
//! Two ordered chains per stream: decoder filters walk the request path in
//! insertion order, encoder filters walk the response path in reverse.
//! A filter returning stop-iteration halts the walk; the chain buffers
//! whatever arrives meanwhile and re-enters the stopped filter when the
//! owner calls `continue_decoding` / `continue_encoding`. Events that
//! clear the whole chain are queued as [`ChainOutput`] for the terminal
//! stage (the router on the decode side, the downstream codec on the
//! encode side).
//!
//! Filters record no resume closures; the chain stores the stopped index
//! explicitly and re-enters from there.

use protocol_http1::HeaderMap;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    Continue,
    StopIteration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    /// Halt and accumulate this and subsequent data in the chain's buffer.
    StopIterationAndBuffer,
    /// Halt without buffering; the filter took responsibility for the data.
    StopIterationNoBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

/// A stream filter. Combined decoder/encoder filters implement both sides
/// and occupy one slot in each chain.
pub trait StreamFilter: Send {
    fn on_request_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn on_request_data(&mut self, _data: &mut Buffer, _end_stream: bool) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn on_request_trailers(&mut self, _trailers: &mut HeaderMap) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }

    fn on_response_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn on_response_data(&mut self, _data: &mut Buffer, _end_stream: bool) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn on_response_trailers(&mut self, _trailers: &mut HeaderMap) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }

    /// The stream is being torn down.
    fn on_reset(&mut self) {}
}

/// Open-extension filter built from a function-object triple plus opaque
/// state, for behavior that does not warrant a named type.
pub struct FnFilter<S> {
    pub state: S,
    pub on_headers: Box<dyn FnMut(&mut S, &mut HeaderMap, bool) -> FilterHeadersStatus + Send>,
    pub on_data: Box<dyn FnMut(&mut S, &mut Buffer, bool) -> FilterDataStatus + Send>,
    pub on_trailers: Box<dyn FnMut(&mut S, &mut HeaderMap) -> FilterTrailersStatus + Send>,
}

impl<S: Send> StreamFilter for FnFilter<S> {
    fn on_request_headers(
        &mut self,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        (self.on_headers)(&mut self.state, headers, end_stream)
    }

    fn on_request_data(&mut self, data: &mut Buffer, end_stream: bool) -> FilterDataStatus {
        (self.on_data)(&mut self.state, data, end_stream)
    }

    fn on_request_trailers(&mut self, trailers: &mut HeaderMap) -> FilterTrailersStatus {
        (self.on_trailers)(&mut self.state, trailers)
    }
}

/// Event that cleared the chain, bound for the terminal stage.
#[derive(Debug)]
pub enum ChainOutput {
    Headers { headers: HeaderMap, end_stream: bool },
    Data { data: Buffer, end_stream: bool },
    Trailers { trailers: HeaderMap },
}

#[derive(Default)]
struct DirectionState {
    /// Filter index the walk stopped at, if any.
    stopped_at: Option<usize>,
    /// Whether the stopped filter asked for buffering.
    buffering: bool,
    /// Body accumulated while stopped with buffering.
    buffer: Buffer,
    headers: Option<(HeaderMap, bool)>,
    trailers: Option<HeaderMap>,
    end_stream: bool,
}

/// The per-stream filter chain.
pub struct FilterChain {
    filters: Vec<Box<dyn StreamFilter>>,
    decode: DirectionState,
    encode: DirectionState,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn StreamFilter>>) -> FilterChain {
        FilterChain {
            filters,
            decode: DirectionState::default(),
            encode: DirectionState::default(),
        }
    }

    /// Read-only view of the decode buffering state, exposed to a stopped
    /// filter and to the terminal stage before resumption.
    pub fn decoding_buffer(&self) -> &Buffer {
        &self.decode.buffer
    }

    pub fn decode_headers(
        &mut self,
        mut headers: HeaderMap,
        end_stream: bool,
        out: &mut Vec<ChainOutput>,
    ) {
        self.decode.end_stream = end_stream;
        let stopped = walk_headers(&mut self.filters, Direction::Decode, 0, &mut headers, end_stream);
        match stopped {
            None => out.push(ChainOutput::Headers { headers, end_stream }),
            Some(idx) => {
                self.decode.stopped_at = Some(idx + 1);
                self.decode.headers = Some((headers, end_stream));
            }
        }
    }

    pub fn decode_data(&mut self, data: Buffer, end_stream: bool, out: &mut Vec<ChainOutput>) {
        self.decode.end_stream = end_stream;
        if self.decode.stopped_at.is_some() {
            self.hold_data(Direction::Decode, data, end_stream);
            return;
        }
        let mut data = data;
        match walk_data(&mut self.filters, Direction::Decode, 0, &mut data, end_stream) {
            WalkData::Cleared => out.push(ChainOutput::Data { data, end_stream }),
            WalkData::Stopped { idx, buffering } => {
                self.decode.stopped_at = Some(idx + 1);
                self.decode.buffering = buffering;
                if buffering {
                    self.decode.buffer.move_from(&mut data);
                }
            }
        }
    }

    pub fn decode_trailers(&mut self, mut trailers: HeaderMap, out: &mut Vec<ChainOutput>) {
        self.decode.end_stream = true;
        if self.decode.stopped_at.is_some() {
            self.decode.trailers = Some(trailers);
            return;
        }
        match walk_trailers(&mut self.filters, Direction::Decode, 0, &mut trailers) {
            None => out.push(ChainOutput::Trailers { trailers }),
            Some(idx) => {
                self.decode.stopped_at = Some(idx + 1);
                self.decode.trailers = Some(trailers);
            }
        }
    }

    /// Resume a stopped decode walk at the filter after the one that
    /// stopped, flushing held headers, buffered data, and trailers.
    pub fn continue_decoding(&mut self, out: &mut Vec<ChainOutput>) {
        let Some(resume) = self.decode.stopped_at.take() else {
            return;
        };
        self.resume(Direction::Decode, resume, out);
    }

    pub fn encode_headers(
        &mut self,
        mut headers: HeaderMap,
        end_stream: bool,
        out: &mut Vec<ChainOutput>,
    ) {
        self.encode.end_stream = end_stream;
        let stopped = walk_headers(&mut self.filters, Direction::Encode, 0, &mut headers, end_stream);
        match stopped {
            None => out.push(ChainOutput::Headers { headers, end_stream }),
            Some(idx) => {
                self.encode.stopped_at = Some(idx + 1);
                self.encode.headers = Some((headers, end_stream));
            }
        }
    }

    pub fn encode_data(&mut self, data: Buffer, end_stream: bool, out: &mut Vec<ChainOutput>) {
        self.encode.end_stream = end_stream;
        if self.encode.stopped_at.is_some() {
            self.hold_data(Direction::Encode, data, end_stream);
            return;
        }
        let mut data = data;
        match walk_data(&mut self.filters, Direction::Encode, 0, &mut data, end_stream) {
            WalkData::Cleared => out.push(ChainOutput::Data { data, end_stream }),
            WalkData::Stopped { idx, buffering } => {
                self.encode.stopped_at = Some(idx + 1);
                self.encode.buffering = buffering;
                if buffering {
                    self.encode.buffer.move_from(&mut data);
                }
            }
        }
    }

    pub fn encode_trailers(&mut self, mut trailers: HeaderMap, out: &mut Vec<ChainOutput>) {
        self.encode.end_stream = true;
        if self.encode.stopped_at.is_some() {
            self.encode.trailers = Some(trailers);
            return;
        }
        match walk_trailers(&mut self.filters, Direction::Encode, 0, &mut trailers) {
            None => out.push(ChainOutput::Trailers { trailers }),
            Some(idx) => {
                self.encode.stopped_at = Some(idx + 1);
                self.encode.trailers = Some(trailers);
            }
        }
    }

    pub fn continue_encoding(&mut self, out: &mut Vec<ChainOutput>) {
        let Some(resume) = self.encode.stopped_at.take() else {
            return;
        };
        self.resume(Direction::Encode, resume, out);
    }

    /// Propagate a reset to every filter.
    pub fn on_reset(&mut self) {
        for filter in &mut self.filters {
            filter.on_reset();
        }
    }

    fn hold_data(&mut self, direction: Direction, mut data: Buffer, end_stream: bool) {
        let state = match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        };
        state.end_stream |= end_stream;
        if state.buffering || state.headers.is_some() {
            state.buffer.move_from(&mut data);
        }
    }

    fn resume(&mut self, direction: Direction, resume: usize, out: &mut Vec<ChainOutput>) {
        let state = match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        };
        let held_headers = state.headers.take();
        let mut held_data = std::mem::take(&mut state.buffer);
        let held_trailers = state.trailers.take();
        let end_stream = state.end_stream;
        state.buffering = false;

        if let Some((mut headers, headers_end)) = held_headers {
            let headers_end =
                headers_end || (end_stream && held_data.is_empty() && held_trailers.is_none());
            if let Some(idx) =
                walk_headers(&mut self.filters, direction, resume, &mut headers, headers_end)
            {
                self.set_stopped(direction, idx + 1, headers, headers_end, held_data, held_trailers);
                return;
            }
            out.push(ChainOutput::Headers {
                headers,
                end_stream: headers_end,
            });
        }

        if !held_data.is_empty() {
            let data_end = end_stream && held_trailers.is_none();
            match walk_data(&mut self.filters, direction, resume, &mut held_data, data_end) {
                WalkData::Cleared => out.push(ChainOutput::Data {
                    data: held_data,
                    end_stream: data_end,
                }),
                WalkData::Stopped { idx, buffering } => {
                    let state = self.direction_mut(direction);
                    state.stopped_at = Some(idx + 1);
                    state.buffering = buffering;
                    if buffering {
                        state.buffer.move_from(&mut held_data);
                    }
                    state.trailers = held_trailers;
                    return;
                }
            }
        }

        if let Some(mut trailers) = held_trailers {
            match walk_trailers(&mut self.filters, direction, resume, &mut trailers) {
                None => out.push(ChainOutput::Trailers { trailers }),
                Some(idx) => {
                    let state = self.direction_mut(direction);
                    state.stopped_at = Some(idx + 1);
                    state.trailers = Some(trailers);
                }
            }
        }
    }

    fn set_stopped(
        &mut self,
        direction: Direction,
        resume: usize,
        headers: HeaderMap,
        headers_end: bool,
        data: Buffer,
        trailers: Option<HeaderMap>,
    ) {
        let state = self.direction_mut(direction);
        state.stopped_at = Some(resume);
        state.headers = Some((headers, headers_end));
        state.buffer = data;
        state.trailers = trailers;
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Decode,
    Encode,
}

/// Map a walk position to a filter index: decode walks forward, encode
/// walks the same filters in reverse.
fn filter_index(direction: Direction, count: usize, pos: usize) -> usize {
    match direction {
        Direction::Decode => pos,
        Direction::Encode => count - 1 - pos,
    }
}

fn walk_headers(
    filters: &mut [Box<dyn StreamFilter>],
    direction: Direction,
    from: usize,
    headers: &mut HeaderMap,
    end_stream: bool,
) -> Option<usize> {
    for pos in from..filters.len() {
        let idx = filter_index(direction, filters.len(), pos);
        let status = match direction {
            Direction::Decode => filters[idx].on_request_headers(headers, end_stream),
            Direction::Encode => filters[idx].on_response_headers(headers, end_stream),
        };
        if status == FilterHeadersStatus::StopIteration {
            return Some(pos);
        }
    }
    None
}

enum WalkData {
    Cleared,
    Stopped { idx: usize, buffering: bool },
}

fn walk_data(
    filters: &mut [Box<dyn StreamFilter>],
    direction: Direction,
    from: usize,
    data: &mut Buffer,
    end_stream: bool,
) -> WalkData {
    for pos in from..filters.len() {
        let idx = filter_index(direction, filters.len(), pos);
        let status = match direction {
            Direction::Decode => filters[idx].on_request_data(data, end_stream),
            Direction::Encode => filters[idx].on_response_data(data, end_stream),
        };
        match status {
            FilterDataStatus::Continue => {}
            FilterDataStatus::StopIterationAndBuffer => {
                return WalkData::Stopped {
                    idx: pos,
                    buffering: true,
                }
            }
            FilterDataStatus::StopIterationNoBuffer => {
                return WalkData::Stopped {
                    idx: pos,
                    buffering: false,
                }
            }
        }
    }
    WalkData::Cleared
}

fn walk_trailers(
    filters: &mut [Box<dyn StreamFilter>],
    direction: Direction,
    from: usize,
    trailers: &mut HeaderMap,
) -> Option<usize> {
    for pos in from..filters.len() {
        let idx = filter_index(direction, filters.len(), pos);
        let status = match direction {
            Direction::Decode => filters[idx].on_request_trailers(trailers),
            Direction::Encode => filters[idx].on_response_trailers(trailers),
        };
        if status == FilterTrailersStatus::StopIteration {
            return Some(pos);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records the order filters see events in, with a scripted verdict for
    /// the first data call.
    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        data_verdict: FilterDataStatus,
        calls: usize,
    }

    impl StreamFilter for Recording {
        fn on_request_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end: bool,
        ) -> FilterHeadersStatus {
            self.log.lock().unwrap().push(format!("{}:req_h", self.name));
            FilterHeadersStatus::Continue
        }

        fn on_request_data(&mut self, _data: &mut Buffer, _end: bool) -> FilterDataStatus {
            self.log.lock().unwrap().push(format!("{}:req_d", self.name));
            self.calls += 1;
            if self.calls == 1 {
                self.data_verdict
            } else {
                FilterDataStatus::Continue
            }
        }

        fn on_response_headers(
            &mut self,
            _headers: &mut HeaderMap,
            _end: bool,
        ) -> FilterHeadersStatus {
            self.log.lock().unwrap().push(format!("{}:resp_h", self.name));
            FilterHeadersStatus::Continue
        }

        fn on_reset(&mut self) {
            self.log.lock().unwrap().push(format!("{}:reset", self.name));
        }
    }

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        data_verdict: FilterDataStatus,
    ) -> Box<dyn StreamFilter> {
        Box::new(Recording {
            name,
            log: log.clone(),
            data_verdict,
            calls: 0,
        })
    }

    fn buf(data: &[u8]) -> Buffer {
        let mut b = Buffer::new();
        b.add(data);
        b
    }

    #[test]
    fn decode_forward_encode_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new(vec![
            recording("a", &log, FilterDataStatus::Continue),
            recording("b", &log, FilterDataStatus::Continue),
        ]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), true, &mut out);
        chain.encode_headers(HeaderMap::new(), true, &mut out);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:req_h", "b:req_h", "b:resp_h", "a:resp_h"]
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn stop_and_buffer_then_continue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new(vec![
            recording("a", &log, FilterDataStatus::StopIterationAndBuffer),
            recording("b", &log, FilterDataStatus::Continue),
        ]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), false, &mut out);
        assert_eq!(out.len(), 1);
        out.clear();

        chain.decode_data(buf(b"he"), false, &mut out);
        assert!(out.is_empty());
        chain.decode_data(buf(b"llo"), true, &mut out);
        assert!(out.is_empty());
        // Both chunks accumulated while stopped.
        assert_eq!(chain.decoding_buffer().to_vec(), b"hello");
        // Filter b never saw data yet.
        assert!(!log.lock().unwrap().iter().any(|e| e == "b:req_d"));

        chain.continue_decoding(&mut out);
        assert_eq!(out.len(), 1);
        match &out[0] {
            ChainOutput::Data { data, end_stream } => {
                assert!(end_stream);
                assert_eq!(data.to_vec(), b"hello");
            }
            other => panic!("expected data, got {other:?}"),
        }
        assert!(log.lock().unwrap().iter().any(|e| e == "b:req_d"));
    }

    #[test]
    fn stop_no_buffer_discards_data() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new(vec![recording(
            "a",
            &log,
            FilterDataStatus::StopIterationNoBuffer,
        )]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), false, &mut out);
        out.clear();
        chain.decode_data(buf(b"dropped"), false, &mut out);
        assert!(out.is_empty());
        assert!(chain.decoding_buffer().is_empty());
    }

    #[test]
    fn trailers_held_until_continue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new(vec![
            recording("a", &log, FilterDataStatus::StopIterationAndBuffer),
        ]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), false, &mut out);
        out.clear();
        chain.decode_data(buf(b"x"), false, &mut out);
        let mut trailers = HeaderMap::new();
        trailers.insert("x-t", "1");
        chain.decode_trailers(trailers, &mut out);
        assert!(out.is_empty());

        chain.continue_decoding(&mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            ChainOutput::Data { end_stream: false, .. }
        ));
        assert!(matches!(out[1], ChainOutput::Trailers { .. }));
    }

    #[test]
    fn fn_filter_runs_triple() {
        let mut chain = FilterChain::new(vec![Box::new(FnFilter {
            state: 0u32,
            on_headers: Box::new(|count, headers, _end| {
                *count += 1;
                headers.insert("x-seen", count.to_string());
                FilterHeadersStatus::Continue
            }),
            on_data: Box::new(|_, _, _| FilterDataStatus::Continue),
            on_trailers: Box::new(|_, _| FilterTrailersStatus::Continue),
        })]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), true, &mut out);
        match &out[0] {
            ChainOutput::Headers { headers, .. } => {
                assert_eq!(headers.get("x-seen"), Some("1"))
            }
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[test]
    fn reset_reaches_every_filter() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new(vec![
            recording("a", &log, FilterDataStatus::Continue),
            recording("b", &log, FilterDataStatus::Continue),
        ]);
        chain.on_reset();
        assert_eq!(*log.lock().unwrap(), vec!["a:reset", "b:reset"]);
    }

    #[test]
    fn headers_stop_holds_everything() {
        struct StopHeaders;
        impl StreamFilter for StopHeaders {
            fn on_request_headers(
                &mut self,
                _h: &mut HeaderMap,
                _e: bool,
            ) -> FilterHeadersStatus {
                FilterHeadersStatus::StopIteration
            }
        }
        let mut chain = FilterChain::new(vec![Box::new(StopHeaders)]);
        let mut out = Vec::new();
        chain.decode_headers(HeaderMap::new(), false, &mut out);
        chain.decode_data(buf(b"body"), true, &mut out);
        assert!(out.is_empty());

        chain.continue_decoding(&mut out);
        assert_eq!(out.len(), 2);
        assert!(
            matches!(&out[0], ChainOutput::Headers { end_stream: false, .. })
        );
        match &out[1] {
            ChainOutput::Data { data, end_stream } => {
                assert!(end_stream);
                assert_eq!(data.to_vec(), b"body");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
}
