//! Per-worker event loop.
//!
//! Each worker owns a poll, its accepted connections, its upstream
//! sockets, its timers, and its thread-local cluster snapshots. Nothing
//! on the data path is shared mutably with another worker; the only
//! cross-thread traffic is snapshot delivery (manager to worker) and
//! outlier notifications (worker to manager).
//!
//! Event routing is explicit: pool decisions come out as
//! [`PoolAction`]s, stream decisions are made by the per-stream
//! [`Router`], and this module performs the socket work both ask for.
//! Reentrancy is avoided by queueing: pool actions and shadow requests
//! are drained only after a router call returns.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use protocol_http1::{HeaderMap, Protocol, ServerConnection, StreamEvent};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use slab::Slab;

use crate::access_log::{format_access_line, Sink};
use crate::buffer::Buffer;
use crate::cluster_manager::{ControlMsg, SnapshotMap};
use crate::edge;
use crate::error::Error;
use crate::event::{TimerId, TimerQueue};
use crate::filter::{ChainOutput, FilterChain};
use crate::router::{Router, RouterContext, StreamTimer};
use crate::runtime::Snapshot;
use crate::stream_info::{ResetReason, StreamId};
use crate::upstream::{
    Balancer, ClientId, ClusterInfo, Http1Pool, HostRef, LbContext, PoolAction, Priority,
};

use super::{build_local_replies, ListenerHandle};

const READ_CHUNK: usize = 16 * 1024;

type PoolKey = (String, SocketAddr, Priority);

/// Where a stream id leads.
enum StreamHome {
    Conn(usize),
    Shadow,
}

struct WorkerCluster {
    balancer: Balancer,
    pools: HashMap<(SocketAddr, Priority), Http1Pool>,
}

struct Listener {
    socket: TcpListener,
    handle: Arc<ListenerHandle>,
}

struct Conn {
    socket: TcpStream,
    peer: SocketAddr,
    listener: usize,
    read_buf: Buffer,
    write_buf: Buffer,
    codec: ServerConnection,
    stream: Option<Stream>,
    closing: bool,
}

struct Stream {
    id: StreamId,
    chain: FilterChain,
    router: Router,
    /// Upstream socket table index while attached.
    upstream_io: Option<usize>,
    pool_key: Option<PoolKey>,
    /// Mutated request headers kept for logging and response mutation.
    log_headers: HeaderMap,
    protocol: Protocol,
}

struct UpstreamIo {
    socket: TcpStream,
    write_buf: Buffer,
    pool_key: PoolKey,
    client: ClientId,
    connected: bool,
    connect_timer: Option<TimerId>,
    connect_started: Instant,
}

/// A mirrored request awaiting or using an upstream stream.
struct ShadowState {
    headers: HeaderMap,
    body: Buffer,
    trailers: Option<HeaderMap>,
}

#[derive(Debug, Clone, Copy)]
enum TimerTask {
    Stream { id: StreamId, timer: StreamTimer },
    ConnectTimeout { io: usize },
}

pub struct Worker {
    id: usize,
    poll: Poll,
    waker: Arc<Waker>,
    listeners: Vec<Listener>,
    waker_token: Token,
    token_base: usize,

    snapshot_rx: Receiver<Arc<SnapshotMap>>,
    control_tx: Sender<ControlMsg>,
    snapshot: Arc<SnapshotMap>,
    clusters: HashMap<String, WorkerCluster>,

    conns: Slab<Conn>,
    upstreams: Slab<UpstreamIo>,
    client_io: HashMap<(PoolKey, ClientId), usize>,
    streams: HashMap<StreamId, StreamHome>,
    shadows: HashMap<StreamId, ShadowState>,
    timers: TimerQueue<TimerTask>,
    dirty_pools: Vec<PoolKey>,

    next_stream_id: u64,
    rng: SmallRng,
    runtime: Snapshot,
    local_zone: String,
    access_log: Sink,
    local_replies: HashMap<(u16, &'static str), Bytes>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        listeners: &[Arc<ListenerHandle>],
        snapshot_rx: Receiver<Arc<SnapshotMap>>,
        control_tx: Sender<ControlMsg>,
        runtime: Snapshot,
        local_zone: String,
        access_log: Sink,
    ) -> Result<Worker, Error> {
        let poll = Poll::new()?;
        let waker_token = Token(listeners.len());
        let waker = Arc::new(Waker::new(poll.registry(), waker_token)?);

        let mut bound = Vec::new();
        for (idx, handle) in listeners.iter().enumerate() {
            let socket = handle.socket.try_clone()?;
            socket.set_nonblocking(true)?;
            let mut socket = TcpListener::from_std(socket);
            poll.registry()
                .register(&mut socket, Token(idx), Interest::READABLE)?;
            bound.push(Listener {
                socket,
                handle: handle.clone(),
            });
        }

        Ok(Worker {
            token_base: listeners.len() + 1,
            id,
            poll,
            waker,
            listeners: bound,
            waker_token,
            snapshot_rx,
            control_tx,
            snapshot: Arc::new(SnapshotMap::default()),
            clusters: HashMap::new(),
            conns: Slab::new(),
            upstreams: Slab::new(),
            client_io: HashMap::new(),
            streams: HashMap::new(),
            shadows: HashMap::new(),
            timers: TimerQueue::new(),
            dirty_pools: Vec::new(),
            next_stream_id: 0,
            rng: SmallRng::from_entropy(),
            runtime,
            local_zone,
            access_log,
            local_replies: build_local_replies(),
        })
    }

    /// Waker handle for the cluster manager to interrupt the poll.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn conn_token(&self, key: usize) -> Token {
        Token(self.token_base + key * 2)
    }

    fn upstream_token(&self, idx: usize) -> Token {
        Token(self.token_base + idx * 2 + 1)
    }

    fn classify_token(&self, token: Token) -> TokenKind {
        if token.0 < self.listeners.len() {
            TokenKind::Listener(token.0)
        } else if token == self.waker_token {
            TokenKind::Waker
        } else {
            let offset = token.0 - self.token_base;
            if offset % 2 == 0 {
                TokenKind::Conn(offset / 2)
            } else {
                TokenKind::Upstream(offset / 2)
            }
        }
    }

    pub fn run(&mut self) {
        tracing::debug!(worker = self.id, "worker started");
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(worker = self.id, error = %e, "poll failed");
                return;
            }

            // Snapshots first, so a request never races its cluster.
            self.drain_snapshots();
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                match self.classify_token(token) {
                    TokenKind::Listener(idx) => self.accept(idx),
                    TokenKind::Waker => self.drain_snapshots(),
                    TokenKind::Conn(key) => self.on_conn_io(key, readable, writable),
                    TokenKind::Upstream(idx) => self.on_upstream_io(idx, readable, writable),
                }
                self.drain_pool_actions();
            }
            self.fire_timers();
        }
    }

    // ── Control plane ───────────────────────────────────────────────

    fn drain_snapshots(&mut self) {
        while let Ok(snapshot) = self.snapshot_rx.try_recv() {
            self.apply_snapshot(snapshot);
        }
    }

    fn apply_snapshot(&mut self, snapshot: Arc<SnapshotMap>) {
        self.snapshot = snapshot;
        // Drain pools whose host left the cluster.
        for (name, cluster) in &mut self.clusters {
            let Some(snap) = self.snapshot.get(name) else {
                for (key, pool) in cluster.pools.iter_mut() {
                    pool.start_drain();
                    self.dirty_pools
                        .push((name.clone(), key.0, key.1));
                }
                continue;
            };
            for ((address, priority), pool) in cluster.pools.iter_mut() {
                if !snap.hosts.hosts.iter().any(|h| h.address() == *address) {
                    pool.start_drain();
                    self.dirty_pools.push((name.clone(), *address, *priority));
                }
            }
        }
        self.drain_pool_actions();
    }

    // ── Accept path ─────────────────────────────────────────────────

    fn accept(&mut self, listener_idx: usize) {
        loop {
            match self.listeners[listener_idx].socket.accept() {
                Ok((socket, peer)) => {
                    let entry = self.conns.vacant_entry();
                    let key = entry.key();
                    let token = Token(self.token_base + key * 2);
                    let mut socket = socket;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        tracing::warn!(error = %e, "failed to register connection");
                        continue;
                    }
                    tracing::debug!(worker = self.id, %peer, "connection accepted");
                    entry.insert(Conn {
                        socket,
                        peer,
                        listener: listener_idx,
                        read_buf: Buffer::new(),
                        write_buf: Buffer::new(),
                        codec: ServerConnection::new(),
                        stream: None,
                        closing: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    // ── Downstream I/O ──────────────────────────────────────────────

    fn on_conn_io(&mut self, key: usize, readable: bool, writable: bool) {
        if !self.conns.contains(key) {
            return;
        }
        if writable {
            let conn = &mut self.conns[key];
            if let Err(e) = conn.write_buf.write_to(&mut conn.socket) {
                if e.kind() != ErrorKind::WouldBlock {
                    self.close_conn(key, true);
                    return;
                }
            }
            if self.conns[key].closing && self.conns[key].write_buf.is_empty() {
                self.close_conn(key, false);
                return;
            }
        }
        if readable {
            let limit = self.listeners[self.conns[key].listener]
                .handle
                .read_buffer_limit;
            loop {
                let conn = &mut self.conns[key];
                if conn.read_buf.len() >= limit {
                    break;
                }
                match conn.read_buf.read_from(&mut conn.socket, READ_CHUNK) {
                    Ok(0) => {
                        self.close_conn(key, self.conns[key].stream.is_some());
                        return;
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.close_conn(key, true);
                        return;
                    }
                }
            }
            self.process_downstream(key);
        }
        self.update_conn_interest(key);
    }

    /// Run the codec over buffered bytes and dispatch stream events. Also
    /// re-entered after a response completes to serve pipelined requests.
    fn process_downstream(&mut self, key: usize) {
        loop {
            if !self.conns.contains(key) || self.conns[key].closing {
                return;
            }
            if self.conns[key].read_buf.is_empty() {
                break;
            }
            let data = self.conns[key].read_buf.linearize_all().to_vec();
            let dispatched = self.conns[key].codec.dispatch(&data);
            let consumed = match dispatched {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(worker = self.id, error = %e, "downstream protocol error");
                    let conn = &mut self.conns[key];
                    let pending = conn.codec.take_pending_send();
                    conn.write_buf.add_bytes(pending);
                    conn.closing = true;
                    if self.conns[key].stream.is_some() {
                        self.reset_stream_on_conn(key);
                    }
                    self.update_conn_interest(key);
                    return;
                }
            };
            {
                let conn = &mut self.conns[key];
                conn.read_buf.drain(consumed);
                let pending = conn.codec.take_pending_send();
                conn.write_buf.add_bytes(pending);
            }

            let mut made_progress = consumed > 0;
            while let Some(event) = self.conns[key].codec.poll_event() {
                made_progress = true;
                self.on_downstream_event(key, event);
                if !self.conns.contains(key) || self.conns[key].closing {
                    return;
                }
            }
            if !made_progress {
                break;
            }
        }
        self.update_conn_interest(key);
    }

    fn on_downstream_event(&mut self, key: usize, event: StreamEvent) {
        match event {
            StreamEvent::Headers { mut headers, end_stream } => {
                let conn = &self.conns[key];
                let listener = &self.listeners[conn.listener].handle;
                edge::mutate_request_headers(&mut headers, conn.peer, &listener.edge);

                let id = StreamId(self.next_stream_id);
                self.next_stream_id += 1;
                let router = Router::new(listener.router_config.clone(), id, Instant::now());
                let stream = Stream {
                    id,
                    chain: FilterChain::new(Vec::new()),
                    router,
                    upstream_io: None,
                    pool_key: None,
                    log_headers: headers.clone(),
                    protocol: self.conns[key].codec.active_protocol(),
                };
                self.conns[key].stream = Some(stream);
                self.streams.insert(id, StreamHome::Conn(key));

                self.dispatch_decode(key, DecodeEvent::Headers(headers, end_stream));
            }
            StreamEvent::Data { data, end_stream } => {
                if let Some(stream) = self.conns[key].stream.as_mut() {
                    stream.router.info.bytes_received += data.len() as u64;
                }
                let mut buffer = Buffer::new();
                buffer.add_bytes(data);
                self.dispatch_decode(key, DecodeEvent::Data(buffer, end_stream));
            }
            StreamEvent::Trailers { trailers } => {
                self.dispatch_decode(key, DecodeEvent::Trailers(trailers));
            }
        }
    }

    // ── Stream dispatch plumbing ────────────────────────────────────

    fn dispatch_decode(&mut self, key: usize, event: DecodeEvent) {
        self.with_stream(key, |stream, ctx| {
            let mut out = Vec::new();
            match event {
                DecodeEvent::Headers(headers, end_stream) => {
                    stream.chain.decode_headers(headers, end_stream, &mut out)
                }
                DecodeEvent::Data(data, end_stream) => {
                    stream.chain.decode_data(data, end_stream, &mut out)
                }
                DecodeEvent::Trailers(trailers) => stream.chain.decode_trailers(trailers, &mut out),
            }
            for output in out {
                match output {
                    ChainOutput::Headers { headers, end_stream } => {
                        stream.router.decode_headers(ctx, headers, end_stream)
                    }
                    ChainOutput::Data { data, end_stream } => {
                        stream.router.decode_data(ctx, data, end_stream)
                    }
                    ChainOutput::Trailers { trailers } => {
                        stream.router.decode_trailers(ctx, trailers)
                    }
                }
            }
        });
    }

    /// Take the stream out of the connection, run `f` with a context
    /// wired to this worker, then finalize: apply side effects, restore
    /// or retire the stream.
    fn with_stream<F>(&mut self, key: usize, f: F)
    where
        F: FnOnce(&mut StreamParts<'_>, &mut dyn RouterContext),
    {
        if !self.conns.contains(key) {
            return;
        }
        let Some(mut stream) = self.conns[key].stream.take() else {
            return;
        };
        let conn = &mut self.conns[key];
        let mut effects = Effects::default();
        {
            let mut ctx = WorkerCtx {
                snapshot: &self.snapshot,
                clusters: &mut self.clusters,
                timers: &mut self.timers,
                rng: &mut self.rng,
                runtime: &self.runtime,
                local_zone: &self.local_zone,
                control_tx: &self.control_tx,
                upstreams: &mut self.upstreams,
                registry: self.poll.registry(),
                local_replies: &self.local_replies,
                token_base: self.token_base,
                stream_id: stream.id,
                upstream_io: &mut stream.upstream_io,
                pool_key: &mut stream.pool_key,
                request_headers: &stream.log_headers,
                codec: &mut conn.codec,
                write_buf: &mut conn.write_buf,
                effects: &mut effects,
            };
            let mut parts = StreamParts {
                id: stream.id,
                chain: &mut stream.chain,
                router: &mut stream.router,
            };
            f(&mut parts, &mut ctx);
        }
        stream.router.info.bytes_sent += effects.bytes_sent;

        let completed = stream.router.completed();
        self.conns[key].stream = Some(stream);

        for (cluster, headers, body, trailers) in effects.shadows.drain(..) {
            self.start_shadow(cluster, headers, body, trailers);
        }
        self.dirty_pools.extend(effects.dirty_pools.drain(..));

        if effects.reset_downstream {
            self.close_conn(key, true);
            return;
        }
        if completed && self.conns[key].codec.response_complete() {
            self.finish_stream(key);
        }
        if self.conns.contains(key) {
            self.update_conn_interest(key);
        }
    }

    /// Stream reached a terminal state and the response is on the wire
    /// (or buffered): log it, drop it, and serve the next message.
    fn finish_stream(&mut self, key: usize) {
        let Some(stream) = self.conns[key].stream.take() else {
            return;
        };
        self.streams.remove(&stream.id);
        let duration = Instant::now().duration_since(stream.router.info.start_time);
        self.access_log.log(format_access_line(
            &stream.log_headers,
            &stream.router.info,
            stream.protocol,
            duration,
        ));

        if self.conns[key].codec.wants_close() {
            self.conns[key].closing = true;
            if self.conns[key].write_buf.is_empty() {
                self.close_conn(key, false);
                return;
            }
        } else {
            // Serve a pipelined next request, if buffered.
            self.process_downstream(key);
        }
    }

    fn reset_stream_on_conn(&mut self, key: usize) {
        if let Some(stream) = &mut self.conns[key].stream {
            stream.chain.on_reset();
        }
        self.with_stream(key, |stream, ctx| {
            stream.router.on_downstream_reset(ctx);
        });
        if let Some(stream) = self.conns[key].stream.take() {
            self.streams.remove(&stream.id);
            let duration = Instant::now().duration_since(stream.router.info.start_time);
            self.access_log.log(format_access_line(
                &stream.log_headers,
                &stream.router.info,
                stream.protocol,
                duration,
            ));
        }
    }

    fn close_conn(&mut self, key: usize, reset_stream: bool) {
        if !self.conns.contains(key) {
            return;
        }
        self.conns[key].closing = true;
        if reset_stream && self.conns[key].stream.is_some() {
            self.reset_stream_on_conn(key);
        }
        let mut conn = self.conns.remove(key);
        let _ = self.poll.registry().deregister(&mut conn.socket);
        self.drain_pool_actions();
        tracing::debug!(worker = self.id, peer = %conn.peer, "connection closed");
    }

    fn update_conn_interest(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }
        let limit = self.listeners[self.conns[key].listener]
            .handle
            .read_buffer_limit;
        let token = self.conn_token(key);
        let conn = &mut self.conns[key];
        let wants_read = !conn.closing && conn.read_buf.len() < limit;
        let wants_write = !conn.write_buf.is_empty();
        let interest = match (wants_read, wants_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            // mio requires a non-empty interest set; a quiet connection
            // still watches for readability to notice the peer closing.
            (false, false) => Interest::READABLE,
        };
        let _ = self
            .poll
            .registry()
            .reregister(&mut conn.socket, token, interest);
    }

    // ── Pool action plumbing ────────────────────────────────────────

    fn drain_pool_actions(&mut self) {
        while let Some(pool_key) = self.dirty_pools.pop() {
            let actions = {
                let Some(pool) = self.pool_mut(&pool_key) else {
                    continue;
                };
                let mut actions = Vec::new();
                while let Some(action) = pool.poll_action() {
                    actions.push(action);
                }
                actions
            };
            for action in actions {
                self.handle_pool_action(&pool_key, action);
            }
        }
    }

    fn pool_mut(&mut self, key: &PoolKey) -> Option<&mut Http1Pool> {
        self.clusters
            .get_mut(&key.0)
            .and_then(|c| c.pools.get_mut(&(key.1, key.2)))
    }

    fn handle_pool_action(&mut self, pool_key: &PoolKey, action: PoolAction) {
        match action {
            PoolAction::Connect {
                client,
                address,
                timeout,
            } => match TcpStream::connect(address) {
                Ok(mut socket) => {
                    let now = Instant::now();
                    let entry = self.upstreams.vacant_entry();
                    let idx = entry.key();
                    let token = Token(self.token_base + idx * 2 + 1);
                    if self
                        .poll
                        .registry()
                        .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
                        .is_err()
                    {
                        if let Some(pool) = self.pool_mut(pool_key) {
                            pool.on_connect_failure(client, false);
                        }
                        self.dirty_pools.push(pool_key.clone());
                        return;
                    }
                    let connect_timer =
                        self.timers
                            .schedule(now, timeout, TimerTask::ConnectTimeout { io: idx });
                    entry.insert(UpstreamIo {
                        socket,
                        write_buf: Buffer::new(),
                        pool_key: pool_key.clone(),
                        client,
                        connected: false,
                        connect_timer: Some(connect_timer),
                        connect_started: now,
                    });
                    self.client_io.insert((pool_key.clone(), client), idx);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "upstream connect failed to start");
                    if let Some(pool) = self.pool_mut(pool_key) {
                        pool.on_connect_failure(client, false);
                    }
                    self.dirty_pools.push(pool_key.clone());
                }
            },
            PoolAction::CloseClient { client } => {
                if let Some(idx) = self.client_io.remove(&(pool_key.clone(), client)) {
                    let mut io = self.upstreams.remove(idx);
                    if let Some(timer) = io.connect_timer.take() {
                        self.timers.cancel(timer);
                    }
                    let _ = self.poll.registry().deregister(&mut io.socket);
                }
            }
            PoolAction::Ready { stream, client, host: _ } => {
                let io_idx = self.client_io.get(&(pool_key.clone(), client)).copied();
                match self.streams.get(&stream) {
                    Some(StreamHome::Conn(key)) => {
                        let key = *key;
                        if !self.conns.contains(key) {
                            if let Some(pool) = self.pool_mut(pool_key) {
                                pool.on_stream_reset(client);
                            }
                            self.dirty_pools.push(pool_key.clone());
                            return;
                        }
                        if let Some(conn_stream) = self.conns[key].stream.as_mut() {
                            conn_stream.upstream_io = io_idx;
                        }
                        self.with_stream(key, |stream, ctx| {
                            stream.router.on_pool_ready(ctx);
                        });
                    }
                    Some(StreamHome::Shadow) => self.shadow_pool_ready(stream, pool_key, client),
                    None => {
                        // Stream died between queueing and delivery.
                        if let Some(pool) = self.pool_mut(pool_key) {
                            pool.on_stream_reset(client);
                        }
                        self.dirty_pools.push(pool_key.clone());
                    }
                }
            }
            PoolAction::Failure {
                stream,
                reason,
                host,
            } => match self.streams.get(&stream) {
                Some(StreamHome::Conn(key)) => {
                    let key = *key;
                    self.with_stream(key, |stream, ctx| {
                        stream.router.on_pool_failure(ctx, reason, host);
                    });
                }
                Some(StreamHome::Shadow) => {
                    self.streams.remove(&stream);
                    self.shadows.remove(&stream);
                }
                None => {}
            },
            PoolAction::Drained => {
                if let Some(cluster) = self.clusters.get_mut(&pool_key.0) {
                    if let Some(pool) = cluster.pools.get(&(pool_key.1, pool_key.2)) {
                        if pool.is_idle() {
                            cluster.pools.remove(&(pool_key.1, pool_key.2));
                        }
                    }
                }
            }
        }
    }

    // ── Upstream I/O ────────────────────────────────────────────────

    fn on_upstream_io(&mut self, idx: usize, readable: bool, writable: bool) {
        if !self.upstreams.contains(idx) {
            return;
        }
        if writable {
            if !self.upstreams[idx].connected {
                self.on_upstream_connected(idx);
                if !self.upstreams.contains(idx) {
                    return;
                }
            }
            let io = &mut self.upstreams[idx];
            if let Err(e) = io.write_buf.write_to(&mut io.socket) {
                if e.kind() != ErrorKind::WouldBlock {
                    self.on_upstream_closed(idx);
                    return;
                }
            }
        }
        if readable {
            self.on_upstream_readable(idx);
        }
        if self.upstreams.contains(idx) {
            self.update_upstream_interest(idx);
        }
    }

    fn on_upstream_connected(&mut self, idx: usize) {
        let error = self.upstreams[idx].socket.take_error().ok().flatten();
        let connected = error.is_none() && self.upstreams[idx].socket.peer_addr().is_ok();
        let pool_key = self.upstreams[idx].pool_key.clone();
        let client = self.upstreams[idx].client;

        if connected {
            let io = &mut self.upstreams[idx];
            io.connected = true;
            if let Some(timer) = io.connect_timer.take() {
                self.timers.cancel(timer);
            }
            let elapsed = Instant::now().duration_since(io.connect_started);
            if let Some(info) = self.cluster_info(&pool_key.0) {
                info.stats
                    .upstream_cx_connect_ms
                    .record(elapsed.as_millis() as u64);
            }
            if let Some(pool) = self.pool_mut(&pool_key) {
                pool.on_connect_success(client);
            }
            self.dirty_pools.push(pool_key);
            self.drain_pool_actions();
        } else {
            self.remove_upstream_io(idx);
            if let Some(pool) = self.pool_mut(&pool_key) {
                pool.on_connect_failure(client, false);
            }
            self.dirty_pools.push(pool_key);
            self.drain_pool_actions();
        }
    }

    fn on_upstream_readable(&mut self, idx: usize) {
        let pool_key = self.upstreams[idx].pool_key.clone();
        let client = self.upstreams[idx].client;
        let mut scratch = Buffer::new();
        let mut peer_closed = false;
        loop {
            let io = &mut self.upstreams[idx];
            match scratch.read_from(&mut io.socket, READ_CHUNK) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    peer_closed = true;
                    break;
                }
            }
        }

        let data = scratch.to_vec();
        if !data.is_empty() {
            let dispatched = {
                let Some(pool) = self.pool_mut(&pool_key) else {
                    return;
                };
                let Some(pool_client) = pool.client_mut(client) else {
                    return;
                };
                pool_client.codec.dispatch(&data)
            };
            match dispatched {
                Ok(_) => self.pump_upstream_events(&pool_key, client),
                Err(e) => {
                    tracing::debug!(error = %e, "upstream protocol error");
                    self.abandon_upstream(idx, ResetReason::ConnectionTermination);
                    return;
                }
            }
        }

        if peer_closed && self.upstreams.contains(idx) {
            self.on_upstream_closed(idx);
        }
    }

    /// Drain response events from an upstream codec into the owning
    /// stream's router, then let the pool recycle the client if the
    /// response finished.
    fn pump_upstream_events(&mut self, pool_key: &PoolKey, client: ClientId) {
        let mut response_done = false;
        loop {
            let (event, attached) = {
                let Some(pool) = self.pool_mut(pool_key) else {
                    return;
                };
                let attached = pool.attached_stream(client);
                let Some(pool_client) = pool.client_mut(client) else {
                    return;
                };
                (pool_client.codec.poll_event(), attached)
            };
            let Some(event) = event else {
                break;
            };
            let Some(stream_id) = attached else {
                continue;
            };
            match self.streams.get(&stream_id) {
                Some(StreamHome::Conn(key)) => {
                    let key = *key;
                    match event {
                        StreamEvent::Headers { headers, end_stream } => {
                            response_done |= end_stream;
                            self.with_stream(key, |stream, ctx| {
                                stream.router.on_upstream_headers(ctx, headers, end_stream);
                            });
                        }
                        StreamEvent::Data { data, end_stream } => {
                            response_done |= end_stream;
                            let mut buffer = Buffer::new();
                            buffer.add_bytes(data);
                            self.with_stream(key, |stream, ctx| {
                                stream.router.on_upstream_data(ctx, buffer, end_stream);
                            });
                        }
                        StreamEvent::Trailers { trailers } => {
                            response_done = true;
                            self.with_stream(key, |stream, ctx| {
                                stream.router.on_upstream_trailers(ctx, trailers);
                            });
                        }
                    }
                }
                Some(StreamHome::Shadow) => {
                    let done = match &event {
                        StreamEvent::Headers { end_stream, .. } => *end_stream,
                        StreamEvent::Data { end_stream, .. } => *end_stream,
                        StreamEvent::Trailers { .. } => true,
                    };
                    if done {
                        response_done = true;
                        self.streams.remove(&stream_id);
                        self.shadows.remove(&stream_id);
                    }
                }
                None => {}
            }
        }

        if response_done {
            // A response that finished before the request was fully
            // encoded poisons the connection for reuse.
            let attached = self
                .pool_mut(pool_key)
                .and_then(|pool| pool.attached_stream(client));
            let request_complete = match attached {
                Some(id) => match self.streams.get(&id) {
                    Some(StreamHome::Conn(key)) => self
                        .conns
                        .get(*key)
                        .and_then(|c| c.stream.as_ref())
                        .map(|s| s.router.upstream_encode_complete())
                        .unwrap_or(true),
                    _ => true,
                },
                None => true,
            };
            if let Some(pool) = self.pool_mut(pool_key) {
                pool.on_response_complete(client, request_complete);
            }
            self.dirty_pools.push(pool_key.clone());
            self.drain_pool_actions();
        }
    }

    /// The upstream connection died under an in-flight response.
    fn abandon_upstream(&mut self, idx: usize, reason: ResetReason) {
        let pool_key = self.upstreams[idx].pool_key.clone();
        let client = self.upstreams[idx].client;
        let attached = self
            .pool_mut(&pool_key)
            .and_then(|pool| pool.attached_stream(client));

        self.remove_upstream_io(idx);
        if let Some(pool) = self.pool_mut(&pool_key) {
            pool.on_client_closed(client);
        }
        self.dirty_pools.push(pool_key);

        if let Some(stream_id) = attached {
            match self.streams.get(&stream_id) {
                Some(StreamHome::Conn(key)) => {
                    let key = *key;
                    if let Some(stream) = self.conns[key].stream.as_mut() {
                        stream.upstream_io = None;
                    }
                    self.with_stream(key, |stream, ctx| {
                        stream.router.on_upstream_reset(ctx, reason);
                    });
                }
                Some(StreamHome::Shadow) => {
                    self.streams.remove(&stream_id);
                    self.shadows.remove(&stream_id);
                }
                None => {}
            }
        }
        self.drain_pool_actions();
    }

    fn on_upstream_closed(&mut self, idx: usize) {
        let pool_key = self.upstreams[idx].pool_key.clone();
        let client = self.upstreams[idx].client;
        if !self.upstreams[idx].connected {
            self.remove_upstream_io(idx);
            if let Some(pool) = self.pool_mut(&pool_key) {
                pool.on_connect_failure(client, false);
            }
            self.dirty_pools.push(pool_key);
            self.drain_pool_actions();
            return;
        }

        // Feed EOF through the codec first: an until-close response body
        // legitimately ends here.
        let finish = self
            .pool_mut(&pool_key)
            .and_then(|pool| pool.client_mut(client).map(|c| c.codec.on_close()));
        match finish {
            Some(Ok(())) => {
                self.pump_upstream_events(&pool_key, client);
                if self.upstreams.contains(idx) {
                    let idx_key = self.upstreams[idx].pool_key.clone();
                    self.remove_upstream_io(idx);
                    if let Some(pool) = self.pool_mut(&idx_key) {
                        pool.on_client_closed(client);
                    }
                    self.dirty_pools.push(idx_key);
                    self.drain_pool_actions();
                }
            }
            Some(Err(_)) => self.abandon_upstream(idx, ResetReason::ConnectionTermination),
            None => self.remove_upstream_io(idx),
        }
    }

    fn remove_upstream_io(&mut self, idx: usize) {
        if !self.upstreams.contains(idx) {
            return;
        }
        let mut io = self.upstreams.remove(idx);
        if let Some(timer) = io.connect_timer.take() {
            self.timers.cancel(timer);
        }
        let _ = self.poll.registry().deregister(&mut io.socket);
        self.client_io.remove(&(io.pool_key.clone(), io.client));
    }

    fn update_upstream_interest(&mut self, idx: usize) {
        let token = self.upstream_token(idx);
        let io = &mut self.upstreams[idx];
        let interest = if !io.connected || !io.write_buf.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let _ = self
            .poll
            .registry()
            .reregister(&mut io.socket, token, interest);
    }

    fn cluster_info(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.snapshot.get(name).map(|c| c.info.clone())
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(task) = self.timers.pop_expired(now) {
            match task {
                TimerTask::Stream { id, timer } => {
                    let Some(StreamHome::Conn(key)) = self.streams.get(&id) else {
                        continue;
                    };
                    let key = *key;
                    self.with_stream(key, |stream, ctx| match timer {
                        StreamTimer::GlobalTimeout => stream.router.on_global_timeout(ctx),
                        StreamTimer::PerTryTimeout => stream.router.on_per_try_timeout(ctx),
                        StreamTimer::RetryBackoff => stream.router.on_retry_timer(ctx),
                    });
                }
                TimerTask::ConnectTimeout { io } => {
                    if self.upstreams.contains(io) && !self.upstreams[io].connected {
                        let pool_key = self.upstreams[io].pool_key.clone();
                        let client = self.upstreams[io].client;
                        self.remove_upstream_io(io);
                        if let Some(pool) = self.pool_mut(&pool_key) {
                            pool.on_connect_failure(client, true);
                        }
                        self.dirty_pools.push(pool_key);
                    }
                }
            }
            self.drain_pool_actions();
        }
    }

    // ── Shadowing ───────────────────────────────────────────────────

    fn start_shadow(
        &mut self,
        cluster: String,
        headers: HeaderMap,
        body: Buffer,
        trailers: Option<HeaderMap>,
    ) {
        let Some(snap) = self.snapshot.get(&cluster) else {
            return;
        };
        let info = snap.info.clone();
        let hosts = snap.hosts.clone();
        let local = self.snapshot.local_hosts();

        let state = self
            .clusters
            .entry(cluster.clone())
            .or_insert_with(|| WorkerCluster {
                balancer: Balancer::new(info.lb_policy),
                pools: HashMap::new(),
            });
        let Some(host) = state.balancer.choose_host(
            &hosts,
            local.as_deref(),
            &info.stats,
            &self.runtime,
            &LbContext::default(),
            &mut self.rng,
        ) else {
            return;
        };

        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        self.streams.insert(id, StreamHome::Shadow);
        self.shadows.insert(
            id,
            ShadowState {
                headers,
                body,
                trailers,
            },
        );

        let pool_key: PoolKey = (cluster, host.address(), Priority::Default);
        let pool = state
            .pools
            .entry((pool_key.1, pool_key.2))
            .or_insert_with(|| Http1Pool::new(host.clone(), info, Priority::Default));
        pool.new_stream(id);
        self.dirty_pools.push(pool_key);
        self.drain_pool_actions();
    }

    fn shadow_pool_ready(&mut self, stream: StreamId, pool_key: &PoolKey, client: ClientId) {
        let Some(state) = self.shadows.get(&stream) else {
            return;
        };
        let headers = state.headers.clone();
        let body = state.body.to_vec();
        let trailers = state.trailers.clone();

        let io_idx = self.client_io.get(&(pool_key.clone(), client)).copied();
        let encode_failed = {
            let Some(pool) = self.pool_mut(pool_key) else {
                return;
            };
            let Some(pool_client) = pool.client_mut(client) else {
                return;
            };
            let codec = &mut pool_client.codec;
            let end_on_headers = body.is_empty() && trailers.is_none();
            let result = codec.encode_headers(&headers, end_on_headers);
            if result.is_ok() {
                if !body.is_empty() {
                    codec.encode_data(&body, trailers.is_none());
                }
                if let Some(trailers) = &trailers {
                    codec.encode_trailers(trailers);
                }
            }
            result.is_err()
        };
        if encode_failed {
            self.streams.remove(&stream);
            self.shadows.remove(&stream);
            if let Some(pool) = self.pool_mut(pool_key) {
                pool.on_stream_reset(client);
            }
            self.dirty_pools.push(pool_key.clone());
            return;
        }
        self.flush_upstream_codec(pool_key, client, io_idx);
    }

    /// Move a pool client's pending wire bytes onto its socket buffer.
    fn flush_upstream_codec(
        &mut self,
        pool_key: &PoolKey,
        client: ClientId,
        io_idx: Option<usize>,
    ) {
        let pending = self
            .pool_mut(pool_key)
            .and_then(|pool| pool.client_mut(client))
            .map(|c| c.codec.take_pending_send());
        let Some(pending) = pending else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        if let Some(idx) = io_idx {
            if self.upstreams.contains(idx) {
                let io = &mut self.upstreams[idx];
                io.write_buf.add_bytes(pending);
                if io.connected {
                    let _ = io.write_buf.write_to(&mut io.socket);
                }
                self.update_upstream_interest(idx);
            }
        }
    }
}

enum TokenKind {
    Listener(usize),
    Waker,
    Conn(usize),
    Upstream(usize),
}

enum DecodeEvent {
    Headers(HeaderMap, bool),
    Data(Buffer, bool),
    Trailers(HeaderMap),
}

/// Mutable pieces of a stream handed to dispatch closures.
struct StreamParts<'a> {
    #[allow(dead_code)]
    id: StreamId,
    chain: &'a mut FilterChain,
    router: &'a mut Router,
}

/// Side effects a router call produced, applied by the worker afterwards.
#[derive(Default)]
struct Effects {
    bytes_sent: u64,
    reset_downstream: bool,
    shadows: Vec<(String, HeaderMap, Buffer, Option<HeaderMap>)>,
    dirty_pools: Vec<PoolKey>,
}

/// The worker-backed [`RouterContext`].
struct WorkerCtx<'a> {
    snapshot: &'a SnapshotMap,
    clusters: &'a mut HashMap<String, WorkerCluster>,
    timers: &'a mut TimerQueue<TimerTask>,
    rng: &'a mut SmallRng,
    runtime: &'a Snapshot,
    local_zone: &'a str,
    control_tx: &'a Sender<ControlMsg>,
    upstreams: &'a mut Slab<UpstreamIo>,
    registry: &'a mio::Registry,
    local_replies: &'a HashMap<(u16, &'static str), Bytes>,

    token_base: usize,
    stream_id: StreamId,
    upstream_io: &'a mut Option<usize>,
    pool_key: &'a mut Option<PoolKey>,
    request_headers: &'a HeaderMap,
    codec: &'a mut ServerConnection,
    write_buf: &'a mut Buffer,
    effects: &'a mut Effects,
}

impl WorkerCtx<'_> {
    fn flush_codec(&mut self) {
        let pending = self.codec.take_pending_send();
        self.effects.bytes_sent += pending.len() as u64;
        self.write_buf.add_bytes(pending);
    }

    /// Run `f` on the attached upstream client's codec, then flush its
    /// wire bytes onto the socket buffer and refresh interest.
    fn with_upstream_codec<R>(
        &mut self,
        f: impl FnOnce(&mut protocol_http1::ClientConnection) -> R,
    ) -> Option<R> {
        let pool_key = self.pool_key.clone()?;
        let io_idx = (*self.upstream_io)?;
        let client = self.upstreams.get(io_idx)?.client;
        let cluster = self.clusters.get_mut(&pool_key.0)?;
        let pool = cluster.pools.get_mut(&(pool_key.1, pool_key.2))?;
        let pool_client = pool.client_mut(client)?;
        let result = f(&mut pool_client.codec);
        let pending = pool_client.codec.take_pending_send();
        if !pending.is_empty() {
            if let Some(io) = self.upstreams.get_mut(io_idx) {
                io.write_buf.add_bytes(pending);
                if io.connected {
                    let _ = io.write_buf.write_to(&mut io.socket);
                }
                let interest = if !io.connected || !io.write_buf.is_empty() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                let token = Token(self.token_base + io_idx * 2 + 1);
                let _ = self.registry.reregister(&mut io.socket, token, interest);
            }
        }
        Some(result)
    }
}

impl RouterContext for WorkerCtx<'_> {
    fn runtime(&self) -> &Snapshot {
        self.runtime
    }

    fn rng(&mut self) -> &mut SmallRng {
        self.rng
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_zone(&self) -> &str {
        self.local_zone
    }

    fn get_cluster(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.snapshot.get(name).map(|c| c.info.clone())
    }

    fn choose_host(&mut self, cluster: &str, ctx: &LbContext) -> Option<HostRef> {
        let snap = self.snapshot.get(cluster)?;
        let info = snap.info.clone();
        let hosts = snap.hosts.clone();
        let local = self.snapshot.local_hosts();
        let state = self
            .clusters
            .entry(cluster.to_string())
            .or_insert_with(|| WorkerCluster {
                balancer: Balancer::new(info.lb_policy),
                pools: HashMap::new(),
            });
        state
            .balancer
            .choose_host(&hosts, local.as_deref(), &info.stats, self.runtime, ctx, self.rng)
    }

    fn record_upstream_code(&mut self, cluster: &str, host: &HostRef, code: u16) {
        let Some(snap) = self.snapshot.get(cluster) else {
            return;
        };
        if host
            .outlier
            .put_response(code, snap.consecutive_5xx_threshold)
        {
            let _ = self.control_tx.send(ControlMsg::Consecutive5xx {
                cluster: cluster.to_string(),
                address: host.address(),
            });
        }
    }

    fn pool_new_stream(&mut self, cluster: &Arc<ClusterInfo>, host: &HostRef, priority: Priority) {
        let key: PoolKey = (cluster.name().to_string(), host.address(), priority);
        let state = self
            .clusters
            .entry(key.0.clone())
            .or_insert_with(|| WorkerCluster {
                balancer: Balancer::new(cluster.lb_policy),
                pools: HashMap::new(),
            });
        let pool = state
            .pools
            .entry((key.1, key.2))
            .or_insert_with(|| Http1Pool::new(host.clone(), cluster.clone(), priority));
        pool.new_stream(self.stream_id);
        *self.pool_key = Some(key.clone());
        self.effects.dirty_pools.push(key);
    }

    fn pool_cancel(&mut self) {
        let Some(key) = self.pool_key.clone() else {
            return;
        };
        if let Some(cluster) = self.clusters.get_mut(&key.0) {
            if let Some(pool) = cluster.pools.get_mut(&(key.1, key.2)) {
                pool.cancel(self.stream_id);
            }
        }
        self.effects.dirty_pools.push(key);
    }

    fn upstream_encode_headers(&mut self, headers: &HeaderMap, end_stream: bool) -> bool {
        self.with_upstream_codec(|codec| codec.encode_headers(headers, end_stream).is_ok())
            .unwrap_or(false)
    }

    fn upstream_encode_data(&mut self, data: &mut Buffer, end_stream: bool) {
        let bytes = data.to_vec();
        self.with_upstream_codec(|codec| codec.encode_data(&bytes, end_stream));
    }

    fn upstream_encode_trailers(&mut self, trailers: &HeaderMap) {
        self.with_upstream_codec(|codec| codec.encode_trailers(trailers));
    }

    fn upstream_reset(&mut self) {
        let Some(io_idx) = self.upstream_io.take() else {
            return;
        };
        let Some(key) = self.pool_key.clone() else {
            return;
        };
        let client = match self.upstreams.get(io_idx) {
            Some(io) => io.client,
            None => return,
        };
        if let Some(cluster) = self.clusters.get_mut(&key.0) {
            if let Some(pool) = cluster.pools.get_mut(&(key.1, key.2)) {
                pool.on_stream_reset(client);
            }
        }
        self.effects.dirty_pools.push(key);
    }

    fn arm_timer(&mut self, delay: Duration, timer: StreamTimer) -> TimerId {
        self.timers.schedule(
            Instant::now(),
            delay,
            TimerTask::Stream {
                id: self.stream_id,
                timer,
            },
        )
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    fn send_response_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        let mut headers = headers;
        edge::mutate_response_headers(&mut headers, self.request_headers);
        if self.codec.encode_headers(&headers, end_stream).is_err() {
            tracing::warn!("response encode failed; dropping stream output");
        }
        self.flush_codec();
    }

    fn send_response_data(&mut self, data: Buffer, end_stream: bool) {
        self.codec.encode_data(&data.to_vec(), end_stream);
        self.flush_codec();
    }

    fn send_response_trailers(&mut self, trailers: HeaderMap) {
        self.codec.encode_trailers(&trailers);
        self.flush_codec();
    }

    fn send_local_reply(&mut self, status: u16, body: &'static str) {
        match self.local_replies.get(&(status, body)) {
            Some(bytes) => self.codec.encode_raw_response(bytes),
            None => {
                let rendered = super::render_local_reply(status, body);
                self.codec.encode_raw_response(&rendered);
            }
        }
        self.flush_codec();
    }

    fn reset_downstream(&mut self) {
        self.effects.reset_downstream = true;
    }

    fn shadow(
        &mut self,
        cluster: String,
        headers: HeaderMap,
        body: Buffer,
        trailers: Option<HeaderMap>,
    ) {
        self.effects.shadows.push((cluster, headers, body, trailers));
    }
}
