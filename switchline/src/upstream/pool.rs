//! Per-worker HTTP/1.1 upstream connection pool.
//!
//! One pool per (worker, cluster, host). The pool is a state machine over
//! its clients: *connecting*, *ready* (idle, reusable), *busy* (one
//! attached request). Socket work is delegated to the worker through
//! [`PoolAction`]s: the pool decides, the worker performs, and feeds
//! connect/close/response outcomes back in.
//!
//! Every stream accepted by [`Http1Pool::new_stream`] produces exactly one
//! of `Ready`, `Failure`, or cancellation.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol_http1::ClientConnection;
use slab::Slab;

use crate::stream_info::StreamId;
use crate::upstream::cluster::{ClusterInfo, Priority};
use crate::upstream::host::{HostRef, StatCounter};

pub type ClientId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailure {
    /// The cluster's pending-request budget is exhausted.
    Overflow,
    /// The upstream connection could not be established.
    ConnectionFailure,
}

/// Work the pool asks its worker to perform.
#[derive(Debug)]
pub enum PoolAction {
    /// Open a socket to `address` and arm a connect timer.
    Connect {
        client: ClientId,
        address: SocketAddr,
        timeout: Duration,
    },
    /// Tear down the client's socket; the pool has already forgotten it.
    CloseClient { client: ClientId },
    /// The stream is attached to a client; encode the request now.
    Ready {
        stream: StreamId,
        client: ClientId,
        host: HostRef,
    },
    /// The stream cannot be served.
    Failure {
        stream: StreamId,
        reason: PoolFailure,
        host: Option<HostRef>,
    },
    /// Drain completed: every client has finished and closed.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Ready,
    Busy,
}

/// One pooled upstream codec client. The worker owns the socket; the pool
/// owns the codec and lifecycle state.
pub struct PoolClient {
    pub codec: ClientConnection,
    state: ClientState,
    remaining_requests: u64,
    attached: Option<StreamId>,
}

pub struct Http1Pool {
    host: HostRef,
    info: Arc<ClusterInfo>,
    priority: Priority,
    clients: Slab<PoolClient>,
    /// Pending streams; pushed front, served from the back (oldest first).
    pending: VecDeque<StreamId>,
    draining: bool,
    actions: VecDeque<PoolAction>,
}

impl Http1Pool {
    pub fn new(host: HostRef, info: Arc<ClusterInfo>, priority: Priority) -> Http1Pool {
        Http1Pool {
            host,
            info,
            priority,
            clients: Slab::new(),
            pending: VecDeque::new(),
            draining: false,
            actions: VecDeque::new(),
        }
    }

    pub fn host(&self) -> &HostRef {
        &self.host
    }

    /// Drain queued actions for the worker to execute.
    pub fn poll_action(&mut self) -> Option<PoolAction> {
        self.actions.pop_front()
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut PoolClient> {
        self.clients.get_mut(id)
    }

    pub fn attached_stream(&self, id: ClientId) -> Option<StreamId> {
        self.clients.get(id).and_then(|c| c.attached)
    }

    /// Whether any client or pending request remains.
    pub fn is_idle(&self) -> bool {
        self.clients.is_empty() && self.pending.is_empty()
    }

    /// Request an upstream stream. The outcome arrives as a queued
    /// [`PoolAction`]: `Ready` (possibly immediately), or `Failure` on
    /// budget overflow, or later `Failure` on connect failure.
    pub fn new_stream(&mut self, stream: StreamId) {
        if let Some(id) = self.find_client(ClientState::Ready) {
            self.attach(id, stream);
            return;
        }

        let info = self.info.clone();
        let resources = info.resources(self.priority);
        if resources.pending_requests.can_create() {
            let can_create_connection = resources.connections.can_create();
            if !can_create_connection {
                self.info.stats.upstream_cx_overflow.increment();
            }
            // With no connection at all, always start one so the queue
            // cannot starve.
            if self.clients.is_empty() || can_create_connection {
                self.create_connection();
            }
            resources.pending_requests.inc();
            self.info.stats.upstream_rq_pending_total.increment();
            self.info.stats.upstream_rq_pending_active.increment();
            self.pending.push_front(stream);
        } else {
            self.info.stats.upstream_rq_pending_overflow.increment();
            self.actions.push_back(PoolAction::Failure {
                stream,
                reason: PoolFailure::Overflow,
                host: None,
            });
        }
    }

    /// Remove a pending stream. Invokes no callbacks.
    pub fn cancel(&mut self, stream: StreamId) {
        if let Some(pos) = self.pending.iter().position(|&s| s == stream) {
            self.pending.remove(pos);
            self.pending_dropped();
            self.info.stats.upstream_rq_cancelled.increment();
            self.check_for_drained();
        }
    }

    /// The attached stream went away (downstream reset). The connection
    /// state is unknowable mid-request, so the client is discarded.
    pub fn on_stream_reset(&mut self, id: ClientId) {
        if self.clients.contains(id) {
            self.detach(id);
            self.destroy_client(id);
            self.check_for_drained();
        }
    }

    /// Connect finished; bind the oldest pending stream if any.
    pub fn on_connect_success(&mut self, id: ClientId) {
        let client = &mut self.clients[id];
        debug_assert_eq!(client.state, ClientState::Connecting);
        client.state = ClientState::Ready;
        self.process_idle_client(id);
    }

    /// Connect failed or timed out: purge every pending stream so the
    /// router can decide what to do with each.
    pub fn on_connect_failure(&mut self, id: ClientId, timed_out: bool) {
        if timed_out {
            self.info.stats.upstream_cx_connect_timeout.increment();
        }
        self.info.stats.upstream_cx_connect_fail.increment();
        self.host.stats.cx_connect_fail.inc();
        self.destroy_client(id);

        // Purged into a temporary list: a retry that re-enters new_stream
        // during the callbacks must not be failed inline.
        let purge: Vec<StreamId> = self.pending.drain(..).collect();
        for stream in purge {
            self.pending_dropped();
            self.info.stats.upstream_rq_pending_failure_eject.increment();
            self.actions.push_back(PoolAction::Failure {
                stream,
                reason: PoolFailure::ConnectionFailure,
                host: Some(self.host.clone()),
            });
        }
        self.check_for_drained();
    }

    /// An established client's socket closed.
    pub fn on_client_closed(&mut self, id: ClientId) {
        if !self.clients.contains(id) {
            return;
        }
        match self.clients[id].state {
            ClientState::Connecting => {
                self.on_connect_failure(id, false);
                return;
            }
            ClientState::Busy => {
                self.info.stats.upstream_cx_destroy_with_active_rq.increment();
                self.detach(id);
            }
            ClientState::Ready => {}
        }
        self.destroy_client(id);

        // A lost connection with work still queued warrants a replacement.
        if self.pending.len() > self.clients.len() {
            self.create_connection();
        }
        self.check_for_drained();
    }

    /// A response completed on `id`. `request_complete` says whether the
    /// request was fully encoded; a response that beat the request means
    /// the connection cannot be reused.
    pub fn on_response_complete(&mut self, id: ClientId, request_complete: bool) {
        let saw_close = self.clients[id].codec.saw_close_header();
        if !request_complete {
            self.detach(id);
            self.destroy_client(id);
        } else if saw_close {
            self.info.stats.upstream_cx_close_header.increment();
            self.detach(id);
            self.destroy_client(id);
        } else if self.exhausted_request_allowance(id) {
            self.info.stats.upstream_cx_max_requests.increment();
            self.detach(id);
            self.destroy_client(id);
        } else {
            self.detach(id);
            self.clients[id].state = ClientState::Ready;
            self.process_idle_client(id);
        }
        self.check_for_drained();
    }

    /// Register intent to drain: no new requests are placed on existing
    /// clients, and `Drained` fires once the pool is empty of work.
    pub fn start_drain(&mut self) {
        self.draining = true;
        self.check_for_drained();
    }

    fn exhausted_request_allowance(&mut self, id: ClientId) -> bool {
        let client = &mut self.clients[id];
        if client.remaining_requests == 0 {
            // Unlimited.
            return false;
        }
        client.remaining_requests -= 1;
        client.remaining_requests == 0
    }

    fn find_client(&self, state: ClientState) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, c)| c.state == state)
            .map(|(id, _)| id)
    }

    fn create_connection(&mut self) {
        tracing::debug!(host = %self.host.address(), "creating a new connection");
        let id = self.clients.insert(PoolClient {
            codec: ClientConnection::new(),
            state: ClientState::Connecting,
            remaining_requests: self.info.max_requests_per_connection,
            attached: None,
        });
        self.info.resources(self.priority).connections.inc();
        self.info.stats.upstream_cx_total.increment();
        self.info.stats.upstream_cx_active.increment();
        self.host.stats.cx_total.inc();
        self.host.stats.cx_active.inc();
        self.actions.push_back(PoolAction::Connect {
            client: id,
            address: self.host.address(),
            timeout: self.info.connect_timeout,
        });
    }

    fn destroy_client(&mut self, id: ClientId) {
        debug_assert!(self.clients[id].attached.is_none());
        self.clients.remove(id);
        self.info.resources(self.priority).connections.dec();
        self.info.stats.upstream_cx_active.decrement();
        self.host.stats.cx_active.dec();
        self.actions.push_back(PoolAction::CloseClient { client: id });
    }

    fn attach(&mut self, id: ClientId, stream: StreamId) {
        let client = &mut self.clients[id];
        debug_assert_eq!(client.state, ClientState::Ready);
        client.state = ClientState::Busy;
        client.attached = Some(stream);
        self.info.stats.upstream_rq_total.increment();
        self.info.stats.upstream_rq_active.increment();
        self.host.stats.rq_total.inc();
        self.host.stats.rq_active.inc();
        self.actions.push_back(PoolAction::Ready {
            stream,
            client: id,
            host: self.host.clone(),
        });
    }

    fn detach(&mut self, id: ClientId) {
        let client = &mut self.clients[id];
        if client.attached.take().is_some() {
            self.info.stats.upstream_rq_active.decrement();
            self.host.stats.rq_active.dec();
        }
    }

    fn process_idle_client(&mut self, id: ClientId) {
        if self.draining {
            self.destroy_client(id);
            return;
        }
        if let Some(stream) = self.pending.pop_back() {
            self.pending_dropped();
            self.attach(id, stream);
        }
    }

    fn pending_dropped(&mut self) {
        self.info.stats.upstream_rq_pending_active.decrement();
        self.info.resources(self.priority).pending_requests.dec();
    }

    fn check_for_drained(&mut self) {
        if !self.draining || !self.pending.is_empty() {
            return;
        }
        // Connecting clients count as outstanding work.
        if self.clients.iter().any(|(_, c)| c.state != ClientState::Ready) {
            return;
        }
        let idle: Vec<ClientId> = self.clients.iter().map(|(id, _)| id).collect();
        for id in idle {
            self.destroy_client(id);
        }
        self.actions.push_back(PoolAction::Drained);
    }
}
