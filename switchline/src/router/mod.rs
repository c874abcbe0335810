//! The router: terminal stream filter.
//!
//! Resolves a route and cluster for each request, obtains an upstream
//! stream from the worker's connection pool, forwards the request, pipes
//! the response back, and owns the failure semantics: timeouts, retries
//! with jittered backoff, shadowing, response flags, and stat charging.
//!
//! The router is a per-stream state machine. Everything it needs from its
//! worker (pools, timers, the downstream encoder path, cluster snapshots)
//! is reached through [`RouterContext`], so the whole lifecycle is
//! drivable from tests without sockets.

pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol_http1::{HeaderMap, InlineName};
use rand::rngs::SmallRng;

use crate::buffer::Buffer;
use crate::event::TimerId;
use crate::route::{RouteAction, RouteConfig, RouteEntry};
use crate::runtime::Snapshot;
use crate::stats::{Counter, Scope};
use crate::stream_info::{
    reset_reason_to_flag, RequestInfo, ResetReason, ResponseFlag, StreamId,
};
use crate::upstream::{ClusterInfo, HostRef, LbContext, PoolFailure, Priority, StatCounter};
use retry::{RetryDecision, RetryState};

const NO_HEALTHY_UPSTREAM_BODY: &str = "no healthy upstream";
const MAINTENANCE_MODE_BODY: &str = "maintenance mode";
const TIMEOUT_BODY: &str = "upstream request timeout";
const CONNECT_ERROR_BODY: &str = "upstream connect error or disconnect/reset before headers";

/// Stream-scoped timers the router arms through its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTimer {
    GlobalTimeout,
    PerTryTimeout,
    RetryBackoff,
}

/// Everything the router needs from the worker that owns the stream.
pub trait RouterContext {
    fn runtime(&self) -> &Snapshot;
    fn rng(&mut self) -> &mut SmallRng;
    fn now(&self) -> Instant;
    fn local_zone(&self) -> &str;

    fn get_cluster(&self, name: &str) -> Option<Arc<ClusterInfo>>;
    fn choose_host(&mut self, cluster: &str, ctx: &LbContext) -> Option<HostRef>;
    /// Outlier accounting for an observed (or synthesized) response code.
    fn record_upstream_code(&mut self, cluster: &str, host: &HostRef, code: u16);

    /// Ask the cluster/host pool for an upstream stream. The outcome comes
    /// back through `on_pool_ready` / `on_pool_failure`.
    fn pool_new_stream(&mut self, cluster: &Arc<ClusterInfo>, host: &HostRef, priority: Priority);
    /// Cancel a pending pool request. Never invokes callbacks.
    fn pool_cancel(&mut self);
    /// Encode on the attached upstream client. Returns false on a codec
    /// error, which the router treats as a local reset of the attempt.
    fn upstream_encode_headers(&mut self, headers: &HeaderMap, end_stream: bool) -> bool;
    fn upstream_encode_data(&mut self, data: &mut Buffer, end_stream: bool);
    fn upstream_encode_trailers(&mut self, trailers: &HeaderMap);
    /// Reset the attached upstream stream.
    fn upstream_reset(&mut self);

    fn arm_timer(&mut self, delay: Duration, timer: StreamTimer) -> TimerId;
    fn cancel_timer(&mut self, id: TimerId);

    /// Response path downstream, through the encoder filter chain.
    fn send_response_headers(&mut self, headers: HeaderMap, end_stream: bool);
    fn send_response_data(&mut self, data: Buffer, end_stream: bool);
    fn send_response_trailers(&mut self, trailers: HeaderMap);
    /// Byte-literal local reply (preallocated; never allocates here).
    fn send_local_reply(&mut self, status: u16, body: &'static str);
    fn reset_downstream(&mut self);

    /// Mirror the request to `cluster`; the response is discarded.
    fn shadow(
        &mut self,
        cluster: String,
        headers: HeaderMap,
        body: Buffer,
        trailers: Option<HeaderMap>,
    );
}

/// Router-level stats, one set per listener scope.
pub struct RouterStats {
    pub rq_total: Counter,
    pub no_route: Counter,
    pub no_cluster: Counter,
    pub rq_redirect: Counter,
}

impl RouterStats {
    pub fn new(scope: &Scope) -> RouterStats {
        RouterStats {
            rq_total: scope.counter("rq_total"),
            no_route: scope.counter("no_route"),
            no_cluster: scope.counter("no_cluster"),
            rq_redirect: scope.counter("rq_redirect"),
        }
    }
}

/// Shared router configuration for one listener.
pub struct RouterConfig {
    pub route_config: Arc<RouteConfig>,
    pub stats: RouterStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetKind {
    Reset,
    PerTryTimeout,
    GlobalTimeout,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timeouts {
    global: Duration,
    per_try: Duration,
}

/// Per-stream router state machine.
pub struct Router {
    config: Arc<RouterConfig>,
    stream_id: StreamId,
    pub info: RequestInfo,

    route_entry: Option<Arc<RouteEntry>>,
    cluster: Option<Arc<ClusterInfo>>,
    vcluster: Option<String>,
    lb_hash: Option<u64>,

    headers: HeaderMap,
    trailers: Option<HeaderMap>,
    /// Full body copy kept while retries or shadowing are possible.
    retry_copy: Buffer,
    /// Body awaiting an attached upstream encoder.
    pending_upstream: Buffer,
    buffering: bool,

    retry_state: Option<RetryState>,
    do_shadowing: bool,
    timeouts: Timeouts,
    timeout_response_code: u16,

    global_timer: Option<TimerId>,
    per_try_timer: Option<TimerId>,
    retry_timer: Option<TimerId>,

    upstream_pending: bool,
    upstream_attached: bool,
    encode_complete: bool,
    downstream_end: bool,
    response_started: bool,
    request_complete_time: Option<Instant>,
    upstream_canary: bool,
    internal_request: bool,
    completed: bool,
}

impl Router {
    pub fn new(config: Arc<RouterConfig>, stream_id: StreamId, now: Instant) -> Router {
        Router {
            config,
            stream_id,
            info: RequestInfo::new(now),
            route_entry: None,
            cluster: None,
            vcluster: None,
            lb_hash: None,
            headers: HeaderMap::new(),
            trailers: None,
            retry_copy: Buffer::new(),
            pending_upstream: Buffer::new(),
            buffering: false,
            retry_state: None,
            do_shadowing: false,
            timeouts: Timeouts::default(),
            timeout_response_code: 504,
            global_timer: None,
            per_try_timer: None,
            retry_timer: None,
            upstream_pending: false,
            upstream_attached: false,
            encode_complete: false,
            downstream_end: false,
            response_started: false,
            request_complete_time: None,
            upstream_canary: false,
            internal_request: false,
            completed: false,
        }
    }

    /// Whether the stream has reached a terminal state.
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Whether the current attempt's request was fully encoded upstream.
    pub fn upstream_encode_complete(&self) -> bool {
        self.encode_complete
    }

    pub fn upstream_host(&self) -> Option<&HostRef> {
        self.info.upstream_host.as_ref()
    }

    // ── Decode path (request direction) ─────────────────────────────

    pub fn decode_headers(
        &mut self,
        ctx: &mut dyn RouterContext,
        mut headers: HeaderMap,
        end_stream: bool,
    ) {
        self.config.stats.rq_total.increment();
        self.downstream_end = end_stream;
        self.internal_request =
            headers.get_inline(InlineName::EnvoyInternal) == Some("true");
        if !self.internal_request {
            for name in &self.config.route_config.internal_only_headers {
                headers.remove(name);
            }
        }

        let Some(resolved) = self.config.route_config.route(&headers) else {
            self.config.stats.no_route.increment();
            tracing::debug!(
                path = headers.get_inline(InlineName::Path).unwrap_or(""),
                "no route match"
            );
            self.info.set_response_flag(ResponseFlag::NoRouteFound);
            self.reply(ctx, 404, "");
            return;
        };

        let entry = match &resolved.action {
            RouteAction::Redirect(redirect) => {
                self.config.stats.rq_redirect.increment();
                let location = redirect.new_path(&headers);
                let mut response = HeaderMap::new();
                response.set_inline(InlineName::Status, "301");
                response.insert("location", location);
                self.info.response_code = Some(301);
                self.completed = true;
                ctx.send_response_headers(response, true);
                return;
            }
            RouteAction::Route(entry) => Arc::new(entry.clone()),
        };

        let Some(cluster) = ctx.get_cluster(&entry.cluster) else {
            self.config.stats.no_cluster.increment();
            tracing::debug!(cluster = entry.cluster.as_str(), "unknown cluster");
            self.info.set_response_flag(ResponseFlag::NoClusterFound);
            self.reply(ctx, 404, "");
            return;
        };
        tracing::debug!(
            cluster = entry.cluster.as_str(),
            path = headers.get_inline(InlineName::Path).unwrap_or(""),
            "route matched"
        );

        self.vcluster = resolved
            .vhost
            .virtual_cluster(&headers)
            .map(|vc| vc.name.clone());
        self.cluster = Some(cluster.clone());

        let runtime = ctx.runtime().clone();
        if cluster.maintenance_mode(&runtime, ctx.rng()) {
            cluster.stats.upstream_rq_maintenance_mode.increment();
            self.info.set_response_flag(ResponseFlag::UpstreamOverflow);
            self.charge_upstream_code(ctx, 503, None);
            self.reply(ctx, 503, MAINTENANCE_MODE_BODY);
            return;
        }

        self.lb_hash = entry
            .hash_policy
            .as_ref()
            .and_then(|policy| policy.generate_hash(&headers));

        let Some(host) = ctx.choose_host(&entry.cluster, &LbContext { hash: self.lb_hash })
        else {
            self.send_no_healthy_upstream(ctx);
            return;
        };

        self.timeouts = final_timeout(&entry, &mut headers);
        if headers
            .remove_inline(InlineName::EnvoyUpstreamRqTimeoutAltResponse)
            .is_some()
        {
            self.timeout_response_code = 204;
        }

        entry.finalize_request_headers(&mut headers, &resolved.matcher);
        headers.set_inline(
            InlineName::Scheme,
            if cluster.tls { "https" } else { "http" },
        );

        self.retry_state = RetryState::create(
            &entry.retry_policy,
            &mut headers,
            cluster.clone(),
            entry.priority,
        );
        self.do_shadowing = should_shadow(ctx.runtime(), &entry, self.stream_id.0);
        self.buffering = self.retry_state.is_some() || self.do_shadowing;

        self.headers = headers;
        self.route_entry = Some(entry);

        self.start_upstream(ctx, host);
        if end_stream && !self.completed {
            self.on_request_complete(ctx);
        }
    }

    pub fn decode_data(&mut self, ctx: &mut dyn RouterContext, data: Buffer, end_stream: bool) {
        if self.completed {
            return;
        }
        self.downstream_end = end_stream;
        let mut data = data;
        if self.buffering {
            let mut copy = data.clone();
            self.retry_copy.move_from(&mut copy);
        }
        if self.upstream_attached {
            self.encode_complete = end_stream;
            ctx.upstream_encode_data(&mut data, end_stream);
        } else {
            self.pending_upstream.move_from(&mut data);
        }
        if end_stream {
            self.on_request_complete(ctx);
        }
    }

    pub fn decode_trailers(&mut self, ctx: &mut dyn RouterContext, trailers: HeaderMap) {
        if self.completed {
            return;
        }
        self.downstream_end = true;
        self.trailers = Some(trailers);
        if self.upstream_attached {
            self.encode_complete = true;
            let trailers = self.trailers.clone().expect("just set");
            ctx.upstream_encode_trailers(&trailers);
        }
        self.on_request_complete(ctx);
    }

    fn on_request_complete(&mut self, ctx: &mut dyn RouterContext) {
        self.request_complete_time = Some(ctx.now());
        if !(self.upstream_pending || self.upstream_attached) {
            return;
        }
        self.maybe_do_shadowing(ctx);
        self.arm_per_try_timer(ctx);
        if !self.timeouts.global.is_zero() {
            self.global_timer =
                Some(ctx.arm_timer(self.timeouts.global, StreamTimer::GlobalTimeout));
        }
    }

    // ── Upstream lifecycle ──────────────────────────────────────────

    pub fn on_pool_ready(&mut self, ctx: &mut dyn RouterContext) {
        tracing::debug!(stream = self.stream_id.0, "pool ready");
        self.upstream_pending = false;
        self.upstream_attached = true;

        if let (Some(entry), Some(host)) = (&self.route_entry, &self.info.upstream_host) {
            if entry.auto_host_rewrite && !host.hostname().is_empty() {
                self.headers
                    .set_inline(InlineName::Authority, host.hostname());
            }
        }

        let has_body = !self.pending_upstream.is_empty();
        let has_trailers = self.trailers.is_some();
        let headers_end = self.downstream_end && !has_body && !has_trailers;
        if !ctx.upstream_encode_headers(&self.headers, headers_end) {
            self.upstream_attached = false;
            self.handle_upstream_reset(ctx, ResetKind::Reset, Some(ResetReason::LocalReset));
            return;
        }
        if has_body {
            let mut body = std::mem::take(&mut self.pending_upstream);
            ctx.upstream_encode_data(&mut body, self.downstream_end && !has_trailers);
        }
        if self.downstream_end {
            if let Some(trailers) = self.trailers.clone() {
                ctx.upstream_encode_trailers(&trailers);
            }
            self.encode_complete = true;
        }
    }

    pub fn on_pool_failure(
        &mut self,
        ctx: &mut dyn RouterContext,
        reason: PoolFailure,
        host: Option<HostRef>,
    ) {
        self.upstream_pending = false;
        if let Some(host) = host {
            self.info.upstream_host = Some(host);
        }
        let reset_reason = match reason {
            PoolFailure::Overflow => ResetReason::Overflow,
            PoolFailure::ConnectionFailure => ResetReason::ConnectionFailure,
        };
        self.handle_upstream_reset(ctx, ResetKind::Reset, Some(reset_reason));
    }

    pub fn on_upstream_headers(
        &mut self,
        ctx: &mut dyn RouterContext,
        mut headers: HeaderMap,
        end_stream: bool,
    ) {
        tracing::debug!(stream = self.stream_id.0, end_stream, "upstream headers");
        let status: u16 = headers
            .get_inline(InlineName::Status)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        if let (Some(cluster), Some(host)) = (&self.cluster, &self.info.upstream_host) {
            let cluster = cluster.name().to_string();
            let host = host.clone();
            ctx.record_upstream_code(&cluster, &host, status);
        }

        if self.retry_state.is_some() && self.downstream_end && !self.response_started {
            let decision = {
                let runtime = ctx.runtime().clone();
                let state = self.retry_state.as_mut().expect("checked");
                state.should_retry(Some(status), None, &runtime, ctx.rng())
            };
            if let RetryDecision::RetryScheduled(delay) = decision {
                if let Some(cluster) = &self.cluster {
                    charge_basic_code(cluster.stats_scope(), "retry.", status);
                }
                if !end_stream {
                    self.detach_upstream(ctx);
                } else {
                    // Response complete; the client recycles normally.
                    self.upstream_attached = false;
                    self.cancel_per_try_timer(ctx);
                }
                self.retry_timer = Some(ctx.arm_timer(delay, StreamTimer::RetryBackoff));
                return;
            }
        }
        if let Some(state) = &mut self.retry_state {
            state.reset();
        }
        self.retry_state = None;

        if let Some(complete_at) = self.request_complete_time {
            let service_time = ctx.now().duration_since(complete_at);
            headers.set_inline(
                InlineName::EnvoyUpstreamServiceTime,
                service_time.as_millis().to_string(),
            );
        }

        for name in &self.config.route_config.response_headers_to_remove {
            headers.remove(name);
        }
        for (name, value) in &self.config.route_config.response_headers_to_add {
            headers.insert(name, value.clone());
        }

        self.upstream_canary = headers.get_inline(InlineName::EnvoyUpstreamCanary)
            == Some("true")
            || self
                .info
                .upstream_host
                .as_ref()
                .map(|h| h.canary())
                .unwrap_or(false);
        let host = self.info.upstream_host.clone();
        self.charge_upstream_code(ctx, status, host.as_ref());

        self.info.response_code = Some(status);
        self.response_started = true;
        if end_stream {
            self.on_upstream_complete(ctx);
        }
        ctx.send_response_headers(headers, end_stream);
    }

    pub fn on_upstream_data(
        &mut self,
        ctx: &mut dyn RouterContext,
        data: Buffer,
        end_stream: bool,
    ) {
        if end_stream {
            self.on_upstream_complete(ctx);
        }
        ctx.send_response_data(data, end_stream);
    }

    pub fn on_upstream_trailers(&mut self, ctx: &mut dyn RouterContext, trailers: HeaderMap) {
        self.on_upstream_complete(ctx);
        ctx.send_response_trailers(trailers);
    }

    pub fn on_upstream_reset(&mut self, ctx: &mut dyn RouterContext, reason: ResetReason) {
        tracing::debug!(stream = self.stream_id.0, ?reason, "upstream reset");
        self.upstream_attached = false;
        self.handle_upstream_reset(ctx, ResetKind::Reset, Some(reason));
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub fn on_global_timeout(&mut self, ctx: &mut dyn RouterContext) {
        tracing::debug!(stream = self.stream_id.0, "global request timeout");
        self.global_timer = None;
        if let Some(cluster) = &self.cluster {
            cluster.stats.upstream_rq_timeout.increment();
        }
        if let Some(host) = &self.info.upstream_host {
            if self.upstream_pending || self.upstream_attached {
                host.stats.rq_timeout.inc();
            }
        }
        self.detach_upstream(ctx);
        self.handle_upstream_reset(ctx, ResetKind::GlobalTimeout, None);
    }

    pub fn on_per_try_timeout(&mut self, ctx: &mut dyn RouterContext) {
        tracing::debug!(stream = self.stream_id.0, "per-try timeout");
        self.per_try_timer = None;
        if let Some(cluster) = &self.cluster {
            cluster.stats.upstream_rq_per_try_timeout.increment();
        }
        if let Some(host) = &self.info.upstream_host {
            host.stats.rq_timeout.inc();
        }
        self.detach_upstream(ctx);
        self.handle_upstream_reset(ctx, ResetKind::PerTryTimeout, Some(ResetReason::LocalReset));
    }

    /// Backoff elapsed: re-enter host selection with the finalized headers
    /// and the buffered body.
    pub fn on_retry_timer(&mut self, ctx: &mut dyn RouterContext) {
        tracing::debug!(stream = self.stream_id.0, "retrying upstream request");
        self.retry_timer = None;
        let Some(entry) = self.route_entry.clone() else {
            return;
        };
        let Some(host) = ctx.choose_host(&entry.cluster, &LbContext { hash: self.lb_hash })
        else {
            self.send_no_healthy_upstream(ctx);
            self.cleanup(ctx);
            return;
        };
        self.pending_upstream = self.retry_copy.clone();
        self.encode_complete = false;
        self.start_upstream(ctx, host);
        self.arm_per_try_timer(ctx);
    }

    /// Downstream went away: tear down upstream resources and timers.
    pub fn on_downstream_reset(&mut self, ctx: &mut dyn RouterContext) {
        self.detach_upstream(ctx);
        self.cleanup(ctx);
        self.completed = true;
    }

    // ── Internals ───────────────────────────────────────────────────

    fn start_upstream(&mut self, ctx: &mut dyn RouterContext, host: HostRef) {
        let cluster = self.cluster.clone().expect("cluster resolved");
        let priority = self
            .route_entry
            .as_ref()
            .map(|e| e.priority)
            .unwrap_or_default();
        self.info.upstream_host = Some(host.clone());
        self.upstream_pending = true;
        ctx.pool_new_stream(&cluster, &host, priority);
    }

    fn arm_per_try_timer(&mut self, ctx: &mut dyn RouterContext) {
        if !self.timeouts.per_try.is_zero() && self.per_try_timer.is_none() {
            self.per_try_timer =
                Some(ctx.arm_timer(self.timeouts.per_try, StreamTimer::PerTryTimeout));
        }
    }

    fn cancel_per_try_timer(&mut self, ctx: &mut dyn RouterContext) {
        if let Some(id) = self.per_try_timer.take() {
            ctx.cancel_timer(id);
        }
    }

    fn detach_upstream(&mut self, ctx: &mut dyn RouterContext) {
        self.cancel_per_try_timer(ctx);
        if self.upstream_pending {
            self.upstream_pending = false;
            ctx.pool_cancel();
        }
        if self.upstream_attached {
            self.upstream_attached = false;
            ctx.upstream_reset();
        }
    }

    fn handle_upstream_reset(
        &mut self,
        ctx: &mut dyn RouterContext,
        kind: ResetKind,
        reason: Option<ResetReason>,
    ) {
        if let (Some(cluster), Some(host)) = (&self.cluster, &self.info.upstream_host) {
            let code = if kind == ResetKind::Reset {
                503
            } else {
                self.timeout_response_code
            };
            let cluster = cluster.name().to_string();
            let host = host.clone();
            ctx.record_upstream_code(&cluster, &host, code);
        }

        // Retries never span a global timeout or a started response, and
        // only fire once the downstream request is complete.
        if kind != ResetKind::GlobalTimeout
            && !self.response_started
            && self.downstream_end
            && self.retry_state.is_some()
        {
            let decision = {
                let runtime = ctx.runtime().clone();
                let state = self.retry_state.as_mut().expect("checked");
                state.should_retry(None, reason, &runtime, ctx.rng())
            };
            if let RetryDecision::RetryScheduled(delay) = decision {
                self.cancel_per_try_timer(ctx);
                self.retry_timer = Some(ctx.arm_timer(delay, StreamTimer::RetryBackoff));
                return;
            }
        }

        let host = self.info.upstream_host.clone();
        self.cleanup(ctx);
        if self.response_started {
            ctx.reset_downstream();
            self.completed = true;
            return;
        }

        let (code, body): (u16, &'static str) = match kind {
            ResetKind::GlobalTimeout | ResetKind::PerTryTimeout => {
                self.info
                    .set_response_flag(ResponseFlag::UpstreamRequestTimeout);
                let code = self.timeout_response_code;
                (code, if code == 504 { TIMEOUT_BODY } else { "" })
            }
            ResetKind::Reset => {
                let reason = reason.expect("reset carries a reason");
                self.info.set_response_flag(reset_reason_to_flag(reason));
                (503, CONNECT_ERROR_BODY)
            }
        };
        self.charge_upstream_code(ctx, code, host.as_ref());
        self.reply(ctx, code, body);
    }

    fn on_upstream_complete(&mut self, ctx: &mut dyn RouterContext) {
        self.upstream_attached = false;
        if let (Some(cluster), Some(complete_at)) = (&self.cluster, self.request_complete_time) {
            let elapsed = ctx.now().duration_since(complete_at);
            cluster.stats.upstream_rq_time.record(elapsed.as_millis() as u64);
        }
        self.cleanup(ctx);
        self.completed = true;
    }

    fn cleanup(&mut self, ctx: &mut dyn RouterContext) {
        if let Some(id) = self.global_timer.take() {
            ctx.cancel_timer(id);
        }
        self.cancel_per_try_timer(ctx);
        if let Some(id) = self.retry_timer.take() {
            ctx.cancel_timer(id);
        }
        if let Some(state) = &mut self.retry_state {
            state.reset();
        }
        self.retry_state = None;
    }

    fn maybe_do_shadowing(&mut self, ctx: &mut dyn RouterContext) {
        if !self.do_shadowing {
            return;
        }
        let Some(policy) = self
            .route_entry
            .as_ref()
            .and_then(|e| e.shadow_policy.clone())
        else {
            return;
        };
        ctx.shadow(
            policy.cluster,
            self.headers.clone(),
            self.retry_copy.clone(),
            self.trailers.clone(),
        );
    }

    fn send_no_healthy_upstream(&mut self, ctx: &mut dyn RouterContext) {
        self.info.set_response_flag(ResponseFlag::NoHealthyUpstream);
        self.charge_upstream_code(ctx, 503, None);
        self.reply(ctx, 503, NO_HEALTHY_UPSTREAM_BODY);
    }

    fn reply(&mut self, ctx: &mut dyn RouterContext, status: u16, body: &'static str) {
        self.info.response_code = Some(status);
        self.completed = true;
        ctx.send_local_reply(status, body);
    }

    /// Cluster-scoped response code stats: base, internal/external,
    /// canary, zone-sliced, and virtual-cluster copies.
    fn charge_upstream_code(
        &self,
        ctx: &mut dyn RouterContext,
        code: u16,
        upstream_host: Option<&HostRef>,
    ) {
        let Some(cluster) = &self.cluster else {
            return;
        };
        let scope = cluster.stats_scope();
        let canary =
            self.upstream_canary || upstream_host.map(|h| h.canary()).unwrap_or(false);

        charge_basic_code(scope, "", code);
        charge_basic_code(
            scope,
            if self.internal_request {
                "internal."
            } else {
                "external."
            },
            code,
        );
        if canary {
            charge_basic_code(scope, "canary.", code);
        }
        if let Some(host) = upstream_host {
            let local_zone = ctx.local_zone();
            if !local_zone.is_empty() && !host.zone().is_empty() {
                charge_basic_code(scope, &format!("zone.{}.{}.", local_zone, host.zone()), code);
            }
        }
        if let Some(vcluster) = &self.vcluster {
            charge_basic_code(scope, &format!("vcluster.{vcluster}."), code);
        }
    }
}

/// `<prefix>upstream_rq_<class>xx` and `<prefix>upstream_rq_<code>`.
fn charge_basic_code(scope: &Scope, prefix: &str, code: u16) {
    let class = code / 100;
    scope
        .counter(&format!("{prefix}upstream_rq_{class}xx"))
        .increment();
    scope
        .counter(&format!("{prefix}upstream_rq_{code}"))
        .increment();
}

/// Compute effective timeouts from the route and the request's timeout
/// headers, stripping them and stamping the expected-timeout header.
fn final_timeout(entry: &RouteEntry, headers: &mut HeaderMap) -> Timeouts {
    let mut timeouts = Timeouts {
        global: entry.timeout,
        per_try: Duration::ZERO,
    };
    if let Some(value) = headers.remove_inline(InlineName::EnvoyUpstreamRqTimeoutMs) {
        if let Ok(ms) = value.parse::<u64>() {
            timeouts.global = Duration::from_millis(ms);
        }
    }
    if let Some(value) = headers.remove_inline(InlineName::EnvoyUpstreamRqPerTryTimeoutMs) {
        if let Ok(ms) = value.parse::<u64>() {
            timeouts.per_try = Duration::from_millis(ms);
        }
    }
    if timeouts.per_try >= timeouts.global && !timeouts.global.is_zero() {
        timeouts.per_try = Duration::ZERO;
    }

    let expected = if timeouts.per_try.is_zero() {
        timeouts.global
    } else {
        timeouts.per_try
    };
    if !expected.is_zero() {
        headers.set_inline(
            InlineName::EnvoyExpectedRqTimeoutMs,
            expected.as_millis().to_string(),
        );
    }
    timeouts
}

/// Shadow iff a mirror cluster is set and the runtime key (if any) admits
/// this request, sampled stably by stream id out of 10000.
fn should_shadow(runtime: &Snapshot, entry: &RouteEntry, stable_random: u64) -> bool {
    let Some(policy) = &entry.shadow_policy else {
        return false;
    };
    if policy.cluster.is_empty() {
        return false;
    }
    match &policy.runtime_key {
        Some(key) => runtime.feature_enabled_seeded(key, 0, stable_random, 10000),
        None => true,
    }
}

#[cfg(test)]
mod tests;
