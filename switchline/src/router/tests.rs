//! Router lifecycle tests driven through a scripted context: scripted
//! host selection, manual timers, recorded upstream encodes and
//! downstream responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol_http1::{HeaderMap, InlineName};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::*;
use crate::event::TimerQueue;
use crate::route::{
    HashPolicy, RetryPolicy, Route, RouteConfig, RouteEntry, RouteMatch, ShadowPolicy,
    VirtualHost,
};
use crate::stats::Store;
use crate::upstream::{ClusterInfo, Host, LbPolicy};

#[derive(Debug, PartialEq, Eq)]
enum Sent {
    Headers { status: u16, end_stream: bool },
    Data { body: Vec<u8>, end_stream: bool },
    Trailers,
    LocalReply { status: u16, body: String },
    Reset,
}

struct MockCtx {
    runtime: Snapshot,
    rng: SmallRng,
    now: Instant,
    local_zone: String,
    clusters: HashMap<String, Arc<ClusterInfo>>,
    hosts: HashMap<String, Vec<HostRef>>,
    rr: usize,

    timers: TimerQueue<StreamTimer>,
    pool_requests: Vec<HostRef>,
    pool_cancels: usize,
    upstream_resets: usize,
    encoded_headers: Vec<(HeaderMap, bool)>,
    encoded_body: Vec<(Vec<u8>, bool)>,
    encoded_trailers: usize,
    sent: Vec<Sent>,
    shadows: Vec<(String, HeaderMap, Vec<u8>, Option<HeaderMap>)>,
    outlier_codes: Vec<(String, u16)>,
}

impl MockCtx {
    fn new(runtime: Snapshot) -> MockCtx {
        MockCtx {
            runtime,
            rng: SmallRng::seed_from_u64(9),
            now: Instant::now(),
            local_zone: "local".into(),
            clusters: HashMap::new(),
            hosts: HashMap::new(),
            rr: 0,
            timers: TimerQueue::new(),
            pool_requests: Vec::new(),
            pool_cancels: 0,
            upstream_resets: 0,
            encoded_headers: Vec::new(),
            encoded_body: Vec::new(),
            encoded_trailers: 0,
            sent: Vec::new(),
            shadows: Vec::new(),
            outlier_codes: Vec::new(),
        }
    }

    /// Advance the clock and fire every timer that expired, in order.
    fn advance(&mut self, by: Duration) -> Vec<StreamTimer> {
        self.now += by;
        let mut fired = Vec::new();
        while let Some(timer) = self.timers.pop_expired(self.now) {
            fired.push(timer);
        }
        fired
    }
}

impl RouterContext for MockCtx {
    fn runtime(&self) -> &Snapshot {
        &self.runtime
    }
    fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
    fn now(&self) -> Instant {
        self.now
    }
    fn local_zone(&self) -> &str {
        &self.local_zone
    }

    fn get_cluster(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(name).cloned()
    }

    fn choose_host(&mut self, cluster: &str, _ctx: &LbContext) -> Option<HostRef> {
        let hosts = self.hosts.get(cluster)?;
        if hosts.is_empty() {
            return None;
        }
        let host = hosts[self.rr % hosts.len()].clone();
        self.rr += 1;
        Some(host)
    }

    fn record_upstream_code(&mut self, cluster: &str, _host: &HostRef, code: u16) {
        self.outlier_codes.push((cluster.to_string(), code));
    }

    fn pool_new_stream(
        &mut self,
        _cluster: &Arc<ClusterInfo>,
        host: &HostRef,
        _priority: Priority,
    ) {
        self.pool_requests.push(host.clone());
    }

    fn pool_cancel(&mut self) {
        self.pool_cancels += 1;
    }

    fn upstream_encode_headers(&mut self, headers: &HeaderMap, end_stream: bool) -> bool {
        self.encoded_headers.push((headers.clone(), end_stream));
        true
    }

    fn upstream_encode_data(&mut self, data: &mut Buffer, end_stream: bool) {
        self.encoded_body.push((data.to_vec(), end_stream));
    }

    fn upstream_encode_trailers(&mut self, _trailers: &HeaderMap) {
        self.encoded_trailers += 1;
    }

    fn upstream_reset(&mut self) {
        self.upstream_resets += 1;
    }

    fn arm_timer(&mut self, delay: Duration, timer: StreamTimer) -> TimerId {
        self.timers.schedule(self.now, delay, timer)
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    fn send_response_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        let status = headers
            .get_inline(InlineName::Status)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.sent.push(Sent::Headers { status, end_stream });
    }

    fn send_response_data(&mut self, data: Buffer, end_stream: bool) {
        self.sent.push(Sent::Data {
            body: data.to_vec(),
            end_stream,
        });
    }

    fn send_response_trailers(&mut self, _trailers: HeaderMap) {
        self.sent.push(Sent::Trailers);
    }

    fn send_local_reply(&mut self, status: u16, body: &'static str) {
        self.sent.push(Sent::LocalReply {
            status,
            body: body.to_string(),
        });
    }

    fn reset_downstream(&mut self) {
        self.sent.push(Sent::Reset);
    }

    fn shadow(
        &mut self,
        cluster: String,
        headers: HeaderMap,
        body: Buffer,
        trailers: Option<HeaderMap>,
    ) {
        self.shadows.push((cluster, headers, body.to_vec(), trailers));
    }
}

struct Harness {
    store: Store,
    config: Arc<RouterConfig>,
    ctx: MockCtx,
}

fn harness_with(entry: RouteEntry, runtime: Snapshot) -> Harness {
    let store = Store::new();
    let cluster_name = entry.cluster.clone();
    let route_config = RouteConfig::new(vec![VirtualHost {
        name: "vh".into(),
        domains: vec!["*".into()],
        routes: vec![Route {
            matcher: RouteMatch::Prefix("/".into()),
            action: RouteAction::Route(entry),
        }],
        virtual_clusters: Vec::new(),
    }]);
    let config = Arc::new(RouterConfig {
        route_config: Arc::new(route_config),
        stats: RouterStats::new(&store.scope("http.main")),
    });

    let mut ctx = MockCtx::new(runtime);
    let info = ClusterInfo::new(
        cluster_name.clone(),
        Duration::from_millis(250),
        LbPolicy::RoundRobin,
        0,
        false,
        &HashMap::new(),
        &store.root(),
    );
    let host = Host::new("10.9.0.1:80".parse().unwrap(), "backend-1", "remote", false, 1);
    ctx.clusters.insert(cluster_name.clone(), info);
    ctx.hosts.insert(cluster_name, vec![host]);

    Harness { store, config, ctx }
}

fn harness(entry: RouteEntry) -> Harness {
    harness_with(entry, Snapshot::default())
}

fn request(extra: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.set_inline(InlineName::Method, "GET");
    headers.set_inline(InlineName::Path, "/x");
    headers.set_inline(InlineName::Authority, "h");
    for (name, value) in extra {
        headers.insert(name, *value);
    }
    headers
}

fn response(status: u16) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.set_inline(InlineName::Status, status.to_string());
    headers
}

fn entry(cluster: &str) -> RouteEntry {
    RouteEntry {
        cluster: cluster.into(),
        timeout: Duration::from_millis(1000),
        ..RouteEntry::default()
    }
}

fn router(h: &Harness) -> Router {
    Router::new(h.config.clone(), StreamId(1), h.ctx.now)
}

fn counter(h: &Harness, cluster: &str, name: &str) -> u64 {
    h.store
        .scope(&format!("cluster.{cluster}"))
        .counter(name)
        .value()
}

#[test]
fn happy_path_forwards_response() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);

    r.decode_headers(&mut h.ctx, request(&[]), true);
    assert_eq!(h.ctx.pool_requests.len(), 1);
    r.on_pool_ready(&mut h.ctx);
    let (encoded, end) = &h.ctx.encoded_headers[0];
    assert!(*end);
    assert_eq!(encoded.get_inline(InlineName::Scheme), Some("http"));
    assert_eq!(
        encoded.get_inline(InlineName::EnvoyExpectedRqTimeoutMs),
        Some("1000")
    );

    r.on_upstream_headers(&mut h.ctx, response(200), false);
    let mut body = Buffer::new();
    body.add(b"abc");
    r.on_upstream_data(&mut h.ctx, body, true);

    assert!(r.completed());
    assert_eq!(
        h.ctx.sent,
        vec![
            Sent::Headers {
                status: 200,
                end_stream: false
            },
            Sent::Data {
                body: b"abc".to_vec(),
                end_stream: true
            },
        ]
    );
    assert_eq!(counter(&h, "c", "upstream_rq_200"), 1);
    assert_eq!(counter(&h, "c", "upstream_rq_2xx"), 1);
    assert_eq!(r.info.response_code, Some(200));
    // Timers were armed and cleaned up.
    assert!(h.ctx.timers.is_empty());
}

#[test]
fn no_route_is_404_with_flag() {
    let store = Store::new();
    let config = Arc::new(RouterConfig {
        route_config: Arc::new(RouteConfig::new(Vec::new())),
        stats: RouterStats::new(&store.scope("http.main")),
    });
    let mut ctx = MockCtx::new(Snapshot::default());
    let mut r = Router::new(config, StreamId(1), ctx.now);

    r.decode_headers(&mut ctx, request(&[]), true);
    assert_eq!(
        ctx.sent,
        vec![Sent::LocalReply {
            status: 404,
            body: String::new()
        }]
    );
    assert!(r.info.has_response_flag(ResponseFlag::NoRouteFound));
}

#[test]
fn unknown_cluster_flagged() {
    let mut h = harness(entry("c"));
    h.ctx.clusters.clear();
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    assert!(r.info.has_response_flag(ResponseFlag::NoClusterFound));
    assert!(matches!(h.ctx.sent[0], Sent::LocalReply { status: 404, .. }));
}

#[test]
fn no_healthy_upstream_is_503() {
    let mut h = harness(entry("c"));
    h.ctx.hosts.get_mut("c").unwrap().clear();
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    assert!(r.info.has_response_flag(ResponseFlag::NoHealthyUpstream));
    assert_eq!(
        h.ctx.sent,
        vec![Sent::LocalReply {
            status: 503,
            body: "no healthy upstream".into()
        }]
    );
    assert_eq!(counter(&h, "c", "upstream_rq_503"), 1);
}

#[test]
fn maintenance_mode_is_503_overflow() {
    let runtime = Snapshot::new(HashMap::from([(
        "upstream.maintenance_mode.c".to_string(),
        100u64,
    )]));
    let mut h = harness_with(entry("c"), runtime);
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    assert!(r.info.has_response_flag(ResponseFlag::UpstreamOverflow));
    assert!(
        matches!(&h.ctx.sent[0], Sent::LocalReply { status: 503, body } if body == "maintenance mode")
    );
    assert_eq!(counter(&h, "c", "upstream_rq_maintenance_mode"), 1);
}

#[test]
fn retry_on_5xx_then_success() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);

    r.decode_headers(
        &mut h.ctx,
        request(&[("x-envoy-retry-on", "5xx"), ("x-envoy-max-retries", "1")]),
        true,
    );
    r.on_pool_ready(&mut h.ctx);
    // Retry headers were stripped from the upstream request.
    assert_eq!(
        h.ctx.encoded_headers[0].0.get_inline(InlineName::EnvoyRetryOn),
        None
    );

    r.on_upstream_headers(&mut h.ctx, response(503), true);
    // Nothing went downstream; a backoff timer is armed instead.
    assert!(h.ctx.sent.is_empty());
    let fired = h.ctx.advance(Duration::from_millis(100));
    assert_eq!(fired, vec![StreamTimer::RetryBackoff]);
    r.on_retry_timer(&mut h.ctx);
    assert_eq!(h.ctx.pool_requests.len(), 2);

    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(200), true);
    assert_eq!(
        h.ctx.sent,
        vec![Sent::Headers {
            status: 200,
            end_stream: true
        }]
    );
    assert_eq!(counter(&h, "c", "upstream_rq_503"), 0); // not charged: retried
    assert_eq!(counter(&h, "c", "retry.upstream_rq_503"), 1);
    assert_eq!(counter(&h, "c", "upstream_rq_200"), 1);
    assert_eq!(counter(&h, "c", "upstream_rq_retry"), 1);
    assert_eq!(counter(&h, "c", "upstream_rq_retry_success"), 1);
}

#[test]
fn retries_exhausted_forwards_5xx() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(
        &mut h.ctx,
        request(&[("x-envoy-retry-on", "5xx"), ("x-envoy-max-retries", "1")]),
        true,
    );
    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(503), true);
    h.ctx.advance(Duration::from_millis(100));
    r.on_retry_timer(&mut h.ctx);
    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(503), true);
    // Second 503 flows downstream.
    assert_eq!(
        h.ctx.sent,
        vec![Sent::Headers {
            status: 503,
            end_stream: true
        }]
    );
}

#[test]
fn per_try_timeout_resets_attempt_and_retries() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(
        &mut h.ctx,
        request(&[
            ("x-envoy-retry-on", "5xx"),
            ("x-envoy-max-retries", "1"),
            ("x-envoy-upstream-rq-per-try-timeout-ms", "5"),
        ]),
        true,
    );
    r.on_pool_ready(&mut h.ctx);

    let fired = h.ctx.advance(Duration::from_millis(5));
    assert_eq!(fired, vec![StreamTimer::PerTryTimeout]);
    r.on_per_try_timeout(&mut h.ctx);
    assert_eq!(h.ctx.upstream_resets, 1);
    assert_eq!(counter(&h, "c", "upstream_rq_per_try_timeout"), 1);

    let fired = h.ctx.advance(Duration::from_millis(100));
    assert!(fired.contains(&StreamTimer::RetryBackoff));
    r.on_retry_timer(&mut h.ctx);
    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(200), true);
    assert_eq!(
        h.ctx.sent,
        vec![Sent::Headers {
            status: 200,
            end_stream: true
        }]
    );
}

#[test]
fn global_timeout_is_504() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);

    let fired = h.ctx.advance(Duration::from_millis(1000));
    assert_eq!(fired, vec![StreamTimer::GlobalTimeout]);
    r.on_global_timeout(&mut h.ctx);
    assert!(r.info.has_response_flag(ResponseFlag::UpstreamRequestTimeout));
    assert_eq!(
        h.ctx.sent,
        vec![Sent::LocalReply {
            status: 504,
            body: "upstream request timeout".into()
        }]
    );
    assert_eq!(counter(&h, "c", "upstream_rq_timeout"), 1);
    assert_eq!(h.ctx.upstream_resets, 1);
}

#[test]
fn timeout_alt_response_code() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(
        &mut h.ctx,
        request(&[("x-envoy-upstream-rq-timeout-alt-response", "204")]),
        true,
    );
    r.on_pool_ready(&mut h.ctx);
    assert_eq!(
        h.ctx.encoded_headers[0]
            .0
            .get_inline(InlineName::EnvoyUpstreamRqTimeoutAltResponse),
        None
    );
    h.ctx.advance(Duration::from_millis(10));
    r.on_global_timeout(&mut h.ctx);
    assert!(matches!(
        h.ctx.sent[0],
        Sent::LocalReply { status: 204, .. }
    ));
}

#[test]
fn timeout_header_overrides_route_timeout() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(
        &mut h.ctx,
        request(&[("x-envoy-upstream-rq-timeout-ms", "50")]),
        true,
    );
    r.on_pool_ready(&mut h.ctx);
    let encoded = &h.ctx.encoded_headers[0].0;
    assert_eq!(
        encoded.get_inline(InlineName::EnvoyExpectedRqTimeoutMs),
        Some("50")
    );
    assert_eq!(encoded.get_inline(InlineName::EnvoyUpstreamRqTimeoutMs), None);
    // Fires at 50ms, not the route's 10ms.
    assert!(h.ctx.advance(Duration::from_millis(10)).is_empty());
    assert_eq!(
        h.ctx.advance(Duration::from_millis(40)),
        vec![StreamTimer::GlobalTimeout]
    );
}

#[test]
fn connect_failure_without_retry_is_503() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    let host = h.ctx.pool_requests[0].clone();
    r.on_pool_failure(&mut h.ctx, PoolFailure::ConnectionFailure, Some(host));
    assert!(r.info.has_response_flag(ResponseFlag::UpstreamConnectionFailure));
    assert!(matches!(
        h.ctx.sent[0],
        Sent::LocalReply { status: 503, .. }
    ));
}

#[test]
fn pool_overflow_is_503_with_flag() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_failure(&mut h.ctx, PoolFailure::Overflow, None);
    assert!(r.info.has_response_flag(ResponseFlag::UpstreamOverflow));
    assert!(matches!(
        h.ctx.sent[0],
        Sent::LocalReply { status: 503, .. }
    ));
}

#[test]
fn connect_failure_retry_finds_no_host_then_503() {
    let mut h = harness(RouteEntry {
        retry_policy: RetryPolicy {
            retry_on: crate::route::retry_on::CONNECT_FAILURE,
            num_retries: 1,
        },
        ..entry("c")
    });
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    let host = h.ctx.pool_requests[0].clone();

    // All hosts vanish before the retry fires.
    h.ctx.hosts.get_mut("c").unwrap().clear();
    r.on_pool_failure(&mut h.ctx, PoolFailure::ConnectionFailure, Some(host));
    h.ctx.advance(Duration::from_millis(100));
    r.on_retry_timer(&mut h.ctx);

    assert!(r.info.has_response_flag(ResponseFlag::NoHealthyUpstream));
    assert_eq!(
        h.ctx.sent,
        vec![Sent::LocalReply {
            status: 503,
            body: "no healthy upstream".into()
        }]
    );
}

#[test]
fn reset_after_response_started_resets_downstream() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(200), false);
    r.on_upstream_reset(&mut h.ctx, ResetReason::ConnectionTermination);
    assert_eq!(h.ctx.sent.len(), 2);
    assert_eq!(h.ctx.sent[1], Sent::Reset);
}

#[test]
fn shadow_receives_identical_copies() {
    let runtime = Snapshot::new(HashMap::from([("shadow.key".to_string(), 10000u64)]));
    let mut h = harness_with(
        RouteEntry {
            shadow_policy: Some(ShadowPolicy {
                cluster: "s".into(),
                runtime_key: Some("shadow.key".into()),
            }),
            ..entry("c")
        },
        runtime,
    );
    let mut r = router(&h);

    r.decode_headers(&mut h.ctx, request(&[]), false);
    r.on_pool_ready(&mut h.ctx);
    let mut body = Buffer::new();
    body.add(b"hello");
    r.decode_data(&mut h.ctx, body, false);
    let mut trailers = HeaderMap::new();
    trailers.insert("x-check", "1");
    r.decode_trailers(&mut h.ctx, trailers);

    // Primary got everything.
    assert_eq!(h.ctx.encoded_body[0].0, b"hello");
    assert_eq!(h.ctx.encoded_trailers, 1);

    // Shadow got byte-identical copies.
    assert_eq!(h.ctx.shadows.len(), 1);
    let (cluster, headers, body, trailers) = &h.ctx.shadows[0];
    assert_eq!(cluster, "s");
    assert_eq!(headers.get_inline(InlineName::Path), Some("/x"));
    assert_eq!(body, b"hello");
    assert_eq!(trailers.as_ref().unwrap().get("x-check"), Some("1"));

    // Shadow response never reaches downstream.
    r.on_upstream_headers(&mut h.ctx, response(200), true);
    assert_eq!(h.ctx.sent.len(), 1);
}

#[test]
fn shadow_runtime_key_zero_disables() {
    let runtime = Snapshot::new(HashMap::from([("shadow.key".to_string(), 0u64)]));
    let mut h = harness_with(
        RouteEntry {
            shadow_policy: Some(ShadowPolicy {
                cluster: "s".into(),
                runtime_key: Some("shadow.key".into()),
            }),
            ..entry("c")
        },
        runtime,
    );
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);
    assert!(h.ctx.shadows.is_empty());
}

#[test]
fn hash_policy_feeds_lb_context() {
    let mut h = harness(RouteEntry {
        hash_policy: Some(HashPolicy {
            header_name: "x-consistent-hash".into(),
        }),
        ..entry("c")
    });
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[("x-consistent-hash", "k")]), true);
    // The request routed; hash generation is covered by route tests. Here
    // the interesting part is that routing still works with a hash set.
    assert_eq!(h.ctx.pool_requests.len(), 1);
}

#[test]
fn auto_host_rewrite_uses_host_hostname() {
    let mut h = harness(RouteEntry {
        auto_host_rewrite: true,
        ..entry("c")
    });
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);
    assert_eq!(
        h.ctx.encoded_headers[0].0.get_inline(InlineName::Authority),
        Some("backend-1")
    );
}

#[test]
fn canary_and_zone_scoped_counters() {
    let mut h = harness(entry("c"));
    let canary_host = Host::new("10.9.0.2:80".parse().unwrap(), "", "zone-b", true, 1);
    h.ctx.hosts.insert("c".into(), vec![canary_host]);
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);
    r.on_upstream_headers(&mut h.ctx, response(200), true);
    assert_eq!(counter(&h, "c", "canary.upstream_rq_200"), 1);
    assert_eq!(counter(&h, "c", "zone.local.zone-b.upstream_rq_200"), 1);
    assert_eq!(counter(&h, "c", "external.upstream_rq_200"), 1);
}

#[test]
fn downstream_reset_cancels_everything() {
    let mut h = harness(entry("c"));
    let mut r = router(&h);
    r.decode_headers(&mut h.ctx, request(&[]), true);
    r.on_pool_ready(&mut h.ctx);
    r.on_downstream_reset(&mut h.ctx);
    assert_eq!(h.ctx.upstream_resets, 1);
    assert!(h.ctx.timers.is_empty());
    assert!(r.completed());
}
