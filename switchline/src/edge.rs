//! Edge request/response header mutation.
//!
//! Runs on every downstream request before the filter chain: hop-by-hop
//! header cleanup, `x-forwarded-for` maintenance, internal/external
//! classification, policy-header stripping for untrusted callers, and
//! `x-request-id` synthesis with the trace decision encoded in nibble 14.

use std::net::{IpAddr, SocketAddr};

use protocol_http1::{HeaderMap, InlineName};
use uuid::Uuid;

/// Per-listener edge behavior.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Trust the socket peer address (edge listener) instead of an
    /// already-populated `x-forwarded-for` (trusted double proxy).
    pub use_remote_address: bool,
    /// Stamped into `x-envoy-downstream-service-cluster`.
    pub service_cluster: Option<String>,
    /// Substituted into XFF when the peer is loopback.
    pub local_address: IpAddr,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            use_remote_address: true,
            service_cluster: None,
            local_address: IpAddr::from([127, 0, 0, 1]),
        }
    }
}

/// Trace disposition carried in the request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    NoTrace,
    Sampled,
    Forced,
}

/// Mutate request headers at the edge. Returns whether the request is
/// internal (single RFC1918 `x-forwarded-for` entry).
pub fn mutate_request_headers(
    headers: &mut HeaderMap,
    peer: SocketAddr,
    config: &EdgeConfig,
) -> bool {
    // Hop-by-hop and internal-only cleanup.
    headers.remove_inline(InlineName::Connection);
    headers.remove_inline(InlineName::KeepAlive);
    headers.remove_inline(InlineName::ProxyConnection);
    headers.remove_inline(InlineName::Upgrade);
    headers.remove_inline(InlineName::TransferEncoding);
    headers.remove_inline(InlineName::EnvoyInternal);

    if config.use_remote_address {
        let xff_addr = if peer.ip().is_loopback() {
            config.local_address
        } else {
            peer.ip()
        };
        headers.set_inline(InlineName::ForwardedFor, xff_addr.to_string());
        headers.set_inline(InlineName::ForwardedProto, "http");
    }
    if !headers.contains(InlineName::ForwardedProto) {
        headers.set_inline(InlineName::ForwardedProto, "http");
    }

    let internal = is_internal_request(headers);
    let edge_request = !internal && config.use_remote_address;

    if internal {
        headers.set_inline(InlineName::EnvoyInternal, "true");
    } else {
        if edge_request {
            headers.remove_inline(InlineName::EnvoyDownstreamServiceCluster);
        }
        // Policy headers are only honored from internal callers.
        headers.remove_inline(InlineName::EnvoyRetryOn);
        headers.remove_inline(InlineName::EnvoyMaxRetries);
        headers.remove_inline(InlineName::EnvoyUpstreamRqTimeoutMs);
        headers.remove_inline(InlineName::EnvoyUpstreamRqPerTryTimeoutMs);
        headers.remove_inline(InlineName::EnvoyUpstreamRqTimeoutAltResponse);
        headers.remove_inline(InlineName::EnvoyExpectedRqTimeoutMs);
        headers.remove_inline(InlineName::EnvoyForceTrace);
    }

    if let Some(service_cluster) = &config.service_cluster {
        headers.set_inline(
            InlineName::EnvoyDownstreamServiceCluster,
            service_cluster.clone(),
        );
    }

    if edge_request {
        headers.set_inline(InlineName::EnvoyExternalAddress, peer.ip().to_string());
    }

    // Request id: synthesized at the edge, trusted from internal callers.
    if edge_request || !headers.contains(InlineName::RequestId) {
        headers.set_inline(InlineName::RequestId, generate_request_id());
    }
    if internal && headers.contains(InlineName::EnvoyForceTrace) {
        if let Some(id) = headers.get_inline(InlineName::RequestId) {
            let forced = set_trace_status(id, TraceStatus::Forced);
            headers.set_inline(InlineName::RequestId, forced);
        }
    }

    internal
}

/// Mutate response headers before they egress downstream.
pub fn mutate_response_headers(headers: &mut HeaderMap, request_headers: &HeaderMap) {
    headers.remove_inline(InlineName::Connection);
    headers.remove_inline(InlineName::TransferEncoding);

    if request_headers.contains(InlineName::EnvoyForceTrace) {
        if let Some(id) = request_headers.get_inline(InlineName::RequestId) {
            headers.set_inline(InlineName::RequestId, id.to_string());
        }
    }
}

/// A request is internal iff XFF holds exactly one RFC1918 address.
pub fn is_internal_request(headers: &HeaderMap) -> bool {
    let Some(xff) = headers.get_inline(InlineName::ForwardedFor) else {
        return false;
    };
    if xff.contains(',') {
        return false;
    }
    xff.trim()
        .parse::<IpAddr>()
        .map(is_rfc1918)
        .unwrap_or(false)
}

fn is_rfc1918(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(_) => false,
    }
}

/// Fresh v4 UUID with the trace nibble cleared.
pub fn generate_request_id() -> String {
    set_trace_status(&Uuid::new_v4().to_string(), TraceStatus::NoTrace)
}

/// Encode the trace decision into nibble 14 of the UUID.
pub fn set_trace_status(id: &str, status: TraceStatus) -> String {
    let mut bytes: Vec<u8> = id.bytes().collect();
    if bytes.len() > 14 {
        bytes[14] = match status {
            TraceStatus::NoTrace => b'4',
            TraceStatus::Sampled => b'9',
            TraceStatus::Forced => b'b',
        };
    }
    String::from_utf8(bytes).unwrap_or_else(|_| id.to_string())
}

pub fn trace_status(id: &str) -> TraceStatus {
    match id.as_bytes().get(14) {
        Some(b'9') => TraceStatus::Sampled,
        Some(b'b') => TraceStatus::Forced,
        _ => TraceStatus::NoTrace,
    }
}
