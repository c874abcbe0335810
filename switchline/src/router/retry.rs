//! Per-request retry state: admission and backoff.

use std::sync::Arc;
use std::time::Duration;

use protocol_http1::{HeaderMap, InlineName};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::route::{retry_on, RetryPolicy};
use crate::runtime::Snapshot;
use crate::stream_info::ResetReason;
use crate::upstream::{ClusterInfo, Priority};

/// Outcome of a retry consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    /// Re-enter the upstream path after this fully jittered backoff.
    RetryScheduled(Duration),
}

/// Retry state for one downstream request.
///
/// Holds one slot of the cluster's retry budget while a retry is
/// scheduled or in flight; [`RetryState::reset`] releases it.
pub struct RetryState {
    retry_on: u32,
    retries_remaining: u32,
    current_retry: u32,
    /// A retry is scheduled or its attempt is outstanding.
    armed: bool,
    cluster: Arc<ClusterInfo>,
    priority: Priority,
}

impl RetryState {
    /// Build retry state from the route policy merged with the request's
    /// `x-envoy-retry-on` / `x-envoy-max-retries`. The headers are always
    /// stripped. Returns None when nothing could ever retry.
    pub fn create(
        route_policy: &RetryPolicy,
        headers: &mut HeaderMap,
        cluster: Arc<ClusterInfo>,
        priority: Priority,
    ) -> Option<RetryState> {
        let header_retry_on = headers.remove_inline(InlineName::EnvoyRetryOn);
        let header_max_retries = headers.remove_inline(InlineName::EnvoyMaxRetries);

        if header_retry_on.is_none() && route_policy.retry_on == 0 {
            return None;
        }

        let mut retry_on = route_policy.retry_on;
        let mut retries_remaining = route_policy.num_retries;
        if let Some(value) = header_retry_on {
            let from_header = retry_on::parse(&value);
            retry_on |= from_header;
            if from_header != 0 {
                if let Some(max) = header_max_retries.and_then(|v| v.parse::<u32>().ok()) {
                    retries_remaining = retries_remaining.max(max);
                }
            }
        }

        Some(RetryState {
            retry_on,
            retries_remaining,
            current_retry: 0,
            armed: false,
            cluster,
            priority,
        })
    }

    pub fn enabled(&self) -> bool {
        self.retry_on != 0
    }

    /// Release the retry budget slot, if held.
    pub fn reset(&mut self) {
        if self.armed {
            self.cluster.resources(self.priority).retries.dec();
            self.armed = false;
        }
    }

    /// Consult retry policy for a candidate failure: a response status or
    /// a stream reset (exactly one is present). On admission, decrements
    /// remaining attempts, charges the retry budget, and returns the
    /// backoff delay to arm.
    ///
    /// Consulting with a non-retriable outcome never consumes an attempt.
    pub fn should_retry(
        &mut self,
        response_status: Option<u16>,
        reset_reason: Option<ResetReason>,
        runtime: &Snapshot,
        rng: &mut SmallRng,
    ) -> RetryDecision {
        debug_assert!(response_status.is_some() ^ reset_reason.is_some());

        let would_retry = self.would_retry(response_status, reset_reason);
        if self.armed && !would_retry {
            // The previous retry produced a good outcome.
            self.cluster.stats.upstream_rq_retry_success.increment();
        }
        self.reset();

        if !would_retry {
            return RetryDecision::NoRetry;
        }
        if self.retries_remaining == 0 {
            return RetryDecision::NoRetry;
        }
        if !runtime.feature_enabled("upstream.use_retry", 100, rng) {
            return RetryDecision::NoRetry;
        }
        self.retries_remaining -= 1;

        if !self.cluster.resources(self.priority).retries.can_create() {
            self.cluster.stats.upstream_rq_retry_overflow.increment();
            return RetryDecision::NoRetry;
        }

        self.armed = true;
        self.cluster.resources(self.priority).retries.inc();
        self.cluster.stats.upstream_rq_retry.increment();
        RetryDecision::RetryScheduled(self.backoff(runtime, rng))
    }

    /// Fully jittered exponential backoff.
    fn backoff(&mut self, runtime: &Snapshot, rng: &mut SmallRng) -> Duration {
        self.current_retry += 1;
        let multiplier = (1u64 << self.current_retry) - 1;
        let base = runtime.get_integer("upstream.base_retry_backoff_ms", 25);
        Duration::from_millis(rng.gen_range(0..base * multiplier))
    }

    fn would_retry(&self, status: Option<u16>, reset: Option<ResetReason>) -> bool {
        if self.retry_on & retry_on::FIVE_XX != 0 {
            // An upstream reset counts as a 5xx since that is what it
            // would produce downstream.
            match status {
                None => return true,
                Some(code) if (500..600).contains(&code) => return true,
                _ => {}
            }
        }
        if self.retry_on & retry_on::REFUSED_STREAM != 0
            && reset == Some(ResetReason::RemoteRefusedStream)
        {
            return true;
        }
        if self.retry_on & retry_on::CONNECT_FAILURE != 0
            && reset == Some(ResetReason::ConnectionFailure)
        {
            return true;
        }
        if self.retry_on & retry_on::RETRIABLE_4XX != 0 && status == Some(409) {
            return true;
        }
        false
    }
}

impl Drop for RetryState {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Store;
    use crate::upstream::LbPolicy;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn cluster() -> Arc<ClusterInfo> {
        ClusterInfo::new(
            "retry_test",
            Duration::from_millis(250),
            LbPolicy::RoundRobin,
            0,
            false,
            &HashMap::new(),
            &Store::new().root(),
        )
    }

    fn headers_with(entries: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (name, value) in entries {
            h.insert(name, *value);
        }
        h
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(11)
    }

    #[test]
    fn no_policy_no_state() {
        let mut headers = HeaderMap::new();
        assert!(RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster(),
            Priority::Default,
        )
        .is_none());
    }

    #[test]
    fn headers_stripped_even_without_state() {
        let mut headers = headers_with(&[("x-envoy-max-retries", "3")]);
        let state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster(),
            Priority::Default,
        );
        assert!(state.is_none());
        assert!(headers.get("x-envoy-max-retries").is_none());
    }

    #[test]
    fn header_policy_enables_retry() {
        let mut headers = headers_with(&[
            ("x-envoy-retry-on", "5xx"),
            ("x-envoy-max-retries", "2"),
        ]);
        let mut state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster(),
            Priority::Default,
        )
        .unwrap();
        assert!(headers.get("x-envoy-retry-on").is_none());

        let runtime = Snapshot::default();
        let mut rng = rng();
        assert!(matches!(
            state.should_retry(Some(503), None, &runtime, &mut rng),
            RetryDecision::RetryScheduled(_)
        ));
        assert!(matches!(
            state.should_retry(Some(503), None, &runtime, &mut rng),
            RetryDecision::RetryScheduled(_)
        ));
        // Both attempts spent.
        assert_eq!(
            state.should_retry(Some(503), None, &runtime, &mut rng),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn non_retriable_outcome_never_consumes_attempts() {
        let mut headers = headers_with(&[("x-envoy-retry-on", "5xx")]);
        let mut state = RetryState::create(
            &RetryPolicy {
                retry_on: 0,
                num_retries: 1,
            },
            &mut headers,
            cluster(),
            Priority::Default,
        )
        .unwrap();
        let runtime = Snapshot::default();
        let mut rng = rng();

        for _ in 0..10 {
            assert_eq!(
                state.should_retry(Some(200), None, &runtime, &mut rng),
                RetryDecision::NoRetry
            );
        }
        // The attempt is still available for a real 5xx.
        assert!(matches!(
            state.should_retry(Some(500), None, &runtime, &mut rng),
            RetryDecision::RetryScheduled(_)
        ));
    }

    #[test]
    fn reset_reasons_map_to_conditions() {
        let runtime = Snapshot::default();
        let mut rng = rng();
        let cases = [
            ("connect-failure", ResetReason::ConnectionFailure, true),
            ("connect-failure", ResetReason::RemoteReset, false),
            ("refused-stream", ResetReason::RemoteRefusedStream, true),
            ("refused-stream", ResetReason::ConnectionFailure, false),
            ("5xx", ResetReason::RemoteReset, true),
        ];
        for (policy, reason, expect) in cases {
            let mut headers = headers_with(&[
                ("x-envoy-retry-on", policy),
                ("x-envoy-max-retries", "1"),
            ]);
            let mut state = RetryState::create(
                &RetryPolicy::default(),
                &mut headers,
                cluster(),
                Priority::Default,
            )
            .unwrap();
            let decision = state.should_retry(None, Some(reason), &runtime, &mut rng);
            assert_eq!(
                matches!(decision, RetryDecision::RetryScheduled(_)),
                expect,
                "{policy} vs {reason:?}"
            );
        }
    }

    #[test]
    fn retriable_4xx_only_409() {
        let runtime = Snapshot::default();
        let mut rng = rng();
        let mut headers = headers_with(&[
            ("x-envoy-retry-on", "retriable-4xx"),
            ("x-envoy-max-retries", "5"),
        ]);
        let mut state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster(),
            Priority::Default,
        )
        .unwrap();
        assert_eq!(
            state.should_retry(Some(400), None, &runtime, &mut rng),
            RetryDecision::NoRetry
        );
        assert!(matches!(
            state.should_retry(Some(409), None, &runtime, &mut rng),
            RetryDecision::RetryScheduled(_)
        ));
    }

    #[test]
    fn runtime_gate_disables_retries() {
        let runtime = Snapshot::new(HashMap::from([("upstream.use_retry".to_string(), 0u64)]));
        let mut rng = rng();
        let mut headers = headers_with(&[
            ("x-envoy-retry-on", "5xx"),
            ("x-envoy-max-retries", "3"),
        ]);
        let mut state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster(),
            Priority::Default,
        )
        .unwrap();
        assert_eq!(
            state.should_retry(Some(503), None, &runtime, &mut rng),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn budget_exhaustion_is_overflow() {
        let cluster = cluster();
        // Saturate the retry budget (default max 3).
        for _ in 0..3 {
            cluster.resources(Priority::Default).retries.inc();
        }
        let mut headers = headers_with(&[
            ("x-envoy-retry-on", "5xx"),
            ("x-envoy-max-retries", "2"),
        ]);
        let mut state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster.clone(),
            Priority::Default,
        )
        .unwrap();
        let runtime = Snapshot::default();
        let mut rng = rng();
        assert_eq!(
            state.should_retry(Some(503), None, &runtime, &mut rng),
            RetryDecision::NoRetry
        );
        assert_eq!(cluster.stats.upstream_rq_retry_overflow.value(), 1);
    }

    #[test]
    fn budget_released_on_drop() {
        let cluster = cluster();
        let runtime = Snapshot::default();
        let mut rng = rng();
        {
            let mut headers = headers_with(&[
                ("x-envoy-retry-on", "5xx"),
                ("x-envoy-max-retries", "2"),
            ]);
            let mut state = RetryState::create(
                &RetryPolicy::default(),
                &mut headers,
                cluster.clone(),
                Priority::Default,
            )
            .unwrap();
            state.should_retry(Some(503), None, &runtime, &mut rng);
            assert_eq!(cluster.resources(Priority::Default).retries.count(), 1);
        }
        assert_eq!(cluster.resources(Priority::Default).retries.count(), 0);
    }

    #[test]
    fn retry_success_counted_on_good_outcome_after_retry() {
        let cluster = cluster();
        let runtime = Snapshot::default();
        let mut rng = rng();
        let mut headers = headers_with(&[
            ("x-envoy-retry-on", "5xx"),
            ("x-envoy-max-retries", "2"),
        ]);
        let mut state = RetryState::create(
            &RetryPolicy::default(),
            &mut headers,
            cluster.clone(),
            Priority::Default,
        )
        .unwrap();
        state.should_retry(Some(503), None, &runtime, &mut rng);
        state.should_retry(Some(200), None, &runtime, &mut rng);
        assert_eq!(cluster.stats.upstream_rq_retry.value(), 1);
        assert_eq!(cluster.stats.upstream_rq_retry_success.value(), 1);
    }
}
