//! Per-stream bookkeeping: ids, reset reasons, response flags, request info.

use std::time::{Instant, SystemTime};

use crate::upstream::HostRef;

/// Worker-unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Why a stream was torn down before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    LocalRefusedStream,
    LocalReset,
    RemoteReset,
    RemoteRefusedStream,
    ConnectionFailure,
    ConnectionTermination,
    Overflow,
}

/// One bit per failure disposition, recorded on request info for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseFlag {
    FailedLocalHealthCheck = 0x1,
    NoHealthyUpstream = 0x2,
    UpstreamRequestTimeout = 0x4,
    LocalReset = 0x8,
    UpstreamRemoteReset = 0x10,
    UpstreamConnectionFailure = 0x20,
    UpstreamConnectionTermination = 0x40,
    UpstreamOverflow = 0x80,
    NoRouteFound = 0x100,
    NoClusterFound = 0x200,
}

impl ResponseFlag {
    /// Short code used in access logs.
    pub fn code(self) -> &'static str {
        match self {
            ResponseFlag::FailedLocalHealthCheck => "LH",
            ResponseFlag::NoHealthyUpstream => "UH",
            ResponseFlag::UpstreamRequestTimeout => "UT",
            ResponseFlag::LocalReset => "LR",
            ResponseFlag::UpstreamRemoteReset => "UR",
            ResponseFlag::UpstreamConnectionFailure => "UF",
            ResponseFlag::UpstreamConnectionTermination => "UC",
            ResponseFlag::UpstreamOverflow => "UO",
            ResponseFlag::NoRouteFound => "NR",
            ResponseFlag::NoClusterFound => "NC",
        }
    }

    const ALL: [ResponseFlag; 10] = [
        ResponseFlag::FailedLocalHealthCheck,
        ResponseFlag::NoHealthyUpstream,
        ResponseFlag::UpstreamRequestTimeout,
        ResponseFlag::LocalReset,
        ResponseFlag::UpstreamRemoteReset,
        ResponseFlag::UpstreamConnectionFailure,
        ResponseFlag::UpstreamConnectionTermination,
        ResponseFlag::UpstreamOverflow,
        ResponseFlag::NoRouteFound,
        ResponseFlag::NoClusterFound,
    ];
}

/// Request metadata accumulated over a stream's life.
#[derive(Debug)]
pub struct RequestInfo {
    pub start_time: Instant,
    pub start_wall: SystemTime,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub response_code: Option<u16>,
    pub upstream_host: Option<HostRef>,
    response_flags: u32,
}

impl RequestInfo {
    pub fn new(start_time: Instant) -> RequestInfo {
        RequestInfo {
            start_time,
            start_wall: SystemTime::now(),
            bytes_received: 0,
            bytes_sent: 0,
            response_code: None,
            upstream_host: None,
            response_flags: 0,
        }
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flags |= flag as u32;
    }

    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags & (flag as u32) != 0
    }

    pub fn any_response_flag(&self) -> bool {
        self.response_flags != 0
    }

    /// Access-log notation: dash for none, comma-joined codes otherwise.
    pub fn response_flags_string(&self) -> String {
        if self.response_flags == 0 {
            return "-".to_string();
        }
        let codes: Vec<&str> = ResponseFlag::ALL
            .iter()
            .filter(|f| self.has_response_flag(**f))
            .map(|f| f.code())
            .collect();
        codes.join(",")
    }
}

/// Map a reset reason to the flag recorded on the request.
pub fn reset_reason_to_flag(reason: ResetReason) -> ResponseFlag {
    match reason {
        ResetReason::ConnectionFailure => ResponseFlag::UpstreamConnectionFailure,
        ResetReason::ConnectionTermination => ResponseFlag::UpstreamConnectionTermination,
        ResetReason::LocalReset | ResetReason::LocalRefusedStream => ResponseFlag::LocalReset,
        ResetReason::Overflow => ResponseFlag::UpstreamOverflow,
        ResetReason::RemoteReset | ResetReason::RemoteRefusedStream => {
            ResponseFlag::UpstreamRemoteReset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accumulate() {
        let mut info = RequestInfo::new(Instant::now());
        assert_eq!(info.response_flags_string(), "-");
        info.set_response_flag(ResponseFlag::NoRouteFound);
        info.set_response_flag(ResponseFlag::UpstreamRequestTimeout);
        assert!(info.has_response_flag(ResponseFlag::NoRouteFound));
        assert!(!info.has_response_flag(ResponseFlag::LocalReset));
        assert_eq!(info.response_flags_string(), "UT,NR");
    }
}
