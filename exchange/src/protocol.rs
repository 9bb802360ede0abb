//! Request vocabulary and handshake tokens for the descriptor exchange.
//!
//! Requests are short ASCII strings written by the client right after
//! connecting. Responses are a handshake token carried in the data part of a
//! single `sendmsg` whose control part holds the descriptors.

use std::fmt;
use std::str::FromStr;

use crate::error::ExchangeError;

/// Socket path shared by the agent and every receiver.
pub const DEFAULT_SOCKET_PATH: &str = "/var/exchange/exchange.sock";

/// Upper bound on a request string, in bytes.
pub const MAX_REQUEST_LEN: usize = 16;

/// Maximum number of descriptors a single response may carry.
pub const MAX_HANDLES: usize = 8;

/// Token preceding a single new descriptor (traces and logs requests).
pub const RESP_NEW_FD: &str = "NEW_FD";

/// Token preceding a multi-descriptor payload (metrics requests).
pub const RESP_OK: &str = "OK";

/// Signal a descriptor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleSignal {
    Traces,
    Logs,
    Metrics,
}

impl HandleSignal {
    pub const fn as_str(self) -> &'static str {
        match self {
            HandleSignal::Traces => "traces",
            HandleSignal::Logs => "logs",
            HandleSignal::Metrics => "metrics",
        }
    }

    /// Request a receiver sends for this signal
    pub const fn request(self) -> RequestType {
        match self {
            HandleSignal::Traces => RequestType::GetTracesFd,
            HandleSignal::Logs => RequestType::GetLogsFd,
            HandleSignal::Metrics => RequestType::GetMetricsFd,
        }
    }
}

impl fmt::Display for HandleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request understood by the exchange server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Legacy request, answered exactly like [`RequestType::GetTracesFd`]
    GetFd,
    GetTracesFd,
    GetLogsFd,
    GetMetricsFd,
}

impl RequestType {
    pub const ALL: [RequestType; 4] = [
        RequestType::GetFd,
        RequestType::GetTracesFd,
        RequestType::GetLogsFd,
        RequestType::GetMetricsFd,
    ];

    /// Wire representation of the request
    pub const fn as_str(self) -> &'static str {
        match self {
            RequestType::GetFd => "GET_FD",
            RequestType::GetTracesFd => "GET_TRACES_FD",
            RequestType::GetLogsFd => "GET_LOGS_FD",
            RequestType::GetMetricsFd => "GET_METRICS_FD",
        }
    }

    /// Signal whose descriptors this request asks for
    pub const fn signal(self) -> HandleSignal {
        match self {
            RequestType::GetFd | RequestType::GetTracesFd => HandleSignal::Traces,
            RequestType::GetLogsFd => HandleSignal::Logs,
            RequestType::GetMetricsFd => HandleSignal::Metrics,
        }
    }

    /// Whether the response carries a list of descriptors rather than one
    pub const fn is_multi(self) -> bool {
        matches!(self, RequestType::GetMetricsFd)
    }

    /// Handshake token the server sends in front of the descriptors
    pub const fn response_token(self) -> &'static str {
        if self.is_multi() {
            RESP_OK
        } else {
            RESP_NEW_FD
        }
    }

    /// Parse a request read off the socket. Trailing NUL padding is ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ExchangeError> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        let raw = &bytes[..end];
        RequestType::ALL
            .into_iter()
            .find(|r| r.as_str().as_bytes() == raw)
            .ok_or_else(|| ExchangeError::UnknownRequest(String::from_utf8_lossy(raw).into_owned()))
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::parse(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_fit_wire_limit() {
        for request in RequestType::ALL {
            assert!(request.as_str().len() <= MAX_REQUEST_LEN, "{request} too long");
        }
    }

    #[test]
    fn test_parse_known_requests() {
        assert_eq!(RequestType::parse(b"GET_FD").unwrap(), RequestType::GetFd);
        assert_eq!(
            RequestType::parse(b"GET_METRICS_FD").unwrap(),
            RequestType::GetMetricsFd
        );
        assert_eq!(
            "GET_TRACES_FD".parse::<RequestType>().unwrap(),
            RequestType::GetTracesFd
        );
    }

    #[test]
    fn test_parse_ignores_nul_padding() {
        let mut buf = [0u8; MAX_REQUEST_LEN];
        buf[..11].copy_from_slice(b"GET_LOGS_FD");
        assert_eq!(RequestType::parse(&buf).unwrap(), RequestType::GetLogsFd);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = RequestType::parse(b"GET_PROFILES").unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownRequest(ref r) if r == "GET_PROFILES"));
        assert!(RequestType::parse(b"").is_err());
    }

    #[test]
    fn test_legacy_request_means_traces() {
        assert_eq!(RequestType::GetFd.signal(), HandleSignal::Traces);
        assert_eq!(RequestType::GetFd.response_token(), RESP_NEW_FD);
        assert!(!RequestType::GetFd.is_multi());
    }

    #[test]
    fn test_metrics_is_multi() {
        assert!(RequestType::GetMetricsFd.is_multi());
        assert_eq!(RequestType::GetMetricsFd.response_token(), RESP_OK);
        assert_eq!(RequestType::GetMetricsFd.signal(), HandleSignal::Metrics);
    }

    #[test]
    fn test_signal_request_round_trip() {
        for signal in [HandleSignal::Traces, HandleSignal::Logs, HandleSignal::Metrics] {
            assert_eq!(signal.request().signal(), signal);
        }
    }
}
