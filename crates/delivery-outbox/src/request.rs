//! Requests, send outcomes and the transport seam.

use crate::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

/// Everything needed to replay a request, minus its body.
///
/// The body lives in the payload cache and is referenced by key from the
/// pending call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl RequestDescriptor {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            event_id: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_url(&self.url)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the collector.
    Delivered,
    /// Failed in a way worth retrying later.
    Retryable,
    /// The endpoint asked us to slow down.
    RateLimited { retry_after: Option<Duration> },
    /// Permanently refused; retrying would not help.
    Rejected,
}

impl SendOutcome {
    /// Classify an HTTP status code.
    ///
    /// `retry_after` is the raw `Retry-After` header; only the delay-seconds
    /// form is honoured.
    pub fn from_status(status: u16, retry_after: Option<&str>) -> Self {
        match status {
            200..=299 => SendOutcome::Delivered,
            429 => SendOutcome::RateLimited {
                retry_after: retry_after
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            408 => SendOutcome::Retryable,
            400..=499 => SendOutcome::Rejected,
            500..=599 => SendOutcome::Retryable,
            _ => SendOutcome::Retryable,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SendOutcome::RateLimited { .. })
    }
}

/// Transport used to deliver one request with its cached payload.
///
/// Implementations enforce their own timeouts.
pub trait Sender: Send + Sync {
    fn send(&self, request: &RequestDescriptor, payload: &mut dyn Read) -> SendOutcome;
}

impl<F> Sender for F
where
    F: Fn(&RequestDescriptor, &mut dyn Read) -> SendOutcome + Send + Sync,
{
    fn send(&self, request: &RequestDescriptor, payload: &mut dyn Read) -> SendOutcome {
        self(request, payload)
    }
}

/// Reachability reported by the host's network observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Reachable,
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(SendOutcome::from_status(200, None), SendOutcome::Delivered);
        assert_eq!(SendOutcome::from_status(204, None), SendOutcome::Delivered);
        assert_eq!(SendOutcome::from_status(408, None), SendOutcome::Retryable);
        assert_eq!(SendOutcome::from_status(413, None), SendOutcome::Rejected);
        assert_eq!(SendOutcome::from_status(400, None), SendOutcome::Rejected);
        assert_eq!(SendOutcome::from_status(503, None), SendOutcome::Retryable);
        assert_eq!(SendOutcome::from_status(302, None), SendOutcome::Retryable);
    }

    #[test]
    fn rate_limit_honours_numeric_retry_after() {
        assert_eq!(
            SendOutcome::from_status(429, Some(" 30 ")),
            SendOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(
            SendOutcome::from_status(429, Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            SendOutcome::RateLimited { retry_after: None }
        );
        assert!(SendOutcome::from_status(429, None).is_rate_limited());
    }

    #[test]
    fn closures_are_senders() {
        let sender = |request: &RequestDescriptor, payload: &mut dyn Read| {
            let mut body = String::new();
            payload.read_to_string(&mut body).unwrap();
            if request.endpoint() == Endpoint::Events && body == "{}" {
                SendOutcome::Delivered
            } else {
                SendOutcome::Rejected
            }
        };

        let request = RequestDescriptor::post("https://c.example.com/v1/events")
            .with_header("Content-Type", "application/json")
            .with_event_id("e1");
        let mut body: &[u8] = b"{}";
        assert_eq!(Sender::send(&sender, &request, &mut body), SendOutcome::Delivered);
    }

    #[test]
    fn descriptor_serializes_headers_in_order() {
        let request = RequestDescriptor::post("https://c.example.com/v1/logging")
            .with_header("b", "2")
            .with_header("a", "1");
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"url":"https://c.example.com/v1/logging","method":"POST","headers":{"a":"1","b":"2"},"event_id":null}"#
        );
    }
}
