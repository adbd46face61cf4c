//! Delivery endpoints.

use delivery_config_and_utils::QueueDepths;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Collector endpoint a call is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Sessions,
    Events,
    Logging,
    Network,
    Blobs,
    Unknown,
}

impl Endpoint {
    pub const ALL: [Endpoint; 6] = [
        Endpoint::Sessions,
        Endpoint::Events,
        Endpoint::Logging,
        Endpoint::Network,
        Endpoint::Blobs,
        Endpoint::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Sessions => "sessions",
            Endpoint::Events => "events",
            Endpoint::Logging => "logging",
            Endpoint::Network => "network",
            Endpoint::Blobs => "blobs",
            Endpoint::Unknown => "unknown",
        }
    }

    /// Endpoint addressed by the last non-empty path segment of `url`.
    pub fn from_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Endpoint::Unknown;
        };
        let last = parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(|s| s.to_ascii_lowercase());

        match last.as_deref() {
            Some("sessions") => Endpoint::Sessions,
            Some("events") => Endpoint::Events,
            Some("logging") => Endpoint::Logging,
            Some("network") => Endpoint::Network,
            Some("blobs") => Endpoint::Blobs,
            _ => Endpoint::Unknown,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum number of calls waiting per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub sessions: usize,
    pub events: usize,
    pub logging: usize,
    pub network: usize,
    pub blobs: usize,
    pub unknown: usize,
}

impl QueueLimits {
    pub fn depth(&self, endpoint: Endpoint) -> usize {
        match endpoint {
            Endpoint::Sessions => self.sessions,
            Endpoint::Events => self.events,
            Endpoint::Logging => self.logging,
            Endpoint::Network => self.network,
            Endpoint::Blobs => self.blobs,
            Endpoint::Unknown => self.unknown,
        }
    }

    /// Same depth for every endpoint.
    pub fn uniform(depth: usize) -> Self {
        Self {
            sessions: depth,
            events: depth,
            logging: depth,
            network: depth,
            blobs: depth,
            unknown: depth,
        }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        QueueDepths::default().into()
    }
}

impl From<QueueDepths> for QueueLimits {
    fn from(depths: QueueDepths) -> Self {
        Self {
            sessions: depths.sessions,
            events: depths.events,
            logging: depths.logging,
            network: depths.network,
            blobs: depths.blobs,
            unknown: depths.unknown,
        }
    }
}
