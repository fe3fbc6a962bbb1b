//! Caller identity and counter-store key layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Who a request is attributed to: the authenticated user when available,
/// otherwise the remote address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// Authenticated user id.
    User(String),
    /// Unauthenticated remote address.
    Ip(String),
}

impl Identity {
    /// Identity for an authenticated user.
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    /// Identity for an unauthenticated remote address.
    pub fn ip(addr: impl Into<String>) -> Self {
        Self::Ip(addr.into())
    }

    /// Counter key for the fixed-window and token-bucket state of this
    /// identity under an endpoint class: `ratelimit:{class}:{identity}`.
    pub fn counter_key(&self, endpoint_class: &str) -> String {
        format!("ratelimit:{endpoint_class}:{self}")
    }

    /// Sorted-set key for the sliding-window log:
    /// `ratelimit:sliding:{class}:{identity}`.
    pub fn sliding_key(&self, endpoint_class: &str) -> String {
        format!("ratelimit:sliding:{endpoint_class}:{self}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}
