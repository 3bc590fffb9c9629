//! Request gates built on the flag registry.
//!
//! Each gate carries an explicit [`FailurePolicy`] deciding what happens when
//! a flag cannot be evaluated:
//!
//! | gate | disabled flag | evaluation error |
//! |---|---|---|
//! | hard gate (`FlagGate::require`) | 403 | 403 (fail-closed) |
//! | canary guard (`FlagGate::canary`) | 503 `disabled` | admitted (fail-open) |
//! | soft attach (`attach_flags`) | `false` in the map | empty map, admitted |
//!
//! The traffic splitter ignores flags entirely and routes on a random draw.

pub mod canary;
pub mod flag_gate;

use serde::{Deserialize, Serialize};

pub use canary::{canary_metrics, traffic_split, CanaryRoute, CanarySettings, TrafficSplit};
pub use flag_gate::{attach_flags, flag_gate, FeatureFlags, FlagGate, GateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through when the flag cannot be evaluated.
    FailOpen,
    /// Treat the flag as disabled when it cannot be evaluated.
    FailClosed,
}

impl FailurePolicy {
    pub fn admits_on_error(self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }
}

/// Canary state tagged on requests and reported in gate responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanaryStatus {
    Enabled,
    Disabled,
    Bypassed,
    /// The flag could not be evaluated and the request was let through.
    Fallback,
}

/// Body of a gate rejection.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResponse {
    pub message: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary_status: Option<CanaryStatus>,
}
