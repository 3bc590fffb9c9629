use std::collections::HashMap;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

use crate::{
    api::auth::context_from_headers,
    flags::flag_service::FlagService,
    gates::{CanaryStatus, FailurePolicy, GateResponse},
    metrics::consts::GATE_DECISION_COUNTER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Blocks with 403 when the flag is off.
    Hard,
    /// Blocks with 503 when the flag is off and tags the canary status on the request.
    Canary,
}

impl GateKind {
    fn as_str(self) -> &'static str {
        match self {
            GateKind::Hard => "hard",
            GateKind::Canary => "canary",
        }
    }
}

/// State for [`flag_gate`]: which flag to check and how to behave when it can't be checked.
#[derive(Clone)]
pub struct FlagGate {
    service: FlagService,
    key: String,
    kind: GateKind,
    policy: FailurePolicy,
}

impl FlagGate {
    /// Hard gate: a disabled flag or a store failure both reject with 403.
    pub fn require(service: FlagService, key: &str) -> Self {
        FlagGate {
            service,
            key: key.to_string(),
            kind: GateKind::Hard,
            policy: FailurePolicy::FailClosed,
        }
    }

    /// Canary guard: a disabled flag rejects with 503, a store failure lets the request through.
    pub fn canary(service: FlagService, key: &str) -> Self {
        FlagGate {
            service,
            key: key.to_string(),
            kind: GateKind::Canary,
            policy: FailurePolicy::FailOpen,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn reject(&self) -> Response {
        match self.kind {
            GateKind::Hard => (
                StatusCode::FORBIDDEN,
                Json(GateResponse {
                    message: format!("Feature '{}' is not enabled for this account", self.key),
                    status_code: StatusCode::FORBIDDEN.as_u16(),
                    flag: Some(self.key.clone()),
                    canary_status: None,
                }),
            )
                .into_response(),
            GateKind::Canary => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(GateResponse {
                    message: "Feature not available".to_string(),
                    status_code: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    flag: Some(self.key.clone()),
                    canary_status: Some(CanaryStatus::Disabled),
                }),
            )
                .into_response(),
        }
    }
}

fn record_decision(gate: &FlagGate, decision: &'static str) {
    metrics::counter!(
        GATE_DECISION_COUNTER,
        &[
            ("gate", gate.kind.as_str().to_string()),
            ("flag", gate.key.clone()),
            ("decision", decision.to_string()),
        ]
    )
    .increment(1);
}

/// Middleware enforcing a [`FlagGate`]. Use with `axum::middleware::from_fn_with_state`.
pub async fn flag_gate(State(gate): State<FlagGate>, mut req: Request, next: Next) -> Response {
    let ctx = context_from_headers(req.headers());

    let status = match gate.service.try_is_enabled(&gate.key, ctx.as_ref()).await {
        Ok(true) => CanaryStatus::Enabled,
        Ok(false) => CanaryStatus::Disabled,
        Err(e) => {
            tracing::error!(
                flag = %gate.key,
                gate = gate.kind.as_str(),
                policy = gate.policy.as_str(),
                error = %e,
                "failed to evaluate gated flag"
            );
            if gate.policy.admits_on_error() {
                CanaryStatus::Fallback
            } else {
                CanaryStatus::Disabled
            }
        }
    };

    if status == CanaryStatus::Disabled {
        tracing::debug!(
            flag = %gate.key,
            gate = gate.kind.as_str(),
            "request blocked by flag gate"
        );
        record_decision(&gate, "reject");
        return gate.reject();
    }

    record_decision(
        &gate,
        if status == CanaryStatus::Fallback {
            "fallback"
        } else {
            "admit"
        },
    );
    if gate.kind == GateKind::Canary {
        req.extensions_mut().insert(status);
    }
    next.run(req).await
}

/// Every flag evaluated for the current caller, attached to the request by [`attach_flags`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeatureFlags(pub HashMap<String, bool>);

impl FeatureFlags {
    pub fn is_enabled(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }
}

/// Soft attach: computes all flags for the caller and stores them as a
/// [`FeatureFlags`] request extension. Always fail-open: any error attaches an
/// empty map and the request carries on.
pub async fn attach_flags(
    State(service): State<FlagService>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = context_from_headers(req.headers());

    let flags = match service.get_all_flags_for_user(ctx.as_ref()).await {
        Ok(flags) => flags,
        Err(e) => {
            tracing::warn!(
                policy = FailurePolicy::FailOpen.as_str(),
                error = %e,
                "failed to compute flags for request, attaching none"
            );
            HashMap::new()
        }
    };

    req.extensions_mut().insert(FeatureFlags(flags));
    next.run(req).await
}
