use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use rand::Rng;

use crate::{
    config::Config,
    gates::{CanaryStatus, GateResponse},
    metrics::consts::{CANARY_REQUEST_DURATION, CANARY_ROUTING_COUNTER},
};

pub const CANARY_ROUTED_HEADER: &str = "x-canary-routed";
pub const CANARY_VERSION_HEADER: &str = "x-canary-version";

/// Process-wide canary switches, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanarySettings {
    pub canary_mode: bool,
    pub version: String,
}

impl From<&Config> for CanarySettings {
    fn from(config: &Config) -> Self {
        CanarySettings {
            canary_mode: *config.canary_mode,
            version: config.canary_version.clone(),
        }
    }
}

/// Marks a request that the traffic splitter sent down the canary path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryRoute {
    pub version: String,
}

/// State for [`traffic_split`].
///
/// Each request gets a fresh random draw, so the same caller can land on
/// either side from one request to the next.
#[derive(Debug, Clone)]
pub struct TrafficSplit {
    settings: CanarySettings,
    percentage: f64,
}

impl TrafficSplit {
    pub fn new(settings: CanarySettings, percentage: f64) -> Self {
        let percentage = if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        };
        TrafficSplit {
            settings,
            percentage,
        }
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    fn routes_to_canary(&self) -> bool {
        let draw: f64 = rand::thread_rng().gen_range(0.0..100.0);
        draw < self.percentage
    }
}

/// Routes a share of traffic to the canary path while canary mode is on.
/// Everything else is bounced with 503 so the caller retries against stable.
/// With canary mode off this is a pass-through.
pub async fn traffic_split(
    State(split): State<TrafficSplit>,
    mut req: Request,
    next: Next,
) -> Response {
    if !split.settings.canary_mode {
        return next.run(req).await;
    }

    if !split.routes_to_canary() {
        metrics::counter!(CANARY_ROUTING_COUNTER, &[("route", "stable".to_string())])
            .increment(1);
        let mut response = (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(GateResponse {
                message: "Request bypassed canary, retry against the stable release".to_string(),
                status_code: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                flag: None,
                canary_status: Some(CanaryStatus::Bypassed),
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(CANARY_ROUTED_HEADER, HeaderValue::from_static("stable"));
        return response;
    }

    metrics::counter!(CANARY_ROUTING_COUNTER, &[("route", "canary".to_string())]).increment(1);
    let version = split.settings.version.clone();
    req.extensions_mut().insert(CanaryRoute {
        version: version.clone(),
    });

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(CANARY_ROUTED_HEADER, HeaderValue::from_static("canary"));
    match HeaderValue::from_str(&version) {
        Ok(value) => {
            headers.insert(CANARY_VERSION_HEADER, value);
        }
        Err(e) => tracing::warn!(version, error = %e, "canary version is not a valid header value"),
    }
    response
}

/// Records duration, status, path and version of canary-routed requests.
/// Requests without a [`CanaryRoute`] pass straight through.
pub async fn canary_metrics(req: Request, next: Next) -> Response {
    let Some(route) = req.extensions().get::<CanaryRoute>().cloned() else {
        return next.run(req).await;
    };

    let path = req.uri().path().to_owned();
    let method = req.method().clone();
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    tracing::info!(
        method = %method,
        path,
        status,
        version = route.version,
        duration_ms = elapsed.as_millis() as u64,
        "canary request completed"
    );

    let labels = [
        ("path", path),
        ("status", status.to_string()),
        ("version", route.version),
    ];
    metrics::histogram!(CANARY_REQUEST_DURATION, &labels).record(elapsed.as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, middleware, routing::get, Extension, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn settings(canary_mode: bool) -> CanarySettings {
        CanarySettings {
            canary_mode,
            version: "2.4.0-canary".to_string(),
        }
    }

    fn split_router(split: TrafficSplit) -> Router {
        Router::new()
            .route(
                "/search",
                get(|route: Option<Extension<CanaryRoute>>| async move {
                    match route {
                        Some(Extension(route)) => format!("canary {}", route.version),
                        None => "stable".to_string(),
                    }
                }),
            )
            .layer(middleware::from_fn(canary_metrics))
            .layer(middleware::from_fn_with_state(split, traffic_split))
    }

    fn search() -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri("/search")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_split_is_a_pass_through_without_canary_mode() {
        let router = split_router(TrafficSplit::new(settings(false), 0.0));
        let response = router.oneshot(search()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CANARY_ROUTED_HEADER).is_none());
        assert_eq!(body_text(response).await, "stable");
    }

    #[tokio::test]
    async fn test_full_split_routes_everything_to_canary() {
        let router = split_router(TrafficSplit::new(settings(true), 100.0));

        for _ in 0..20 {
            let response = router.clone().oneshot(search()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CANARY_ROUTED_HEADER], "canary");
            assert_eq!(response.headers()[CANARY_VERSION_HEADER], "2.4.0-canary");
            assert_eq!(body_text(response).await, "canary 2.4.0-canary");
        }
    }

    #[tokio::test]
    async fn test_empty_split_bypasses_everything() {
        let router = split_router(TrafficSplit::new(settings(true), 0.0));
        let response = router.oneshot(search()).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CANARY_ROUTED_HEADER], "stable");
        assert!(response.headers().get(CANARY_VERSION_HEADER).is_none());

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["canaryStatus"], "bypassed");
    }

    #[tokio::test]
    async fn test_split_is_not_sticky() {
        let router = split_router(TrafficSplit::new(settings(true), 50.0));

        let mut canary = 0;
        for _ in 0..400 {
            let response = router.clone().oneshot(search()).await.unwrap();
            if response.status() == StatusCode::OK {
                canary += 1;
            }
        }
        // same request every time, yet both routes are taken
        assert!(canary > 100 && canary < 300, "canary count was {canary}");
    }

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(TrafficSplit::new(settings(true), 150.0).percentage(), 100.0);
        assert_eq!(TrafficSplit::new(settings(true), -5.0).percentage(), 0.0);
        assert_eq!(TrafficSplit::new(settings(true), f64::NAN).percentage(), 0.0);
    }

    #[tokio::test]
    async fn test_metrics_tap_ignores_stable_requests() {
        let router = Router::new()
            .route("/search", get(|| async { "ok" }))
            .layer(middleware::from_fn(canary_metrics));
        let response = router.oneshot(search()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }
}
