use std::future::ready;

use axum::{
    http::{Method, StatusCode},
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::endpoint,
    config::Config,
    flags::flag_service::FlagService,
    gates::{canary_metrics, traffic_split, CanarySettings, TrafficSplit},
    metrics::{setup_metrics_recorder, track_metrics},
};

#[derive(Clone)]
pub struct State {
    pub service: FlagService,
    pub config: Config,
}

pub fn router(service: FlagService, config: Config) -> Router {
    let state = State {
        service: service.clone(),
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    // liveness/readiness checks
    let readiness_service = service.clone();
    let status_router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || readiness(readiness_service.clone())),
        )
        .route("/_liveness", get(|| ready("ok")));

    // admin API plus per-caller evaluation
    // my-flags must be registered before the `:key` routes
    let flags_router = Router::new()
        .route(
            "/flags",
            get(endpoint::list_flags).post(endpoint::create_flag),
        )
        .route("/flags/my-flags", get(endpoint::my_flags))
        .route(
            "/flags/:key",
            get(endpoint::get_flag)
                .put(endpoint::update_flag)
                .delete(endpoint::delete_flag),
        )
        .route("/flags/:key/toggle", patch(endpoint::toggle_flag))
        .route(
            "/flags/:key/whitelist",
            post(endpoint::add_to_whitelist).delete(endpoint::remove_from_whitelist),
        )
        .route("/flags/:key/check", get(endpoint::check_flag));

    let split = TrafficSplit::new(CanarySettings::from(&config), config.canary_percentage);
    let canary_router = Router::new()
        .route("/canary/version", get(endpoint::canary_version))
        .layer(middleware::from_fn(canary_metrics))
        .layer(middleware::from_fn_with_state(split, traffic_split));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .merge(canary_router)
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(middleware::from_fn(track_metrics))
        .with_state(state);

    // Global metrics recorders play poorly with tests, so only install on request
    if config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::error!("Failed to install metrics recorder: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn readiness(service: FlagService) -> Result<&'static str, (StatusCode, String)> {
    service.ping().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("flag store unavailable: {e}"),
        )
    })?;
    Ok("ready")
}

pub async fn index() -> &'static str {
    "feature gates"
}
