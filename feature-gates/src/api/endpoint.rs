use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use bytes::Bytes;
use tracing::instrument;

use crate::{
    api::{
        auth::{AdminUser, AuthenticatedUser},
        errors::FlagError,
        types::{parse_json_body, CheckResponse, MyFlagsResponse, VersionResponse},
    },
    flags::flag_models::{FlagPatch, FlagRecord, NewFlag, WhitelistChange},
    gates::CanaryRoute,
    router,
};

#[instrument(skip_all, fields(actor = %admin.id()))]
pub async fn list_flags(
    state: State<router::State>,
    admin: AdminUser,
) -> Result<Json<Vec<FlagRecord>>, FlagError> {
    Ok(Json(state.service.get_all().await?))
}

#[instrument(skip_all, fields(key = %key, actor = %admin.id()))]
pub async fn get_flag(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
) -> Result<Json<FlagRecord>, FlagError> {
    Ok(Json(state.service.get_by_key(&key).await?))
}

pub async fn create_flag(
    state: State<router::State>,
    admin: AdminUser,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<FlagRecord>), FlagError> {
    let new: NewFlag = parse_json_body(&headers, body)?;
    let created = state.service.create(new, admin.id()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_flag(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FlagRecord>, FlagError> {
    let patch: FlagPatch = parse_json_body(&headers, body)?;
    Ok(Json(state.service.update(&key, patch, admin.id()).await?))
}

pub async fn toggle_flag(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
) -> Result<Json<FlagRecord>, FlagError> {
    Ok(Json(state.service.toggle(&key, admin.id()).await?))
}

pub async fn delete_flag(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
) -> Result<Json<FlagRecord>, FlagError> {
    tracing::info!(key = %key, actor = admin.id(), "deleting feature flag");
    Ok(Json(state.service.delete(&key).await?))
}

pub async fn add_to_whitelist(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FlagRecord>, FlagError> {
    let change: WhitelistChange = parse_json_body(&headers, body)?;
    Ok(Json(
        state
            .service
            .add_to_whitelist(&key, change, admin.id())
            .await?,
    ))
}

pub async fn remove_from_whitelist(
    state: State<router::State>,
    admin: AdminUser,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FlagRecord>, FlagError> {
    let change: WhitelistChange = parse_json_body(&headers, body)?;
    Ok(Json(
        state
            .service
            .remove_from_whitelist(&key, change, admin.id())
            .await?,
    ))
}

/// Evaluates one flag for the caller. Store failures evaluate to disabled.
#[instrument(skip_all, fields(key = %key, user_id = %user.id))]
pub async fn check_flag(
    state: State<router::State>,
    user: AuthenticatedUser,
    Path(key): Path<String>,
) -> Json<CheckResponse> {
    let enabled = state.service.is_enabled(&key, Some(&user.context)).await;
    Json(CheckResponse { enabled })
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn my_flags(
    state: State<router::State>,
    user: AuthenticatedUser,
) -> Result<Json<MyFlagsResponse>, FlagError> {
    Ok(Json(
        state
            .service
            .get_all_flags_for_user(Some(&user.context))
            .await?,
    ))
}

/// Probe behind the traffic splitter: reports the running version and whether
/// this request took the canary path.
pub async fn canary_version(
    state: State<router::State>,
    route: Option<Extension<CanaryRoute>>,
) -> Json<VersionResponse> {
    match route {
        Some(Extension(route)) => Json(VersionResponse {
            version: route.version,
            canary_routed: true,
        }),
        None => Json(VersionResponse {
            version: state.config.canary_version.clone(),
            canary_routed: false,
        }),
    }
}
