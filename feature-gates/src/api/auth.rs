use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap};

use crate::api::errors::FlagError;
use crate::flags::flag_models::{EvaluationContext, Role};

// Set by the authentication layer in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLE_HEADER: &str = "x-user-role";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Builds the evaluation context for the caller. Without a user id the caller
/// is anonymous and `None` is returned.
pub fn context_from_headers(headers: &HeaderMap) -> Option<EvaluationContext> {
    let id = header_value(headers, USER_ID_HEADER)?;

    let role = header_value(headers, USER_ROLE_HEADER).and_then(|raw| {
        let role = Role::parse(&raw);
        if role.is_none() {
            tracing::warn!(role = %raw, "ignoring unknown role from auth layer");
        }
        role
    });

    Some(EvaluationContext {
        id: Some(id),
        email: header_value(headers, USER_EMAIL_HEADER),
        role,
    })
}

/// Any authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub context: EvaluationContext,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = FlagError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = context_from_headers(&parts.headers).ok_or(FlagError::Unauthenticated)?;
        let id = context.id.clone().unwrap_or_default();
        Ok(AuthenticatedUser { id, context })
    }
}

/// An authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl AdminUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = FlagError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        if user.context.role != Some(Role::Admin) {
            tracing::warn!(user_id = %user.id, "non-admin caller rejected from admin route");
            return Err(FlagError::Forbidden(
                "admin role required to manage feature flags".to_string(),
            ));
        }
        Ok(AdminUser(user))
    }
}
