use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;

use super::cookie::{get_cookie, ACCESS_COOKIE_NAME};
use super::dto::PublicUser;
use super::repo_types::Role;
use super::tokens::JwtKeys;
use crate::{error::AppError, state::AppState};

/// Session gate. Authenticates the request from the access-token cookie,
/// resolves the account, and attaches the hash-stripped identity to the
/// request extensions for downstream gates and handlers.
pub struct CurrentUser(pub PublicUser);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = get_cookie(&parts.headers, ACCESS_COOKIE_NAME)
            .ok_or(AppError::Unauthorized("no access token provided"))?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify_access(token).map_err(|e| {
            warn!(error = %e, "access token rejected");
            AppError::Unauthorized("invalid access token")
        })?;

        // The signature was valid, so a missing account is its own case:
        // the account vanished after the token was issued.
        let user = state
            .users
            .find_by_id(claims.sub)
            .await
            .map_err(AppError::Upstream)?
            .ok_or(AppError::NotFound("user not found"))?;

        let identity = PublicUser::from(&user);
        parts.extensions.insert(identity.clone());
        Ok(CurrentUser(identity))
    }
}

/// Authorization gate for admin-only routes. Integration contract: this
/// gate runs after the session gate and consumes the identity it attached;
/// the token itself is not verified a second time. If no identity has been
/// attached yet the session gate is run here first.
pub struct AdminUser(pub PublicUser);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let identity = match parts.extensions.get::<PublicUser>() {
            Some(identity) => identity.clone(),
            None => CurrentUser::from_request_parts(parts, state).await?.0,
        };

        if identity.role != Role::Admin {
            return Err(AppError::Forbidden("admin access required"));
        }
        Ok(AdminUser(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::{MemoryUserStore, UserStore};
    use crate::auth::repo_types::{NewUser, User};
    use crate::auth::sessions::MemorySessionStore;
    use axum::{body::Body, http::Request, http::StatusCode, routing::get, Json, Router};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn seeded_state() -> (AppState, User, User) {
        let users = Arc::new(MemoryUserStore::new());
        let customer = users
            .create(NewUser {
                name: "Customer".into(),
                email: "customer@example.com".into(),
                password_hash: "unused".into(),
            })
            .await
            .unwrap();
        let mut admin = users
            .create(NewUser {
                name: "Admin".into(),
                email: "admin@example.com".into(),
                password_hash: "unused".into(),
            })
            .await
            .unwrap();
        admin.role = Role::Admin;
        users.save(&admin).await.unwrap();

        let state = AppState::from_parts(
            users,
            Arc::new(MemorySessionStore::new()),
            AppState::fake().config,
        );
        (state, customer, admin)
    }

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|CurrentUser(user): CurrentUser| async move { Json(user) }),
            )
            .route(
                "/admin",
                get(|AdminUser(user): AdminUser| async move { Json(user) }),
            )
            .with_state(state)
    }

    fn request(path: &str, cookie: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn access_cookie(state: &AppState, user_id: Uuid) -> String {
        let keys = JwtKeys::from_config(&state.config.tokens);
        format!("{}={}", ACCESS_COOKIE_NAME, keys.sign_access(user_id).unwrap())
    }

    #[tokio::test]
    async fn missing_cookie_is_unauthorized() {
        let (state, _, _) = seeded_state().await;
        let res = test_router(state)
            .oneshot(request("/protected", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let (state, _, _) = seeded_state().await;
        let cookie = format!("{}=garbage", ACCESS_COOKIE_NAME);
        let res = test_router(state)
            .oneshot(request("/protected", Some(cookie)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_attaches_identity() {
        let (state, customer, _) = seeded_state().await;
        let cookie = access_cookie(&state, customer.id);
        let res = test_router(state)
            .oneshot(request("/protected", Some(cookie)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let user: PublicUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.id, customer.id);
        assert_eq!(user.email, "customer@example.com");
    }

    #[tokio::test]
    async fn vanished_account_is_not_found() {
        let (state, _, _) = seeded_state().await;
        let cookie = access_cookie(&state, Uuid::new_v4());
        let res = test_router(state)
            .oneshot(request("/protected", Some(cookie)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_gate_rejects_customer() {
        let (state, customer, _) = seeded_state().await;
        let cookie = access_cookie(&state, customer.id);
        let res = test_router(state)
            .oneshot(request("/admin", Some(cookie)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_gate_passes_admin() {
        let (state, _, admin) = seeded_state().await;
        let cookie = access_cookie(&state, admin.id);
        let res = test_router(state)
            .oneshot(request("/admin", Some(cookie)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_gate_without_session_is_unauthorized() {
        let (state, _, _) = seeded_state().await;
        let res = test_router(state)
            .oneshot(request("/admin", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
