use axum::{
    extract::{FromRef, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderName, StatusCode},
    response::AppendHeaders,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::{
    cookie::{auth_cookie, expired_cookie, get_cookie, ACCESS_COOKIE_NAME, REFRESH_COOKIE_NAME},
    dto::{AuthResponse, LoginRequest, MessageResponse, PublicUser, RefreshResponse, SignupRequest},
    extractors::CurrentUser,
    password::hash_password,
    repo_types::NewUser,
    tokens::{JwtKeys, TokenPair},
};
use crate::{error::AppError, state::AppState};

const INVALID_CREDENTIALS: &str = "Invalid credentials";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/profile", get(profile))
}

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Set-Cookie pair for a freshly issued token pair.
fn pair_cookies(
    state: &AppState,
    keys: &JwtKeys,
    pair: &TokenPair,
) -> AppendHeaders<[(HeaderName, String); 2]> {
    let secure = state.config.production;
    AppendHeaders([
        (
            SET_COOKIE,
            auth_cookie(ACCESS_COOKIE_NAME, &pair.access, keys.access_ttl, secure),
        ),
        (
            SET_COOKIE,
            auth_cookie(REFRESH_COOKIE_NAME, &pair.refresh, keys.refresh_ttl, secure),
        ),
    ])
}

/// Issue a token pair and record the refresh token in the session registry.
/// The registry write happens before any cookie leaves the server; if it
/// fails there must be no access-granting cookie without a revocation
/// record, so the whole request fails.
async fn open_session(
    state: &AppState,
    keys: &JwtKeys,
    user_id: uuid::Uuid,
) -> Result<TokenPair, AppError> {
    let pair = keys.issue_pair(user_id).map_err(AppError::Internal)?;
    state
        .sessions
        .put(user_id, &pair.refresh, keys.refresh_ttl)
        .await
        .map_err(AppError::Upstream)?;
    Ok(pair)
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(mut payload): Json<SignupRequest>,
) -> Result<
    (
        StatusCode,
        AppendHeaders<[(HeaderName, String); 2]>,
        Json<AuthResponse>,
    ),
    AppError,
> {
    payload.email = payload.email.trim().to_lowercase();

    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".into()));
    }
    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(AppError::Validation("Invalid email".into()));
    }
    if payload.password.len() < 6 {
        warn!("password too short");
        return Err(AppError::Validation(
            "Password must be at least 6 characters".into(),
        ));
    }

    if state
        .users
        .find_by_email(&payload.email)
        .await
        .map_err(AppError::Upstream)?
        .is_some()
    {
        warn!(email = %payload.email, "signup email already registered");
        return Err(AppError::Conflict("User already exists".into()));
    }

    let hash = hash_password(&payload.password).map_err(AppError::Internal)?;
    let user = state
        .users
        .create(NewUser {
            name: payload.name.trim().to_string(),
            email: payload.email,
            password_hash: hash,
        })
        .await
        .map_err(AppError::Upstream)?;

    let keys = JwtKeys::from_ref(&state);
    let pair = open_session(&state, &keys, user.id).await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        pair_cookies(&state, &keys, &pair),
        Json(AuthResponse {
            message: "User created successfully".into(),
            user: PublicUser::from(&user),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<
    (
        AppendHeaders<[(HeaderName, String); 2]>,
        Json<AuthResponse>,
    ),
    AppError,
> {
    payload.email = payload.email.trim().to_lowercase();

    // Unknown email and wrong password produce the same response.
    let user = match state
        .users
        .find_by_email(&payload.email)
        .await
        .map_err(AppError::Upstream)?
    {
        Some(user) => user,
        None => {
            warn!(email = %payload.email, "login unknown email");
            return Err(AppError::Unauthorized(INVALID_CREDENTIALS));
        }
    };

    if !user
        .verify_password(&payload.password)
        .map_err(AppError::Internal)?
    {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS));
    }

    let keys = JwtKeys::from_ref(&state);
    let pair = open_session(&state, &keys, user.id).await?;

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok((
        pair_cookies(&state, &keys, &pair),
        Json(AuthResponse {
            message: "Logged in successfully".into(),
            user: PublicUser::from(&user),
        }),
    ))
}

/// Idempotent: succeeds and clears both cookies whether or not a session
/// registry entry exists. A registry error is logged and the orphaned
/// entry is left to expire on its own TTL.
#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> (
    AppendHeaders<[(HeaderName, String); 2]>,
    Json<MessageResponse>,
) {
    let keys = JwtKeys::from_ref(&state);
    if let Some(token) = get_cookie(&headers, REFRESH_COOKIE_NAME) {
        if let Ok(claims) = keys.verify_refresh(token) {
            match state.sessions.delete(claims.sub).await {
                Ok(()) => info!(user_id = %claims.sub, "session revoked"),
                Err(e) => warn!(user_id = %claims.sub, error = %e, "registry delete failed"),
            }
        }
    }

    let secure = state.config.production;
    (
        AppendHeaders([
            (SET_COOKIE, expired_cookie(ACCESS_COOKIE_NAME, secure)),
            (SET_COOKIE, expired_cookie(REFRESH_COOKIE_NAME, secure)),
        ]),
        Json(MessageResponse {
            message: "Logged out successfully".into(),
        }),
    )
}

/// Mint a new access token from a valid refresh token. The refresh token
/// is not rotated; the registry entry and refresh cookie stay as issued
/// at login, so a leaked refresh token is bounded by its own TTL.
#[instrument(skip(state, headers))]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<
    (
        AppendHeaders<[(HeaderName, String); 1]>,
        Json<RefreshResponse>,
    ),
    AppError,
> {
    let token = get_cookie(&headers, REFRESH_COOKIE_NAME)
        .ok_or(AppError::Unauthorized("No refresh token provided"))?;

    let keys = JwtKeys::from_ref(&state);
    let claims = keys.verify_refresh(token).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        AppError::Unauthorized("Invalid refresh token")
    })?;

    // The registry is the authority: if it cannot be read, fail closed.
    let stored = state
        .sessions
        .get(claims.sub)
        .await
        .map_err(AppError::Upstream)?;

    // The presented token must byte-equal the registry entry; anything
    // else is a superseded or replayed token.
    match stored {
        Some(current) if current == token => {}
        _ => {
            warn!(user_id = %claims.sub, "refresh token mismatch");
            return Err(AppError::Forbidden("Invalid refresh token"));
        }
    }

    let access = keys.sign_access(claims.sub).map_err(AppError::Internal)?;

    info!(user_id = %claims.sub, "access token refreshed");
    Ok((
        AppendHeaders([(
            SET_COOKIE,
            auth_cookie(
                ACCESS_COOKIE_NAME,
                &access,
                keys.access_ttl,
                state.config.production,
            ),
        )]),
        Json(RefreshResponse {
            message: "Access token refreshed successfully".into(),
            access_token: access,
        }),
    ))
}

/// Echo the identity the session gate attached.
pub async fn profile(CurrentUser(user): CurrentUser) -> Json<PublicUser> {
    Json(user)
}
