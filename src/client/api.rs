use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by the request pipeline.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Validation(String),
    /// The access token expired and could not be renewed.
    #[error("session expired")]
    SessionExpired,
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Why a refresh attempt failed. Cloneable so every waiter on the shared
/// in-flight refresh observes the same outcome.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh rejected with status {0}")]
    Rejected(u16),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    /// In-flight refresh handle. Installed before the network call starts
    /// and cleared only after it settles, so concurrent failures share one
    /// refresh call instead of each issuing their own.
    refresh_inflight: Mutex<Option<SharedRefresh>>,
}

/// HTTP client for the auth API. The cookie jar carries the token pair;
/// cloning is cheap and clones share the jar and the refresh handle.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                refresh_inflight: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    /// Send a request outside the renewal pipeline. Used for the
    /// credential endpoints, where a 401 means bad credentials and must
    /// not trigger a refresh.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        Ok(build(&self.http()).send().await?)
    }

    /// Send a request through the renewal pipeline. On an unauthorized
    /// response the request is marked retried, the access token is
    /// renewed (joining any refresh already in flight), and the request
    /// is replayed exactly once. A failed renewal propagates the
    /// original unauthorized outcome as `SessionExpired`.
    pub async fn execute<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = build(&self.http()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if let Err(e) = self.refresh_access_token().await {
            warn!(error = %e, "token refresh failed");
            return Err(ClientError::SessionExpired);
        }

        Ok(build(&self.http()).send().await?)
    }

    /// Renew the access token, issuing at most one network call no matter
    /// how many callers arrive while it is underway. All callers observe
    /// the outcome of the same refresh.
    pub async fn refresh_access_token(&self) -> Result<(), RefreshError> {
        let fut = {
            let mut slot = self.inner.refresh_inflight.lock().unwrap();
            match slot.as_ref() {
                Some(inflight) => inflight.clone(),
                None => {
                    let client = self.clone();
                    let fut: SharedRefresh = async move {
                        let result = client.request_refresh().await;
                        // Clear the handle once settled, success or not,
                        // so the next outage starts a fresh refresh.
                        client.inner.refresh_inflight.lock().unwrap().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    async fn request_refresh(&self) -> Result<(), RefreshError> {
        debug!("refreshing access token");
        let response = self
            .http()
            .post(self.url("/auth/refresh-token"))
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RefreshError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }

    fn http(&self) -> reqwest::Client {
        self.inner.http.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cookie::get_cookie;
    use axum::{
        extract::State,
        http::{header::SET_COOKIE, HeaderMap},
        response::{AppendHeaders, IntoResponse},
        routing::{get, post},
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct MockState {
        refresh_calls: Arc<AtomicUsize>,
        refresh_ok: bool,
    }

    /// Protected resource: 200 once the jar carries the refreshed cookie,
    /// 401 before that.
    async fn data(headers: HeaderMap) -> StatusCode {
        match get_cookie(&headers, "accessToken") {
            Some("fresh") => StatusCode::OK,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    async fn refresh(State(state): State<MockState>) -> axum::response::Response {
        state.refresh_calls.fetch_add(1, Ordering::SeqCst);
        // Hold the refresh open long enough for every concurrent caller
        // to pile up behind it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        if state.refresh_ok {
            (
                AppendHeaders([(SET_COOKIE, "accessToken=fresh; Path=/")]),
                "ok",
            )
                .into_response()
        } else {
            StatusCode::UNAUTHORIZED.into_response()
        }
    }

    async fn spawn_mock(refresh_ok: bool) -> (String, Arc<AtomicUsize>) {
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            refresh_calls: refresh_calls.clone(),
            refresh_ok,
        };
        let app = Router::new()
            .route("/data", get(data))
            .route("/auth/refresh-token", post(refresh))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), refresh_calls)
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_refresh() {
        let (base, refresh_calls) = spawn_mock(true).await;
        let client = ApiClient::new(&base).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            let url = client.url("/data");
            handles.push(tokio::spawn(async move {
                client.execute(|http| http.get(&url)).await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().expect("request should succeed");
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_handle_is_cleared_after_settling() {
        let (base, refresh_calls) = spawn_mock(true).await;
        let client = ApiClient::new(&base).unwrap();

        client.refresh_access_token().await.unwrap();
        client.refresh_access_token().await.unwrap();
        // Two sequential calls after each other mean two network calls;
        // the in-flight handle did not linger.
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_degrades_to_session_expired() {
        let (base, _) = spawn_mock(false).await;
        let client = ApiClient::new(&base).unwrap();

        let url = client.url("/data");
        let err = client.execute(|http| http.get(&url)).await.unwrap_err();
        assert!(matches!(err, ClientError::SessionExpired));
    }

    #[tokio::test]
    async fn failed_refresh_is_shared_by_all_waiters() {
        let (base, refresh_calls) = spawn_mock(false).await;
        let client = ApiClient::new(&base).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            handles.push(tokio::spawn(
                async move { client.refresh_access_token().await },
            ));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, RefreshError::Rejected(401)));
        }
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_response_skips_refresh() {
        let (base, refresh_calls) = spawn_mock(true).await;
        let client = ApiClient::new(&base).unwrap();

        // Prime the jar so /data succeeds on the first try.
        client.refresh_access_token().await.unwrap();
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);

        let url = client.url("/data");
        let response = client.execute(|http| http.get(&url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    }
}
