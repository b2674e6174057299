use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use super::api::{ApiClient, ClientError};
use crate::auth::dto::{AuthResponse, MessageResponse, PublicUser};

#[derive(Serialize)]
struct SignupBody<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

/// Client-side session state. Owns the authenticated identity and mutates
/// it only through the auth flows; resource requests that outlive the
/// access token are renewed by the `ApiClient` pipeline underneath.
pub struct SessionController {
    api: ApiClient,
    user: Option<PublicUser>,
}

impl SessionController {
    pub fn new(api: ApiClient) -> Self {
        Self { api, user: None }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn current_user(&self) -> Option<&PublicUser> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub async fn signup(
        &mut self,
        name: &str,
        email: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<&PublicUser, ClientError> {
        if password != confirm_password {
            return Err(ClientError::Validation("Passwords do not match".into()));
        }

        let body = SignupBody {
            name,
            email,
            password,
        };
        let url = self.api.url("/auth/signup");
        let response = self.api.send(|http| http.post(&url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let auth: AuthResponse = response.json().await?;
        debug!(user_id = %auth.user.id, "signed up");
        Ok(self.user.insert(auth.user))
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<&PublicUser, ClientError> {
        let body = LoginBody { email, password };
        let url = self.api.url("/auth/login");
        let response = self.api.send(|http| http.post(&url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let auth: AuthResponse = response.json().await?;
        debug!(user_id = %auth.user.id, "logged in");
        Ok(self.user.insert(auth.user))
    }

    /// Fetch the profile through the renewal pipeline and sync local
    /// state with the answer. Any unauthorized outcome, including a
    /// failed refresh, clears the local identity instead of erroring.
    pub async fn check_auth(&mut self) -> Result<Option<&PublicUser>, ClientError> {
        let url = self.api.url("/auth/profile");
        let response = match self.api.execute(|http| http.get(&url)).await {
            Ok(response) => response,
            Err(ClientError::SessionExpired) => {
                self.user = None;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match response.status() {
            StatusCode::OK => {
                let user: PublicUser = response.json().await?;
                Ok(Some(self.user.insert(user)))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                self.user = None;
                Ok(None)
            }
            _ => Err(api_error(response).await),
        }
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        let url = self.api.url("/auth/logout");
        let response = self.api.send(|http| http.post(&url)).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        self.user = None;
        Ok(())
    }
}

async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let message = response
        .json::<MessageResponse>()
        .await
        .map(|m| m.message)
        .unwrap_or_else(|_| "request failed".to_string());
    ClientError::Api { status, message }
}
