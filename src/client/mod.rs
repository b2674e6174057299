//! Client-side SDK for the auth endpoints: a session controller owning
//! the authenticated identity and a request pipeline that transparently
//! renews expired access tokens with a single-flight refresh.

pub mod api;
pub mod session;

pub use api::{ApiClient, ClientError, RefreshError};
pub use session::SessionController;
