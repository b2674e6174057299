use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT payload shared by access and refresh tokens. The two token kinds
/// are distinguished by their signing secrets, not by a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,  // user ID
    pub iat: usize, // issued at (unix timestamp)
    pub exp: usize, // expires at (unix timestamp)
}
