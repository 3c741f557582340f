use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Identity of a caller that passed an [`Authorizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
	/// Identifies the authenticated caller, e.g. the `sub` claim of a bearer token.
	pub user_token: String,
}

/// Interface for the authorizer run before every mutating storage call.
#[async_trait]
pub trait Authorizer: Send + Sync {
	/// Verifies the request headers. Returns [`AuthResponse`] for an authorized caller or
	/// [`StorageError::AuthError`] otherwise.
	async fn verify(
		&self, headers_map: &HashMap<String, String>,
	) -> Result<AuthResponse, StorageError>;
}

/// A no-operation authorizer, which lets every request through.
pub struct NoopAuthorizer {}

const UNAUTHENTICATED_USER: &str = "unauth-user";

#[async_trait]
impl Authorizer for NoopAuthorizer {
	async fn verify(
		&self, _headers_map: &HashMap<String, String>,
	) -> Result<AuthResponse, StorageError> {
		Ok(AuthResponse { user_token: UNAUTHENTICATED_USER.to_string() })
	}
}
