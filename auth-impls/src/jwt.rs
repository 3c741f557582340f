use api::auth::{AuthResponse, Authorizer};
use api::error::StorageError;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A JWT based authorizer, only allows requests with a verified 'JsonWebToken' signed by the
/// configured issuer key.
///
/// Refer: https://datatracker.ietf.org/doc/html/rfc7519
pub struct JwtAuthorizer {
	key: DecodingKey,
	validation: Validation,
}

/// A set of Claims claimed by 'JsonWebToken'
///
/// Refer: https://datatracker.ietf.org/doc/html/rfc7519#section-4
#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct Claims {
	/// The "sub" (subject) claim identifies the principal that is the subject of the JWT.
	/// It is returned as the caller identity.
	///
	/// Refer: https://datatracker.ietf.org/doc/html/rfc7519#section-4.1.2
	sub: String,
}

const AUTHORIZATION_HEADER: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

impl JwtAuthorizer {
	/// Verifies HS256 tokens signed with a shared `secret`.
	pub fn from_secret(secret: &str) -> Result<Self, StorageError> {
		if secret.is_empty() {
			return Err(StorageError::ConfigurationError("JWT secret must not be empty".to_string()));
		}
		Ok(Self {
			key: DecodingKey::from_secret(secret.as_bytes()),
			validation: Validation::new(Algorithm::HS256),
		})
	}

	/// Verifies RS256 tokens against the issuer's PEM encoded public key.
	pub fn from_rsa_pem(rsa_pem: &str) -> Result<Self, StorageError> {
		let key = DecodingKey::from_rsa_pem(rsa_pem.as_bytes()).map_err(|e| {
			StorageError::ConfigurationError(format!("Invalid JWT RSA public key: {}", e))
		})?;
		Ok(Self { key, validation: Validation::new(Algorithm::RS256) })
	}
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
	async fn verify(
		&self, headers_map: &HashMap<String, String>,
	) -> Result<AuthResponse, StorageError> {
		let auth_header = headers_map
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION_HEADER))
			.map(|(_, value)| value)
			.ok_or(StorageError::AuthError("Authorization header not found.".to_string()))?;

		let token = auth_header
			.strip_prefix(BEARER_PREFIX)
			.ok_or(StorageError::AuthError("Invalid token format.".to_string()))?;

		let claims = decode::<Claims>(token, &self.key, &self.validation)
			.map_err(|e| {
				debug!("Rejected bearer token: {}", e);
				StorageError::AuthError(format!("Authentication failure. {}", e))
			})?
			.claims;

		Ok(AuthResponse { user_token: claims.sub })
	}
}
