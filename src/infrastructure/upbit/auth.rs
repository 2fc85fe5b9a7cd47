//! Per-request bearer tokens: HS256 JWT carrying the access key, a UUID
//! nonce and, for query-bearing calls, the SHA-512 hex hash of the query
//! string.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeCredentials;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha512};
use uuid::Uuid;

#[derive(Serialize)]
struct Claims {
    access_key: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

pub fn bearer_token(
    credentials: &ExchangeCredentials,
    query: Option<&str>,
) -> Result<String, ExchangeError> {
    let query_hash = query.map(|q| hex::encode(Sha512::digest(q.as_bytes())));
    let claims = Claims {
        access_key: credentials.access_key.clone(),
        nonce: Uuid::new_v4().to_string(),
        query_hash_alg: query_hash.as_ref().map(|_| "SHA512"),
        query_hash,
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(credentials.secret_key.as_bytes()),
    )
    .map_err(|e| ExchangeError::Transient {
        reason: format!("jwt signing failed: {e}"),
    })?;
    Ok(format!("Bearer {token}"))
}
