//! Binds bearer tokens to namespaces.
//!
//! A token has the form `<namespace>.<secret>`; the registry stores the
//! hex-encoded SHA-256 of the whole token. The namespace prefix makes the
//! lookup cheap and keeps the token otherwise opaque.

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::{Error, Result};

/// Namespace that test mode maps unauthenticated requests to.
pub const DEFAULT_NAMESPACE: &str = "default";

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Hex-encoded SHA-256 of a token, as stored in the registry.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Mints a fresh token for a namespace.
pub fn mint_token(namespace: &str) -> String {
    format!("{namespace}.{}", Uuid::new_v4().simple())
}

/// The namespace id a token claims, without verifying it.
pub fn token_namespace(token: &str) -> Result<&str> {
    token
        .split_once('.')
        .map(|(namespace, _)| namespace)
        .filter(|namespace| !namespace.is_empty())
        .ok_or(Error::InvalidToken)
}

/// Resolves the request's namespace from the `Authorization` header or,
/// for clients that can't set headers, a `token` query parameter. In test
/// mode any missing or invalid credential maps to [`DEFAULT_NAMESPACE`],
/// which is auto-created on first use.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<String> {
    let token = extract_bearer(headers).or(query_token);

    match verify(state, token).await {
        Ok(namespace) => Ok(namespace),
        Err(err) => match err {
            Error::AuthRequired | Error::InvalidToken if state.test_mode => {
                ensure_default(state).await?;
                Ok(DEFAULT_NAMESPACE.to_string())
            }
            err => Err(err),
        },
    }
}

async fn verify(state: &AppState, token: Option<&str>) -> Result<String> {
    let token = token.ok_or(Error::AuthRequired)?;
    let namespace = token_namespace(token)?;

    let record = match state.store.get_namespace(namespace).await {
        Ok(record) => record,
        // Don't leak which namespaces exist to unauthenticated callers.
        Err(Error::NamespaceNotFound(_)) => return Err(Error::InvalidToken),
        Err(err) => return Err(err),
    };

    if record.token_hash != token_hash(token) {
        return Err(Error::InvalidToken);
    }

    Ok(namespace.to_string())
}

/// Creates the `default` namespace if it does not exist yet. Guarded by a
/// mutex so concurrent first-writes race only one creation.
pub async fn ensure_default(state: &AppState) -> Result<()> {
    let _guard = state.default_ns_init.lock().await;

    match state.store.get_namespace(DEFAULT_NAMESPACE).await {
        Ok(_) => Ok(()),
        Err(Error::NamespaceNotFound(_)) => {
            let token = state
                .default_token
                .clone()
                .unwrap_or_else(|| mint_token(DEFAULT_NAMESPACE));
            state
                .store
                .create_namespace(DEFAULT_NAMESPACE, &token_hash(&token), "", None)
                .await?;
            info!("auto-created default namespace");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
