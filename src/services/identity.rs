//! Identity verification for room connections.
//!
//! Tokens are opaque to this service: an external identity service (or, for local development,
//! a static token table) resolves them to a member id and a display name.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::IdentityConfig;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Member resolved from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub member_id: String,
    pub display_name: String,
}

/// Verification failures.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The token is invalid, expired or unknown.
    #[error("token rejected: {0}")]
    Rejected(String),
    /// The identity service could not answer.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Resolves bearer tokens to identities.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: String) -> BoxFuture<'static, Result<Identity, IdentityError>>;
}

/// Fixed token table, used for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityVerifier {
    tokens: Arc<HashMap<String, Identity>>,
}

impl StaticIdentityVerifier {
    /// Build a verifier accepting exactly the given `(token, identity)` pairs.
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: Arc::new(tokens.into_iter().collect()),
        }
    }

    fn lookup(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

impl IdentityVerifier for StaticIdentityVerifier {
    fn verify(&self, token: String) -> BoxFuture<'static, Result<Identity, IdentityError>> {
        let result = self
            .lookup(&token)
            .ok_or_else(|| IdentityError::Rejected("unknown token".into()));
        Box::pin(async move { result })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    member_id: String,
    display_name: String,
}

/// Client of an HTTP identity service exposing `GET {base}/verify` with a bearer token.
///
/// Static tokens, when configured, are checked first.
#[derive(Clone)]
pub struct HttpIdentityVerifier {
    client: Client,
    verify_url: Arc<str>,
    fallback: StaticIdentityVerifier,
}

impl HttpIdentityVerifier {
    /// Build a client for the service rooted at `base_url`.
    pub fn new(
        base_url: &str,
        fallback: StaticIdentityVerifier,
    ) -> Result<Self, IdentityError> {
        let client = Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            verify_url: Arc::from(format!("{}/verify", base_url.trim_end_matches('/'))),
            fallback,
        })
    }
}

impl IdentityVerifier for HttpIdentityVerifier {
    fn verify(&self, token: String) -> BoxFuture<'static, Result<Identity, IdentityError>> {
        if let Some(identity) = self.fallback.lookup(&token) {
            return Box::pin(async move { Ok(identity) });
        }

        let request = self.client.get(self.verify_url.as_ref()).bearer_auth(token);
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|err| IdentityError::Unavailable(err.to_string()))?;

            match response.status() {
                status if status.is_success() => {
                    let body: VerifyResponse = response
                        .json()
                        .await
                        .map_err(|err| IdentityError::Unavailable(err.to_string()))?;
                    debug!(member = %body.member_id, "identity verified");
                    Ok(Identity {
                        member_id: body.member_id,
                        display_name: body.display_name,
                    })
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(
                    IdentityError::Rejected(format!("identity service answered {}", response.status())),
                ),
                other => Err(IdentityError::Unavailable(format!(
                    "identity service answered {other}"
                ))),
            }
        })
    }
}

/// Verifier matching the configuration: remote service when a base URL is set, otherwise the
/// static token table alone.
pub fn from_config(config: &IdentityConfig) -> Result<Arc<dyn IdentityVerifier>, IdentityError> {
    let fallback = StaticIdentityVerifier::new(config.static_tokens.iter().map(
        |(token, (member_id, display_name))| {
            (
                token.clone(),
                Identity {
                    member_id: member_id.clone(),
                    display_name: display_name.clone(),
                },
            )
        },
    ));

    match config.base_url.as_deref() {
        Some(base_url) => Ok(Arc::new(HttpIdentityVerifier::new(base_url, fallback)?)),
        None => Ok(Arc::new(fallback)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            member_id: "alice".into(),
            display_name: "Alice".into(),
        }
    }

    #[tokio::test]
    async fn static_tokens_resolve_identities() {
        let verifier = StaticIdentityVerifier::new([("t-alice".to_string(), alice())]);
        assert_eq!(verifier.verify("t-alice".into()).await.unwrap(), alice());
        assert!(matches!(
            verifier.verify("forged".into()).await,
            Err(IdentityError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn configuration_without_service_uses_static_table() {
        let mut config = IdentityConfig::default();
        config
            .static_tokens
            .insert("t-alice".into(), ("alice".into(), "Alice".into()));
        let verifier = from_config(&config).unwrap();
        assert_eq!(verifier.verify("t-alice".into()).await.unwrap(), alice());
    }

    #[tokio::test]
    async fn static_tokens_bypass_the_remote_service() {
        let verifier = HttpIdentityVerifier::new(
            "http://127.0.0.1:9/",
            StaticIdentityVerifier::new([("t-alice".to_string(), alice())]),
        )
        .unwrap();
        assert_eq!(verifier.verify("t-alice".into()).await.unwrap(), alice());
    }
}
