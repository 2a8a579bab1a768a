//! OAuth access tokens for Google APIs.
//!
//! Service-account credentials are exchanged via the JWT bearer grant and
//! cached until five minutes before expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use outflow_types::error::{ConnectorError, ErrorCategory, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::config::Credentials;
use crate::http;

const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        SystemTime::now()
            .checked_add(REFRESH_BUFFER)
            .is_some_and(|check| check < self.expires_at)
    }
}

pub(crate) struct TokenProvider {
    http: reqwest::Client,
    credentials: Credentials,
    cached: Mutex<Option<CachedToken>>,
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| ConnectorError::internal("CLOCK", e.to_string()))
}

impl TokenProvider {
    pub(crate) fn new(http: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, exchanging a fresh assertion when needed.
    pub(crate) async fn token(&self) -> Result<String> {
        let (client_email, private_key, token_uri) = match &self.credentials {
            Credentials::AccessToken { token } => return Ok(token.expose_secret().to_string()),
            Credentials::ServiceAccount {
                client_email,
                private_key,
                token_uri,
            } => (client_email, private_key, token_uri),
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }

        let key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes()).map_err(|e| {
            ConnectorError::config("INVALID_PRIVATE_KEY", format!("service account key: {e}"))
        })?;
        let iat = unix_now()?;
        let claims = AssertionClaims {
            iss: client_email,
            scope: SCOPE,
            aud: token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ConnectorError::internal("JWT_ENCODE", e.to_string()))?;

        let response = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;
        // A 400 here means the grant was refused.
        let response: TokenResponse = http::json(response).await.map_err(|e| {
            if e.category == ErrorCategory::Data {
                ConnectorError::auth("TOKEN_EXCHANGE", e.message)
            } else {
                e
            }
        })?;

        let lifetime = if response.expires_in == 0 {
            ASSERTION_LIFETIME_SECS
        } else {
            response.expires_in
        };
        tracing::debug!(client_email = %client_email, lifetime_secs = lifetime, "Issued Google access token");
        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            token: response.access_token,
            expires_at: SystemTime::now() + Duration::from_secs(lifetime),
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SensitiveString;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_rsa_key.pem");

    fn service_account(server: &MockServer) -> Credentials {
        Credentials::ServiceAccount {
            client_email: "outflow@acme.iam.gserviceaccount.com".into(),
            private_key: SensitiveString::new(TEST_KEY),
            token_uri: format!("{}/token", server.uri()),
        }
    }

    #[tokio::test]
    async fn static_token_passes_through() {
        let provider = TokenProvider::new(
            reqwest::Client::new(),
            Credentials::AccessToken {
                token: SensitiveString::new("ya29.static"),
            },
        );
        assert_eq!(provider.token().await.unwrap(), "ya29.static");
    }

    #[tokio::test]
    async fn exchanges_once_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("jwt-bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.issued",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), service_account(&server));
        assert_eq!(provider.token().await.unwrap(), "ya29.issued");
        assert_eq!(provider.token().await.unwrap(), "ya29.issued");
    }

    #[tokio::test]
    async fn rejected_assertion_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let provider = TokenProvider::new(reqwest::Client::new(), service_account(&server));
        let err = provider.token().await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn malformed_key_is_config_error() {
        let provider = TokenProvider::new(
            reqwest::Client::new(),
            Credentials::ServiceAccount {
                client_email: "x".into(),
                private_key: SensitiveString::new("not a key"),
                token_uri: "http://127.0.0.1:9/token".into(),
            },
        );
        let err = provider.token().await.unwrap_err();
        assert_eq!(err.code, "INVALID_PRIVATE_KEY");
    }
}
