//! Key-pair JWT authentication for the Snowflake SQL API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use outflow_types::error::{ConnectorError, Result};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// `<ACCOUNT>.<USER>.SHA256:<public key fingerprint>`
    iss: String,
    /// `<ACCOUNT>.<USER>`
    sub: String,
    iat: u64,
    exp: u64,
}

pub(crate) struct KeyPairAuth {
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
    lifetime_secs: u64,
    token: String,
    expires_at: SystemTime,
}

/// Account locator as it appears in JWT claims: the part before any region
/// or cloud suffix, uppercased.
fn claim_account(account: &str) -> String {
    account
        .split('.')
        .next()
        .unwrap_or(account)
        .to_uppercase()
}

impl KeyPairAuth {
    pub(crate) fn new(
        account: &str,
        user: &str,
        private_key_pem: &str,
        lifetime_secs: u64,
    ) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).map_err(|e| {
            ConnectorError::config("INVALID_PRIVATE_KEY", format!("snowflake private key: {e}"))
        })?;

        let public_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| ConnectorError::config("INVALID_PRIVATE_KEY", e.to_string()))?;
        let fingerprint = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(public_der.as_bytes()));

        let subject = format!("{}.{}", claim_account(account), user.to_uppercase());
        let issuer = format!("{subject}.SHA256:{fingerprint}");

        // The signer expects a PKCS#1 `RSAPrivateKey`, not the PKCS#8 wrapper.
        let private_der = private_key
            .to_pkcs1_der()
            .map_err(|e| ConnectorError::config("INVALID_PRIVATE_KEY", e.to_string()))?;

        Ok(Self {
            encoding_key: EncodingKey::from_rsa_der(private_der.as_bytes()),
            issuer,
            subject,
            lifetime_secs,
            token: String::new(),
            expires_at: UNIX_EPOCH,
        })
    }

    fn needs_refresh(&self) -> bool {
        SystemTime::now()
            .checked_add(REFRESH_BUFFER)
            .map_or(true, |check| check >= self.expires_at)
    }

    fn refresh(&mut self) -> Result<()> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ConnectorError::internal("CLOCK", e.to_string()))?
            .as_secs();
        let exp = iat + self.lifetime_secs;
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };
        self.token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ConnectorError::internal("JWT_ENCODE", e.to_string()))?;
        self.expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        tracing::debug!(subject = %self.subject, "Generated Snowflake JWT");
        Ok(())
    }

    /// Current token, regenerated within five minutes of expiry.
    pub(crate) fn token(&mut self) -> Result<String> {
        if self.needs_refresh() {
            self.refresh()?;
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_rsa_key.pem");

    fn claims_of(token: &str) -> Claims {
        let payload = token.split('.').nth(1).unwrap();
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn claims_carry_account_user_and_fingerprint() {
        let mut auth = KeyPairAuth::new("xy12345.us-east-1", "loader", TEST_KEY, 3600).unwrap();
        let claims = claims_of(&auth.token().unwrap());
        assert_eq!(claims.sub, "XY12345.LOADER");
        assert!(claims.iss.starts_with("XY12345.LOADER.SHA256:"));
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn token_verifies_with_the_public_key() {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        use rsa::pkcs8::LineEnding;

        let public_pem = RsaPrivateKey::from_pkcs8_pem(TEST_KEY)
            .unwrap()
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let mut auth = KeyPairAuth::new("acct", "loader", TEST_KEY, 3600).unwrap();
        let token = auth.token().unwrap();

        let key = DecodingKey::from_rsa_pem(public_pem.as_bytes()).unwrap();
        let verified = decode::<Claims>(&token, &key, &Validation::new(Algorithm::RS256)).unwrap();
        assert_eq!(verified.claims.sub, "ACCT.LOADER");
    }

    #[test]
    fn token_is_reused_until_near_expiry() {
        let mut auth = KeyPairAuth::new("acct", "u", TEST_KEY, 3600).unwrap();
        let first = auth.token().unwrap();
        assert_eq!(auth.token().unwrap(), first);
    }

    #[test]
    fn short_lifetime_always_refreshes() {
        let mut auth = KeyPairAuth::new("acct", "u", TEST_KEY, 60).unwrap();
        auth.token().unwrap();
        assert!(auth.needs_refresh());
    }

    #[test]
    fn rejects_garbage_key() {
        let err = KeyPairAuth::new("acct", "u", "nope", 3600).err().unwrap();
        assert_eq!(err.code, "INVALID_PRIVATE_KEY");
    }
}
