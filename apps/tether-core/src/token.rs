use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Default lifetime of an endpoint identity token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::hours(24);

/// What a token authorizes its bearer to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Identity handed to a controlled endpoint on connect.
    #[default]
    Endpoint,
    /// Console access for an operator.
    Controller,
}

/// Claims encoded inside the HS256-signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub scope: TokenScope,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn subject_id(&self) -> &str {
        &self.sub
    }

    /// Returns `Ok(())` while `now` is strictly before the expiry instant.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), TokenError> {
        if now.unix_timestamp() >= self.exp {
            Err(TokenError::Expired)
        } else {
            Ok(())
        }
    }
}

/// A signed credential together with the facts it asserts.
#[derive(Debug, Clone)]
pub struct Token {
    pub subject_id: String,
    pub scope: TokenScope,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    encoded: String,
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn into_string(self) -> String {
        self.encoded
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        TokenError::Invalid(err.to_string())
    }
}

/// Mints and verifies stateless bearer credentials with a server-held secret.
///
/// Validity is decided purely by signature and expiry; there is no revocation
/// list.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, subject_id: &str, scope: TokenScope) -> Result<Token, TokenError> {
        self.issue_at(subject_id, scope, self.ttl, OffsetDateTime::now_utc())
    }

    /// Issue with an explicit lifetime and clock reading.
    pub fn issue_at(
        &self,
        subject_id: &str,
        scope: TokenScope,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<Token, TokenError> {
        // JWT timestamps have second resolution; truncate so the returned
        // instants match what verification will see.
        let issued_at = now.replace_nanosecond(0).unwrap_or(now);
        let expires_at = issued_at + ttl;
        let claims = TokenClaims {
            sub: subject_id.to_string(),
            scope,
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };
        let encoded = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(Token {
            subject_id: claims.sub,
            scope,
            issued_at,
            expires_at,
            encoded,
        })
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    /// Check signature and payload shape, then expiry against `now`.
    pub fn verify_at(&self, token: &str, now: OffsetDateTime) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked below so that `now == exp` counts as expired and
        // tests can inject the clock.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        let data = decode::<TokenClaims>(token, &self.decoding, &validation)?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(TokenError::Invalid("token missing subject".into()));
        }
        claims.ensure_not_expired(now)?;
        Ok(claims)
    }

    /// Verify and additionally require the given scope.
    pub fn verify_scoped(&self, token: &str, scope: TokenScope) -> Result<TokenClaims, TokenError> {
        let claims = self.verify(token)?;
        if claims.scope != scope {
            return Err(TokenError::Invalid(format!(
                "token scope {:?} does not grant {:?} access",
                claims.scope, scope
            )));
        }
        Ok(claims)
    }
}
