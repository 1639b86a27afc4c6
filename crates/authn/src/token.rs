//! Signed token issuance and validation.
//!
//! Every token is an EdDSA-signed JWT carrying [`Claims`]. The `sub` claim is
//! a [`Subject`] discriminator, so an access token can never pass as a refresh
//! token, and the `jti` claim carries the session binding:
//!
//! | Subject   | `jti`                | Lifetime          |
//! |-----------|----------------------|-------------------|
//! | `access`  | empty                | access time       |
//! | `refresh` | `<session_id>:<key>` | refresh time      |
//! | `session` | `<session_id>`       | refresh time      |
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use warden_authn::{rank::Rank, token::{Subject, TokenIssuer, generate_pkcs8_key}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = TokenIssuer::new("warden", &generate_pkcs8_key())?;
//! let (token, _) =
//!     issuer.generate(Subject::Session, "u1", &Rank::base_user(), "s1", Duration::from_secs(60))?;
//!
//! assert!(issuer.validate(&token, Subject::Session, "s1").is_some());
//! assert!(issuer.validate(&token, Subject::Refresh, "s1").is_none());
//! # Ok(())
//! # }
//! ```

use std::{fmt, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{error::TokenError, rank::Rank, validation::validate_algorithm};

/// DER prefix of an Ed25519 private key in PKCS#8 v1 form.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    /// Short-lived bearer token for API requests.
    Access,
    /// Long-lived token exchanged for access tokens.
    Refresh,
    /// Identifies the device session on the next login.
    Session,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Session => "session",
        })
    }
}

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Token subject.
    pub sub: Subject,
    /// The authenticated user.
    pub userid: String,
    /// The user's tags at issue time.
    pub auth_tags: Rank,
    /// Session binding.
    #[serde(rename = "jti", default)]
    pub id: String,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
}

/// Creates and validates signed tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    issuer: String,
    public_key: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    validation_skip_time: Validation,
}

impl TokenIssuer {
    /// Creates an issuer from an Ed25519 private key in PKCS#8 DER form.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidKey`] if the key is not an Ed25519 PKCS#8 document.
    pub fn new(issuer: impl Into<String>, pkcs8_der: &[u8]) -> Result<Self, TokenError> {
        let issuer = issuer.into();
        if issuer.is_empty() {
            return Err(TokenError::InvalidKey("issuer must not be empty".into()));
        }

        let private = pkcs8_der
            .strip_prefix(&ED25519_PKCS8_PREFIX[..])
            .and_then(|rest| <[u8; 32]>::try_from(rest).ok())
            .map(Zeroizing::new)
            .ok_or_else(|| TokenError::InvalidKey("expected an Ed25519 PKCS#8 key".into()))?;
        let signing_key = SigningKey::from_bytes(&private);
        let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let decoding_key = DecodingKey::from_ed_components(&public_key)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[issuer.as_str()]);

        let mut validation_skip_time = validation.clone();
        validation_skip_time.validate_exp = false;

        Ok(Self {
            issuer,
            public_key,
            encoding_key: EncodingKey::from_ed_der(pkcs8_der),
            decoding_key,
            validation,
            validation_skip_time,
        })
    }

    /// The issuer claim written into every token.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The verifying key, base64url encoded without padding.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Signs `claims` as they are.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if signing fails.
    pub fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &self.encoding_key)
            .map_err(TokenError::Encode)
    }

    /// Issues a token for `userid` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if signing fails.
    pub fn generate(
        &self,
        subject: Subject,
        userid: &str,
        auth_tags: &Rank,
        bound_id: &str,
        ttl: Duration,
    ) -> Result<(String, Claims), TokenError> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: subject,
            userid: userid.to_owned(),
            auth_tags: auth_tags.clone(),
            id: bound_id.to_owned(),
            iat,
            exp: expiry(iat, ttl),
        };
        let token = self.encode(&claims)?;
        Ok((token, claims))
    }

    /// Issues a token carrying the user and tags of `claims` under a new
    /// subject, binding and lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Encode`] if signing fails.
    pub fn generate_from_claims(
        &self,
        claims: &Claims,
        subject: Subject,
        bound_id: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.generate(subject, &claims.userid, &claims.auth_tags, bound_id, ttl)
            .map(|(token, _)| token)
    }

    /// Checks signature, subject, expiry and binding.
    ///
    /// Returns the claims only if every check passes.
    #[must_use]
    pub fn validate(&self, token: &str, subject: Subject, bound_id: &str) -> Option<Claims> {
        self.decode(token, &self.validation)
            .filter(|claims| claims.sub == subject && claims.id == bound_id)
    }

    /// [`validate`](Self::validate) without the expiry check.
    #[must_use]
    pub fn validate_skip_time(
        &self,
        token: &str,
        subject: Subject,
        bound_id: &str,
    ) -> Option<Claims> {
        self.decode(token, &self.validation_skip_time)
            .filter(|claims| claims.sub == subject && claims.id == bound_id)
    }

    /// Checks signature and subject only.
    ///
    /// Used to read the session binding before the session key is known.
    #[must_use]
    pub fn get_claims(&self, token: &str, subject: Subject) -> Option<Claims> {
        self.decode(token, &self.validation_skip_time).filter(|claims| claims.sub == subject)
    }

    fn decode(&self, token: &str, validation: &Validation) -> Option<Claims> {
        let header = decode_header(token)
            .map_err(|e| tracing::debug!(error = %e, "Failed to decode token header"))
            .ok()?;
        validate_algorithm(&format!("{:?}", header.alg))
            .map_err(|e| tracing::debug!(error = %e, "Rejected token algorithm"))
            .ok()?;

        match decode::<Claims>(token, &self.decoding_key, validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "Token rejected");
                None
            },
        }
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generates a fresh Ed25519 private key in PKCS#8 DER form.
///
/// The key material is wrapped in [`Zeroizing`] so it is scrubbed on drop.
#[must_use]
pub fn generate_pkcs8_key() -> Zeroizing<Vec<u8>> {
    pkcs8_from_signing_key(&SigningKey::generate(&mut OsRng))
}

/// Encodes `signing_key` as a PKCS#8 DER document.
#[must_use]
pub fn pkcs8_from_signing_key(signing_key: &SigningKey) -> Zeroizing<Vec<u8>> {
    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(ED25519_PKCS8_PREFIX.to_vec());
    pkcs8_der.extend_from_slice(&*private_bytes);
    pkcs8_der
}

fn expiry(iat: i64, ttl: Duration) -> i64 {
    iat.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::craft_raw_jwt;

    const HOUR: Duration = Duration::from_secs(3600);

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("warden", &generate_pkcs8_key()).unwrap()
    }

    #[test]
    fn test_generate_then_validate() {
        let issuer = issuer();
        let tags = Rank::admin();
        let (token, claims) =
            issuer.generate(Subject::Refresh, "u1", &tags, "sid:key", HOUR).unwrap();

        assert_eq!(claims.iss, "warden");
        assert_eq!(claims.exp - claims.iat, 3600);

        let validated = issuer.validate(&token, Subject::Refresh, "sid:key").unwrap();
        assert_eq!(validated, claims);
        assert_eq!(validated.auth_tags, tags);
    }

    #[test]
    fn test_subject_and_binding_must_match() {
        let issuer = issuer();
        let (token, _) =
            issuer.generate(Subject::Refresh, "u1", &Rank::new(), "sid:key", HOUR).unwrap();

        assert!(issuer.validate(&token, Subject::Access, "sid:key").is_none());
        assert!(issuer.validate(&token, Subject::Refresh, "sid:other").is_none());
        assert!(issuer.validate(&token, Subject::Refresh, "").is_none());
        assert!(issuer.get_claims(&token, Subject::Session).is_none());
        assert!(issuer.get_claims(&token, Subject::Refresh).is_some());
    }

    #[test]
    fn test_expired_token_only_passes_time_skipping_checks() {
        let issuer = issuer();
        let (_, mut claims) =
            issuer.generate(Subject::Refresh, "u1", &Rank::new(), "sid:key", HOUR).unwrap();
        claims.iat -= 7200;
        claims.exp = claims.iat + 60;
        let expired = issuer.encode(&claims).unwrap();

        assert!(issuer.validate(&expired, Subject::Refresh, "sid:key").is_none());
        assert!(issuer.validate_skip_time(&expired, Subject::Refresh, "sid:key").is_some());
        assert!(issuer.validate_skip_time(&expired, Subject::Refresh, "sid:nope").is_none());
        assert_eq!(issuer.get_claims(&expired, Subject::Refresh).unwrap().userid, "u1");
    }

    #[test]
    fn test_generate_from_claims_keeps_identity() {
        let issuer = issuer();
        let (_, claims) =
            issuer.generate(Subject::Refresh, "u1", &Rank::admin(), "sid:key", HOUR).unwrap();

        let access = issuer.generate_from_claims(&claims, Subject::Access, "", HOUR).unwrap();
        let access_claims = issuer.validate(&access, Subject::Access, "").unwrap();
        assert_eq!(access_claims.userid, "u1");
        assert_eq!(access_claims.auth_tags, Rank::admin());
        assert_eq!(access_claims.id, "");
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let ours = issuer();
        let theirs = issuer();
        let (token, _) = theirs.generate(Subject::Access, "u1", &Rank::new(), "", HOUR).unwrap();

        assert!(ours.validate(&token, Subject::Access, "").is_none());
        assert!(ours.get_claims(&token, Subject::Access).is_none());
    }

    #[test]
    fn test_foreign_issuer_is_rejected() {
        let key = generate_pkcs8_key();
        let ours = TokenIssuer::new("warden", &key).unwrap();
        let theirs = TokenIssuer::new("someone-else", &key).unwrap();
        let (token, _) = theirs.generate(Subject::Access, "u1", &Rank::new(), "", HOUR).unwrap();

        assert!(ours.validate(&token, Subject::Access, "").is_none());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let issuer = issuer();
        let (token, _) = issuer.generate(Subject::Access, "u1", &Rank::new(), "", HOUR).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "iss": "warden", "sub": "access", "userid": "admin-user",
                "auth_tags": "admin,user", "jti": "", "iat": 0, "exp": i64::MAX,
            }))
            .unwrap(),
        );
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(issuer.validate(&forged, Subject::Access, "").is_none());
    }

    #[test]
    fn test_algorithm_none_is_rejected() {
        let issuer = issuer();
        let (_, claims) = issuer.generate(Subject::Access, "u1", &Rank::new(), "", HOUR).unwrap();
        let token = craft_raw_jwt(
            &json!({"alg": "none", "typ": "JWT"}),
            &serde_json::to_value(&claims).unwrap(),
        );

        assert!(issuer.get_claims(&token, Subject::Access).is_none());
    }

    #[test]
    fn test_symmetric_algorithm_is_rejected() {
        let issuer = issuer();
        let (_, claims) = issuer.generate(Subject::Access, "u1", &Rank::new(), "", HOUR).unwrap();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(issuer.public_key().as_bytes()),
        )
        .unwrap();

        assert!(issuer.validate(&token, Subject::Access, "").is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let issuer = issuer();
        for token in ["", "a.b", "a.b.c", "not a token at all"] {
            assert!(issuer.get_claims(token, Subject::Access).is_none(), "{token:?}");
        }
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(matches!(TokenIssuer::new("warden", &[0u8; 48]), Err(TokenError::InvalidKey(_))));
        assert!(matches!(
            TokenIssuer::new("warden", &ED25519_PKCS8_PREFIX),
            Err(TokenError::InvalidKey(_))
        ));
        assert!(matches!(
            TokenIssuer::new("", &generate_pkcs8_key()),
            Err(TokenError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_public_key_matches_signing_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let issuer = TokenIssuer::new("warden", &pkcs8_from_signing_key(&signing_key)).unwrap();
        assert_eq!(
            issuer.public_key(),
            URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes())
        );
    }

    #[test]
    fn test_subject_serialization() {
        assert_eq!(serde_json::to_string(&Subject::Refresh).unwrap(), r#""refresh""#);
        assert_eq!(Subject::Access.to_string(), "access");
    }
}
