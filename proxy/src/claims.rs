use crate::config::{ApiKeyEntry, ApiKeys};
use crate::errors::{ProxyError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_role() -> String {
    "nobody".into()
}

fn default_domain() -> String {
    "default".into()
}

/// Attributes extracted from a verified token. Absent claims fall back to
/// neutral values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default = "default_role")]
    pub role: String,
    /// Human-readable download rate like `10M`; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "remoteAddress", default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub ads: bool,
}

impl Default for Claims {
    fn default() -> Self {
        Claims {
            role: default_role(),
            rate: None,
            domain: default_domain(),
            session_id: String::new(),
            remote_address: None,
            agent: None,
            ads: false,
        }
    }
}

/// Verifies request tokens against the secret bound to their API key and
/// issues tokens for the static-asset whitelist.
pub struct Auth {
    keys: Arc<ApiKeys>,
    validation: Validation,
}

impl Auth {
    pub fn new(keys: Arc<ApiKeys>) -> Self {
        // HS256 only; tokens carry no registered claims
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self { keys, validation }
    }

    /// Verify `token` against the secret bound to `api_key`. With no API
    /// keys configured the proxy runs open and every request gets neutral
    /// claims.
    pub fn claims(&self, token: &str, api_key: &str) -> Result<(Claims, Option<&ApiKeyEntry>)> {
        if self.keys.is_empty() {
            return Ok((Claims::default(), None));
        }
        let entry = self
            .keys
            .get(api_key)
            .ok_or_else(|| ProxyError::Auth(format!("unknown api key {api_key:?}")))?;
        if token.is_empty() {
            return Err(ProxyError::Auth("missing token".into()));
        }
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(entry.secret.as_bytes()),
            &self.validation,
        )
        .map_err(|e| ProxyError::Auth(format!("invalid token: {e}")))?;
        Ok((data.claims, Some(entry)))
    }

    /// Sign a fresh token under the given API key's secret.
    pub fn sign(&self, api_key: &str, claims: &Claims) -> Result<String> {
        let entry = self
            .keys
            .get(api_key)
            .ok_or_else(|| ProxyError::Auth(format!("unknown api key {api_key:?}")))?;
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(entry.secret.as_bytes()),
        )
        .map_err(|e| ProxyError::Auth(format!("failed to sign token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyEntry;

    fn keyed_auth() -> Auth {
        Auth::new(Arc::new(ApiKeys(vec![ApiKeyEntry {
            name: "player".into(),
            api_key: "k1".into(),
            secret: "topsecret".into(),
        }])))
    }

    fn sample_claims() -> Claims {
        Claims {
            role: "premium".into(),
            rate: Some("10M".into()),
            domain: "example.com".into(),
            session_id: "sess-1".into(),
            remote_address: Some("1.1.1.1".into()),
            agent: Some("A".into()),
            ads: true,
        }
    }

    #[test]
    fn open_mode_returns_neutral_claims() {
        let auth = Auth::new(Arc::new(ApiKeys::default()));
        let (claims, entry) = auth.claims("", "").unwrap();
        assert_eq!(claims.role, "nobody");
        assert_eq!(claims.domain, "default");
        assert!(claims.rate.is_none());
        assert!(entry.is_none());
    }

    #[test]
    fn round_trip_preserves_claims() {
        let auth = keyed_auth();
        let token = auth.sign("k1", &sample_claims()).unwrap();
        let (claims, entry) = auth.claims(&token, "k1").unwrap();
        assert_eq!(claims, sample_claims());
        assert_eq!(entry.map(|e| e.name.as_str()), Some("player"));
    }

    #[test]
    fn tampered_token_rejected() {
        let auth = keyed_auth();
        let token = auth.sign("k1", &sample_claims()).unwrap();
        let mut tampered = token.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(matches!(
            auth.claims(&tampered, "k1"),
            Err(ProxyError::Auth(_))
        ));
    }

    #[test]
    fn unknown_api_key_rejected() {
        let auth = keyed_auth();
        let token = auth.sign("k1", &sample_claims()).unwrap();
        assert!(matches!(
            auth.claims(&token, "other"),
            Err(ProxyError::Auth(_))
        ));
    }

    #[test]
    fn missing_token_rejected() {
        let auth = keyed_auth();
        assert!(matches!(auth.claims("", "k1"), Err(ProxyError::Auth(_))));
    }

    #[test]
    fn non_hmac_sha256_signature_rejected() {
        let auth = keyed_auth();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &sample_claims(),
            &EncodingKey::from_secret(b"topsecret"),
        )
        .unwrap();
        assert!(matches!(
            auth.claims(&token, "k1"),
            Err(ProxyError::Auth(_))
        ));
    }

    #[test]
    fn absent_fields_default_neutral() {
        let auth = keyed_auth();
        // token carrying only a session id
        #[derive(Serialize)]
        struct Sparse {
            #[serde(rename = "sessionID")]
            session_id: String,
        }
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &Sparse {
                session_id: "s".into(),
            },
            &EncodingKey::from_secret(b"topsecret"),
        )
        .unwrap();
        let (claims, _) = auth.claims(&token, "k1").unwrap();
        assert_eq!(claims.role, "nobody");
        assert_eq!(claims.domain, "default");
        assert_eq!(claims.session_id, "s");
        assert!(!claims.ads);
    }
}
