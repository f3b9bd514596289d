use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::models::{AccessClaims, Principal, Session};

/// Decode access-token claims. With a secret the signature and expiry are checked;
/// without one the payload is read as-is, which is only good for display and routing.
pub fn decode_claims(
    token: &str,
    secret: Option<&[u8]>,
) -> Result<AccessClaims, jsonwebtoken::errors::Error> {
    let token_data = match secret {
        Some(secret) => {
            let mut validation = Validation::new(Algorithm::HS256);
            // auth-service tokens carry aud = "authenticated"
            validation.validate_aud = false;
            decode::<AccessClaims>(token, &DecodingKey::from_secret(secret), &validation)?
        }
        None => {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.insecure_disable_signature_validation();
            validation.validate_exp = false;
            validation.validate_aud = false;
            decode::<AccessClaims>(token, &DecodingKey::from_secret(&[]), &validation)?
        }
    };
    Ok(token_data.claims)
}

/// Build a session around a bare access token, taking the principal and expiry from its claims.
pub fn session_from_token(
    token: &str,
    secret: Option<&[u8]>,
) -> Result<Session, jsonwebtoken::errors::Error> {
    let claims = decode_claims(token, secret)?;
    Ok(Session {
        access_token: token.to_string(),
        refresh_token: None,
        token_type: "bearer".to_string(),
        expires_in: None,
        expires_at: Some(claims.exp as i64),
        user: Some(Principal {
            id: claims.sub,
            email: claims.email,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    /// HS256 token shaped like the auth service's.
    fn create_access_token(
        principal: &Principal,
        secret: &[u8],
        ttl_secs: u64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = AccessClaims {
            sub: principal.id.clone(),
            exp: (SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + ttl_secs)
                as usize,
            email: principal.email.clone(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
    }

    fn ada() -> Principal {
        Principal {
            id: "2b1c0d6e-0000-4000-8000-000000000001".into(),
            email: Some("ada@example.org".into()),
        }
    }

    #[test]
    fn verified_decode_round_trips_principal() {
        let token = create_access_token(&ada(), SECRET, 3600).unwrap();
        let claims = decode_claims(&token, Some(SECRET)).unwrap();
        assert_eq!(claims.sub, ada().id);
        assert_eq!(claims.email.as_deref(), Some("ada@example.org"));
    }

    #[test]
    fn wrong_secret_is_rejected_but_unverified_read_works() {
        let token = create_access_token(&ada(), SECRET, 3600).unwrap();
        assert!(decode_claims(&token, Some(b"other")).is_err());
        assert_eq!(decode_claims(&token, None).unwrap().sub, ada().id);
    }

    #[test]
    fn session_from_token_fills_principal_and_expiry() {
        let token = create_access_token(&ada(), SECRET, 60).unwrap();
        let session = session_from_token(&token, None).unwrap();
        assert_eq!(session.principal(), Some(&ada()));
        assert!(session.expires_at.unwrap() > 0);
        assert!(session.refresh_token.is_none());
    }
}
