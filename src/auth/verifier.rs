use super::claims::{Audience, SessionClaims};
use crate::errors::AccessError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use thiserror::Error;

/// VerifyFailure
///
/// Outcome of a single verification stage. `IssuerMismatch` is the only failure that lets the
/// strict stage hand over to the legacy stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    #[error("token expired")]
    Expired,
    #[error("token malformed or signature invalid")]
    Malformed,
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("issuer mismatch")]
    IssuerMismatch,
}

impl From<VerifyFailure> for AccessError {
    fn from(failure: VerifyFailure) -> Self {
        match failure {
            VerifyFailure::Expired => AccessError::TokenExpired,
            VerifyFailure::AudienceMismatch => AccessError::AudienceMismatch,
            VerifyFailure::Malformed | VerifyFailure::IssuerMismatch => AccessError::TokenInvalid,
        }
    }
}

fn classify(err: &jsonwebtoken::errors::Error) -> VerifyFailure {
    match err.kind() {
        ErrorKind::ExpiredSignature => VerifyFailure::Expired,
        ErrorKind::InvalidAudience => VerifyFailure::AudienceMismatch,
        ErrorKind::InvalidIssuer => VerifyFailure::IssuerMismatch,
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => VerifyFailure::IssuerMismatch,
        _ => VerifyFailure::Malformed,
    }
}

/// TokenVerifier
///
/// Signature and claim validation for session tokens, as two explicit stages:
///
/// 1. `verify_strict`: issuer required and checked.
/// 2. `verify_legacy`: for tokens minted before issuers existed. It only accepts tokens that
///    carry no issuer at all, so a token from a foreign issuer can never slip through.
///
/// `verify` runs the legacy stage only when the strict stage failed on the issuer. Signature,
/// expiry and audience failures are final.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    issuer: String,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    fn base_validation(audience: Audience) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_audience(&[audience.as_str()]);
        validation
    }

    pub fn verify_strict(
        &self,
        token: &str,
        audience: Audience,
    ) -> Result<SessionClaims, VerifyFailure> {
        let mut validation = Self::base_validation(audience);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "sub", "iss"]);

        decode::<SessionClaims>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| classify(&e))
    }

    pub fn verify_legacy(
        &self,
        token: &str,
        audience: Audience,
    ) -> Result<SessionClaims, VerifyFailure> {
        let mut validation = Self::base_validation(audience);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        let claims = decode::<SessionClaims>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| classify(&e))?;

        if claims.iss.is_some() {
            return Err(VerifyFailure::IssuerMismatch);
        }
        Ok(claims)
    }

    /// Verifies `token` for `audience`, falling back to the legacy stage on issuer errors only.
    pub fn verify(&self, token: &str, audience: Audience) -> Result<SessionClaims, VerifyFailure> {
        let claims = match self.verify_strict(token, audience) {
            Ok(claims) => claims,
            Err(VerifyFailure::IssuerMismatch) => {
                let claims = self.verify_legacy(token, audience)?;
                tracing::debug!(sub = %claims.sub, %audience, "accepted legacy token without issuer");
                claims
            }
            Err(other) => return Err(other),
        };

        if claims.aud != audience {
            return Err(VerifyFailure::AudienceMismatch);
        }
        if audience == Audience::Gallery && claims.event_id.is_none() {
            return Err(VerifyFailure::Malformed);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    const SECRET: &str = "verifier-test-secret";
    const ISSUER: &str = "gallery-gate";

    fn claims(aud: Audience, iss: Option<&str>, exp_offset: i64) -> SessionClaims {
        let now = Utc::now().timestamp();
        SessionClaims {
            sub: Uuid::from_u128(1).to_string(),
            aud,
            event_id: (aud == Audience::Gallery).then(|| Uuid::from_u128(2)),
            iat: now,
            exp: now + exp_offset,
            sid: None,
            ip: None,
            iss: iss.map(str::to_string),
        }
    }

    fn sign(claims: &SessionClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(SECRET, ISSUER)
    }

    #[test]
    fn strict_accepts_matching_issuer() {
        let token = sign(&claims(Audience::Admin, Some(ISSUER), 600), SECRET);
        assert!(verifier().verify_strict(&token, Audience::Admin).is_ok());
    }

    #[test]
    fn strict_flags_missing_issuer_as_issuer_error() {
        let token = sign(&claims(Audience::Admin, None, 600), SECRET);
        assert_eq!(
            verifier().verify_strict(&token, Audience::Admin),
            Err(VerifyFailure::IssuerMismatch)
        );
    }

    #[test]
    fn legacy_rejects_tokens_with_foreign_issuer() {
        let token = sign(&claims(Audience::Admin, Some("someone-else"), 600), SECRET);
        assert_eq!(
            verifier().verify_legacy(&token, Audience::Admin),
            Err(VerifyFailure::IssuerMismatch)
        );
        assert_eq!(
            verifier().verify(&token, Audience::Admin),
            Err(VerifyFailure::IssuerMismatch)
        );
    }

    #[test]
    fn verify_falls_back_for_issuerless_tokens() {
        let token = sign(&claims(Audience::Gallery, None, 600), SECRET);
        let decoded = verifier().verify(&token, Audience::Gallery).unwrap();
        assert_eq!(decoded.iss, None);
    }

    #[test]
    fn bad_signature_never_falls_back() {
        let token = sign(&claims(Audience::Admin, None, 600), "another-secret");
        assert_eq!(
            verifier().verify(&token, Audience::Admin),
            Err(VerifyFailure::Malformed)
        );
    }

    #[test]
    fn expired_legacy_token_reports_expiry() {
        let token = sign(&claims(Audience::Admin, None, -3600), SECRET);
        assert_eq!(
            verifier().verify(&token, Audience::Admin),
            Err(VerifyFailure::Expired)
        );
    }

    #[test]
    fn audience_is_enforced() {
        let token = sign(&claims(Audience::Gallery, Some(ISSUER), 600), SECRET);
        assert_eq!(
            verifier().verify(&token, Audience::Admin),
            Err(VerifyFailure::AudienceMismatch)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            verifier().verify("not-a-token", Audience::Admin),
            Err(VerifyFailure::Malformed)
        );
    }
}
