//! Signed persistent-identity tokens.
//!
//! A token is the string `"{visitor_id}.{signature}.{created_at_ms}"` where
//! `signature` is the first 16 hex chars of `HMAC_SHA256(secret, visitor_id)`.
//! The 16-hex truncation is a capacity/bandwidth trade: long enough to resist
//! online guessing at realistic request rates, short enough to fit in a
//! cookie and stay human-legible.
//!
//! Malformed or bad-signature tokens are reported to the caller but must
//! never fail a request; the caller treats them as absent.

use chrono::Utc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;
use visit_models::hmac_sha256_hex;

/// Truncated signature width, in hex chars (8 raw bytes).
pub const SIGNATURE_HEX_WIDTH: usize = 16;

/// Default token lifetime: 365 days.
pub const DEFAULT_MAX_AGE_MS: i64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed identity token: {0}")]
    Malformed(&'static str),
}

/// Parsed token fields, signature still unverified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub visitor_id: Uuid,
    pub signature: String,
    pub created_at_ms: i64,
}

/// Outcome of [`IdentitySigner::validate`].
#[derive(Debug, Clone, Default)]
pub struct TokenValidation {
    pub valid: bool,
    pub visitor_id: Option<Uuid>,
    pub needs_refresh: bool,
    pub refreshed_token: Option<String>,
}

/// Split a token into its three dot-separated parts. UUIDs contain no dots,
/// so a strict three-way split is unambiguous.
pub fn parse(token: &str) -> Result<ParsedToken, TokenError> {
    let mut parts = token.split('.');
    let (vid, sig, ts) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(s), Some(t), None) => (v, s, t),
        _ => return Err(TokenError::Malformed("expected three dot-separated parts")),
    };
    let visitor_id =
        Uuid::parse_str(vid).map_err(|_| TokenError::Malformed("visitor id is not a uuid"))?;
    if sig.len() != SIGNATURE_HEX_WIDTH || !sig.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TokenError::Malformed("signature is not 16 hex chars"));
    }
    let created_at_ms = ts
        .parse::<i64>()
        .map_err(|_| TokenError::Malformed("timestamp is not numeric"))?;
    Ok(ParsedToken {
        visitor_id,
        signature: sig.to_ascii_lowercase(),
        created_at_ms,
    })
}

/// HMAC signer over a process-wide secret.
///
/// The secret is read once at startup and must not appear in logs or error
/// messages; `Debug` is implemented by hand to keep it out of format output.
pub struct IdentitySigner {
    secret: Vec<u8>,
    max_age_ms: i64,
}

impl std::fmt::Debug for IdentitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySigner")
            .field("secret", &"<redacted>")
            .field("max_age_ms", &self.max_age_ms)
            .finish()
    }
}

impl IdentitySigner {
    pub fn new(secret: impl Into<Vec<u8>>, max_age_ms: i64) -> Self {
        Self {
            secret: secret.into(),
            max_age_ms: max_age_ms.max(1),
        }
    }

    pub fn max_age_ms(&self) -> i64 {
        self.max_age_ms
    }

    fn signature_for(&self, visitor_id: &Uuid) -> String {
        let mac = hmac_sha256_hex(&self.secret, visitor_id.to_string().as_bytes());
        mac[..SIGNATURE_HEX_WIDTH].to_string()
    }

    /// Sign a visitor id, stamping the current time.
    pub fn sign(&self, visitor_id: &Uuid) -> String {
        self.sign_at(visitor_id, Utc::now().timestamp_millis())
    }

    /// Sign with an explicit timestamp. Exposed for age-policy tests.
    pub fn sign_at(&self, visitor_id: &Uuid, created_at_ms: i64) -> String {
        format!(
            "{}.{}.{}",
            visitor_id,
            self.signature_for(visitor_id),
            created_at_ms
        )
    }

    /// Constant-time check of a truncated signature against the expected one.
    ///
    /// Comparison runs over the raw 8 signature bytes so the match time does
    /// not leak how many leading characters agree.
    pub fn verify(&self, visitor_id: &Uuid, signature: &str) -> bool {
        let presented = match hex::decode(signature.as_bytes()) {
            Ok(b) if b.len() == SIGNATURE_HEX_WIDTH / 2 => b,
            _ => return false,
        };
        let expected = hex::decode(self.signature_for(visitor_id))
            .expect("own signature is valid hex");
        bool::from(presented.ct_eq(&expected))
    }

    /// Full validation with age policy, against the current clock.
    pub fn validate(&self, token: &str) -> TokenValidation {
        self.validate_at(token, Utc::now().timestamp_millis())
    }

    /// Full validation with age policy at an explicit instant.
    ///
    /// A token older than `max_age` is invalid. A valid token past half its
    /// max age gets `needs_refresh` plus a freshly stamped replacement.
    pub fn validate_at(&self, token: &str, now_ms: i64) -> TokenValidation {
        let parsed = match parse(token) {
            Ok(p) => p,
            Err(_) => return TokenValidation::default(),
        };
        if !self.verify(&parsed.visitor_id, &parsed.signature) {
            return TokenValidation::default();
        }
        // Clock skew can put created_at slightly in the future; age floors
        // at zero rather than rejecting.
        let age = (now_ms - parsed.created_at_ms).max(0);
        if age > self.max_age_ms {
            return TokenValidation {
                valid: false,
                visitor_id: None,
                needs_refresh: true,
                refreshed_token: None,
            };
        }
        let needs_refresh = age > self.max_age_ms / 2;
        TokenValidation {
            valid: true,
            visitor_id: Some(parsed.visitor_id),
            needs_refresh,
            refreshed_token: needs_refresh.then(|| self.sign_at(&parsed.visitor_id, now_ms)),
        }
    }
}
