//! Token Codec — signs, encodes, decodes, and validates consent tokens.
//!
//! Wire format (bit-exact): `HCT:<base64url(payload)>.<hex_signature>` where
//! `payload = user_id|agent_id|scope_str|issued_at|expires_at`, all fields
//! UTF-8 and pipe-delimited, timestamps in base-10 milliseconds since epoch,
//! `hex_signature` a lowercase 64-char SHA-256 HMAC hex digest.
//!
//! The codec never collapses `scope_str` into an enum — it is carried
//! byte-for-byte from issuance through every validation path, because domain
//! isolation depends on comparing the exact granted string, not a coerced
//! classification of it.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ConsentError, Result};
use crate::revocation::RevocationIndex;
use crate::scope::ScopeKind;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "HCT";

/// A decoded, not-yet-validated-against-side-effects consent token.
///
/// Carries `scope_str` verbatim — callers that need the structured
/// [`ScopeKind`] call [`ScopeKind::parse`] on it themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentToken {
    /// Opaque principal identifier the token was issued to.
    pub user_id: String,
    /// Opaque caller/agent identifier the token grants access to.
    pub agent_id: String,
    /// Canonical scope string exactly as granted.
    pub scope_str: String,
    /// Milliseconds since epoch at issuance.
    pub issued_at: i64,
    /// Milliseconds since epoch at expiry.
    pub expires_at: i64,
}

impl ConsentToken {
    fn payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.user_id, self.agent_id, self.scope_str, self.issued_at, self.expires_at
        )
    }
}

/// Signs and verifies consent tokens with a single process-wide HMAC-SHA256
/// secret.
///
/// The secret is read once at startup (see [`crate::secrets`]) and never
/// rotated within a process: a missing secret is startup-fatal.
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Build a codec from the process-wide HMAC secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ConsentError::Internal(format!("HMAC key error: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Issue a new signed token, returning both the structured value and its
    /// wire-format string.
    pub fn issue(
        &self,
        user_id: &str,
        agent_id: &str,
        scope_str: &str,
        issued_at_ms: i64,
        ttl_ms: i64,
    ) -> Result<(ConsentToken, String)> {
        let token = ConsentToken {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            scope_str: scope_str.to_string(),
            issued_at: issued_at_ms,
            expires_at: issued_at_ms + ttl_ms,
        };
        let encoded = self.encode(&token)?;
        Ok((token, encoded))
    }

    /// Encode a [`ConsentToken`] to its wire format, signing the payload.
    pub fn encode(&self, token: &ConsentToken) -> Result<String> {
        let payload = token.payload();
        let signature = self.sign(&payload)?;
        let encoded_payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes());
        Ok(format!("{TOKEN_PREFIX}:{encoded_payload}.{signature}"))
    }

    /// Structurally decode a wire-format token string without checking its
    /// signature, expiry, or revocation status. Exposed for diagnostics and
    /// as the first stage of [`validate`](Self::validate).
    pub fn decode(&self, token_str: &str) -> Result<(ConsentToken, String)> {
        let rest = token_str
            .strip_prefix(&format!("{TOKEN_PREFIX}:"))
            .ok_or(ConsentError::InvalidTokenPrefix)?;

        let (encoded_payload, signature) = rest
            .split_once('.')
            .ok_or_else(|| ConsentError::MalformedToken("missing signature delimiter".to_string()))?;

        if signature.is_empty() || encoded_payload.is_empty() {
            return Err(ConsentError::MalformedToken("empty payload or signature".to_string()));
        }

        let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|e| ConsentError::MalformedToken(format!("invalid base64 payload: {e}")))?;
        let payload = String::from_utf8(payload_bytes)
            .map_err(|e| ConsentError::MalformedToken(format!("payload is not valid UTF-8: {e}")))?;

        let fields: Vec<&str> = payload.split('|').collect();
        let [user_id, agent_id, scope_str, issued_at, expires_at] = fields.as_slice() else {
            return Err(ConsentError::MalformedToken(format!(
                "expected 5 pipe-delimited fields, found {}",
                fields.len()
            )));
        };

        let issued_at = issued_at
            .parse::<i64>()
            .map_err(|_| ConsentError::MalformedToken("issued_at is not an integer".to_string()))?;
        let expires_at = expires_at
            .parse::<i64>()
            .map_err(|_| ConsentError::MalformedToken("expires_at is not an integer".to_string()))?;

        Ok((
            ConsentToken {
                user_id: (*user_id).to_string(),
                agent_id: (*agent_id).to_string(),
                scope_str: (*scope_str).to_string(),
                issued_at,
                expires_at,
            },
            signature.to_string(),
        ))
    }

    /// Validate a token string against the revocation index, signature,
    /// expiry, and (if supplied) a required scope. Does not consult the
    /// ledger — see [`validate_with_ledger`](Self::validate_with_ledger) for
    /// the durable, cross-instance form.
    pub fn validate(
        &self,
        token_str: &str,
        expected_scope: Option<&str>,
        revocation: &RevocationIndex,
        now_ms: i64,
    ) -> Result<ConsentToken> {
        // 1. In-memory revocation check — hot path, O(1), checked first.
        if revocation.is_revoked(token_str) {
            return Err(ConsentError::TokenRevoked);
        }

        // 2. Structural parse.
        let (token, signature) = self.decode(token_str)?;

        // 3. Constant-time HMAC comparison.
        let expected_signature = self.sign(&token.payload())?;
        let signatures_match: bool = expected_signature
            .as_bytes()
            .ct_eq(signature.as_bytes())
            .into();
        if !signatures_match {
            return Err(ConsentError::InvalidSignature);
        }

        // 4. Expiry.
        if now_ms > token.expires_at {
            return Err(ConsentError::TokenExpired);
        }

        // 5. Scope match, if requested.
        if let Some(requested) = expected_scope {
            let granted_kind = ScopeKind::parse(&token.scope_str);
            let requested_kind = ScopeKind::parse(requested);
            if !granted_kind.satisfies(&requested_kind) {
                return Err(ConsentError::ScopeMismatch {
                    granted: token.scope_str.clone(),
                    requested: requested.to_string(),
                });
            }
        }

        Ok(token)
    }

    /// The durable, cross-instance form of [`validate`](Self::validate).
    ///
    /// After the in-process checks pass, additionally queries the ledger's
    /// Active projection for `(token.user_id, token.scope_str)`. If no
    /// matching `CONSENT_GRANTED` event is active, the token is admitted to
    /// the in-memory revocation set (lazy import) and rejected — this is how
    /// a revocation recorded before this process started becomes visible
    /// without eagerly loading the whole durable revocation table at boot.
    pub fn validate_with_ledger(
        &self,
        token_str: &str,
        expected_scope: Option<&str>,
        revocation: &RevocationIndex,
        active_lookup: &dyn ActiveScopeLookup,
        now_ms: i64,
    ) -> Result<ConsentToken> {
        let token = self.validate(token_str, expected_scope, revocation, now_ms)?;

        if !active_lookup.is_active(&token.user_id, &token.scope_str) {
            revocation.revoke(token_str, &token.user_id, &token.scope_str, "not active in ledger");
            return Err(ConsentError::TokenRevoked);
        }

        Ok(token)
    }
}

/// Minimal collaborator trait [`TokenCodec::validate_with_ledger`] needs from
/// the Consent Ledger — kept separate from the full `Ledger` trait so the
/// Token Codec doesn't depend on the ledger's entire projection surface.
pub trait ActiveScopeLookup {
    /// Whether `(user_id, scope_str)`'s latest ledger event is an
    /// unexpired `CONSENT_GRANTED`.
    fn is_active(&self, user_id: &str, scope_str: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"k".to_vec())
    }

    struct AlwaysActive;
    impl ActiveScopeLookup for AlwaysActive {
        fn is_active(&self, _user_id: &str, _scope_str: &str) -> bool {
            true
        }
    }

    struct NeverActive;
    impl ActiveScopeLookup for NeverActive {
        fn is_active(&self, _user_id: &str, _scope_str: &str) -> bool {
            false
        }
    }

    // ── round-trip ───────────────────────────────────────────────────────

    #[test]
    fn decode_of_encode_is_identity() {
        let codec = codec();
        let (token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();
        let (decoded, _sig) = codec.decode(&wire).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn wire_format_has_expected_shape() {
        let codec = codec();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();
        assert!(wire.starts_with("HCT:"));
        let (_, sig) = wire.split_once('.').unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    // ── signature binding (invariant 1) ───────────────────────────────────

    #[test]
    fn tampering_with_any_field_invalidates_signature() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        // Re-encode with a single byte changed in scope_str, keeping the
        // original signature.
        let (_, signature) = wire.split_once('.').unwrap();
        let mut tampered = token.clone();
        tampered.scope_str = "attr.food.X".to_string();
        let tampered_payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(tampered.payload().as_bytes());
        let tampered_wire = format!("HCT:{tampered_payload}.{signature}");

        let result = codec.validate(&tampered_wire, None, &revocation, 1_500);
        assert!(matches!(result, Err(ConsentError::InvalidSignature)));
    }

    // ── expiry monotonicity (invariant 2) ──────────────────────────────────

    #[test]
    fn valid_token_remains_valid_until_expiry() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        assert!(codec.validate(&wire, None, &revocation, 1_000).is_ok());
        assert!(codec.validate(&wire, None, &revocation, 60_999).is_ok());
        assert!(codec.validate(&wire, None, &revocation, 61_000).is_ok());
    }

    #[test]
    fn expired_token_rejected() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        let result = codec.validate(&wire, None, &revocation, 61_001);
        assert!(matches!(result, Err(ConsentError::TokenExpired)));
    }

    // ── scope mismatch ──────────────────────────────────────────────────

    #[test]
    fn scope_mismatch_is_reported_with_both_strings() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        let result = codec.validate(&wire, Some("attr.financial.holdings"), &revocation, 1_000);
        match result {
            Err(ConsentError::ScopeMismatch { granted, requested }) => {
                assert_eq!(granted, "attr.food.*");
                assert_eq!(requested, "attr.financial.holdings");
            }
            other => panic!("expected ScopeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_scope_satisfies_specific_request() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        assert!(codec.validate(&wire, Some("attr.food.dietary_restrictions"), &revocation, 1_000).is_ok());
    }

    // ── malformed tokens ─────────────────────────────────────────────────

    #[test]
    fn decode_rejects_wrong_prefix() {
        let codec = codec();
        assert!(matches!(codec.decode("NOT:abc.def"), Err(ConsentError::InvalidTokenPrefix)));
    }

    #[test]
    fn decode_rejects_missing_signature_delimiter() {
        let codec = codec();
        assert!(matches!(
            codec.decode("HCT:abcdef"),
            Err(ConsentError::MalformedToken(_))
        ));
    }

    #[test]
    fn decode_rejects_wrong_field_count() {
        let codec = codec();
        let bad_payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"only|three|fields");
        assert!(matches!(
            codec.decode(&format!("HCT:{bad_payload}.deadbeef")),
            Err(ConsentError::MalformedToken(_))
        ));
    }

    // ── revocation ─────────────────────────────────────────────────────

    #[test]
    fn revoked_token_rejected_before_signature_check() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();
        revocation.revoke(&wire, "u1", "attr.food.*", "user requested logout");

        let result = codec.validate(&wire, None, &revocation, 1_000);
        assert!(matches!(result, Err(ConsentError::TokenRevoked)));
    }

    // ── validate_with_ledger ────────────────────────────────────────────

    #[test]
    fn validate_with_ledger_accepts_active_grant() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        let result = codec.validate_with_ledger(&wire, None, &revocation, &AlwaysActive, 1_000);
        assert!(result.is_ok());
    }

    #[test]
    fn validate_with_ledger_revokes_when_not_active() {
        let codec = codec();
        let revocation = RevocationIndex::new();
        let (_token, wire) = codec.issue("u1", "mcp_dev", "attr.food.*", 1_000, 60_000).unwrap();

        let result = codec.validate_with_ledger(&wire, None, &revocation, &NeverActive, 1_000);
        assert!(matches!(result, Err(ConsentError::TokenRevoked)));
        // Lazily imported into the in-memory set: subsequent plain validate()
        // rejects it too without consulting the ledger again.
        assert!(revocation.is_revoked(&wire));
    }
}
