//! Context Gate — the single choke point every protected operation passes
//! through: no active, validated context means no access, full stop.
//!
//! Deliberately an explicit value threaded through call sites rather than a
//! thread-local/`ContextVar`-style ambient global: an explicit
//! [`ConsentContext`] can't leak across an async task boundary onto the
//! wrong request, and its lifetime is visible at every call site instead of
//! being implicit task-local state that's easy to forget to clear.

use crate::audit::{self, AuditEvent};
use crate::error::{ConsentError, Result};
use crate::ledger::{Ledger, LedgerActiveLookup};
use crate::revocation::RevocationIndex;
use crate::token::TokenCodec;

/// A validated, scoped authorization to act on behalf of `user_id`, good for
/// exactly the scope it was opened with.
///
/// Obtained only through [`ConsentContext::enter`] — there is no public
/// constructor, so a `ConsentContext` existing at all is proof its token
/// passed full validation (signature, expiry, revocation, ledger activeness,
/// and scope satisfaction) at the moment it was created.
#[derive(Debug, Clone)]
pub struct ConsentContext {
    user_id: String,
    agent_id: String,
    scope_str: String,
}

impl ConsentContext {
    /// Validate `token_str` against `required_scope` for `user_id` and, on
    /// success, open a context. Fails closed: any validation error —
    /// including the identity-spoofing check that the token's own
    /// `user_id` matches the caller-asserted `user_id` — refuses to open a
    /// context at all.
    pub fn enter(
        codec: &TokenCodec,
        ledger: &dyn Ledger,
        revocation: &RevocationIndex,
        user_id: &str,
        required_scope: &str,
        token_str: &str,
        now_ms: i64,
    ) -> Result<Self> {
        let lookup = LedgerActiveLookup::new(ledger, now_ms);
        let token = codec.validate_with_ledger(token_str, Some(required_scope), revocation, &lookup, now_ms)?;

        if token.user_id != user_id {
            return Err(ConsentError::UserIdMismatch {
                context_user: user_id.to_string(),
                token_user: token.user_id,
            });
        }

        Ok(Self {
            user_id: token.user_id,
            agent_id: token.agent_id,
            scope_str: token.scope_str,
        })
    }

    /// The principal this context is scoped to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The caller/agent this context was opened for.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The exact scope string the underlying token carried.
    #[must_use]
    pub fn scope_str(&self) -> &str {
        &self.scope_str
    }

    /// Run `f` with this context, recording an `OPERATION_PERFORMED` audit
    /// event on the ledger regardless of whether `f` succeeds. The context
    /// is consumed by this call — there is no way to reuse it afterward,
    /// so an operation can't accidentally run twice under one validation.
    pub fn run<T>(
        self,
        ledger: &dyn Ledger,
        target: &str,
        metadata: serde_json::Value,
        now_ms: i64,
        f: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        let result = f(&self);
        ledger.log_operation(&self.user_id, &self.agent_id, target, metadata, now_ms);
        audit::emit(&AuditEvent::operation_performed(&self.user_id, &self.agent_id, target));
        result
    }
}
