//! Scope algebra — parsing, normalization, and satisfaction checks for
//! consent scope strings.
//!
//! A scope string is one of:
//!
//! - `vault.owner` — the master scope, satisfies every request.
//! - a static scope (`portfolio.import`, `chat.history.read`, ...) — matched
//!   by exact string equality.
//! - `attr.<domain>.<key>` — a specific attribute-domain scope.
//! - `attr.<domain>.*` — a wildcard over every attribute in `<domain>`.
//!
//! [`ScopeKind`] keeps the domain and key as structured fields rather than
//! collapsing the whole string into an opaque enum variant — domain isolation
//! (§ invariant 2) depends on comparing `domain` fields directly, not on
//! string prefix tricks applied after the fact.

use serde::{Deserialize, Serialize};

/// The classified shape of a scope string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    /// `vault.owner` — satisfies any requested scope.
    Master,
    /// A fixed, non-attribute scope matched by exact equality
    /// (`portfolio.import`, `chat.history.read`, `agent.kai.analyze`, ...).
    Static(String),
    /// `attr.<domain>.<key>` — access to one named attribute in a domain.
    DynamicSpecific { domain: String, key: String },
    /// `attr.<domain>.*` — access to every attribute in a domain.
    DynamicWildcard { domain: String },
    /// Anything that doesn't parse as one of the above shapes. Kept instead
    /// of rejected outright so that unknown-but-well-formed scopes can still
    /// flow through the ledger and be displayed, just never satisfy anything.
    Unclassified(String),
}

const MASTER_SCOPE: &str = "vault.owner";
const ATTR_PREFIX: &str = "attr.";
const WILDCARD_SUFFIX: &str = "*";

impl ScopeKind {
    /// Classify a raw scope string into its structured shape.
    ///
    /// Does not normalize legacy forms first — call [`normalize`] on
    /// untrusted input before parsing if it might use the old
    /// `vault.read.<domain>` / `vault_read_<domain>` spellings.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == MASTER_SCOPE {
            return Self::Master;
        }

        if let Some(rest) = raw.strip_prefix(ATTR_PREFIX) {
            if let Some((domain, key)) = rest.split_once('.') {
                if !key.contains('.') && is_legal_segment(domain) {
                    if key == WILDCARD_SUFFIX {
                        return Self::DynamicWildcard {
                            domain: domain.to_string(),
                        };
                    }
                    if is_legal_segment(key) {
                        return Self::DynamicSpecific {
                            domain: domain.to_string(),
                            key: key.to_string(),
                        };
                    }
                }
            }
            return Self::Unclassified(raw.to_string());
        }

        if is_known_static_scope(raw) {
            return Self::Static(raw.to_string());
        }

        Self::Unclassified(raw.to_string())
    }

    /// Whether this scope, if granted, satisfies a `requested` scope.
    ///
    /// Evaluated in order, exactly as laid out for the Scope Engine:
    /// 1. `granted == requested` (structurally equal) → true.
    /// 2. `self` is [`Master`] → true.
    /// 3. `self` is the static scope `world_model.read` and `requested` is any
    ///    dynamic scope → true. `world_model.write` is the same rule
    ///    restricted to dynamic scopes the domain registry marks as write
    ///    operations — since the core has no such registry, and the only
    ///    observable "write-ness" of a scope string is [`is_write_scope`],
    ///    `world_model.write` satisfies a dynamic requested scope only when
    ///    that scope's raw string also reads as a write scope. This is a
    ///    deliberately narrow reading of an open question in the source; see
    ///    the design ledger for the reasoning.
    /// 4. Both dynamic: domains must match (the isolation invariant); a
    ///    wildcard then satisfies anything in-domain, otherwise keys must
    ///    match exactly.
    /// 5. Anything else → does not satisfy.
    #[must_use]
    pub fn satisfies(&self, requested: &ScopeKind) -> bool {
        if matches!(self, Self::Unclassified(_)) {
            return false;
        }
        if self == requested {
            return true;
        }

        match self {
            Self::Master => true,
            Self::Static(granted) if granted == "world_model.read" => {
                matches!(requested, Self::DynamicSpecific { .. } | Self::DynamicWildcard { .. })
            }
            Self::Static(granted) if granted == "world_model.write" => matches!(
                requested,
                Self::DynamicSpecific { .. } | Self::DynamicWildcard { .. }
                    if requested.is_write_scope()
            ),
            Self::Static(_) => false,
            Self::DynamicWildcard { domain: granted_domain } => match requested {
                Self::DynamicSpecific { domain, .. } | Self::DynamicWildcard { domain } => {
                    domain == granted_domain
                }
                _ => false,
            },
            Self::DynamicSpecific { .. } => false,
            Self::Unclassified(_) => false,
        }
    }

    /// The raw scope string this value was parsed from / would serialize to.
    #[must_use]
    pub fn as_str(&self) -> String {
        match self {
            Self::Master => MASTER_SCOPE.to_string(),
            Self::Static(s) | Self::Unclassified(s) => s.clone(),
            Self::DynamicSpecific { domain, key } => format!("attr.{domain}.{key}"),
            Self::DynamicWildcard { domain } => format!("attr.{domain}.*"),
        }
    }

    /// `true` for scopes whose grant implies a write / mutation capability
    /// rather than a read. Grounded on `scope_helpers.py`'s `is_write_scope`:
    /// any scope string containing `write`, `import`, or `compute`.
    #[must_use]
    pub fn is_write_scope(&self) -> bool {
        let s = self.as_str();
        s.contains("write") || s.contains("import") || s.contains("compute")
    }
}

/// Whether `segment` matches the legal domain/key shape `[a-z][a-z0-9_]*`.
fn is_legal_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    }
}

/// Known non-attribute scope strings. These are static, not attribute-domain
/// scopes, so they're matched by exact equality rather than the dynamic
/// domain/key machinery.
fn is_known_static_scope(raw: &str) -> bool {
    matches!(
        raw,
        "portfolio.import"
            | "portfolio.analyze"
            | "portfolio.read"
            | "chat.history.read"
            | "chat.history.write"
            | "embedding.profile.read"
            | "embedding.profile.compute"
            | "agent.kai.analyze"
            | "agent.kai.debate"
            | "agent.kai.infer"
            | "external.sec.filings"
            | "external.news.api"
            | "external.market.data"
            | "external.renaissance.data"
            | "world_model.read"
            | "world_model.write"
    )
}

/// Normalize legacy scope spellings to the current `attr.<domain>.*` form.
///
/// Handles the legacy forms found in older consent tokens — `vault.read.<domain>`,
/// `vault_read_<domain>` — plus the alternate underscore ingress form
/// `attr_<domain>`, accepted only at the ingress boundary and always
/// canonicalized to dotted wildcard form before anything touches it
/// internally. Anything else passes through unchanged.
#[must_use]
pub fn normalize(raw: &str) -> String {
    if let Some(domain) = raw.strip_prefix("vault.read.") {
        return format!("attr.{domain}.*");
    }
    if let Some(domain) = raw.strip_prefix("vault_read_") {
        return format!("attr.{domain}.*");
    }
    if let Some(domain) = raw.strip_prefix("attr_") {
        return format!("attr.{domain}.*");
    }
    raw.to_string()
}

/// Human-readable description of a scope, for consent-request UIs.
///
/// - Master → `"Full vault access"`.
/// - Wildcard → `"Access all your {domain} data"`.
/// - Specific attribute → `"Access your {domain} - {Key Title Case}"`.
/// - Static / unclassified → the raw string, unchanged.
#[must_use]
pub fn describe(kind: &ScopeKind) -> String {
    match kind {
        ScopeKind::Master => "Full vault access".to_string(),
        ScopeKind::DynamicWildcard { domain } => format!("Access all your {domain} data"),
        ScopeKind::DynamicSpecific { domain, key } => {
            format!("Access your {domain} - {}", title_case(key))
        }
        ScopeKind::Static(s) | ScopeKind::Unclassified(s) => s.clone(),
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
