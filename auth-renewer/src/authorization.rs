/// The stable sentinel reason used when a deny was caused by exceeding a
/// usage limit rather than an upstream-supplied reason. Fixed per the Open
/// Question resolution in SPEC_FULL.md §9 — consumers parse this value, so
/// it must never change once deployed.
pub const LIMITS_EXCEEDED_REASON: &str = "limits_exceeded";

/// A per-metric authorization decision. Mirrors the three outcomes the
/// upstream rate limiter can produce for one metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny(Option<String>),
    DenyOverLimits,
}

impl Authorization {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny(Some(reason.into()))
    }

    pub fn deny_no_reason() -> Self {
        Self::Deny(None)
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Serialize to the wire form stored in the auth cache and published on
    /// the response channel: `"1"` for Allow, `"0"` for a bare Deny, and
    /// `"0:<reason>"` when a reason is present. `DenyOverLimits` reuses the
    /// `Deny` encoding with the fixed sentinel reason.
    pub fn to_cache_string(&self) -> String {
        match self {
            Self::Allow => "1".to_string(),
            Self::Deny(None) => "0".to_string(),
            Self::Deny(Some(reason)) => format!("0:{reason}"),
            Self::DenyOverLimits => format!("0:{LIMITS_EXCEEDED_REASON}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_serializes_to_one() {
        assert_eq!(Authorization::Allow.to_cache_string(), "1");
        assert!(Authorization::Allow.is_authorized());
    }

    #[test]
    fn deny_without_reason_serializes_to_zero() {
        assert_eq!(Authorization::deny_no_reason().to_cache_string(), "0");
        assert!(!Authorization::deny_no_reason().is_authorized());
    }

    #[test]
    fn deny_with_reason_serializes_with_colon_suffix() {
        assert_eq!(
            Authorization::deny("user.blocked").to_cache_string(),
            "0:user.blocked"
        );
    }

    #[test]
    fn deny_over_limits_uses_stable_sentinel() {
        assert_eq!(
            Authorization::DenyOverLimits.to_cache_string(),
            "0:limits_exceeded"
        );
        assert_eq!(
            Authorization::DenyOverLimits.to_cache_string(),
            Authorization::deny(LIMITS_EXCEEDED_REASON).to_cache_string()
        );
    }
}
