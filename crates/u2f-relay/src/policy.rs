//! Origin policy. Controls which hosting pages may adopt the relay.
//!
//! Split in two:
//!
//! - [`OriginPolicy`]: plain configuration (the allow-list).
//! - [`OriginPolicyEnforcer`]: runtime counterpart with a pre-computed set
//!   for lookups.

use std::collections::HashSet;
use u2f_relay_core::{RelayError, RelayResult};

/// Static origin access-control configuration.
///
/// | Pattern                 | Matches                     |
/// |-------------------------|-----------------------------|
/// | `"*"`                   | Any origin.                 |
/// | `"https://example.com"` | Exactly that origin.        |
///
/// A trailing `/` is ignored on both sides. An empty list allows nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    /// Origins allowed to hand the relay a port. `"*"` allows any.
    pub allowed_origins: Vec<String>,
}

/// Default policy: allow every origin.
impl Default for OriginPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// Runtime origin checks.
#[derive(Debug, Clone)]
pub struct OriginPolicyEnforcer {
    /// Normalized allowed origins (trailing `/` stripped).
    allowed_set: HashSet<String>,
    /// `true` when the allow-list contains `"*"`.
    allow_all: bool,
}

impl OriginPolicyEnforcer {
    /// Build an enforcer from a static policy.
    ///
    /// # Arguments
    ///
    /// * `policy` - The allow-list to pre-compute lookups for.
    pub fn new(policy: &OriginPolicy) -> Self {
        let allow_all = policy.allowed_origins.iter().any(|o| o == "*");
        let allowed_set = policy
            .allowed_origins
            .iter()
            .map(|o| normalize(o).to_string())
            .collect();
        Self {
            allowed_set,
            allow_all,
        }
    }

    /// Check whether `origin` may talk to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::OriginDenied`] naming the rejected origin.
    pub fn check(&self, origin: &str) -> RelayResult<()> {
        if self.allow_all || self.allowed_set.contains(normalize(origin)) {
            return Ok(());
        }
        Err(RelayError::OriginDenied(origin.to_string()))
    }
}

fn normalize(origin: &str) -> &str {
    origin.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let enforcer = OriginPolicyEnforcer::new(&OriginPolicy::default());
        assert!(enforcer.check("https://wallet.example").is_ok());
        assert!(enforcer.check("null").is_ok());
    }

    #[test]
    fn test_allow_specific() {
        let policy = OriginPolicy {
            allowed_origins: vec!["https://wallet.example".to_string()],
        };
        let enforcer = OriginPolicyEnforcer::new(&policy);
        assert!(enforcer.check("https://wallet.example").is_ok());
        assert!(enforcer.check("https://wallet.example/").is_ok());
        assert!(enforcer.check("http://wallet.example").is_err());

        let err = enforcer.check("https://evil.example").unwrap_err();
        assert_eq!(err.code(), "origin_denied");
    }

    #[test]
    fn test_empty_allows_nothing() {
        let enforcer = OriginPolicyEnforcer::new(&OriginPolicy {
            allowed_origins: vec![],
        });
        assert!(enforcer.check("https://wallet.example").is_err());
    }
}
