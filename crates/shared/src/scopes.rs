//! Scope vocabulary and the `scope` parameter parser.

use serde::{Deserialize, Serialize};

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_GROUPS: &str = "groups";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_FEDERATED_ID: &str = "federated:id";

/// Prefix of the cross-client scope: `audience:server:client_id:<peer>`
/// requests that `<peer>` be added to the token audience.
pub const SCOPE_CROSS_CLIENT_PREFIX: &str = "audience:server:client_id:";

/// An ordered list of granted scope strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scopes(pub Vec<String>);

impl Scopes {
    /// Parse a space-separated `scope` parameter, rejecting anything outside
    /// the known vocabulary. The offending scope is returned for the error
    /// description. Duplicates collapse to a single entry.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut scopes = Vec::new();
        for word in raw.split_whitespace() {
            let known = matches!(
                word,
                SCOPE_OPENID
                    | SCOPE_EMAIL
                    | SCOPE_PROFILE
                    | SCOPE_GROUPS
                    | SCOPE_OFFLINE_ACCESS
                    | SCOPE_FEDERATED_ID
            ) || word.starts_with(SCOPE_CROSS_CLIENT_PREFIX);
            if !known {
                return Err(word.to_string());
            }
            if !scopes.iter().any(|s| s == word) {
                scopes.push(word.to_string());
            }
        }
        Ok(Scopes(scopes))
    }

    pub fn has(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Peer client ids named by cross-client audience scopes.
    pub fn cross_client_audiences(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|s| s.strip_prefix(SCOPE_CROSS_CLIENT_PREFIX))
            .map(|peer| peer.to_string())
            .collect()
    }

    /// True when every scope in `self` is also present in `granted`. Used to
    /// enforce that a refresh never widens the original grant.
    pub fn is_subset_of(&self, granted: &Scopes) -> bool {
        self.0.iter().all(|s| granted.has(s))
    }

    /// Scopes advertised in `scopes_supported`. Cross-client scopes are
    /// parameterized and therefore not enumerable here.
    pub fn supported() -> Vec<String> {
        vec![
            SCOPE_OPENID.to_string(),
            SCOPE_EMAIL.to_string(),
            SCOPE_PROFILE.to_string(),
            SCOPE_GROUPS.to_string(),
            SCOPE_OFFLINE_ACCESS.to_string(),
            SCOPE_FEDERATED_ID.to_string(),
        ]
    }
}

impl std::fmt::Display for Scopes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_standard_scopes() {
        let scopes = Scopes::parse("openid email profile groups offline_access").unwrap();
        assert!(scopes.has("openid"));
        assert!(scopes.has("email"));
        assert!(scopes.has("offline_access"));
    }

    #[test]
    fn parse_rejects_unknown_scope() {
        let err = Scopes::parse("openid wallet").unwrap_err();
        assert_eq!(err, "wallet");
    }

    #[test]
    fn parse_accepts_cross_client_scope() {
        let scopes = Scopes::parse("openid audience:server:client_id:backend").unwrap();
        assert_eq!(scopes.cross_client_audiences(), vec!["backend".to_string()]);
    }

    #[test]
    fn parse_accepts_federated_id() {
        let scopes = Scopes::parse("openid federated:id").unwrap();
        assert!(scopes.has(SCOPE_FEDERATED_ID));
    }

    #[test]
    fn parse_collapses_duplicates() {
        let scopes = Scopes::parse("openid openid email").unwrap();
        assert_eq!(scopes.0.len(), 2);
    }

    #[test]
    fn subset_check_holds_for_equal_sets() {
        let a = Scopes::parse("openid email").unwrap();
        assert!(a.is_subset_of(&a));
    }

    #[test]
    fn subset_check_fails_on_widened_request() {
        let granted = Scopes::parse("openid").unwrap();
        let requested = Scopes::parse("openid email").unwrap();
        assert!(!requested.is_subset_of(&granted));
        assert!(granted.is_subset_of(&requested));
    }

    #[test]
    fn display_joins_with_spaces() {
        let scopes = Scopes::parse("openid email").unwrap();
        assert_eq!(scopes.to_string(), "openid email");
    }

    #[test]
    fn serde_roundtrip() {
        let scopes = Scopes::parse("openid email groups").unwrap();
        let json = serde_json::to_string(&scopes).unwrap();
        let back: Scopes = serde_json::from_str(&json).unwrap();
        assert_eq!(scopes, back);
    }
}
