use serde::{Deserialize, Serialize};

/// The identity a connector asserts for an authenticated end user.
///
/// `user_id` is the stable, connector-scoped identifier and becomes the
/// `sub` claim of every token minted for this user. The remaining fields are
/// released into tokens only when the matching scope was granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_roundtrip() {
        let claims = Claims {
            user_id: "u-1".into(),
            username: "Alice".into(),
            preferred_username: "alice".into(),
            email: "alice@example.com".into(),
            email_verified: true,
            groups: vec!["admins".into()],
        };
        let json = serde_json::to_string(&claims).unwrap();
        let back: Claims = serde_json::from_str(&json).unwrap();
        assert_eq!(claims, back);
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let claims: Claims = serde_json::from_str(r#"{"user_id":"u","username":"n"}"#).unwrap();
        assert_eq!(claims.email, "");
        assert!(!claims.email_verified);
        assert!(claims.groups.is_empty());
    }
}
