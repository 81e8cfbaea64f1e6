use serde::{Deserialize, Serialize};

/// Protocol error codes from RFC 6749 §4.1.2.1 / §5.2 and RFC 8628 §3.5.
///
/// These are the strings that cross the wire, either as the `error` query
/// parameter of an authorization response or as the `error` field of a token
/// error body. Internal failures must be mapped onto one of these before
/// anything is sent to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    ServerError,
    TemporarilyUnavailable,
    InvalidClient,
    InvalidGrant,
    UnsupportedGrantType,
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UnauthorizedClient => "unauthorized_client",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::UnsupportedResponseType => "unsupported_response_type",
            ErrorCode::InvalidScope => "invalid_scope",
            ErrorCode::ServerError => "server_error",
            ErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
            ErrorCode::InvalidClient => "invalid_client",
            ErrorCode::InvalidGrant => "invalid_grant",
            ErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            ErrorCode::AuthorizationPending => "authorization_pending",
            ErrorCode::SlowDown => "slow_down",
            ErrorCode::ExpiredToken => "expired_token",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grant types accepted at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    DeviceCode,
    TokenExchange,
}

impl GrantType {
    pub const AUTHORIZATION_CODE: &'static str = "authorization_code";
    pub const REFRESH_TOKEN: &'static str = "refresh_token";
    pub const DEVICE_CODE: &'static str = "urn:ietf:params:oauth:grant-type:device_code";
    pub const TOKEN_EXCHANGE: &'static str = "urn:ietf:params:oauth:grant-type:token-exchange";

    /// Parse the `grant_type` form parameter. Returns `None` for grants the
    /// provider does not serve.
    pub fn from_param(raw: &str) -> Option<Self> {
        match raw {
            Self::AUTHORIZATION_CODE => Some(GrantType::AuthorizationCode),
            Self::REFRESH_TOKEN => Some(GrantType::RefreshToken),
            Self::DEVICE_CODE => Some(GrantType::DeviceCode),
            Self::TOKEN_EXCHANGE => Some(GrantType::TokenExchange),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => Self::AUTHORIZATION_CODE,
            GrantType::RefreshToken => Self::REFRESH_TOKEN,
            GrantType::DeviceCode => Self::DEVICE_CODE,
            GrantType::TokenExchange => Self::TOKEN_EXCHANGE,
        }
    }

    /// Everything advertised in `grant_types_supported`.
    pub fn all() -> [&'static str; 4] {
        [
            Self::AUTHORIZATION_CODE,
            Self::REFRESH_TOKEN,
            Self::DEVICE_CODE,
            Self::TOKEN_EXCHANGE,
        ]
    }
}

bitflags::bitflags! {
    /// The set of `response_type` values in an authorization request.
    ///
    /// The parameter is a space-separated multi-set; its semantics depend
    /// only on which members are present, so the set representation drops
    /// ordering and duplicates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ResponseTypes: u8 {
        const CODE = 1;
        const ID_TOKEN = 1 << 1;
        const TOKEN = 1 << 2;
    }
}

impl ResponseTypes {
    /// Parse a raw `response_type` parameter. Returns the offending word on
    /// unknown values so the caller can build an error description.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut set = ResponseTypes::empty();
        for word in raw.split_whitespace() {
            match word {
                "code" => set |= ResponseTypes::CODE,
                "id_token" => set |= ResponseTypes::ID_TOKEN,
                "token" => set |= ResponseTypes::TOKEN,
                other => return Err(other.to_string()),
            }
        }
        Ok(set)
    }

    /// Whether this combination is one the provider serves. `token` on its
    /// own is an OAuth2-only implicit flow with no id_token and is rejected.
    pub fn is_supported(&self) -> bool {
        !self.is_empty() && *self != ResponseTypes::TOKEN
    }

    /// Implicit and hybrid flows return the authorization response in the
    /// URI fragment; the pure code flow uses the query string.
    pub fn uses_fragment(&self) -> bool {
        self.intersects(ResponseTypes::ID_TOKEN | ResponseTypes::TOKEN)
    }

    /// Combinations advertised in `response_types_supported`, in the
    /// canonical order.
    pub fn supported_combinations() -> Vec<String> {
        vec![
            "code".to_string(),
            "id_token".to_string(),
            "code id_token".to_string(),
            "id_token token".to_string(),
            "code token".to_string(),
            "code id_token token".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_to_wire_string() {
        let json = serde_json::to_string(&ErrorCode::InvalidGrant).unwrap();
        assert_eq!(json, "\"invalid_grant\"");
    }

    #[test]
    fn error_code_as_str_matches_serde() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::UnauthorizedClient,
            ErrorCode::AccessDenied,
            ErrorCode::UnsupportedResponseType,
            ErrorCode::InvalidScope,
            ErrorCode::ServerError,
            ErrorCode::TemporarilyUnavailable,
            ErrorCode::InvalidClient,
            ErrorCode::InvalidGrant,
            ErrorCode::UnsupportedGrantType,
            ErrorCode::AuthorizationPending,
            ErrorCode::SlowDown,
            ErrorCode::ExpiredToken,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn grant_type_parses_urn_forms() {
        assert_eq!(
            GrantType::from_param("urn:ietf:params:oauth:grant-type:device_code"),
            Some(GrantType::DeviceCode)
        );
        assert_eq!(
            GrantType::from_param("urn:ietf:params:oauth:grant-type:token-exchange"),
            Some(GrantType::TokenExchange)
        );
    }

    #[test]
    fn grant_type_rejects_password() {
        assert_eq!(GrantType::from_param("password"), None);
        assert_eq!(GrantType::from_param("client_credentials"), None);
    }

    #[test]
    fn response_types_parses_multi_set() {
        let set = ResponseTypes::parse("code id_token").unwrap();
        assert!(set.contains(ResponseTypes::CODE));
        assert!(set.contains(ResponseTypes::ID_TOKEN));
        assert!(!set.contains(ResponseTypes::TOKEN));
    }

    #[test]
    fn response_types_order_is_irrelevant() {
        assert_eq!(
            ResponseTypes::parse("id_token code").unwrap(),
            ResponseTypes::parse("code id_token").unwrap()
        );
    }

    #[test]
    fn response_types_rejects_unknown_value() {
        let err = ResponseTypes::parse("code magic").unwrap_err();
        assert_eq!(err, "magic");
    }

    #[test]
    fn token_alone_is_not_supported() {
        let set = ResponseTypes::parse("token").unwrap();
        assert!(!set.is_supported());
    }

    #[test]
    fn empty_response_type_is_not_supported() {
        let set = ResponseTypes::parse("").unwrap();
        assert!(!set.is_supported());
    }

    #[test]
    fn code_flow_uses_query_encoding() {
        let set = ResponseTypes::parse("code").unwrap();
        assert!(!set.uses_fragment());
    }

    #[test]
    fn hybrid_flow_uses_fragment_encoding() {
        let set = ResponseTypes::parse("code id_token").unwrap();
        assert!(set.uses_fragment());
    }
}
