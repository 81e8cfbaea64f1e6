use serde::{Deserialize, Serialize};

/// Device authorization response (RFC 8628 §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    /// Minimum seconds the device must wait between polls.
    pub interval: i64,
}
