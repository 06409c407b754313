//! DTOs for the PingOne token endpoint

use serde::{Deserialize, Deserializer};

/// The form body of a client credentials request
pub(super) const CLIENT_CREDENTIALS_BODY: &str = "grant_type=client_credentials";

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// The most descriptive non-blank message the authority gave
    pub fn message(self) -> Option<String> {
        self.error_description
            .filter(|m| !m.trim().is_empty())
            .or(self.error.filter(|m| !m.trim().is_empty()))
    }
}

/// Accepts `expires_in` as an integer, a float or a numeric string
fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Int(u64),
        Float(f64),
        Text(String),
    }

    Ok(match Option::<Seconds>::deserialize(deserializer)? {
        Some(Seconds::Int(s)) => Some(s),
        Some(Seconds::Float(s)) if s.is_finite() && s >= 0.0 => Some(s as u64),
        Some(Seconds::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
