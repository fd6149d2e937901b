use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credential kind. Drives both the opaque-token prefix and the JWT `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Refresh,
    Access,
}

impl TokenType {
    /// The string carried in the JWT `type` claim and compared by the validator.
    pub fn claim_str(self) -> &'static str {
        match self {
            TokenType::Refresh => "refresh-token",
            TokenType::Access => "access-token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refresh-token" => Some(TokenType::Refresh),
            "access-token" => Some(TokenType::Access),
            _ => None,
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.claim_str())
    }
}

/// A server-side credential record. `id` is the opaque token's seed, not the
/// encoded wire string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub user_id: String,
    pub token_type: TokenType,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, token_type: TokenType, issued_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            token_type,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }
}
