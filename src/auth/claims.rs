use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Token claims accepted on the websocket handshake.
///
/// `sub` carries the connection identity; everything else the issuer put
/// in the token is kept in `extra` for operators to inspect, but nothing
/// in the realtime core reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Expiry, seconds since epoch. Enforced during validation.
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    /// The identity this token authenticates.
    pub fn identity(&self) -> &str {
        &self.sub
    }
}
