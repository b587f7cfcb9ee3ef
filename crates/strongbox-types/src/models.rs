use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-allocated 16-byte client identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub const LEN: usize = 16;

    /// All-zero id, used in the header of a REGISTER request before the
    /// server has assigned one.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// 32 lowercase hex digits, no dashes.
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
