// src/token.rs
use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 16;
const FINGERPRINT_LEN: usize = 12;

/// Capability string scoping one pairing attempt's routes.
///
/// Hex keeps it path-safe; `Debug` only shows a fingerprint so tokens can be
/// passed to log macros without leaking them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut fp = hex::encode(digest);
        fp.truncate(FINGERPRINT_LEN);
        fp
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.fingerprint())
    }
}
