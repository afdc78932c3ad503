//! PKCE (RFC 7636) verifier/challenge pairs.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng as _;
use sha2::{Digest, Sha256};

/// A fresh code verifier and its S256 challenge.
///
/// The challenge goes into the authorization URL; the verifier is sent with
/// the token exchange.
#[derive(Clone)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkceChallenge {
    /// Generates a random 32-byte verifier and its challenge.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
        let code_verifier = URL_SAFE_NO_PAD.encode(bytes);
        let code_challenge = Self::challenge_for(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }

    /// Computes the S256 challenge for `verifier`.
    pub fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}

impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("code_verifier", &"<redacted>")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}
