//! Node key pair and the string encodings used on the wire.
//!
//! Public keys travel as lowercase hex of the 32-byte Ed25519 verifying key.
//! Signatures travel as an `(r, s)` pair: the two 32-byte halves of the
//! Ed25519 signature, each hex encoded.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Signature split into its `R` and `S` components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePair {
    pub r: String,
    pub s: String,
}

impl SignaturePair {
    pub fn from_signature(sig: &Signature) -> Self {
        Self {
            r: hex::encode(sig.r_bytes()),
            s: hex::encode(sig.s_bytes()),
        }
    }

    pub fn to_signature(&self) -> Result<Signature> {
        let r = decode_half(&self.r)?;
        let s = decode_half(&self.s)?;
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&r);
        bytes[32..].copy_from_slice(&s);
        Ok(Signature::from_bytes(&bytes))
    }
}

fn decode_half(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| Error::InvalidKey(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::InvalidKey(format!("signature half has {} bytes", bytes.len())))
}

/// This node's signing key.
pub struct NodeKeys {
    signing: SigningKey,
}

impl NodeKeys {
    /// Generate a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic key pair (tests, simulations).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Hex encoding of the public key, as sent in `connect` messages.
    pub fn public_key_string(&self) -> String {
        encode_public_key(&self.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> SignaturePair {
        SignaturePair::from_signature(&self.signing.sign(msg))
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public", &self.public_key_string())
            .finish_non_exhaustive()
    }
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

pub fn decode_public_key(s: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(s).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let Ok(array) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        return Err(Error::InvalidKey(format!("public key has {} bytes", bytes.len())));
    };
    VerifyingKey::from_bytes(&array).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Verify `sig` over `msg`; `signer` only labels the error.
pub fn verify(key: &VerifyingKey, msg: &[u8], sig: &SignaturePair, signer: &str) -> Result<()> {
    let sig = sig.to_signature()?;
    key.verify(msg, &sig)
        .map_err(|_| Error::InvalidSignature(signer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = NodeKeys::from_seed([7u8; 32]);
        let sig = keys.sign(b"hello");
        assert!(verify(&keys.verifying_key(), b"hello", &sig, "p1").is_ok());
        assert!(verify(&keys.verifying_key(), b"hellp", &sig, "p1").is_err());
    }

    #[test]
    fn other_key_rejected() {
        let alice = NodeKeys::from_seed([1u8; 32]);
        let bob = NodeKeys::from_seed([2u8; 32]);
        let sig = alice.sign(b"move");
        assert!(matches!(
            verify(&bob.verifying_key(), b"move", &sig, "alice"),
            Err(Error::InvalidSignature(_))
        ));
    }

    #[test]
    fn public_key_string_decodes() {
        let keys = NodeKeys::generate();
        let decoded = decode_public_key(&keys.public_key_string()).unwrap();
        assert_eq!(decoded, keys.verifying_key());
        assert!(decode_public_key("abcd").is_err());
        assert!(decode_public_key("not hex").is_err());
    }

    #[test]
    fn truncated_signature_rejected() {
        let keys = NodeKeys::from_seed([3u8; 32]);
        let mut sig = keys.sign(b"x");
        sig.s.truncate(10);
        assert!(matches!(sig.to_signature(), Err(Error::InvalidKey(_))));
    }
}
