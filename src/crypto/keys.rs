//! Account key management using ECDSA over secp256k1.
//!
//! An account IS a key pair: the public key identifies the account (through
//! its fingerprint) and the private key authorizes spends. Public keys
//! travel as ASN.1 DER `SubjectPublicKeyInfo` so the byte form is canonical
//! across implementations; signatures are 64-byte `r || s` with RFC 6979
//! deterministic nonces.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::pkcs8::{DecodePublicKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::hash::TxHash;

/// Fixed signature size (`r || s`).
pub const SIGNATURE_BYTES: usize = 64;

/// Secret scalar size for secp256k1.
const SECRET_BYTES: usize = 32;

/// Errors from key operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("key bytes truncated or malformed")]
    Malformed,
    #[error("public key does not match secret key")]
    Mismatch,
}

// ── Public Key ──

/// An account public key, held as validated DER `SubjectPublicKeyInfo` bytes.
///
/// Inner bytes are `pub(crate)` so unvalidated keys cannot be constructed
/// from outside; use [`PublicKey::from_der`] or deserialization.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub(crate) Vec<u8>);

impl PublicKey {
    /// Parse and validate a DER-encoded public key.
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        VerifyingKey::from_public_key_der(der).map_err(|_| KeyError::InvalidKey)?;
        Ok(PublicKey(der.to_vec()))
    }

    /// The canonical DER bytes.
    pub fn as_der(&self) -> &[u8] {
        &self.0
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let vk = match VerifyingKey::from_public_key_der(&self.0) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig = match k256::ecdsa::Signature::from_slice(&signature.0) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        vk.verify(message, &sig).is_ok()
    }

    /// Stable account identifier: BLAKE3 digest of the DER bytes.
    pub fn fingerprint(&self) -> TxHash {
        let mut hasher = blake3::Hasher::new_derive_key("filament.account.fingerprint");
        hasher.update(&self.0);
        TxHash(*hasher.finalize().as_bytes())
    }

    /// The hex account identifier shown to operators.
    pub fn account_hex(&self) -> String {
        self.fingerprint().to_hex()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.account_hex()[..16])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Validate on deserialization so malformed keys never enter the DAG
        PublicKey::from_der(&bytes)
            .map_err(|_| serde::de::Error::custom("invalid DER public key"))
    }
}

// ── Signature ──

/// An ECDSA signature (64 bytes, `r || s`).
///
/// Inner bytes are `pub(crate)` to enforce size validation through
/// deserialization.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// The placeholder signature carried by inputs before mining completes.
    /// Always fails verification.
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Empty (placeholder) and exact-size signatures are accepted; anything
        // else is rejected before allocation grows.
        if !bytes.is_empty() && bytes.len() != SIGNATURE_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

// ── Key Pair ──

/// An account key pair.
///
/// Implements [`Clone`] because the same account signs from the operator
/// thread and from background authoring tasks. The secret scalar is zeroized
/// by the underlying signing key on drop.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut rand::thread_rng());
        let public = encode_public(signing.verifying_key());
        KeyPair { signing, public }
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Hex account identifier of the public half.
    pub fn account_hex(&self) -> String {
        self.public.account_hex()
    }

    /// Check curve membership and private/public consistency.
    pub fn validate(&self) -> Result<(), KeyError> {
        let vk = VerifyingKey::from_public_key_der(&self.public.0)
            .map_err(|_| KeyError::InvalidKey)?;
        if vk != *self.signing.verifying_key() {
            return Err(KeyError::Mismatch);
        }
        Ok(())
    }

    /// Sign a message with the private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: k256::ecdsa::Signature = self.signing.sign(message);
        Signature(sig.to_bytes().to_vec())
    }

    /// Serialize for external persistence:
    /// `[pk_len: u32 LE][pk DER][32-byte secret scalar]`.
    pub fn save(&self) -> Vec<u8> {
        let der = self.public.as_der();
        let mut out = Vec::with_capacity(4 + der.len() + SECRET_BYTES);
        out.extend_from_slice(&(der.len() as u32).to_le_bytes());
        out.extend_from_slice(der);
        out.extend_from_slice(&self.signing.to_bytes());
        out
    }

    /// Load a key pair previously written by [`KeyPair::save`].
    pub fn load(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() < 4 {
            return Err(KeyError::Malformed);
        }
        let pk_len = u32::from_le_bytes(bytes[..4].try_into().map_err(|_| KeyError::Malformed)?)
            as usize;
        if bytes.len() != 4 + pk_len + SECRET_BYTES {
            return Err(KeyError::Malformed);
        }
        let public = PublicKey::from_der(&bytes[4..4 + pk_len])?;
        let mut sk_bytes: [u8; SECRET_BYTES] = bytes[4 + pk_len..]
            .try_into()
            .map_err(|_| KeyError::Malformed)?;
        let signing = SigningKey::from_slice(&sk_bytes).map_err(|_| KeyError::InvalidKey);
        sk_bytes.zeroize();
        let signing = signing?;
        let keypair = KeyPair { signing, public };
        keypair.validate()?;
        Ok(keypair)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", &self.account_hex()[..16])
    }
}

/// Encode a verifying key as DER SPKI. DER encoding of a valid point cannot
/// fail in practice; if it somehow does, log and return a degenerate key
/// that fails every verification instead of panicking.
fn encode_public(vk: &VerifyingKey) -> PublicKey {
    match vk.to_public_key_der() {
        Ok(doc) => PublicKey(doc.as_bytes().to_vec()),
        Err(_) => {
            tracing::error!("DER encoding of a verifying key failed");
            PublicKey(Vec::new())
        }
    }
}
