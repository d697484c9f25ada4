//! Cryptographic primitives for SmellyCoin: ECDSA P-256 keypairs, signing
//! over pre-hashed digests, RIPEMD160(SHA256(pubkey)) address hashing, and
//! base58check P2PKH address encoding.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::EncodedPoint;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

use smellycoin_core::{Hash, PubKeyHash};

/// Version byte for P2PKH addresses.
pub const ADDRESS_VERSION: u8 = 0x00;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("invalid address: base58check failed")]
    InvalidAddressEncoding,
    #[error("invalid address: wrong version byte")]
    InvalidAddressVersion,
    #[error("invalid address: wrong payload length")]
    InvalidAddressLength,
}

/// An ECDSA P-256 keypair.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        KeyPair { signing_key }
    }

    /// The 64-byte uncompressed public key (X || Y, no `0x04` prefix) —
    /// matches what goes into a `TxInput::pub_key` and what a P2PKH address
    /// hashes.
    pub fn public_key_bytes(&self) -> [u8; 64] {
        public_key_bytes(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte digest directly (no additional hashing): callers are
    /// expected to pass `hash(tx.trimmed_copy())`.
    pub fn sign(&self, digest: &Hash) -> Vec<u8> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .expect("P-256 signing over a fixed 32-byte digest cannot fail");
        signature.to_bytes().to_vec()
    }

    /// RIPEMD160(SHA256(pubkey)) for this keypair's public key.
    pub fn pub_key_hash(&self) -> PubKeyHash {
        pub_key_hash(&self.public_key_bytes())
    }

    /// Base58check P2PKH address for this keypair.
    pub fn address(&self) -> String {
        encode_address(&self.pub_key_hash())
    }
}

fn public_key_bytes(verifying_key: &VerifyingKey) -> [u8; 64] {
    let encoded = verifying_key.to_encoded_point(false);
    let mut out = [0u8; 64];
    out.copy_from_slice(&encoded.as_bytes()[1..]);
    out
}

/// Reconstruct a verifying key from a raw 64-byte (X || Y) public key.
fn decode_public_key(pub_key: &[u8]) -> Result<VerifyingKey, CryptoError> {
    if pub_key.len() != 64 {
        return Err(CryptoError::InvalidPublicKey);
    }
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(pub_key);

    let point = EncodedPoint::from_bytes(uncompressed).map_err(|_| CryptoError::InvalidPublicKey)?;
    Option::from(VerifyingKey::from_encoded_point(&point)).ok_or(CryptoError::InvalidPublicKey)
}

/// Verify a signature over a 32-byte digest against a raw 64-byte public key.
pub fn verify(pub_key: &[u8], digest: &Hash, signature: &[u8]) -> Result<bool, CryptoError> {
    let verifying_key = decode_public_key(pub_key)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    Ok(verifying_key.verify_prehash(digest, &signature).is_ok())
}

/// `RIPEMD160(SHA256(pub_key))`.
pub fn pub_key_hash(pub_key: &[u8]) -> PubKeyHash {
    let sha = Sha256::digest(pub_key);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// Encode a public-key hash as a base58check P2PKH address (version `0x00`).
pub fn encode_address(pub_key_hash: &PubKeyHash) -> String {
    bs58::encode(pub_key_hash).with_check_version(ADDRESS_VERSION).into_string()
}

/// Decode and validate a base58check P2PKH address, returning its
/// public-key hash.
pub fn decode_address(address: &str) -> Result<PubKeyHash, CryptoError> {
    let decoded = bs58::decode(address)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .map_err(|_| CryptoError::InvalidAddressEncoding)?;

    // `with_check` yields [version_byte, payload...] with the checksum
    // already verified and stripped.
    let payload = &decoded[1..];
    if payload.len() != 20 {
        return Err(CryptoError::InvalidAddressLength);
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(payload);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_through_base58check() {
        let keypair = KeyPair::generate();
        let address = keypair.address();
        let decoded = decode_address(&address).unwrap();
        assert_eq!(decoded, keypair.pub_key_hash());
    }

    #[test]
    fn decode_address_rejects_corrupted_checksum() {
        let keypair = KeyPair::generate();
        let mut address = keypair.address();
        address.push('x');
        assert!(decode_address(&address).is_err());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = KeyPair::generate();
        let digest = Sha256::digest(b"hello smellycoin").into();
        let signature = keypair.sign(&digest);
        assert!(verify(&keypair.public_key_bytes(), &digest, &signature).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_digest() {
        let keypair = KeyPair::generate();
        let digest: Hash = Sha256::digest(b"hello smellycoin").into();
        let signature = keypair.sign(&digest);
        let other_digest: Hash = Sha256::digest(b"goodbye smellycoin").into();
        assert!(!verify(&keypair.public_key_bytes(), &other_digest, &signature).unwrap());
    }

    #[test]
    fn pub_key_hash_matches_direct_computation() {
        let keypair = KeyPair::generate();
        let expected = pub_key_hash(&keypair.public_key_bytes());
        assert_eq!(keypair.pub_key_hash(), expected);
    }
}
