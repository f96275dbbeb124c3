//! Small byte-level helpers shared across the codecs.

use sha3::{Digest, Keccak256};

use crate::{EthAddr, Hash32};

/// Reverses the byte order of a slice.
///
/// Baby-Jubjub public keys are little-endian in the library representation
/// but big-endian inside on-chain calldata; this normalizes between the two.
pub fn swap_endianness(b: &[u8]) -> Vec<u8> {
    b.iter().rev().copied().collect()
}

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> Hash32 {
    Keccak256::digest(data).into()
}

/// Keccak-256 of the concatenation of two 32-byte values.
pub fn keccak256_concat(a: &Hash32, b: &Hash32) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Derives an Ethereum address from an uncompressed secp256k1 public key:
/// the last 20 bytes of the keccak hash of the 64-byte point encoding.
pub fn eth_address_from_pubkey(pub_key: &secp256k1::PublicKey) -> EthAddr {
    let uncompressed: [u8; 65] = pub_key.serialize_uncompressed();
    // The first byte is the SEC1 tag, which is not part of the hash preimage.
    let hash = keccak256(&uncompressed[1..]);
    EthAddr::from_slice(&hash[12..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_endianness_is_an_involution() {
        let b: Vec<u8> = (0u8..32).collect();
        assert_eq!(swap_endianness(&swap_endianness(&b)), b);
    }

    #[test]
    fn keccak_concat_matches_manual_concat() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut joined = Vec::with_capacity(64);
        joined.extend_from_slice(&a);
        joined.extend_from_slice(&b);
        assert_eq!(keccak256_concat(&a, &b), keccak256(&joined));
    }
}
