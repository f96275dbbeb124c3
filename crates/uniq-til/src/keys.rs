//! Deterministic key material for scenario users.
//!
//! Keys are derived from a Keccak-based PRF keyed by `(seed, ordinal)`,
//! where the ordinal is the user's position of first appearance in the
//! scenario. The same scenario therefore always yields the same keys, on
//! every platform. The Ethereum key is a real secp256k1 secret (the
//! address must survive ECDSA recovery checks); the Baby-Jubjub pair is
//! opaque bytes, since the sequencer core never does curve arithmetic on
//! it.

use secp256k1::{SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};
use uniq_common::encoding::eth_address_from_pubkey;
use uniq_common::{BjjPubKey, EthAddr};

/// The key material of one scenario user.
#[derive(Debug, Clone)]
pub struct UserKeys {
    /// The Baby-Jubjub secret key.
    pub bjj_sk: [u8; 32],
    /// The compressed Baby-Jubjub public key.
    pub bjj: BjjPubKey,
    /// The Ethereum secret key.
    pub eth_sk: SecretKey,
    /// The Ethereum address derived from `eth_sk`.
    pub addr: EthAddr,
}

fn prf(domain: &str, seed: u64, ordinal: u64, counter: u8) -> [u8; 32] {
    Keccak256::new()
        .chain_update(domain.as_bytes())
        .chain_update(seed.to_be_bytes())
        .chain_update(ordinal.to_be_bytes())
        .chain_update([counter])
        .finalize()
        .into()
}

/// Derives the keys of the `ordinal`-th user of a scenario.
pub fn derive_user_keys(seed: u64, ordinal: u64) -> UserKeys {
    let bjj_sk = prf("uniq-til/bjj-sk", seed, ordinal, 0);
    let bjj = BjjPubKey(prf("uniq-til/bjj-pk", seed, ordinal, 0));

    // Retry on the (astronomically unlikely) out-of-range scalar rather
    // than panicking on a fixed derivation.
    let mut counter = 0u8;
    let eth_sk = loop {
        if let Ok(sk) = SecretKey::from_slice(&prf("uniq-til/eth-sk", seed, ordinal, counter)) {
            break sk;
        }
        counter += 1;
    };
    let addr = eth_address_from_pubkey(&eth_sk.public_key(SECP256K1));

    UserKeys {
        bjj_sk,
        bjj,
        eth_sk,
        addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_ordinal() {
        let a0 = derive_user_keys(0, 0);
        let a1 = derive_user_keys(0, 0);
        assert_eq!(a0.bjj, a1.bjj);
        assert_eq!(a0.bjj_sk, a1.bjj_sk);
        assert_eq!(a0.addr, a1.addr);

        let b = derive_user_keys(0, 1);
        assert_ne!(a0.bjj, b.bjj);
        assert_ne!(a0.addr, b.addr);

        let other_seed = derive_user_keys(7, 0);
        assert_ne!(a0.addr, other_seed.addr);
    }

    #[test]
    fn secret_and_public_material_do_not_alias() {
        let keys = derive_user_keys(0, 0);
        assert_ne!(keys.bjj_sk, keys.bjj.0);
        assert_ne!(hex::encode(keys.bjj_sk), hex::encode(keys.eth_sk.secret_bytes()));
    }
}
