//! Account-creation authorizations.
//!
//! A coordinator may open an account on a user's behalf only when it holds
//! a signature by the user's Ethereum key over a digest binding the chain
//! id, the rollup contract address and the user's Baby-Jubjub key. The
//! digest follows the EIP-191 personal-message scheme so ordinary wallets
//! can produce it.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};

use crate::account::BjjPubKey;
use crate::encoding::{eth_address_from_pubkey, keccak256};
use crate::tx::TxError;
use crate::{EthAddr, Hash32};

/// The EIP-191 prefix for an Ethereum signed message.
/// <https://eips.ethereum.org/EIPS/eip-191>
pub const ETH_SIGNED_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// Domain separator of the account-creation digest.
pub const ACCOUNT_CREATION_DOMAIN: &[u8] = b"uniq-rollup account creation";

/// The sentinel address of coordinator txs authorized by a Baby-Jubjub
/// proof inside the circuit instead of an Ethereum signature.
pub const INTERNAL_ETH_ADDR: EthAddr = ethereum_types::H160([0xff; 20]);

/// Length of the `r ‖ s ‖ v` signature encoding.
pub const SIGNATURE_BYTES_LEN: usize = 65;

/// A user's standing permission for the coordinator to create their
/// account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCreationAuth {
    /// The Ethereum address that granted the permission.
    pub eth_addr: EthAddr,
    /// The Baby-Jubjub key the created account will carry.
    pub bjj: BjjPubKey,
    /// The `r ‖ s ‖ v` signature, when one has been collected.
    pub signature: Option<[u8; SIGNATURE_BYTES_LEN]>,
}

impl AccountCreationAuth {
    /// The digest a wallet signs: the EIP-191 wrapping of
    /// `Keccak256(domain ‖ chain_id(2 BE) ‖ contract_addr(20) ‖ bjj(32))`.
    pub fn hash_to_sign(bjj: &BjjPubKey, chain_id: u16, contract_addr: EthAddr) -> Hash32 {
        let inner = Keccak256::new()
            .chain_update(ACCOUNT_CREATION_DOMAIN)
            .chain_update(chain_id.to_be_bytes())
            .chain_update(contract_addr.as_bytes())
            .chain_update(bjj.0)
            .finalize();
        let mut personal = Vec::with_capacity(ETH_SIGNED_MESSAGE_PREFIX.len() + 2 + 32);
        personal.extend_from_slice(ETH_SIGNED_MESSAGE_PREFIX.as_bytes());
        personal.extend_from_slice(b"32");
        personal.extend_from_slice(&inner);
        keccak256(&personal)
    }

    /// Signs the digest with `sk`, producing a complete authorization.
    pub fn sign(sk: &SecretKey, bjj: BjjPubKey, chain_id: u16, contract_addr: EthAddr) -> Self {
        let digest = Self::hash_to_sign(&bjj, chain_id, contract_addr);
        let msg = Message::from_digest(digest);
        let sig = SECP256K1.sign_ecdsa_recoverable(&msg, sk);
        let (rec_id, compact) = sig.serialize_compact();
        let mut signature = [0u8; SIGNATURE_BYTES_LEN];
        signature[..64].copy_from_slice(&compact);
        // Ethereum tooling offsets the recovery id by 27.
        signature[64] = rec_id.to_i32() as u8 + 27;
        let eth_addr = eth_address_from_pubkey(&sk.public_key(SECP256K1));
        AccountCreationAuth {
            eth_addr,
            bjj,
            signature: Some(signature),
        }
    }

    /// Whether the carried signature recovers to `eth_addr`.
    pub fn verify(&self, chain_id: u16, contract_addr: EthAddr) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let digest = Self::hash_to_sign(&self.bjj, chain_id, contract_addr);
        match recover_signer(digest, signature) {
            Ok(addr) => addr == self.eth_addr,
            Err(_) => false,
        }
    }
}

/// Recovers the Ethereum address that produced an `r ‖ s ‖ v` signature
/// over `digest`. Accepts both raw (0/1) and Ethereum-offset (27/28)
/// recovery ids.
pub fn recover_signer(
    digest: Hash32,
    signature: &[u8; SIGNATURE_BYTES_LEN],
) -> Result<EthAddr, TxError> {
    let mut v = signature[64];
    if v == 27 || v == 28 {
        v -= 27;
    }
    let rec_id = RecoveryId::from_i32(v as i32)
        .map_err(|e| TxError::SignatureRecoveryFailed(e.to_string()))?;
    let sig = RecoverableSignature::from_compact(&signature[..64], rec_id)
        .map_err(|e| TxError::SignatureRecoveryFailed(e.to_string()))?;
    let msg = Message::from_digest(digest);
    let pub_key = SECP256K1
        .recover_ecdsa(&msg, &sig)
        .map_err(|e| TxError::SignatureRecoveryFailed(e.to_string()))?;
    Ok(eth_address_from_pubkey(&pub_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let sk = secret(0x11);
        let contract = EthAddr::from_slice(&[0xaa; 20]);
        let auth = AccountCreationAuth::sign(&sk, BjjPubKey([3u8; 32]), 5, contract);
        assert!(auth.verify(5, contract));
    }

    #[test]
    fn verify_binds_chain_and_contract() {
        let sk = secret(0x22);
        let contract = EthAddr::from_slice(&[0xaa; 20]);
        let auth = AccountCreationAuth::sign(&sk, BjjPubKey([3u8; 32]), 5, contract);
        assert!(!auth.verify(6, contract));
        assert!(!auth.verify(5, EthAddr::from_slice(&[0xab; 20])));
    }

    #[test]
    fn verify_rejects_a_foreign_signer() {
        let contract = EthAddr::from_slice(&[0xaa; 20]);
        let mut auth = AccountCreationAuth::sign(&secret(0x33), BjjPubKey([3u8; 32]), 5, contract);
        // Keep the signature but claim someone else granted it.
        auth.eth_addr = EthAddr::from_slice(&[0x01; 20]);
        assert!(!auth.verify(5, contract));
    }

    #[test]
    fn missing_signature_never_verifies() {
        let auth = AccountCreationAuth {
            eth_addr: EthAddr::from_slice(&[0x01; 20]),
            bjj: BjjPubKey([0u8; 32]),
            signature: None,
        };
        assert!(!auth.verify(0, INTERNAL_ETH_ADDR));
    }
}
