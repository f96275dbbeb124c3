//! Transaction-level types shared by the L1 and L2 records: the tx type
//! enumeration, the 33-byte tx id, the error taxonomy of the envelope
//! layer, and the per-tx data-availability layout.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::keccak256;
use crate::float40::Float40;
use crate::idx::AccountIdx;
use crate::Amount;

/// Total length of an L1 user tx on the wire.
pub const L1_USER_TX_BYTES_LEN: usize = 78;
/// Total length of an L1 coordinator tx on the wire.
pub const L1_COORDINATOR_TX_BYTES_LEN: usize = 101;
/// Maximum number of L1 user txs a single queue accepts.
pub const MAX_L1_USER_TXS_PER_QUEUE: usize = 128;

/// Errors raised by the envelope layer: malformed byte layouts, impossible
/// field combinations, and missing derivation inputs. These reject the tx
/// outright; they are distinct from the semantic ineffectiveness stamped on
/// well-formed L1 user txs during batch processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// An account index does not fit in 48 bits.
    #[error("account index out of range, the maximum is 2^48 - 1")]
    IdxOverflow,
    /// A nonce does not fit in 40 bits.
    #[error("nonce out of range, the maximum is 2^40 - 1")]
    NonceOverflow,
    /// A balance does not fit in the 192 bits of the account leaf packing.
    #[error("balance out of range, the maximum is 2^192 - 1")]
    BalanceOverflow,
    /// A byte slice has the wrong length for the structure it claims to be.
    #[error("cannot parse {what}: got {got} bytes, expected {expected}")]
    BadLength {
        /// What was being decoded.
        what: &'static str,
        /// The length of the provided slice.
        got: usize,
        /// The length the layout requires.
        expected: usize,
    },
    /// The `(from_idx, to_idx, deposit_amount)` combination matches no L1
    /// tx type.
    #[error("cannot determine the type of the L1 tx: from_idx {from_idx}, to_idx {to_idx}")]
    InvalidTxEnvelope {
        /// The sender index of the offending tx.
        from_idx: u64,
        /// The destination index of the offending tx.
        to_idx: u64,
    },
    /// A caller-supplied tx type disagrees with the inferred one.
    #[error("tx type {supplied}, should be {inferred}")]
    TypeMismatch {
        /// The type the caller claimed.
        supplied: TxType,
        /// The type inferred from the fields.
        inferred: TxType,
    },
    /// A user-origin L1 tx has no queue number to derive its id from.
    #[error("user-origin L1 tx without to_forge_l1_txs_num")]
    MissingForgeNum,
    /// A coordinator L1 tx has no batch number to derive its id from.
    #[error("coordinator L1 tx without batch_num")]
    MissingBatchNum,
    /// An amount does not fit the Float40 exponent grid.
    #[error("{0} is not representable as a Float40")]
    Float40NotRepresentable(Amount),
    /// ECDSA recovery of a coordinator tx signer failed.
    #[error("coordinator tx signature recovery failed: {0}")]
    SignatureRecoveryFailed(String),
}

/// The type of a transaction, inferred from its field combination (L1) or
/// declared by the author (L2).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum TxType {
    /// L1: create an account and credit a deposit.
    CreateAccountDeposit,
    /// L1: create an account, credit a deposit, and transfer part of it.
    CreateAccountDepositTransfer,
    /// L1: credit a deposit to an existing account.
    Deposit,
    /// L1: credit a deposit and transfer part of it.
    DepositTransfer,
    /// L1: transfer between existing accounts, forced through the queue.
    ForceTransfer,
    /// L1: exit to L1, forced through the queue.
    ForceExit,
    /// L2: transfer between existing accounts.
    Transfer,
    /// L2: exit to L1.
    Exit,
    /// L2: create a vouch edge.
    CreateVouch,
    /// L2: delete a vouch edge.
    DeleteVouch,
}

impl TxType {
    /// Whether this type belongs to the L1 family.
    pub fn is_l1(&self) -> bool {
        matches!(
            self,
            TxType::CreateAccountDeposit
                | TxType::CreateAccountDepositTransfer
                | TxType::Deposit
                | TxType::DepositTransfer
                | TxType::ForceTransfer
                | TxType::ForceExit
        )
    }

    /// A stable one-byte code, used in the L2 tx id preimage.
    pub fn code(&self) -> u8 {
        match self {
            TxType::CreateAccountDeposit => 0,
            TxType::CreateAccountDepositTransfer => 1,
            TxType::Deposit => 2,
            TxType::DepositTransfer => 3,
            TxType::ForceTransfer => 4,
            TxType::ForceExit => 5,
            TxType::Transfer => 6,
            TxType::Exit => 7,
            TxType::CreateVouch => 8,
            TxType::DeleteVouch => 9,
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A 33-byte transaction id: a one-byte domain prefix followed by the
/// first 32 bytes of a Keccak-256 hash of an id-specific preimage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct TxId(pub [u8; 33]);

impl TxId {
    /// Domain prefix of user-origin L1 txs.
    pub const PREFIX_L1_USER: u8 = 0x00;
    /// Domain prefix of coordinator-origin L1 txs.
    pub const PREFIX_L1_COORD: u8 = 0x01;
    /// Domain prefix of L2 txs.
    pub const PREFIX_L2: u8 = 0x02;

    /// Derives an id from a domain prefix and a preimage.
    pub fn derive(prefix: u8, preimage: &[u8]) -> Self {
        let mut id = [0u8; 33];
        id[0] = prefix;
        id[1..].copy_from_slice(&keccak256(preimage));
        TxId(id)
    }

    /// The all-zero id of a tx that has not been stamped yet.
    pub fn unset() -> Self {
        TxId([0u8; 33])
    }

    /// Whether this id has been stamped.
    pub fn is_set(&self) -> bool {
        self.0 != [0u8; 33]
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::unset()
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Encodes one tx in the per-batch data-availability layout:
/// `from_idx ‖ to_idx ‖ amount(Float40)`, each idx left-padded to
/// `n_levels / 8` bytes.
pub fn tx_to_data_availability(
    from_idx: AccountIdx,
    to_idx: AccountIdx,
    amount: Amount,
    n_levels: u8,
) -> Result<Vec<u8>, TxError> {
    let idx_len = n_levels as usize / 8;
    let mut out = Vec::with_capacity(data_availability_tx_len(n_levels));
    for idx in [from_idx, to_idx] {
        let bytes = idx.to_bytes()?;
        if bytes[..AccountIdx::BYTES_LEN - idx_len].iter().any(|b| *b != 0) {
            return Err(TxError::IdxOverflow);
        }
        out.extend_from_slice(&bytes[AccountIdx::BYTES_LEN - idx_len..]);
    }
    out.extend_from_slice(&Float40::from_amount(amount)?.to_bytes());
    Ok(out)
}

/// Decodes one tx from the data-availability layout. Returns
/// `(from_idx, to_idx, amount)`.
pub fn tx_from_data_availability(
    b: &[u8],
    n_levels: u8,
) -> Result<(AccountIdx, AccountIdx, Amount), TxError> {
    let idx_len = n_levels as usize / 8;
    let expected = data_availability_tx_len(n_levels);
    if b.len() != expected {
        return Err(TxError::BadLength {
            what: "data-availability tx",
            got: b.len(),
            expected,
        });
    }
    let mut padded = [0u8; AccountIdx::BYTES_LEN];
    padded[AccountIdx::BYTES_LEN - idx_len..].copy_from_slice(&b[..idx_len]);
    let from_idx = AccountIdx::from_bytes(&padded)?;
    padded = [0u8; AccountIdx::BYTES_LEN];
    padded[AccountIdx::BYTES_LEN - idx_len..].copy_from_slice(&b[idx_len..idx_len * 2]);
    let to_idx = AccountIdx::from_bytes(&padded)?;
    let amount = Float40::from_bytes(&b[idx_len * 2..])?.to_amount();
    Ok((from_idx, to_idx, amount))
}

/// The per-tx length of the data-availability layout: `2·(n_levels/8) + 5`.
pub fn data_availability_tx_len(n_levels: u8) -> usize {
    2 * (n_levels as usize / 8) + Float40::BYTES_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txid_prefix_and_determinism() {
        let a = TxId::derive(TxId::PREFIX_L1_USER, b"preimage");
        let b = TxId::derive(TxId::PREFIX_L1_USER, b"preimage");
        let c = TxId::derive(TxId::PREFIX_L1_COORD, b"preimage");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0[0], TxId::PREFIX_L1_USER);
        assert_eq!(c.0[0], TxId::PREFIX_L1_COORD);
        assert_eq!(a.0[1..], c.0[1..]);
    }

    #[test]
    fn data_availability_round_trip() {
        let from = AccountIdx::new(256).unwrap();
        let to = AccountIdx::new(257).unwrap();
        let amount = Amount::from(4200u64);
        let encoded = tx_to_data_availability(from, to, amount, 48).unwrap();
        assert_eq!(encoded.len(), data_availability_tx_len(48));
        let (f, t, a) = tx_from_data_availability(&encoded, 48).unwrap();
        assert_eq!((f, t, a), (from, to, amount));
    }

    #[test]
    fn data_availability_rejects_oversized_idx() {
        // 2^16 does not fit the single idx byte of a 8-level tree.
        let from = AccountIdx::new(1 << 16).unwrap();
        let to = AccountIdx::new(1).unwrap();
        let err = tx_to_data_availability(from, to, Amount::zero(), 8).unwrap_err();
        assert_eq!(err, TxError::IdxOverflow);
    }
}
