//! The L1 transaction record: txs that enter the rollup through the L1
//! contract, either from users (via the forced queue) or from the
//! coordinator (account creations backed by an authorization).

use crate::account::BjjPubKey;
use crate::auth::{recover_signer, AccountCreationAuth, INTERNAL_ETH_ADDR, SIGNATURE_BYTES_LEN};
use crate::encoding::swap_endianness;
use crate::float40::Float40;
use crate::idx::{AccountIdx, BatchNum, EthBlockNum};
use crate::tx::{
    tx_from_data_availability, tx_to_data_availability, TxError, TxId, TxType,
    L1_COORDINATOR_TX_BYTES_LEN, L1_USER_TX_BYTES_LEN,
};
use crate::{Amount, EthAddr};

/// An L1 transaction.
///
/// User-origin txs carry a `to_forge_l1_txs_num` naming the queue that
/// will forge them; coordinator-origin txs instead carry the `batch_num`
/// they were forged in. The `effective_*` fields are stamped by the batch
/// processor: they equal the declared amounts when the tx applied, and
/// zero when it was semantically invalid and kept only its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L1Tx {
    /// The 33-byte tx id, derived by [`L1Tx::set_id`].
    pub tx_id: TxId,
    /// The queue this user tx was (or will be) forged from. Present iff
    /// `user_origin`.
    pub to_forge_l1_txs_num: Option<u64>,
    /// Zero-based index of the tx within its queue (user origin) or its
    /// batch (coordinator origin).
    pub position: u16,
    /// Whether a user or the coordinator originated the tx.
    pub user_origin: bool,
    /// The sender leaf, or the "no account" sentinel for creations.
    pub from_idx: AccountIdx,
    /// The leaf an account-creating tx actually got, stamped at forge
    /// time.
    pub effective_from_idx: Option<AccountIdx>,
    /// The sender's Ethereum address.
    pub from_eth_addr: EthAddr,
    /// The sender's compressed Baby-Jubjub key.
    pub from_bjj: BjjPubKey,
    /// The destination leaf, the exit sentinel, or the "no account"
    /// sentinel.
    pub to_idx: AccountIdx,
    /// The declared transfer amount.
    pub amount: Amount,
    /// The transfer amount that actually applied.
    pub effective_amount: Option<Amount>,
    /// The declared deposit amount.
    pub deposit_amount: Amount,
    /// The deposit amount that actually applied.
    pub effective_deposit_amount: Option<Amount>,
    /// The L1 block in which the tx was observed.
    pub eth_block_num: EthBlockNum,
    /// The batch that forged the tx. Present iff forged (user origin) or
    /// always (coordinator origin).
    pub batch_num: Option<BatchNum>,
    /// The tx type, inferred by [`L1Tx::set_type`].
    pub tx_type: Option<TxType>,
}

impl L1Tx {
    /// Runs [`L1Tx::set_type`] and [`L1Tx::set_id`], returning the fully
    /// stamped tx.
    pub fn normalize(mut self) -> Result<Self, TxError> {
        self.set_type()?;
        self.set_id()?;
        Ok(self)
    }

    /// Infers the tx type from `(from_idx, to_idx, deposit_amount)`:
    ///
    /// | `from_idx` | `to_idx` | `deposit_amount` | type |
    /// |-----------|----------|------------------|------|
    /// | 0 | 0 | any | `CreateAccountDeposit` |
    /// | 0 | ≥256 | any | `CreateAccountDepositTransfer` |
    /// | ≥256 | 0 | any | `Deposit` |
    /// | ≥256 | 1 | any | `ForceExit` |
    /// | ≥256 | ≥256 | 0 | `ForceTransfer` |
    /// | ≥256 | ≥256 | >0 | `DepositTransfer` |
    ///
    /// Any other combination is [`TxError::InvalidTxEnvelope`]. A type
    /// already present on the tx must match the inferred one.
    pub fn set_type(&mut self) -> Result<(), TxError> {
        let invalid = || TxError::InvalidTxEnvelope {
            from_idx: self.from_idx.as_u64(),
            to_idx: self.to_idx.as_u64(),
        };
        let inferred = if self.from_idx == AccountIdx::NONE {
            if self.to_idx == AccountIdx::NONE {
                TxType::CreateAccountDeposit
            } else if self.to_idx.is_user() {
                TxType::CreateAccountDepositTransfer
            } else {
                return Err(invalid());
            }
        } else if self.from_idx.is_user() {
            if self.to_idx == AccountIdx::NONE {
                TxType::Deposit
            } else if self.to_idx == AccountIdx::EXIT {
                TxType::ForceExit
            } else if self.to_idx.is_user() {
                if self.deposit_amount.is_zero() {
                    TxType::ForceTransfer
                } else {
                    TxType::DepositTransfer
                }
            } else {
                return Err(invalid());
            }
        } else {
            return Err(invalid());
        };
        if let Some(supplied) = self.tx_type {
            if supplied != inferred {
                return Err(TxError::TypeMismatch { supplied, inferred });
            }
        }
        self.tx_type = Some(inferred);
        Ok(())
    }

    /// Derives the tx id. User-origin txs hash
    /// `to_forge_l1_txs_num(8 BE) ‖ position(2 BE)` under the `0x00`
    /// prefix; coordinator txs hash `batch_num(8 BE) ‖ position(2 BE)`
    /// under `0x01`.
    pub fn set_id(&mut self) -> Result<(), TxError> {
        let mut preimage = [0u8; 10];
        let prefix = if self.user_origin {
            let forge_num = self.to_forge_l1_txs_num.ok_or(TxError::MissingForgeNum)?;
            preimage[..8].copy_from_slice(&forge_num.to_be_bytes());
            TxId::PREFIX_L1_USER
        } else {
            let batch_num = self.batch_num.ok_or(TxError::MissingBatchNum)?;
            preimage[..8].copy_from_slice(&batch_num.as_u64().to_be_bytes());
            TxId::PREFIX_L1_COORD
        };
        preimage[8..].copy_from_slice(&self.position.to_be_bytes());
        self.tx_id = TxId::derive(prefix, &preimage);
        Ok(())
    }

    /// Encodes a user tx into its fixed 78-byte calldata layout:
    /// `from_eth_addr(20) ‖ from_bjj(32, swapped) ‖ from_idx(6) ‖
    /// deposit_amount(5) ‖ amount(5) ‖ reserved(4) ‖ to_idx(6)`.
    pub fn to_bytes(&self) -> Result<[u8; L1_USER_TX_BYTES_LEN], TxError> {
        let mut b = [0u8; L1_USER_TX_BYTES_LEN];
        b[0..20].copy_from_slice(self.from_eth_addr.as_bytes());
        b[20..52].copy_from_slice(&swap_endianness(&self.from_bjj.0));
        b[52..58].copy_from_slice(&self.from_idx.to_bytes()?);
        b[58..63].copy_from_slice(&Float40::from_amount(self.deposit_amount)?.to_bytes());
        b[63..68].copy_from_slice(&Float40::from_amount(self.amount)?.to_bytes());
        b[72..78].copy_from_slice(&self.to_idx.to_bytes()?);
        Ok(b)
    }

    /// Decodes a user tx from its 78-byte calldata layout.
    pub fn from_bytes(b: &[u8]) -> Result<Self, TxError> {
        if b.len() != L1_USER_TX_BYTES_LEN {
            return Err(TxError::BadLength {
                what: "L1 user tx",
                got: b.len(),
                expected: L1_USER_TX_BYTES_LEN,
            });
        }
        let mut bjj = [0u8; 32];
        bjj.copy_from_slice(&swap_endianness(&b[20..52]));
        Ok(L1Tx {
            user_origin: true,
            from_eth_addr: EthAddr::from_slice(&b[0..20]),
            from_bjj: BjjPubKey(bjj),
            from_idx: AccountIdx::from_bytes(&b[52..58])?,
            deposit_amount: Float40::from_bytes(&b[58..63])?.to_amount(),
            amount: Float40::from_bytes(&b[63..68])?.to_amount(),
            to_idx: AccountIdx::from_bytes(&b[72..78])?,
            ..Default::default()
        })
    }

    /// Decodes a coordinator tx from its fixed 101-byte layout
    /// `v(1) ‖ s(32) ‖ r(32) ‖ bjj(32, swapped) ‖ reserved(4)`. A nonzero
    /// `v` recovers the signer of the account-creation authorization; a
    /// zero `v` marks an internal-only creation.
    pub fn coordinator_from_bytes(
        b: &[u8],
        chain_id: u16,
        contract_addr: EthAddr,
    ) -> Result<Self, TxError> {
        if b.len() != L1_COORDINATOR_TX_BYTES_LEN {
            return Err(TxError::BadLength {
                what: "L1 coordinator tx",
                got: b.len(),
                expected: L1_COORDINATOR_TX_BYTES_LEN,
            });
        }
        let v = b[0];
        let mut bjj = [0u8; 32];
        bjj.copy_from_slice(&swap_endianness(&b[65..97]));
        let from_bjj = BjjPubKey(bjj);

        let from_eth_addr = if v > 0 {
            let mut signature = [0u8; SIGNATURE_BYTES_LEN];
            signature[..32].copy_from_slice(&b[33..65]); // r
            signature[32..64].copy_from_slice(&b[1..33]); // s
            signature[64] = v;
            let digest = AccountCreationAuth::hash_to_sign(&from_bjj, chain_id, contract_addr);
            recover_signer(digest, &signature)?
        } else {
            INTERNAL_ETH_ADDR
        };

        Ok(L1Tx {
            user_origin: false,
            from_eth_addr,
            from_bjj,
            ..Default::default()
        })
    }

    /// Encodes a coordinator tx. `signature` is the `r ‖ s ‖ v`
    /// authorization signature, absent for internal-only creations.
    pub fn coordinator_to_bytes(
        bjj: &BjjPubKey,
        signature: Option<&[u8; SIGNATURE_BYTES_LEN]>,
    ) -> [u8; L1_COORDINATOR_TX_BYTES_LEN] {
        let mut b = [0u8; L1_COORDINATOR_TX_BYTES_LEN];
        if let Some(sig) = signature {
            b[0] = sig[64];
            b[1..33].copy_from_slice(&sig[32..64]); // s
            b[33..65].copy_from_slice(&sig[..32]); // r
        }
        b[65..97].copy_from_slice(&swap_endianness(&bjj.0));
        b
    }

    /// Encodes the tx in the per-batch data-availability layout. The
    /// effective amount is what data availability commits to; an unforged
    /// tx falls back to its declared amount.
    pub fn to_data_availability(&self, n_levels: u8) -> Result<Vec<u8>, TxError> {
        tx_to_data_availability(
            self.from_idx,
            self.to_idx,
            self.effective_amount.unwrap_or(self.amount),
            n_levels,
        )
    }

    /// Decodes a tx from the data-availability layout. Only the fields
    /// data availability carries are populated.
    pub fn from_data_availability(b: &[u8], n_levels: u8) -> Result<Self, TxError> {
        let (from_idx, to_idx, amount) = tx_from_data_availability(b, n_levels)?;
        Ok(L1Tx {
            from_idx,
            to_idx,
            effective_amount: Some(amount),
            ..Default::default()
        })
    }
}
