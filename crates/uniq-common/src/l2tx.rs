//! The L2 transaction record: txs authored and signed inside the rollup
//! and selected into batches by the coordinator.

use crate::float40::Float40;
use crate::idx::{AccountIdx, BatchNum, EthBlockNum, Nonce};
use crate::tx::{tx_to_data_availability, TxError, TxId, TxType};
use crate::Amount;

/// An L2 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Tx {
    /// The 33-byte tx id, derived by [`L2Tx::set_id`].
    pub tx_id: TxId,
    /// The authoring account.
    pub from_idx: AccountIdx,
    /// The destination: an account leaf for transfers and vouch
    /// operations, the exit sentinel for exits.
    pub to_idx: AccountIdx,
    /// The transfer amount. Zero for vouch operations.
    pub amount: Amount,
    /// The author's nonce at signing time.
    pub nonce: Nonce,
    /// The declared tx type.
    pub tx_type: TxType,
    /// Zero-based index of the tx among its batch's L2 txs.
    pub position: u16,
    /// The batch that forged the tx, once selected.
    pub batch_num: Option<BatchNum>,
    /// The L1 block under which the forging batch was mined.
    pub eth_block_num: EthBlockNum,
}

impl L2Tx {
    /// Builds a tx and derives its id.
    pub fn new(
        from_idx: AccountIdx,
        to_idx: AccountIdx,
        amount: Amount,
        nonce: Nonce,
        tx_type: TxType,
    ) -> Result<Self, TxError> {
        let mut tx = L2Tx {
            tx_id: TxId::unset(),
            from_idx,
            to_idx,
            amount,
            nonce,
            tx_type,
            position: 0,
            batch_num: None,
            eth_block_num: EthBlockNum::default(),
        };
        tx.set_id()?;
        Ok(tx)
    }

    /// Derives the tx id from the fields the author signs over:
    /// `from_idx(6) ‖ to_idx(6) ‖ amount(Float40) ‖ nonce(5 BE) ‖
    /// type_code(1)` under the `0x02` prefix.
    pub fn set_id(&mut self) -> Result<(), TxError> {
        let mut preimage = Vec::with_capacity(23);
        preimage.extend_from_slice(&self.from_idx.to_bytes()?);
        preimage.extend_from_slice(&self.to_idx.to_bytes()?);
        preimage.extend_from_slice(&Float40::from_amount(self.amount)?.to_bytes());
        preimage.extend_from_slice(&self.nonce.to_bytes());
        preimage.push(self.tx_type.code());
        self.tx_id = TxId::derive(TxId::PREFIX_L2, &preimage);
        Ok(())
    }

    /// Encodes the tx in the per-batch data-availability layout.
    pub fn to_data_availability(&self, n_levels: u8) -> Result<Vec<u8>, TxError> {
        tx_to_data_availability(self.from_idx, self.to_idx, self.amount, n_levels)
    }
}
