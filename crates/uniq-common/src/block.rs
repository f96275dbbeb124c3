//! The block- and batch-level payloads the sequencer core hands to
//! downstream consumers (the archival history store and the prover).
//!
//! These records are shaped for atomic per-block insertion, ordered by
//! block number with no gaps: a [`BlockData`] carries everything the
//! rollup produced under one L1 block.

use crate::account::Account;
use crate::idx::{AccountIdx, BatchNum, EthBlockNum, Nonce};
use crate::l1tx::L1Tx;
use crate::l2tx::L2Tx;
use crate::{Amount, Hash32};

/// The pair of tree roots committing to the rollup state. The circuit
/// defines how the pair is folded into a single public input; the core
/// only ever hands over both halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateRoot {
    /// Root of the account tree.
    pub account_root: Hash32,
    /// Root of the vouch tree.
    pub vouch_root: Hash32,
}

/// An L1 block, as far as the rollup cares about it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Block {
    /// The L1 block height.
    pub eth_block_num: EthBlockNum,
    /// The L1 block timestamp.
    pub timestamp: u64,
}

/// The record of one forged batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// The batch number.
    pub batch_num: BatchNum,
    /// The L1 block under which the batch was forged.
    pub eth_block_num: EthBlockNum,
    /// The state root after applying the batch.
    pub state_root: StateRoot,
    /// Root of the per-batch exit tree.
    pub exit_root: Hash32,
    /// The L1 queue consumed by this batch, if it forged one.
    pub forge_l1_txs_num: Option<u64>,
    /// The highest account index allocated so far.
    pub last_idx: AccountIdx,
    /// The number of accounts created by this batch.
    pub num_accounts: u64,
}

/// A nonce/balance delta observed on an account during a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountUpdate {
    /// The L1 block under which the update was forged.
    pub eth_block_num: EthBlockNum,
    /// The batch that produced the update.
    pub batch_num: BatchNum,
    /// The updated account.
    pub idx: AccountIdx,
    /// The account's nonce after the batch.
    pub nonce: Nonce,
    /// The account's balance after the batch.
    pub balance: Amount,
}

/// One withdrawal commitment in a batch's exit tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// The batch whose exit tree holds the entry.
    pub batch_num: BatchNum,
    /// The exiting account.
    pub account_idx: AccountIdx,
    /// The withdrawable balance.
    pub balance: Amount,
    /// Sibling path proving the entry against the batch's exit root,
    /// ordered root to leaf.
    pub merkle_proof: Vec<Hash32>,
}

/// Everything one batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchData {
    /// The batch record.
    pub batch: Batch,
    /// The forged L1 user txs, effective amounts stamped.
    pub l1_user_txs: Vec<L1Tx>,
    /// The L1 coordinator txs included in the batch.
    pub l1_coordinator_txs: Vec<L1Tx>,
    /// The L2 txs included in the batch.
    pub l2_txs: Vec<L2Tx>,
    /// Accounts created by the batch, as full leaves.
    pub created_accounts: Vec<Account>,
    /// Nonce/balance deltas of every account the batch touched.
    pub updated_accounts: Vec<AccountUpdate>,
    /// The batch's exit tree entries.
    pub exit_tree: Vec<ExitInfo>,
}

/// The rollup-side contents of one L1 block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupData {
    /// L1 user txs that appeared on L1 in this block, forged or not.
    pub l1_user_txs: Vec<L1Tx>,
    /// The batches forged in this block.
    pub batches: Vec<BatchData>,
}

/// Everything the rollup produced under one L1 block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    /// The L1 block itself.
    pub block: Block,
    /// The rollup-side contents.
    pub rollup: RollupData,
}
