//! The batch processor: the state-transition function of the sequencer.
//!
//! [`TxProcessor::process_batch`] applies one batch (forged L1 user txs,
//! then L1 coordinator txs, then L2 txs, each in position order) to a
//! [`StateDb`], stamps effective amounts on the L1 user txs, builds the
//! per-batch exit tree, and emits the [`BatchData`] payload the history
//! store and the prover consume. On success the state db is checkpointed
//! at the new batch number; on a batch-level error it is reset to the
//! previous checkpoint, so a failed batch leaves no trace.
//!
//! Consensus rules enforced here:
//! - execution order is part of the contract and is never permuted;
//! - a well-formed but semantically invalid L1 user tx cannot censor the
//!   queue: it keeps its position and is stamped ineffective instead of
//!   failing the batch;
//! - L2 txs and coordinator txs were chosen by the coordinator, so their
//!   failures are batch-level errors;
//! - the i-th account-creating tx of a batch gets index
//!   `last_idx_before_batch + i + 1`.
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use uniq_common::auth::{AccountCreationAuth, INTERNAL_ETH_ADDR};
use uniq_common::block::{AccountUpdate, Batch, BatchData, ExitInfo};
use uniq_common::encoding::keccak256;
use uniq_common::{
    Account, AccountIdx, Amount, BatchNum, EthAddr, EthBlockNum, Hash32, LinkIdx, Nonce, TxError,
    TxType,
};
use uniq_state_db::{MemNodeStore, SparseTree, StateDb, StateDbError};

/// A coordinator-origin account creation, paired with the authorization
/// that backs it. Internal-only creations (sentinel Ethereum address)
/// need no authorization.
#[derive(Debug, Clone)]
pub struct CoordinatorTx {
    /// The tx record; `from_bjj` and `from_eth_addr` name the account to
    /// create.
    pub tx: uniq_common::l1tx::L1Tx,
    /// The user's account-creation authorization.
    pub auth: Option<AccountCreationAuth>,
}

/// The ordered contents of one batch, ready to be applied.
#[derive(Debug, Clone, Default)]
pub struct BatchInput {
    /// The queue drained by this batch, if it forges L1 txs.
    pub forge_l1_txs_num: Option<u64>,
    /// The drained L1 user txs, in position order.
    pub l1_user_txs: Vec<uniq_common::l1tx::L1Tx>,
    /// The coordinator's account creations, in position order.
    pub l1_coordinator_txs: Vec<CoordinatorTx>,
    /// The selected L2 txs, in position order.
    pub l2_txs: Vec<uniq_common::l2tx::L2Tx>,
    /// The L1 block the batch is forged under.
    pub eth_block_num: EthBlockNum,
}

/// Batch-level failures. Any of these aborts the batch and resets the
/// state db to the previous checkpoint.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// An L2 tx names an absent sender.
    #[error("l2 tx {position}: sender {idx} not found")]
    SenderNotFound {
        /// Position of the offending tx.
        position: u16,
        /// The missing leaf.
        idx: AccountIdx,
    },
    /// An L2 tx names an absent or non-user destination.
    #[error("l2 tx {position}: destination {idx} not found")]
    DestinationNotFound {
        /// Position of the offending tx.
        position: u16,
        /// The missing leaf.
        idx: AccountIdx,
    },
    /// An L2 tx's nonce disagrees with the sender's account.
    #[error("l2 tx {position}: account nonce is {expected}, tx carries {got}")]
    NonceMismatch {
        /// Position of the offending tx.
        position: u16,
        /// The sender's current nonce.
        expected: Nonce,
        /// The nonce the tx carried.
        got: Nonce,
    },
    /// An L2 transfer exceeding the sender's balance.
    #[error("l2 tx {position}: insufficient balance")]
    InsufficientBalance {
        /// Position of the offending tx.
        position: u16,
    },
    /// A credit that would push a balance over the 192-bit cap.
    #[error("l2 tx {position}: balance overflow")]
    BalanceOverflow {
        /// Position of the offending tx.
        position: u16,
    },
    /// An exit from an account with nothing to withdraw.
    #[error("l2 tx {position}: exit of an empty account")]
    EmptyExit {
        /// Position of the offending tx.
        position: u16,
    },
    /// A vouch creation over an existing edge.
    #[error("l2 tx {position}: vouch already exists")]
    VouchAlreadyExists {
        /// Position of the offending tx.
        position: u16,
    },
    /// A vouch deletion over a missing edge.
    #[error("l2 tx {position}: vouch not found")]
    VouchNotFound {
        /// Position of the offending tx.
        position: u16,
    },
    /// An L2 tx carrying an L1 type.
    #[error("l2 tx {position}: {tx_type} is not an l2 type")]
    NotAnL2Type {
        /// Position of the offending tx.
        position: u16,
        /// The offending type.
        tx_type: TxType,
    },
    /// A coordinator tx without a valid account-creation authorization.
    #[error("coordinator tx {position}: missing or invalid account-creation authorization")]
    InvalidAuthorization {
        /// Position of the offending tx.
        position: u16,
    },
    /// An envelope-layer failure.
    #[error(transparent)]
    Tx(#[from] TxError),
    /// A state-db failure.
    #[error(transparent)]
    StateDb(#[from] StateDbError),
}

/// Processor configuration: the L1 identity the rollup contract runs
/// under, bound into account-creation authorizations.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// The L1 chain id.
    pub chain_id: u16,
    /// The rollup contract address.
    pub contract_addr: EthAddr,
}

/// The batch processor. Stateless apart from its config; all state lives
/// in the [`StateDb`] it is handed.
#[derive(Debug, Clone)]
pub struct TxProcessor {
    config: ProcessorConfig,
}

struct BatchCtx {
    batch_num: BatchNum,
    eth_block_num: EthBlockNum,
    created: Vec<Account>,
    touched: BTreeSet<AccountIdx>,
    /// Drained balances by exiting account, accumulated across the batch.
    exits: BTreeMap<AccountIdx, Amount>,
}

impl TxProcessor {
    /// Builds a processor for the given L1 identity.
    pub fn new(config: ProcessorConfig) -> Self {
        TxProcessor { config }
    }

    /// Applies one batch to `sdb` and checkpoints it. On error the db is
    /// reset to the previous checkpoint before the error is returned.
    pub fn process_batch(
        &self,
        sdb: &mut StateDb,
        input: BatchInput,
    ) -> Result<BatchData, ProcessorError> {
        let prev_batch = sdb.current_batch()?;
        let batch_num = prev_batch.next();
        match self.process_batch_inner(sdb, input, batch_num) {
            Ok(data) => {
                sdb.make_checkpoint(batch_num)?;
                tracing::info!(
                    %batch_num,
                    l1_user = data.l1_user_txs.len(),
                    l1_coord = data.l1_coordinator_txs.len(),
                    l2 = data.l2_txs.len(),
                    exits = data.exit_tree.len(),
                    "processed batch"
                );
                Ok(data)
            }
            Err(e) => {
                tracing::warn!(%batch_num, error = %e, "batch failed, rolling back");
                sdb.reset(prev_batch)?;
                Err(e)
            }
        }
    }

    fn process_batch_inner(
        &self,
        sdb: &mut StateDb,
        input: BatchInput,
        batch_num: BatchNum,
    ) -> Result<BatchData, ProcessorError> {
        let BatchInput {
            forge_l1_txs_num,
            mut l1_user_txs,
            l1_coordinator_txs,
            mut l2_txs,
            eth_block_num,
        } = input;

        let mut ctx = BatchCtx {
            batch_num,
            eth_block_num,
            created: Vec::new(),
            touched: BTreeSet::new(),
            exits: BTreeMap::new(),
        };

        for tx in l1_user_txs.iter_mut() {
            self.apply_l1_user_tx(sdb, tx, &mut ctx)?;
        }

        let mut coordinator_out = Vec::with_capacity(l1_coordinator_txs.len());
        for (position, coord) in l1_coordinator_txs.into_iter().enumerate() {
            coordinator_out.push(self.apply_coordinator_tx(sdb, coord, position as u16, &mut ctx)?);
        }

        for (position, tx) in l2_txs.iter_mut().enumerate() {
            tx.position = position as u16;
            self.apply_l2_tx(sdb, tx, &mut ctx)?;
        }

        // The exit tree is rebuilt fresh each batch; entries prove
        // against its final root.
        let (exit_root, exit_tree) = build_exit_tree(sdb.n_levels(), batch_num, &ctx.exits)?;

        let mut updated_accounts = Vec::with_capacity(ctx.touched.len());
        for idx in &ctx.touched {
            let account = sdb.get_account(*idx)?;
            updated_accounts.push(AccountUpdate {
                eth_block_num,
                batch_num,
                idx: *idx,
                nonce: account.nonce,
                balance: account.balance,
            });
        }

        let batch = Batch {
            batch_num,
            eth_block_num,
            state_root: sdb.state_root()?,
            exit_root,
            forge_l1_txs_num,
            last_idx: sdb.last_idx()?,
            num_accounts: ctx.created.len() as u64,
        };

        Ok(BatchData {
            batch,
            l1_user_txs,
            l1_coordinator_txs: coordinator_out,
            l2_txs,
            created_accounts: ctx.created,
            updated_accounts,
            exit_tree,
        })
    }

    fn apply_l1_user_tx(
        &self,
        sdb: &mut StateDb,
        tx: &mut uniq_common::l1tx::L1Tx,
        ctx: &mut BatchCtx,
    ) -> Result<(), ProcessorError> {
        tx.batch_num = Some(ctx.batch_num);
        if !tx.tx_id.is_set() && tx.to_forge_l1_txs_num.is_some() {
            tx.set_id()?;
        }
        if tx.set_type().is_err() {
            // A malformed envelope cannot reach the chain through the
            // contract; if one shows up anyway it keeps its position and
            // does nothing.
            tracing::warn!(position = tx.position, "skipping l1 user tx with invalid envelope");
            tx.effective_amount = Some(Amount::zero());
            tx.effective_deposit_amount = Some(Amount::zero());
            return Ok(());
        }
        let tx_type = tx.tx_type.expect("set_type succeeded");

        match tx_type {
            TxType::CreateAccountDeposit | TxType::CreateAccountDepositTransfer => {
                let idx = sdb.allocate_idx()?;
                let account = Account {
                    idx,
                    batch_num: ctx.batch_num,
                    bjj: tx.from_bjj,
                    eth_addr: tx.from_eth_addr,
                    nonce: Nonce::default(),
                    balance: tx.deposit_amount,
                };
                sdb.create_account(idx, &account)?;
                tx.effective_from_idx = Some(idx);
                tx.effective_deposit_amount = Some(tx.deposit_amount);
                ctx.created.push(account);
                ctx.touched.insert(idx);
                tx.effective_amount = Some(if tx_type == TxType::CreateAccountDepositTransfer {
                    self.l1_transfer(sdb, idx, tx.to_idx, tx.amount, ctx)?
                } else {
                    Amount::zero()
                });
            }
            TxType::Deposit | TxType::DepositTransfer | TxType::ForceTransfer
            | TxType::ForceExit => {
                let mut sender = match sdb.get_account(tx.from_idx) {
                    Ok(account) => account,
                    Err(StateDbError::NotFound) => {
                        mark_ineffective(tx);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                // An L1 tx acts on the account only if the claimed keys
                // match the leaf.
                if sender.bjj != tx.from_bjj || sender.eth_addr != tx.from_eth_addr {
                    mark_ineffective(tx);
                    return Ok(());
                }
                let credited = match checked_credit(sender.balance, tx.deposit_amount) {
                    Some(balance) => balance,
                    None => {
                        mark_ineffective(tx);
                        return Ok(());
                    }
                };
                sender.balance = credited;
                sender.batch_num = ctx.batch_num;
                sdb.update_account(tx.from_idx, &sender)?;
                ctx.touched.insert(tx.from_idx);
                tx.effective_deposit_amount = Some(tx.deposit_amount);

                tx.effective_amount = Some(match tx_type {
                    TxType::Deposit => Amount::zero(),
                    TxType::DepositTransfer | TxType::ForceTransfer => {
                        self.l1_transfer(sdb, tx.from_idx, tx.to_idx, tx.amount, ctx)?
                    }
                    TxType::ForceExit => self.drain_to_exit(sdb, tx.from_idx, ctx)?,
                    _ => unreachable!("matched the l1 spend family"),
                });
            }
            _ => unreachable!("set_type only infers l1 types"),
        }
        Ok(())
    }

    /// Moves `amount` between two existing accounts; returns the amount
    /// that actually moved (zero when the transfer leg is ineffective).
    fn l1_transfer(
        &self,
        sdb: &mut StateDb,
        from: AccountIdx,
        to: AccountIdx,
        amount: Amount,
        ctx: &mut BatchCtx,
    ) -> Result<Amount, ProcessorError> {
        if amount.is_zero() {
            return Ok(Amount::zero());
        }
        let mut sender = sdb.get_account(from)?;
        if sender.balance < amount {
            return Ok(Amount::zero());
        }
        let mut dest = match sdb.get_account(to) {
            Ok(account) => account,
            Err(StateDbError::NotFound) => return Ok(Amount::zero()),
            Err(e) => return Err(e.into()),
        };
        let credited = match checked_credit(dest.balance, amount) {
            Some(balance) => balance,
            None => return Ok(Amount::zero()),
        };
        sender.balance = sender.balance - amount;
        sender.batch_num = ctx.batch_num;
        dest.balance = credited;
        dest.batch_num = ctx.batch_num;
        sdb.update_account(from, &sender)?;
        sdb.update_account(to, &dest)?;
        ctx.touched.insert(from);
        ctx.touched.insert(to);
        Ok(amount)
    }

    /// Zeroes an account's balance into the batch's exit set; returns
    /// the drained amount.
    fn drain_to_exit(
        &self,
        sdb: &mut StateDb,
        idx: AccountIdx,
        ctx: &mut BatchCtx,
    ) -> Result<Amount, ProcessorError> {
        let mut account = sdb.get_account(idx)?;
        let drained = account.balance;
        if drained.is_zero() {
            return Ok(Amount::zero());
        }
        account.balance = Amount::zero();
        account.batch_num = ctx.batch_num;
        sdb.update_account(idx, &account)?;
        ctx.touched.insert(idx);
        let entry = ctx.exits.entry(idx).or_insert_with(Amount::zero);
        *entry = *entry + drained;
        Ok(drained)
    }

    fn apply_coordinator_tx(
        &self,
        sdb: &mut StateDb,
        coord: CoordinatorTx,
        position: u16,
        ctx: &mut BatchCtx,
    ) -> Result<uniq_common::l1tx::L1Tx, ProcessorError> {
        let CoordinatorTx { mut tx, auth } = coord;
        if tx.from_eth_addr != INTERNAL_ETH_ADDR {
            let valid = auth.as_ref().is_some_and(|auth| {
                auth.eth_addr == tx.from_eth_addr
                    && auth.bjj == tx.from_bjj
                    && auth.verify(self.config.chain_id, self.config.contract_addr)
            });
            if !valid {
                return Err(ProcessorError::InvalidAuthorization { position });
            }
        }
        tx.user_origin = false;
        tx.position = position;
        tx.batch_num = Some(ctx.batch_num);
        tx.set_type()?;
        tx.set_id()?;

        let idx = sdb.allocate_idx()?;
        let account = Account {
            idx,
            batch_num: ctx.batch_num,
            bjj: tx.from_bjj,
            eth_addr: tx.from_eth_addr,
            nonce: Nonce::default(),
            balance: Amount::zero(),
        };
        sdb.create_account(idx, &account)?;
        tx.effective_from_idx = Some(idx);
        tx.effective_amount = Some(Amount::zero());
        tx.effective_deposit_amount = Some(Amount::zero());
        ctx.created.push(account);
        ctx.touched.insert(idx);
        Ok(tx)
    }

    fn apply_l2_tx(
        &self,
        sdb: &mut StateDb,
        tx: &mut uniq_common::l2tx::L2Tx,
        ctx: &mut BatchCtx,
    ) -> Result<(), ProcessorError> {
        let position = tx.position;
        tx.batch_num = Some(ctx.batch_num);
        tx.eth_block_num = ctx.eth_block_num;

        let mut sender = match sdb.get_account(tx.from_idx) {
            Ok(account) => account,
            Err(StateDbError::NotFound) => {
                return Err(ProcessorError::SenderNotFound {
                    position,
                    idx: tx.from_idx,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if tx.nonce != sender.nonce {
            return Err(ProcessorError::NonceMismatch {
                position,
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        match tx.tx_type {
            TxType::Transfer => {
                if sender.balance < tx.amount {
                    return Err(ProcessorError::InsufficientBalance { position });
                }
                if tx.from_idx == tx.to_idx {
                    // A self-transfer only spends a nonce.
                } else {
                    let mut dest = match sdb.get_account(tx.to_idx) {
                        Ok(account) => account,
                        Err(StateDbError::NotFound) => {
                            return Err(ProcessorError::DestinationNotFound {
                                position,
                                idx: tx.to_idx,
                            })
                        }
                        Err(e) => return Err(e.into()),
                    };
                    let credited = checked_credit(dest.balance, tx.amount)
                        .ok_or(ProcessorError::BalanceOverflow { position })?;
                    sender.balance = sender.balance - tx.amount;
                    dest.balance = credited;
                    dest.batch_num = ctx.batch_num;
                    sdb.update_account(tx.to_idx, &dest)?;
                    ctx.touched.insert(tx.to_idx);
                }
            }
            TxType::Exit => {
                if sender.balance.is_zero() {
                    return Err(ProcessorError::EmptyExit { position });
                }
                let drained = sender.balance;
                sender.balance = Amount::zero();
                let entry = ctx.exits.entry(tx.from_idx).or_insert_with(Amount::zero);
                *entry = *entry + drained;
            }
            TxType::CreateVouch => {
                // Both endpoints must be live leaves.
                match sdb.get_account(tx.to_idx) {
                    Ok(_) => {}
                    Err(StateDbError::NotFound) => {
                        return Err(ProcessorError::DestinationNotFound {
                            position,
                            idx: tx.to_idx,
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
                match sdb.create_link(LinkIdx::new(tx.from_idx, tx.to_idx), true) {
                    Ok(_) => {}
                    Err(StateDbError::LinkAlreadyExists(_)) => {
                        return Err(ProcessorError::VouchAlreadyExists { position })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TxType::DeleteVouch => {
                match sdb.delete_link(LinkIdx::new(tx.from_idx, tx.to_idx)) {
                    Ok(_) => {}
                    Err(StateDbError::NotFound) => {
                        return Err(ProcessorError::VouchNotFound { position })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                return Err(ProcessorError::NotAnL2Type {
                    position,
                    tx_type: other,
                })
            }
        }

        sender.nonce = sender.nonce.bump()?;
        sender.batch_num = ctx.batch_num;
        sdb.update_account(tx.from_idx, &sender)?;
        ctx.touched.insert(tx.from_idx);
        Ok(())
    }
}

fn mark_ineffective(tx: &mut uniq_common::l1tx::L1Tx) {
    tx.effective_amount = Some(Amount::zero());
    tx.effective_deposit_amount = Some(Amount::zero());
    tracing::debug!(
        position = tx.position,
        tx_type = ?tx.tx_type,
        "l1 user tx is ineffective"
    );
}

fn checked_credit(balance: Amount, amount: Amount) -> Option<Amount> {
    let credited = balance.checked_add(amount)?;
    (credited <= Account::max_balance()).then_some(credited)
}

fn exit_leaf_hash(idx: AccountIdx, balance: Amount) -> Result<Hash32, TxError> {
    let mut preimage = [0u8; AccountIdx::BYTES_LEN + 32];
    preimage[..AccountIdx::BYTES_LEN].copy_from_slice(&idx.to_bytes()?);
    balance.to_big_endian(&mut preimage[AccountIdx::BYTES_LEN..]);
    Ok(keccak256(&preimage))
}

/// Builds the per-batch exit tree and its entries; the proofs are taken
/// against the final root, after all exits landed.
fn build_exit_tree(
    n_levels: u8,
    batch_num: BatchNum,
    exits: &BTreeMap<AccountIdx, Amount>,
) -> Result<(Hash32, Vec<ExitInfo>), ProcessorError> {
    if n_levels == 0 {
        // A tree-less state db (tx selection) never produces exits for
        // the prover; keep the root inert.
        return Ok(([0u8; 32], Vec::new()));
    }
    let tree = SparseTree::new(n_levels);
    let mut store = MemNodeStore::new();
    for (idx, balance) in exits {
        let leaf = exit_leaf_hash(*idx, *balance)?;
        tree.update(&mut store, idx.as_u64() as u128, Some(leaf))
            .map_err(StateDbError::Storage)?;
    }
    let root = tree.root(&store).map_err(StateDbError::Storage)?;
    let mut infos = Vec::with_capacity(exits.len());
    for (idx, balance) in exits {
        let proof = tree
            .get_proof(&store, idx.as_u64() as u128)
            .map_err(StateDbError::Storage)?;
        infos.push(ExitInfo {
            batch_num,
            account_idx: *idx,
            balance: *balance,
            merkle_proof: proof.siblings,
        });
    }
    Ok((root, infos))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use uniq_common::l1tx::L1Tx;
    use uniq_common::l2tx::L2Tx;
    use uniq_common::BjjPubKey;
    use uniq_state_db::{Config, StateDbKind, Tree};

    use super::*;

    fn processor() -> TxProcessor {
        TxProcessor::new(ProcessorConfig {
            chain_id: 5,
            contract_addr: EthAddr::from_low_u64_be(0xc0ffee),
        })
    }

    fn state_db(dir: &TempDir) -> StateDb {
        StateDb::new(Config {
            path: dir.path().to_path_buf(),
            keep: 32,
            kind: StateDbKind::BatchBuilder,
            n_levels: 16,
        })
        .unwrap()
    }

    fn create_tx(user: u64, deposit: u64) -> L1Tx {
        L1Tx {
            user_origin: true,
            to_forge_l1_txs_num: Some(0),
            from_bjj: BjjPubKey([user as u8; 32]),
            from_eth_addr: EthAddr::from_low_u64_be(user),
            deposit_amount: Amount::from(deposit),
            ..Default::default()
        }
        .normalize()
        .unwrap()
    }

    fn deposit_tx(from: AccountIdx, user: u64, deposit: u64) -> L1Tx {
        L1Tx {
            user_origin: true,
            to_forge_l1_txs_num: Some(0),
            from_idx: from,
            from_bjj: BjjPubKey([user as u8; 32]),
            from_eth_addr: EthAddr::from_low_u64_be(user),
            deposit_amount: Amount::from(deposit),
            ..Default::default()
        }
        .normalize()
        .unwrap()
    }

    fn l2(from: u64, to: u64, amount: u64, nonce: u64, tx_type: TxType) -> L2Tx {
        L2Tx::new(
            AccountIdx::new(from).unwrap(),
            AccountIdx::new(to).unwrap(),
            Amount::from(amount),
            Nonce::new(nonce).unwrap(),
            tx_type,
        )
        .unwrap()
    }

    #[test]
    fn creations_allocate_contiguous_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let data = processor()
            .process_batch(
                &mut sdb,
                BatchInput {
                    forge_l1_txs_num: Some(0),
                    l1_user_txs: vec![create_tx(1, 10), create_tx(2, 5), create_tx(3, 7)],
                    ..Default::default()
                },
            )
            .unwrap();

        let idxs: Vec<u64> = data
            .created_accounts
            .iter()
            .map(|a| a.idx.as_u64())
            .collect();
        assert_eq!(idxs, vec![256, 257, 258]);
        assert_eq!(data.batch.last_idx.as_u64(), 258);
        assert_eq!(data.batch.num_accounts, 3);
        assert_eq!(
            data.l1_user_txs[0].effective_from_idx,
            Some(AccountIdx::new(256).unwrap())
        );
        assert_eq!(
            data.l1_user_txs[0].effective_deposit_amount,
            Some(Amount::from(10u64))
        );
        assert_eq!(sdb.current_batch().unwrap(), BatchNum::from(1));
        assert_ne!(
            data.batch.state_root.account_root,
            sdb.account_tree().unwrap().empty_root()
        );
    }

    #[test]
    fn mismatched_keys_make_a_deposit_ineffective() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();
        p.process_batch(
            &mut sdb,
            BatchInput {
                forge_l1_txs_num: Some(0),
                l1_user_txs: vec![create_tx(1, 10)],
                ..Default::default()
            },
        )
        .unwrap();

        let idx = AccountIdx::new(256).unwrap();
        // Right idx, wrong owner keys.
        let data = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    forge_l1_txs_num: Some(1),
                    l1_user_txs: vec![deposit_tx(idx, 9, 100)],
                    ..Default::default()
                },
            )
            .unwrap();
        let tx = &data.l1_user_txs[0];
        assert_eq!(tx.effective_deposit_amount, Some(Amount::zero()));
        assert_eq!(tx.effective_amount, Some(Amount::zero()));
        assert_eq!(
            sdb.get_account(idx).unwrap().balance,
            Amount::from(10u64),
            "an ineffective tx leaves no trace"
        );
        // The tx still occupied its position in the batch.
        assert_eq!(data.l1_user_txs.len(), 1);
    }

    #[test]
    fn deposit_to_a_missing_account_is_ineffective() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let data = processor()
            .process_batch(
                &mut sdb,
                BatchInput {
                    forge_l1_txs_num: Some(0),
                    l1_user_txs: vec![deposit_tx(AccountIdx::new(300).unwrap(), 1, 50)],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            data.l1_user_txs[0].effective_deposit_amount,
            Some(Amount::zero())
        );
    }

    #[test]
    fn force_exit_drains_the_full_balance() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();
        p.process_batch(
            &mut sdb,
            BatchInput {
                forge_l1_txs_num: Some(0),
                l1_user_txs: vec![create_tx(1, 42)],
                ..Default::default()
            },
        )
        .unwrap();

        let idx = AccountIdx::new(256).unwrap();
        let mut force_exit = L1Tx {
            user_origin: true,
            to_forge_l1_txs_num: Some(1),
            from_idx: idx,
            to_idx: AccountIdx::EXIT,
            from_bjj: BjjPubKey([1; 32]),
            from_eth_addr: EthAddr::from_low_u64_be(1),
            ..Default::default()
        };
        force_exit = force_exit.normalize().unwrap();
        assert_eq!(force_exit.tx_type, Some(TxType::ForceExit));

        let data = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    forge_l1_txs_num: Some(1),
                    l1_user_txs: vec![force_exit],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(sdb.get_account(idx).unwrap().balance, Amount::zero());
        assert_eq!(data.exit_tree.len(), 1);
        assert_eq!(data.exit_tree[0].account_idx, idx);
        assert_eq!(data.exit_tree[0].balance, Amount::from(42u64));
        assert_eq!(
            data.l1_user_txs[0].effective_amount,
            Some(Amount::from(42u64))
        );
        assert_ne!(data.batch.exit_root, [0u8; 32]);
        // The exit entry proves against the batch's exit root.
        let exit_tree = SparseTree::new(sdb.n_levels());
        let leaf = super::exit_leaf_hash(idx, Amount::from(42u64)).unwrap();
        let proof = uniq_state_db::MerkleProof {
            root: data.batch.exit_root,
            key: idx.as_u64() as u128,
            siblings: data.exit_tree[0].merkle_proof.clone(),
            leaf: Some(leaf),
        };
        assert!(exit_tree.verify_proof(&proof));
    }

    #[test]
    fn l2_transfers_bump_nonces_and_move_balance() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();
        p.process_batch(
            &mut sdb,
            BatchInput {
                forge_l1_txs_num: Some(0),
                l1_user_txs: vec![create_tx(1, 100), create_tx(2, 0)],
                ..Default::default()
            },
        )
        .unwrap();

        let a = AccountIdx::new(256).unwrap();
        let b = AccountIdx::new(257).unwrap();
        let nonce_before = sdb.get_account(a).unwrap().nonce;

        p.process_batch(
            &mut sdb,
            BatchInput {
                l2_txs: vec![
                    l2(256, 257, 30, 0, TxType::Transfer),
                    l2(256, 257, 20, 1, TxType::Transfer),
                ],
                ..Default::default()
            },
        )
        .unwrap();

        let sender = sdb.get_account(a).unwrap();
        let dest = sdb.get_account(b).unwrap();
        // Two successful L2 txs, nonce moved by exactly two.
        assert_eq!(sender.nonce.as_u64(), nonce_before.as_u64() + 2);
        assert_eq!(sender.balance, Amount::from(50u64));
        assert_eq!(dest.balance, Amount::from(50u64));
    }

    #[test]
    fn l2_failures_roll_the_batch_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();
        p.process_batch(
            &mut sdb,
            BatchInput {
                forge_l1_txs_num: Some(0),
                l1_user_txs: vec![create_tx(1, 100), create_tx(2, 0)],
                ..Default::default()
            },
        )
        .unwrap();
        let root_before = sdb.state_root().unwrap();

        // First transfer is fine, second has a bad nonce; nothing of the
        // batch may survive.
        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l2_txs: vec![
                        l2(256, 257, 30, 0, TxType::Transfer),
                        l2(256, 257, 20, 5, TxType::Transfer),
                    ],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::NonceMismatch { .. }));
        assert_eq!(sdb.state_root().unwrap(), root_before);
        assert_eq!(sdb.current_batch().unwrap(), BatchNum::from(1));
        assert_eq!(
            sdb.get_account(AccountIdx::new(256).unwrap()).unwrap().balance,
            Amount::from(100u64)
        );

        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l2_txs: vec![l2(256, 257, 1000, 0, TxType::Transfer)],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InsufficientBalance { .. }));

        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l2_txs: vec![l2(300, 257, 1, 0, TxType::Transfer)],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::SenderNotFound { .. }));
    }

    #[test]
    fn vouch_operations_touch_the_vouch_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();
        p.process_batch(
            &mut sdb,
            BatchInput {
                forge_l1_txs_num: Some(0),
                l1_user_txs: vec![create_tx(1, 10), create_tx(2, 10)],
                ..Default::default()
            },
        )
        .unwrap();
        let vouch_root_before = sdb.get_mt_root(Tree::Vouch).unwrap();

        p.process_batch(
            &mut sdb,
            BatchInput {
                l2_txs: vec![
                    l2(256, 257, 0, 0, TxType::CreateVouch),
                    l2(257, 256, 0, 0, TxType::CreateVouch),
                    l2(256, 257, 0, 1, TxType::DeleteVouch),
                ],
                ..Default::default()
            },
        )
        .unwrap();

        let a = AccountIdx::new(256).unwrap();
        let b = AccountIdx::new(257).unwrap();
        assert!(matches!(
            sdb.get_link(LinkIdx::new(a, b)),
            Err(StateDbError::NotFound)
        ));
        assert!(sdb.get_link(LinkIdx::new(b, a)).unwrap());
        // B -> A survived, so the root moved.
        assert_ne!(sdb.get_mt_root(Tree::Vouch).unwrap(), vouch_root_before);

        // Duplicated vouch is a batch error.
        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l2_txs: vec![l2(257, 256, 0, 1, TxType::CreateVouch)],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::VouchAlreadyExists { .. }));
        // Deleting the already-deleted edge is one too.
        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l2_txs: vec![l2(256, 257, 0, 2, TxType::DeleteVouch)],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::VouchNotFound { .. }));
    }

    #[test]
    fn coordinator_creations_require_a_valid_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = state_db(&dir);
        let p = processor();

        let sk = secp256k1::SecretKey::from_slice(&[0x77; 32]).unwrap();
        let bjj = BjjPubKey([0x12; 32]);
        let auth = AccountCreationAuth::sign(&sk, bjj, 5, EthAddr::from_low_u64_be(0xc0ffee));

        let tx = L1Tx {
            user_origin: false,
            from_bjj: bjj,
            from_eth_addr: auth.eth_addr,
            ..Default::default()
        };
        let data = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l1_coordinator_txs: vec![CoordinatorTx {
                        tx: tx.clone(),
                        auth: Some(auth.clone()),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(data.created_accounts.len(), 1);
        assert_eq!(data.created_accounts[0].balance, Amount::zero());
        assert_eq!(data.l1_coordinator_txs[0].batch_num, Some(BatchNum::from(1)));
        assert!(data.l1_coordinator_txs[0].tx_id.is_set());

        // Wrong chain id in the auth: signed for chain 5, claimed here
        // without a matching signature.
        let mut bad_auth = auth.clone();
        bad_auth.signature = Some([0u8; 65]);
        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l1_coordinator_txs: vec![CoordinatorTx {
                        tx: tx.clone(),
                        auth: Some(bad_auth),
                    }],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidAuthorization { .. }));

        // Missing auth for a non-internal address.
        let err = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l1_coordinator_txs: vec![CoordinatorTx { tx, auth: None }],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidAuthorization { .. }));

        // Internal-only creations need none.
        let internal = L1Tx {
            user_origin: false,
            from_bjj: BjjPubKey([0x34; 32]),
            from_eth_addr: INTERNAL_ETH_ADDR,
            ..Default::default()
        };
        let data = p
            .process_batch(
                &mut sdb,
                BatchInput {
                    l1_coordinator_txs: vec![CoordinatorTx {
                        tx: internal,
                        auth: None,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(data.created_accounts.len(), 1);
    }
}
