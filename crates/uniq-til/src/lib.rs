//! TIL, the test-instruction-language compiler.
//!
//! A [`Context`] turns a textual scenario of deposits, vouches, exits,
//! and batch and block boundaries into the fully-populated [`BlockData`]
//! stream the state-transition pipeline consumes. Compilation is
//! deterministic: the same set always produces bit-identical blocks,
//! including the user key material (see [`keys`]).
//!
//! The compiler mirrors the L1 contract's queue mechanics: every L1
//! instruction joins the open queue under the current
//! `to_forge_l1_txs_num`; `> batchL1` forges the oldest unforged queue,
//! assigning account indices to its creations; `> batch` closes an
//! L2-only batch; `> block` seals everything forged since the previous
//! block together with the L1 txs that appeared in it.
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use uniq_common::block::{Batch, BatchData, Block, BlockData, RollupData};
use uniq_common::l1tx::L1Tx;
use uniq_common::l2tx::L2Tx;
use uniq_common::tx::MAX_L1_USER_TXS_PER_QUEUE;
use uniq_common::{AccountIdx, Amount, BatchNum, EthBlockNum, Nonce, TxError, TxType};

use crate::keys::{derive_user_keys, UserKeys};
use crate::lang::Instruction;

pub mod keys;
pub mod lang;

/// Errors raised while parsing or compiling a scenario.
#[derive(Debug, Error)]
pub enum TilError {
    /// The set does not start with `Type: Blockchain`.
    #[error("line {line}: expected a 'Type: Blockchain' header")]
    MissingHeader {
        /// The offending line.
        line: usize,
    },
    /// An instruction keyword the language does not know.
    #[error("line {line}: unknown instruction {instruction:?}")]
    UnknownInstruction {
        /// The offending line.
        line: usize,
        /// The raw instruction text.
        instruction: String,
    },
    /// A known instruction with malformed operands.
    #[error("line {line}: {reason}")]
    Malformed {
        /// The offending line.
        line: usize,
        /// What was wrong.
        reason: String,
    },
    /// A second account creation for the same user.
    #[error("line {line}: account of user {name:?} already created")]
    AccountAlreadyCreated {
        /// The offending line.
        line: usize,
        /// The user name.
        name: String,
    },
    /// An operation on a user whose account was never created.
    #[error("line {line}: user {name:?} has no created account")]
    AccountNotCreated {
        /// The offending line.
        line: usize,
        /// The user name.
        name: String,
    },
    /// An L2 operation on an account that no batch has forged yet.
    #[error("line {line}: account of user {name:?} is not forged yet")]
    AccountNotForged {
        /// The offending line.
        line: usize,
        /// The user name.
        name: String,
    },
    /// A vouch creation over an edge the scenario already holds.
    #[error("line {line}: vouch {from}-{to} already exists")]
    DuplicateVouch {
        /// The offending line.
        line: usize,
        /// The vouching user.
        from: String,
        /// The vouched-for user.
        to: String,
    },
    /// A vouch deletion over an edge the scenario does not hold.
    #[error("line {line}: vouch {from}-{to} does not exist")]
    MissingVouch {
        /// The offending line.
        line: usize,
        /// The vouching user.
        from: String,
        /// The vouched-for user.
        to: String,
    },
    /// The open L1 queue is at capacity.
    #[error("l1 queue {queue} is full ({max} txs)")]
    QueueFull {
        /// The queue that overflowed.
        queue: u64,
        /// Its capacity.
        max: usize,
    },
    /// An envelope-layer failure while building txs.
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// A scenario user: deterministic keys plus the account state the
/// compiler tracks for it.
#[derive(Debug, Clone)]
pub struct User {
    /// The user's key material.
    pub keys: UserKeys,
    /// The account index, assigned when the creating tx is forged.
    pub idx: Option<AccountIdx>,
    /// The next L2 nonce.
    pub nonce: Nonce,
    /// Whether a `CreateAccountDeposit` was issued for this user.
    created: bool,
}

/// A queued L1 user tx plus the scenario user it belongs to, so forging
/// can resolve the index once it is assigned.
#[derive(Debug, Clone)]
struct QueuedTx {
    tx: L1Tx,
    user: String,
}

/// The scenario compiler. One context compiles one or more sets,
/// accumulating state (queues, users, batch and block counters) across
/// calls.
pub struct Context {
    seed: u64,
    max_l1_txs_per_queue: usize,
    users: BTreeMap<String, User>,
    user_order: Vec<String>,
    queues: Vec<Vec<QueuedTx>>,
    /// Index of the oldest unforged queue.
    next_forge_num: u64,
    current_batch: BatchNum,
    eth_block_num: EthBlockNum,
    pending_l2: Vec<L2Tx>,
    vouches: BTreeSet<(String, String)>,
    block_batches: Vec<BatchData>,
    /// `(queue, position)` of every L1 tx that appeared in this block.
    block_l1_refs: Vec<(usize, usize)>,
}

impl Context {
    /// Builds a compiler. `chain_id` seeds the key derivation;
    /// `max_l1_txs_per_queue` mirrors the contract's queue capacity
    /// (usually [`MAX_L1_USER_TXS_PER_QUEUE`]).
    pub fn new(chain_id: u16, max_l1_txs_per_queue: usize) -> Self {
        Context {
            seed: chain_id as u64,
            max_l1_txs_per_queue,
            users: BTreeMap::new(),
            user_order: Vec::new(),
            queues: vec![Vec::new()],
            next_forge_num: 0,
            current_batch: BatchNum::from(0),
            eth_block_num: EthBlockNum::from(1),
            pending_l2: Vec::new(),
            vouches: BTreeSet::new(),
            block_batches: Vec::new(),
            block_l1_refs: Vec::new(),
        }
    }

    /// The users the compiler has seen so far, with their keys, indices
    /// and nonces.
    pub fn users(&self) -> &BTreeMap<String, User> {
        &self.users
    }

    /// Compiles a set into its blocks.
    pub fn generate_blocks(&mut self, source: &str) -> Result<Vec<BlockData>, TilError> {
        let instructions = lang::parse(source)?;
        self.register_users(&instructions);

        let mut blocks = Vec::new();
        for (line, instruction) in instructions {
            match instruction {
                Instruction::CreateAccountDeposit { user, amount } => {
                    self.create_account_deposit(line, &user, amount)?;
                }
                Instruction::Deposit { user, amount } => {
                    self.deposit(line, &user, amount)?;
                }
                Instruction::CreateVouch { from, to } => {
                    self.vouch(line, &from, &to, true)?;
                }
                Instruction::DeleteVouch { from, to } => {
                    self.vouch(line, &from, &to, false)?;
                }
                Instruction::Exit { user, amount } => {
                    self.exit(line, &user, amount)?;
                }
                Instruction::Batch => self.close_batch(None),
                Instruction::BatchL1 => self.close_batch_l1()?,
                Instruction::Block => blocks.push(self.close_block()),
            }
        }
        tracing::debug!(
            blocks = blocks.len(),
            users = self.users.len(),
            "compiled scenario"
        );
        Ok(blocks)
    }

    /// Derives keys for every user named in the set, in order of first
    /// appearance, continuing the ordinal sequence across sets.
    fn register_users(&mut self, instructions: &[(usize, Instruction)]) {
        for (_, instruction) in instructions {
            let names: &[&String] = match instruction {
                Instruction::CreateAccountDeposit { user, .. }
                | Instruction::Deposit { user, .. }
                | Instruction::Exit { user, .. } => &[user],
                Instruction::CreateVouch { from, to }
                | Instruction::DeleteVouch { from, to } => &[from, to],
                _ => &[],
            };
            for name in names {
                if !self.users.contains_key(*name) {
                    let ordinal = self.user_order.len() as u64;
                    self.users.insert(
                        (*name).clone(),
                        User {
                            keys: derive_user_keys(self.seed, ordinal),
                            idx: None,
                            nonce: Nonce::default(),
                            created: false,
                        },
                    );
                    self.user_order.push((*name).clone());
                }
            }
        }
    }

    fn push_l1_tx(&mut self, tx: L1Tx, user: &str) -> Result<(), TilError> {
        let queue_num = self.queues.len() - 1;
        let queue = self.queues.last_mut().expect("a queue is always open");
        if queue.len() >= self.max_l1_txs_per_queue {
            return Err(TilError::QueueFull {
                queue: queue_num as u64,
                max: self.max_l1_txs_per_queue,
            });
        }
        let mut tx = tx;
        tx.to_forge_l1_txs_num = Some(queue_num as u64);
        tx.position = queue.len() as u16;
        tx.eth_block_num = self.eth_block_num;
        tx.set_id()?;
        self.block_l1_refs.push((queue_num, queue.len()));
        queue.push(QueuedTx {
            tx,
            user: user.to_string(),
        });
        Ok(())
    }

    fn create_account_deposit(
        &mut self,
        line: usize,
        name: &str,
        amount: u64,
    ) -> Result<(), TilError> {
        let user = self.users.get_mut(name).expect("registered above");
        if user.created {
            return Err(TilError::AccountAlreadyCreated {
                line,
                name: name.to_string(),
            });
        }
        user.created = true;
        let tx = L1Tx {
            user_origin: true,
            from_bjj: user.keys.bjj,
            from_eth_addr: user.keys.addr,
            deposit_amount: Amount::from(amount),
            tx_type: Some(TxType::CreateAccountDeposit),
            ..Default::default()
        };
        self.push_l1_tx(tx, name)
    }

    fn deposit(&mut self, line: usize, name: &str, amount: u64) -> Result<(), TilError> {
        let user = self.users.get(name).expect("registered above");
        if !user.created {
            return Err(TilError::AccountNotCreated {
                line,
                name: name.to_string(),
            });
        }
        let tx = L1Tx {
            user_origin: true,
            // The idx may still be unassigned; forging fills it in.
            from_idx: user.idx.unwrap_or(AccountIdx::NONE),
            from_bjj: user.keys.bjj,
            from_eth_addr: user.keys.addr,
            deposit_amount: Amount::from(amount),
            tx_type: Some(TxType::Deposit),
            ..Default::default()
        };
        self.push_l1_tx(tx, name)
    }

    fn forged_idx(&self, line: usize, name: &str) -> Result<AccountIdx, TilError> {
        let user = self.users.get(name).ok_or_else(|| TilError::AccountNotCreated {
            line,
            name: name.to_string(),
        })?;
        if !user.created {
            return Err(TilError::AccountNotCreated {
                line,
                name: name.to_string(),
            });
        }
        user.idx.ok_or_else(|| TilError::AccountNotForged {
            line,
            name: name.to_string(),
        })
    }

    fn next_nonce(&mut self, name: &str) -> Result<Nonce, TilError> {
        let user = self.users.get_mut(name).expect("checked by forged_idx");
        let nonce = user.nonce;
        user.nonce = user.nonce.bump()?;
        Ok(nonce)
    }

    fn vouch(&mut self, line: usize, from: &str, to: &str, create: bool) -> Result<(), TilError> {
        let from_idx = self.forged_idx(line, from)?;
        let to_idx = self.forged_idx(line, to)?;
        let edge = (from.to_string(), to.to_string());
        if create {
            if self.vouches.contains(&edge) {
                return Err(TilError::DuplicateVouch {
                    line,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            self.vouches.insert(edge);
        } else if !self.vouches.remove(&edge) {
            return Err(TilError::MissingVouch {
                line,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let nonce = self.next_nonce(from)?;
        let tx_type = if create {
            TxType::CreateVouch
        } else {
            TxType::DeleteVouch
        };
        let tx = L2Tx::new(from_idx, to_idx, Amount::zero(), nonce, tx_type)?;
        self.pending_l2.push(tx);
        Ok(())
    }

    fn exit(&mut self, line: usize, name: &str, amount: u64) -> Result<(), TilError> {
        let from_idx = self.forged_idx(line, name)?;
        let nonce = self.next_nonce(name)?;
        let tx = L2Tx::new(
            from_idx,
            AccountIdx::EXIT,
            Amount::from(amount),
            nonce,
            TxType::Exit,
        )?;
        self.pending_l2.push(tx);
        Ok(())
    }

    /// Closes the current batch. `forged` carries the L1 queue contents
    /// when the batch forges one.
    fn close_batch(&mut self, forged: Option<(u64, Vec<L1Tx>)>) {
        self.current_batch = self.current_batch.next();
        let (forge_l1_txs_num, l1_user_txs) = match forged {
            Some((num, txs)) => (Some(num), txs),
            None => (None, Vec::new()),
        };
        let mut l2_txs = std::mem::take(&mut self.pending_l2);
        for (position, tx) in l2_txs.iter_mut().enumerate() {
            tx.position = position as u16;
            tx.batch_num = Some(self.current_batch);
            tx.eth_block_num = self.eth_block_num;
        }
        let last_idx = self
            .users
            .values()
            .filter_map(|u| u.idx)
            .max()
            .unwrap_or(AccountIdx::new(AccountIdx::USER_THRESHOLD.as_u64() - 1).expect("in range"));
        self.block_batches.push(BatchData {
            batch: Batch {
                batch_num: self.current_batch,
                eth_block_num: self.eth_block_num,
                forge_l1_txs_num,
                last_idx,
                num_accounts: l1_user_txs
                    .iter()
                    .filter(|tx| tx.effective_from_idx.is_some())
                    .count() as u64,
                ..Default::default()
            },
            l1_user_txs,
            l2_txs,
            ..Default::default()
        });
    }

    fn close_batch_l1(&mut self) -> Result<(), TilError> {
        let forge_num = self.next_forge_num;
        // Freeze the forged queue; open a new one if it was the open
        // queue.
        if forge_num as usize == self.queues.len() - 1 {
            self.queues.push(Vec::new());
        }
        self.next_forge_num += 1;
        let batch_num = self.current_batch.next();

        let mut last_idx = self
            .users
            .values()
            .filter_map(|u| u.idx.map(|i| i.as_u64()))
            .max()
            .unwrap_or(AccountIdx::USER_THRESHOLD.as_u64() - 1);

        // Walk the queue in position order: creations allocate the next
        // index, deposits resolve against whatever is assigned by then.
        let queue_len = self.queues[forge_num as usize].len();
        for pos in 0..queue_len {
            let user_name = self.queues[forge_num as usize][pos].user.clone();
            let entry = &mut self.queues[forge_num as usize][pos];
            entry.tx.batch_num = Some(batch_num);
            match entry.tx.tx_type {
                Some(TxType::CreateAccountDeposit)
                | Some(TxType::CreateAccountDepositTransfer) => {
                    let user = self.users.get_mut(&user_name).expect("queued users exist");
                    if user.idx.is_none() {
                        last_idx += 1;
                        let idx = AccountIdx::new(last_idx)?;
                        user.idx = Some(idx);
                    }
                    entry.tx.effective_from_idx = self.users[&user_name].idx;
                }
                _ => {
                    if entry.tx.from_idx == AccountIdx::NONE {
                        if let Some(idx) = self.users[&user_name].idx {
                            entry.tx.from_idx = idx;
                        }
                    }
                }
            }
        }

        let forged: Vec<L1Tx> = self.queues[forge_num as usize]
            .iter()
            .map(|entry| entry.tx.clone())
            .collect();
        self.close_batch(Some((forge_num, forged)));
        Ok(())
    }

    fn close_block(&mut self) -> BlockData {
        let l1_user_txs: Vec<L1Tx> = self
            .block_l1_refs
            .drain(..)
            .map(|(queue, pos)| self.queues[queue][pos].tx.clone())
            .collect();
        let block = BlockData {
            block: Block {
                eth_block_num: self.eth_block_num,
                timestamp: 0,
            },
            rollup: RollupData {
                l1_user_txs,
                batches: std::mem::take(&mut self.block_batches),
            },
        };
        self.eth_block_num = self.eth_block_num.next();
        block
    }
}

/// Re-exported queue capacity of the L1 contract, the usual second
/// argument to [`Context::new`].
pub const ROLLUP_MAX_L1_USER_TXS: usize = MAX_L1_USER_TXS_PER_QUEUE;
