//! The checkpointed, Merkelized state database of the sequencer.
//!
//! A [`StateDb`] owns one RocksDB holding committed state plus a chain of
//! in-memory copy-on-write deltas: one frozen delta per retained
//! checkpoint (keyed by batch number) and one mutable head for the batch
//! in progress. Reads walk head → deltas (newest first) → base. Aged-out
//! deltas are flushed into the base atomically, which is the durability
//! boundary; [`StateDb::reset`] discards everything above a retained
//! checkpoint, which is how L1 reorgs and abandoned batches roll back.
//!
//! Depending on [`Config::kind`] the db also maintains the two sparse
//! Merkle trees (accounts and vouches) whose roots commit the rollup
//! state. A `TxSelector` db keeps no trees and answers proof requests
//! with inert sentinels.
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use rockbound::gen_rocksdb_options;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uniq_common::block::StateRoot;
use uniq_common::encoding::keccak256;
use uniq_common::{Account, AccountIdx, BatchNum, Hash32, LinkIdx, TxError};

use crate::delta::Delta;
use crate::schema::{Accounts, Links, Meta, NodeKey, StateVars, TreeNodes, STATE_TABLES};

mod delta;
pub mod merkle;
mod schema;

pub use merkle::{
    MemNodeStore, MerkleProof, NodeReader, NodeStore, ProcessorProof, SparseTree, TreeOp,
};

const DB_NAME: &str = "state-db";
const DB_PATH_SUFFIX: &str = "state";

const TREE_ACCOUNT: u8 = 0;
const TREE_VOUCH: u8 = 1;

/// The role a state db instance plays in the node. Only `TxSelector`
/// runs without Merkle trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDbKind {
    /// Selects txs from the pool; needs balances and nonces but no roots.
    TxSelector,
    /// Computes the state transition and its witnesses.
    TxProcessor,
    /// Builds batches locally before they are forged.
    BatchBuilder,
    /// Follows the chain from L1.
    Synchronizer,
}

/// State db configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory the RocksDB lives under.
    pub path: PathBuf,
    /// How many checkpoints stay rollback-able before they are flushed
    /// into the base db.
    pub keep: usize,
    /// The role of this instance.
    pub kind: StateDbKind,
    /// Depth of the account tree; the vouch tree is twice as deep. Must
    /// be `0` for `TxSelector` and a positive multiple of 8 up to 48
    /// otherwise.
    pub n_levels: u8,
}

/// One of the two state trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tree {
    /// The account tree.
    Account,
    /// The vouch tree.
    Vouch,
}

/// Errors of the state database. Domain conditions get their own
/// variants; infrastructure failures propagate unchanged inside
/// [`StateDbError::Storage`].
#[derive(Debug, Error)]
pub enum StateDbError {
    /// Creating an account whose index is already occupied.
    #[error("account {0} already exists")]
    AccountAlreadyExists(AccountIdx),
    /// Creating a vouch edge that is already present.
    #[error("link {0} already exists")]
    LinkAlreadyExists(LinkIdx),
    /// Reading or updating an entry that is not there.
    #[error("not found in the state db")]
    NotFound,
    /// The 48-bit account index space is exhausted.
    #[error("account index space exhausted")]
    IdxOverflow,
    /// Checkpointing a batch number other than `current + 1`.
    #[error("checkpoint for batch {got} out of order, expected {expected}")]
    CheckpointOutOfOrder {
        /// The batch number the caller asked to checkpoint.
        got: BatchNum,
        /// The only batch number that would be accepted.
        expected: BatchNum,
    },
    /// Resetting to (or reading at) a batch outside the retained window.
    #[error("no retained checkpoint for batch {0}")]
    CheckpointNotFound(BatchNum),
    /// A config whose kind and `n_levels` disagree.
    #[error("invalid state db config: {0}")]
    InvalidConfig(String),
    /// An envelope-layer failure while packing leaves.
    #[error(transparent)]
    Tx(#[from] TxError),
    /// A storage-layer failure, propagated unchanged.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The checkpointed state database. See the crate docs for the storage
/// model.
pub struct StateDb {
    config: Config,
    db: rockbound::DB,
    head: Delta,
    checkpoints: VecDeque<(BatchNum, Delta)>,
    account_tree: Option<SparseTree>,
    vouch_tree: Option<SparseTree>,
}

impl StateDb {
    /// Opens (or creates) a state db under `config.path`.
    pub fn new(config: Config) -> Result<Self, StateDbError> {
        match config.kind {
            StateDbKind::TxSelector => {
                if config.n_levels != 0 {
                    return Err(StateDbError::InvalidConfig(format!(
                        "TxSelector keeps no trees, n_levels must be 0, got {}",
                        config.n_levels
                    )));
                }
            }
            _ => {
                if config.n_levels == 0 || config.n_levels % 8 != 0 || config.n_levels > 48 {
                    return Err(StateDbError::InvalidConfig(format!(
                        "n_levels must be a positive multiple of 8 up to 48, got {}",
                        config.n_levels
                    )));
                }
            }
        }
        let db = rockbound::DB::open(
            config.path.join(DB_PATH_SUFFIX),
            DB_NAME,
            STATE_TABLES.iter().copied(),
            &gen_rocksdb_options(&Default::default(), false),
            1_000_000,
        )?;
        let (account_tree, vouch_tree) = if config.n_levels > 0 {
            (
                Some(SparseTree::new(config.n_levels)),
                Some(SparseTree::new(config.n_levels * 2)),
            )
        } else {
            (None, None)
        };
        tracing::info!(
            path = %config.path.display(),
            kind = ?config.kind,
            n_levels = config.n_levels,
            "opened state db"
        );
        Ok(StateDb {
            config,
            db,
            head: Delta::default(),
            checkpoints: VecDeque::new(),
            account_tree,
            vouch_tree,
        })
    }

    /// The configured account-tree depth.
    pub fn n_levels(&self) -> u8 {
        self.config.n_levels
    }

    /// The account tree's hashing schedule, absent in `TxSelector` mode.
    pub fn account_tree(&self) -> Option<&SparseTree> {
        self.account_tree.as_ref()
    }

    /// The vouch tree's hashing schedule, absent in `TxSelector` mode.
    pub fn vouch_tree(&self) -> Option<&SparseTree> {
        self.vouch_tree.as_ref()
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    fn vars(&self) -> Result<StateVars, StateDbError> {
        if let Some(vars) = self.head.vars {
            return Ok(vars);
        }
        for (_, delta) in self.checkpoints.iter().rev() {
            if let Some(vars) = delta.vars {
                return Ok(vars);
            }
        }
        Ok(self.db.get::<Meta>(&())?.unwrap_or_default())
    }

    fn base_vars(&self) -> Result<StateVars, StateDbError> {
        Ok(self.db.get::<Meta>(&())?.unwrap_or_default())
    }

    /// The last checkpointed batch number.
    pub fn current_batch(&self) -> Result<BatchNum, StateDbError> {
        Ok(self.vars()?.current_batch)
    }

    /// The highest account index allocated so far.
    pub fn last_idx(&self) -> Result<AccountIdx, StateDbError> {
        Ok(self.vars()?.last_idx)
    }

    /// Hands out the next free account index. Allocation is monotonic
    /// and never reuses an index, even across resets of uncommitted
    /// work (a reset also rolls this counter back, keeping replays
    /// deterministic).
    pub fn allocate_idx(&mut self) -> Result<AccountIdx, StateDbError> {
        let mut vars = self.vars()?;
        vars.last_idx = vars.last_idx.next().map_err(|_| StateDbError::IdxOverflow)?;
        self.head.vars = Some(vars);
        Ok(vars.last_idx)
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    fn read_account(&self, idx: AccountIdx) -> Result<Option<Account>, StateDbError> {
        if let Some(slot) = self.head.accounts.get(&idx) {
            return Ok(slot.clone());
        }
        for (_, delta) in self.checkpoints.iter().rev() {
            if let Some(slot) = delta.accounts.get(&idx) {
                return Ok(slot.clone());
            }
        }
        Ok(self.db.get::<Accounts>(&idx)?)
    }

    /// Inserts a new account leaf. Fails if `idx` is already occupied.
    pub fn create_account(
        &mut self,
        idx: AccountIdx,
        account: &Account,
    ) -> Result<ProcessorProof, StateDbError> {
        if self.read_account(idx)?.is_some() {
            return Err(StateDbError::AccountAlreadyExists(idx));
        }
        let leaf = account.leaf_hash()?;
        let proof = self.tree_update(TREE_ACCOUNT, idx.as_u64() as u128, Some(leaf))?;
        self.head.accounts.insert(idx, Some(account.clone()));
        tracing::debug!(%idx, "created account");
        Ok(proof)
    }

    /// Reads an account leaf.
    pub fn get_account(&self, idx: AccountIdx) -> Result<Account, StateDbError> {
        self.read_account(idx)?.ok_or(StateDbError::NotFound)
    }

    /// Rewrites an existing account leaf. Fails if `idx` is absent.
    pub fn update_account(
        &mut self,
        idx: AccountIdx,
        account: &Account,
    ) -> Result<ProcessorProof, StateDbError> {
        if self.read_account(idx)?.is_none() {
            return Err(StateDbError::NotFound);
        }
        let leaf = account.leaf_hash()?;
        let proof = self.tree_update(TREE_ACCOUNT, idx.as_u64() as u128, Some(leaf))?;
        self.head.accounts.insert(idx, Some(account.clone()));
        Ok(proof)
    }

    /// A membership/non-membership proof for an account leaf. Never
    /// fails in `TxSelector` mode; it returns the inert sentinel there.
    pub fn mt_get_proof_account(&self, idx: AccountIdx) -> Result<MerkleProof, StateDbError> {
        let key = idx.as_u64() as u128;
        match &self.account_tree {
            None => Ok(MerkleProof::sentinel(key)),
            Some(tree) => Ok(tree.get_proof(&self.node_reader(TREE_ACCOUNT), key)?),
        }
    }

    // ------------------------------------------------------------------
    // Vouches
    // ------------------------------------------------------------------

    fn read_link(&self, link_idx: LinkIdx) -> Result<Option<bool>, StateDbError> {
        if let Some(slot) = self.head.links.get(&link_idx) {
            return Ok(*slot);
        }
        for (_, delta) in self.checkpoints.iter().rev() {
            if let Some(slot) = delta.links.get(&link_idx) {
                return Ok(*slot);
            }
        }
        Ok(self.db.get::<Links>(&link_idx)?)
    }

    /// The vouch-tree position of an edge: `from ‖ to`, each squeezed
    /// into the `n_levels` bits account indices fit in (the wire-level
    /// [`LinkIdx`] always packs at 48 bits per side).
    fn link_tree_key(&self, link_idx: LinkIdx) -> u128 {
        let n_levels = self.config.n_levels;
        ((link_idx.from_idx().as_u64() as u128) << n_levels) | link_idx.to_idx().as_u64() as u128
    }

    fn link_leaf_hash(link_idx: LinkIdx, value: bool) -> Hash32 {
        let mut preimage = [0u8; LinkIdx::BYTES_LEN + 1];
        preimage[..LinkIdx::BYTES_LEN].copy_from_slice(&link_idx.to_bytes());
        preimage[LinkIdx::BYTES_LEN] = value as u8;
        keccak256(&preimage)
    }

    /// Inserts a vouch edge. Fails if the edge is already present.
    pub fn create_link(
        &mut self,
        link_idx: LinkIdx,
        value: bool,
    ) -> Result<ProcessorProof, StateDbError> {
        if self.read_link(link_idx)?.is_some() {
            return Err(StateDbError::LinkAlreadyExists(link_idx));
        }
        let leaf = Self::link_leaf_hash(link_idx, value);
        let key = self.link_tree_key(link_idx);
        let proof = self.tree_update(TREE_VOUCH, key, Some(leaf))?;
        self.head.links.insert(link_idx, Some(value));
        tracing::debug!(link = %link_idx, "created link");
        Ok(proof)
    }

    /// Reads a vouch edge's weight.
    pub fn get_link(&self, link_idx: LinkIdx) -> Result<bool, StateDbError> {
        self.read_link(link_idx)?.ok_or(StateDbError::NotFound)
    }

    /// Removes a vouch edge from both the KV store and the vouch tree.
    /// Deleting an absent edge is an explicit failure, not a silent
    /// success.
    pub fn delete_link(&mut self, link_idx: LinkIdx) -> Result<ProcessorProof, StateDbError> {
        if self.read_link(link_idx)?.is_none() {
            return Err(StateDbError::NotFound);
        }
        let key = self.link_tree_key(link_idx);
        let proof = self.tree_update(TREE_VOUCH, key, None)?;
        self.head.links.insert(link_idx, None);
        tracing::debug!(link = %link_idx, "deleted link");
        Ok(proof)
    }

    /// A membership/non-membership proof for a vouch edge. Sentinel in
    /// `TxSelector` mode.
    pub fn mt_get_proof_link(&self, link_idx: LinkIdx) -> Result<MerkleProof, StateDbError> {
        let key = self.link_tree_key(link_idx);
        match &self.vouch_tree {
            None => Ok(MerkleProof::sentinel(key)),
            Some(tree) => Ok(tree.get_proof(&self.node_reader(TREE_VOUCH), key)?),
        }
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// The current root of the selected tree. All-zero in `TxSelector`
    /// mode.
    pub fn get_mt_root(&self, tree: Tree) -> Result<Hash32, StateDbError> {
        let (schedule, tag) = match tree {
            Tree::Account => (&self.account_tree, TREE_ACCOUNT),
            Tree::Vouch => (&self.vouch_tree, TREE_VOUCH),
        };
        match schedule {
            None => Ok([0u8; 32]),
            Some(schedule) => Ok(schedule.root(&self.node_reader(tag))?),
        }
    }

    /// The `(account_root, vouch_root)` pair.
    pub fn state_root(&self) -> Result<StateRoot, StateDbError> {
        Ok(StateRoot {
            account_root: self.get_mt_root(Tree::Account)?,
            vouch_root: self.get_mt_root(Tree::Vouch)?,
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Freezes the work in progress as the checkpoint of `batch_num`,
    /// which must be exactly `current_batch + 1`. Checkpoints beyond the
    /// retention window are flushed into the base db atomically.
    pub fn make_checkpoint(&mut self, batch_num: BatchNum) -> Result<(), StateDbError> {
        let mut vars = self.vars()?;
        let expected = vars.current_batch.next();
        if batch_num != expected {
            return Err(StateDbError::CheckpointOutOfOrder {
                got: batch_num,
                expected,
            });
        }
        vars.current_batch = batch_num;
        self.head.vars = Some(vars);
        let frozen = std::mem::take(&mut self.head);
        self.checkpoints.push_back((batch_num, frozen));
        while self.checkpoints.len() > self.config.keep {
            let (num, delta) = self
                .checkpoints
                .pop_front()
                .expect("len > keep implies non-empty");
            let batch = delta.to_schema_batch()?;
            self.db.write_schemas(batch)?;
            tracing::debug!(batch_num = %num, "flushed checkpoint into the base db");
        }
        tracing::debug!(%batch_num, "made checkpoint");
        Ok(())
    }

    /// Drops the work in progress and every checkpoint above
    /// `batch_num`, restoring the state as of that checkpoint. Fails
    /// with [`StateDbError::CheckpointNotFound`] when `batch_num` has
    /// aged out of the retention window (or never existed).
    pub fn reset(&mut self, batch_num: BatchNum) -> Result<(), StateDbError> {
        let base = self.base_vars()?.current_batch;
        if batch_num < base || batch_num > self.current_batch()? {
            return Err(StateDbError::CheckpointNotFound(batch_num));
        }
        self.head = Delta::default();
        while let Some((num, _)) = self.checkpoints.back() {
            if *num > batch_num {
                self.checkpoints.pop_back();
            } else {
                break;
            }
        }
        tracing::info!(%batch_num, "reset state db");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Historical reads
    // ------------------------------------------------------------------

    fn check_batch_in_window(&self, batch_num: BatchNum) -> Result<(), StateDbError> {
        let base = self.base_vars()?.current_batch;
        if batch_num < base || batch_num > self.current_batch()? {
            return Err(StateDbError::CheckpointNotFound(batch_num));
        }
        Ok(())
    }

    /// Reads an account as of the checkpoint of `batch_num`.
    pub fn get_account_at(
        &self,
        batch_num: BatchNum,
        idx: AccountIdx,
    ) -> Result<Account, StateDbError> {
        self.check_batch_in_window(batch_num)?;
        for (num, delta) in self.checkpoints.iter().rev() {
            if *num > batch_num {
                continue;
            }
            if let Some(slot) = delta.accounts.get(&idx) {
                return slot.clone().ok_or(StateDbError::NotFound);
            }
        }
        self.db.get::<Accounts>(&idx)?.ok_or(StateDbError::NotFound)
    }

    /// Reads a vouch edge as of the checkpoint of `batch_num`.
    pub fn get_link_at(
        &self,
        batch_num: BatchNum,
        link_idx: LinkIdx,
    ) -> Result<bool, StateDbError> {
        self.check_batch_in_window(batch_num)?;
        for (num, delta) in self.checkpoints.iter().rev() {
            if *num > batch_num {
                continue;
            }
            if let Some(slot) = delta.links.get(&link_idx) {
                return slot.ok_or(StateDbError::NotFound);
            }
        }
        self.db.get::<Links>(&link_idx)?.ok_or(StateDbError::NotFound)
    }

    // ------------------------------------------------------------------
    // Tree plumbing
    // ------------------------------------------------------------------

    fn node_reader(&self, tag: u8) -> ChainNodeReader<'_> {
        ChainNodeReader {
            tag,
            head: &self.head.nodes,
            checkpoints: &self.checkpoints,
            db: &self.db,
        }
    }

    fn tree_update(
        &mut self,
        tag: u8,
        key: u128,
        leaf: Option<Hash32>,
    ) -> Result<ProcessorProof, StateDbError> {
        let schedule = match tag {
            TREE_ACCOUNT => self.account_tree.clone(),
            _ => self.vouch_tree.clone(),
        };
        let Some(schedule) = schedule else {
            return Ok(ProcessorProof::sentinel(key));
        };
        let mut store = ChainNodeStore {
            tag,
            head: &mut self.head.nodes,
            checkpoints: &self.checkpoints,
            db: &self.db,
        };
        Ok(schedule.update(&mut store, key, leaf)?)
    }
}

fn chain_get_node(
    tag: u8,
    level: u8,
    path: u128,
    head: &BTreeMap<NodeKey, Option<Hash32>>,
    checkpoints: &VecDeque<(BatchNum, Delta)>,
    db: &rockbound::DB,
) -> anyhow::Result<Option<Hash32>> {
    let key = NodeKey {
        tree: tag,
        level,
        path,
    };
    if let Some(slot) = head.get(&key) {
        return Ok(*slot);
    }
    for (_, delta) in checkpoints.iter().rev() {
        if let Some(slot) = delta.nodes.get(&key) {
            return Ok(*slot);
        }
    }
    db.get::<TreeNodes>(&key)
}

struct ChainNodeReader<'a> {
    tag: u8,
    head: &'a BTreeMap<NodeKey, Option<Hash32>>,
    checkpoints: &'a VecDeque<(BatchNum, Delta)>,
    db: &'a rockbound::DB,
}

impl NodeReader for ChainNodeReader<'_> {
    fn get_node(&self, level: u8, path: u128) -> anyhow::Result<Option<Hash32>> {
        chain_get_node(self.tag, level, path, self.head, self.checkpoints, self.db)
    }
}

struct ChainNodeStore<'a> {
    tag: u8,
    head: &'a mut BTreeMap<NodeKey, Option<Hash32>>,
    checkpoints: &'a VecDeque<(BatchNum, Delta)>,
    db: &'a rockbound::DB,
}

impl NodeReader for ChainNodeStore<'_> {
    fn get_node(&self, level: u8, path: u128) -> anyhow::Result<Option<Hash32>> {
        chain_get_node(self.tag, level, path, self.head, self.checkpoints, self.db)
    }
}

impl NodeStore for ChainNodeStore<'_> {
    fn set_node(&mut self, level: u8, path: u128, hash: Option<Hash32>) -> anyhow::Result<()> {
        self.head.insert(
            NodeKey {
                tree: self.tag,
                level,
                path,
            },
            hash,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;
    use uniq_common::{BjjPubKey, EthAddr, Nonce};

    use super::*;

    fn account(i: u64) -> Account {
        Account {
            idx: AccountIdx::new(256 + i).unwrap(),
            batch_num: BatchNum::from(0),
            bjj: BjjPubKey([i as u8 + 1; 32]),
            eth_addr: EthAddr::from_low_u64_be(i + 1),
            nonce: Nonce::new(i).unwrap(),
            balance: U256::from(1000u64),
        }
    }

    fn selector_db(dir: &std::path::Path) -> StateDb {
        StateDb::new(Config {
            path: dir.to_path_buf(),
            keep: 128,
            kind: StateDbKind::TxSelector,
            n_levels: 0,
        })
        .unwrap()
    }

    fn processor_db(dir: &std::path::Path, keep: usize) -> StateDb {
        StateDb::new(Config {
            path: dir.to_path_buf(),
            keep,
            kind: StateDbKind::TxProcessor,
            n_levels: 16,
        })
        .unwrap()
    }

    #[test]
    fn config_kind_and_levels_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let bad = StateDb::new(Config {
            path: dir.path().to_path_buf(),
            keep: 1,
            kind: StateDbKind::TxSelector,
            n_levels: 16,
        });
        assert!(matches!(bad, Err(StateDbError::InvalidConfig(_))));
        let bad = StateDb::new(Config {
            path: dir.path().to_path_buf(),
            keep: 1,
            kind: StateDbKind::Synchronizer,
            n_levels: 0,
        });
        assert!(matches!(bad, Err(StateDbError::InvalidConfig(_))));
    }

    #[test]
    fn state_db_without_merkle_trees() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = selector_db(dir.path());

        // Missing account is an explicit not-found.
        assert!(matches!(
            sdb.get_account(AccountIdx::EXIT),
            Err(StateDbError::NotFound)
        ));

        let accounts: Vec<Account> = (0..4).map(account).collect();
        for acc in &accounts {
            sdb.create_account(acc.idx, acc).unwrap();
        }
        for acc in &accounts {
            assert_eq!(sdb.get_account(acc.idx).unwrap(), *acc);
        }

        // Occupied index rejects a second creation.
        let idx = AccountIdx::new(256).unwrap();
        assert!(matches!(
            sdb.create_account(idx, &accounts[1]),
            Err(StateDbError::AccountAlreadyExists(i)) if i == idx
        ));

        // Updates rewrite the stored leaf.
        for acc in &accounts {
            let mut updated = acc.clone();
            updated.nonce = updated.nonce.bump().unwrap();
            sdb.update_account(acc.idx, &updated).unwrap();
            assert_eq!(sdb.get_account(acc.idx).unwrap().nonce, updated.nonce);
        }

        // Proof requests are sentinel, not failures.
        let proof = sdb.mt_get_proof_account(AccountIdx::EXIT).unwrap();
        assert!(!proof.is_membership());
        assert!(proof.siblings.is_empty());
        assert_eq!(sdb.get_mt_root(Tree::Account).unwrap(), [0u8; 32]);
    }

    #[test]
    fn update_of_missing_account_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        let acc = account(0);
        assert!(matches!(
            sdb.update_account(acc.idx, &acc),
            Err(StateDbError::NotFound)
        ));
    }

    #[test]
    fn account_mutations_move_the_root_and_prove() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        let tree = sdb.account_tree().unwrap().clone();

        let empty_root = sdb.get_mt_root(Tree::Account).unwrap();
        assert_eq!(empty_root, tree.empty_root());

        let acc = account(0);
        let proof = sdb.create_account(acc.idx, &acc).unwrap();
        assert_eq!(proof.op, TreeOp::Insert);
        assert_eq!(proof.old_root, empty_root);
        let root = sdb.get_mt_root(Tree::Account).unwrap();
        assert_eq!(proof.new_root, root);

        let membership = sdb.mt_get_proof_account(acc.idx).unwrap();
        assert!(membership.is_membership());
        assert_eq!(membership.leaf, Some(acc.leaf_hash().unwrap()));
        assert!(tree.verify_proof(&membership));

        let absent = sdb.mt_get_proof_account(AccountIdx::new(300).unwrap()).unwrap();
        assert!(!absent.is_membership());
        assert!(tree.verify_proof(&absent));
    }

    #[test]
    fn vouch_lifecycle_ends_in_non_membership() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        let a = AccountIdx::new(256).unwrap();
        let b = AccountIdx::new(257).unwrap();
        let ab = LinkIdx::new(a, b);
        let ba = LinkIdx::new(b, a);

        sdb.create_link(ab, true).unwrap();
        assert!(sdb.get_link(ab).unwrap());
        assert!(matches!(
            sdb.create_link(ab, true),
            Err(StateDbError::LinkAlreadyExists(l)) if l == ab
        ));
        // The reverse edge is independent.
        assert!(matches!(sdb.get_link(ba), Err(StateDbError::NotFound)));

        sdb.create_link(ba, true).unwrap();
        let proof = sdb.delete_link(ab).unwrap();
        assert_eq!(proof.op, TreeOp::Delete);

        // The deleted edge proves non-membership against the post root.
        let tree = sdb.vouch_tree().unwrap().clone();
        let non_membership = sdb.mt_get_proof_link(ab).unwrap();
        assert!(!non_membership.is_membership());
        assert_eq!(non_membership.root, sdb.get_mt_root(Tree::Vouch).unwrap());
        assert!(tree.verify_proof(&non_membership));
        assert!(matches!(sdb.get_link(ab), Err(StateDbError::NotFound)));
        assert!(matches!(sdb.delete_link(ab), Err(StateDbError::NotFound)));

        // The untouched edge survives.
        assert!(sdb.get_link(ba).unwrap());
    }

    #[test]
    fn idx_allocation_is_contiguous_from_256() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        assert_eq!(sdb.last_idx().unwrap().as_u64(), 255);
        for expected in 256..260 {
            assert_eq!(sdb.allocate_idx().unwrap().as_u64(), expected);
        }
        assert_eq!(sdb.last_idx().unwrap().as_u64(), 259);
    }

    #[test]
    fn checkpoints_must_be_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        assert!(matches!(
            sdb.make_checkpoint(BatchNum::from(2)),
            Err(StateDbError::CheckpointOutOfOrder { .. })
        ));
        sdb.make_checkpoint(BatchNum::from(1)).unwrap();
        sdb.make_checkpoint(BatchNum::from(2)).unwrap();
        assert_eq!(sdb.current_batch().unwrap(), BatchNum::from(2));
    }

    #[test]
    fn reset_restores_the_checkpointed_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);

        let first = account(0);
        sdb.create_account(first.idx, &first).unwrap();
        sdb.make_checkpoint(BatchNum::from(1)).unwrap();
        let root_at_1 = sdb.state_root().unwrap();
        let last_idx_snapshot = sdb.last_idx().unwrap();

        let second = account(1);
        sdb.allocate_idx().unwrap();
        sdb.create_account(second.idx, &second).unwrap();
        sdb.create_link(LinkIdx::new(first.idx, second.idx), true).unwrap();
        sdb.make_checkpoint(BatchNum::from(2)).unwrap();
        assert_ne!(sdb.state_root().unwrap(), root_at_1);

        sdb.reset(BatchNum::from(1)).unwrap();
        assert_eq!(sdb.current_batch().unwrap(), BatchNum::from(1));
        assert_eq!(sdb.state_root().unwrap(), root_at_1);
        assert_eq!(sdb.last_idx().unwrap(), last_idx_snapshot);
        assert!(matches!(
            sdb.get_account(second.idx),
            Err(StateDbError::NotFound)
        ));

        // Replaying the discarded batch reproduces the exact state.
        sdb.allocate_idx().unwrap();
        sdb.create_account(second.idx, &second).unwrap();
        sdb.create_link(LinkIdx::new(first.idx, second.idx), true).unwrap();
        sdb.make_checkpoint(BatchNum::from(2)).unwrap();
        let replayed_root = sdb.state_root().unwrap();

        sdb.reset(BatchNum::from(2)).unwrap();
        assert_eq!(sdb.state_root().unwrap(), replayed_root);
    }

    #[test]
    fn retention_window_garbage_collects_old_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 2);

        for batch in 1..=4u64 {
            let acc = account(batch);
            sdb.allocate_idx().unwrap();
            sdb.create_account(acc.idx, &acc).unwrap();
            sdb.make_checkpoint(BatchNum::from(batch)).unwrap();
        }

        // Batches 1 and 2 were flushed into the base; they are no longer
        // rollback targets, but their data is still readable.
        assert!(matches!(
            sdb.reset(BatchNum::from(1)),
            Err(StateDbError::CheckpointNotFound(_))
        ));
        assert_eq!(sdb.get_account(account(1).idx).unwrap(), account(1));

        // The window itself still works.
        sdb.reset(BatchNum::from(3)).unwrap();
        assert_eq!(sdb.current_batch().unwrap(), BatchNum::from(3));
        assert!(matches!(
            sdb.get_account(account(4).idx),
            Err(StateDbError::NotFound)
        ));
    }

    #[test]
    fn historical_reads_observe_checkpoint_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);

        let acc = account(0);
        sdb.create_account(acc.idx, &acc).unwrap();
        sdb.make_checkpoint(BatchNum::from(1)).unwrap();

        let mut updated = acc.clone();
        updated.balance = U256::from(5u64);
        updated.nonce = updated.nonce.bump().unwrap();
        sdb.update_account(acc.idx, &updated).unwrap();
        sdb.make_checkpoint(BatchNum::from(2)).unwrap();

        assert_eq!(
            sdb.get_account_at(BatchNum::from(1), acc.idx).unwrap(),
            acc
        );
        assert_eq!(
            sdb.get_account_at(BatchNum::from(2), acc.idx).unwrap(),
            updated
        );
        assert!(matches!(
            sdb.get_account_at(BatchNum::from(9), acc.idx),
            Err(StateDbError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn reset_discards_uncheckpointed_head_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut sdb = processor_db(dir.path(), 8);
        sdb.make_checkpoint(BatchNum::from(1)).unwrap();

        let acc = account(0);
        sdb.create_account(acc.idx, &acc).unwrap();
        sdb.reset(BatchNum::from(1)).unwrap();
        assert!(matches!(
            sdb.get_account(acc.idx),
            Err(StateDbError::NotFound)
        ));
        // Resetting above the current batch is refused.
        assert!(matches!(
            sdb.reset(BatchNum::from(5)),
            Err(StateDbError::CheckpointNotFound(_))
        ));
    }
}
