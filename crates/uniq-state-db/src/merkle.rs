//! A fixed-depth sparse Merkle tree over a pluggable node store.
//!
//! The tree has `depth` levels below the root; a leaf sits at level
//! `depth` and its position is the `depth` low bits of its key, walked
//! most-significant first. Absent subtrees hash to precomputed per-level
//! empty hashes, and the store only ever holds non-empty nodes, so an
//! emptied subtree prunes back to nothing and the empty tree always has
//! the same root.
//!
//! Every mutation yields a [`ProcessorProof`] carrying the pre- and
//! post-state data the circuit needs to check the transition; reads yield
//! membership or non-membership [`MerkleProof`]s.

use uniq_common::encoding::keccak256_concat;
use uniq_common::Hash32;

/// The deepest tree this module supports: a vouch tree over 48-bit
/// account indices.
pub const MAX_DEPTH: u8 = 96;

/// Read access to tree nodes. Implementations must return `None` exactly
/// for nodes this module never wrote (or wrote `None` to): the pruning
/// invariant relies on absence meaning "empty subtree".
pub trait NodeReader {
    /// Reads the node at `(level, path)`.
    fn get_node(&self, level: u8, path: u128) -> anyhow::Result<Option<Hash32>>;
}

/// Write access to tree nodes.
pub trait NodeStore: NodeReader {
    /// Writes (`Some`) or prunes (`None`) the node at `(level, path)`.
    fn set_node(&mut self, level: u8, path: u128, hash: Option<Hash32>) -> anyhow::Result<()>;
}

/// The kind of transition a [`ProcessorProof`] witnesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    /// A leaf appeared.
    Insert,
    /// A leaf changed value.
    Update,
    /// A leaf was removed.
    Delete,
    /// Nothing changed (both sides empty).
    NoOp,
}

/// A membership or non-membership proof for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// The root the proof verifies against.
    pub root: Hash32,
    /// The proven key.
    pub key: u128,
    /// Sibling hashes along the key's path, ordered root to leaf. Empty
    /// for the sentinel proof of a tree-less state db.
    pub siblings: Vec<Hash32>,
    /// The leaf hash, or `None` for a non-membership proof.
    pub leaf: Option<Hash32>,
}

impl MerkleProof {
    /// Whether the proof claims the key is present.
    pub fn is_membership(&self) -> bool {
        self.leaf.is_some()
    }

    /// The empty sentinel proof returned by state dbs that keep no trees.
    pub fn sentinel(key: u128) -> Self {
        MerkleProof {
            root: [0u8; 32],
            key,
            siblings: Vec::new(),
            leaf: None,
        }
    }
}

/// The witness of one tree mutation, shaped for the circuit processor:
/// both roots, the sibling path, and the old and new leaf values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorProof {
    /// The kind of transition.
    pub op: TreeOp,
    /// Root before the mutation.
    pub old_root: Hash32,
    /// Root after the mutation.
    pub new_root: Hash32,
    /// The mutated key.
    pub key: u128,
    /// Sibling hashes along the key's path before the mutation, ordered
    /// root to leaf.
    pub siblings: Vec<Hash32>,
    /// The leaf before the mutation.
    pub old_leaf: Option<Hash32>,
    /// The leaf after the mutation.
    pub new_leaf: Option<Hash32>,
}

impl ProcessorProof {
    /// The sentinel proof returned by state dbs that keep no trees.
    pub fn sentinel(key: u128) -> Self {
        ProcessorProof {
            op: TreeOp::NoOp,
            old_root: [0u8; 32],
            new_root: [0u8; 32],
            key,
            siblings: Vec::new(),
            old_leaf: None,
            new_leaf: None,
        }
    }
}

/// A transient, in-memory node store, used for per-batch scratch trees
/// (the exit tree) and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemNodeStore(std::collections::BTreeMap<(u8, u128), Hash32>);

impl MemNodeStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the store holds no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl NodeReader for MemNodeStore {
    fn get_node(&self, level: u8, path: u128) -> anyhow::Result<Option<Hash32>> {
        Ok(self.0.get(&(level, path)).copied())
    }
}

impl NodeStore for MemNodeStore {
    fn set_node(&mut self, level: u8, path: u128, hash: Option<Hash32>) -> anyhow::Result<()> {
        match hash {
            Some(h) => {
                self.0.insert((level, path), h);
            }
            None => {
                self.0.remove(&(level, path));
            }
        }
        Ok(())
    }
}

/// The hashing schedule of one fixed-depth tree.
#[derive(Debug, Clone)]
pub struct SparseTree {
    depth: u8,
    /// `empty[l]` is the hash of an empty subtree rooted at level `l`.
    empty: Vec<Hash32>,
}

impl SparseTree {
    /// Builds the schedule for a tree of `depth` levels. `depth` must be
    /// in `1..=MAX_DEPTH`.
    pub fn new(depth: u8) -> Self {
        assert!(depth >= 1 && depth <= MAX_DEPTH, "unsupported tree depth");
        let mut empty = vec![[0u8; 32]; depth as usize + 1];
        for level in (0..depth as usize).rev() {
            empty[level] = keccak256_concat(&empty[level + 1], &empty[level + 1]);
        }
        SparseTree { depth, empty }
    }

    /// The tree depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The root of an entirely empty tree.
    pub fn empty_root(&self) -> Hash32 {
        self.empty[0]
    }

    /// The current root.
    pub fn root(&self, store: &impl NodeReader) -> anyhow::Result<Hash32> {
        Ok(store.get_node(0, 0)?.unwrap_or(self.empty[0]))
    }

    fn node(&self, store: &impl NodeReader, level: u8, path: u128) -> anyhow::Result<Hash32> {
        Ok(store
            .get_node(level, path)?
            .unwrap_or(self.empty[level as usize]))
    }

    /// Sibling hashes along `key`'s path, ordered root to leaf.
    fn siblings(&self, store: &impl NodeReader, key: u128) -> anyhow::Result<Vec<Hash32>> {
        let mut siblings = Vec::with_capacity(self.depth as usize);
        for level in 1..=self.depth {
            let path = key >> (self.depth - level);
            siblings.push(self.node(store, level, path ^ 1)?);
        }
        Ok(siblings)
    }

    fn check_key(&self, key: u128) -> anyhow::Result<()> {
        anyhow::ensure!(
            key >> self.depth == 0,
            "key {key} out of range for a depth-{} tree",
            self.depth
        );
        Ok(())
    }

    /// A membership (key present) or non-membership (key absent) proof.
    pub fn get_proof(&self, store: &impl NodeReader, key: u128) -> anyhow::Result<MerkleProof> {
        self.check_key(key)?;
        Ok(MerkleProof {
            root: self.root(store)?,
            key,
            siblings: self.siblings(store, key)?,
            leaf: store.get_node(self.depth, key)?,
        })
    }

    /// Checks a proof produced by [`SparseTree::get_proof`] against its
    /// embedded root.
    pub fn verify_proof(&self, proof: &MerkleProof) -> bool {
        if proof.siblings.len() != self.depth as usize {
            return false;
        }
        let mut acc = proof.leaf.unwrap_or(self.empty[self.depth as usize]);
        for level in (1..=self.depth).rev() {
            let sibling = &proof.siblings[level as usize - 1];
            let bit = (proof.key >> (self.depth - level)) & 1;
            acc = if bit == 0 {
                keccak256_concat(&acc, sibling)
            } else {
                keccak256_concat(sibling, &acc)
            };
        }
        acc == proof.root
    }

    /// Sets (`Some`) or removes (`None`) the leaf at `key` and rehashes
    /// the path, pruning subtrees that emptied out.
    pub fn update(
        &self,
        store: &mut impl NodeStore,
        key: u128,
        new_leaf: Option<Hash32>,
    ) -> anyhow::Result<ProcessorProof> {
        self.check_key(key)?;
        let old_root = self.root(store)?;
        let old_leaf = store.get_node(self.depth, key)?;
        let siblings = self.siblings(store, key)?;

        store.set_node(self.depth, key, new_leaf)?;
        let mut acc = new_leaf.unwrap_or(self.empty[self.depth as usize]);
        let mut acc_occupied = new_leaf.is_some();
        for level in (0..self.depth).rev() {
            let child_path = key >> (self.depth - level - 1);
            let sibling = store.get_node(level + 1, child_path ^ 1)?;
            let path = key >> (self.depth - level);
            if !acc_occupied && sibling.is_none() {
                store.set_node(level, path, None)?;
                acc = self.empty[level as usize];
            } else {
                let sibling = sibling.unwrap_or(self.empty[level as usize + 1]);
                acc = if child_path & 1 == 0 {
                    keccak256_concat(&acc, &sibling)
                } else {
                    keccak256_concat(&sibling, &acc)
                };
                store.set_node(level, path, Some(acc))?;
                acc_occupied = true;
            }
        }

        let op = match (old_leaf.is_some(), new_leaf.is_some()) {
            (false, true) => TreeOp::Insert,
            (true, true) => TreeOp::Update,
            (true, false) => TreeOp::Delete,
            (false, false) => TreeOp::NoOp,
        };
        Ok(ProcessorProof {
            op,
            old_root,
            new_root: acc,
            key,
            siblings,
            old_leaf,
            new_leaf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(fill: u8) -> Hash32 {
        [fill; 32]
    }

    #[test]
    fn empty_roots_are_stable() {
        let tree = SparseTree::new(8);
        let store = MemNodeStore::new();
        assert_eq!(tree.root(&store).unwrap(), tree.empty_root());
        assert_eq!(SparseTree::new(8).empty_root(), tree.empty_root());
        assert_ne!(SparseTree::new(9).empty_root(), tree.empty_root());
    }

    #[test]
    fn insert_update_delete_round_trip() {
        let tree = SparseTree::new(8);
        let mut store = MemNodeStore::new();

        let ins = tree.update(&mut store, 7, Some(leaf(1))).unwrap();
        assert_eq!(ins.op, TreeOp::Insert);
        assert_eq!(ins.old_root, tree.empty_root());
        assert_ne!(ins.new_root, ins.old_root);

        let upd = tree.update(&mut store, 7, Some(leaf(2))).unwrap();
        assert_eq!(upd.op, TreeOp::Update);
        assert_eq!(upd.old_root, ins.new_root);
        assert_eq!(upd.old_leaf, Some(leaf(1)));

        let del = tree.update(&mut store, 7, None).unwrap();
        assert_eq!(del.op, TreeOp::Delete);
        // The only leaf is gone, so the tree pruned back to empty.
        assert_eq!(del.new_root, tree.empty_root());
        assert!(store.is_empty());
    }

    #[test]
    fn proofs_verify_and_bind_the_root() {
        let tree = SparseTree::new(16);
        let mut store = MemNodeStore::new();
        tree.update(&mut store, 3, Some(leaf(3))).unwrap();
        tree.update(&mut store, 259, Some(leaf(4))).unwrap();

        let member = tree.get_proof(&store, 259).unwrap();
        assert!(member.is_membership());
        assert!(tree.verify_proof(&member));

        let absent = tree.get_proof(&store, 260).unwrap();
        assert!(!absent.is_membership());
        assert!(tree.verify_proof(&absent));

        // A proof against a stale root no longer verifies.
        let stale = member.clone();
        tree.update(&mut store, 3, Some(leaf(9))).unwrap();
        let fresh = tree.get_proof(&store, 259).unwrap();
        assert_ne!(stale.root, fresh.root);
        assert!(tree.verify_proof(&fresh));
        let mut tampered = fresh.clone();
        tampered.root = stale.root;
        assert!(!tree.verify_proof(&tampered));
    }

    #[test]
    fn deletion_yields_a_non_membership_proof_against_the_new_root() {
        let tree = SparseTree::new(16);
        let mut store = MemNodeStore::new();
        tree.update(&mut store, 100, Some(leaf(1))).unwrap();
        tree.update(&mut store, 101, Some(leaf(2))).unwrap();

        let del = tree.update(&mut store, 101, None).unwrap();
        let proof = tree.get_proof(&store, 101).unwrap();
        assert!(!proof.is_membership());
        assert_eq!(proof.root, del.new_root);
        assert!(tree.verify_proof(&proof));
        // The untouched neighbour is still provable.
        let other = tree.get_proof(&store, 100).unwrap();
        assert!(other.is_membership());
        assert!(tree.verify_proof(&other));
    }

    #[test]
    fn order_of_disjoint_updates_does_not_matter() {
        let tree = SparseTree::new(24);
        let mut a = MemNodeStore::new();
        let mut b = MemNodeStore::new();
        for (store, keys) in [(&mut a, [1u128, 77, 300]), (&mut b, [300, 1, 77])] {
            for key in keys {
                tree.update(store, key, Some(leaf(key as u8))).unwrap();
            }
        }
        assert_eq!(tree.root(&a).unwrap(), tree.root(&b).unwrap());
    }

    #[test]
    fn sentinel_proofs_are_inert() {
        let proof = MerkleProof::sentinel(42);
        assert!(!proof.is_membership());
        assert!(proof.siblings.is_empty());
        let processor = ProcessorProof::sentinel(42);
        assert_eq!(processor.op, TreeOp::NoOp);
    }
}
