//! Copy-on-write checkpoint deltas.
//!
//! The state db keeps one mutable head delta for the batch in progress
//! and one frozen delta per retained checkpoint, chained on top of the
//! committed RocksDB base. A delta records writes as `Some` and deletes
//! as `None`; reads walk the chain newest-first and fall through to the
//! base. Flushing a delta turns it into a single atomic [`SchemaBatch`].

use std::collections::BTreeMap;

use rockbound::SchemaBatch;
use uniq_common::{Account, Hash32, LinkIdx};

use crate::schema::{Accounts, Links, Meta, NodeKey, StateVars, TreeNodes};

/// The writes accumulated between two checkpoints.
#[derive(Debug, Default, Clone)]
pub(crate) struct Delta {
    pub accounts: BTreeMap<uniq_common::AccountIdx, Option<Account>>,
    pub links: BTreeMap<LinkIdx, Option<bool>>,
    pub nodes: BTreeMap<NodeKey, Option<Hash32>>,
    pub vars: Option<StateVars>,
}

impl Delta {
    /// Materializes the delta as one atomic write batch against the base
    /// db.
    pub fn to_schema_batch(&self) -> anyhow::Result<SchemaBatch> {
        let mut batch = SchemaBatch::new();
        for (idx, account) in &self.accounts {
            match account {
                Some(account) => batch.put::<Accounts>(idx, account)?,
                None => batch.delete::<Accounts>(idx)?,
            }
        }
        for (link_idx, value) in &self.links {
            match value {
                Some(value) => batch.put::<Links>(link_idx, value)?,
                None => batch.delete::<Links>(link_idx)?,
            }
        }
        for (key, hash) in &self.nodes {
            match hash {
                Some(hash) => batch.put::<TreeNodes>(key, hash)?,
                None => batch.delete::<TreeNodes>(key)?,
            }
        }
        if let Some(vars) = &self.vars {
            batch.put::<Meta>(&(), vars)?;
        }
        Ok(batch)
    }
}
