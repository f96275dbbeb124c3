//! Shared primitives and the transaction algebra of the uniq rollup
//! sequencer.
//!
//! - Identifier newtypes and their wire codecs live in [`idx`]
//! - The 5-byte floating-decimal amount codec lives in [`float40`]
//! - Account records and their canonical leaf packing live in [`account`]
//! - The typed L1/L2 transaction records, type inference, id derivation and
//!   byte layouts live in [`tx`], [`l1tx`] and [`l2tx`]
//! - Account-creation authorizations live in [`auth`]
//! - The block/batch payloads handed to downstream consumers live in
//!   [`block`]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod account;
pub mod auth;
pub mod block;
pub mod encoding;
pub mod float40;
pub mod idx;
pub mod l1tx;
pub mod l2tx;
pub mod tx;

pub use account::{Account, BjjPubKey};
pub use float40::Float40;
pub use idx::{AccountIdx, BatchNum, EthBlockNum, LinkIdx, Nonce, TxDestination};
pub use tx::{TxError, TxId, TxType};

/// An Ethereum address, as it appears in tx envelopes and account leaves.
pub type EthAddr = ethereum_types::H160;

/// An amount of the native token. Balances are capped at 192 bits by the
/// account leaf packing; amounts travel on the wire as [`Float40`].
pub type Amount = ethereum_types::U256;

/// A 32-byte hash, used for Merkle roots and tree nodes.
pub type Hash32 = [u8; 32];
