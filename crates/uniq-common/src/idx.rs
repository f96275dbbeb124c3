//! Identifier newtypes: account indices, vouch link indices, batch and
//! block numbers, and nonces, together with their wire codecs.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::tx::TxError;

/// The index of an account leaf in the account tree.
///
/// Valid values fit in 48 bits. `0` and `1` are reserved sentinels (`0` is
/// "no account", `1` is the exit destination); user accounts start at
/// [`AccountIdx::USER_THRESHOLD`].
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct AccountIdx(u64);

impl AccountIdx {
    /// Length of the wire encoding.
    pub const BYTES_LEN: usize = 6;
    /// The largest encodable index, `2^48 - 1`.
    pub const MAX: u64 = (1 << 48) - 1;
    /// The "no account" sentinel.
    pub const NONE: AccountIdx = AccountIdx(0);
    /// The exit-destination sentinel.
    pub const EXIT: AccountIdx = AccountIdx(1);
    /// The first index available to user accounts.
    pub const USER_THRESHOLD: AccountIdx = AccountIdx(256);

    /// Builds an index, rejecting values above 48 bits.
    pub fn new(raw: u64) -> Result<Self, TxError> {
        if raw > Self::MAX {
            return Err(TxError::IdxOverflow);
        }
        Ok(AccountIdx(raw))
    }

    /// The raw integer value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The 6-byte big-endian wire encoding.
    pub fn to_bytes(self) -> Result<[u8; Self::BYTES_LEN], TxError> {
        if self.0 > Self::MAX {
            return Err(TxError::IdxOverflow);
        }
        let wide = self.0.to_be_bytes();
        let mut b = [0u8; Self::BYTES_LEN];
        b.copy_from_slice(&wide[2..]);
        Ok(b)
    }

    /// Decodes a 6-byte big-endian index; any other length fails.
    pub fn from_bytes(b: &[u8]) -> Result<Self, TxError> {
        if b.len() != Self::BYTES_LEN {
            return Err(TxError::BadLength {
                what: "account idx",
                got: b.len(),
                expected: Self::BYTES_LEN,
            });
        }
        let mut wide = [0u8; 8];
        wide[2..].copy_from_slice(b);
        Ok(AccountIdx(u64::from_be_bytes(wide)))
    }

    /// Whether this index refers to a user account.
    pub fn is_user(&self) -> bool {
        *self >= Self::USER_THRESHOLD
    }

    /// The next index, for monotonic allocation.
    pub fn next(self) -> Result<Self, TxError> {
        Self::new(self.0 + 1)
    }

    /// Lifts the sentinel encoding into a tagged view.
    pub fn interpret(&self) -> TxDestination {
        match *self {
            Self::NONE => TxDestination::None,
            Self::EXIT => TxDestination::Exit,
            idx => TxDestination::Account(idx),
        }
    }
}

impl fmt::Display for AccountIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The interpreted meaning of an [`AccountIdx`] in a tx envelope. The
/// integer encoding stays on the wire; this view is what the processing
/// layer matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDestination {
    /// No account referenced (idx `0`).
    None,
    /// The exit destination (idx `1`).
    Exit,
    /// A concrete account leaf.
    Account(AccountIdx),
}

/// The composite key of a vouch edge: `from_idx ‖ to_idx`, 48 bits each,
/// packed big-endian into 96 bits.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct LinkIdx(u128);

impl LinkIdx {
    /// Length of the wire encoding.
    pub const BYTES_LEN: usize = 12;

    /// Builds the edge key for `from → to`.
    pub fn new(from: AccountIdx, to: AccountIdx) -> Self {
        LinkIdx(((from.as_u64() as u128) << 48) | to.as_u64() as u128)
    }

    /// The issuing side of the edge.
    pub fn from_idx(&self) -> AccountIdx {
        AccountIdx((self.0 >> 48) as u64)
    }

    /// The receiving side of the edge.
    pub fn to_idx(&self) -> AccountIdx {
        AccountIdx((self.0 & ((1 << 48) - 1)) as u64)
    }

    /// The raw packed value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// The 12-byte big-endian wire encoding.
    pub fn to_bytes(self) -> [u8; Self::BYTES_LEN] {
        let wide = self.0.to_be_bytes();
        let mut b = [0u8; Self::BYTES_LEN];
        b.copy_from_slice(&wide[4..]);
        b
    }

    /// Decodes a 12-byte big-endian edge key.
    pub fn from_bytes(b: &[u8]) -> Result<Self, TxError> {
        if b.len() != Self::BYTES_LEN {
            return Err(TxError::BadLength {
                what: "link idx",
                got: b.len(),
                expected: Self::BYTES_LEN,
            });
        }
        let mut wide = [0u8; 16];
        wide[4..].copy_from_slice(b);
        Ok(LinkIdx(u128::from_be_bytes(wide)))
    }
}

impl fmt::Display for LinkIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from_idx(), self.to_idx())
    }
}

macro_rules! u64_wrapper {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            BorshSerialize,
            BorshDeserialize,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// The raw integer value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }

            /// The next number in sequence.
            pub fn next(self) -> Self {
                $name(self.0 + 1)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u64_wrapper!(
    /// A monotonically increasing batch number. Batch `0` is the
    /// pre-genesis anchor; forged batches start at `1`.
    BatchNum
);

u64_wrapper!(
    /// An L1 block height.
    EthBlockNum
);

/// An account nonce. At most 40 bits; increases by exactly one per
/// successful L2 tx the account authors.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Nonce(u64);

impl Nonce {
    /// The largest representable nonce, `2^40 - 1`.
    pub const MAX: u64 = (1 << 40) - 1;
    /// Length of the big-endian encoding used in leaf packings and id
    /// preimages.
    pub const BYTES_LEN: usize = 5;

    /// Builds a nonce, rejecting values above 40 bits.
    pub fn new(raw: u64) -> Result<Self, TxError> {
        if raw > Self::MAX {
            return Err(TxError::NonceOverflow);
        }
        Ok(Nonce(raw))
    }

    /// The raw integer value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The incremented nonce, or an error at the 40-bit boundary.
    pub fn bump(self) -> Result<Self, TxError> {
        Self::new(self.0 + 1)
    }

    /// The 5-byte big-endian encoding.
    pub fn to_bytes(self) -> [u8; Self::BYTES_LEN] {
        let wide = self.0.to_be_bytes();
        let mut b = [0u8; Self::BYTES_LEN];
        b.copy_from_slice(&wide[3..]);
        b
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idx_byte_round_trip() {
        for raw in [0u64, 1, 255, 256, 1 << 20, AccountIdx::MAX] {
            let idx = AccountIdx::new(raw).unwrap();
            let b = idx.to_bytes().unwrap();
            assert_eq!(AccountIdx::from_bytes(&b).unwrap(), idx);
        }
    }

    #[test]
    fn idx_overflow_fails_to_serialize() {
        assert_eq!(
            AccountIdx::new(1 << 48).unwrap_err(),
            TxError::IdxOverflow
        );
        // An index forged through deserialization still fails to encode.
        let forged = AccountIdx(AccountIdx::MAX + 1);
        assert_eq!(forged.to_bytes().unwrap_err(), TxError::IdxOverflow);
    }

    #[test]
    fn idx_from_bytes_rejects_wrong_length() {
        assert!(matches!(
            AccountIdx::from_bytes(&[0u8; 5]).unwrap_err(),
            TxError::BadLength { got: 5, expected: 6, .. }
        ));
        assert!(AccountIdx::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn idx_sentinel_interpretation() {
        assert_eq!(AccountIdx::NONE.interpret(), TxDestination::None);
        assert_eq!(AccountIdx::EXIT.interpret(), TxDestination::Exit);
        let user = AccountIdx::new(256).unwrap();
        assert_eq!(user.interpret(), TxDestination::Account(user));
        assert!(user.is_user());
        assert!(!AccountIdx::new(255).unwrap().is_user());
    }

    #[test]
    fn link_idx_packs_both_endpoints() {
        let from = AccountIdx::new(258).unwrap();
        let to = AccountIdx::new(256).unwrap();
        let link = LinkIdx::new(from, to);
        assert_eq!(link.from_idx(), from);
        assert_eq!(link.to_idx(), to);
        assert_ne!(link, LinkIdx::new(to, from));
        let b = link.to_bytes();
        assert_eq!(LinkIdx::from_bytes(&b).unwrap(), link);
    }

    #[test]
    fn nonce_bump_respects_the_40_bit_cap() {
        let n = Nonce::new(Nonce::MAX - 1).unwrap();
        assert_eq!(n.bump().unwrap().as_u64(), Nonce::MAX);
        assert_eq!(
            n.bump().unwrap().bump().unwrap_err(),
            TxError::NonceOverflow
        );
    }
}
