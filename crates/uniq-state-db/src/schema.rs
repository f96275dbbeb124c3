//! Column-family definitions for the state database.
//!
//! Keys are hand-encoded big-endian so RocksDB's lexicographic ordering
//! matches numeric ordering; values go through borsh.

use borsh::BorshDeserialize;
use rockbound::schema::{ColumnFamilyName, KeyDecoder, KeyEncoder, ValueCodec};
use rockbound::CodecError;
use uniq_common::{Account, AccountIdx, BatchNum, Hash32, LinkIdx};

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> CodecError {
    CodecError::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Every column family the state db opens.
pub(crate) const STATE_TABLES: &[ColumnFamilyName] = &[
    Accounts::table_name(),
    Links::table_name(),
    TreeNodes::table_name(),
    Meta::table_name(),
];

/// Defines a table type implementing [`rockbound::schema::Schema`];
/// key and value codecs are implemented by hand below.
macro_rules! define_table {
    ($(#[$docs:meta])* ($table_name:ident) $key:ty => $value:ty) => {
        $(#[$docs])*
        #[derive(Clone, Copy, Debug, Default)]
        pub(crate) struct $table_name;

        impl ::rockbound::schema::Schema for $table_name {
            const COLUMN_FAMILY_NAME: &'static str = $table_name::table_name();
            const SHOULD_CACHE: bool = false;
            type Key = $key;
            type Value = $value;
        }

        impl $table_name {
            pub(crate) const fn table_name() -> &'static str {
                ::core::stringify!($table_name)
            }
        }
    };
}

define_table!(
    /// Account leaves by index.
    (Accounts) AccountIdx => Account
);

define_table!(
    /// Vouch edges by composite link index. The value is the edge weight.
    (Links) LinkIdx => bool
);

define_table!(
    /// Non-empty Merkle tree nodes of both trees.
    (TreeNodes) NodeKey => Hash32
);

define_table!(
    /// The singleton row carrying the allocation and checkpoint counters.
    (Meta) () => StateVars
);

/// Address of one Merkle node: which tree, which level, which path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NodeKey {
    /// `0` for the account tree, `1` for the vouch tree.
    pub tree: u8,
    /// Root is level 0; leaves sit at the tree depth.
    pub level: u8,
    /// The `level` high bits of the leaf key, right-aligned.
    pub path: u128,
}

/// The mutable scalars of the state db, stored under [`Meta`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub(crate) struct StateVars {
    /// The last checkpointed batch.
    pub current_batch: BatchNum,
    /// The highest allocated account index.
    pub last_idx: AccountIdx,
}

impl Default for StateVars {
    fn default() -> Self {
        StateVars {
            current_batch: BatchNum::from(0),
            // User accounts start right above the sentinel range.
            last_idx: AccountIdx::new(AccountIdx::USER_THRESHOLD.as_u64() - 1)
                .expect("threshold is in range"),
        }
    }
}

impl KeyEncoder<Accounts> for AccountIdx {
    fn encode_key(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_u64().to_be_bytes().to_vec())
    }
}

impl KeyDecoder<Accounts> for AccountIdx {
    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; 8] = data
            .try_into()
            .map_err(|_| invalid_data(format!("account idx key must be 8 bytes, got {}", data.len())))?;
        AccountIdx::new(u64::from_be_bytes(raw)).map_err(invalid_data)
    }
}

impl ValueCodec<Accounts> for Account {
    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        borsh::to_vec(self).map_err(Into::into)
    }

    fn decode_value(data: &[u8]) -> Result<Self, CodecError> {
        Account::deserialize_reader(&mut &data[..]).map_err(Into::into)
    }
}

impl KeyEncoder<Links> for LinkIdx {
    fn encode_key(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_u128().to_be_bytes().to_vec())
    }
}

impl KeyDecoder<Links> for LinkIdx {
    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; 16] = data
            .try_into()
            .map_err(|_| invalid_data(format!("link idx key must be 16 bytes, got {}", data.len())))?;
        let raw = u128::from_be_bytes(raw);
        Ok(LinkIdx::new(
            AccountIdx::new((raw >> 48) as u64).map_err(invalid_data)?,
            AccountIdx::new((raw & ((1 << 48) - 1)) as u64).map_err(invalid_data)?,
        ))
    }
}

impl ValueCodec<Links> for bool {
    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        borsh::to_vec(self).map_err(Into::into)
    }

    fn decode_value(data: &[u8]) -> Result<Self, CodecError> {
        bool::deserialize_reader(&mut &data[..]).map_err(Into::into)
    }
}

impl KeyEncoder<TreeNodes> for NodeKey {
    fn encode_key(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(18);
        out.push(self.tree);
        out.push(self.level);
        out.extend_from_slice(&self.path.to_be_bytes());
        Ok(out)
    }
}

impl KeyDecoder<TreeNodes> for NodeKey {
    fn decode_key(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 18 {
            return Err(invalid_data(format!(
                "tree node key must be 18 bytes, got {}",
                data.len()
            )));
        }
        let mut path = [0u8; 16];
        path.copy_from_slice(&data[2..]);
        Ok(NodeKey {
            tree: data[0],
            level: data[1],
            path: u128::from_be_bytes(path),
        })
    }
}

impl ValueCodec<TreeNodes> for Hash32 {
    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.to_vec())
    }

    fn decode_value(data: &[u8]) -> Result<Self, CodecError> {
        data.try_into()
            .map_err(|_| invalid_data(format!("tree node hash must be 32 bytes, got {}", data.len())))
    }
}

impl KeyEncoder<Meta> for () {
    fn encode_key(&self) -> Result<Vec<u8>, CodecError> {
        Ok(Vec::new())
    }
}

impl KeyDecoder<Meta> for () {
    fn decode_key(_data: &[u8]) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl ValueCodec<Meta> for StateVars {
    fn encode_value(&self) -> Result<Vec<u8>, CodecError> {
        borsh::to_vec(self).map_err(Into::into)
    }

    fn decode_value(data: &[u8]) -> Result<Self, CodecError> {
        StateVars::deserialize_reader(&mut &data[..]).map_err(Into::into)
    }
}
