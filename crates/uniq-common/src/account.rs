//! Account records and their canonical Merkle leaf packing.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::encoding::keccak256;
use crate::idx::{AccountIdx, BatchNum, Nonce};
use crate::tx::TxError;
use crate::{Amount, EthAddr, Hash32};

/// The number of 32-byte fields in an account leaf packing.
pub const LEAF_FIELDS: usize = 4;

/// A compressed Baby-Jubjub public key. The sequencer core stores and
/// compares these as opaque 32-byte strings; curve arithmetic happens in
/// the circuit and in client wallets.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct BjjPubKey(pub [u8; 32]);

impl fmt::Debug for BjjPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BjjPubKey(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for BjjPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// The state of one account: the value committed to by its leaf in the
/// account tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    /// The leaf index. Unique across the tree and never reused.
    pub idx: AccountIdx,
    /// The batch that last updated this account.
    pub batch_num: BatchNum,
    /// The account's compressed Baby-Jubjub key.
    pub bjj: BjjPubKey,
    /// The account's Ethereum address.
    pub eth_addr: EthAddr,
    /// The L2 tx counter. At most 40 bits.
    pub nonce: Nonce,
    /// The account balance. At most 192 bits.
    pub balance: Amount,
}

impl Account {
    /// The largest storable balance, `2^192 - 1`, enforced by the leaf
    /// packing.
    pub fn max_balance() -> Amount {
        (Amount::one() << 192) - Amount::one()
    }

    /// The canonical 4-field packing hashed into the account's Merkle
    /// leaf:
    ///
    /// | field | contents |
    /// |-------|----------|
    /// | `e0`  | `nonce(5 BE)` then zero padding |
    /// | `e1`  | `balance(32 BE)`, top 8 bytes zero |
    /// | `e2`  | `bjj(32)` |
    /// | `e3`  | zero padding then `eth_addr(20)` |
    pub fn leaf_packing(&self) -> Result<[u8; 32 * LEAF_FIELDS], TxError> {
        if self.balance > Self::max_balance() {
            return Err(TxError::BalanceOverflow);
        }
        let mut packed = [0u8; 32 * LEAF_FIELDS];
        packed[..Nonce::BYTES_LEN].copy_from_slice(&self.nonce.to_bytes());
        self.balance.to_big_endian(&mut packed[32..64]);
        packed[64..96].copy_from_slice(&self.bjj.0);
        packed[108..128].copy_from_slice(self.eth_addr.as_bytes());
        Ok(packed)
    }

    /// The account's Merkle leaf hash.
    pub fn leaf_hash(&self) -> Result<Hash32, TxError> {
        Ok(keccak256(&self.leaf_packing()?))
    }
}

// U256 and H160 carry no borsh impls, so the account codec is written out:
// a fixed 108-byte record of big-endian fields.
impl BorshSerialize for Account {
    fn serialize<W: borsh::io::Write>(&self, writer: &mut W) -> borsh::io::Result<()> {
        writer.write_all(&self.idx.as_u64().to_be_bytes())?;
        writer.write_all(&self.batch_num.as_u64().to_be_bytes())?;
        writer.write_all(&self.bjj.0)?;
        writer.write_all(self.eth_addr.as_bytes())?;
        writer.write_all(&self.nonce.as_u64().to_be_bytes())?;
        let mut balance = [0u8; 32];
        self.balance.to_big_endian(&mut balance);
        writer.write_all(&balance)
    }
}

impl BorshDeserialize for Account {
    fn deserialize_reader<R: borsh::io::Read>(reader: &mut R) -> borsh::io::Result<Self> {
        let mut u64_buf = [0u8; 8];
        reader.read_exact(&mut u64_buf)?;
        let idx = AccountIdx::new(u64::from_be_bytes(u64_buf))
            .map_err(|e| borsh::io::Error::new(borsh::io::ErrorKind::InvalidData, e))?;
        reader.read_exact(&mut u64_buf)?;
        let batch_num = BatchNum::from(u64::from_be_bytes(u64_buf));
        let mut bjj = [0u8; 32];
        reader.read_exact(&mut bjj)?;
        let mut eth_addr = [0u8; 20];
        reader.read_exact(&mut eth_addr)?;
        reader.read_exact(&mut u64_buf)?;
        let nonce = Nonce::new(u64::from_be_bytes(u64_buf))
            .map_err(|e| borsh::io::Error::new(borsh::io::ErrorKind::InvalidData, e))?;
        let mut balance = [0u8; 32];
        reader.read_exact(&mut balance)?;
        Ok(Account {
            idx,
            batch_num,
            bjj: BjjPubKey(bjj),
            eth_addr: EthAddr::from_slice(&eth_addr),
            nonce,
            balance: Amount::from_big_endian(&balance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            idx: AccountIdx::new(256).unwrap(),
            batch_num: BatchNum::from(3),
            bjj: BjjPubKey([7u8; 32]),
            eth_addr: EthAddr::from_slice(&[9u8; 20]),
            nonce: Nonce::new(11).unwrap(),
            balance: Amount::from(1000u64),
        }
    }

    #[test]
    fn borsh_round_trip() {
        let a = account();
        let bytes = borsh::to_vec(&a).unwrap();
        let back: Account = borsh::from_slice(&bytes).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn leaf_packing_layout() {
        let a = account();
        let packed = a.leaf_packing().unwrap();
        assert_eq!(&packed[..5], &[0, 0, 0, 0, 11]);
        assert_eq!(packed[63], 0xe8); // 1000 = 0x3e8
        assert_eq!(packed[62], 0x03);
        assert_eq!(&packed[64..96], &[7u8; 32]);
        assert_eq!(&packed[108..128], &[9u8; 20]);
        // Hash changes with the nonce.
        let mut b = a.clone();
        b.nonce = b.nonce.bump().unwrap();
        assert_ne!(a.leaf_hash().unwrap(), b.leaf_hash().unwrap());
    }

    #[test]
    fn leaf_packing_rejects_oversized_balances() {
        let mut a = account();
        a.balance = Account::max_balance();
        assert!(a.leaf_packing().is_ok());
        a.balance = Account::max_balance() + Amount::one();
        assert_eq!(a.leaf_packing().unwrap_err(), TxError::BalanceOverflow);
    }
}
