//! Bit-field packing for the two packed 256-bit quantities in a compact: the
//! lock id and the nonce.
//!
//! Lock id layout (msb first): 3-bit reset-period index, 93-bit allocator id,
//! 160-bit token lock id. Nonce layout: 160-bit sponsor address, 64-bit high
//! word, 32-bit low word. Extraction is mask-and-shift throughout; hex string
//! forms exist only at the wire boundary.

use alloy_primitives::{Address, U256};

/// Reset-period table in seconds, indexed by the 3-bit field at the top of a
/// lock id. Mirrors the on-chain table.
pub const RESET_PERIODS: [u64; 8] = [1, 15, 60, 600, 3900, 86400, 612_000, 2_592_000];

const ALLOCATOR_ID_BITS: usize = 93;
const TOKEN_LOCK_BITS: usize = 160;
const NONCE_FRAGMENT_BITS: usize = 96;
const HIGH_BITS: usize = 64;
const LOW_BITS: usize = 32;

fn low_mask(bits: usize) -> U256 {
    (U256::from(1u64) << bits) - U256::from(1u64)
}

/// The three bit-fields of a lock id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockIdFields {
    pub reset_period_index: u8,
    pub allocator_id: U256,
    pub token_lock_id: U256,
}

impl LockIdFields {
    /// Seconds after which the underlying resource lock can be reset.
    pub fn reset_period_seconds(&self) -> u64 {
        RESET_PERIODS[self.reset_period_index as usize]
    }
}

/// Splits a packed lock id into its fields. Total: any 256-bit value maps to
/// exactly one `LockIdFields`.
pub fn split_lock_id(id: U256) -> LockIdFields {
    let reset_period_index = (id >> (TOKEN_LOCK_BITS + ALLOCATOR_ID_BITS)).to::<u8>();
    let allocator_id = (id >> TOKEN_LOCK_BITS) & low_mask(ALLOCATOR_ID_BITS);
    let token_lock_id = id & low_mask(TOKEN_LOCK_BITS);
    LockIdFields {
        reset_period_index,
        allocator_id,
        token_lock_id,
    }
}

/// Packs lock-id fields back into their 256-bit form. Inputs wider than their
/// fields are masked down.
pub fn pack_lock_id(fields: &LockIdFields) -> U256 {
    (U256::from(fields.reset_period_index & 0x07) << (TOKEN_LOCK_BITS + ALLOCATOR_ID_BITS))
        | ((fields.allocator_id & low_mask(ALLOCATOR_ID_BITS)) << TOKEN_LOCK_BITS)
        | (fields.token_lock_id & low_mask(TOKEN_LOCK_BITS))
}

/// The fields of a packed nonce: the sponsor prefix and the 96-bit counter
/// fragment split into its high and low words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceFields {
    pub sponsor: Address,
    pub high: u64,
    pub low: u32,
}

/// Splits a 256-bit nonce into sponsor prefix, high word, and low word.
pub fn split_nonce(nonce: U256) -> NonceFields {
    let sponsor_word = nonce >> NONCE_FRAGMENT_BITS;
    let bytes = sponsor_word.to_be_bytes::<32>();
    let sponsor = Address::from_slice(&bytes[12..]);
    let high = ((nonce >> LOW_BITS) & low_mask(HIGH_BITS)).to::<u64>();
    let low = (nonce & low_mask(LOW_BITS)).to::<u32>();
    NonceFields { sponsor, high, low }
}

/// Packs a sponsor address and counter words into a 256-bit nonce.
pub fn pack_nonce(sponsor: Address, high: u64, low: u32) -> U256 {
    let prefix = U256::from_be_slice(sponsor.as_slice()) << NONCE_FRAGMENT_BITS;
    prefix | (U256::from(high) << LOW_BITS) | U256::from(low)
}

/// Renders a 256-bit value as 64 lower-case nibbles with no prefix.
pub fn hex64(value: U256) -> String {
    format!("{value:064x}")
}
