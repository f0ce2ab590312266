//! Wire and domain types for the allocator admission API.
//!
//! The key objects are [`CompactPayload`] (the sponsor-submitted message, all
//! fields as wire strings), [`Compact`] (the validated, canonical form that is
//! hashed, persisted, and returned to callers), and [`CompactRecord`] (an
//! admitted compact together with its claim hash and allocator signature).
//!
//! Integers travel as decimal strings except `id`, `nonce`, and `claimHash`,
//! which are 0x-prefixed 64-nibble hexadecimal. Addresses render EIP-55
//! checksummed. Signatures are 0x-prefixed 130-nibble hexadecimal.

use alloy_primitives::{Address, B256, U256, hex};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::ops::Add;
use std::str::FromStr;
use std::time::{SystemTime, SystemTimeError};

/// A numeric chain id in its canonical decimal form.
///
/// Parsing is strict: the input must round-trip (`render(parse(s)) == s`),
/// which rejects leading zeros, signs, whitespace, and empty strings, and the
/// value must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(u64);

impl ChainId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id {0:?}: expected a canonical positive decimal integer")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u64 = s.parse().map_err(|_| ChainIdFormatError(s.into()))?;
        if value == 0 || value.to_string() != s {
            return Err(ChainIdFormatError(s.into()));
        }
        Ok(ChainId(value))
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChainId::from_str(&s).map_err(Error::custom)
    }
}

/// An Ethereum address that renders and serializes with EIP-55 checksum
/// encoding, used for `arbiter` and `sponsor` fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChecksummedAddress(pub Address);

impl FromStr for ChecksummedAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address::from_str(s)?;
        Ok(Self(address))
    }
}

impl Display for ChecksummedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

impl Serialize for ChecksummedAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_checksum(None))
    }
}

impl<'de> Deserialize<'de> for ChecksummedAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(Error::custom)
    }
}

impl From<Address> for ChecksummedAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl From<ChecksummedAddress> for Address {
    fn from(value: ChecksummedAddress) -> Self {
        value.0
    }
}

/// A 256-bit unsigned integer carried on the wire as a decimal string.
///
/// Used for `amount`. Parsing rejects anything but ASCII digits and values
/// exceeding 2^256 − 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DecimalU256(pub U256);

static DECIMAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+$").expect("Invalid decimal regex"));

#[derive(Debug, thiserror::Error)]
#[error("Invalid decimal integer {0:?}")]
pub struct DecimalU256FormatError(String);

impl FromStr for DecimalU256 {
    type Err = DecimalU256FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !DECIMAL_REGEX.is_match(s) {
            return Err(DecimalU256FormatError(s.into()));
        }
        let value = U256::from_str_radix(s, 10).map_err(|_| DecimalU256FormatError(s.into()))?;
        Ok(DecimalU256(value))
    }
}

impl Display for DecimalU256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for DecimalU256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalU256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(Error::custom)
    }
}

impl From<DecimalU256> for U256 {
    fn from(value: DecimalU256) -> Self {
        value.0
    }
}

impl From<U256> for DecimalU256 {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

/// A 256-bit unsigned integer carried on the wire as 0x-prefixed hexadecimal,
/// left-padded to exactly 64 nibbles. Used for `id` and `nonce`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HexU256(pub U256);

static HEX_U256_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid hex u256 regex"));

#[derive(Debug, thiserror::Error)]
#[error("Invalid hex integer {0:?}: must be 0x-prefixed and 64 hex chars")]
pub struct HexU256FormatError(String);

impl FromStr for HexU256 {
    type Err = HexU256FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !HEX_U256_REGEX.is_match(s) {
            return Err(HexU256FormatError(s.into()));
        }
        let value = U256::from_str_radix(&s[2..], 16).map_err(|_| HexU256FormatError(s.into()))?;
        Ok(HexU256(value))
    }
}

impl Display for HexU256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:064x}", self.0)
    }
}

impl Serialize for HexU256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HexU256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(Error::custom)
    }
}

impl From<HexU256> for U256 {
    fn from(value: HexU256) -> Self {
        value.0
    }
}

impl From<U256> for HexU256 {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

/// Seconds since the Unix epoch, serialized as a stringified integer to avoid
/// loss of precision in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl FromStr for UnixTimestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(UnixTimestamp)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

/// A 65-byte ECDSA recoverable signature `(r, s, v)` over an EIP-712 digest.
/// Serialized as a 0x-prefixed hex string with 130 characters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

static SIG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("Invalid regex for EVM signature"));

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if !SIG_REGEX.is_match(&s) {
            return Err(Error::custom(
                "Invalid EVM signature format: must be 0x-prefixed and 130 hex chars",
            ));
        }
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| Error::custom("Failed to decode EVM signature hex string"))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| Error::custom("Signature must be exactly 65 bytes"))?;
        Ok(EvmSignature(array))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Display for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A compact as submitted by a sponsor, before validation.
///
/// Every field is kept as its wire string so the validator can report precise
/// per-field failures instead of a blanket deserialization error. `nonce` is
/// optional; a missing nonce asks the allocator to reserve the next free one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactPayload {
    pub arbiter: String,
    pub sponsor: String,
    #[serde(default)]
    pub nonce: Option<String>,
    pub expires: String,
    pub id: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_type_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<String>,
}

/// A sponsor submission: the compact plus the chain it targets.
///
/// `chain_id` stays a raw string here; canonical-form checking is the first
/// validation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactSubmission {
    pub chain_id: String,
    pub compact: CompactPayload,
}

/// The canonical, fully validated form of a compact. The nonce is always
/// resolved by this point, either sponsor-supplied or allocator-reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compact {
    pub arbiter: ChecksummedAddress,
    pub sponsor: ChecksummedAddress,
    pub nonce: HexU256,
    pub expires: UnixTimestamp,
    pub id: HexU256,
    pub amount: DecimalU256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_type_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<B256>,
}

/// An admitted compact as persisted and served back to sponsors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactRecord {
    pub chain_id: ChainId,
    pub compact: Compact,
    pub claim_hash: B256,
    pub signature: EvmSignature,
    pub created_at: UnixTimestamp,
}

/// Returned from a successful admission: the signed claim digest plus the
/// nonce that ended up inside the compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReceipt {
    pub claim_hash: B256,
    pub signature: EvmSignature,
    pub nonce: HexU256,
}
