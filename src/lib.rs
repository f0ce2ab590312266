//! Admission core of a resource-lock allocator for The Compact.
//!
//! Sponsors hold on-chain resource locks and ask this service to co-sign
//! structured intent messages ("compacts"). The allocator's signature asserts
//! that the sponsor owns sufficient unclaimed balance in the referenced lock,
//! that the compact's nonce has never been authorised before, and that
//! structural, expiration, and lock-policy constraints hold. Arbiters rely on
//! the co-signature to release funds.
//!
//! # Modules
//!
//! - [`bits`] — bit-field packing of the 256-bit lock id and nonce.
//! - [`hashing`] — EIP-712 domain/struct hashing producing claim digests.
//! - [`signer`] — the digest→signature seam and its local-key implementation.
//! - [`nonce`] — gap search over the sparse used-nonce set.
//! - [`storage`] — embedded SQLite ledger of consumed nonces and admitted
//!   compacts.
//! - [`indexer`] — typed query interface to the chain indexer.
//! - [`reconcile`] — allocatable-balance arithmetic over indexer snapshots.
//! - [`validation`] — the staged admission validator.
//! - [`service`] — top-level admission: validate → hash → sign → persist.
//! - [`handlers`] — HTTP endpoints over the admission service.
//! - [`config`] / [`telemetry`] / [`sig_down`] — server plumbing.

pub mod bits;
pub mod config;
pub mod handlers;
pub mod hashing;
pub mod indexer;
pub mod nonce;
pub mod reconcile;
pub mod service;
pub mod sig_down;
pub mod signer;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod validation;
