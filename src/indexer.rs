//! Strongly-typed client for the chain indexer.
//!
//! The indexer is the allocator's single source of on-chain truth: lock
//! balances, forced-withdrawal status, pending balance deltas, and finalized
//! claims all come from one query per admission. The [`IndexerApi`] trait is
//! the seam; [`HttpIndexer`] is the production implementation speaking
//! GraphQL over HTTP.

use alloy_primitives::{Address, B256, I256, U256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::instrument;
use url::Url;

use crate::types::{ChainId, DecimalU256};

/// Errors from the indexer boundary. `LockNotFound` and `UnsupportedChain`
/// are data-level conditions the validator maps to its own taxonomy;
/// `Transport` and `Malformed` are upstream failures and must never be
/// conflated with validation failure.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("Indexer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Indexer returned a malformed response: {0}")]
    Malformed(String),
    #[error("No resource lock for the queried account")]
    LockNotFound,
    #[error("Allocator has no supported-chain entry for the queried chain")]
    UnsupportedChain,
}

/// Identifies one resource lock of one sponsor under one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub allocator: Address,
    pub sponsor: Address,
    pub token_lock_id: U256,
    pub chain_id: ChainId,
}

/// A point-in-time view of a resource lock as reported by the indexer.
#[derive(Debug, Clone)]
pub struct LockSnapshot {
    /// Lock balance in the token's atomic units.
    pub balance: U256,
    /// Non-zero when a forced withdrawal is enabled or pending.
    pub withdrawal_status: u8,
    /// The on-chain allocator id registered for the queried chain.
    pub allocator_id: U256,
    /// In-flight balance changes not yet folded into `balance`.
    pub pending_deltas: Vec<I256>,
    /// Claim hashes the indexer has observed as settled.
    pub finalized_claims: HashSet<B256>,
}

/// Narrow query interface to the indexer.
pub trait IndexerApi: Send + Sync {
    fn lock_snapshot(
        &self,
        query: &SnapshotQuery,
    ) -> impl Future<Output = Result<LockSnapshot, IndexerError>> + Send;
}

const LOCK_STATE_QUERY: &str = r#"
query LockState($allocator: String!, $sponsor: String!, $lockId: BigInt!, $chainId: BigInt!) {
  account(address: $sponsor) {
    resourceLocks(lockId: $lockId, chainId: $chainId) {
      balance
      withdrawalStatus
    }
    claims(allocator: $allocator, chainId: $chainId) {
      claimHash
    }
  }
  allocator(address: $allocator) {
    supportedChains(chainId: $chainId) {
      allocatorId
    }
  }
  accountDeltas(address: $sponsor, lockId: $lockId, chainId: $chainId) {
    delta
  }
}
"#;

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<LockStateData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockStateData {
    account: Option<AccountSection>,
    allocator: Option<AllocatorSection>,
    #[serde(default)]
    account_deltas: Vec<AccountDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSection {
    #[serde(default)]
    resource_locks: Vec<ResourceLock>,
    #[serde(default)]
    claims: Vec<Claim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLock {
    balance: DecimalU256,
    withdrawal_status: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claim {
    claim_hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocatorSection {
    #[serde(default)]
    supported_chains: Vec<SupportedChain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SupportedChain {
    allocator_id: DecimalU256,
}

#[derive(Debug, Deserialize)]
struct AccountDelta {
    delta: String,
}

impl LockStateData {
    fn into_snapshot(self) -> Result<LockSnapshot, IndexerError> {
        let account = self.account.ok_or(IndexerError::LockNotFound)?;
        let lock = account
            .resource_locks
            .into_iter()
            .next()
            .ok_or(IndexerError::LockNotFound)?;
        let allocator_id = self
            .allocator
            .and_then(|allocator| allocator.supported_chains.into_iter().next())
            .ok_or(IndexerError::UnsupportedChain)?
            .allocator_id;
        let pending_deltas = self
            .account_deltas
            .iter()
            .map(|entry| {
                I256::from_dec_str(&entry.delta)
                    .map_err(|_| IndexerError::Malformed(format!("bad delta {:?}", entry.delta)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let finalized_claims = account
            .claims
            .into_iter()
            .map(|claim| claim.claim_hash)
            .collect();
        Ok(LockSnapshot {
            balance: lock.balance.into(),
            withdrawal_status: lock.withdrawal_status,
            allocator_id: allocator_id.into(),
            pending_deltas,
            finalized_claims,
        })
    }
}

/// GraphQL-over-HTTP indexer client.
#[derive(Debug, Clone)]
pub struct HttpIndexer {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpIndexer {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

impl IndexerApi for HttpIndexer {
    #[instrument(skip_all, err, fields(
        sponsor = %query.sponsor,
        chain_id = %query.chain_id,
        lock_id = %query.token_lock_id,
    ))]
    async fn lock_snapshot(&self, query: &SnapshotQuery) -> Result<LockSnapshot, IndexerError> {
        let request = GraphQlRequest {
            query: LOCK_STATE_QUERY,
            variables: json!({
                "allocator": query.allocator.to_checksum(None),
                "sponsor": query.sponsor.to_checksum(None),
                "lockId": query.token_lock_id.to_string(),
                "chainId": query.chain_id.to_string(),
            }),
        };
        let response: GraphQlResponse = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.errors.first() {
            return Err(IndexerError::Malformed(error.message.clone()));
        }
        let data = response
            .data
            .ok_or_else(|| IndexerError::Malformed("response without data".into()))?;
        data.into_snapshot()
    }
}
