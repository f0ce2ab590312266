//! Top-level admission service: validate, hash, sign, persist.
//!
//! [`Allocator`] owns the full pipeline for one admission. Nonce reservations
//! are tentative until the final commit; the only durable claim on a nonce is
//! the ledger insert, and a lost race there restarts the reservation a
//! bounded number of times before giving up with `Contention`.

use alloy_primitives::{Address, B256, U256};
use std::sync::Arc;
use std::time::SystemTimeError;
use tracing::instrument;

use crate::bits;
use crate::hashing;
use crate::indexer::IndexerApi;
use crate::signer::{DigestSigner, SigningError};
use crate::storage::{AllocationGuard, Database, StorageError};
use crate::types::{
    AdmissionReceipt, ChainId, CompactRecord, CompactSubmission, UnixTimestamp,
};
use crate::validation::{self, ValidationEnv};

/// Bounded retry count for nonce-reservation races. Contention is
/// address-scoped, so plain re-reservation without backoff suffices.
const MAX_NONCE_ATTEMPTS: u32 = 3;

/// Which upstream dependency failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSource {
    Indexer,
    Storage,
    Signer,
    Clock,
}

impl std::fmt::Display for UpstreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpstreamSource::Indexer => "indexer",
            UpstreamSource::Storage => "storage",
            UpstreamSource::Signer => "signer",
            UpstreamSource::Clock => "clock",
        };
        write!(f, "{name}")
    }
}

impl std::error::Error for UpstreamSource {}

/// Everything that can go wrong while admitting, looking up, or listing
/// compacts. Validation failures surface verbatim to the caller; `NonceTaken`
/// is internal and always either retried or translated before it escapes.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invalid chain id {0:?}: not a canonical positive integer")]
    InvalidChainId(String),
    #[error("Invalid {field} address: {detail}")]
    InvalidAddress {
        field: &'static str,
        detail: String,
    },
    #[error("Invalid amount {0:?}: expected a decimal integer")]
    InvalidAmount(String),
    #[error("Invalid {field}: {detail}")]
    InvalidNumeric {
        field: &'static str,
        detail: String,
    },
    #[error("Witness fields inconsistent: {0}")]
    WitnessInconsistent(String),
    #[error("Compact expired: expires {expires} is not after now {now}")]
    Expired { expires: u64, now: u64 },
    #[error("Expiration too far ahead: {expires} exceeds limit {limit}")]
    ExpiryTooFar { expires: u64, limit: u64 },
    #[error("Reset period of {reset_period}s ends before the compact expires")]
    ResetPeriodTooShort { reset_period: u64 },
    #[error("Nonce sponsor prefix does not match the compact sponsor")]
    NonceMismatchSponsor,
    #[error("Nonce has already been used for this sponsor and chain")]
    NonceUsed,
    /// Internal: a concurrent admission inserted the same tuple first.
    #[error("Nonce reservation lost a race")]
    NonceTaken,
    #[error("No resource lock found for this sponsor and chain")]
    LockNotFound,
    #[error("Forced withdrawal enabled on the resource lock (status {status})")]
    ForcedWithdrawalEnabled { status: u8 },
    #[error("Allocator id mismatch: lock carries {ours}, indexer reports {registered:?}")]
    AllocatorMismatch {
        ours: U256,
        registered: Option<U256>,
    },
    #[error("Insufficient allocatable balance: have {have}, need {need}")]
    InsufficientBalance { have: U256, need: U256 },
    #[error("Authenticated sponsor does not match the compact sponsor")]
    Unauthorised,
    #[error("Nonce reservation retries exhausted")]
    Contention,
    #[error("Upstream {source} failure: {detail}")]
    Upstream {
        source: UpstreamSource,
        detail: String,
    },
}

impl From<StorageError> for AdmissionError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NonceTaken => AdmissionError::NonceTaken,
            StorageError::OverAllocated { have, need } => {
                AdmissionError::InsufficientBalance { have, need }
            }
            other => AdmissionError::Upstream {
                source: UpstreamSource::Storage,
                detail: other.to_string(),
            },
        }
    }
}

impl From<SigningError> for AdmissionError {
    fn from(error: SigningError) -> Self {
        AdmissionError::Upstream {
            source: UpstreamSource::Signer,
            detail: error.to_string(),
        }
    }
}

impl From<SystemTimeError> for AdmissionError {
    fn from(error: SystemTimeError) -> Self {
        AdmissionError::Upstream {
            source: UpstreamSource::Clock,
            detail: error.to_string(),
        }
    }
}

/// The admission interface the transport layer consumes.
pub trait AllocatorApi {
    type Error: std::fmt::Debug + std::fmt::Display;

    /// Validates, signs, and records a compact on behalf of the
    /// authenticated sponsor.
    fn admit(
        &self,
        submission: &CompactSubmission,
        authenticated_sponsor: Address,
    ) -> impl Future<Output = Result<AdmissionReceipt, Self::Error>> + Send;

    /// Point lookup of an admitted compact.
    fn lookup(
        &self,
        chain_id: ChainId,
        claim_hash: B256,
    ) -> impl Future<Output = Result<Option<CompactRecord>, Self::Error>> + Send;

    /// Every compact admitted for a sponsor, newest first.
    fn list_by_sponsor(
        &self,
        sponsor: Address,
    ) -> impl Future<Output = Result<Vec<CompactRecord>, Self::Error>> + Send;
}

impl<T: AllocatorApi + Sync> AllocatorApi for Arc<T> {
    type Error = T::Error;

    fn admit(
        &self,
        submission: &CompactSubmission,
        authenticated_sponsor: Address,
    ) -> impl Future<Output = Result<AdmissionReceipt, Self::Error>> + Send {
        self.as_ref().admit(submission, authenticated_sponsor)
    }

    fn lookup(
        &self,
        chain_id: ChainId,
        claim_hash: B256,
    ) -> impl Future<Output = Result<Option<CompactRecord>, Self::Error>> + Send {
        self.as_ref().lookup(chain_id, claim_hash)
    }

    fn list_by_sponsor(
        &self,
        sponsor: Address,
    ) -> impl Future<Output = Result<Vec<CompactRecord>, Self::Error>> + Send {
        self.as_ref().list_by_sponsor(sponsor)
    }
}

/// Per-chain settlement grace periods, with a default for chains without an
/// explicit entry.
#[derive(Debug, Clone)]
pub struct FinalizationThresholds {
    default_secs: u64,
    overrides: std::collections::HashMap<u64, u64>,
}

impl FinalizationThresholds {
    pub fn new(default_secs: u64, overrides: std::collections::HashMap<u64, u64>) -> Self {
        Self {
            default_secs,
            overrides,
        }
    }

    pub fn for_chain(&self, chain_id: ChainId) -> u64 {
        self.overrides
            .get(&chain_id.value())
            .copied()
            .unwrap_or(self.default_secs)
    }
}

/// The concrete admission service, generic over its two external seams so
/// tests can swap in doubles.
#[derive(Debug)]
pub struct Allocator<I, S> {
    db: Arc<Database>,
    indexer: I,
    signer: S,
    thresholds: FinalizationThresholds,
}

impl<I, S> Allocator<I, S>
where
    I: IndexerApi,
    S: DigestSigner,
{
    pub fn new(
        db: Arc<Database>,
        indexer: I,
        signer: S,
        thresholds: FinalizationThresholds,
    ) -> Self {
        Self {
            db,
            indexer,
            signer,
            thresholds,
        }
    }

    /// One pass through the pipeline with one nonce reservation. Returns
    /// `NonceTaken` only for races on a generated nonce that are worth
    /// retrying upstream.
    async fn try_admit(
        &self,
        submission: &CompactSubmission,
        chain_id: ChainId,
        sponsor: Address,
        explicit_nonce: Option<U256>,
        now: UnixTimestamp,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        // Reservation is tentative: nothing is written until the final commit.
        let resolved_nonce = match explicit_nonce {
            Some(nonce) => nonce,
            None => {
                let segment = self.db.next_nonce(chain_id, sponsor).await?;
                bits::pack_nonce(sponsor, segment.high, segment.low)
            }
        };

        let finalization_threshold = self.thresholds.for_chain(chain_id);
        let env = ValidationEnv {
            db: self.db.as_ref(),
            indexer: &self.indexer,
            allocator: self.signer.signer_address(),
            finalization_threshold,
        };
        let validated = validation::validate_admission(&env, submission, resolved_nonce, now).await?;

        let claim_hash = hashing::claim_hash(&validated.compact, validated.chain_id);
        let signature = self.signer.sign_digest(claim_hash).await?;
        let record = CompactRecord {
            chain_id: validated.chain_id,
            compact: validated.compact,
            claim_hash,
            signature,
            created_at: now,
        };
        let guard = AllocationGuard {
            snapshot: &validated.snapshot,
            now,
            finalization_threshold,
        };
        match self.db.record_admission(&record, &guard).await {
            Ok(()) => Ok(AdmissionReceipt {
                claim_hash,
                signature,
                nonce: record.compact.nonce,
            }),
            // An explicit nonce that loses the insert race is simply used;
            // only generated reservations are retryable.
            Err(StorageError::NonceTaken) if explicit_nonce.is_some() => {
                Err(AdmissionError::NonceUsed)
            }
            Err(other) => Err(other.into()),
        }
    }
}

impl<I, S> AllocatorApi for Allocator<I, S>
where
    I: IndexerApi,
    S: DigestSigner,
{
    type Error = AdmissionError;

    #[instrument(skip_all, err, fields(chain_id = %submission.chain_id, sponsor = %authenticated_sponsor))]
    async fn admit(
        &self,
        submission: &CompactSubmission,
        authenticated_sponsor: Address,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        let now = UnixTimestamp::try_now()?;
        let chain_id = validation::assert_chain_id(&submission.chain_id)?;
        let structured = validation::assert_structure(&submission.compact)?;
        let sponsor: Address = structured.sponsor.into();
        if sponsor != authenticated_sponsor {
            return Err(AdmissionError::Unauthorised);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .try_admit(submission, chain_id, sponsor, structured.nonce, now)
                .await
            {
                Err(AdmissionError::NonceTaken) if attempts < MAX_NONCE_ATTEMPTS => {
                    tracing::debug!(attempts, "nonce reservation raced, retrying");
                }
                Err(AdmissionError::NonceTaken) => return Err(AdmissionError::Contention),
                other => return other,
            }
        }
    }

    async fn lookup(
        &self,
        chain_id: ChainId,
        claim_hash: B256,
    ) -> Result<Option<CompactRecord>, AdmissionError> {
        Ok(self.db.compact_by_claim_hash(chain_id, claim_hash).await?)
    }

    async fn list_by_sponsor(&self, sponsor: Address) -> Result<Vec<CompactRecord>, AdmissionError> {
        Ok(self.db.compacts_by_sponsor(sponsor).await?)
    }
}
