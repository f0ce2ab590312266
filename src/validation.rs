//! The staged admission validator.
//!
//! Stages run in a fixed order and short-circuit on the first failure:
//! chain-id canonical form, structural checks, nonce ownership and freshness,
//! expiration window, reset-period coverage, and finally the allocation check
//! against the indexer snapshot. `now` is captured once per request and
//! reused by every temporal stage.

use alloy_primitives::{Address, B256, U256};
use tracing::instrument;

use crate::bits::{self, LockIdFields};
use crate::indexer::{IndexerApi, IndexerError, LockSnapshot, SnapshotQuery};
use crate::nonce::NonceSegment;
use crate::reconcile;
use crate::service::{AdmissionError, UpstreamSource};
use crate::storage::Database;
use crate::types::{
    ChainId, ChecksummedAddress, Compact, CompactPayload, CompactSubmission, DecimalU256, HexU256,
    UnixTimestamp,
};

/// Longest a compact may remain valid, in seconds.
pub const MAX_EXPIRY_AHEAD_SECS: u64 = 7_200;

/// Everything the validator needs besides the submission itself.
pub struct ValidationEnv<'a, I> {
    pub db: &'a Database,
    pub indexer: &'a I,
    /// The allocator's on-chain address, used in indexer queries.
    pub allocator: Address,
    /// Settlement grace period for the submission's chain, in seconds.
    pub finalization_threshold: u64,
}

/// The structural stage's output: every field parsed, nonce still optional.
#[derive(Debug, Clone)]
pub struct StructuredCompact {
    pub arbiter: ChecksummedAddress,
    pub sponsor: ChecksummedAddress,
    pub nonce: Option<U256>,
    pub expires: UnixTimestamp,
    pub id: U256,
    pub amount: U256,
    pub witness: Option<(String, B256)>,
}

/// A fully validated compact, ready to hash and sign, along with the
/// snapshot the allocation check ran against (the commit re-checks under its
/// own ledger view using the same snapshot).
#[derive(Debug, Clone)]
pub struct ValidatedCompact {
    pub chain_id: ChainId,
    pub compact: Compact,
    pub lock: LockIdFields,
    pub snapshot: LockSnapshot,
}

/// Stage 1: the chain id must be a canonical positive decimal integer.
pub fn assert_chain_id(raw: &str) -> Result<ChainId, AdmissionError> {
    raw.parse()
        .map_err(|_| AdmissionError::InvalidChainId(raw.to_string()))
}

/// Stage 2: field-level structure. Addresses must checksum-decode, numeric
/// fields must parse in their wire encodings, `expires` and `id` must be
/// positive, and the witness pair must be both-present or both-absent.
pub fn assert_structure(payload: &CompactPayload) -> Result<StructuredCompact, AdmissionError> {
    let arbiter: ChecksummedAddress =
        payload
            .arbiter
            .parse()
            .map_err(|_| AdmissionError::InvalidAddress {
                field: "arbiter",
                detail: payload.arbiter.clone(),
            })?;
    let sponsor: ChecksummedAddress =
        payload
            .sponsor
            .parse()
            .map_err(|_| AdmissionError::InvalidAddress {
                field: "sponsor",
                detail: payload.sponsor.clone(),
            })?;
    let nonce = payload
        .nonce
        .as_deref()
        .map(|raw| {
            raw.parse::<HexU256>()
                .map(Into::into)
                .map_err(|_| AdmissionError::InvalidNumeric {
                    field: "nonce",
                    detail: raw.to_string(),
                })
        })
        .transpose()?;
    let expires: UnixTimestamp =
        payload
            .expires
            .parse()
            .map_err(|_| AdmissionError::InvalidNumeric {
                field: "expires",
                detail: payload.expires.clone(),
            })?;
    if expires.seconds_since_epoch() == 0 {
        return Err(AdmissionError::InvalidNumeric {
            field: "expires",
            detail: "must be positive".into(),
        });
    }
    let id: U256 = payload
        .id
        .parse::<HexU256>()
        .map(Into::into)
        .map_err(|_| AdmissionError::InvalidNumeric {
            field: "id",
            detail: payload.id.clone(),
        })?;
    if id.is_zero() {
        return Err(AdmissionError::InvalidNumeric {
            field: "id",
            detail: "must be positive".into(),
        });
    }
    let amount: U256 = payload
        .amount
        .parse::<DecimalU256>()
        .map(Into::into)
        .map_err(|_| AdmissionError::InvalidAmount(payload.amount.clone()))?;
    let witness = match (&payload.witness_type_string, &payload.witness_hash) {
        (None, None) => None,
        (Some(type_string), Some(hash)) => {
            let hash: B256 = hash.parse().map_err(|_| {
                AdmissionError::WitnessInconsistent(format!("unparseable witness hash {hash:?}"))
            })?;
            Some((type_string.clone(), hash))
        }
        _ => {
            return Err(AdmissionError::WitnessInconsistent(
                "witnessTypeString and witnessHash must be supplied together".into(),
            ));
        }
    };
    Ok(StructuredCompact {
        arbiter,
        sponsor,
        nonce,
        expires,
        id,
        amount,
        witness,
    })
}

/// Stage 3: the resolved nonce must carry the sponsor in its top 160 bits and
/// its counter fragment must be unused for `(chain, sponsor)`.
pub async fn assert_nonce(
    db: &Database,
    chain_id: ChainId,
    sponsor: Address,
    resolved_nonce: U256,
) -> Result<NonceSegment, AdmissionError> {
    let fields = bits::split_nonce(resolved_nonce);
    if fields.sponsor != sponsor {
        return Err(AdmissionError::NonceMismatchSponsor);
    }
    let segment = NonceSegment::new(fields.high, fields.low);
    if db.is_nonce_used(chain_id, sponsor, segment).await? {
        return Err(AdmissionError::NonceUsed);
    }
    Ok(segment)
}

/// Stage 4: `now < expires ≤ now + 7200`.
pub fn assert_expiry(now: UnixTimestamp, expires: UnixTimestamp) -> Result<(), AdmissionError> {
    if expires <= now {
        return Err(AdmissionError::Expired {
            expires: expires.seconds_since_epoch(),
            now: now.seconds_since_epoch(),
        });
    }
    if expires > now + MAX_EXPIRY_AHEAD_SECS {
        return Err(AdmissionError::ExpiryTooFar {
            expires: expires.seconds_since_epoch(),
            limit: (now + MAX_EXPIRY_AHEAD_SECS).seconds_since_epoch(),
        });
    }
    Ok(())
}

/// Stage 5: the lock's reset period must cover the compact's lifetime.
pub fn assert_lock_schedule(
    now: UnixTimestamp,
    lock: &LockIdFields,
    expires: UnixTimestamp,
) -> Result<(), AdmissionError> {
    if now + lock.reset_period_seconds() < expires {
        return Err(AdmissionError::ResetPeriodTooShort {
            reset_period: lock.reset_period_seconds(),
        });
    }
    Ok(())
}

/// Stage 6: the allocation check. Fetches the lock snapshot, requires no
/// forced withdrawal and a matching allocator id, then asks the reconciler
/// whether the remaining allocatable balance covers the new amount. Returns
/// the snapshot for the commit-time re-check.
#[instrument(skip_all, err)]
pub async fn assert_allocation<I: IndexerApi>(
    env: &ValidationEnv<'_, I>,
    chain_id: ChainId,
    sponsor: Address,
    lock: &LockIdFields,
    amount: U256,
    now: UnixTimestamp,
) -> Result<LockSnapshot, AdmissionError> {
    let query = SnapshotQuery {
        allocator: env.allocator,
        sponsor,
        token_lock_id: lock.token_lock_id,
        chain_id,
    };
    let snapshot = env
        .indexer
        .lock_snapshot(&query)
        .await
        .map_err(|error| match error {
            IndexerError::LockNotFound => AdmissionError::LockNotFound,
            IndexerError::UnsupportedChain => AdmissionError::AllocatorMismatch {
                ours: lock.allocator_id,
                registered: None,
            },
            other => AdmissionError::Upstream {
                source: UpstreamSource::Indexer,
                detail: other.to_string(),
            },
        })?;
    if snapshot.withdrawal_status != 0 {
        return Err(AdmissionError::ForcedWithdrawalEnabled {
            status: snapshot.withdrawal_status,
        });
    }
    if snapshot.allocator_id != lock.allocator_id {
        return Err(AdmissionError::AllocatorMismatch {
            ours: lock.allocator_id,
            registered: Some(snapshot.allocator_id),
        });
    }
    let entries = env
        .db
        .ledger_entries(chain_id, sponsor, lock.token_lock_id)
        .await?;
    let balance =
        reconcile::allocatable_balance(&snapshot, &entries, now, env.finalization_threshold);
    if !balance.covers(amount) {
        return Err(AdmissionError::InsufficientBalance {
            have: balance.remaining,
            need: amount,
        });
    }
    Ok(snapshot)
}

/// Runs every stage against a submission whose nonce has already been
/// resolved. Returns the canonical compact on success.
#[instrument(skip_all, err, fields(chain_id = %submission.chain_id))]
pub async fn validate_admission<I: IndexerApi>(
    env: &ValidationEnv<'_, I>,
    submission: &CompactSubmission,
    resolved_nonce: U256,
    now: UnixTimestamp,
) -> Result<ValidatedCompact, AdmissionError> {
    let chain_id = assert_chain_id(&submission.chain_id)?;
    let structured = assert_structure(&submission.compact)?;
    assert_nonce(env.db, chain_id, structured.sponsor.into(), resolved_nonce).await?;
    assert_expiry(now, structured.expires)?;
    let lock = bits::split_lock_id(structured.id);
    assert_lock_schedule(now, &lock, structured.expires)?;
    let snapshot = assert_allocation(
        env,
        chain_id,
        structured.sponsor.into(),
        &lock,
        structured.amount,
        now,
    )
    .await?;

    let (witness_type_string, witness_hash) = match structured.witness {
        Some((type_string, hash)) => (Some(type_string), Some(hash)),
        None => (None, None),
    };
    Ok(ValidatedCompact {
        chain_id,
        compact: Compact {
            arbiter: structured.arbiter,
            sponsor: structured.sponsor,
            nonce: HexU256(resolved_nonce),
            expires: structured.expires,
            id: HexU256(structured.id),
            amount: DecimalU256(structured.amount),
            witness_type_string,
            witness_hash,
        },
        lock,
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::LockSnapshot;
    use std::collections::HashSet;
    use std::str::FromStr;

    const SPONSOR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const ARBITER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
    const NOW: UnixTimestamp = UnixTimestamp(1_700_000_000);

    struct StaticIndexer(LockSnapshot);

    impl IndexerApi for StaticIndexer {
        async fn lock_snapshot(
            &self,
            _query: &SnapshotQuery,
        ) -> Result<LockSnapshot, IndexerError> {
            Ok(self.0.clone())
        }
    }

    struct FailingIndexer(fn() -> IndexerError);

    impl IndexerApi for FailingIndexer {
        async fn lock_snapshot(
            &self,
            _query: &SnapshotQuery,
        ) -> Result<LockSnapshot, IndexerError> {
            Err((self.0)())
        }
    }

    fn sponsor() -> Address {
        Address::from_str(SPONSOR).unwrap()
    }

    fn healthy_snapshot() -> LockSnapshot {
        LockSnapshot {
            balance: U256::from(10u64) * U256::from(10u64).pow(U256::from(18u64)),
            withdrawal_status: 0,
            allocator_id: U256::from(1u64),
            pending_deltas: vec![],
            finalized_claims: HashSet::new(),
        }
    }

    fn lock_id() -> U256 {
        (U256::from(7u64) << 253) | (U256::from(1u64) << 160)
    }

    fn payload() -> CompactPayload {
        CompactPayload {
            arbiter: ARBITER.into(),
            sponsor: SPONSOR.into(),
            nonce: None,
            expires: (NOW.0 + 3_600).to_string(),
            id: format!("0x{:064x}", lock_id()),
            amount: "1000000000000000000".into(),
            witness_type_string: None,
            witness_hash: None,
        }
    }

    fn submission() -> CompactSubmission {
        CompactSubmission {
            chain_id: "1".into(),
            compact: payload(),
        }
    }

    fn generated_nonce() -> U256 {
        bits::pack_nonce(sponsor(), 0, 0)
    }

    #[test]
    fn chain_id_stage_rejects_non_canonical() {
        assert!(assert_chain_id("1").is_ok());
        assert!(matches!(
            assert_chain_id("01"),
            Err(AdmissionError::InvalidChainId(_))
        ));
        assert!(matches!(
            assert_chain_id(" 1"),
            Err(AdmissionError::InvalidChainId(_))
        ));
    }

    #[test]
    fn structure_stage_catches_each_field() {
        let mut bad = payload();
        bad.arbiter = "not-an-address".into();
        assert!(matches!(
            assert_structure(&bad),
            Err(AdmissionError::InvalidAddress { field: "arbiter", .. })
        ));

        let mut bad = payload();
        bad.amount = "12.5".into();
        assert!(matches!(
            assert_structure(&bad),
            Err(AdmissionError::InvalidAmount(_))
        ));

        let mut bad = payload();
        bad.id = "0x0".into();
        assert!(matches!(
            assert_structure(&bad),
            Err(AdmissionError::InvalidNumeric { field: "id", .. })
        ));

        let mut bad = payload();
        bad.expires = "0".into();
        assert!(matches!(
            assert_structure(&bad),
            Err(AdmissionError::InvalidNumeric { field: "expires", .. })
        ));
    }

    #[test]
    fn witness_must_be_all_or_nothing() {
        let mut bad = payload();
        bad.witness_type_string = Some("Mandate(uint256 deadline)".into());
        assert!(matches!(
            assert_structure(&bad),
            Err(AdmissionError::WitnessInconsistent(_))
        ));

        let mut good = payload();
        good.witness_type_string = Some("Mandate(uint256 deadline)".into());
        good.witness_hash = Some(format!("0x{}", "ab".repeat(32)));
        let structured = assert_structure(&good).unwrap();
        assert!(structured.witness.is_some());
    }

    #[tokio::test]
    async fn nonce_stage_enforces_sponsor_prefix() {
        let db = Database::open_in_memory().unwrap();
        // top 160 bits all zero: not the sponsor
        let foreign = bits::pack_nonce(Address::ZERO, 0, 0);
        let result = assert_nonce(&db, ChainId::new(1), sponsor(), foreign).await;
        assert!(matches!(result, Err(AdmissionError::NonceMismatchSponsor)));
    }

    #[test]
    fn expiry_window_bounds() {
        // expires == now rejected
        assert!(matches!(
            assert_expiry(NOW, NOW),
            Err(AdmissionError::Expired { .. })
        ));
        // upper bound inclusive
        assert!(assert_expiry(NOW, NOW + MAX_EXPIRY_AHEAD_SECS).is_ok());
        assert!(matches!(
            assert_expiry(NOW, NOW + MAX_EXPIRY_AHEAD_SECS + 1),
            Err(AdmissionError::ExpiryTooFar { .. })
        ));
    }

    #[test]
    fn reset_period_must_cover_lifetime() {
        // index 0 is a one-second reset period
        let short = bits::split_lock_id(U256::from(1u64) << 160);
        assert!(matches!(
            assert_lock_schedule(NOW, &short, NOW + 3_600),
            Err(AdmissionError::ResetPeriodTooShort { .. })
        ));
        let long = bits::split_lock_id(lock_id());
        assert!(assert_lock_schedule(NOW, &long, NOW + 3_600).is_ok());
    }

    #[tokio::test]
    async fn full_pipeline_happy_path() {
        let db = Database::open_in_memory().unwrap();
        let indexer = StaticIndexer(healthy_snapshot());
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let validated = validate_admission(&env, &submission(), generated_nonce(), NOW)
            .await
            .unwrap();
        assert_eq!(validated.chain_id, ChainId::new(1));
        assert_eq!(
            <U256 as From<HexU256>>::from(validated.compact.nonce),
            generated_nonce()
        );
        assert_eq!(validated.lock.allocator_id, U256::from(1u64));
    }

    #[tokio::test]
    async fn forced_withdrawal_blocks_admission() {
        let db = Database::open_in_memory().unwrap();
        let mut snapshot = healthy_snapshot();
        snapshot.withdrawal_status = 1;
        let indexer = StaticIndexer(snapshot);
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let result = validate_admission(&env, &submission(), generated_nonce(), NOW).await;
        assert!(matches!(
            result,
            Err(AdmissionError::ForcedWithdrawalEnabled { status: 1 })
        ));
    }

    #[tokio::test]
    async fn allocator_id_mismatch_blocks_admission() {
        let db = Database::open_in_memory().unwrap();
        let mut snapshot = healthy_snapshot();
        snapshot.allocator_id = U256::from(2u64);
        let indexer = StaticIndexer(snapshot);
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let result = validate_admission(&env, &submission(), generated_nonce(), NOW).await;
        assert!(matches!(
            result,
            Err(AdmissionError::AllocatorMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn insufficient_balance_reports_have_and_need() {
        let db = Database::open_in_memory().unwrap();
        let mut snapshot = healthy_snapshot();
        snapshot.balance = U256::from(500_000_000_000_000_000u64);
        let indexer = StaticIndexer(snapshot);
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let result = validate_admission(&env, &submission(), generated_nonce(), NOW).await;
        match result {
            Err(AdmissionError::InsufficientBalance { have, need }) => {
                assert_eq!(have, U256::from(500_000_000_000_000_000u64));
                assert_eq!(need, U256::from(1_000_000_000_000_000_000u64));
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn indexer_failures_stay_distinct_from_validation() {
        let db = Database::open_in_memory().unwrap();
        let indexer = FailingIndexer(|| IndexerError::LockNotFound);
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let result = validate_admission(&env, &submission(), generated_nonce(), NOW).await;
        assert!(matches!(result, Err(AdmissionError::LockNotFound)));

        let indexer = FailingIndexer(|| IndexerError::Malformed("boom".into()));
        let env = ValidationEnv {
            db: &db,
            indexer: &indexer,
            allocator: Address::ZERO,
            finalization_threshold: 25,
        };
        let result = validate_admission(&env, &submission(), generated_nonce(), NOW).await;
        assert!(matches!(
            result,
            Err(AdmissionError::Upstream {
                source: UpstreamSource::Indexer,
                ..
            })
        ));
    }
}
