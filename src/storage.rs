//! Embedded SQLite persistence: the used-nonce ledger and the compact log.
//!
//! Two tables back the admission pipeline. `nonces` holds one row per
//! consumed `(chain, sponsor, high, low)` tuple; its primary key is the only
//! authoritative concurrency contract in the system, turning a racing insert
//! into a constraint violation the service retries. `compacts` is the
//! append-only log of admitted compacts, unique per `(chain, claim_hash)`.
//!
//! One connection serves the process, behind an async mutex; every statement
//! runs while the lock is held, and the nonce + compact commit of an
//! admission shares a single transaction.

use alloy_primitives::{Address, B256, U256};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::bits;
use crate::indexer::LockSnapshot;
use crate::nonce::{self, NonceSegment};
use crate::reconcile::{self, LedgerEntry};
use crate::types::{ChainId, CompactRecord, EvmSignature, UnixTimestamp};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The nonce tuple was inserted by a concurrent admission first.
    #[error("Nonce already consumed for this sponsor and chain")]
    NonceTaken,
    /// A compact with this claim hash is already on record for the chain.
    #[error("Compact {0} already recorded")]
    DuplicateCompact(B256),
    /// The commit-time balance re-check found the lock over-committed.
    #[error("Allocatable balance exhausted at commit: have {have}, need {need}")]
    OverAllocated { have: U256, need: U256 },
    #[error("Database failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Inputs for re-running the allocation check inside the commit transaction.
///
/// The indexer snapshot is the one validation already fetched; only the local
/// ledger is re-read, under the same view the inserts commit against, so two
/// racing admissions can never jointly overdraw a lock.
pub struct AllocationGuard<'a> {
    pub snapshot: &'a LockSnapshot,
    pub now: UnixTimestamp,
    pub finalization_threshold: u64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nonces (
    chain_id   TEXT    NOT NULL,
    sponsor    BLOB    NOT NULL,
    high       INTEGER NOT NULL,
    low        INTEGER NOT NULL,
    PRIMARY KEY (chain_id, sponsor, high, low)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS compacts (
    chain_id   TEXT    NOT NULL,
    sponsor    BLOB    NOT NULL,
    lock_id    BLOB    NOT NULL,
    amount     TEXT    NOT NULL,
    expires    INTEGER NOT NULL,
    claim_hash BLOB    NOT NULL,
    compact    TEXT    NOT NULL,
    signature  BLOB    NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (chain_id, claim_hash)
);

CREATE INDEX IF NOT EXISTS compacts_by_sponsor
    ON compacts (sponsor, created_at DESC);
CREATE INDEX IF NOT EXISTS compacts_by_lock
    ON compacts (chain_id, sponsor, lock_id);
"#;

/// Handle to the embedded store.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (creating if needed) the database file and applies the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An ephemeral in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The smallest free nonce segment for `(chain, sponsor)`.
    ///
    /// The used set is read in one ordered statement, so the gap search sees
    /// a single consistent snapshot; a racing reservation surfaces later as
    /// [`StorageError::NonceTaken`] at commit time, never as a silent
    /// double-issue.
    #[instrument(skip(self), level = "debug")]
    pub async fn next_nonce(
        &self,
        chain_id: ChainId,
        sponsor: Address,
    ) -> Result<NonceSegment, StorageError> {
        let conn = self.conn.lock().await;
        let mut statement = conn.prepare(
            "SELECT high, low FROM nonces
             WHERE chain_id = ?1 AND sponsor = ?2
             ORDER BY high ASC, low ASC",
        )?;
        let used = statement
            .query_map(
                params![chain_id.to_string(), sponsor.as_slice()],
                |row| {
                    let high: i64 = row.get(0)?;
                    let low: i64 = row.get(1)?;
                    Ok(NonceSegment::new(high as u64, low as u32))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nonce::first_free(used))
    }

    /// Membership check on the 4-tuple.
    pub async fn is_nonce_used(
        &self,
        chain_id: ChainId,
        sponsor: Address,
        segment: NonceSegment,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nonces
                 WHERE chain_id = ?1 AND sponsor = ?2 AND high = ?3 AND low = ?4",
                params![
                    chain_id.to_string(),
                    sponsor.as_slice(),
                    segment.high as i64,
                    segment.low as i64
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Commits an admission: consumes the nonce and appends the compact in
    /// one transaction, so a crash can never leave one without the other.
    ///
    /// The allocation check re-runs against the ledger as seen by this
    /// transaction before the compact lands; validation's earlier check can
    /// be stale by the time concurrent admissions reach their commits.
    #[instrument(skip_all, err, fields(chain_id = %record.chain_id, claim_hash = %record.claim_hash))]
    pub async fn record_admission(
        &self,
        record: &CompactRecord,
        guard: &AllocationGuard<'_>,
    ) -> Result<(), StorageError> {
        let sponsor: Address = record.compact.sponsor.into();
        let segment = {
            let fields = bits::split_nonce(record.compact.nonce.into());
            NonceSegment::new(fields.high, fields.low)
        };
        let lock_id = bits::split_lock_id(record.compact.id.into()).token_lock_id;
        let amount: U256 = record.compact.amount.into();
        let compact_json = serde_json::to_string(&record.compact)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO nonces (chain_id, sponsor, high, low) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.chain_id.to_string(),
                sponsor.as_slice(),
                segment.high as i64,
                segment.low as i64
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StorageError::NonceTaken
            } else {
                StorageError::Sqlite(e)
            }
        })?;

        let entries = ledger_entries_in(&tx, record.chain_id, sponsor, lock_id)?;
        let balance = reconcile::allocatable_balance(
            guard.snapshot,
            &entries,
            guard.now,
            guard.finalization_threshold,
        );
        if !balance.covers(amount) {
            return Err(StorageError::OverAllocated {
                have: balance.remaining,
                need: amount,
            });
        }

        tx.execute(
            "INSERT INTO compacts
                 (chain_id, sponsor, lock_id, amount, expires, claim_hash,
                  compact, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.chain_id.to_string(),
                sponsor.as_slice(),
                lock_id.to_be_bytes::<32>().as_slice(),
                record.compact.amount.to_string(),
                record.compact.expires.seconds_since_epoch() as i64,
                record.claim_hash.as_slice(),
                compact_json,
                record.signature.0.as_slice(),
                record.created_at.seconds_since_epoch() as i64
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StorageError::DuplicateCompact(record.claim_hash)
            } else {
                StorageError::Sqlite(e)
            }
        })?;
        tx.commit()?;
        Ok(())
    }

    /// Point lookup by `(chain, claim hash)`.
    pub async fn compact_by_claim_hash(
        &self,
        chain_id: ChainId,
        claim_hash: B256,
    ) -> Result<Option<CompactRecord>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT chain_id, compact, claim_hash, signature, created_at
             FROM compacts WHERE chain_id = ?1 AND claim_hash = ?2",
            params![chain_id.to_string(), claim_hash.as_slice()],
            record_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Every compact this sponsor has admitted, newest first, across chains.
    pub async fn compacts_by_sponsor(
        &self,
        sponsor: Address,
    ) -> Result<Vec<CompactRecord>, StorageError> {
        let conn = self.conn.lock().await;
        let mut statement = conn.prepare(
            "SELECT chain_id, compact, claim_hash, signature, created_at
             FROM compacts WHERE sponsor = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = statement
            .query_map(params![sponsor.as_slice()], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// The local ledger slice the balance reconciler consumes: every compact
    /// recorded against `(chain, sponsor, lock)`. Liveness filtering happens
    /// in the reconciler, against the snapshot's claim set.
    pub async fn ledger_entries(
        &self,
        chain_id: ChainId,
        sponsor: Address,
        token_lock_id: U256,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let conn = self.conn.lock().await;
        ledger_entries_in(&conn, chain_id, sponsor, token_lock_id)
    }
}

fn ledger_entries_in(
    conn: &Connection,
    chain_id: ChainId,
    sponsor: Address,
    token_lock_id: U256,
) -> Result<Vec<LedgerEntry>, StorageError> {
    let mut statement = conn.prepare(
        "SELECT amount, expires, claim_hash FROM compacts
         WHERE chain_id = ?1 AND sponsor = ?2 AND lock_id = ?3",
    )?;
    let rows = statement
        .query_map(
            params![
                chain_id.to_string(),
                sponsor.as_slice(),
                token_lock_id.to_be_bytes::<32>().as_slice()
            ],
            |row| {
                let amount: String = row.get(0)?;
                let expires: i64 = row.get(1)?;
                let claim_hash: Vec<u8> = row.get(2)?;
                Ok((amount, expires, claim_hash))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(amount, expires, claim_hash)| {
            Ok(LedgerEntry {
                amount: U256::from_str_radix(&amount, 10)
                    .map_err(|_| StorageError::Corrupt(format!("bad amount {amount:?}")))?,
                expires: UnixTimestamp(expires as u64),
                claim_hash: blob_to_b256(&claim_hash)?,
            })
        })
        .collect()
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn blob_to_b256(blob: &[u8]) -> Result<B256, StorageError> {
    B256::try_from(blob).map_err(|_| StorageError::Corrupt("claim hash width".into()))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<CompactRecord, StorageError>> {
    let chain_id: String = row.get(0)?;
    let compact_json: String = row.get(1)?;
    let claim_hash: Vec<u8> = row.get(2)?;
    let signature: Vec<u8> = row.get(3)?;
    let created_at: i64 = row.get(4)?;
    Ok(build_record(
        chain_id,
        compact_json,
        claim_hash,
        signature,
        created_at,
    ))
}

fn build_record(
    chain_id: String,
    compact_json: String,
    claim_hash: Vec<u8>,
    signature: Vec<u8>,
    created_at: i64,
) -> Result<CompactRecord, StorageError> {
    let chain_id: ChainId = chain_id
        .parse()
        .map_err(|_| StorageError::Corrupt(format!("bad chain id {chain_id:?}")))?;
    let compact = serde_json::from_str(&compact_json)
        .map_err(|e| StorageError::Corrupt(format!("bad compact json: {e}")))?;
    let signature: [u8; 65] = signature
        .try_into()
        .map_err(|_| StorageError::Corrupt("signature width".into()))?;
    Ok(CompactRecord {
        chain_id,
        compact,
        claim_hash: blob_to_b256(&claim_hash)?,
        signature: EvmSignature(signature),
        created_at: UnixTimestamp(created_at as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Compact, DecimalU256, HexU256};
    use std::collections::HashSet;
    use std::str::FromStr;

    fn sponsor() -> Address {
        Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
    }

    fn chain() -> ChainId {
        ChainId::new(1)
    }

    fn snapshot(balance: U256) -> LockSnapshot {
        LockSnapshot {
            balance,
            withdrawal_status: 0,
            allocator_id: U256::from(1u64),
            pending_deltas: vec![],
            finalized_claims: HashSet::new(),
        }
    }

    /// Commits `record` under a snapshot deep enough to always pass the
    /// allocation re-check.
    async fn commit(db: &Database, record: &CompactRecord) -> Result<(), StorageError> {
        let snapshot = snapshot(U256::MAX);
        let guard = AllocationGuard {
            snapshot: &snapshot,
            now: UnixTimestamp(1_700_000_000),
            finalization_threshold: 25,
        };
        db.record_admission(record, &guard).await
    }

    fn record(segment: NonceSegment, claim_tag: u8) -> CompactRecord {
        let nonce = bits::pack_nonce(sponsor(), segment.high, segment.low);
        let compact = Compact {
            arbiter: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
                .parse()
                .unwrap(),
            sponsor: sponsor().into(),
            nonce: HexU256(nonce),
            expires: UnixTimestamp(1_700_003_600),
            id: HexU256((U256::from(7u64) << 253) | (U256::from(1u64) << 160)),
            amount: DecimalU256(U256::from(1_000u64)),
            witness_type_string: None,
            witness_hash: None,
        };
        CompactRecord {
            chain_id: chain(),
            compact,
            claim_hash: B256::repeat_byte(claim_tag),
            signature: EvmSignature([claim_tag; 65]),
            created_at: UnixTimestamp(1_700_000_000 + claim_tag as u64),
        }
    }

    #[tokio::test]
    async fn next_nonce_on_empty_ledger_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let segment = db.next_nonce(chain(), sponsor()).await.unwrap();
        assert_eq!(segment, NonceSegment::ZERO);
    }

    #[tokio::test]
    async fn admission_consumes_the_nonce() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::ZERO, 1))
            .await
            .unwrap();
        assert!(db
            .is_nonce_used(chain(), sponsor(), NonceSegment::ZERO)
            .await
            .unwrap());
        let next = db.next_nonce(chain(), sponsor()).await.unwrap();
        assert_eq!(next, NonceSegment::new(0, 1));
    }

    #[tokio::test]
    async fn gap_is_found_and_then_skipped() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::new(0, 0), 1))
            .await
            .unwrap();
        commit(&db, &record(NonceSegment::new(0, 2), 2))
            .await
            .unwrap();
        assert_eq!(
            db.next_nonce(chain(), sponsor()).await.unwrap(),
            NonceSegment::new(0, 1)
        );
        commit(&db, &record(NonceSegment::new(0, 1), 3))
            .await
            .unwrap();
        assert_eq!(
            db.next_nonce(chain(), sponsor()).await.unwrap(),
            NonceSegment::new(0, 3)
        );
    }

    #[tokio::test]
    async fn duplicate_nonce_is_nonce_taken() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::ZERO, 1))
            .await
            .unwrap();
        let result = commit(&db, &record(NonceSegment::ZERO, 2)).await;
        assert!(matches!(result, Err(StorageError::NonceTaken)));
        // the failed transaction must not have half-committed the compact
        assert!(db
            .compact_by_claim_hash(chain(), B256::repeat_byte(2))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_claim_hash_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::ZERO, 1))
            .await
            .unwrap();
        let mut dup = record(NonceSegment::new(0, 1), 1);
        dup.claim_hash = B256::repeat_byte(1);
        let result = commit(&db, &dup).await;
        assert!(matches!(result, Err(StorageError::DuplicateCompact(_))));
        // and the nonce insert must have rolled back with it
        assert!(!db
            .is_nonce_used(chain(), sponsor(), NonceSegment::new(0, 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn commit_recheck_blocks_overdraw() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::ZERO, 1))
            .await
            .unwrap();

        // the lock covers exactly one of the two 1000-unit compacts
        let shallow = snapshot(U256::from(1_500u64));
        let guard = AllocationGuard {
            snapshot: &shallow,
            now: UnixTimestamp(1_700_000_000),
            finalization_threshold: 25,
        };
        let result = db
            .record_admission(&record(NonceSegment::new(0, 1), 2), &guard)
            .await;
        match result {
            Err(StorageError::OverAllocated { have, need }) => {
                assert_eq!(have, U256::from(500u64));
                assert_eq!(need, U256::from(1_000u64));
            }
            other => panic!("expected OverAllocated, got {other:?}"),
        }
        // the refused admission must not have consumed its nonce
        assert!(!db
            .is_nonce_used(chain(), sponsor(), NonceSegment::new(0, 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn nonce_spaces_are_scoped_per_chain() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::ZERO, 1))
            .await
            .unwrap();
        let other_chain = ChainId::new(10);
        assert_eq!(
            db.next_nonce(other_chain, sponsor()).await.unwrap(),
            NonceSegment::ZERO
        );
    }

    #[tokio::test]
    async fn lookup_roundtrips_the_record() {
        let db = Database::open_in_memory().unwrap();
        let original = record(NonceSegment::ZERO, 7);
        commit(&db, &original).await.unwrap();
        let fetched = db
            .compact_by_claim_hash(chain(), original.claim_hash)
            .await
            .unwrap()
            .expect("record present");
        assert_eq!(fetched.compact, original.compact);
        assert_eq!(fetched.signature, original.signature);
        assert_eq!(fetched.created_at, original.created_at);
    }

    #[tokio::test]
    async fn listing_orders_newest_first() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::new(0, 0), 1))
            .await
            .unwrap();
        commit(&db, &record(NonceSegment::new(0, 1), 2))
            .await
            .unwrap();
        commit(&db, &record(NonceSegment::new(0, 2), 3))
            .await
            .unwrap();
        let listed = db.compacts_by_sponsor(sponsor()).await.unwrap();
        let created: Vec<u64> = listed
            .iter()
            .map(|r| r.created_at.seconds_since_epoch())
            .collect();
        assert_eq!(
            created,
            vec![1_700_000_003, 1_700_000_002, 1_700_000_001]
        );
    }

    #[tokio::test]
    async fn ledger_entries_filter_by_lock() {
        let db = Database::open_in_memory().unwrap();
        commit(&db, &record(NonceSegment::new(0, 0), 1))
            .await
            .unwrap();
        // same sponsor, different lock id
        let mut other = record(NonceSegment::new(0, 1), 2);
        other.compact.id = HexU256((U256::from(7u64) << 253) | (U256::from(1u64) << 160) | U256::from(5u64));
        commit(&db, &other).await.unwrap();

        let entries = db
            .ledger_entries(chain(), sponsor(), U256::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, U256::from(1_000u64));

        let entries = db
            .ledger_entries(chain(), sponsor(), U256::from(5u64))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
