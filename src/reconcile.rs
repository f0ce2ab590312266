//! Reconciliation of indexer snapshots against the local compact ledger.
//!
//! The allocator may only co-sign up to what the lock can actually cover:
//! the snapshot balance net of in-flight deltas, minus everything already
//! promised by live local compacts that the indexer has not yet seen settle.

use alloy_primitives::{B256, I256, U256};

use crate::indexer::LockSnapshot;
use crate::types::UnixTimestamp;

/// The slice of a persisted compact the reconciler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub amount: U256,
    pub expires: UnixTimestamp,
    pub claim_hash: B256,
}

impl LedgerEntry {
    /// An entry is outstanding while settlement could still land on-chain:
    /// before `expires` plus the chain's finalization threshold, and only as
    /// long as the indexer has not reported its claim hash as settled.
    pub fn is_outstanding(
        &self,
        snapshot: &LockSnapshot,
        now: UnixTimestamp,
        finalization_threshold: u64,
    ) -> bool {
        now < self.expires + finalization_threshold
            && !snapshot.finalized_claims.contains(&self.claim_hash)
    }
}

/// The reconciler's verdict for one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatableBalance {
    /// Snapshot balance net of pending deltas, floored at zero.
    pub snapshot_allocatable: U256,
    /// Sum of amounts promised by outstanding local compacts.
    pub locally_allocated: U256,
    /// What is left for new compacts, floored at zero.
    pub remaining: U256,
}

impl AllocatableBalance {
    pub fn covers(&self, amount: U256) -> bool {
        self.remaining >= amount
    }
}

/// Computes how much of the lock's balance is still allocatable.
///
/// `entries` is the local ledger for the `(sponsor, chain, lock)` triple;
/// entries that are expired past the finalization threshold or already
/// finalized on-chain no longer count against the balance.
pub fn allocatable_balance(
    snapshot: &LockSnapshot,
    entries: &[LedgerEntry],
    now: UnixTimestamp,
    finalization_threshold: u64,
) -> AllocatableBalance {
    let pending: I256 = snapshot
        .pending_deltas
        .iter()
        .fold(I256::ZERO, |sum, delta| sum.saturating_add(*delta));
    let snapshot_allocatable = if pending.is_negative() {
        snapshot.balance.saturating_add(pending.unsigned_abs())
    } else {
        snapshot.balance.saturating_sub(pending.unsigned_abs())
    };

    let locally_allocated = entries
        .iter()
        .filter(|entry| entry.is_outstanding(snapshot, now, finalization_threshold))
        .fold(U256::ZERO, |sum, entry| sum.saturating_add(entry.amount));

    AllocatableBalance {
        snapshot_allocatable,
        locally_allocated,
        remaining: snapshot_allocatable.saturating_sub(locally_allocated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn snapshot(balance: u64, deltas: &[&str], claims: &[B256]) -> LockSnapshot {
        LockSnapshot {
            balance: U256::from(balance),
            withdrawal_status: 0,
            allocator_id: U256::from(1u64),
            pending_deltas: deltas
                .iter()
                .map(|d| I256::from_dec_str(d).unwrap())
                .collect(),
            finalized_claims: claims.iter().copied().collect::<HashSet<_>>(),
        }
    }

    fn entry(amount: u64, expires: u64, tag: u8) -> LedgerEntry {
        LedgerEntry {
            amount: U256::from(amount),
            expires: UnixTimestamp(expires),
            claim_hash: B256::repeat_byte(tag),
        }
    }

    const NOW: UnixTimestamp = UnixTimestamp(1_000);
    const THRESHOLD: u64 = 25;

    #[test]
    fn plain_balance_with_no_activity() {
        let balance = allocatable_balance(&snapshot(500, &[], &[]), &[], NOW, THRESHOLD);
        assert_eq!(balance.snapshot_allocatable, U256::from(500u64));
        assert_eq!(balance.remaining, U256::from(500u64));
        assert!(balance.covers(U256::from(500u64)));
        assert!(!balance.covers(U256::from(501u64)));
    }

    #[test]
    fn positive_deltas_reduce_allocatable() {
        let balance = allocatable_balance(&snapshot(500, &["300", "100"], &[]), &[], NOW, THRESHOLD);
        assert_eq!(balance.snapshot_allocatable, U256::from(100u64));
    }

    #[test]
    fn negative_delta_sum_credits_balance() {
        let balance = allocatable_balance(&snapshot(500, &["-200"], &[]), &[], NOW, THRESHOLD);
        assert_eq!(balance.snapshot_allocatable, U256::from(700u64));
    }

    #[test]
    fn deltas_exceeding_balance_floor_at_zero() {
        let balance = allocatable_balance(&snapshot(500, &["900"], &[]), &[], NOW, THRESHOLD);
        assert_eq!(balance.snapshot_allocatable, U256::ZERO);
        assert_eq!(balance.remaining, U256::ZERO);
    }

    #[test]
    fn outstanding_compacts_count_against_balance() {
        let entries = [entry(200, 2_000, 1), entry(100, 2_000, 2)];
        let balance = allocatable_balance(&snapshot(500, &[], &[]), &entries, NOW, THRESHOLD);
        assert_eq!(balance.locally_allocated, U256::from(300u64));
        assert_eq!(balance.remaining, U256::from(200u64));
    }

    #[test]
    fn expired_past_threshold_drops_out() {
        // expires + threshold == now is no longer outstanding
        let entries = [entry(200, NOW.0 - THRESHOLD, 1)];
        let balance = allocatable_balance(&snapshot(500, &[], &[]), &entries, NOW, THRESHOLD);
        assert_eq!(balance.locally_allocated, U256::ZERO);

        // one second inside the threshold still counts
        let entries = [entry(200, NOW.0 - THRESHOLD + 1, 1)];
        let balance = allocatable_balance(&snapshot(500, &[], &[]), &entries, NOW, THRESHOLD);
        assert_eq!(balance.locally_allocated, U256::from(200u64));
    }

    #[test]
    fn finalized_claims_drop_out() {
        let finalized = B256::repeat_byte(1);
        let entries = [entry(200, 2_000, 1), entry(100, 2_000, 2)];
        let balance =
            allocatable_balance(&snapshot(500, &[], &[finalized]), &entries, NOW, THRESHOLD);
        assert_eq!(balance.locally_allocated, U256::from(100u64));
        assert_eq!(balance.remaining, U256::from(400u64));
    }

    #[test]
    fn over_allocated_ledger_floors_remaining() {
        let entries = [entry(900, 2_000, 1)];
        let balance = allocatable_balance(&snapshot(500, &[], &[]), &entries, NOW, THRESHOLD);
        assert_eq!(balance.remaining, U256::ZERO);
        assert!(!balance.covers(U256::from(1u64)));
        assert!(balance.covers(U256::ZERO));
    }
}
