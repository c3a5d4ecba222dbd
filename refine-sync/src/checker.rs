//! Causal-completeness checking for relayed updates.
//!
//! CRDT merge tolerates duplicated and reordered delivery, but not an
//! update whose prerequisite operations never arrived. yrs would park such
//! structs silently, leaving a replica that can't converge until the hole
//! is filled. The checker makes the hole visible before the apply.
//!
//! Most updates extend what the local document already has: for every
//! client they start at or below the local clock and run without holes.
//! Those are accepted from clock arithmetic alone. Anything else is replayed
//! with the local state into a shadow document, and the shadow's state
//! vector is compared with the upper bound the update declares. Any client
//! that falls short could not be integrated.
//!
//! Clock arithmetic cannot see an origin that points at a third client's
//! missing struct. [`CausalChecker::reconcile`] catches that case after the
//! apply, from the structs yrs had to park.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use yrs::block::ClientID;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::error::{SyncError, SyncResult};
use crate::update;

/// `client → first clock the local document is missing`.
pub type GapMap = HashMap<ClientID, u32>;

/// Outcome of [`CausalChecker::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The update was complete and applied as-is.
    Applied,
    /// Only the verifiable part was applied; the caller keeps the original
    /// bytes for replay once the gap is filled.
    Deferred(GapMap),
}

#[derive(Debug, Clone, Default)]
pub struct CheckerStats {
    pub checks: u64,
    pub gaps_detected: u64,
    pub recoveries: u64,
    /// Checks that needed a shadow replay
    pub shadow_builds: u64,
}

#[derive(Default)]
pub struct CausalChecker {
    checks: AtomicU64,
    gaps_detected: AtomicU64,
    recoveries: AtomicU64,
    shadow_builds: AtomicU64,
}

impl CausalChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Determine whether applying `incoming` to `doc` would create a gap.
    ///
    /// Returns `Ok(None)` when the update is safe to apply directly and the
    /// gap map otherwise. Malformed bytes are an error, never a gap.
    pub fn check(&self, doc: &Doc, incoming: &[u8]) -> SyncResult<Option<GapMap>> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let gaps = self.detect(doc, incoming)?.map(|(gaps, _)| gaps);
        if gaps.is_some() {
            self.gaps_detected.fetch_add(1, Ordering::Relaxed);
        }
        Ok(gaps)
    }

    /// Apply `incoming` to `doc` under `origin`, recovering from a gap.
    ///
    /// On a gap, the shadow document's diff against the live state vector is
    /// what the live document can verifiably accept; only that is applied.
    pub fn reconcile(&self, doc: &Doc, incoming: &[u8], origin: &str) -> SyncResult<Reconciled> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        match self.detect(doc, incoming)? {
            None => {
                apply(doc, incoming, origin)?;
                match parked_gaps(doc) {
                    None => Ok(Reconciled::Applied),
                    Some(gaps) => {
                        // yrs holds the parked structs and integrates them once
                        // the gap fills; the caller still keeps the bytes.
                        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
                        Ok(Reconciled::Deferred(gaps))
                    }
                }
            }
            Some((gaps, verified)) => {
                self.gaps_detected.fetch_add(1, Ordering::Relaxed);
                if !update::is_empty(&verified) {
                    apply(doc, &verified, origin)?;
                }
                self.recoveries.fetch_add(1, Ordering::Relaxed);
                Ok(Reconciled::Deferred(gaps))
            }
        }
    }

    pub fn stats(&self) -> CheckerStats {
        CheckerStats {
            checks: self.checks.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            shadow_builds: self.shadow_builds.load(Ordering::Relaxed),
        }
    }

    /// Returns `None` when complete, or the gaps plus the verified diff.
    fn detect(&self, doc: &Doc, incoming: &[u8]) -> SyncResult<Option<(GapMap, Vec<u8>)>> {
        let decoded = update::decode(incoming)?;
        let upper = update::decode_state_vector(&update::state_vector_from_update(incoming)?)?;

        let (local_sv, has_parked) = {
            let txn = doc.transact();
            (txn.state_vector(), txn.store().pending_update().is_some())
        };
        if covers(&local_sv, &upper) {
            // Everything the update declares is already known locally.
            return Ok(None);
        }
        if !has_parked && extends_contiguously(&local_sv, &decoded, &upper) {
            return Ok(None);
        }
        self.shadow(doc, decoded, &upper)
    }

    fn shadow(
        &self,
        doc: &Doc,
        decoded: Update,
        upper: &StateVector,
    ) -> SyncResult<Option<(GapMap, Vec<u8>)>> {
        self.shadow_builds.fetch_add(1, Ordering::Relaxed);
        let (local_sv, local_state) = {
            let txn = doc.transact();
            let sv = txn.state_vector();
            let state = txn.encode_state_as_update_v1(&StateVector::default());
            (sv, state)
        };

        let shadow = Doc::new();
        let integrated = {
            let mut txn = shadow.transact_mut();
            txn.apply_update(update::decode(&local_state)?)
                .map_err(|e| SyncError::MalformedUpdate(e.to_string()))?;
            txn.apply_update(decoded)
                .map_err(|e| SyncError::MalformedUpdate(e.to_string()))?;
            txn.state_vector()
        };

        let mut gaps = GapMap::new();
        for (client, clock) in upper.iter() {
            let have = integrated.get(client);
            if have < *clock {
                gaps.insert(*client, have);
            }
        }
        if gaps.is_empty() {
            return Ok(None);
        }

        let verified = {
            let txn = shadow.transact();
            txn.encode_state_as_update_v1(&local_sv)
        };
        Ok(Some((gaps, verified)))
    }
}

/// Apply raw bytes to `doc` inside a transaction tagged with `origin`.
pub fn apply(doc: &Doc, bytes: &[u8], origin: &str) -> SyncResult<()> {
    let decoded = update::decode(bytes)?;
    let mut txn = doc.transact_mut_with(Origin::from(origin));
    txn.apply_update(decoded)
        .map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

fn covers(have: &StateVector, want: &StateVector) -> bool {
    want.iter().all(|(client, clock)| have.get(client) >= *clock)
}

/// True when, for every client, the update's structs pick up at or below the
/// local clock and leave no hole up to their upper bound.
fn extends_contiguously(local: &StateVector, incoming: &Update, upper: &StateVector) -> bool {
    let inserted = incoming.insertions(true);
    upper.iter().all(|(client, end)| {
        let mut reached = local.get(client);
        if reached >= *end {
            return true;
        }
        let Some(ranges) = inserted.get(client) else {
            return false;
        };
        let mut ranges: Vec<_> = ranges.iter().cloned().collect();
        ranges.sort_by_key(|r| r.start);
        for range in ranges {
            if range.start > reached {
                return false;
            }
            reached = reached.max(range.end);
        }
        reached >= *end
    })
}

/// Gaps behind structs yrs parked during the last apply, if any.
fn parked_gaps(doc: &Doc) -> Option<GapMap> {
    let txn = doc.transact();
    let pending = txn.store().pending_update()?;
    let local = txn.state_vector();
    Some(
        pending
            .missing
            .iter()
            .map(|(client, _)| (*client, local.get(client)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    /// Append `s` to the doc's text and return the resulting incremental update.
    fn append(doc: &Doc, s: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&before)
    }

    fn content(doc: &Doc) -> String {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    #[test]
    fn test_gap_detected_then_cleared() {
        let source = Doc::new();
        let u1 = append(&source, "a");
        let u2 = append(&source, "b");
        let u3 = append(&source, "c");
        let client = source.client_id();

        let replica = Doc::new();
        apply(&replica, &u1, "test").unwrap();

        let checker = CausalChecker::new();
        let gaps = checker.check(&replica, &u3).unwrap().expect("gap expected");
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps.get(&client), Some(&1));

        apply(&replica, &u2, "test").unwrap();
        assert!(checker.check(&replica, &u3).unwrap().is_none());

        let stats = checker.stats();
        assert_eq!(stats.checks, 2);
        assert_eq!(stats.gaps_detected, 1);
    }

    #[test]
    fn test_unknown_client_nonzero_clock_is_gap() {
        let source = Doc::new();
        let _u1 = append(&source, "x");
        let u2 = append(&source, "y");

        let replica = Doc::new();
        let gaps = CausalChecker::new().check(&replica, &u2).unwrap().unwrap();
        assert_eq!(gaps.get(&source.client_id()), Some(&0));
    }

    #[test]
    fn test_duplicate_delivery_is_not_a_gap() {
        let source = Doc::new();
        let u1 = append(&source, "hello");

        let replica = Doc::new();
        apply(&replica, &u1, "test").unwrap();
        assert!(CausalChecker::new().check(&replica, &u1).unwrap().is_none());

        // Re-applying is idempotent
        apply(&replica, &u1, "test").unwrap();
        assert_eq!(content(&replica), "hello");
    }

    #[test]
    fn test_malformed_is_error() {
        let replica = Doc::new();
        let result = CausalChecker::new().check(&replica, &[0xff, 0xff]);
        assert!(matches!(result, Err(SyncError::MalformedUpdate(_))));
    }

    #[test]
    fn test_reconcile_defers_without_corrupting() {
        let source = Doc::new();
        let u1 = append(&source, "one ");
        let u2 = append(&source, "two");

        let replica = Doc::new();
        let checker = CausalChecker::new();

        let outcome = checker.reconcile(&replica, &u2, "relay").unwrap();
        assert!(matches!(outcome, Reconciled::Deferred(_)));
        assert_eq!(content(&replica), "");

        assert_eq!(checker.reconcile(&replica, &u1, "relay").unwrap(), Reconciled::Applied);
        assert!(content(&replica).starts_with("one "));

        // Replaying the deferred bytes now completes the document
        assert_eq!(checker.reconcile(&replica, &u2, "relay").unwrap(), Reconciled::Applied);
        assert_eq!(content(&replica), "one two");
        assert_eq!(checker.stats().recoveries, 1);
    }

    #[test]
    fn test_reconcile_applies_independent_clients() {
        let alice = Doc::new();
        let bob = Doc::new();
        let a1 = append(&alice, "A");
        let _a2 = append(&alice, "A");
        let a3 = append(&alice, "A");
        let b1 = append(&bob, "B");

        // One update carrying a complete part (bob) and a gapped part (alice)
        let combined = update::merge_updates(&[a3, b1]).unwrap();

        let replica = Doc::new();
        apply(&replica, &a1, "test").unwrap();
        let outcome = CausalChecker::new().reconcile(&replica, &combined, "relay").unwrap();

        match outcome {
            Reconciled::Deferred(gaps) => {
                assert!(gaps.contains_key(&alice.client_id()));
                assert!(!gaps.contains_key(&bob.client_id()));
            }
            other => panic!("expected deferral, got {other:?}"),
        }
        // Bob's independent insert made it through
        assert!(replica.transact().state_vector().get(&bob.client_id()) > 0);
    }

    #[test]
    fn test_contiguous_update_skips_shadow() {
        let source = Doc::new();
        let replica = Doc::new();
        for word in ["alpha ", "beta ", "gamma "] {
            apply(&replica, &append(&source, word), "test").unwrap();
        }
        let next = append(&source, "delta");

        let checker = CausalChecker::new();
        assert_eq!(checker.reconcile(&replica, &next, "relay").unwrap(), Reconciled::Applied);
        assert_eq!(content(&replica), "alpha beta gamma delta");
        assert_eq!(checker.stats().shadow_builds, 0);

        // A hole still goes through the shadow
        let _skipped = append(&source, "!");
        let gapped = append(&source, "?");
        assert!(checker.check(&replica, &gapped).unwrap().is_some());
        assert_eq!(checker.stats().shadow_builds, 1);
    }

    #[test]
    fn test_origin_on_missing_third_client_is_deferred() {
        let alice = Doc::new();
        let a1 = append(&alice, "a");
        let bob = Doc::new();
        apply(&bob, &a1, "test").unwrap();
        // Bob's insert hangs off alice's item, which the replica never saw
        let b1 = append(&bob, "b");

        let replica = Doc::new();
        let checker = CausalChecker::new();
        match checker.reconcile(&replica, &b1, "relay").unwrap() {
            Reconciled::Deferred(gaps) => assert_eq!(gaps.get(&alice.client_id()), Some(&0)),
            other => panic!("expected deferral, got {other:?}"),
        }
        assert_eq!(content(&replica), "");

        assert_eq!(checker.reconcile(&replica, &a1, "relay").unwrap(), Reconciled::Applied);
        assert_eq!(checker.reconcile(&replica, &b1, "relay").unwrap(), Reconciled::Applied);
        assert_eq!(content(&replica), "ab");
    }
}
