//! In-flight operation tracking for one multiplexed connection
//!
//! A fixed array of slots, each an epoch-managed atomic pointer to an entry.
//! Admission is counted by a semaphore with one permit per slot: a permit is
//! taken before an entry is inserted and returned only after the entry has
//! been removed, so a free slot always exists for every permit holder.
//!
//! Removal of an entry is a compare-and-swap on the exact entry pointer. When
//! a response and the cleanup loop race for the same slot exactly one CAS
//! wins, so an operation is never completed twice and a permit is never
//! returned twice.
//!
//! Adds of the same opaque are serialized on a lock striped by opaque, so the
//! duplicate check and the insert are one step for any given opaque. Removal
//! never takes the stripe.
//!
//! ```text
//! add ──► acquire permit ──► CAS null → entry ──► (response | timeout | dispose)
//!                                                         │
//!                             release permit ◄── CAS entry → null
//! ```

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::operation::{Operation, OperationError};

/// How long an orphaned operation stays tracked before it is failed
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(75);
/// How often the cleanup loop scans for orphans
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Default per-connection concurrency
pub const DEFAULT_MAX_OPERATIONS: usize = 32;

const ADD_STRIPES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InFlightError {
    /// The set has been disposed; no further operations are accepted
    Disposed,
    /// An operation with this opaque is already tracked
    DuplicateOpaque(u32),
    /// Tracked operations did not all complete within the wait
    WaitTimeout { remaining: usize },
}

impl std::fmt::Display for InFlightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InFlightError::Disposed => write!(f, "In-flight set disposed"),
            InFlightError::DuplicateOpaque(opaque) => {
                write!(f, "Opaque {} is already in flight", opaque)
            }
            InFlightError::WaitTimeout { remaining } => {
                write!(f, "Timed out waiting for {} in-flight operations", remaining)
            }
        }
    }
}

impl std::error::Error for InFlightError {}

struct InFlightEntry {
    /// Distinguishes reuse of the same slot by later operations
    seq: u64,
    op: Operation,
    inserted_at: Instant,
}

/// Tuning for an `InFlightOperationSet`
#[derive(Debug, Clone)]
pub struct InFlightConfig {
    pub max_operations: usize,
    pub timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for InFlightConfig {
    fn default() -> Self {
        InFlightConfig {
            max_operations: DEFAULT_MAX_OPERATIONS,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Bounded, lock-free set of outstanding operations keyed by opaque
pub struct InFlightOperationSet {
    slots: Box<[Atomic<InFlightEntry>]>,
    add_stripes: Box<[Mutex<()>]>,
    semaphore: Semaphore,
    occupied: AtomicUsize,
    next_seq: AtomicU64,
    scan_hint: AtomicUsize,
    disposed: AtomicBool,
    timeout: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
}

impl InFlightOperationSet {
    /// Create a set and start its cleanup loop
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: InFlightConfig) -> Arc<Self> {
        debug_assert!(config.max_operations > 0, "max_operations must be positive");
        debug_assert!(!config.timeout.is_zero(), "timeout must be positive");
        debug_assert!(
            !config.cleanup_interval.is_zero(),
            "cleanup_interval must be positive"
        );

        let max = config.max_operations.max(1);
        let slots: Vec<Atomic<InFlightEntry>> = (0..max).map(|_| Atomic::null()).collect();
        let set = Arc::new(InFlightOperationSet {
            slots: slots.into_boxed_slice(),
            add_stripes: (0..ADD_STRIPES).map(|_| Mutex::new(())).collect(),
            semaphore: Semaphore::new(max),
            occupied: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            scan_hint: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            timeout: config.timeout,
            cleanup_interval: config.cleanup_interval,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::cleanup_loop(
            Arc::downgrade(&set),
            set.cleanup_interval,
            set.cancel.clone(),
        ));
        set
    }

    /// Maximum number of operations which may be in flight
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of operations currently tracked
    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Track an operation, suspending while the set is full
    pub async fn add(&self, op: Operation) -> Result<(), InFlightError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| InFlightError::Disposed)?;

        let opaque = op.opaque();
        // Held until the entry is visible to the next add of this opaque
        let _stripe = self.add_stripes[opaque as usize % ADD_STRIPES].lock();
        if self.contains(opaque) {
            // Dropping the permit returns it to the semaphore
            drop(permit);
            return Err(InFlightError::DuplicateOpaque(opaque));
        }
        permit.forget();

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entry = Owned::new(InFlightEntry {
            seq,
            op,
            inserted_at: Instant::now(),
        });

        let guard = epoch::pin();
        let len = self.slots.len();
        let start = self.scan_hint.fetch_add(1, Ordering::Relaxed) % len;
        'scan: loop {
            for i in 0..len {
                let index = (start + i) % len;
                match self.slots[index].compare_exchange(
                    Shared::null(),
                    entry,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => {
                        self.occupied.fetch_add(1, Ordering::AcqRel);
                        debug_assert!(self.len() <= len, "in-flight count exceeds capacity");
                        if self.is_disposed() {
                            // Raced with dispose after its sweep; undo and report
                            if let Some(op) = self.remove_if_seq(index, seq, &guard) {
                                op.fail(OperationError::Cancelled);
                            }
                            return Err(InFlightError::Disposed);
                        }
                        break 'scan;
                    }
                    Err(e) => entry = e.new,
                }
            }
            // A permit guarantees a free slot; losing every CAS means another
            // holder grabbed the slot we saw first. Rescan.
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Remove and return the operation with `opaque`
    pub fn try_remove(&self, opaque: u32) -> Option<Operation> {
        let guard = epoch::pin();
        for slot in self.slots.iter() {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: entries are only freed through `defer_destroy`, so a
            // pointer loaded under a pinned guard stays valid for the guard.
            let Some(entry) = (unsafe { current.as_ref() }) else {
                continue;
            };
            if entry.op.opaque() != opaque {
                continue;
            }
            if let Some(op) = self.take(slot, current, &guard) {
                return Some(op);
            }
        }
        None
    }

    /// Peek at the operation with `opaque` without removing it
    ///
    /// The returned slot can later remove exactly this entry, even if the
    /// opaque has since been reused by another operation.
    pub fn try_get(&self, opaque: u32) -> Option<InFlightSlot<'_>> {
        let guard = epoch::pin();
        for (index, slot) in self.slots.iter().enumerate() {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: see `try_remove`
            if let Some(entry) = unsafe { current.as_ref() } {
                if entry.op.opaque() == opaque {
                    return Some(InFlightSlot {
                        set: self,
                        index,
                        seq: entry.seq,
                        op: entry.op.clone(),
                    });
                }
            }
        }
        None
    }

    fn contains(&self, opaque: u32) -> bool {
        let guard = epoch::pin();
        self.slots.iter().any(|slot| {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: see `try_remove`
            unsafe { current.as_ref() }.is_some_and(|entry| entry.op.opaque() == opaque)
        })
    }

    /// Remove the entry in `index` only if it is still the one with `seq`
    fn remove_if_seq(&self, index: usize, seq: u64, guard: &Guard) -> Option<Operation> {
        let slot = &self.slots[index];
        let current = slot.load(Ordering::Acquire, guard);
        // SAFETY: see `try_remove`
        let entry = unsafe { current.as_ref() }?;
        if entry.seq != seq {
            return None;
        }
        self.take(slot, current, guard)
    }

    /// CAS `current` out of `slot`; on success release its permit
    fn take<'g>(
        &self,
        slot: &Atomic<InFlightEntry>,
        current: Shared<'g, InFlightEntry>,
        guard: &'g Guard,
    ) -> Option<Operation> {
        slot.compare_exchange(
            current,
            Shared::null(),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        )
        .ok()?;

        // SAFETY: we won the CAS, so `current` is unlinked and no later load
        // can observe it; readers pinned earlier are protected by the guard.
        let op = unsafe {
            let op = current.deref().op.clone();
            guard.defer_destroy(current);
            op
        };
        self.occupied.fetch_sub(1, Ordering::AcqRel);
        self.semaphore.add_permits(1);
        Some(op)
    }

    /// Wait until every currently tracked operation has completed
    ///
    /// Operations added after the call are not waited for.
    pub async fn wait_for_all(&self, timeout: Duration) -> Result<(), InFlightError> {
        let pending = self.snapshot();
        if pending.is_empty() {
            return Ok(());
        }

        let waits = futures::future::join_all(pending.iter().map(|op| op.completed()));
        match tokio::time::timeout(timeout, waits).await {
            Ok(_) => Ok(()),
            Err(_) => Err(InFlightError::WaitTimeout {
                remaining: pending.iter().filter(|op| !op.is_completed()).count(),
            }),
        }
    }

    /// Point-in-time copy of the tracked operations
    pub fn snapshot(&self) -> Vec<Operation> {
        let guard = epoch::pin();
        self.slots
            .iter()
            .filter_map(|slot| {
                let current = slot.load(Ordering::Acquire, &guard);
                // SAFETY: see `try_remove`
                unsafe { current.as_ref() }.map(|entry| entry.op.clone())
            })
            .collect()
    }

    /// Fail every entry tracked longer than the timeout; returns the count
    pub fn expire_orphans(&self) -> usize {
        if self.is_empty() {
            return 0;
        }

        let guard = epoch::pin();
        let mut expired = 0;
        for slot in self.slots.iter() {
            let current = slot.load(Ordering::Acquire, &guard);
            // SAFETY: see `try_remove`
            let Some(entry) = (unsafe { current.as_ref() }) else {
                continue;
            };
            let elapsed = entry.inserted_at.elapsed();
            if elapsed <= self.timeout {
                continue;
            }
            // Losing the CAS means the response arrived first
            if let Some(op) = self.take(slot, current, &guard) {
                trace!(opaque = op.opaque(), ?elapsed, "expiring orphaned operation");
                op.fail(OperationError::Timeout { elapsed });
                expired += 1;
            }
        }
        expired
    }

    async fn cleanup_loop(set: Weak<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(set) = set.upgrade() else {
                break;
            };
            let expired = set.expire_orphans();
            if expired > 0 {
                debug!(expired, remaining = set.len(), "in-flight cleanup removed orphans");
            }
        }
    }

    /// Stop accepting operations and cancel every tracked one
    ///
    /// Idempotent. Pending `add` calls fail with `InFlightError::Disposed`.
    pub fn dispose(&self) {
        self.dispose_with(OperationError::Cancelled);
    }

    /// Like `dispose`, failing tracked operations with `error`
    pub fn dispose_with(&self, error: OperationError) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.semaphore.close();

        let guard = epoch::pin();
        let mut cancelled = 0;
        for slot in self.slots.iter() {
            let current = slot.load(Ordering::Acquire, &guard);
            if current.is_null() {
                continue;
            }
            if let Some(op) = self.take(slot, current, &guard) {
                op.fail(error.clone());
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(cancelled, %error, "in-flight set disposed with outstanding operations");
        }
    }
}

impl Drop for InFlightOperationSet {
    fn drop(&mut self) {
        self.cancel.cancel();
        // SAFETY: `&mut self` proves no other thread can reach the slots.
        unsafe {
            let guard = epoch::unprotected();
            for slot in self.slots.iter() {
                let current = slot.swap(Shared::null(), Ordering::Relaxed, guard);
                if !current.is_null() {
                    let entry = current.into_owned();
                    entry.op.fail(OperationError::Cancelled);
                }
            }
        }
    }
}

/// Handle to one tracked entry, obtained from `try_get`
pub struct InFlightSlot<'a> {
    set: &'a InFlightOperationSet,
    index: usize,
    seq: u64,
    op: Operation,
}

impl InFlightSlot<'_> {
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Remove this exact entry. Returns `None` if it was already removed.
    pub fn remove(self) -> Option<Operation> {
        let guard = epoch::pin();
        self.set.remove_if_seq(self.index, self.seq, &guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(max: usize) -> InFlightConfig {
        InFlightConfig {
            max_operations: max,
            timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let set = InFlightOperationSet::new(config(4));
        let (op, _result) = Operation::new(10, Bytes::new(), false);
        set.add(op.clone()).await.unwrap();
        assert_eq!(set.len(), 1);

        let removed = set.try_remove(10).expect("tracked");
        assert!(removed.same_as(&op));
        assert_eq!(set.len(), 0);
        assert!(set.try_remove(10).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_opaque_rejected_without_leaking_permit() {
        let set = InFlightOperationSet::new(config(2));
        let (a, _ra) = Operation::new(1, Bytes::new(), false);
        let (b, _rb) = Operation::new(1, Bytes::new(), false);
        set.add(a).await.unwrap();
        assert_eq!(set.add(b).await, Err(InFlightError::DuplicateOpaque(1)));

        // Second permit still available
        let (c, _rc) = Operation::new(2, Bytes::new(), false);
        tokio::time::timeout(Duration::from_millis(100), set.add(c))
            .await
            .expect("permit should not leak")
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_add_suspends_at_capacity() {
        let set = InFlightOperationSet::new(config(1));
        let (a, _ra) = Operation::new(1, Bytes::new(), false);
        let (b, _rb) = Operation::new(2, Bytes::new(), false);
        set.add(a).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), set.add(b.clone())).await;
        assert!(blocked.is_err(), "add must wait for a free slot");

        set.try_remove(1).unwrap();
        tokio::time::timeout(Duration::from_millis(100), set.add(b))
            .await
            .expect("slot freed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slot_handle_removes_exact_entry() {
        let set = InFlightOperationSet::new(config(2));
        let (first, _r1) = Operation::new(5, Bytes::new(), false);
        set.add(first).await.unwrap();
        let handle = set.try_get(5).unwrap();

        // Entry replaced by a new operation reusing the opaque
        set.try_remove(5).unwrap();
        let (second, _r2) = Operation::new(5, Bytes::new(), false);
        set.add(second.clone()).await.unwrap();

        assert!(handle.remove().is_none());
        let still_there = set.try_get(5).unwrap();
        assert!(still_there.operation().same_as(&second));
        assert!(still_there.remove().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expires_orphans_and_frees_slot() {
        let set = InFlightOperationSet::new(config(1));
        let (op, result) = Operation::new(1, Bytes::new(), false);
        set.add(op).await.unwrap();

        // timeout + cleanup interval covers the worst case
        tokio::time::sleep(Duration::from_secs(7)).await;

        match result.await {
            Err(OperationError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(set.len(), 0);

        let (next, _r) = Operation::new(2, Bytes::new(), false);
        tokio::time::timeout(Duration::from_millis(10), set.add(next))
            .await
            .expect("slot reusable")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispose_cancels_everything() {
        let set = InFlightOperationSet::new(config(4));
        let mut results = Vec::new();
        for opaque in 0..3 {
            let (op, result) = Operation::new(opaque, Bytes::new(), false);
            set.add(op).await.unwrap();
            results.push(result);
        }

        set.dispose();
        set.dispose();

        for result in results {
            assert_eq!(result.await, Err(OperationError::Cancelled));
        }
        assert!(set.is_empty());

        let (late, _r) = Operation::new(9, Bytes::new(), false);
        assert_eq!(set.add(late).await, Err(InFlightError::Disposed));
    }

    #[tokio::test]
    async fn test_wait_for_all() {
        let set = InFlightOperationSet::new(config(4));
        let (op, _result) = Operation::new(3, Bytes::new(), false);
        set.add(op).await.unwrap();

        let err = set.wait_for_all(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, InFlightError::WaitTimeout { remaining: 1 });

        let responder = {
            let set = set.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                set.try_remove(3).unwrap().complete(Bytes::from_static(b"ok"));
            })
        };
        set.wait_for_all(Duration::from_secs(1)).await.unwrap();
        responder.await.unwrap();
    }
}
