//! Stamped locking strategies.
//!
//! Every container owns a [`Locker`]: a pair of stamped locks (one for the *update* domain, one
//! for the *structural* domain) plus two monotone write counters. The four request shapes are
//! (read, write) × (update, structural):
//!
//! - *read/update* — shared on the update lock. Blocks only against an exclusive update holder.
//! - *read/structural* — shared on the structural lock only. Tolerates concurrent value
//!   mutation, but not additions or removals.
//! - *write/update* — exclusive on the update lock, shared on the structural lock.
//! - *write/structural* — exclusive on both.
//!
//! The sub-locks are always acquired update-first, so the shapes cannot deadlock against each
//! other. A thread that already holds a lock re-enters for free; if the nested request needs
//! *more* than the thread holds, the missing part is acquired with a single non-blocking
//! attempt, and failure panics ("could not upgrade") — upgrades are advisory, never waited for.
//!
//! Each stamped lock carries a seqlock-style parity stamp: odd while exclusively held, bumped on
//! every acquire and release. [`Locker::optimistically`] exploits it for lock-free reads: the
//! operation runs against a snapshot of both stamps and must call its validator before trusting
//! anything it read; after a bounded number of invalidated attempts the locker escalates to a
//! real shared lock.

use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The atomic ordering used throughout the code.
const ORDERING: Ordering = Ordering::SeqCst;
/// How many optimistic attempts are made before escalating to a shared lock.
const DEFAULT_OPTIMISTIC_ATTEMPTS: usize = 2;

/// The source of locker identities, keying the per-thread reentrancy registry.
static LOCKER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// What this thread currently holds, per locker.
    ///
    /// Entries exist only while a transaction is open; the map is restored on every transaction
    /// close, so an empty map means the thread holds nothing.
    static HELD: RefCell<BTreeMap<u64, Hold>> = RefCell::new(BTreeMap::new());
}

/// The concurrency substrate a container is built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStrategy {
    /// Blocking stamped locks with optimistic reads. The default.
    Stamped,
    /// No blocking; conflicting access is *detected* instead, and panics. Cheap when contention
    /// is a bug rather than a workload.
    FastFail,
    /// No locking at all, only the stamp counters. For single-threaded use.
    None,
}

/// How strongly a sub-lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    /// Not held.
    None,
    /// Held shared.
    Shared,
    /// Held exclusively.
    Exclusive,
}

/// A thread's current holdings on one locker.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Hold {
    /// The level held on the update lock.
    update: Level,
    /// The level held on the structural lock.
    structural: Level,
}

impl Hold {
    /// The empty holding.
    fn none() -> Hold {
        Hold { update: Level::None, structural: Level::None }
    }
}

/// The blocking state of one raw lock.
struct RawState {
    /// The number of shared holders.
    readers: usize,
    /// Is the lock exclusively held?
    writer: bool,
}

/// One stamped shared/exclusive lock.
///
/// The blocking part is a plain mutex + condvar; the stamp is a parity counter in the seqlock
/// discipline: it is odd exactly while the lock is exclusively held, and any change since a
/// snapshot means an exclusive acquisition happened in between.
pub struct RawStamped {
    /// The parity stamp.
    seq: AtomicU64,
    /// The blocking state.
    state: Mutex<RawState>,
    /// Signalled whenever the lock becomes available in some mode.
    cond: Condvar,
}

impl RawStamped {
    /// Create an unheld lock.
    pub fn new() -> RawStamped {
        RawStamped {
            seq: AtomicU64::new(0),
            state: Mutex::new(RawState { readers: 0, writer: false }),
            cond: Condvar::new(),
        }
    }

    /// Acquire shared access, blocking while a writer holds the lock.
    pub fn lock_shared(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Acquire shared access without blocking.
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer {
            false
        } else {
            state.readers += 1;
            true
        }
    }

    /// Release shared access.
    pub fn unlock_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Acquire exclusive access, blocking out readers and writers. Bumps the stamp to odd.
    pub fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
        drop(state);
        self.seq.fetch_add(1, ORDERING);
    }

    /// Acquire exclusive access without blocking.
    pub fn try_lock_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            false
        } else {
            state.writer = true;
            drop(state);
            self.seq.fetch_add(1, ORDERING);
            true
        }
    }

    /// Release exclusive access. Bumps the stamp back to even.
    pub fn unlock_exclusive(&self) {
        self.seq.fetch_add(1, ORDERING);
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Trade the caller's shared hold for an exclusive one, in a single attempt.
    ///
    /// Succeeds only when the caller is the sole holder. The caller must actually hold the lock
    /// shared.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 1 {
            state.readers = 0;
            state.writer = true;
            drop(state);
            self.seq.fetch_add(1, ORDERING);
            true
        } else {
            false
        }
    }

    /// Trade the caller's exclusive hold back for a shared one.
    pub fn downgrade(&self) {
        self.seq.fetch_add(1, ORDERING);
        let mut state = self.state.lock();
        state.writer = false;
        state.readers = 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Snapshot the stamp for an optimistic read, or `None` while a writer is active.
    pub fn optimistic(&self) -> Option<u64> {
        let seq = self.seq.load(ORDERING);
        if seq & 1 == 1 { None } else { Some(seq) }
    }

    /// Has the stamp moved since the snapshot?
    pub fn validate(&self, snapshot: u64) -> bool {
        self.seq.load(ORDERING) == snapshot
    }
}

/// The stamped strategy's state: the two sub-locks.
struct StampedCore {
    /// The update-domain lock. Always acquired before the structural one.
    update: RawStamped,
    /// The structural-domain lock.
    structural: RawStamped,
    /// Optimistic attempts before escalation.
    attempts: usize,
}

/// The strategy-specific part of a locker.
enum Kind {
    /// Blocking stamped locks.
    Stamped(StampedCore),
    /// A lone parity stamp; conflicts panic.
    FastFail(AtomicU64),
    /// Nothing.
    None,
}

/// A container's lock: strategy state plus the two write counters.
///
/// The counters are the container's externally visible stamps: `stamp(false)` counts every
/// write, `stamp(true)` only structural ones. They are bumped by the container through
/// [`Locker::bump`] at each actual mutation, so a write transaction that ends up not mutating
/// (say, `get_or_add` finding its value) moves neither.
pub struct Locker {
    /// This locker's identity in the per-thread registry.
    id: u64,
    /// Count of all writes.
    writes: AtomicU64,
    /// Count of structural writes.
    structural_writes: AtomicU64,
    /// The strategy.
    kind: Kind,
}

/// What a transaction must do to one sub-lock when it closes.
#[derive(Clone, Copy)]
enum Exit {
    /// The level was already sufficient.
    Keep,
    /// Release a shared acquisition.
    ReleaseShared,
    /// Release an exclusive acquisition.
    ReleaseExclusive,
    /// Downgrade an upgrade back to shared.
    Downgrade,
}

/// An open stamped transaction. Closing (dropping) it releases in reverse acquisition order and
/// restores the thread's registry entry, also on unwind.
struct StampedTxn<'a> {
    core: &'a StampedCore,
    locker_id: u64,
    update: Exit,
    structural: Exit,
    prev: Hold,
}

impl<'a> Drop for StampedTxn<'a> {
    fn drop(&mut self) {
        // Reverse of the acquisition order: structural first, then update.
        match self.structural {
            Exit::Keep => {}
            Exit::ReleaseShared => self.core.structural.unlock_shared(),
            Exit::ReleaseExclusive => self.core.structural.unlock_exclusive(),
            Exit::Downgrade => self.core.structural.downgrade(),
        }
        match self.update {
            Exit::Keep => {}
            Exit::ReleaseShared => self.core.update.unlock_shared(),
            Exit::ReleaseExclusive => self.core.update.unlock_exclusive(),
            Exit::Downgrade => self.core.update.downgrade(),
        }
        let id = self.locker_id;
        let prev = self.prev;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if prev == Hold::none() {
                held.remove(&id);
            } else {
                held.insert(id, prev);
            }
        });
    }
}

/// Acquire one sub-lock up to `need`, given the thread already holds it at `have`.
///
/// `nested` is whether the thread holds *anything* on this locker: nested acquisitions never
/// block (a blocking acquisition out of lock order could deadlock), they make a single attempt
/// and panic on failure, which is the advisory-upgrade contract.
fn raise(lock: &RawStamped, have: Level, need: Level, nested: bool) -> Exit {
    if have >= need {
        return Exit::Keep;
    }
    match (have, need) {
        (Level::None, Level::Shared) => {
            if nested {
                if !lock.try_lock_shared() {
                    panic!("could not upgrade: conflicting lock held by another thread");
                }
            } else {
                lock.lock_shared();
            }
            Exit::ReleaseShared
        }
        (Level::None, Level::Exclusive) => {
            if nested {
                if !lock.try_lock_exclusive() {
                    panic!("could not upgrade: conflicting lock held by another thread");
                }
            } else {
                lock.lock_exclusive();
            }
            Exit::ReleaseExclusive
        }
        (Level::Shared, Level::Exclusive) => {
            // A true upgrade: single attempt, successful only when we are alone.
            if !lock.try_upgrade() {
                panic!("could not upgrade: conflicting lock held by another thread");
            }
            Exit::Downgrade
        }
        // `have >= need` was handled above.
        _ => unreachable!(),
    }
}

impl Locker {
    /// Create a locker with the given strategy.
    pub fn new(strategy: LockStrategy) -> Locker {
        Locker::with_attempts(strategy, DEFAULT_OPTIMISTIC_ATTEMPTS)
    }

    /// Create a stamped locker making `attempts` optimistic attempts before escalating.
    ///
    /// The attempt count only matters for the stamped strategy; the others go straight to their
    /// fallback.
    pub fn with_attempts(strategy: LockStrategy, attempts: usize) -> Locker {
        Locker {
            id: LOCKER_ID.fetch_add(1, ORDERING),
            writes: AtomicU64::new(0),
            structural_writes: AtomicU64::new(0),
            kind: match strategy {
                LockStrategy::Stamped => Kind::Stamped(StampedCore {
                    update: RawStamped::new(),
                    structural: RawStamped::new(),
                    attempts: attempts,
                }),
                LockStrategy::FastFail => Kind::FastFail(AtomicU64::new(0)),
                LockStrategy::None => Kind::None,
            },
        }
    }

    /// The strategy this locker was built with.
    pub fn strategy(&self) -> LockStrategy {
        match self.kind {
            Kind::Stamped(..) => LockStrategy::Stamped,
            Kind::FastFail(..) => LockStrategy::FastFail,
            Kind::None => LockStrategy::None,
        }
    }

    /// The current stamp: all writes, or only structural ones.
    pub fn stamp(&self, structural: bool) -> u64 {
        if structural {
            self.structural_writes.load(ORDERING)
        } else {
            self.writes.load(ORDERING)
        }
    }

    /// Record a performed write. Structural writes count on both counters.
    pub fn bump(&self, structural: bool) {
        self.writes.fetch_add(1, ORDERING);
        if structural {
            self.structural_writes.fetch_add(1, ORDERING);
        }
    }

    /// What the thread currently holds on this locker.
    fn held(&self) -> Hold {
        let id = self.id;
        HELD.with(|held| held.borrow().get(&id).cloned().unwrap_or_else(Hold::none))
    }

    /// Open a stamped transaction raising the thread's holdings to `need`.
    fn enter<'a>(&self, core: &'a StampedCore, need: Hold) -> StampedTxn<'a> {
        let prev = self.held();
        let nested = prev != Hold::none();
        let mut txn = StampedTxn {
            core: core,
            locker_id: self.id,
            update: Exit::Keep,
            structural: Exit::Keep,
            prev: prev,
        };
        // Update lock first, then structural; `txn` is filled as we go, so a panicking upgrade
        // still releases whatever was acquired.
        txn.update = raise(&core.update, prev.update, need.update, nested);
        txn.structural = raise(&core.structural, prev.structural, need.structural, nested);
        let id = self.id;
        let now = Hold {
            update: ::std::cmp::max(prev.update, need.update),
            structural: ::std::cmp::max(prev.structural, need.structural),
        };
        HELD.with(|held| {
            held.borrow_mut().insert(id, now);
        });
        txn
    }

    /// The lock shape of a read in the given domain.
    fn read_shape(structural: bool) -> Hold {
        if structural {
            // Structure must hold still; values may move underneath.
            Hold { update: Level::None, structural: Level::Shared }
        } else {
            Hold { update: Level::Shared, structural: Level::None }
        }
    }

    /// The lock shape of a write in the given domain.
    fn write_shape(structural: bool) -> Hold {
        if structural {
            Hold { update: Level::Exclusive, structural: Level::Exclusive }
        } else {
            Hold { update: Level::Exclusive, structural: Level::Shared }
        }
    }

    /// Run `f` under a read transaction.
    ///
    /// `structural == false` guards values (blocks against writers of any kind);
    /// `structural == true` only guards structure, tolerating concurrent update writers.
    pub fn read<R, F: FnOnce() -> R>(&self, structural: bool, f: F) -> R {
        match self.kind {
            Kind::Stamped(ref core) => {
                let txn = self.enter(core, Locker::read_shape(structural));
                let result = f();
                drop(txn);
                result
            }
            Kind::FastFail(ref seq) => self.fastfail_read(seq, f),
            Kind::None => f(),
        }
    }

    /// Run `f` under a write transaction in the given domain.
    ///
    /// Structural writes exclude everything; update writes exclude other writers and update
    /// readers, while structural readers continue.
    pub fn write<R, F: FnOnce() -> R>(&self, structural: bool, f: F) -> R {
        match self.kind {
            Kind::Stamped(ref core) => {
                let txn = self.enter(core, Locker::write_shape(structural));
                let result = f();
                drop(txn);
                result
            }
            Kind::FastFail(ref seq) => self.fastfail_write(seq, f),
            Kind::None => f(),
        }
    }

    /// Like [`Locker::read`], but gives up instead of blocking. `None` means contention.
    pub fn try_read<R, F: FnOnce() -> R>(&self, structural: bool, f: F) -> Option<R> {
        self.try_enter(Locker::read_shape(structural), f)
    }

    /// Like [`Locker::write`], but gives up instead of blocking. `None` means contention.
    pub fn try_write<R, F: FnOnce() -> R>(&self, structural: bool, f: F) -> Option<R> {
        self.try_enter(Locker::write_shape(structural), f)
    }

    /// Open a transaction with try-acquisitions only.
    fn try_enter<R, F: FnOnce() -> R>(&self, need: Hold, f: F) -> Option<R> {
        match self.kind {
            Kind::Stamped(ref core) => {
                let prev = self.held();
                let mut txn = StampedTxn {
                    core: core,
                    locker_id: self.id,
                    update: Exit::Keep,
                    structural: Exit::Keep,
                    prev: prev,
                };
                match Locker::try_raise(&core.update, prev.update, need.update) {
                    Some(exit) => txn.update = exit,
                    // Nothing acquired yet; dropping `txn` is a no-op.
                    None => return None,
                }
                match Locker::try_raise(&core.structural, prev.structural, need.structural) {
                    Some(exit) => txn.structural = exit,
                    // The update part is released by the drop of `txn`.
                    None => return None,
                }
                let id = self.id;
                let now = Hold {
                    update: ::std::cmp::max(prev.update, need.update),
                    structural: ::std::cmp::max(prev.structural, need.structural),
                };
                HELD.with(|held| {
                    held.borrow_mut().insert(id, now);
                });
                let result = f();
                drop(txn);
                Some(result)
            }
            // The non-blocking strategies cannot wait in the first place.
            Kind::FastFail(ref seq) => {
                if need.update == Level::Exclusive {
                    Some(self.fastfail_write(seq, f))
                } else {
                    Some(self.fastfail_read(seq, f))
                }
            }
            Kind::None => Some(f()),
        }
    }

    /// Non-blocking counterpart of [`raise`]: `None` on contention instead of panicking.
    fn try_raise(lock: &RawStamped, have: Level, need: Level) -> Option<Exit> {
        if have >= need {
            return Some(Exit::Keep);
        }
        match (have, need) {
            (Level::None, Level::Shared) => {
                if lock.try_lock_shared() { Some(Exit::ReleaseShared) } else { None }
            }
            (Level::None, Level::Exclusive) => {
                if lock.try_lock_exclusive() { Some(Exit::ReleaseExclusive) } else { None }
            }
            (Level::Shared, Level::Exclusive) => {
                if lock.try_upgrade() { Some(Exit::Downgrade) } else { None }
            }
            _ => unreachable!(),
        }
    }

    /// Run `op` optimistically, escalating to a shared lock when validation keeps failing.
    ///
    /// Each attempt snapshots both stamps and hands `op` a guard; `op` must call
    /// [`OptimisticGuard::validate`] before trusting anything it read, and answer `None` when
    /// validation failed (it may also bail out early on its own). An attempt counts only if `op`
    /// answered `Some`, called the validator, and the stamps held still; otherwise the next
    /// attempt runs. After the configured attempts, `op` runs once under a real read lock with
    /// an always-true validator.
    ///
    /// `op` must tolerate restart: it may observe torn container state on invalidated attempts,
    /// which is exactly what the validator is for. It must not mutate the container.
    pub fn optimistically<R, F>(&self, mut op: F) -> R
        where F: FnMut(&OptimisticGuard) -> Option<R>
    {
        if let Kind::Stamped(ref core) = self.kind {
            for _ in 0..core.attempts {
                let update = match core.update.optimistic() {
                    Some(snapshot) => snapshot,
                    None => continue,
                };
                let structural = match core.structural.optimistic() {
                    Some(snapshot) => snapshot,
                    None => continue,
                };
                let guard = OptimisticGuard {
                    snapshot: Some((&core.update, update, &core.structural, structural)),
                    used: Cell::new(false),
                };
                if let Some(result) = op(&guard) {
                    // Only trust the result if the operation consulted the validator and the
                    // stamps held still to the end.
                    if guard.used.get() && guard.check() {
                        return result;
                    }
                }
            }
        }
        // Escalate. Under a shared update lock no writer can move the stamps.
        self.read(false, || {
            let guard = OptimisticGuard { snapshot: None, used: Cell::new(false) };
            match op(&guard) {
                Some(result) => result,
                None => panic!("optimistic operation failed under a held read lock"),
            }
        })
    }

    /// Fast-fail read: no blocking; a write detected during the read panics.
    fn fastfail_read<R, F: FnOnce() -> R>(&self, seq: &AtomicU64, f: F) -> R {
        let prev = self.held();
        if prev.update == Level::Exclusive {
            // The thread is the writer; its own read is consistent.
            return f();
        }
        let snapshot = seq.load(ORDERING);
        if snapshot & 1 == 1 {
            panic!("concurrent modification: a writer is active");
        }
        let nested = prev.update == Level::Shared;
        if !nested {
            let id = self.id;
            HELD.with(|held| {
                held.borrow_mut()
                    .insert(id, Hold { update: Level::Shared, structural: Level::None });
            });
        }
        let registry = RegistryRestore { locker_id: self.id, prev: prev, active: !nested };
        let result = f();
        drop(registry);
        if !nested && seq.load(ORDERING) != snapshot {
            panic!("concurrent modification: the container changed during a read");
        }
        result
    }

    /// Fast-fail write: a single interlocked attempt; a concurrent writer panics.
    fn fastfail_write<R, F: FnOnce() -> R>(&self, seq: &AtomicU64, f: F) -> R {
        let prev = self.held();
        if prev.update == Level::Exclusive {
            // Nested write.
            return f();
        }
        let snapshot = seq.load(ORDERING);
        if snapshot & 1 == 1
            || seq.compare_exchange(snapshot, snapshot + 1, ORDERING, ORDERING).is_err()
        {
            panic!("concurrent modification: another writer is active");
        }
        let id = self.id;
        HELD.with(|held| {
            held.borrow_mut()
                .insert(id, Hold { update: Level::Exclusive, structural: Level::Exclusive });
        });
        let registry = RegistryRestore { locker_id: self.id, prev: prev, active: true };
        let writer = WriterRelease { seq: seq };
        let result = f();
        drop(writer);
        drop(registry);
        result
    }
}

/// Restores a thread's registry entry when a fast-fail region closes, also on unwind.
struct RegistryRestore {
    locker_id: u64,
    prev: Hold,
    active: bool,
}

impl Drop for RegistryRestore {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let id = self.locker_id;
        let prev = self.prev;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if prev == Hold::none() {
                held.remove(&id);
            } else {
                held.insert(id, prev);
            }
        });
    }
}

/// Returns a fast-fail stamp to even when the write region closes, also on unwind.
struct WriterRelease<'a> {
    seq: &'a AtomicU64,
}

impl<'a> Drop for WriterRelease<'a> {
    fn drop(&mut self) {
        self.seq.fetch_add(1, ORDERING);
    }
}

/// The validator handed to an optimistic operation.
///
/// Calling [`OptimisticGuard::validate`] answers whether the stamp snapshot still holds. Under
/// the escalated (really locked) final attempt it always answers `true`.
pub struct OptimisticGuard<'a> {
    /// The two locks with their snapshots, or `None` under a real lock.
    snapshot: Option<(&'a RawStamped, u64, &'a RawStamped, u64)>,
    /// Whether the operation consulted the validator at all.
    used: Cell<bool>,
}

impl<'a> OptimisticGuard<'a> {
    /// Is the snapshot this operation is reading under still valid?
    pub fn validate(&self) -> bool {
        self.used.set(true);
        self.check()
    }

    /// The validation itself, without marking the guard used.
    fn check(&self) -> bool {
        match self.snapshot {
            None => true,
            Some((update, u, structural, s)) => update.validate(u) && structural.validate(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn stamps_move_on_bump() {
        let locker = Locker::new(LockStrategy::Stamped);
        assert_eq!(locker.stamp(false), 0);
        assert_eq!(locker.stamp(true), 0);
        locker.bump(false);
        assert_eq!(locker.stamp(false), 1);
        assert_eq!(locker.stamp(true), 0);
        locker.bump(true);
        assert_eq!(locker.stamp(false), 2);
        assert_eq!(locker.stamp(true), 1);
    }

    #[test]
    fn reentrant_reads_and_writes() {
        let locker = Locker::new(LockStrategy::Stamped);
        locker.read(false, || {
            locker.read(false, || {
                locker.read(true, || 7)
            })
        });
        locker.write(true, || {
            // A structural write covers everything; all nested shapes are free.
            locker.write(false, || ());
            locker.read(false, || ());
            locker.read(true, || ());
        });
    }

    #[test]
    fn upgrade_succeeds_when_alone() {
        let locker = Arc::new(Locker::new(LockStrategy::Stamped));
        locker.read(false, || {
            locker.write(false, || ());
            // The nested write transaction closed; we must be back to a shared hold, so a
            // foreign reader gets in...
            let foreign = locker.clone();
            let reader = thread::spawn(move || foreign.try_read(false, || 1));
            assert_eq!(reader.join().unwrap(), Some(1));
            // ...while a foreign writer does not.
            let foreign = locker.clone();
            let writer = thread::spawn(move || foreign.try_write(false, || 1));
            assert_eq!(writer.join().unwrap(), None);
        });
        // Fully released now.
        let foreign = locker.clone();
        let writer = thread::spawn(move || foreign.try_write(true, || 1));
        assert_eq!(writer.join().unwrap(), Some(1));
    }

    #[test]
    fn upgrade_fails_against_second_reader() {
        let locker = Arc::new(Locker::new(LockStrategy::Stamped));
        let gate = Arc::new(Barrier::new(2));

        let their_locker = locker.clone();
        let their_gate = gate.clone();
        let holder = thread::spawn(move || {
            their_locker.read(false, || {
                their_gate.wait();
                their_gate.wait();
            });
        });

        gate.wait();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            locker.read(false, || {
                locker.write(false, || ());
            });
        }));
        assert!(result.is_err());
        gate.wait();
        holder.join().unwrap();

        // The failed upgrade must have released everything it held.
        assert_eq!(locker.try_write(true, || 1), Some(1));
    }

    #[test]
    fn structural_read_tolerates_update_writer() {
        let locker = Arc::new(Locker::new(LockStrategy::Stamped));
        locker.write(false, || {
            // An update write holds the structural lock shared, so a structural reader on
            // another thread still gets in.
            let foreign = locker.clone();
            let reader = thread::spawn(move || foreign.try_read(true, || 1));
            assert_eq!(reader.join().unwrap(), Some(1));
            // An update reader does not.
            let foreign = locker.clone();
            let reader = thread::spawn(move || foreign.try_read(false, || 1));
            assert_eq!(reader.join().unwrap(), None);
        });
    }

    #[test]
    fn optimistic_fast_path() {
        let locker = Locker::new(LockStrategy::Stamped);
        let calls = Cell::new(0);
        let result = locker.optimistically(|guard| {
            calls.set(calls.get() + 1);
            if guard.validate() { Some(42) } else { None }
        });
        assert_eq!(result, 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn optimistic_without_validation_escalates() {
        let locker = Locker::new(LockStrategy::Stamped);
        let calls = Cell::new(0);
        let result = locker.optimistically(|_| {
            calls.set(calls.get() + 1);
            Some(42)
        });
        assert_eq!(result, 42);
        // Two distrusted attempts, then the locked one.
        assert_eq!(calls.get(), DEFAULT_OPTIMISTIC_ATTEMPTS + 1);
    }

    #[test]
    fn optimistic_invalidated_by_writer() {
        let locker = Arc::new(Locker::new(LockStrategy::Stamped));
        let data = Arc::new(AtomicUsize::new(1));
        let gate = Arc::new(Barrier::new(2));

        let their_locker = locker.clone();
        let their_data = data.clone();
        let their_gate = gate.clone();
        let writer = thread::spawn(move || {
            their_gate.wait();
            their_locker.write(true, || {
                their_data.store(2, ORDERING);
            });
            their_locker.bump(true);
            their_gate.wait();
        });

        let attempts = Cell::new(0);
        let result = locker.optimistically(|guard| {
            let attempt = attempts.get();
            attempts.set(attempt + 1);
            if attempt == 0 {
                // Let the writer run inside our snapshot window.
                gate.wait();
                gate.wait();
            }
            let value = data.load(ORDERING);
            if guard.validate() { Some(value) } else { None }
        });
        writer.join().unwrap();

        // The first attempt was invalidated; the retry saw the written value.
        assert_eq!(result, 2);
        assert!(attempts.get() >= 2);
    }

    #[test]
    fn fastfail_detects_write_during_read() {
        let locker = Arc::new(Locker::new(LockStrategy::FastFail));
        let gate = Arc::new(Barrier::new(2));

        let their_locker = locker.clone();
        let their_gate = gate.clone();
        let writer = thread::spawn(move || {
            their_gate.wait();
            their_locker.write(true, || ());
            their_gate.wait();
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            locker.read(false, || {
                gate.wait();
                gate.wait();
            })
        }));
        assert!(result.is_err());
        writer.join().unwrap();
    }

    #[test]
    fn fastfail_uncontended() {
        let locker = Locker::new(LockStrategy::FastFail);
        locker.write(true, || {
            locker.write(false, || ());
            locker.read(false, || ());
        });
        locker.read(false, || locker.read(true, || ()));
        locker.bump(true);
        assert_eq!(locker.stamp(true), 1);
    }

    #[test]
    fn none_strategy_is_free() {
        let locker = Locker::new(LockStrategy::None);
        assert_eq!(locker.read(false, || locker.write(true, || 3)), 3);
        let result = locker.optimistically(|guard| {
            if guard.validate() { Some(9) } else { None }
        });
        assert_eq!(result, 9);
    }

    #[test]
    fn concurrent_writers_serialize() {
        let locker = Arc::new(Locker::new(LockStrategy::Stamped));
        let hits = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();

        for _ in 0..8 {
            let locker = locker.clone();
            let hits = hits.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..100 {
                    locker.write(true, || {
                        hits.fetch_add(1, ORDERING);
                    });
                    locker.bump(true);
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        assert_eq!(hits.load(ORDERING), 800);
        assert_eq!(locker.stamp(true), 800);
        assert_eq!(locker.stamp(false), 800);
    }
}
