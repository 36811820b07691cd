// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slot pools and the queues threaded through them.
//!
//! A `SlotPool` is a fixed array of records plus, for each record, a small
//! management entry saying whether the slot is free, allocated, or linked
//! into one of the pool's queues. Free slots form a singly linked list;
//! queued slots form doubly linked FIFOs. Queue membership is a state of the
//! slot, so moving a record between queues never copies it.
//!
//! Records are only ever referred to by [`Slot`] index. An index is easy to
//! range-check; a pointer handed over by another box is not.
//!
//! All management state sits behind one spinlock per pool. Each operation
//! comes in a spinning flavor, for box code, and a `try_` flavor that reports
//! [`PoolError::Busy`] instead, for the monitor, which must never spin on a
//! lock a box might be holding.

use abi::{Slot, SlotState, Timeout};

use crate::sema::{Clock, Semaphore};
use crate::{Spinlock, SpinlockGuard};

/// Records stored in a pool must have an empty value usable in a `const`.
pub trait SlotInit {
    const EMPTY: Self;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolError {
    /// A `try_` operation found the pool locked.
    Busy,
    /// No free slots.
    Exhausted,
    /// The queue has nothing in it.
    Empty,
    /// No queued slot satisfied the predicate.
    NoMatch,
    /// A blocking allocation ran out of time.
    Timeout,
    /// Slot or queue index outside the pool.
    OutOfRange,
    /// The slot is not in a state this operation accepts. Carries the state
    /// it was found in, so callers can tell a double free from a free of a
    /// queued slot.
    WrongState(SlotState),
    /// Queue links point somewhere they shouldn't.
    Corrupt,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Entry {
    Free { next: Slot },
    Dequeued,
    Queued { queue: u8, prev: Slot, next: Slot },
}

impl Entry {
    fn state(self) -> SlotState {
        match self {
            Entry::Free { .. } => SlotState::Free,
            Entry::Dequeued => SlotState::Dequeued,
            Entry::Queued { .. } => SlotState::Queued,
        }
    }

    const fn raw(self) -> RawEntry {
        match self {
            Entry::Free { next } => RawEntry([RawEntry::FREE, next.0, 0, 0]),
            Entry::Dequeued => RawEntry([RawEntry::DEQUEUED, 0, 0, 0]),
            Entry::Queued { queue, prev, next } => {
                RawEntry([RawEntry::QUEUED, queue, prev.0, next.0])
            }
        }
    }
}

/// An [`Entry`] as it sits in memory: a tag byte and three operands.
///
/// Pool tables live in box memory, so every byte pattern has to be a valid
/// `RawEntry`. Entries are decoded on every read, and an unknown tag is
/// [`PoolError::Corrupt`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
struct RawEntry([u8; 4]);

impl RawEntry {
    const FREE: u8 = 0;
    const DEQUEUED: u8 = 1;
    const QUEUED: u8 = 2;
}

impl TryFrom<RawEntry> for Entry {
    type Error = PoolError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let [tag, a, b, c] = raw.0;
        match tag {
            RawEntry::FREE => Ok(Entry::Free { next: Slot(a) }),
            RawEntry::DEQUEUED => Ok(Entry::Dequeued),
            RawEntry::QUEUED => Ok(Entry::Queued {
                queue: a,
                prev: Slot(b),
                next: Slot(c),
            }),
            _ => Err(PoolError::Corrupt),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Ends {
    head: Slot,
    tail: Slot,
}

impl Ends {
    const EMPTY: Self = Self {
        head: Slot::INVALID,
        tail: Slot::INVALID,
    };
}

/// Management state, guarded by the pool's spinlock. Made of plain integers
/// only, see [`RawEntry`].
struct Table<const N: usize, const Q: usize> {
    num: usize,
    first_free: Slot,
    entries: [RawEntry; N],
    queues: [Ends; Q],
}

impl<const N: usize, const Q: usize> Table<N, Q> {
    const fn new(num: usize) -> Self {
        let mut entries = [Entry::Dequeued.raw(); N];
        let mut i = 0;
        while i < num {
            let next = if i + 1 < num {
                Slot((i + 1) as u8)
            } else {
                Slot::INVALID
            };
            entries[i] = Entry::Free { next }.raw();
            i += 1;
        }
        Self {
            num,
            first_free: if num > 0 { Slot(0) } else { Slot::INVALID },
            entries,
            queues: [Ends::EMPTY; Q],
        }
    }

    /// Usable slots. `num` is box-writable, so it's clamped on every use.
    fn usable(&self) -> usize {
        self.num.min(N)
    }

    fn index(&self, slot: Slot) -> Result<usize, PoolError> {
        let i = slot.index();
        if i < self.usable() {
            Ok(i)
        } else {
            Err(PoolError::OutOfRange)
        }
    }

    fn entry(&self, i: usize) -> Result<Entry, PoolError> {
        let raw = self.entries.get(i).ok_or(PoolError::OutOfRange)?;
        Entry::try_from(*raw)
    }

    fn set(&mut self, i: usize, entry: Entry) {
        if let Some(raw) = self.entries.get_mut(i) {
            *raw = entry.raw();
        }
    }

    fn ends(&self, which: usize) -> Result<Ends, PoolError> {
        self.queues.get(which).copied().ok_or(PoolError::OutOfRange)
    }

    fn set_ends(&mut self, which: usize, ends: Ends) {
        if let Some(e) = self.queues.get_mut(which) {
            *e = ends;
        }
    }

    fn state(&self, slot: Slot) -> Result<SlotState, PoolError> {
        let i = self.index(slot)?;
        Ok(self.entry(i)?.state())
    }

    fn pop_free(&mut self) -> Option<Slot> {
        let slot = self.first_free;
        let i = self.index(slot).ok()?;
        let Ok(Entry::Free { next }) = self.entry(i) else {
            // The free list head isn't free. Treat the pool as exhausted
            // rather than handing out a slot somebody else owns.
            return None;
        };
        self.first_free = next;
        self.set(i, Entry::Dequeued);
        Some(slot)
    }

    fn push_free(&mut self, slot: Slot) -> Result<(), PoolError> {
        let i = self.index(slot)?;
        match self.entry(i)? {
            Entry::Dequeued => {
                self.set(
                    i,
                    Entry::Free {
                        next: self.first_free,
                    },
                );
                self.first_free = slot;
                Ok(())
            }
            e => Err(PoolError::WrongState(e.state())),
        }
    }

    /// Rewrites the links of the queued entry at `slot`, which some other
    /// entry or queue end points at.
    fn relink(
        &mut self,
        slot: Slot,
        f: impl FnOnce(&mut Slot, &mut Slot),
    ) -> Result<(), PoolError> {
        let i = self.index(slot).map_err(|_| PoolError::Corrupt)?;
        let Entry::Queued {
            queue,
            mut prev,
            mut next,
        } = self.entry(i)?
        else {
            return Err(PoolError::Corrupt);
        };
        f(&mut prev, &mut next);
        self.set(i, Entry::Queued { queue, prev, next });
        Ok(())
    }

    fn enqueue(&mut self, which: usize, slot: Slot) -> Result<(), PoolError> {
        let i = self.index(slot)?;
        let entry = self.entry(i)?;
        if entry != Entry::Dequeued {
            return Err(PoolError::WrongState(entry.state()));
        }
        let mut ends = self.ends(which)?;
        let prev = ends.tail;
        if prev == Slot::INVALID {
            ends.head = slot;
        } else {
            self.relink(prev, |_, next| *next = slot)?;
        }
        ends.tail = slot;
        self.set_ends(which, ends);
        self.set(
            i,
            Entry::Queued {
                queue: which as u8,
                prev,
                next: Slot::INVALID,
            },
        );
        Ok(())
    }

    fn dequeue(&mut self, which: usize, slot: Slot) -> Result<(), PoolError> {
        let i = self.index(slot)?;
        let (prev, next) = match self.entry(i)? {
            Entry::Queued { queue, prev, next }
                if usize::from(queue) == which =>
            {
                (prev, next)
            }
            e => return Err(PoolError::WrongState(e.state())),
        };
        let mut ends = self.ends(which)?;

        if ends.head == slot {
            ends.head = next;
        } else {
            self.relink(prev, |_, n| *n = next)?;
        }
        if ends.tail == slot {
            ends.tail = prev;
        } else {
            self.relink(next, |p, _| *p = prev)?;
        }

        self.set_ends(which, ends);
        self.set(i, Entry::Dequeued);
        Ok(())
    }

    fn head(&self, which: usize) -> Result<Slot, PoolError> {
        let head = self.ends(which)?.head;
        if head == Slot::INVALID {
            Err(PoolError::Empty)
        } else {
            Ok(head)
        }
    }

    /// Walks a queue from head to tail, stopping early if `f` returns
    /// `false`. The walk is bounded by the pool size, so a cycle can't hang
    /// it.
    fn walk(
        &self,
        which: usize,
        mut f: impl FnMut(Slot) -> bool,
    ) -> Result<(), PoolError> {
        let mut slot = self.ends(which)?.head;
        for _ in 0..self.usable() {
            if slot == Slot::INVALID {
                return Ok(());
            }
            let i = self.index(slot).map_err(|_| PoolError::Corrupt)?;
            let Ok(Entry::Queued { next, .. }) = self.entry(i) else {
                return Err(PoolError::Corrupt);
            };
            if !f(slot) {
                return Ok(());
            }
            slot = next;
        }
        if slot == Slot::INVALID {
            Ok(())
        } else {
            Err(PoolError::Corrupt)
        }
    }
}

#[derive(Copy, Clone)]
enum Lock {
    Spin,
    Try,
}

/// A fixed-capacity pool of `T` with `Q` queues threaded through it.
///
/// `N` is the build-time capacity; the pool may be created with fewer usable
/// slots. A blocking pool carries a semaphore whose count tracks the number of
/// free slots, so that `allocate` can wait for one without holding the lock.
pub struct SlotPool<T, const N: usize, const Q: usize = 1> {
    num: usize,
    table: Spinlock<Table<N, Q>>,
    /// Nonzero for blocking pools. A byte rather than an `Option`, so that
    /// whatever the box writes here is still a valid value.
    blocking: u8,
    semaphore: Semaphore,
    items: [T; N],
}

impl<T: SlotInit, const N: usize, const Q: usize> SlotPool<T, N, Q> {
    /// Creates a pool with `num` usable slots (clamped to `N`).
    pub const fn new(num: usize, blocking: bool) -> Self {
        let num = if num > N { N } else { num };
        Self {
            num,
            table: Spinlock::new(Table::new(num)),
            blocking: blocking as u8,
            semaphore: if blocking {
                Semaphore::new(num as u32, num as u32)
            } else {
                Semaphore::new(0, 0)
            },
            items: [const { T::EMPTY }; N],
        }
    }
}

impl<T, const N: usize, const Q: usize> SlotPool<T, N, Q> {
    fn table(
        &self,
        how: Lock,
    ) -> Result<SpinlockGuard<'_, Table<N, Q>>, PoolError> {
        match how {
            Lock::Spin => Ok(self.table.lock()),
            Lock::Try => self.table.try_lock().ok_or(PoolError::Busy),
        }
    }

    /// Number of usable slots.
    pub fn capacity(&self) -> usize {
        self.num.min(N)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking != 0
    }

    fn semaphore(&self) -> Option<&Semaphore> {
        self.is_blocking().then_some(&self.semaphore)
    }

    /// Returns the record in `slot`, if `slot` is in range. Doesn't lock.
    pub fn item(&self, slot: Slot) -> Option<&T> {
        let i = slot.index();
        if i < self.capacity() {
            self.items.get(i)
        } else {
            None
        }
    }

    pub fn state(&self, slot: Slot) -> Result<SlotState, PoolError> {
        self.table.lock().state(slot)
    }

    pub fn try_state(&self, slot: Slot) -> Result<SlotState, PoolError> {
        self.table(Lock::Try)?.state(slot)
    }

    /// Number of slots on the free list.
    pub fn free_count(&self) -> usize {
        self.census().0
    }

    /// Counts slots in each state, as `(free, dequeued, queued)`.
    pub fn census(&self) -> (usize, usize, usize) {
        let table = self.table.lock();
        let mut counts = (0, 0, 0);
        for i in 0..table.usable() {
            match table.entry(i).map(Entry::state) {
                Ok(SlotState::Free) => counts.0 += 1,
                Ok(SlotState::Dequeued) => counts.1 += 1,
                Ok(SlotState::Queued) => counts.2 += 1,
                // Not counted.
                Err(_) => (),
            }
        }
        counts
    }

    /// Allocates a slot, waiting up to `timeout` for one to be freed if this
    /// is a blocking pool. Non-blocking pools fail straight away when empty.
    pub fn allocate(
        &self,
        timeout: Timeout,
        clock: &impl Clock,
    ) -> Result<Slot, PoolError> {
        if let Some(sem) = self.semaphore() {
            sem.pend(timeout, clock).map_err(|_| PoolError::Timeout)?;
        }
        self.take_free(Lock::Spin)
    }

    /// Allocates a slot if one is free and the pool isn't locked.
    pub fn try_allocate(&self) -> Result<Slot, PoolError> {
        if let Some(sem) = self.semaphore() {
            if !sem.try_pend() {
                return Err(PoolError::Exhausted);
            }
        }
        self.take_free(Lock::Try)
    }

    /// Pops the free list. The semaphore, if any, has already been taken, and
    /// is given back if no slot comes of it.
    fn take_free(&self, how: Lock) -> Result<Slot, PoolError> {
        let slot = self
            .table(how)
            .and_then(|mut t| t.pop_free().ok_or(PoolError::Exhausted));
        if slot.is_err() {
            self.post_free();
        }
        slot
    }

    fn post_free(&self) {
        if let Some(sem) = self.semaphore() {
            let posted = sem.post();
            debug_assert!(posted.is_ok(), "pool semaphore out of step");
        }
    }

    /// Returns an allocated, unqueued slot to the free list.
    ///
    /// Freeing a slot that is already free, or still queued, is refused and
    /// reported as [`PoolError::WrongState`] with the slot's current state;
    /// the pool is left as it was.
    pub fn free(&self, slot: Slot) -> Result<(), PoolError> {
        self.release(slot, Lock::Spin)
    }

    pub fn try_free(&self, slot: Slot) -> Result<(), PoolError> {
        self.release(slot, Lock::Try)
    }

    fn release(&self, slot: Slot, how: Lock) -> Result<(), PoolError> {
        self.table(how)?.push_free(slot)?;
        // The lock is dropped before posting, so a waiter woken by this never
        // finds the pool locked by us.
        self.post_free();
        Ok(())
    }

    /// Returns a handle on queue `which` of this pool.
    pub fn queue(&self, which: usize) -> PoolQueue<'_, T, N, Q> {
        PoolQueue { pool: self, which }
    }
}

/// One of the FIFO queues threaded through a [`SlotPool`].
pub struct PoolQueue<'a, T, const N: usize, const Q: usize> {
    pool: &'a SlotPool<T, N, Q>,
    which: usize,
}

impl<'a, T, const N: usize, const Q: usize> PoolQueue<'a, T, N, Q> {
    pub fn pool(&self) -> &'a SlotPool<T, N, Q> {
        self.pool
    }

    /// Appends an allocated slot at the tail.
    pub fn enqueue(&self, slot: Slot) -> Result<(), PoolError> {
        self.pool.table(Lock::Spin)?.enqueue(self.which, slot)
    }

    pub fn try_enqueue(&self, slot: Slot) -> Result<(), PoolError> {
        self.pool.table(Lock::Try)?.enqueue(self.which, slot)
    }

    /// Unlinks `slot`, which may be anywhere in the queue.
    pub fn dequeue(&self, slot: Slot) -> Result<(), PoolError> {
        self.pool.table(Lock::Spin)?.dequeue(self.which, slot)
    }

    pub fn try_dequeue(&self, slot: Slot) -> Result<(), PoolError> {
        self.pool.table(Lock::Try)?.dequeue(self.which, slot)
    }

    /// Unlinks and returns the head of the queue.
    pub fn dequeue_first(&self) -> Result<Slot, PoolError> {
        self.pop(Lock::Spin)
    }

    pub fn try_dequeue_first(&self) -> Result<Slot, PoolError> {
        self.pop(Lock::Try)
    }

    fn pop(&self, how: Lock) -> Result<Slot, PoolError> {
        let mut table = self.pool.table(how)?;
        let head = table.head(self.which)?;
        table.dequeue(self.which, head)?;
        Ok(head)
    }

    /// Returns the first queued slot whose record satisfies `pred`, leaving
    /// it in the queue.
    ///
    /// `pred` runs with the pool's spinlock held, so it must be quick and must
    /// not touch this pool.
    pub fn find_first(
        &self,
        pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, PoolError> {
        self.search(Lock::Spin, pred)
    }

    pub fn try_find_first(
        &self,
        pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, PoolError> {
        self.search(Lock::Try, pred)
    }

    fn search(
        &self,
        how: Lock,
        mut pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, PoolError> {
        let table = self.pool.table(how)?;
        let items = &self.pool.items;
        let mut found = None;
        table.walk(self.which, |slot| {
            let hit = items.get(slot.index()).is_some_and(|t| pred(slot, t));
            if hit {
                found = Some(slot);
            }
            !hit
        })?;
        found.ok_or(PoolError::NoMatch)
    }

    /// Snapshot of the queue, head first.
    pub fn slots(&self) -> heapless::Vec<Slot, N> {
        let table = self.pool.table.lock();
        let mut out = heapless::Vec::new();
        // A corrupt queue yields whatever could be walked before the damage.
        let _ = table.walk(self.which, |slot| out.push(slot).is_ok());
        out
    }

    pub fn is_empty(&self) -> bool {
        matches!(
            self.pool.table.lock().head(self.which),
            Err(PoolError::Empty)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use proptest::prelude::*;

    struct Rec(AtomicU32);

    impl SlotInit for Rec {
        const EMPTY: Self = Rec(AtomicU32::new(0));
    }

    struct NoClock;

    impl Clock for NoClock {
        fn now_ms(&self) -> u64 {
            0
        }
    }

    type Pool = SlotPool<Rec, 8, 2>;

    #[test]
    fn fresh_pool_is_all_free() {
        let pool = Pool::new(5, false);
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.census(), (5, 0, 0));
        assert_eq!(pool.item(Slot(5)).map(|_| ()), None);
    }

    #[test]
    fn capacity_is_clamped() {
        let pool = Pool::new(100, false);
        assert_eq!(pool.capacity(), 8);
    }

    #[test]
    fn exhausted_pool_reports_it() {
        let pool = Pool::new(2, false);
        assert_eq!(pool.try_allocate(), Ok(Slot(0)));
        assert_eq!(pool.try_allocate(), Ok(Slot(1)));
        assert_eq!(pool.try_allocate(), Err(PoolError::Exhausted));
        assert_eq!(
            pool.allocate(Timeout::Forever, &NoClock),
            Err(PoolError::Exhausted)
        );
    }

    #[test]
    fn blocking_pool_times_out_when_empty() {
        let pool = Pool::new(1, true);
        let s = pool.allocate(Timeout::Ms(0), &NoClock).unwrap();
        assert_eq!(
            pool.allocate(Timeout::Ms(0), &NoClock),
            Err(PoolError::Timeout)
        );
        pool.free(s).unwrap();
        assert_eq!(pool.allocate(Timeout::Ms(0), &NoClock), Ok(s));
    }

    #[test]
    fn double_free_is_refused() {
        let pool = Pool::new(3, true);
        let s = pool.try_allocate().unwrap();
        pool.free(s).unwrap();
        assert_eq!(
            pool.free(s),
            Err(PoolError::WrongState(SlotState::Free))
        );
        assert_eq!(pool.census(), (3, 0, 0));
        // And the semaphore didn't get an extra unit out of it.
        for _ in 0..3 {
            pool.try_allocate().unwrap();
        }
        assert_eq!(pool.try_allocate(), Err(PoolError::Exhausted));
    }

    #[test]
    fn queued_slot_cannot_be_freed_or_requeued() {
        let pool = Pool::new(3, false);
        let q = pool.queue(0);
        let s = pool.try_allocate().unwrap();
        q.enqueue(s).unwrap();
        assert_eq!(
            pool.free(s),
            Err(PoolError::WrongState(SlotState::Queued))
        );
        assert_eq!(
            q.enqueue(s),
            Err(PoolError::WrongState(SlotState::Queued))
        );
        assert_eq!(
            pool.queue(1).enqueue(s),
            Err(PoolError::WrongState(SlotState::Queued))
        );
    }

    #[test]
    fn scribbled_table_is_decoded_not_trusted() {
        let mut pool = Pool::new(4, false);
        let s = pool.try_allocate().unwrap();
        pool.queue(0).enqueue(s).unwrap();
        {
            let mut t = pool.table.lock();
            t.entries[s.index()] = RawEntry([0xA5, 0xFF, 0xFF, 0xFF]);
            t.num = usize::MAX;
        }
        pool.num = usize::MAX;

        assert_eq!(pool.state(s), Err(PoolError::Corrupt));
        assert_eq!(pool.queue(0).try_dequeue_first(), Err(PoolError::Corrupt));
        assert_eq!(pool.state(Slot(200)), Err(PoolError::OutOfRange));
        // The bad entry isn't counted; the lengths are clamped to N.
        assert_eq!(pool.census(), (3, 4, 0));
        assert_eq!(pool.capacity(), 8);
        assert!(pool.item(Slot(7)).is_some());
        assert!(pool.item(Slot(8)).is_none());
    }

    #[test]
    fn free_slot_cannot_be_enqueued() {
        let pool = Pool::new(3, false);
        assert_eq!(
            pool.queue(0).enqueue(Slot(1)),
            Err(PoolError::WrongState(SlotState::Free))
        );
        assert_eq!(pool.queue(0).enqueue(Slot(7)), Err(PoolError::OutOfRange));
    }

    #[test]
    fn interior_dequeue_relinks_neighbours() {
        let pool = Pool::new(4, false);
        let q = pool.queue(0);
        let slots: Vec<Slot> =
            (0..4).map(|_| pool.try_allocate().unwrap()).collect();
        for &s in &slots {
            q.enqueue(s).unwrap();
        }
        q.dequeue(slots[1]).unwrap();
        q.dequeue(slots[3]).unwrap();
        assert_eq!(q.slots().as_slice(), &[slots[0], slots[2]]);
        assert_eq!(
            q.dequeue(slots[1]),
            Err(PoolError::WrongState(SlotState::Dequeued))
        );
        assert_eq!(q.dequeue_first(), Ok(slots[0]));
        assert_eq!(q.dequeue_first(), Ok(slots[2]));
        assert_eq!(q.dequeue_first(), Err(PoolError::Empty));
        assert!(q.is_empty());
    }

    #[test]
    fn queues_in_one_pool_are_independent() {
        let pool = Pool::new(4, false);
        let (todo, done) = (pool.queue(0), pool.queue(1));
        let a = pool.try_allocate().unwrap();
        let b = pool.try_allocate().unwrap();
        todo.enqueue(a).unwrap();
        done.enqueue(b).unwrap();
        assert_eq!(
            done.dequeue(a),
            Err(PoolError::WrongState(SlotState::Queued))
        );
        assert_eq!(todo.dequeue_first(), Ok(a));
        done.enqueue(a).unwrap();
        assert_eq!(done.slots().as_slice(), &[b, a]);
        assert!(todo.is_empty());
    }

    #[test]
    fn find_first_sees_records() {
        let pool = Pool::new(4, false);
        let q = pool.queue(0);
        for v in [10, 20, 30] {
            let s = pool.try_allocate().unwrap();
            pool.item(s).unwrap().0.store(v, Ordering::Relaxed);
            q.enqueue(s).unwrap();
        }
        let hit = q.find_first(|_, r| r.0.load(Ordering::Relaxed) >= 20);
        assert_eq!(hit, Ok(Slot(1)));
        assert_eq!(
            q.find_first(|_, r| r.0.load(Ordering::Relaxed) == 99),
            Err(PoolError::NoMatch)
        );
        // Still queued.
        assert_eq!(q.slots().len(), 3);
    }

    #[test]
    fn try_variants_fail_on_held_lock() {
        let pool = Pool::new(4, false);
        let s = pool.try_allocate().unwrap();
        let q = pool.queue(0);
        let guard = pool.table.lock();
        assert_eq!(pool.try_allocate(), Err(PoolError::Busy));
        assert_eq!(q.try_enqueue(s), Err(PoolError::Busy));
        assert_eq!(q.try_dequeue_first(), Err(PoolError::Busy));
        assert_eq!(q.try_find_first(|_, _| true), Err(PoolError::Busy));
        assert_eq!(pool.try_free(s), Err(PoolError::Busy));
        drop(guard);
        assert_eq!(pool.try_free(s), Ok(()));
    }

    #[test]
    fn busy_try_allocate_returns_semaphore_unit() {
        let pool = Pool::new(1, true);
        let guard = pool.table.lock();
        assert_eq!(pool.try_allocate(), Err(PoolError::Busy));
        drop(guard);
        assert_eq!(pool.try_allocate(), Ok(Slot(0)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Free(usize),
        Enqueue(usize),
        Dequeue(usize),
        DequeueFirst,
        Requeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Allocate),
            (0..8usize).prop_map(Op::Free),
            (0..8usize).prop_map(Op::Enqueue),
            (0..8usize).prop_map(Op::Dequeue),
            Just(Op::DequeueFirst),
            Just(Op::Requeue),
        ]
    }

    proptest! {
        #[test]
        fn pool_and_queue_track_a_model(
            num in 1..=8usize,
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let pool = SlotPool::<Rec, 8, 1>::new(num, true);
            let q = pool.queue(0);
            // Model: which slots are allocated, and the queue contents.
            let mut held: Vec<Slot> = Vec::new();
            let mut fifo: Vec<Slot> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => match pool.try_allocate() {
                        Ok(s) => {
                            prop_assert!(s.index() < num);
                            prop_assert!(!held.contains(&s));
                            held.push(s);
                        }
                        Err(e) => {
                            prop_assert_eq!(e, PoolError::Exhausted);
                            prop_assert_eq!(held.len(), num);
                        }
                    },
                    Op::Free(i) => {
                        let s = Slot(i as u8);
                        let r = pool.free(s);
                        if held.contains(&s) && !fifo.contains(&s) {
                            prop_assert_eq!(r, Ok(()));
                            held.retain(|&h| h != s);
                        } else {
                            prop_assert!(r.is_err());
                        }
                    }
                    Op::Enqueue(i) => {
                        let s = Slot(i as u8);
                        let r = q.enqueue(s);
                        if held.contains(&s) && !fifo.contains(&s) {
                            prop_assert_eq!(r, Ok(()));
                            fifo.push(s);
                        } else {
                            prop_assert!(r.is_err());
                        }
                    }
                    Op::Dequeue(i) => {
                        let s = Slot(i as u8);
                        let r = q.dequeue(s);
                        if fifo.contains(&s) {
                            prop_assert_eq!(r, Ok(()));
                            fifo.retain(|&f| f != s);
                        } else {
                            prop_assert!(r.is_err());
                        }
                    }
                    Op::DequeueFirst => {
                        let r = q.dequeue_first();
                        if fifo.is_empty() {
                            prop_assert_eq!(r, Err(PoolError::Empty));
                        } else {
                            prop_assert_eq!(r, Ok(fifo.remove(0)));
                        }
                    }
                    Op::Requeue => {
                        // Popping the head and putting it straight back
                        // moves it to the tail.
                        if let Ok(s) = q.dequeue_first() {
                            prop_assert_eq!(s, fifo.remove(0));
                            q.enqueue(s).unwrap();
                            fifo.push(s);
                            prop_assert_eq!(q.slots().last().copied(), Some(s));
                        }
                    }
                }

                let (free, dequeued, queued) = pool.census();
                prop_assert_eq!(free + dequeued + queued, num);
                prop_assert_eq!(queued, fifo.len());
                prop_assert_eq!(dequeued + queued, held.len());
                let slots = q.slots();
                prop_assert_eq!(slots.as_slice(), fifo.as_slice());
                prop_assert_eq!(
                    pool.semaphore().map(|s| s.count() as usize),
                    Some(free)
                );
            }
        }
    }
}
