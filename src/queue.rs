//! The two shared-memory ring data structures.
//!
//! Both queues are views into memory mapped from the ring descriptor and shared with the
//! kernel. Ordinary mutual exclusion cannot protect against the kernel's own writes, so every
//! counter that crosses the user/kernel boundary is accessed through an atomic with explicit
//! acquire/release ordering. Process-local bookkeeping (the pending-write counter and the
//! fill/empty state) lives in ordinary struct fields and never leaves this process.

use std::io;
use std::ptr;
use std::sync::atomic::{fence, spin_loop_hint, AtomicU32, Ordering};

use crate::error::ClaimError;
use crate::setup::Mmap;
use crate::sys::{Cqe, SqFlags, Sqe};

/// How many times a claim restarts after losing the tail compare-and-swap or observing a full
/// ring, before reporting [`ClaimError::Full`]. An unbounded spin would hang a saturated
/// process whose kernel side makes no progress between control calls.
const CLAIM_RETRY_LIMIT: usize = 128;

/// Local submission-side state, driven by the outcome of the control call.
const RING_STATE_EMPTY: u32 = 0;
const RING_STATE_FILLABLE: u32 = 1;

/// The submission ring: a view into the mapped ring header (head, tail, mask, kernel flags,
/// dropped counter, indirection array), the separately mapped entry array, and the
/// process-local claim bookkeeping.
///
/// The claim/commit protocol is lock-free and multi-producer; any number of threads may claim
/// concurrently. The two-phase split exists because populating an entry is several plain
/// writes: the tail compare-and-swap reserves the slot, and the indirection-array store at
/// commit time is what publishes it.
pub(crate) struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: *const AtomicU32,
    flags: *const AtomicU32,
    dropped: *const AtomicU32,
    array: *const AtomicU32,
    sqes: *mut Sqe,
    entry_count: u32,

    /// Entries claimed but not yet committed. Other producers may have advanced the shared
    /// tail past a slot that is still being filled; the control call must not run while this
    /// is nonzero.
    writes: AtomicU32,
    /// [`RING_STATE_EMPTY`] or [`RING_STATE_FILLABLE`].
    state: AtomicU32,

    ring_mmap: Option<Mmap>,
    sqe_mmap: Option<Mmap>,
}

unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    /// Construct the submission-side view from raw pointers into the mapped regions.
    ///
    /// # Safety
    ///
    /// Every pointer must be valid for the lifetime of the queue, correctly aligned, and must
    /// point at memory laid out the way the kernel reported in its offset table. `array` and
    /// `sqes` must both be at least `entry_count` elements long, and `entry_count` must be
    /// the power of two the kernel negotiated.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        ring_mask: *const AtomicU32,
        flags: *const AtomicU32,
        dropped: *const AtomicU32,
        array: *const AtomicU32,
        sqes: *mut Sqe,
        entry_count: u32,
        ring_mmap: Option<Mmap>,
        sqe_mmap: Option<Mmap>,
    ) -> Self {
        debug_assert!(entry_count.is_power_of_two());
        Self {
            head,
            tail,
            ring_mask,
            flags,
            dropped,
            array,
            sqes,
            entry_count,
            writes: AtomicU32::new(0),
            state: AtomicU32::new(RING_STATE_EMPTY),
            ring_mmap,
            sqe_mmap,
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> u32 {
        unsafe { &*self.head }.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn tail(&self) -> u32 {
        unsafe { &*self.tail }.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn mask(&self) -> u32 {
        unsafe { &*self.ring_mask }.load(Ordering::Relaxed)
    }
    /// Entries the kernel discarded because their opcode was invalid.
    #[inline]
    pub(crate) fn dropped(&self) -> u32 {
        unsafe { &*self.dropped }.load(Ordering::Acquire)
    }

    /// Whether the kernel's submission-poll thread has gone idle and must be woken through
    /// the control call.
    #[inline]
    pub(crate) fn needs_wakeup(&self) -> bool {
        let bits = unsafe { &*self.flags }.load(Ordering::Acquire);
        SqFlags::from_bits_truncate(bits).contains(SqFlags::NEED_WAKEUP)
    }

    /// Claim exclusive ownership of one submission slot.
    ///
    /// Reserves the slot by compare-and-swapping the shared tail, increments the
    /// pending-write counter, and zeroes the entry (a zeroed entry is a no-op, so a slot
    /// published before being filled is harmless). Returns the claimed tail value; the entry
    /// itself is at `claimed & mask`. The claim must be paired with [`commit`].
    ///
    /// Fullness is re-checked against a fresh head on every retry, since the kernel may be
    /// consuming entries concurrently.
    ///
    /// [`commit`]: #method.commit
    pub(crate) fn claim(&self) -> Result<u32, ClaimError> {
        for _ in 0..CLAIM_RETRY_LIMIT {
            let head = unsafe { &*self.head }.load(Ordering::Acquire);
            let tail = unsafe { &*self.tail }.load(Ordering::Acquire);
            let next = tail.wrapping_add(1);

            if next.wrapping_sub(head) > self.entry_count {
                spin_loop_hint();
                continue;
            }

            self.update_barrier();
            if unsafe { &*self.tail }
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Another producer won the slot; start over with fresh counters.
                continue;
            }

            self.writes.fetch_add(1, Ordering::AcqRel);

            let sqe = self.sqe_at(tail);
            unsafe { ptr::write_bytes(sqe, 0, 1) };
            return Ok(tail);
        }
        Err(ClaimError::Full)
    }

    /// Pointer to the physical entry for a claimed tail value.
    #[inline]
    pub(crate) fn sqe_at(&self, claimed: u32) -> *mut Sqe {
        unsafe { self.sqes.add((claimed & self.mask()) as usize) }
    }

    /// Publish a claimed slot: point the indirection array at the physical entry with release
    /// ordering (so the entry writes are visible before the index), retire the pending write,
    /// and mark the ring fillable.
    pub(crate) fn commit(&self, claimed: u32) {
        let idx = claimed & self.mask();
        unsafe { &*self.array.add(idx as usize) }.store(idx, Ordering::Release);
        self.writes.fetch_sub(1, Ordering::AcqRel);
        self.fill();
    }

    /// Acquire fence taken before the tail compare-and-swap, pairing with the kernel's
    /// release of its head updates.
    #[inline]
    pub(crate) fn update_barrier(&self) {
        fence(Ordering::Acquire);
    }

    /// Release fence taken before the control call. Also drains in-flight entry writes:
    /// producers that claimed a slot before this tail position may still be populating it,
    /// and the kernel must not read a torn entry.
    pub(crate) fn submit_barrier(&self) {
        while self.writes.load(Ordering::Acquire) != 0 {
            spin_loop_hint();
        }
        fence(Ordering::Release);
    }

    /// Mark the ring as having entries (or free slots) worth acting on. Called after commits,
    /// after a failed control call, and after partial acceptance.
    #[inline]
    pub(crate) fn fill(&self) {
        self.state.store(RING_STATE_FILLABLE, Ordering::Release);
    }
    /// Mark the ring as fully handed to the kernel.
    #[inline]
    pub(crate) fn empty(&self) {
        self.state.store(RING_STATE_EMPTY, Ordering::Release);
    }
    /// Whether producers have committed work since the last fully accepted control call.
    #[inline]
    pub(crate) fn is_fillable(&self) -> bool {
        self.state.load(Ordering::Acquire) == RING_STATE_FILLABLE
    }

    #[cfg(test)]
    pub(crate) fn pending_writes(&self) -> u32 {
        self.writes.load(Ordering::Acquire)
    }

    /// Unmap the ring regions, surfacing the first failure.
    pub(crate) fn unmap(mut self) -> io::Result<()> {
        let mut first = Ok(());
        if let Some(m) = self.ring_mmap.take() {
            if let Err(err) = m.unmap() {
                first = Err(err);
            }
        }
        if let Some(m) = self.sqe_mmap.take() {
            if let Err(err) = m.unmap() {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }
}

/// The completion ring: the kernel advances its tail when publishing results, the process
/// advances its head after consuming them.
///
/// Head advancement is strictly contiguous, one entry at a time, through a compare-and-swap,
/// so concurrent drainers can never double-consume or skip an entry. A consumer that needs a
/// completion other than the next one must pop in order and park what it is not interested in
/// (see [`Ring::wait_for`]).
///
/// [`Ring::wait_for`]: ../ring/struct.Ring.html#method.wait_for
pub(crate) struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: *const AtomicU32,
    overflow: *const AtomicU32,
    cqes: *const Cqe,
    entry_count: u32,

    /// Owned only when the kernel did not report the single-mmap feature; otherwise the
    /// completion header lives inside the submission ring's mapping.
    ring_mmap: Option<Mmap>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// Construct the completion-side view from raw pointers into the mapped region.
    ///
    /// # Safety
    ///
    /// Same requirements as [`SubmissionQueue::from_raw`]: valid, aligned, kernel-reported
    /// layout, `cqes` at least `entry_count` elements.
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        ring_mask: *const AtomicU32,
        overflow: *const AtomicU32,
        cqes: *const Cqe,
        entry_count: u32,
        ring_mmap: Option<Mmap>,
    ) -> Self {
        debug_assert!(entry_count.is_power_of_two());
        Self {
            head,
            tail,
            ring_mask,
            overflow,
            cqes,
            entry_count,
            ring_mmap,
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> u32 {
        unsafe { &*self.head }.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn tail(&self) -> u32 {
        unsafe { &*self.tail }.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn mask(&self) -> u32 {
        unsafe { &*self.ring_mask }.load(Ordering::Relaxed)
    }
    /// Completions the kernel could not post because the ring was full.
    #[inline]
    pub(crate) fn overflow(&self) -> u32 {
        unsafe { &*self.overflow }.load(Ordering::Acquire)
    }

    /// How many completions are currently ready.
    pub(crate) fn available(&self) -> u32 {
        let head = unsafe { &*self.head }.load(Ordering::Acquire);
        let tail = unsafe { &*self.tail }.load(Ordering::Acquire);
        let ready = tail.wrapping_sub(head);
        if ready > self.entry_count {
            // Head ran past tail, or the mapping is corrupt. Report nothing ready rather
            // than hand out garbage entries.
            log::warn!(
                "completion ring reports {} ready entries with capacity {}",
                ready,
                self.entry_count
            );
            return 0;
        }
        ready
    }

    /// Pop the next completion, or `None` if the ring is empty.
    ///
    /// The entry is read before the head compare-and-swap; losing the exchange means another
    /// drainer consumed it, and the stale copy is discarded.
    pub(crate) fn pop(&self) -> Option<Cqe> {
        loop {
            let head = unsafe { &*self.head }.load(Ordering::Acquire);
            let tail = unsafe { &*self.tail }.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let cqe = unsafe { ptr::read_volatile(self.cqes.add((head & self.mask()) as usize)) };

            if unsafe { &*self.head }
                .compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(cqe);
            }
        }
    }

    /// Unmap the completion region, if this queue owns one.
    pub(crate) fn unmap(mut self) -> io::Result<()> {
        match self.ring_mmap.take() {
            Some(m) => m.unmap(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;

    //
    // The protocol is testable without a kernel: both queues are constructed over
    // process-private memory standing in for the shared mappings.
    //

    struct FakeHeader {
        head: AtomicU32,
        tail: AtomicU32,
        mask: AtomicU32,
        flags: AtomicU32,
        aux: AtomicU32,
    }

    impl FakeHeader {
        fn new(count: u32) -> Box<Self> {
            Box::new(Self {
                head: AtomicU32::new(0),
                tail: AtomicU32::new(0),
                mask: AtomicU32::new(count - 1),
                flags: AtomicU32::new(0),
                aux: AtomicU32::new(0),
            })
        }
    }

    struct FakeSq {
        header: Box<FakeHeader>,
        array: Box<[AtomicU32]>,
        _sqes: Box<[Sqe]>,
        queue: SubmissionQueue,
    }

    fn fake_sq(count: u32) -> FakeSq {
        let header = FakeHeader::new(count);
        let array: Box<[AtomicU32]> =
            (0..count).map(|_| AtomicU32::new(u32::max_value())).collect();
        let mut sqes: Box<[Sqe]> = vec![Sqe::default(); count as usize].into_boxed_slice();

        let queue = unsafe {
            SubmissionQueue::from_raw(
                &header.head,
                &header.tail,
                &header.mask,
                &header.flags,
                &header.aux,
                array.as_ptr(),
                sqes.as_mut_ptr(),
                count,
                None,
                None,
            )
        };
        FakeSq {
            header,
            array,
            _sqes: sqes,
            queue,
        }
    }

    struct FakeCq {
        header: Box<FakeHeader>,
        cqes: Box<[Cqe]>,
        queue: CompletionQueue,
    }

    fn fake_cq(count: u32) -> FakeCq {
        let header = FakeHeader::new(count);
        let cqes: Box<[Cqe]> = vec![Cqe::default(); count as usize].into_boxed_slice();

        let queue = unsafe {
            CompletionQueue::from_raw(
                &header.head,
                &header.tail,
                &header.mask,
                &header.aux,
                cqes.as_ptr(),
                count,
                None,
            )
        };
        FakeCq {
            header,
            cqes,
            queue,
        }
    }

    #[test]
    fn claims_fill_to_capacity_and_report_full() {
        let sq = fake_sq(8);

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let claimed = sq.queue.claim().expect("claim within capacity");
            assert!(seen.insert(claimed & sq.queue.mask()));
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(sq.queue.pending_writes(), 8);

        // The ninth claim must fail rather than corrupt the ring.
        assert_eq!(sq.queue.claim(), Err(ClaimError::Full));
        assert_eq!(sq.queue.tail(), 8);

        for claimed in 0..8u32 {
            sq.queue.commit(claimed);
        }
        assert_eq!(sq.queue.pending_writes(), 0);
        assert!(sq.queue.is_fillable());
    }

    #[test]
    fn commit_publishes_indirection_entry() {
        let sq = fake_sq(4);

        let claimed = sq.queue.claim().unwrap();
        assert_eq!(claimed, 0);
        // Not yet published.
        assert_eq!(sq.array[0].load(Ordering::Acquire), u32::max_value());

        sq.queue.commit(claimed);
        assert_eq!(sq.array[0].load(Ordering::Acquire), 0);
        assert_eq!(sq.queue.pending_writes(), 0);
    }

    #[test]
    fn kernel_progress_unblocks_a_full_ring() {
        let sq = fake_sq(4);
        for _ in 0..4 {
            let claimed = sq.queue.claim().unwrap();
            sq.queue.commit(claimed);
        }
        assert_eq!(sq.queue.claim(), Err(ClaimError::Full));

        // The kernel consumes one entry by advancing head.
        sq.header.head.fetch_add(1, Ordering::Release);
        let claimed = sq.queue.claim().expect("slot freed by kernel progress");
        assert_eq!(claimed, 4);
        sq.queue.commit(claimed);
    }

    #[test]
    fn concurrent_claims_never_alias() {
        let sq = Arc::new(fake_sq(64));
        let claimed = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sq = Arc::clone(&sq);
            let claimed = Arc::clone(&claimed);
            handles.push(thread::spawn(move || {
                for _ in 0..16 {
                    let c = sq.queue.claim().expect("capacity is exactly 4 * 16");
                    claimed.lock().push(c);
                    sq.queue.commit(c);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let claimed = claimed.lock();
        let slots: HashSet<u32> = claimed.iter().map(|c| c & sq.queue.mask()).collect();
        assert_eq!(claimed.len(), 64);
        assert_eq!(slots.len(), 64);
        assert_eq!(sq.queue.tail(), 64);
        assert_eq!(sq.queue.pending_writes(), 0);
    }

    #[test]
    fn submit_barrier_waits_for_inflight_writes() {
        let sq = Arc::new(fake_sq(8));
        let claimed = sq.queue.claim().unwrap();
        assert_eq!(sq.queue.pending_writes(), 1);

        let committer = {
            let sq = Arc::clone(&sq);
            thread::spawn(move || {
                thread::yield_now();
                sq.queue.commit(claimed);
            })
        };

        // Returns only once the in-flight write has been retired.
        sq.queue.submit_barrier();
        assert_eq!(sq.queue.pending_writes(), 0);
        committer.join().unwrap();
    }

    #[test]
    fn cq_pops_in_publication_order() {
        let mut cq = fake_cq(8);

        for i in 0..5u64 {
            cq.cqes[i as usize] = Cqe {
                user_data: i,
                res: 100 + i as i32,
                flags: 0,
            };
        }
        cq.header.tail.store(5, Ordering::Release);

        for i in 0..5u64 {
            let cqe = cq.queue.pop().expect("published entry");
            assert_eq!(cqe.user_data, i);
            assert_eq!(cqe.res, 100 + i as i32);
        }
        assert_eq!(cq.queue.pop(), None);
        assert_eq!(cq.queue.head(), 5);
    }

    #[test]
    fn cq_head_never_passes_tail() {
        let cq = fake_cq(4);
        assert_eq!(cq.queue.pop(), None);
        assert_eq!(cq.queue.head(), 0);
        assert_eq!(cq.queue.available(), 0);
    }

    #[test]
    fn concurrent_drainers_never_double_consume() {
        let mut cq = fake_cq(64);
        for i in 0..64u64 {
            cq.cqes[i as usize] = Cqe {
                user_data: i,
                res: 0,
                flags: 0,
            };
        }
        cq.header.tail.store(64, Ordering::Release);

        let cq = Arc::new(cq);
        let drained = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cq = Arc::clone(&cq);
            let drained = Arc::clone(&drained);
            handles.push(thread::spawn(move || {
                while let Some(cqe) = cq.queue.pop() {
                    drained.lock().push(cqe.user_data);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = drained.lock();
        let unique: HashSet<u64> = drained.iter().copied().collect();
        assert_eq!(drained.len(), 64);
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn claimed_entry_is_zeroed() {
        let sq = fake_sq(4);
        unsafe {
            (*sq.queue.sqe_at(0)).user_data = 0xDEAD_BEEF;
        }
        // Same physical slot comes back zeroed on claim.
        let claimed = sq.queue.claim().unwrap();
        let sqe = unsafe { &*sq.queue.sqe_at(claimed) };
        assert_eq!(sqe.user_data, 0);
        assert_eq!(sqe.opcode, 0);
        sq.queue.commit(claimed);
    }
}
