//! The ring handle: slot claiming, the control call, completion draining, and lifecycle.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::{fmt, io, ptr};

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::error::{
    ClaimError, DrainError, EnterError, RegisterError, SetupError, TeardownError,
};
use crate::queue::{CompletionQueue, SubmissionQueue};
use crate::registry::{FileRegistry, PinnedBuffer};
use crate::setup::RingBuilder;
use crate::sys::{self, Cqe, EnterFlags, FeatureFlags, Opcode, Params, Sqe, SqeFlags};

/// An `io_uring` instance: the ring descriptor, the negotiated parameters, the two
/// shared-memory queues, the fixed-resource registries, and a monotonically increasing
/// operation-id generator.
///
/// The handle is designed to be shared: any number of threads may claim slots concurrently
/// (the claim protocol is lock-free), while each queue sits behind a read/write lock whose
/// write side is only ever taken by [`close`]. Exactly one thread at a time should invoke
/// [`enter`] per ring; concurrent calls are harmless but waste wakeups.
///
/// [`close`]: #method.close
/// [`enter`]: #method.enter
pub struct Ring {
    /// The ring descriptor; -1 once the ring has been closed.
    fd: AtomicI32,
    params: Params,
    features: FeatureFlags,

    sq: RwLock<Option<SubmissionQueue>>,
    cq: RwLock<Option<CompletionQueue>>,

    /// Source of correlation tags for callers that want distinct ones; wraps at 2^64.
    id: AtomicU64,

    files: Mutex<FileRegistry>,
    /// Buffers pinned for the kernel. Held until the ring closes so the kernel can never
    /// observe a dangling region.
    buffers: Mutex<Vec<PinnedBuffer>>,
    /// Completions popped off the ring by a consumer that was waiting for a different
    /// correlation tag. The ring head advances strictly contiguously; out-of-order
    /// consumption happens here instead.
    parked: SegQueue<Completion>,
}

impl Ring {
    /// Create a ring with the given submission queue capacity and default flags. See
    /// [`RingBuilder`] for the tunable variant.
    pub fn new(entries: u32) -> Result<Self, SetupError> {
        RingBuilder::new().with_entries(entries).build()
    }

    pub(crate) fn from_parts(
        fd: RawFd,
        params: Params,
        features: FeatureFlags,
        sq: SubmissionQueue,
        cq: CompletionQueue,
    ) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            params,
            features,
            sq: RwLock::new(Some(sq)),
            cq: RwLock::new(Some(cq)),
            id: AtomicU64::new(0),
            files: Mutex::new(FileRegistry::new()),
            buffers: Mutex::new(Vec::new()),
            parked: SegQueue::new(),
        }
    }

    /// The raw ring descriptor, or -1 once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }
    /// The negotiated submission queue capacity.
    pub fn sq_capacity(&self) -> u32 {
        self.params.sq_entries
    }
    /// The negotiated completion queue capacity.
    pub fn cq_capacity(&self) -> u32 {
        self.params.cq_entries
    }
    /// The feature bits the kernel reported at setup.
    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Produce a fresh correlation tag. Monotonically increasing until it wraps at 2^64.
    pub fn id(&self) -> u64 {
        self.id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Claim exclusive ownership of one submission slot.
    ///
    /// Never blocks: the claim retries internally against concurrent producers and kernel
    /// progress, and reports [`ClaimError::Full`] once its retry budget is exhausted. The
    /// returned guard commits on drop; fill it via the `prep_*` helpers first.
    pub fn claim_slot(&self) -> Result<SqeSlot<'_>, ClaimError> {
        let guard = self.sq.read();
        let claimed = match guard.as_ref() {
            Some(sq) => sq.claim()?,
            None => return Err(ClaimError::Closed),
        };
        Ok(SqeSlot {
            sq: guard,
            claimed,
        })
    }

    /// The control call: hand up to `to_submit` committed entries to the kernel and, with
    /// [`EnterFlags::GETEVENTS`], block until at least `min_complete` completions are
    /// available. Returns the number of entries the kernel accepted.
    ///
    /// This is the only synchronization point with the kernel. If the submission-poll
    /// thread has gone idle, the wakeup flag is added automatically. On failure, and on
    /// partial acceptance, the local fill state is reset so that producers know retrying is
    /// worthwhile.
    pub fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> Result<u32, EnterError> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(EnterError::Closed);
        }
        let guard = self.sq.read();
        let sq = guard.as_ref().ok_or(EnterError::Closed)?;

        sq.submit_barrier();

        let mut flags = flags;
        if sq.needs_wakeup() {
            flags |= EnterFlags::SQ_WAKEUP;
        }

        match sys::io_uring_enter(fd, to_submit, min_complete, flags.bits(), ptr::null()) {
            Err(err) => {
                sq.fill();
                Err(EnterError::Os(err))
            }
            Ok(accepted) => {
                if accepted < to_submit {
                    sq.fill();
                } else {
                    sq.empty();
                }
                Ok(accepted)
            }
        }
    }

    /// Drain whatever completions are currently available, lazily. The iterator first yields
    /// completions parked by [`wait_for`], then pops the ring until it is empty. Finite per
    /// call; a later [`enter`] makes more available.
    ///
    /// [`wait_for`]: #method.wait_for
    /// [`enter`]: #method.enter
    pub fn drain(&self) -> Result<Drain<'_>, DrainError> {
        let guard = self.cq.read();
        if guard.is_none() {
            return Err(DrainError::Closed);
        }
        Ok(Drain {
            cq: guard,
            parked: &self.parked,
        })
    }

    /// Block until the completion with the given correlation tag arrives, parking every
    /// other completion popped along the way for later [`drain`] or [`wait_for`] calls.
    ///
    /// [`drain`]: #method.drain
    pub fn wait_for(&self, user_data: u64) -> Result<Completion, EnterError> {
        loop {
            if let Some(completion) = self.take_parked(user_data) {
                return Ok(completion);
            }
            {
                let guard = self.cq.read();
                let cq = guard.as_ref().ok_or(EnterError::Closed)?;
                let mut found = None;
                while let Some(cqe) = cq.pop() {
                    let completion = Completion::from_cqe(cqe);
                    if completion.user_data == user_data {
                        found = Some(completion);
                        break;
                    }
                    self.parked.push(completion);
                }
                if let Some(completion) = found {
                    return Ok(completion);
                }
            }
            self.enter(0, 1, EnterFlags::GETEVENTS)?;
        }
    }

    /// Scan the parked completions for a tag, cycling through the queue at most once.
    fn take_parked(&self, user_data: u64) -> Option<Completion> {
        for _ in 0..self.parked.len() {
            match self.parked.pop() {
                Ok(completion) if completion.user_data == user_data => return Some(completion),
                Ok(completion) => self.parked.push(completion),
                Err(_) => break,
            }
        }
        None
    }

    /// Register a descriptor in the fixed file table, returning its index. Entries with
    /// [`SqeFlags::FIXED_FILE`] set can then reference the index instead of the raw
    /// descriptor, skipping the descriptor-table lookup on every operation. Registering the
    /// same descriptor twice returns the existing index.
    pub fn register_file(&self, fd: RawFd) -> Result<u32, RegisterError> {
        let ring_fd = self.fd.load(Ordering::Acquire);
        if ring_fd < 0 {
            return Err(RegisterError::Closed);
        }
        self.files.lock().register(ring_fd, fd)
    }

    /// Pin buffers with the kernel for use by the fixed read/write opcodes. The ring takes
    /// ownership; the regions stay pinned (and their addresses stable) until the ring is
    /// closed. Calling again re-registers the union of all buffers passed so far.
    pub fn register_buffers(&self, buffers: Vec<PinnedBuffer>) -> Result<(), RegisterError> {
        let ring_fd = self.fd.load(Ordering::Acquire);
        if ring_fd < 0 {
            return Err(RegisterError::Closed);
        }

        let mut held = self.buffers.lock();
        if !held.is_empty() {
            sys::io_uring_register(ring_fd, sys::IORING_UNREGISTER_BUFFERS, ptr::null(), 0)
                .map_err(RegisterError::Os)?;
        }
        held.extend(buffers);

        let iovecs: Vec<libc::iovec> = held
            .iter()
            .map(|buffer| libc::iovec {
                iov_base: buffer.as_ptr() as *mut libc::c_void,
                iov_len: buffer.len(),
            })
            .collect();

        match sys::io_uring_register(
            ring_fd,
            sys::IORING_REGISTER_BUFFERS,
            iovecs.as_ptr() as *const libc::c_void,
            iovecs.len() as u32,
        ) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!(
                    "buffer registration failed, {} previously pinned buffers are now unregistered: {}",
                    held.len(),
                    err
                );
                Err(RegisterError::Os(err))
            }
        }
    }

    /// The base address and length of a registered buffer, for filling fixed-opcode entries.
    pub fn fixed_buffer(&self, index: usize) -> Option<(u64, usize)> {
        self.buffers
            .lock()
            .get(index)
            .map(|buffer| (buffer.as_ptr() as u64, buffer.len()))
    }

    /// Read access to a registered buffer. Do not call while an operation referencing the
    /// buffer is in flight; the kernel may be writing it concurrently.
    pub fn with_fixed_buffer<R>(&self, index: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.buffers
            .lock()
            .get(index)
            .map(|buffer| f(buffer.as_slice()))
    }

    /// Write access to a registered buffer. Do not call while an operation referencing the
    /// buffer is in flight; the kernel may be reading it concurrently.
    pub fn with_fixed_buffer_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        self.buffers
            .lock()
            .get_mut(index)
            .map(|buffer| f(buffer.as_mut_slice()))
    }

    /// Position of the submission head, masked to a physical slot. `None` once closed.
    pub fn submit_head(&self) -> Option<u32> {
        self.sq.read().as_ref().map(|sq| sq.head() & sq.mask())
    }
    /// Position of the submission tail, masked to a physical slot. `None` once closed.
    pub fn submit_tail(&self) -> Option<u32> {
        self.sq.read().as_ref().map(|sq| sq.tail() & sq.mask())
    }
    /// Position of the completion head, masked to a physical slot. `None` once closed.
    pub fn complete_head(&self) -> Option<u32> {
        self.cq.read().as_ref().map(|cq| cq.head() & cq.mask())
    }
    /// Position of the completion tail, masked to a physical slot. `None` once closed.
    pub fn complete_tail(&self) -> Option<u32> {
        self.cq.read().as_ref().map(|cq| cq.tail() & cq.mask())
    }
    /// Submission entries the kernel discarded for having an invalid opcode.
    pub fn sq_dropped(&self) -> Option<u32> {
        self.sq.read().as_ref().map(|sq| sq.dropped())
    }
    /// Completions the kernel failed to post because the completion ring was full.
    pub fn cq_overflow(&self) -> Option<u32> {
        self.cq.read().as_ref().map(|cq| cq.overflow())
    }
    /// Whether commits have happened since the last fully accepted control call — a hint
    /// that calling [`enter`] is worthwhile.
    ///
    /// [`enter`]: #method.enter
    pub fn sq_fillable(&self) -> Option<bool> {
        self.sq.read().as_ref().map(|sq| sq.is_fillable())
    }
    /// Completions currently ready to drain.
    pub fn cq_ready(&self) -> Option<u32> {
        self.cq.read().as_ref().map(|cq| cq.available())
    }

    /// Close the ring: unmap both queues and release the descriptor, invalidating the
    /// registries with it. Takes exclusive locks over both queues, so no claim or drain can
    /// race the unmap; it does not wait for kernel-side completion of already-submitted
    /// work. Idempotent; later calls return `Ok`.
    pub fn close(&self) -> Result<(), TeardownError> {
        self.teardown()
    }

    fn teardown(&self) -> Result<(), TeardownError> {
        let mut sq_guard = self.sq.write();
        let mut cq_guard = self.cq.write();

        let mut first: Option<TeardownError> = None;

        if let Some(sq) = sq_guard.take() {
            if let Err(err) = sq.unmap() {
                first.get_or_insert(TeardownError::Munmap(err));
            }
        }
        if let Some(cq) = cq_guard.take() {
            if let Err(err) = cq.unmap() {
                first.get_or_insert(TeardownError::Munmap(err));
            }
        }

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            log::debug!("closing io_uring fd {}", fd);
            let res = unsafe { libc::close(fd) };
            if res < 0 {
                first.get_or_insert(TeardownError::Close(io::Error::last_os_error()));
            }
        }

        match first {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("fd", &self.fd())
            .field("sq_entries", &self.params.sq_entries)
            .field("cq_entries", &self.params.cq_entries)
            .field("features", &self.features)
            .finish()
    }
}

/// Exclusive ownership of one claimed submission slot.
///
/// The slot was reserved by advancing the shared tail, so it will be handed to the kernel by
/// the next control call no matter what; the entry starts out zeroed (a no-op). Fill it with
/// one of the `prep_*` helpers, then [`commit`]. Dropping the guard commits as well — the
/// two-phase split only exists because populating the entry is several plain writes, and the
/// kernel must not observe a half-written entry.
///
/// [`commit`]: #method.commit
pub struct SqeSlot<'ring> {
    sq: RwLockReadGuard<'ring, Option<SubmissionQueue>>,
    claimed: u32,
}

impl<'ring> SqeSlot<'ring> {
    fn sq(&self) -> &SubmissionQueue {
        self.sq
            .as_ref()
            .expect("slot guard outlived its submission queue")
    }

    /// The physical slot index this claim owns.
    pub fn index(&self) -> u32 {
        self.claimed & self.sq().mask()
    }

    /// Raw access to the claimed entry, for opcodes without a `prep_*` helper.
    ///
    /// # Safety
    ///
    /// Addresses written into the entry are handed to the kernel verbatim. The caller must
    /// guarantee that any referenced memory stays valid, and is not moved or freed, until the
    /// corresponding completion has been observed.
    pub unsafe fn sqe_mut(&mut self) -> &mut Sqe {
        &mut *self.sq().sqe_at(self.claimed)
    }

    fn fill(&mut self, f: impl FnOnce(&mut Sqe)) {
        // The claim owns this entry exclusively, and the read guard pins the mapping.
        unsafe { f(&mut *self.sq().sqe_at(self.claimed)) }
    }

    /// Prepare a no-op carrying a correlation tag.
    pub fn prep_nop(&mut self, user_data: u64) {
        self.fill(|sqe| {
            sqe.opcode = Opcode::Nop as u8;
            sqe.user_data = user_data;
        });
    }

    /// Prepare a read into `buf` at the given file offset.
    ///
    /// # Safety
    ///
    /// The kernel writes into `buf` when the operation executes, which may be after this
    /// borrow ends. The caller must keep the buffer alive and unmoved until the completion
    /// with this `user_data` has been observed.
    pub unsafe fn prep_read(&mut self, fd: RawFd, buf: &mut [u8], offset: u64, user_data: u64) {
        let addr = buf.as_mut_ptr() as u64;
        let len = buf.len() as u32;
        self.fill(|sqe| {
            sqe.opcode = Opcode::Read as u8;
            sqe.fd = fd;
            sqe.off = offset;
            sqe.addr = addr;
            sqe.len = len;
            sqe.user_data = user_data;
        });
    }

    /// Prepare a write of `buf` at the given file offset.
    ///
    /// # Safety
    ///
    /// The kernel reads `buf` when the operation executes, which may be after this borrow
    /// ends. The caller must keep the buffer alive, unmoved, and unmodified until the
    /// completion with this `user_data` has been observed.
    pub unsafe fn prep_write(&mut self, fd: RawFd, buf: &[u8], offset: u64, user_data: u64) {
        let addr = buf.as_ptr() as u64;
        let len = buf.len() as u32;
        self.fill(|sqe| {
            sqe.opcode = Opcode::Write as u8;
            sqe.fd = fd;
            sqe.off = offset;
            sqe.addr = addr;
            sqe.len = len;
            sqe.user_data = user_data;
        });
    }

    /// Prepare a read into a slice of registered buffer `buf_index`, at file offset
    /// `offset`. `addr` must lie within that registered buffer (see [`Ring::fixed_buffer`]).
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay within the registered region for `buf_index`.
    pub unsafe fn prep_read_fixed(
        &mut self,
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        buf_index: u16,
        user_data: u64,
    ) {
        self.fill(|sqe| {
            sqe.opcode = Opcode::ReadFixed as u8;
            sqe.fd = fd;
            sqe.off = offset;
            sqe.addr = addr;
            sqe.len = len;
            sqe.buf_index = buf_index;
            sqe.user_data = user_data;
        });
    }

    /// Prepare a write from a slice of registered buffer `buf_index`, at file offset
    /// `offset`.
    ///
    /// # Safety
    ///
    /// Same requirement as [`prep_read_fixed`]: the address range must lie within the
    /// registered region.
    ///
    /// [`prep_read_fixed`]: #method.prep_read_fixed
    pub unsafe fn prep_write_fixed(
        &mut self,
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        buf_index: u16,
        user_data: u64,
    ) {
        self.fill(|sqe| {
            sqe.opcode = Opcode::WriteFixed as u8;
            sqe.fd = fd;
            sqe.off = offset;
            sqe.addr = addr;
            sqe.len = len;
            sqe.buf_index = buf_index;
            sqe.user_data = user_data;
        });
    }

    /// Prepare an fsync of the descriptor.
    pub fn prep_fsync(&mut self, fd: RawFd, user_data: u64) {
        self.fill(|sqe| {
            sqe.opcode = Opcode::Fsync as u8;
            sqe.fd = fd;
            sqe.user_data = user_data;
        });
    }

    /// Prepare a best-effort cancellation of the submission whose correlation tag is
    /// `target_user_data`. Whether the target was actually cancelled is reported through
    /// this entry's own completion.
    pub fn prep_cancel(&mut self, target_user_data: u64, user_data: u64) {
        self.fill(|sqe| {
            sqe.opcode = Opcode::AsyncCancel as u8;
            sqe.fd = -1;
            sqe.addr = target_user_data;
            sqe.user_data = user_data;
        });
    }

    /// Reference the fixed file table instead of a raw descriptor: the entry's `fd` field
    /// becomes an index from [`Ring::register_file`].
    pub fn set_fixed_file(&mut self, index: u32) {
        self.fill(|sqe| {
            sqe.fd = index as i32;
            sqe.flags |= SqeFlags::FIXED_FILE.bits();
        });
    }

    /// Extra per-entry flags.
    pub fn set_flags(&mut self, flags: SqeFlags) {
        self.fill(|sqe| sqe.flags |= flags.bits());
    }

    /// Publish the slot: retire the pending write, point the indirection array at the entry,
    /// and mark the ring fillable. Dropping the guard has the same effect.
    pub fn commit(self) {
        drop(self);
    }
}

impl Drop for SqeSlot<'_> {
    fn drop(&mut self) {
        if let Some(sq) = self.sq.as_ref() {
            sq.commit(self.claimed);
        }
    }
}

/// One result from the completion ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Completion {
    /// The correlation tag of the originating submission.
    pub user_data: u64,
    /// Non-negative: the operation's success value (usually bytes transferred). Negative: a
    /// negated errno.
    pub result: i32,
    pub flags: u32,
}

impl Completion {
    fn from_cqe(cqe: Cqe) -> Self {
        Self {
            user_data: cqe.user_data,
            result: cqe.res,
            flags: cqe.flags,
        }
    }

    /// Decode the kernel result convention.
    pub fn io_result(&self) -> io::Result<usize> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// Lazy iterator over available completions; see [`Ring::drain`].
pub struct Drain<'ring> {
    cq: RwLockReadGuard<'ring, Option<CompletionQueue>>,
    parked: &'ring SegQueue<Completion>,
}

impl Iterator for Drain<'_> {
    type Item = Completion;

    fn next(&mut self) -> Option<Completion> {
        if let Ok(parked) = self.parked.pop() {
            return Some(parked);
        }
        let cq = self.cq.as_ref()?;
        cq.pop().map(Completion::from_cqe)
    }
}

#[cfg(test)]
mod tests {
    use super::Completion;

    #[test]
    fn completion_result_convention() {
        let ok = Completion {
            user_data: 1,
            result: 100,
            flags: 0,
        };
        assert_eq!(ok.io_result().unwrap(), 100);

        let err = Completion {
            user_data: 2,
            result: -libc::EBADF,
            flags: 0,
        };
        let err = err.io_result().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
