//! Ring creation and memory mapping.
//!
//! [`RingBuilder`] negotiates the ring geometry with the kernel and maps the shared regions:
//! the submission ring header, the submission entry array, and the completion ring header.
//! Kernels reporting [`FeatureFlags::SINGLE_MMAP`] serve both ring headers from one mapping,
//! with the completion addresses computed as offsets into it; older kernels need a second,
//! independent mapping.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicU32;
use std::{io, ptr};

use crate::error::SetupError;
use crate::queue::{CompletionQueue, SubmissionQueue};
use crate::ring::Ring;
use crate::sys::{self, Cqe, FeatureFlags, Params, SetupFlags, Sqe};

/// An owned, shared, read-write memory mapping of a ring region. Unmapped on drop;
/// [`unmap`] is the fallible form used during explicit teardown.
///
/// [`unmap`]: #method.unmap
pub(crate) struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map `len` bytes of the ring descriptor at one of the magic ring offsets.
    pub(crate) fn map(fd: RawFd, offset: i64, len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Unmap, surfacing the failure instead of swallowing it like the drop path does.
    pub(crate) fn unmap(self) -> io::Result<()> {
        let (ptr, len) = (self.ptr, self.len);
        mem::forget(self);
        let res = unsafe { libc::munmap(ptr, len) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr, self.len);
        }
    }
}

/// A builder that creates a [`Ring`].
///
/// ```rust,no_run
/// use linux_iou::RingBuilder;
///
/// let ring = RingBuilder::new()
///     .with_entries(256)
///     .build()
///     .expect("failed to create io_uring");
/// ```
pub struct RingBuilder {
    entries: u32,
    flags: SetupFlags,
    cq_entries: Option<u32>,
    sq_thread_cpu: Option<u32>,
    sq_thread_idle: Option<u32>,
}

impl RingBuilder {
    pub fn new() -> Self {
        Self {
            entries: 0,
            flags: SetupFlags::empty(),
            cq_entries: None,
            sq_thread_cpu: None,
            sq_thread_idle: None,
        }
    }

    /// Request a submission queue of `entries` slots. The kernel rounds this up to the next
    /// power of two and reports the negotiated capacity back through [`Ring::sq_capacity`].
    pub fn with_entries(mut self, entries: u32) -> Self {
        self.entries = entries;
        self
    }
    /// A submission queue size suitable for most workloads.
    pub fn with_recommended_entries(self) -> Self {
        self.with_entries(256)
    }
    pub fn with_setup_flags(mut self, flags: SetupFlags) -> Self {
        self.flags |= flags;
        self
    }
    /// Request a completion queue larger than the default of twice the submission queue.
    pub fn with_completion_entry_count(mut self, cq_entries: u32) -> Self {
        self.cq_entries = Some(cq_entries);
        self.flags |= SetupFlags::CQSIZE;
        self
    }
    /// Idle timeout in milliseconds for the kernel submission-poll thread. Implies
    /// [`SetupFlags::SQPOLL`].
    pub fn with_sq_poll_idle(mut self, millis: u32) -> Self {
        self.sq_thread_idle = Some(millis);
        self.flags |= SetupFlags::SQPOLL;
        self
    }
    /// Pin the submission-poll thread to a cpu. Implies [`SetupFlags::SQ_AFF`].
    pub fn with_sq_poll_cpu(mut self, cpu: u32) -> Self {
        self.sq_thread_cpu = Some(cpu);
        self.flags |= SetupFlags::SQ_AFF;
        self
    }

    /// Create the ring: perform the setup call, map the shared regions, and assemble the
    /// handle. On any failure every resource acquired so far is released before the error is
    /// returned.
    pub fn build(self) -> Result<Ring, SetupError> {
        if self.entries == 0 || self.entries > sys::IORING_MAX_ENTRIES {
            return Err(SetupError::InvalidEntryCount(self.entries));
        }

        let mut params = Params::default();
        params.flags = self.flags.bits();
        if let Some(cq_entries) = self.cq_entries {
            params.cq_entries = cq_entries;
        }
        if let Some(cpu) = self.sq_thread_cpu {
            params.sq_thread_cpu = cpu;
        }
        if let Some(idle) = self.sq_thread_idle {
            params.sq_thread_idle = idle;
        }

        let fd = sys::io_uring_setup(self.entries, &mut params).map_err(SetupError::Setup)?;
        let features = FeatureFlags::from_bits_truncate(params.features);

        match map_queues(fd, &params, features) {
            Ok((sq, cq)) => {
                log::debug!(
                    "created io_uring: fd {}, sq {} entries, cq {} entries, features {:?}",
                    fd,
                    params.sq_entries,
                    params.cq_entries,
                    features
                );
                Ok(Ring::from_parts(fd, params, features, sq, cq))
            }
            Err(err) => {
                // The mappings made before the failure are unmapped by their own drops.
                unsafe {
                    let _ = libc::close(fd);
                }
                Err(SetupError::Mmap(err))
            }
        }
    }
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Map the shared regions and build the queue views over them.
fn map_queues(
    fd: RawFd,
    params: &Params,
    features: FeatureFlags,
) -> io::Result<(SubmissionQueue, CompletionQueue)> {
    let single_mmap = features.contains(FeatureFlags::SINGLE_MMAP);

    let sq_header_size =
        params.sq_off.array as usize + params.sq_entries as usize * mem::size_of::<u32>();
    let cq_header_size =
        params.cq_off.cqes as usize + params.cq_entries as usize * mem::size_of::<Cqe>();

    let sq_ring_size = if single_mmap {
        sq_header_size.max(cq_header_size)
    } else {
        sq_header_size
    };

    let sq_ring_mmap = Mmap::map(fd, sys::IORING_OFF_SQ_RING, sq_ring_size)?;
    let sqe_mmap = Mmap::map(
        fd,
        sys::IORING_OFF_SQES,
        params.sq_entries as usize * mem::size_of::<Sqe>(),
    )?;
    let cq_ring_mmap = if single_mmap {
        None
    } else {
        Some(Mmap::map(fd, sys::IORING_OFF_CQ_RING, cq_header_size)?)
    };

    let sq_base = sq_ring_mmap.as_ptr();
    let cq_base = match cq_ring_mmap {
        Some(ref m) => m.as_ptr(),
        None => sq_base,
    };

    unsafe {
        let sqes = sqe_mmap.as_ptr() as *mut Sqe;
        let sq = SubmissionQueue::from_raw(
            sq_base.add(params.sq_off.head as usize) as *const AtomicU32,
            sq_base.add(params.sq_off.tail as usize) as *const AtomicU32,
            sq_base.add(params.sq_off.ring_mask as usize) as *const AtomicU32,
            sq_base.add(params.sq_off.flags as usize) as *const AtomicU32,
            sq_base.add(params.sq_off.dropped as usize) as *const AtomicU32,
            sq_base.add(params.sq_off.array as usize) as *const AtomicU32,
            sqes,
            params.sq_entries,
            Some(sq_ring_mmap),
            Some(sqe_mmap),
        );
        let cq = CompletionQueue::from_raw(
            cq_base.add(params.cq_off.head as usize) as *const AtomicU32,
            cq_base.add(params.cq_off.tail as usize) as *const AtomicU32,
            cq_base.add(params.cq_off.ring_mask as usize) as *const AtomicU32,
            cq_base.add(params.cq_off.overflow as usize) as *const AtomicU32,
            cq_base.add(params.cq_off.cqes as usize) as *const Cqe,
            params.cq_entries,
            cq_ring_mmap,
        );
        Ok((sq, cq))
    }
}
