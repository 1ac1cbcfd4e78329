//! Raw definitions of the structures, constants, and system calls that make up the
//! `io_uring` kernel ABI.
//!
//! Everything in this module mirrors `<linux/io_uring.h>` exactly; the safe wrappers live in
//! the [`ring`], [`setup`], and [`queue`] modules.
//!
//! [`ring`]: ../ring/index.html
//! [`setup`]: ../setup/index.html
//! [`queue`]: ../queue/index.html

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_long, c_void};

/// Magic mmap offset selecting the submission ring header.
pub const IORING_OFF_SQ_RING: i64 = 0;
/// Magic mmap offset selecting the completion ring header.
pub const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
/// Magic mmap offset selecting the submission entry array.
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

/// The largest submission queue the kernel will set up.
pub const IORING_MAX_ENTRIES: u32 = 32768;

// The kernel-side sigset is 64 bits, not glibc's 1024-bit sigset_t. io_uring_enter validates
// the size argument against the kernel's own width whenever a mask is passed.
const KERNEL_SIGSET_SIZE: usize = 8;

/// Offsets into the submission ring mapping, reported back by the kernel at setup.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Offsets into the completion ring mapping, reported back by the kernel at setup.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct CqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// The parameter block passed to [`io_uring_setup`]. The caller fills in the requested flags
/// and optional SQPOLL tuning; the kernel fills in the negotiated entry counts, the feature
/// bits, and the two offset tables.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqOffsets,
    pub cq_off: CqOffsets,
}

/// One submission queue entry, exactly 64 bytes.
///
/// A zeroed entry is a valid no-op, which is what [`claim`] hands out before the caller
/// populates it.
///
/// [`claim`]: ../ring/struct.Ring.html#method.claim_slot
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub rw_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub _pad2: [u64; 2],
}

/// One completion queue entry, exactly 16 bytes. `res` follows the kernel convention:
/// non-negative values are the operation's success value (usually a byte count), negative
/// values are a negated errno.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

/// The operation codes this crate knows how to prepare. The kernel defines many more; raw
/// access to the [`Sqe`] allows using any of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Readv = 1,
    Writev = 2,
    Fsync = 3,
    ReadFixed = 4,
    WriteFixed = 5,
    AsyncCancel = 14,
    Read = 22,
    Write = 23,
}

bitflags::bitflags! {
    /// Flags accepted by [`io_uring_setup`] in [`Params::flags`].
    pub struct SetupFlags: u32 {
        /// Poll for completions instead of relying on interrupts. Only valid on files opened
        /// with `O_DIRECT`.
        const IOPOLL = 1 << 0;
        /// Have a kernel thread poll the submission queue, removing the need to call
        /// [`io_uring_enter`] for submission. The thread idles after
        /// [`Params::sq_thread_idle`] milliseconds and must then be woken via
        /// [`EnterFlags::SQ_WAKEUP`].
        const SQPOLL = 1 << 1;
        /// Bind the SQPOLL thread to the cpu in [`Params::sq_thread_cpu`].
        const SQ_AFF = 1 << 2;
        /// Honor [`Params::cq_entries`] instead of defaulting to twice the SQ size.
        const CQSIZE = 1 << 3;
        /// Clamp the entry counts to the supported maximum instead of failing.
        const CLAMP = 1 << 4;
        /// Share the async backend of the ring identified by [`Params::wq_fd`].
        const ATTACH_WQ = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Feature bits reported by the kernel in [`Params::features`].
    pub struct FeatureFlags: u32 {
        /// The SQ and CQ ring headers can be mapped with a single mmap; the CQ addresses are
        /// offsets into the SQ mapping.
        const SINGLE_MMAP = 1 << 0;
        /// Completions are never dropped; the kernel buffers them internally when the CQ
        /// ring overflows.
        const NODROP = 1 << 1;
        /// Submission entries are read in full at submit time, so their memory can be reused
        /// as soon as [`io_uring_enter`] returns.
        const SUBMIT_STABLE = 1 << 2;
        /// An offset of -1 means "the file's current position" for reads and writes.
        const RW_CUR_POS = 1 << 3;
        const CUR_PERSONALITY = 1 << 4;
        const FAST_POLL = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`io_uring_enter`].
    pub struct EnterFlags: u32 {
        /// Block until `min_complete` completions are available.
        const GETEVENTS = 1 << 0;
        /// Wake an idle SQPOLL thread.
        const SQ_WAKEUP = 1 << 1;
        /// Block until the submission queue has free slots.
        const SQ_WAIT = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Per-entry flags in [`Sqe::flags`].
    pub struct SqeFlags: u8 {
        /// Interpret [`Sqe::fd`] as an index into the registered file table rather than as a
        /// raw descriptor.
        const FIXED_FILE = 1 << 0;
        /// Do not start this entry until all prior entries have completed.
        const IO_DRAIN = 1 << 1;
        /// Start the next entry only after this one completes.
        const IO_LINK = 1 << 2;
        const IO_HARDLINK = 1 << 3;
        /// Always execute from the async worker pool instead of attempting a non-blocking
        /// issue first.
        const ASYNC = 1 << 4;
        const BUFFER_SELECT = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Flags the kernel publishes in the submission ring header.
    pub struct SqFlags: u32 {
        /// The SQPOLL thread has gone idle; the next [`io_uring_enter`] must include
        /// [`EnterFlags::SQ_WAKEUP`].
        const NEED_WAKEUP = 1 << 0;
        /// The completion ring has overflowed and completions are pending inside the kernel.
        const CQ_OVERFLOW = 1 << 1;
    }
}

/// Registration opcodes for [`io_uring_register`].
pub const IORING_REGISTER_BUFFERS: u32 = 0;
pub const IORING_UNREGISTER_BUFFERS: u32 = 1;
pub const IORING_REGISTER_FILES: u32 = 2;
pub const IORING_UNREGISTER_FILES: u32 = 3;
pub const IORING_REGISTER_EVENTFD: u32 = 4;
pub const IORING_UNREGISTER_EVENTFD: u32 = 5;
pub const IORING_REGISTER_FILES_UPDATE: u32 = 6;

/// Create a new `io_uring` instance, returning its descriptor. The kernel rounds the entry
/// count up to the next power of two and writes the negotiated geometry back into `params`.
pub fn io_uring_setup(entries: u32, params: &mut Params) -> io::Result<RawFd> {
    debug_assert_eq!(mem::size_of::<Params>(), 120);

    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as c_long,
            params as *mut Params as c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as RawFd)
}

/// The single submit-and-wait entry point. Tells the kernel to consume up to `to_submit`
/// newly visible submission entries, and, with [`EnterFlags::GETEVENTS`], blocks until at
/// least `min_complete` completions are available. Returns the number of entries the kernel
/// actually accepted.
pub fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
    sig: *const libc::sigset_t,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd as c_long,
            to_submit as c_long,
            min_complete as c_long,
            flags as c_long,
            sig as c_long,
            KERNEL_SIGSET_SIZE as c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// Register or unregister fixed resources (buffers, files, an eventfd) with the ring.
pub fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *const c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd as c_long,
            opcode as c_long,
            arg as c_long,
            nr_args as c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_sizes() {
        assert_eq!(mem::size_of::<Sqe>(), 64);
        assert_eq!(mem::size_of::<Cqe>(), 16);
        assert_eq!(mem::size_of::<Params>(), 120);
        assert_eq!(mem::size_of::<SqOffsets>(), 40);
        assert_eq!(mem::size_of::<CqOffsets>(), 40);
    }
}
