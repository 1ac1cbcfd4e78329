//! A synchronous file facade over the ring.
//!
//! [`RingFile`] hides the asynchronous submit/complete protocol behind the blocking
//! `std::io` traits: every call claims a slot, commits it, enters the ring with a minimum of
//! one completion, and waits for its own correlation tag. Completions belonging to other
//! operations that arrive in the meantime are parked on the ring, not lost.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RegisterError;
use crate::ring::Ring;
use crate::sys::EnterFlags;

/// Synchronous read/write/seek access to a file, with all I/O issued through the ring.
///
/// Maintains its own offset cursor, advanced by every successful operation; [`seek`]
/// overrides it. Not safe to combine with operations on the same descriptor issued outside
/// the ring — the two would race without coordination.
///
/// [`seek`]: #impl-Seek
pub struct RingFile<'ring> {
    ring: &'ring Ring,
    file: File,
    /// Index of the descriptor in the ring's fixed file table.
    index: u32,
    offset: AtomicU64,
}

impl<'ring> RingFile<'ring> {
    /// Wrap `file`, registering its descriptor in the ring's fixed file table so every
    /// operation references it by index.
    pub fn new(ring: &'ring Ring, file: File) -> Result<Self, RegisterError> {
        let index = ring.register_file(file.as_raw_fd())?;
        Ok(Self {
            ring,
            file,
            index,
            offset: AtomicU64::new(0),
        })
    }

    /// The current offset cursor.
    pub fn position(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// The wrapped file.
    pub fn get_ref(&self) -> &File {
        &self.file
    }

    /// Unwrap, leaving the descriptor registered with the ring.
    pub fn into_inner(self) -> File {
        self.file
    }

    /// Release the file. The registered-file index stays allocated in the ring's table until
    /// the ring is closed; errors from the underlying descriptor close are not observable.
    pub fn close(self) {
        drop(self.file);
    }

    fn submit_and_wait(&self, user_data: u64) -> io::Result<usize> {
        self.ring.enter(1, 1, EnterFlags::GETEVENTS)?;
        let completion = self.ring.wait_for(user_data)?;
        completion.io_result()
    }
}

impl Read for RingFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let user_data = self.ring.id();
        let offset = self.offset.load(Ordering::Acquire);
        {
            let mut slot = self.ring.claim_slot().map_err(io::Error::from)?;
            // The buffer outlives the blocking wait below, so the address stays valid for
            // the whole life of the operation.
            unsafe {
                slot.prep_read(self.file.as_raw_fd(), buf, offset, user_data);
            }
            slot.set_fixed_file(self.index);
            slot.commit();
        }
        let count = self.submit_and_wait(user_data)?;
        self.offset.fetch_add(count as u64, Ordering::AcqRel);
        Ok(count)
    }
}

impl Write for RingFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let user_data = self.ring.id();
        let offset = self.offset.load(Ordering::Acquire);
        {
            let mut slot = self.ring.claim_slot().map_err(io::Error::from)?;
            unsafe {
                slot.prep_write(self.file.as_raw_fd(), buf, offset, user_data);
            }
            slot.set_fixed_file(self.index);
            slot.commit();
        }
        let count = self.submit_and_wait(user_data)?;
        self.offset.fetch_add(count as u64, Ordering::AcqRel);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        let user_data = self.ring.id();
        {
            let mut slot = self.ring.claim_slot().map_err(io::Error::from)?;
            slot.prep_fsync(self.file.as_raw_fd(), user_data);
            slot.set_fixed_file(self.index);
            slot.commit();
        }
        self.submit_and_wait(user_data)?;
        Ok(())
    }
}

impl Seek for RingFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let current = self.offset.load(Ordering::Acquire);
                checked_offset(current, delta)?
            }
            SeekFrom::End(delta) => {
                let end = self.file.metadata()?.len();
                checked_offset(end, delta)?
            }
        };
        self.offset.store(new_offset, Ordering::Release);
        Ok(new_offset)
    }
}

fn checked_offset(base: u64, delta: i64) -> io::Result<u64> {
    let new_offset = if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.wrapping_neg() as u64)
    };
    new_offset.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek target before the start of the file",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::checked_offset;
    use std::io::ErrorKind;

    #[test]
    fn relative_seeks_are_bounds_checked() {
        assert_eq!(checked_offset(100, 28).unwrap(), 128);
        assert_eq!(checked_offset(100, -100).unwrap(), 0);
        assert_eq!(
            checked_offset(100, -101).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
