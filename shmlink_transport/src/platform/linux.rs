//! Linux-specific shared memory and socket operations

use crate::error::{ShmResult, TransportError};
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use rand::RngCore;
use rand::rngs::OsRng;
use shmlink::consts::{SHM_NAME_LEN, SHM_NAME_PREFIX};
use std::fmt::Write as _;
use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Fixed-capacity segment name (`/` followed by a hyphenated UUID).
pub type SegmentName = heapless::String<SHM_NAME_LEN>;

/// Generate a fresh random segment name from the OS randomness source.
pub fn random_segment_name() -> ShmResult<SegmentName> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| TransportError::OutOfMemory)?;

    // RFC 4122 version 4, variant 1.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let mut name = SegmentName::new();
    name.push_str(SHM_NAME_PREFIX)
        .map_err(|_| TransportError::OutOfMemory)?;
    for (i, byte) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            name.push('-').map_err(|_| TransportError::OutOfMemory)?;
        }
        write!(name, "{byte:02x}").map_err(|_| TransportError::OutOfMemory)?;
    }
    Ok(name)
}

/// Create a new, exclusively owned shared memory object of `size` bytes.
///
/// A stale object left behind under the same name is unlinked first. On
/// failure after the object exists, the name is unlinked again before the
/// error is returned.
pub fn create_shm_object(name: &str, size: usize, mode: u32) -> ShmResult<File> {
    let _ = shm_unlink(name);

    let fd = shm_open(
        name,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::from_bits_truncate(mode as libc::mode_t),
    )
    .map_err(|source| TransportError::ResourceCreationFailed {
        name: name.to_string(),
        source,
    })?;
    let file = File::from(fd);

    if let Err(source) = file.set_len(size as u64) {
        let _ = shm_unlink(name);
        return Err(TransportError::SizingFailed {
            name: name.to_string(),
            size,
            source,
        });
    }

    Ok(file)
}

/// Open an existing shared memory object read/write.
pub fn open_shm_object(name: &str) -> ShmResult<File> {
    let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| {
        TransportError::ResourceCreationFailed {
            name: name.to_string(),
            source,
        }
    })?;
    Ok(File::from(fd))
}

/// Map `size` bytes of a shared memory object read/write, shared.
pub fn map_shm_object(file: &File, name: &str, size: usize) -> ShmResult<MmapMut> {
    // SAFETY: the object is only modified through the ring protocol, which
    // never hands out references into the mapping across the cursors.
    unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(|source| {
        TransportError::MappingFailed {
            name: name.to_string(),
            source,
        }
    })
}

/// Remove a name from the shm namespace.
pub fn unlink_shm_object(name: &str) -> nix::Result<()> {
    shm_unlink(name)
}

/// Switch `O_NONBLOCK` on or off for a descriptor.
pub fn set_fd_blocking(fd: BorrowedFd<'_>, blocking: bool) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we borrow for the duration of the call.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }

    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Poll a descriptor for readability without waiting.
pub fn poll_readable(fd: BorrowedFd<'_>) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: a single valid pollfd, zero timeout.
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret > 0)
}

/// Peek one byte from a socket. Returns the byte count (0 at end of stream).
pub fn peek_byte(fd: BorrowedFd<'_>) -> std::io::Result<usize> {
    let mut byte = 0u8;
    // SAFETY: one-byte buffer owned by this frame.
    let ret = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            (&mut byte as *mut u8).cast(),
            1,
            libc::MSG_PEEK,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret as usize)
}
