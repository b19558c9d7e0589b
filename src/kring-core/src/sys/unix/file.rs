use std::io;
use std::os::fd::{AsFd, AsRawFd};

/// Reference point for [`lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Start,
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
}

impl Whence {
    fn as_raw(self) -> libc::c_int {
        match self {
            Whence::Start => libc::SEEK_SET,
            Whence::Current => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        }
    }
}

/// Moves the file position and returns the new one.
pub fn lseek(fd: impl AsFd, offset: i64, whence: Whence) -> io::Result<u64> {
    let pos = syscall!(lseek(
        fd.as_fd().as_raw_fd(),
        offset as libc::off_t,
        whence.as_raw()
    ))?;

    Ok(pos as u64)
}

/// Truncates or extends the file to `len` bytes.
pub fn ftruncate(fd: impl AsFd, len: u64) -> io::Result<()> {
    let len = libc::off_t::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    syscall!(ftruncate(fd.as_fd().as_raw_fd(), len))?;

    Ok(())
}
