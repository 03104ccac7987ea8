//! System file descriptor base.
//!
//! Thin wrappers around the raw system calls used by the PCM endpoints and
//! the per-transport I/O tasks. All descriptors created here are
//! non-blocking and close-on-exec.

use libc::{c_int, AF_UNIX, O_CLOEXEC, O_NONBLOCK, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_SEQPACKET, TIOCOUTQ};
use std::{
    io::{Error, Result},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// File descriptor that is closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
    close_on_drop: bool,
}

impl OwnedFd {
    /// Create new OwnedFd taking ownership of file descriptor.
    ///
    /// # Safety
    /// The file descriptor must be valid and not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self { fd, close_on_drop: true }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(mut self) -> RawFd {
        self.close_on_drop = false;
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if self.close_on_drop {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Creates a unidirectional pipe and returns `(read end, write end)`.
///
/// Both ends are non-blocking.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), O_CLOEXEC | O_NONBLOCK) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) })
}

/// Creates a connected pair of SEQPACKET sockets.
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];
    if unsafe {
        libc::socketpair(AF_UNIX, SOCK_SEQPACKET | SOCK_CLOEXEC | SOCK_NONBLOCK, 0, fds.as_mut_ptr())
    } == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) })
}

/// Reads from descriptor into buffer.
pub fn read(fd: &OwnedFd, buf: &mut [u8]) -> Result<usize> {
    match unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Writes from buffer to descriptor.
pub fn write(fd: &OwnedFd, buf: &[u8]) -> Result<usize> {
    match unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Number of bytes queued in the socket outgoing buffer.
///
/// This corresponds to the `TIOCOUTQ` ioctl.
pub fn outq(fd: &OwnedFd) -> Result<i32> {
    let mut value: c_int = 0;
    if unsafe { libc::ioctl(fd.as_raw_fd(), TIOCOUTQ as _, &mut value as *mut _) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(value)
}

/// Discards up to `len` readable bytes by moving them to the null device.
///
/// Returns the number of bytes discarded; zero when nothing was pending.
pub fn splice_to_null(fd: &OwnedFd, null: &OwnedFd, len: usize) -> Result<usize> {
    let ret = unsafe {
        libc::splice(
            fd.as_raw_fd(),
            std::ptr::null_mut(),
            null.as_raw_fd(),
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_NONBLOCK,
        )
    };
    match ret {
        -1 if Error::last_os_error().kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Opens the null device for write.
pub fn open_null() -> Result<OwnedFd> {
    let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_WRONLY | O_NONBLOCK | O_CLOEXEC) };
    if fd == -1 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::new(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (r, w) = pipe().unwrap();
        assert_eq!(write(&w, b"pcm").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read(&r, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"pcm");
    }

    #[test]
    fn pipe_is_nonblocking() {
        let (r, _w) = pipe().unwrap();
        let mut buf = [0u8; 8];
        let err = read(&r, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn seqpacket_preserves_boundaries() {
        let (a, b) = seqpacket_pair().unwrap();
        write(&a, b"Drain").unwrap();
        write(&a, b"Drop").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(read(&b, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"Drain");
        assert_eq!(read(&b, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"Drop");
    }

    #[test]
    fn splice_discards_pending() {
        let (r, w) = pipe().unwrap();
        let null = open_null().unwrap();
        write(&w, &[0u8; 1024]).unwrap();
        assert_eq!(splice_to_null(&r, &null, 32 * 1024).unwrap(), 1024);
        assert_eq!(splice_to_null(&r, &null, 32 * 1024).unwrap(), 0);
    }
}
