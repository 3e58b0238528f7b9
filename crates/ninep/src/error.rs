//! 9P error representations.
//!
//! In 9P2000, errors are represented as strings sent back in an `RError`
//! message (`ename`). This module keeps a typed `Error` so handler code can
//! use `?`/errno-flavored checks, and converts it to the wire string lazily,
//! only when a response is actually marshaled.

use std::io;
use std::io::ErrorKind::*;

use self::errno::*;

fn errno_from_ioerror(e: &io::Error) -> nix::errno::Errno {
    e.raw_os_error().map(nix::errno::Errno::from_raw).unwrap_or(match e.kind() {
        NotFound => ENOENT,
        PermissionDenied => EPERM,
        ConnectionRefused => ECONNREFUSED,
        ConnectionReset => ECONNRESET,
        ConnectionAborted => ECONNABORTED,
        NotConnected => ENOTCONN,
        AddrInUse => EADDRINUSE,
        AddrNotAvailable => EADDRNOTAVAIL,
        BrokenPipe => EPIPE,
        AlreadyExists => EALREADY,
        WouldBlock => EAGAIN,
        InvalidInput => EINVAL,
        InvalidData => EINVAL,
        TimedOut => ETIMEDOUT,
        WriteZero => EAGAIN,
        Interrupted => EINTR,
        _ => EIO,
    })
}

/// 9P2000 error type.
///
/// `Proto` carries an already-literal wire string (used by the dispatcher's
/// own validation table); `No`/`Io` carry a POSIX-flavored error that gets
/// mapped to its 9P2000 literal text through [`errno_to_str`] when it is
/// actually sent as an `RError`.
#[derive(Debug)]
pub enum Error {
    /// System error containing an errno
    No(nix::errno::Errno),
    /// I/O error
    Io(io::Error),
    /// Literal 9P2000 error text, used directly
    Proto(&'static str),
}

impl Error {
    /// Get an errno representation, for callers that want POSIX-flavored checks.
    pub fn errno(&self) -> nix::errno::Errno {
        match *self {
            Error::No(e) => e,
            Error::Io(ref e) => errno_from_ioerror(e),
            Error::Proto(_) => EIO,
        }
    }

    /// Render as the literal 9P2000 wire string this error should be reported as.
    pub fn errstr(&self) -> String {
        match *self {
            Error::Proto(s) => s.to_owned(),
            Error::No(e) => errno_to_str(e).to_owned(),
            Error::Io(ref e) => errno_to_str(errno_from_ioerror(e)).to_owned(),
        }
    }
}

impl ::std::fmt::Display for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match *self {
            Error::No(e) => write!(f, "system error: {}", e),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::Proto(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl ::std::error::Error for Error {
    fn source(&self) -> Option<&(dyn ::std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            Error::No(_) | Error::Proto(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Proto(s)
    }
}

/// Errno, error numbers
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// Map an errno to the classic 9P2000 literal error string, falling back to
/// the errno's own description for anything the table doesn't name.
pub fn errno_to_str(e: nix::errno::Errno) -> &'static str {
    use self::errno::*;
    use self::string::*;

    match e {
        EPERM => EPERM_STR,
        ENOENT => ENOENT_STR,
        EINTR => EINTR_STR,
        EIO => EIO_STR,
        ENXIO => ENXIO_STR,
        E2BIG => E2BIG_STR,
        EBADF => EBADF_STR,
        EAGAIN => EAGAIN_STR,
        ENOMEM => ENOMEM_STR,
        EACCES => EACCES_STR,
        EFAULT => EFAULT_STR,
        EBUSY => EBUSY_STR,
        EEXIST => EEXIST_STR,
        EXDEV => EXDEV_STR,
        ENODEV => ENODEV_STR,
        ENOTDIR => ENOTDIR_STR,
        EISDIR => EISDIR_STR,
        EINVAL => EINVAL_STR,
        ENFILE => ENFILE_STR,
        EMFILE => EMFILE_STR,
        EFBIG => EFBIG_STR,
        ENOSPC => ENOSPC_STR,
        ESPIPE => ESPIPE_STR,
        EROFS => EROFS_STR,
        EMLINK => EMLINK_STR,
        EPIPE => EPIPE_STR,
        ENAMETOOLONG => ENAMETOOLONG_STR,
        ENOLCK => ENOLCK_STR,
        ENOSYS => ENOSYS_STR,
        ENOTEMPTY => ENOTEMPTY_STR,
        ELOOP => ELOOP_STR,
        ECONNABORTED => ECONNABORTED_STR,
        ECONNRESET => ECONNRESET_STR,
        ENOBUFS => ENOBUFS_STR,
        EISCONN => EISCONN_STR,
        ENOTCONN => ENOTCONN_STR,
        ESHUTDOWN => ESHUTDOWN_STR,
        ETIMEDOUT => ETIMEDOUT_STR,
        ECONNREFUSED => ECONNREFUSED_STR,
        EHOSTDOWN => EHOSTDOWN_STR,
        EHOSTUNREACH => EHOSTUNREACH_STR,
        EALREADY => EALREADY_STR,
        EINPROGRESS => EINPROGRESS_STR,
        EOPNOTSUPP => ENOSYS_STR,
        _ => EIO_STR,
    }
}

/// 9P2000 error strings, imported from the classic 9P error table plus the
/// exact literal strings this dispatcher's own validation table reports.
pub mod string {
    pub const EPERM_STR: &str = "Operation not permitted";
    pub const EPERM_WSTAT: &str = "wstat prohibited";
    pub const ENOENT_STR: &str = "No such file or directory";
    pub const ENOENT_DIR: &str = "directory entry not found";
    pub const ENOENT_FILE: &str = "file not found";
    pub const EINTR_STR: &str = "interrupted";
    pub const EIO_STR: &str = "Input/output error";
    pub const ENXIO_STR: &str = "No such device or address";
    pub const E2BIG_STR: &str = "Argument list too long";
    pub const EBADF_STR: &str = "Bad file descriptor";
    pub const EAGAIN_STR: &str = "Resource temporarily unavailable";
    pub const ENOMEM_STR: &str = "Cannot allocate memory";
    pub const EACCES_STR: &str = "Permission denied";
    pub const EFAULT_STR: &str = "Bad address";
    pub const EBUSY_STR: &str = "Device or resource busy";
    pub const EEXIST_STR: &str = "File exists";
    pub const EXDEV_STR: &str = "Invalid cross-device link";
    pub const ENODEV_STR: &str = "No such device";
    pub const ENOTDIR_STR: &str = "not a directory";
    pub const EISDIR_STR: &str = "cannot perform operation on a directory";
    pub const EINVAL_STR: &str = "Invalid argument";
    pub const ENFILE_STR: &str = "Too many open files in system";
    pub const EMFILE_STR: &str = "Too many open files";
    pub const EFBIG_STR: &str = "File too large";
    pub const ENOSPC_STR: &str = "No space left on device";
    pub const ESPIPE_STR: &str = "Illegal seek";
    pub const EROFS_STR: &str = "Read-only file system";
    pub const EMLINK_STR: &str = "Too many links";
    pub const EPIPE_STR: &str = "Broken pipe";
    pub const ENAMETOOLONG_STR: &str = "File name too long";
    pub const ENOLCK_STR: &str = "No locks available";
    pub const ENOSYS_STR: &str = "function not implemented";
    pub const ENOTEMPTY_STR: &str = "Directory not empty";
    pub const ELOOP_STR: &str = "Too many levels of symbolic links";
    pub const ECONNABORTED_STR: &str = "Software caused connection abort";
    pub const ECONNRESET_STR: &str = "Connection reset by peer";
    pub const ENOBUFS_STR: &str = "No buffer space available";
    pub const EISCONN_STR: &str = "Transport endpoint is already connected";
    pub const ENOTCONN_STR: &str = "Transport endpoint is not connected";
    pub const ESHUTDOWN_STR: &str = "Cannot send after transport endpoint shutdown";
    pub const ETIMEDOUT_STR: &str = "Connection timed out";
    pub const ECONNREFUSED_STR: &str = "Connection refused";
    pub const EHOSTDOWN_STR: &str = "Host is down";
    pub const EHOSTUNREACH_STR: &str = "No route to host";
    pub const EALREADY_STR: &str = "Operation already in progress";
    pub const EINPROGRESS_STR: &str = "Operation now in progress";

    // Literal strings the dispatcher's validation table reports directly.
    pub const ENOENT_FILE2: &str = "file does not exist";
    pub const EBADF2: &str = "fid does not exist";
    pub const EBADF4: &str = "fid in use";
    pub const ETAG: &str = "tag in use";
    pub const ENOTAG: &str = "tag does not exist";
    pub const EFIDOPEN: &str = "fid is already open";
    pub const ENOTOPEN_READ: &str = "file not open for reading";
    pub const ENOTOPEN_WRITE: &str = "write on fid not opened for writing";
    pub const EOPENWALK: &str = "cannot walk from an open fid";
    pub const EINTERRUPTED: &str = "interrupted";
    pub const ENOTIMPL: &str = "function not implemented";
}
