//! Unix socket and file calls.

macro_rules! syscall {
    ($fn: ident($($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod file;
pub use file::*;

mod socket;
pub use socket::*;
