//! Termios VEOF handling. While a remote client holds the controller lease,
//! the PTY's VEOF control character is disabled so a remote Ctrl-D cannot
//! EOF a canonical-mode reader on the slave side; the original value is
//! restored when control returns to the host. Non-unix builds pass bytes
//! through unchanged.

#[cfg(unix)]
mod imp {
    use std::os::unix::io::RawFd;

    pub fn get_veof(fd: RawFd) -> Option<u8> {
        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        // Safety: tcgetattr fills the struct on success, checked below.
        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                return None;
            }
            Some(termios.assume_init().c_cc[libc::VEOF])
        }
    }

    pub fn set_veof(fd: RawFd, value: u8) -> bool {
        unsafe {
            let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                return false;
            }
            let mut termios = termios.assume_init();
            termios.c_cc[libc::VEOF] = value;
            libc::tcsetattr(fd, libc::TCSANOW, &termios) == 0
        }
    }

    /// Strip EOF control bytes from remote input when the PTY is in
    /// canonical mode with the stock VEOF (0x04). In raw mode, or with VEOF
    /// already remapped, the bytes pass through untouched.
    pub fn filter_remote_input(fd: RawFd, data: &[u8]) -> Vec<u8> {
        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        let termios = unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                return data.to_vec();
            }
            termios.assume_init()
        };
        if termios.c_lflag & libc::ICANON == 0 {
            return data.to_vec();
        }
        if termios.c_cc[libc::VEOF] != 0x04 {
            return data.to_vec();
        }
        data.iter().copied().filter(|&b| b != 0x04).collect()
    }
}

#[cfg(not(unix))]
mod imp {
    pub type RawFd = i32;

    pub fn get_veof(_fd: RawFd) -> Option<u8> {
        None
    }

    pub fn set_veof(_fd: RawFd, _value: u8) -> bool {
        false
    }

    pub fn filter_remote_input(_fd: RawFd, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

pub use imp::{filter_remote_input, get_veof, set_veof};
