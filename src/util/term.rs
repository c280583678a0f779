//! Terminal width detection, used by [`crate::shell`] to wrap/indent
//! status messages to the width of an interactive terminal.

/// Returns the terminal's column width for `stream`, or `None` if it can't
/// be determined (not a TTY, `ioctl` failed, or the platform isn't Unix).
#[must_use]
#[cfg(unix)]
pub fn terminal_width(stream: atty::Stream) -> Option<usize> {
    let fd = match stream {
        atty::Stream::Stdout => libc::STDOUT_FILENO,
        atty::Stream::Stderr => libc::STDERR_FILENO,
        atty::Stream::Stdin => libc::STDIN_FILENO,
    };

    // SAFETY: `winsize` is a plain-old-data struct and `ioctl` only writes
    // into it; `fd` is one of the three well-known standard stream fds.
    unsafe {
        let mut size: libc::winsize = std::mem::zeroed();
        if libc::ioctl(fd, libc::TIOCGWINSZ, std::ptr::addr_of_mut!(size)) == 0 && size.ws_col > 0 {
            Some(size.ws_col as usize)
        } else {
            None
        }
    }
}

#[must_use]
#[cfg(not(unix))]
pub fn terminal_width(_stream: atty::Stream) -> Option<usize> {
    None
}
