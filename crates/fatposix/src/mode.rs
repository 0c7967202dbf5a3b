//! POSIX `open()` flags to engine access mode.

use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDWR, O_WRONLY};

use crate::engine::AccessMode;

/// Computes the engine access/creation mode for a set of `open()` flags.
///
/// Total over the flag space:
/// - `O_RDWR` reads and writes, `O_WRONLY` writes, anything else reads;
/// - without `O_CREAT` the file must exist;
/// - `O_CREAT|O_EXCL` creates a new file and fails if it exists;
/// - `O_CREAT|O_APPEND` opens (or creates) positioned at the end;
/// - plain `O_CREAT` creates or truncates.
///
/// `O_TRUNC` without `O_CREAT` has no engine counterpart and is ignored.
pub fn compute_mode(oflag: i32) -> AccessMode {
    let mut mode = if oflag & O_RDWR != 0 {
        AccessMode::READ | AccessMode::WRITE
    } else if oflag & O_WRONLY != 0 {
        AccessMode::WRITE
    } else {
        AccessMode::READ
    };

    if oflag & O_CREAT != 0 {
        if oflag & O_EXCL != 0 {
            mode |= AccessMode::CREATE_NEW;
        } else if oflag & O_APPEND != 0 {
            mode |= AccessMode::OPEN_APPEND;
        } else {
            mode |= AccessMode::CREATE_ALWAYS;
        }
    } else {
        mode |= AccessMode::OPEN_EXISTING;
    }

    mode
}
