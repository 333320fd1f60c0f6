//! Files that disappear when the queue is dropped.
//!
//! A fresh buffer file must not outlive the process that created it unless
//! the queue was opened for persistence. POSIX unlinks the path right after
//! opening; the open handle keeps the data reachable. Windows cannot unlink an
//! open file, so the file is opened delete-on-close instead.

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

/// Create (truncating) a read-write file at `path` that is removed once the
/// returned handle is closed.
pub fn create_ephemeral_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    platform::open(&mut options, path)
}

#[cfg(unix)]
mod platform {
    use std::{
        fs::{self, File, OpenOptions},
        io,
        os::unix::fs::OpenOptionsExt,
        path::Path,
    };

    pub(super) fn open(options: &mut OpenOptions, path: &Path) -> io::Result<File> {
        let file = options.mode(0o600).open(path)?;
        fs::remove_file(path)?;
        Ok(file)
    }
}

#[cfg(windows)]
mod platform {
    use std::{
        fs::{File, OpenOptions},
        io,
        os::windows::fs::OpenOptionsExt,
        path::Path,
    };

    const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    const FILE_SHARE_READ: u32 = 0x0000_0001;
    const FILE_SHARE_DELETE: u32 = 0x0000_0004;

    pub(super) fn open(options: &mut OpenOptions, path: &Path) -> io::Result<File> {
        options
            .custom_flags(FILE_FLAG_DELETE_ON_CLOSE)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_DELETE)
            .open(path)
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::{
        fs::{File, OpenOptions},
        io,
        path::Path,
    };

    pub(super) fn open(options: &mut OpenOptions, path: &Path) -> io::Result<File> {
        options.open(path)
    }
}
