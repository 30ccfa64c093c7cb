//! Thin synchronous file and directory primitives.
//!
//! Everything the store touches on disk goes through [`File`] and
//! [`Directory`]: positioned reads and writes, explicit fsync, truncate,
//! and whole-file advisory exclusive locks. The `Directory` handle scopes
//! file names to one parent directory so rename/exists/remove compose
//! into the crash-safe checkpoint swap.
//!
//! Host I/O errors propagate untranslated inside `eyre` reports; no
//! retries, no buffering.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::error::StoreError;

/// A synchronous file handle with positioned I/O.
#[derive(Debug)]
pub struct File {
    inner: fs::File,
    path: PathBuf,
}

impl File {
    fn wrap(inner: fs::File, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
        }
    }

    /// Opens an existing file. Missing files report [`StoreError::NotFound`].
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let result = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path);

        match result {
            Ok(inner) => Ok(Self::wrap(inner, path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(eyre::Report::new(StoreError::NotFound)
                    .wrap_err(format!("no such file: {}", path.display())))
            }
            Err(e) => Err(e).wrap_err_with(|| format!("failed to open {}", path.display())),
        }
    }

    /// Creates a file read/write, optionally truncating an existing one.
    pub fn create(path: &Path, truncate_existing: bool) -> Result<Self> {
        let inner = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate_existing)
            .open(path)
            .wrap_err_with(|| format!("failed to create {}", path.display()))?;

        Ok(Self::wrap(inner, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(dst)
            .wrap_err_with(|| format!("short read from {}", self.path.display()))
    }

    pub fn write_all(&mut self, src: &[u8]) -> Result<()> {
        self.inner
            .write_all(src)
            .wrap_err_with(|| format!("short write to {}", self.path.display()))
    }

    /// Positioned read that does not disturb the file cursor. Concurrent
    /// callers may share `&self`.
    pub fn read_exact_at(&self, dst: &mut [u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.inner
                .read_exact_at(dst, offset)
                .wrap_err_with(|| format!("short read at {} from {}", offset, self.path.display()))
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            while done < dst.len() {
                let n = self
                    .inner
                    .seek_read(&mut dst[done..], offset + done as u64)
                    .wrap_err_with(|| format!("read at {} from {}", offset, self.path.display()))?;
                eyre::ensure!(n > 0, "unexpected end of {}", self.path.display());
                done += n;
            }
            Ok(())
        }
    }

    /// Positioned write that does not disturb the file cursor.
    pub fn write_all_at(&self, src: &[u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.inner
                .write_all_at(src, offset)
                .wrap_err_with(|| format!("short write at {} to {}", offset, self.path.display()))
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            while done < src.len() {
                let n = self
                    .inner
                    .seek_write(&src[done..], offset + done as u64)
                    .wrap_err_with(|| format!("write at {} to {}", offset, self.path.display()))?;
                done += n;
            }
            Ok(())
        }
    }

    pub fn tell(&mut self) -> Result<u64> {
        self.inner
            .stream_position()
            .wrap_err_with(|| format!("failed to tell position of {}", self.path.display()))
    }

    pub fn len(&self) -> Result<u64> {
        let meta = self
            .inner
            .metadata()
            .wrap_err_with(|| format!("failed to stat {}", self.path.display()))?;
        Ok(meta.len())
    }

    pub fn seek_begin(&mut self, pos: u64) -> Result<u64> {
        self.seek(SeekFrom::Start(pos))
    }

    pub fn seek_cur(&mut self, delta: i64) -> Result<u64> {
        self.seek(SeekFrom::Current(delta))
    }

    pub fn seek_end(&mut self, back: i64) -> Result<u64> {
        self.seek(SeekFrom::End(-back))
    }

    fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        self.inner
            .seek(from)
            .wrap_err_with(|| format!("failed to seek {}", self.path.display()))
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.inner
            .set_len(len)
            .wrap_err_with(|| format!("failed to truncate {} to {}", self.path.display(), len))
    }

    /// Flushes data and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner
            .sync_all()
            .wrap_err_with(|| format!("failed to sync {}", self.path.display()))
    }

    /// Takes the whole-file advisory exclusive lock without blocking.
    /// Contention reports [`StoreError::Busy`]. The lock is released when
    /// the handle is dropped.
    pub fn lock_exclusive(&self) -> Result<()> {
        try_lock(&self.inner).map_err(|e| {
            eyre::Report::new(StoreError::Busy)
                .wrap_err(format!("{} is locked: {}", self.path.display(), e))
        })
    }

    pub fn unlock(&self) -> Result<()> {
        unlock(&self.inner)
            .wrap_err_with(|| format!("failed to unlock {}", self.path.display()))
    }
}

#[cfg(unix)]
fn try_lock(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &fs::File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let rc = unsafe {
        let mut overlapped = std::mem::zeroed();
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };
    if rc == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(file: &fs::File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::UnlockFile;

    let rc = unsafe { UnlockFile(file.as_raw_handle() as *mut _, 0, 0, !0, !0) };
    if rc == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

/// Scopes file operations to one parent directory so that rename,
/// exists, and remove compose atomically relative to it.
#[derive(Debug, Clone)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub fn open(path: &Path) -> Result<Self> {
        eyre::ensure!(
            path.is_dir(),
            "{} is not a directory",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn open_file(&self, name: &str, read_only: bool) -> Result<File> {
        File::open(&self.join(name), read_only)
    }

    pub fn create_file(&self, name: &str, truncate_existing: bool) -> Result<File> {
        File::create(&self.join(name), truncate_existing)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.join(name).exists()
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.join(name))
            .wrap_err_with(|| format!("failed to remove {} in {}", name, self.path.display()))
    }

    /// Atomically renames `from` to `to` within this directory.
    pub fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.join(from), self.join(to)).wrap_err_with(|| {
            format!(
                "failed to rename {} -> {} in {}",
                from,
                to,
                self.path.display()
            )
        })
    }

    /// Fsyncs the directory entry itself so renames and removals are
    /// durable. A no-op on platforms without directory fds.
    pub fn sync(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let dir = fs::File::open(&self.path)
                .wrap_err_with(|| format!("failed to open directory {}", self.path.display()))?;
            dir.sync_all()
                .wrap_err_with(|| format!("failed to sync directory {}", self.path.display()))?;
        }
        Ok(())
    }
}
