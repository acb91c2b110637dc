//! Host- and process-identified lock guarding writers of one artifact directory.
//!
//! Mutual exclusion comes from an OS advisory lock on a guard file keyed by
//! the directory. While the lock is held, a holder file named after the
//! process id and short host name sits next to it and records the guarded
//! directory, so a stuck lock can be traced to its owner.
//!
//! # Safety
//! - The OS lock is released when the `FileLock` is dropped
//! - The holder file is removed on drop
//! - Acquisition polls until the configured timeout, then fails

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::IndexError;

/// Exclusive lock on an artifact directory's ledger.
///
/// The lock is held for the lifetime of this struct and released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _guard: File,
    guard_path: PathBuf,
    holder_path: PathBuf,
    directory: PathBuf,
}

impl FileLock {
    /// Blocks until the lock for `directory` is acquired or the configured timeout passes.
    ///
    /// # Errors
    /// - `IndexError::LockTimeout` if another holder keeps the lock past `lock_timeout`
    /// - `IndexError::Lock` if the lock files cannot be created or locked
    pub fn acquire(config: &StoreConfig, directory: &Path) -> Result<Self, IndexError> {
        Self::acquire_with(
            &config.lock_root,
            directory,
            config.lock_timeout,
            config.lock_poll_interval,
        )
    }

    /// Like [`acquire`](Self::acquire) with explicit lock root and timing.
    ///
    /// # Errors
    /// See [`acquire`](Self::acquire).
    pub fn acquire_with(
        lock_root: &Path,
        directory: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, IndexError> {
        let lock_err = |path: &Path, e: IoError| IndexError::Lock {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        fs::create_dir_all(lock_root).map_err(|e| lock_err(lock_root, e))?;

        let key = directory_key(directory);
        let guard_path = lock_root.join(format!("{key}.guard"));
        let guard = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| lock_err(&guard_path, e))?;

        let started = Instant::now();
        loop {
            match Self::try_lock(&guard) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(IndexError::LockTimeout {
                            path: guard_path,
                            waited_ms: u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    thread::sleep(poll_interval);
                }
                Err(e) => return Err(lock_err(&guard_path, e)),
            }
        }

        let holder_path = lock_root.join(format!(
            "{}_{}_{key}.lock",
            std::process::id(),
            short_host_name()
        ));
        fs::write(&holder_path, format!("{}\n", directory.display()))
            .map_err(|e| lock_err(&holder_path, e))?;

        debug!(
            directory = %directory.display(),
            holder = %holder_path.display(),
            "acquired ledger lock"
        );

        Ok(Self {
            _guard: guard,
            guard_path,
            holder_path,
            directory: directory.to_path_buf(),
        })
    }

    /// Path of the holder file naming this process.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.holder_path
    }

    /// Path of the guard file carrying the OS lock.
    #[must_use]
    pub fn guard_path(&self) -> &Path {
        &self.guard_path
    }

    /// The artifact directory this lock protects.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        // Use non-blocking exclusive lock
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(
                    ErrorKind::WouldBlock,
                    "ledger is locked by another writer",
                ));
            }
            return Err(errno);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("ledger is locked by another writer: {err}"),
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS lock goes away with the guard handle; only the holder file needs cleanup.
        if let Err(e) = fs::remove_file(&self.holder_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(holder = %self.holder_path.display(), error = %e, "failed to remove lock holder file");
            }
        }
    }
}

/// Stable key for a directory, used to name its guard file.
fn directory_key(directory: &Path) -> String {
    let absolute = fs::canonicalize(directory).unwrap_or_else(|_| directory.to_path_buf());
    let digest = blake3::hash(absolute.to_string_lossy().as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Host name up to the first dot, restricted to characters safe in file names.
fn short_host_name() -> String {
    let full = host_name().unwrap_or_else(|| "localhost".to_string());
    let short: String = full
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if short.is_empty() {
        "localhost".to_string()
    } else {
        short
    }
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    let result = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if result != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}
