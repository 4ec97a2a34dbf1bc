use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use filetime::FileTime;

use super::{KeyValueStore, StoreLock, validate_key};
use crate::error::{Error, Result};
use crate::process;

const LOCK_POLL: Duration = Duration::from_millis(50);

/// One file per key under `root`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn lock_path(&self, name: &str) -> Result<PathBuf> {
        validate_key(name)?;
        Ok(self.root.join(format!(".{name}.lock")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let p = self.path(key)?;
        match fs::read_to_string(&p) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::msg(format!("failed to read {}: {e}", p.display()))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        atomic_write_text(&self.path(key)?, value)
    }

    fn clear(&self, key: &str) -> Result<()> {
        let p = self.path(key)?;
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", p.display()))),
        }
    }

    fn touch(&self, key: &str) -> Result<()> {
        let p = self.path(key)?;
        if p.exists() {
            filetime::set_file_mtime(&p, FileTime::now())
                .map_err(|e| Error::msg(format!("failed to touch {}: {e}", p.display())))
        } else {
            atomic_write_text(&p, "")
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let rd = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to list {}: {e}",
                    self.root.display()
                )));
            }
        };
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent?;
            if !ent.file_type()?.is_file() {
                continue;
            }
            let Some(name) = ent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(prefix) && validate_key(&name).is_ok() {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    fn lock(&self, name: &str, timeout: Duration) -> Result<StoreLock> {
        let path = self.lock_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::msg(format!("failed to open lock {}: {e}", path.display())))?;
        let deadline = Instant::now() + timeout;
        loop {
            match try_lock_exclusive(&file) {
                Ok(true) => {
                    record_owner(&file);
                    // Closing the descriptor drops the lock; the file itself stays.
                    return Ok(StoreLock::new(move || drop(file)));
                }
                Ok(false) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(path));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

/// Non-blocking exclusive `flock`. The kernel releases it when the holder
/// exits, so a crashed owner never leaves the lock held.
#[cfg(unix)]
fn try_lock_exclusive(file: &fs::File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &fs::File) -> std::io::Result<bool> {
    Ok(true)
}

/// Informational only; ownership is the `flock`, not the file contents.
fn record_owner(mut file: &fs::File) {
    use std::io::{Seek, Write};
    let _ = file.set_len(0);
    let _ = file.rewind();
    let _ = write!(file, "{}", process::current_pid());
}

pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}
