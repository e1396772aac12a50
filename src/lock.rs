//! Single-instance run lock.
//!
//! A run holds an exclusive advisory lock (`flock`) on the lock file for its
//! whole duration. The file content names the holder so a contending run can
//! report who is busy. The OS drops the lock when the process dies, so a
//! crashed run never leaves a stale lock behind.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use uuid::Uuid;

use crate::errors::RunError;

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
    run_id: Uuid,
}

impl RunLock {
    /// Try to become the single active run. Never blocks.
    pub fn acquire(path: &Path) -> Result<Self, RunError> {
        let lock_err = |source: std::io::Error| RunError::LockFile {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                return Err(RunError::AlreadyRunning {
                    path: path.to_path_buf(),
                    holder: if holder.is_empty() {
                        "unknown holder".to_string()
                    } else {
                        holder.to_string()
                    },
                });
            }
            Err(err) => return Err(lock_err(err)),
        }

        let run_id = Uuid::new_v4();
        file.set_len(0).map_err(lock_err)?;
        file.seek(SeekFrom::Start(0)).map_err(lock_err)?;
        writeln!(file, "run {} pid {}", run_id, std::process::id()).map_err(lock_err)?;
        file.flush().map_err(lock_err)?;

        tracing::debug!(path = %path.display(), %run_id, "acquired run lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            run_id,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), run_id = %self.run_id, "released run lock");
    }
}
