//! On-disk pid record for locally spawned workers.

use std::io;
use std::path::{Path, PathBuf};

use super::LaunchError;

/// `<dir>/<entrypoint with its extension replaced by "pid">`, holding the
/// worker's pid in ASCII decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    path: PathBuf,
}

impl PidRecord {
    pub fn for_entrypoint(dir: &Path, entrypoint: &Path) -> Self {
        Self {
            path: dir.join(entrypoint).with_extension("pid"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when there is no record.
    pub fn read(&self) -> Result<Option<u32>, LaunchError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LaunchError::CorruptPidRecord {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let pid = contents
            .trim()
            .parse::<u32>()
            .map_err(|e| LaunchError::CorruptPidRecord {
                path: self.path.clone(),
                reason: format!("{e}: {:?}", contents.trim()),
            })?;
        // 0 addresses our own process group when signalled.
        if pid == 0 {
            return Err(LaunchError::CorruptPidRecord {
                path: self.path.clone(),
                reason: "pid 0 is not a process".to_string(),
            });
        }
        Ok(Some(pid))
    }

    pub fn write(&self, pid: u32) -> Result<(), LaunchError> {
        std::fs::write(&self.path, pid.to_string()).map_err(|source| LaunchError::PidRecord {
            path: self.path.clone(),
            source,
        })
    }

    /// Missing records are fine; other failures are only logged.
    pub fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "Removed pid record"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid record")
            }
        }
    }
}

/// Whether a process with `pid` exists. A process we may not signal still counts.
/// Pid 0 is never a worker.
#[cfg(unix)]
pub fn probe_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return false,
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn probe_alive(pid: u32) -> bool {
    // No portable probe; trust the record.
    pid != 0
}
