//! Process identity resolution

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Resolves a pid to the executable it is running.
///
/// Implementations must fail when the process no longer exists.
pub trait ProcessResolver: Send + Sync {
    fn executable(&self, pid: u32) -> Result<PathBuf>;
}

/// Resolver reading `/proc/<pid>/exe`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsResolver;

impl ProcessResolver for ProcfsResolver {
    #[cfg(target_os = "linux")]
    fn executable(&self, pid: u32) -> Result<PathBuf> {
        let link = format!("/proc/{}/exe", pid);
        std::fs::read_link(&link).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::PathNotFound(link),
            _ => Error::Io(e),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn executable(&self, pid: u32) -> Result<PathBuf> {
        Err(Error::Internal(format!(
            "process inspection unsupported on this platform (pid {})",
            pid
        )))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_own_process() {
        let exe = ProcfsResolver.executable(std::process::id()).unwrap();
        assert_eq!(exe, std::env::current_exe().unwrap());
    }

    #[test]
    fn test_missing_process_fails() {
        // Above the default pid_max
        assert!(ProcfsResolver.executable(u32::MAX - 1).is_err());
    }
}
