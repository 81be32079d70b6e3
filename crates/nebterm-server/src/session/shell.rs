//! Default shell resolution.
//!
//! Always yields a concrete program; the worst case is the most minimal
//! shell the platform guarantees.

use std::path::{Path, PathBuf};

/// Host family, as far as shell choice is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Console-API platform (Windows / ConPTY).
    Windows,
    /// Anything POSIX-like.
    Posix,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else {
            HostOs::Posix
        }
    }
}

const WINDOWS_PREFERENCE: &[&str] = &["pwsh.exe", "powershell.exe"];
const WINDOWS_FALLBACK: &str = "powershell.exe";
const POSIX_PREFERENCE: &[&str] = &["bash", "ash", "sh"];
const POSIX_FALLBACK: &str = "/bin/sh";

/// Pick the shell for this process's environment.
pub fn default_shell() -> PathBuf {
    let shell_env = std::env::var("SHELL").ok();
    resolve_shell(HostOs::current(), shell_env.as_deref(), find_in_path)
}

/// Shell choice given the platform, the inherited `SHELL` value and a
/// PATH lookup.
///
/// On Windows `SHELL` is ignored: Git Bash/MSYS exports a Unix-style path
/// there that ConPTY cannot execute.
pub fn resolve_shell<F>(os: HostOs, shell_env: Option<&str>, find: F) -> PathBuf
where
    F: Fn(&str) -> Option<PathBuf>,
{
    match os {
        HostOs::Windows => WINDOWS_PREFERENCE
            .iter()
            .find_map(|name| find(name))
            .unwrap_or_else(|| PathBuf::from(WINDOWS_FALLBACK)),
        HostOs::Posix => {
            if let Some(shell) = shell_env.filter(|s| !s.is_empty()) {
                return PathBuf::from(shell);
            }
            POSIX_PREFERENCE
                .iter()
                .find_map(|name| find(name))
                .unwrap_or_else(|| PathBuf::from(POSIX_FALLBACK))
        }
    }
}

/// Look `name` up in `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
