//! Session registry: which shells exist, keyed by [`SessionKey`].
//!
//! Membership changes happen under one map-wide lock, and so does session
//! creation, so two connections racing on the same key can never spawn two
//! shells. PTY I/O never happens under this lock. Dead sessions are replaced
//! lazily on the next lookup.

use super::shell::default_shell;
use super::terminal::TerminalSession;
use nebterm_core::{SessionKey, TermResult};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// `PATH` given to shells whose environment has none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Owns every terminal session on the server.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<TerminalSession>>>,
    /// Fixed shell instead of the resolved default.
    shell: Option<PathBuf>,
}

impl SessionRegistry {
    /// Create an empty registry that resolves the default shell per session.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            shell: None,
        }
    }

    /// Create an empty registry that always starts `shell`.
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            shell: Some(shell.into()),
        }
    }

    /// Return the live session for `key`, starting one if there is none or
    /// the existing one has died. A live session is returned untouched.
    pub async fn get_or_create(
        &self,
        key: &SessionKey,
        working_dir: &Path,
    ) -> TermResult<Arc<TerminalSession>> {
        let mut sessions = self.sessions.lock().await;
        debug!(key = %key, total = sessions.len(), "get_or_create");

        if let Some(existing) = sessions.get(key) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            info!(key = %key, "session is dead, recreating");
            if let Some(stale) = sessions.remove(key) {
                stale.close().await;
            }
        }

        self.create_locked(&mut sessions, key, working_dir)
    }

    /// Start a fresh session for `key`, closing any existing one even if it
    /// is still running.
    pub async fn create(
        &self,
        key: &SessionKey,
        working_dir: &Path,
    ) -> TermResult<Arc<TerminalSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.remove(key) {
            info!(key = %key, pid = ?existing.pid(), "replacing session");
            existing.close().await;
        }
        self.create_locked(&mut sessions, key, working_dir)
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Close and forget the session for `key`. No-op if absent.
    pub async fn remove(&self, key: &SessionKey) {
        let removed = self.sessions.lock().await.remove(key);
        if let Some(session) = removed {
            session.close().await;
            info!(key = %key, "session removed");
        }
    }

    /// Resize the PTY of `key`'s session. A missing session is not an error:
    /// clients routinely race a resize against a shell that just ended.
    pub async fn resize(&self, key: &SessionKey, rows: u16, cols: u16) -> TermResult<()> {
        let session = self.sessions.lock().await.get(key).cloned();
        match session {
            Some(session) => session.resize(rows, cols),
            None => {
                debug!(key = %key, "resize for unknown session ignored");
                Ok(())
            }
        }
    }

    /// Close every session. Called once at process teardown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        for (_, session) in drained {
            session.close().await;
        }
        info!(count, "all sessions closed");
    }

    /// Number of registered sessions, dead or alive.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn create_locked(
        &self,
        sessions: &mut HashMap<SessionKey, Arc<TerminalSession>>,
        key: &SessionKey,
        working_dir: &Path,
    ) -> TermResult<Arc<TerminalSession>> {
        let shell = self.shell.clone().unwrap_or_else(default_shell);
        let cwd = resolve_working_dir(working_dir);
        let env = child_env(std::env::vars_os(), &cwd, &shell);

        let session = TerminalSession::spawn(key.clone(), &shell, &cwd, &env).map_err(|e| {
            warn!(key = %key, shell = %shell.display(), error = %e, "failed to start shell");
            e
        })?;

        sessions.insert(key.clone(), session.clone());
        info!(key = %key, pid = ?session.pid(), total = sessions.len(), "session created");
        Ok(session)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `dir` if it is an accessible directory, otherwise the system temp dir.
pub fn resolve_working_dir(dir: &Path) -> PathBuf {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => dir.to_path_buf(),
        _ => {
            let fallback = std::env::temp_dir();
            warn!(
                requested = %dir.display(),
                fallback = %fallback.display(),
                "working directory unavailable, using temp dir"
            );
            fallback
        }
    }
}

/// Child environment: `base` with identity/shell/path defaults filled in
/// where missing, and a capable terminal type forced.
pub fn child_env<I>(base: I, working_dir: &Path, shell: &Path) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = base
        .into_iter()
        .filter(|(k, _)| !is_var(k, "TERM") && !is_var(k, "COLORTERM"))
        .collect();

    let defaults: [(&str, OsString); 4] = [
        ("HOME", working_dir.as_os_str().to_owned()),
        ("USER", OsString::from("root")),
        ("SHELL", shell.as_os_str().to_owned()),
        ("PATH", OsString::from(DEFAULT_PATH)),
    ];
    for (name, value) in defaults {
        if !env.iter().any(|(k, _)| is_var(k, name)) {
            env.push((OsString::from(name), value));
        }
    }

    env.push(("TERM".into(), "xterm-256color".into()));
    env.push(("COLORTERM".into(), "truecolor".into()));
    env
}

fn is_var(key: &OsStr, name: &str) -> bool {
    key == OsStr::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(env: &'a [(OsString, OsString)], name: &str) -> Option<&'a OsStr> {
        env.iter()
            .find(|(k, _)| is_var(k, name))
            .map(|(_, v)| v.as_os_str())
    }

    #[test]
    fn env_fills_missing_defaults() {
        let env = child_env(Vec::new(), Path::new("/work"), Path::new("/bin/bash"));
        assert_eq!(lookup(&env, "HOME"), Some(OsStr::new("/work")));
        assert_eq!(lookup(&env, "USER"), Some(OsStr::new("root")));
        assert_eq!(lookup(&env, "SHELL"), Some(OsStr::new("/bin/bash")));
        assert_eq!(lookup(&env, "PATH"), Some(OsStr::new(DEFAULT_PATH)));
        assert_eq!(lookup(&env, "TERM"), Some(OsStr::new("xterm-256color")));
        assert_eq!(lookup(&env, "COLORTERM"), Some(OsStr::new("truecolor")));
    }

    #[test]
    fn env_keeps_inherited_values() {
        let base = vec![
            (OsString::from("HOME"), OsString::from("/home/alice")),
            (OsString::from("USER"), OsString::from("alice")),
            (OsString::from("TERM"), OsString::from("dumb")),
            (OsString::from("EDITOR"), OsString::from("vi")),
        ];
        let env = child_env(base, Path::new("/work"), Path::new("/bin/sh"));
        assert_eq!(lookup(&env, "HOME"), Some(OsStr::new("/home/alice")));
        assert_eq!(lookup(&env, "USER"), Some(OsStr::new("alice")));
        assert_eq!(lookup(&env, "EDITOR"), Some(OsStr::new("vi")));
        assert_eq!(lookup(&env, "TERM"), Some(OsStr::new("xterm-256color")));
        assert_eq!(env.iter().filter(|(k, _)| is_var(k, "TERM")).count(), 1);
    }

    #[test]
    fn working_dir_fallback() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_working_dir(dir.path()), dir.path());

        let missing = dir.path().join("does-not-exist");
        assert_eq!(resolve_working_dir(&missing), std::env::temp_dir());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(resolve_working_dir(&file), std::env::temp_dir());
    }
}
