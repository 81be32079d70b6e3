//! One persistent shell: a PTY, the child bound to it, and the slot for the
//! transport currently attached to it.
//!
//! Exclusive PTY access is a protocol, not a lock. Only the attached
//! transport's pump reads and only its inbound loop writes; [`attach`]
//! displaces the previous transport by closing it, and the displaced pump and
//! loop stop on their next failed I/O. The reader counter exists so tests can
//! observe how many pumps are reading at once.
//!
//! [`attach`]: TerminalSession::attach

use super::pty::{PtyHandle, INITIAL_COLS, INITIAL_ROWS};
use nebterm_core::{FrameSink, SessionKey, TermError, TermResult};
use portable_pty::ChildKiller;
use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A live (or formerly live) shell session.
pub struct TerminalSession {
    key: SessionKey,
    pty: PtyHandle,
    pid: Option<u32>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// `true` until the child exits or the session is closed; flips once.
    alive: Arc<watch::Sender<bool>>,
    /// The transport allowed to read and write the PTY.
    active: Mutex<Option<Arc<dyn FrameSink>>>,
    readers: Arc<AtomicUsize>,
    created_at: Instant,
}

impl TerminalSession {
    /// Start `shell` in `cwd` and launch the exit supervisor.
    pub fn spawn(
        key: SessionKey,
        shell: &Path,
        cwd: &Path,
        env: &[(OsString, OsString)],
    ) -> TermResult<Arc<Self>> {
        let (pty, mut child) = PtyHandle::spawn(shell, cwd, env, INITIAL_ROWS, INITIAL_COLS)?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);

        let session = Arc::new(Self {
            key: key.clone(),
            pty,
            pid,
            killer: Mutex::new(killer),
            alive: alive.clone(),
            active: Mutex::new(None),
            readers: Arc::new(AtomicUsize::new(0)),
            created_at: Instant::now(),
        });

        // Supervisor: owns the child for its whole life and flips liveness
        // when it exits, attached or not. It waits as long as the shell runs,
        // so it gets its own thread rather than a blocking-pool slot.
        let supervisor = std::thread::Builder::new()
            .name(format!("pty-wait-{}", pid.unwrap_or_default()))
            .spawn(move || {
                match child.wait() {
                    Ok(status) => info!(key = %key, ?pid, code = status.exit_code(), "shell exited"),
                    Err(e) => warn!(key = %key, ?pid, error = %e, "waiting for shell failed"),
                }
                mark_dead(&alive);
            });
        if let Err(e) = supervisor {
            mark_dead(&session.alive);
            let _ = session
                .killer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .kill();
            session.pty.close();
            return Err(TermError::Spawn(format!("cannot start shell supervisor: {e}")));
        }

        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// OS process id of the shell.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the shell is still running and the session not closed.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Resolve once the session is dead.
    pub async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        let _ = rx.wait_for(|alive| !*alive).await;
    }

    /// Install `transport` as the sole active transport, closing the one it
    /// displaces. The PTY is untouched.
    pub async fn attach(&self, transport: Arc<dyn FrameSink>) {
        let new_id = transport.id();
        let previous = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.replace(transport)
        };

        match previous {
            Some(prev) if prev.id() != new_id => {
                info!(key = %self.key, old = prev.id(), new = new_id, "displacing attached transport");
                prev.close().await;
            }
            _ => debug!(key = %self.key, transport = new_id, "transport attached"),
        }
    }

    /// Clear the active slot if it still holds transport `id`.
    ///
    /// Returns whether the slot was cleared; a displaced transport gets
    /// `false` and leaves its successor in place.
    pub fn detach(&self, id: u64) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().map(|t| t.id()) == Some(id) {
            active.take();
            debug!(key = %self.key, transport = id, "transport detached");
            true
        } else {
            false
        }
    }

    /// Id of the currently attached transport.
    pub fn active_transport(&self) -> Option<u64> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.id())
    }

    /// Open a reader on the shell output (blocking reads).
    pub fn open_reader(&self) -> TermResult<PtyReader> {
        let inner = self.pty.clone_reader()?;
        self.readers.fetch_add(1, Ordering::SeqCst);
        Ok(PtyReader {
            inner,
            readers: self.readers.clone(),
        })
    }

    /// Number of readers currently open on this session's PTY.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// Write shell input (blocking).
    pub fn write_input(&self, data: &[u8]) -> TermResult<()> {
        if !self.is_alive() {
            return Err(TermError::Pty("session closed".into()));
        }
        self.pty.write_all(data)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> TermResult<()> {
        self.pty.resize(rows, cols)
    }

    /// Current PTY geometry as `(rows, cols)`.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.pty.size()
    }

    /// Kill the shell, release the PTY and close the attached transport.
    /// Idempotent.
    pub async fn close(&self) {
        let first = mark_dead(&self.alive);

        if let Err(e) = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
        {
            // Already reaped by the supervisor.
            debug!(key = %self.key, error = %e, "kill failed");
        }
        self.pty.close();

        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = active {
            transport.close().await;
        }

        if first {
            info!(
                key = %self.key,
                pid = ?self.pid,
                uptime_secs = self.created_at.elapsed().as_secs(),
                "session closed"
            );
        }
    }
}

/// Flip the liveness signal. Returns `true` only for the call that flipped it.
fn mark_dead(alive: &watch::Sender<bool>) -> bool {
    alive.send_if_modified(|alive| std::mem::replace(alive, false))
}

/// Blocking reader on a session's PTY output, counted while open.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
    readers: Arc<AtomicUsize>,
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for PtyReader {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}
