//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal, starts a child bound to it, and exposes blocking
//! read/write and resize operations. Reads go through per-caller reader
//! handles cloned from the master, so no lock sits on the read path; which
//! task may read is decided by the attach protocol, not by this type.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use nebterm_core::{TermError, TermResult};

/// Geometry every new PTY starts with; clients resize right after attaching.
pub const INITIAL_ROWS: u16 = 24;
pub const INITIAL_COLS: u16 = 80;

/// A managed PTY master plus its input writer.
pub struct PtyHandle {
    /// Master side, for resize and reader cloning. `None` once closed.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Input side of the PTY. `None` once closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl PtyHandle {
    /// Open a PTY and start `shell` on it in `cwd` with exactly `env`.
    ///
    /// The slave end is dropped before returning so that reads on the master
    /// report end-of-stream once the child exits.
    pub fn spawn(
        shell: &Path,
        cwd: &Path,
        env: &[(OsString, OsString)],
        rows: u16,
        cols: u16,
    ) -> TermResult<(Self, Box<dyn Child + Send + Sync>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TermError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell.as_os_str());
        cmd.cwd(cwd.as_os_str());
        cmd.env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(format!("failed to spawn {}: {e}", shell.display())))?;
        drop(pair.slave);

        info!(shell = %shell.display(), cwd = %cwd.display(), pid = ?child.process_id(), "PTY spawned");

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::Spawn(format!("failed to take PTY writer: {e}")))?;

        Ok((
            Self {
                master: Mutex::new(Some(pair.master)),
                writer: Mutex::new(Some(writer)),
            },
            child,
        ))
    }

    /// A fresh reader on the PTY output. Blocking; use from a blocking task.
    pub fn clone_reader(&self) -> TermResult<Box<dyn Read + Send>> {
        let master = self
            .master
            .lock()
            .map_err(|_| TermError::Pty("PTY master lock poisoned".into()))?;
        let master = master
            .as_ref()
            .ok_or_else(|| TermError::Pty("PTY closed".into()))?;
        master
            .try_clone_reader()
            .map_err(|e| TermError::Pty(format!("failed to clone PTY reader: {e}")))
    }

    /// Write to the PTY input (blocking, call from a spawn_blocking context).
    pub fn write_all(&self, data: &[u8]) -> TermResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TermError::Pty("PTY writer lock poisoned".into()))?;
        let writer = writer
            .as_mut()
            .ok_or_else(|| TermError::Pty("PTY closed".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> TermResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| TermError::Pty("PTY master lock poisoned".into()))?;
        master
            .as_ref()
            .ok_or_else(|| TermError::Pty("PTY closed".into()))?
            .resize(size)
            .map_err(|e| TermError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(rows, cols, "PTY resized");
        Ok(())
    }

    /// Current geometry as `(rows, cols)`, if the PTY is still open.
    pub fn size(&self) -> Option<(u16, u16)> {
        let master = self.master.lock().ok()?;
        let size = master.as_ref()?.get_size().ok()?;
        Some((size.rows, size.cols))
    }

    /// Release the master and writer. Idempotent.
    pub fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            if master.take().is_some() {
                debug!("PTY master released");
            }
        }
    }
}

/// Whether a PTY read error means the child side went away.
///
/// Linux reports `EIO` on the master once the last slave descriptor closes.
pub fn is_end_of_stream(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::EIO) {
            return true;
        }
    }
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh_env() -> Vec<(OsString, OsString)> {
        vec![
            ("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()),
            ("TERM".into(), "dumb".into()),
        ]
    }

    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline && !seen.contains(needle) {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
        seen
    }

    #[test]
    fn spawn_write_read() {
        let dir = std::env::temp_dir();
        let (pty, mut child) =
            PtyHandle::spawn(Path::new("/bin/sh"), &dir, &sh_env(), INITIAL_ROWS, INITIAL_COLS)
                .unwrap();
        let mut reader = pty.clone_reader().unwrap();
        pty.write_all(b"echo pty-$((40+2))\n").unwrap();
        assert!(read_until(&mut reader, "pty-42").contains("pty-42"));
        child.kill().ok();
        pty.close();
    }

    #[test]
    fn resize_updates_size() {
        let dir = std::env::temp_dir();
        let (pty, mut child) =
            PtyHandle::spawn(Path::new("/bin/sh"), &dir, &sh_env(), INITIAL_ROWS, INITIAL_COLS)
                .unwrap();
        assert_eq!(pty.size(), Some((INITIAL_ROWS, INITIAL_COLS)));
        pty.resize(40, 120).unwrap();
        assert_eq!(pty.size(), Some((40, 120)));
        child.kill().ok();
        pty.close();
        assert!(pty.resize(10, 10).is_err());
        assert_eq!(pty.size(), None);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = std::env::temp_dir();
        let result = PtyHandle::spawn(
            Path::new("/nonexistent/shell"),
            &dir,
            &sh_env(),
            INITIAL_ROWS,
            INITIAL_COLS,
        );
        assert!(matches!(result, Err(TermError::Spawn(_))));
    }

    #[test]
    fn eio_is_end_of_stream() {
        assert!(is_end_of_stream(&std::io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_end_of_stream(&std::io::Error::from_raw_os_error(libc::EAGAIN)));
    }
}
