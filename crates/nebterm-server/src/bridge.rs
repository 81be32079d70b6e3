//! Transport bridge: connects one client connection to a session's PTY.
//!
//! Per connection: look the session up (or start it), attach this transport,
//! start the PTY → transport pump on its own thread, and run the
//! transport → PTY loop on the caller's task until the connection ends. The
//! session outlives the connection; a later connection with the same key
//! picks it back up.

use crate::session::{SessionRegistry, TerminalSession};
use crate::session::pty::is_end_of_stream;
use nebterm_core::{
    ClientMessage, Frame, FrameSink, FrameSource, ServerMessage, SessionKey, TermResult,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// PTY read chunk size.
const READ_BUF_SIZE: usize = 4096;

/// Close reason sent when the shell's output ends.
pub const SHELL_EXITED: &str = "shell exited";

/// Message sent to the client when no session could be started.
pub const SPAWN_FAILED: &str = "Failed to create terminal";

/// How a connection picks its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Reuse the running shell for the key, starting one if needed.
    #[default]
    Resume,
    /// Discard any running shell for the key and start a new one.
    Fresh,
}

/// Shared per-server bridge state.
pub struct TerminalBridge {
    registry: Arc<SessionRegistry>,
    working_dir: PathBuf,
}

impl TerminalBridge {
    pub fn new(registry: Arc<SessionRegistry>, working_dir: PathBuf) -> Self {
        Self {
            registry,
            working_dir,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve one connection until it ends.
    ///
    /// Returns an error only if no session could be obtained; the client has
    /// been sent an error message in that case.
    pub async fn serve<S>(
        &self,
        key: SessionKey,
        mode: OpenMode,
        sink: Arc<dyn FrameSink>,
        mut source: S,
    ) -> TermResult<()>
    where
        S: FrameSource,
    {
        let obtained = match mode {
            OpenMode::Resume => self.registry.get_or_create(&key, &self.working_dir).await,
            OpenMode::Fresh => self.registry.create(&key, &self.working_dir).await,
        };
        let session = match obtained {
            Ok(session) => session,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to create session");
                let message = ServerMessage::error(SPAWN_FAILED).to_json()?;
                let _ = sink.send(Frame::Text(message)).await;
                sink.close().await;
                return Err(e);
            }
        };

        let transport = sink.id();
        if !attach_live(&session, sink.clone()).await {
            info!(key = %key, transport, "session ended before attach");
            return Ok(());
        }
        info!(key = %key, transport, pid = ?session.pid(), "transport attached");

        if let Err(e) = spawn_output_pump(session.clone(), sink.clone()) {
            warn!(key = %key, transport, error = %e, "cannot start output pump");
            sink.close().await;
            session.detach(transport);
            return Err(e);
        }
        self.inbound_loop(&key, &session, &mut source).await;

        // Make the pump's next write fail, if it has not already.
        sink.close().await;
        session.detach(transport);
        info!(key = %key, transport, "connection ended, session kept");
        Ok(())
    }

    /// Transport → PTY. Returns when the transport read fails or the peer
    /// closes.
    async fn inbound_loop<S: FrameSource>(
        &self,
        key: &SessionKey,
        session: &Arc<TerminalSession>,
        source: &mut S,
    ) {
        loop {
            let frame = match source.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(key = %key, "peer closed");
                    break;
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "transport read ended");
                    break;
                }
            };

            match frame {
                Frame::Binary(data) => write_input(key, session, data).await,
                Frame::Text(text) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Input { data }) => {
                        write_input(key, session, data.into_bytes()).await
                    }
                    Ok(ClientMessage::Resize { rows, cols }) => {
                        debug!(key = %key, rows, cols, "resize");
                        if let Err(e) = self.registry.resize(key, rows, cols).await {
                            warn!(key = %key, error = %e, "resize failed");
                        }
                    }
                    Err(e) => debug!(key = %key, error = %e, "ignoring control message"),
                },
                Frame::Close(reason) => {
                    debug!(key = %key, ?reason, "peer sent close");
                    break;
                }
            }
        }
    }
}

/// Attach `sink` to `session`, unless the session died first.
///
/// A concurrent fresh connection may close the session between lookup and
/// attach. In that case the client is told the shell exited and the sink is
/// closed instead of leaving it attached to a dead PTY.
async fn attach_live(session: &TerminalSession, sink: Arc<dyn FrameSink>) -> bool {
    session.attach(sink.clone()).await;
    if session.is_alive() {
        return true;
    }
    session.detach(sink.id());
    end_with_shell_exited(sink.as_ref()).await;
    false
}

async fn end_with_shell_exited(sink: &dyn FrameSink) {
    let _ = sink.send(Frame::Close(Some(SHELL_EXITED.into()))).await;
    sink.close().await;
}

async fn write_input(key: &SessionKey, session: &Arc<TerminalSession>, data: Vec<u8>) {
    let session = session.clone();
    let result = tokio::task::spawn_blocking(move || session.write_input(&data)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(key = %key, error = %e, "PTY write failed"),
        Err(e) => warn!(key = %key, error = %e, "PTY write task failed"),
    }
}

/// PTY → transport, on a dedicated thread. A displaced pump can sit in a
/// blocking read until the shell next prints, so it must not occupy the
/// runtime's blocking pool.
///
/// Stops on the first failed transport write or PTY read; on end-of-stream
/// (or a PTY that is already gone) it first tells the client the shell exited.
///
/// Must be called from within a tokio runtime.
pub fn spawn_output_pump(
    session: Arc<TerminalSession>,
    sink: Arc<dyn FrameSink>,
) -> TermResult<JoinHandle<()>> {
    let rt = tokio::runtime::Handle::current();
    let name = format!("pty-pump-{}", sink.id());
    let handle = std::thread::Builder::new().name(name).spawn(move || {
        let key = session.key().clone();
        let transport = sink.id();
        let mut reader = match session.open_reader() {
            Ok(reader) => reader,
            Err(e) => {
                debug!(key = %key, transport, error = %e, "PTY unavailable");
                rt.block_on(end_with_shell_exited(sink.as_ref()));
                return;
            }
        };
        debug!(key = %key, transport, "output pump started");

        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            if sink.is_closed() {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(key = %key, "PTY EOF");
                    let _ = rt.block_on(sink.send(Frame::Close(Some(SHELL_EXITED.into()))));
                    break;
                }
                Ok(n) => {
                    if let Err(e) = rt.block_on(sink.send(Frame::Binary(buf[..n].to_vec()))) {
                        debug!(key = %key, transport, error = %e, "transport write failed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_end_of_stream(&e) {
                        debug!(key = %key, "PTY end of stream");
                        let _ = rt.block_on(sink.send(Frame::Close(Some(SHELL_EXITED.into()))));
                    } else {
                        warn!(key = %key, error = %e, "PTY read error");
                    }
                    break;
                }
            }
        }
        debug!(key = %key, transport, "output pump stopped");
    })?;
    Ok(handle)
}
