//! Core server: accepts connections, runs the upgrade checks, and hands each
//! accepted connection to the terminal bridge.
//!
//! Owns the credential validator and the session registry. Sessions are not
//! tied to any connection; they live until their shell exits, a fresh
//! connection replaces them, or the server shuts down.

use crate::auth::CredentialValidator;
use crate::bridge::TerminalBridge;
use crate::config::ServerConfig;
use crate::session::SessionRegistry;
use crate::transport::websocket::{self, IncomingConnection};
use nebterm_core::{TermError, TermResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// The nebterm server instance.
pub struct TermServer {
    config: ServerConfig,
    validator: Arc<dyn CredentialValidator>,
    bridge: TerminalBridge,
}

impl TermServer {
    pub fn new(config: ServerConfig, validator: Arc<dyn CredentialValidator>) -> Self {
        Self::with_registry(config, validator, Arc::new(SessionRegistry::new()))
    }

    /// Build a server around an existing registry (tests pin the shell this way).
    pub fn with_registry(
        config: ServerConfig,
        validator: Arc<dyn CredentialValidator>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        if !config.working_dir.is_dir() {
            warn!(
                path = %config.working_dir.display(),
                "working directory missing, shells will start in the temp directory"
            );
        }
        let bridge = TerminalBridge::new(registry, config.working_dir.clone());
        Self {
            config,
            validator,
            bridge,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.bridge.registry()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>, tls_config: Option<Arc<rustls::ServerConfig>>) -> TermResult<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TermError::Transport(format!("bind {addr} failed: {e}")))?;
        self.serve(listener, tls_config).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> TermResult<()> {
        let local: SocketAddr = listener.local_addr()?;
        let tls = tls_config.map(TlsAcceptor::from);
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        let mut incoming = websocket::start_listener(listener, tls);

        info!(
            addr = %local,
            url = %format!("{scheme}://{local}{}", crate::handshake::TERMINAL_PATH),
            working_dir = %self.config.working_dir.display(),
            "nebterm-server ready"
        );

        while let Some(conn) = incoming.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                match srv.handle_connection(conn).await {
                    Ok(()) => {}
                    Err(TermError::Unauthorized(reason)) => {
                        info!(remote = %remote, reason = %reason, "connection refused")
                    }
                    Err(e) => warn!(remote = %remote, error = %e, "connection error"),
                }
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    async fn handle_connection(&self, conn: IncomingConnection) -> TermResult<()> {
        let remote = conn.remote_addr;
        debug!(remote = %remote, "upgrading connection");

        let (request, sink, source) = websocket::accept(conn.stream, self.validator.as_ref()).await?;
        info!(
            remote = %remote,
            user = %request.identity.username,
            key = %request.key,
            mode = ?request.mode,
            "terminal connection"
        );

        self.bridge
            .serve(request.key, request.mode, sink, source)
            .await
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let count = self.registry().len().await;
        info!(sessions = count, "closing all sessions");
        self.registry().shutdown().await;
    }
}
