//! WebSocket transport using tokio-tungstenite.
//!
//! The listener accepts TCP (optionally wrapped in TLS) and hands raw streams
//! to the server; [`accept`] runs the upgrade with the request checks from
//! [`crate::handshake`] and splits the socket into a [`WsSink`] and
//! [`WsSource`].

use crate::auth::CredentialValidator;
use crate::handshake::{check_request, ConnectRequest, Rejection};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nebterm_core::{next_transport_id, Frame, FrameSink, FrameSource, TermError, TermResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// Maximum frame size for WebSocket messages (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A byte stream the upgrade can run over: plain TCP or TLS.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// An accepted (and, with TLS, decrypted) connection awaiting upgrade.
pub struct IncomingConnection {
    pub stream: Box<dyn ClientStream>,
    pub remote_addr: SocketAddr,
}

/// Start accepting on `listener`.
///
/// Returns a receiver that yields accepted connections. TLS handshakes run on
/// their own tasks so a slow client cannot hold up the accept loop.
pub fn start_listener(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> mpsc::Receiver<IncomingConnection> {
    let (tx, rx) = mpsc::channel::<IncomingConnection>(64);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let tx = tx.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let stream: Box<dyn ClientStream> = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };
                        let conn = IncomingConnection {
                            stream,
                            remote_addr: addr,
                        };
                        if tx.send(conn).await.is_err() {
                            warn!("connection channel closed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("listener stopped");
                break;
            }
        }
    });

    rx
}

/// Run the WebSocket upgrade on `stream`, refusing it (404/401) when the
/// request does not pass [`check_request`].
pub async fn accept<S>(
    stream: S,
    validator: &dyn CredentialValidator,
) -> TermResult<(ConnectRequest, Arc<WsSink<S>>, WsSource<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut accepted = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match check_request(req.uri().path(), req.uri().query(), validator) {
            Ok(request) => {
                accepted = Some(request);
                Ok(resp)
            }
            Err(rejection) => Err(rejection_response(&rejection)),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(resp)) => {
            return Err(TermError::Unauthorized(format!(
                "upgrade refused with {}",
                resp.status()
            )))
        }
        Err(e) => return Err(TermError::Transport(format!("WS handshake failed: {e}"))),
    };
    let request =
        accepted.ok_or_else(|| TermError::Transport("upgrade completed without a request".into()))?;

    let (sink, source) = split(ws);
    Ok((request, sink, source))
}

fn rejection_response(rejection: &Rejection) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(rejection.body().to_string()));
    *resp.status_mut() = match rejection {
        Rejection::NotFound => StatusCode::NOT_FOUND,
        Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
    };
    resp
}

type Writer<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Outbound half of a WebSocket connection.
pub struct WsSink<S> {
    id: u64,
    writer: Writer<S>,
    closed: watch::Sender<bool>,
}

/// Inbound half of a WebSocket connection. Fails as soon as the paired sink
/// is closed.
pub struct WsSource<S> {
    reader: SplitStream<WebSocketStream<S>>,
    closed: watch::Receiver<bool>,
}

/// Split an upgraded socket into its two halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (Arc<WsSink<S>>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (writer, reader) = ws.split();
    let (closed, closed_rx) = watch::channel(false);
    let sink = Arc::new(WsSink {
        id: next_transport_id(),
        writer: Arc::new(Mutex::new(writer)),
        closed,
    });
    let source = WsSource {
        reader,
        closed: closed_rx,
    };
    (sink, source)
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: Frame) -> Pin<Box<dyn Future<Output = TermResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TermError::TransportClosed);
            }
            let (message, is_close) = match frame {
                Frame::Binary(data) => (Message::Binary(data), false),
                Frame::Text(text) => (Message::Text(text), false),
                Frame::Close(reason) => (
                    Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.unwrap_or_default().into(),
                    })),
                    true,
                ),
            };

            let result = self.writer.lock().await.send(message).await;
            if is_close || result.is_err() {
                self.closed.send_replace(true);
            }
            result.map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            // The close handshake waits on the writer lock, which an in-flight
            // send may hold; never make the caller wait for it.
            let writer = self.writer.clone();
            let id = self.id;
            tokio::spawn(async move {
                if let Err(e) = writer.lock().await.close().await {
                    debug!(transport = id, error = %e, "WS close failed");
                }
            });
        }
        Box::pin(async {})
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TermResult<Option<Frame>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = wait_closed(&mut self.closed) => return Err(TermError::TransportClosed),
                    next = self.reader.next() => next,
                };
                match next {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > MAX_WS_FRAME_SIZE {
                            return Err(TermError::InvalidMessage(format!(
                                "WS frame too large: {} bytes (max {})",
                                data.len(),
                                MAX_WS_FRAME_SIZE
                            )));
                        }
                        return Ok(Some(Frame::Binary(data.to_vec())));
                    }
                    Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                    Some(Ok(Message::Close(frame))) => {
                        return Ok(Some(Frame::Close(
                            frame.map(|f| f.reason.to_string()),
                        )))
                    }
                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(TermError::Transport(format!("WS recv failed: {e}")))
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
