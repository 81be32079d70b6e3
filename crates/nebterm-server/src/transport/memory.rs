//! In-process transport for exercising sessions and the bridge without a
//! socket. `pair()` returns the server halves plus a [`MemoryPeer`] playing
//! the client.

use nebterm_core::{next_transport_id, Frame, FrameSink, FrameSource, TermError, TermResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct MemorySink {
    id: u64,
    to_peer: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
}

pub struct MemorySource {
    from_peer: mpsc::UnboundedReceiver<Frame>,
    closed: watch::Receiver<bool>,
}

/// Client end of an in-memory connection.
pub struct MemoryPeer {
    to_server: Option<mpsc::UnboundedSender<Frame>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
    closed: watch::Receiver<bool>,
}

pub fn pair() -> (Arc<MemorySink>, MemorySource, MemoryPeer) {
    let (to_peer, from_server) = mpsc::unbounded_channel();
    let (to_server, from_peer) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);

    let sink = Arc::new(MemorySink {
        id: next_transport_id(),
        to_peer,
        closed,
    });
    let source = MemorySource {
        from_peer,
        closed: closed_rx.clone(),
    };
    let peer = MemoryPeer {
        to_server: Some(to_server),
        from_server,
        closed: closed_rx,
    };
    (sink, source, peer)
}

impl FrameSink for MemorySink {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: Frame) -> Pin<Box<dyn Future<Output = TermResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TermError::TransportClosed);
            }
            let is_close = matches!(frame, Frame::Close(_));
            if self.to_peer.send(frame).is_err() {
                self.closed.send_replace(true);
                return Err(TermError::TransportClosed);
            }
            if is_close {
                self.closed.send_replace(true);
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.closed.send_replace(true);
        Box::pin(async {})
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl FrameSource for MemorySource {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TermResult<Option<Frame>>> + Send + '_>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = wait_closed(&mut self.closed) => Err(TermError::TransportClosed),
                frame = self.from_peer.recv() => Ok(frame),
            }
        })
    }
}

impl MemoryPeer {
    /// Send a frame to the server side.
    pub fn send(&self, frame: Frame) -> bool {
        self.to_server
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Next frame from the server; `None` once the server side closed and
    /// everything sent before that has been drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.from_server.recv() => frame,
            _ = wait_closed(&mut self.closed) => self.from_server.try_recv().ok(),
        }
    }

    /// Hang up, as a browser tab closing would.
    pub fn disconnect(&mut self) {
        self.to_server.take();
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
