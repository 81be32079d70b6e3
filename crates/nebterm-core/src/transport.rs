//! Abstract frame transport for terminal connections.
//!
//! A connection is split into a [`FrameSink`] (shared: the session keeps a
//! reference so a newer connection can close it) and a [`FrameSource`] (owned
//! by the connection's inbound loop). Closing the sink must make the paired
//! source fail; that is the only cancellation signal a displaced connection
//! ever receives.

use crate::error::TermResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

/// One message on a terminal connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw terminal bytes, either direction.
    Binary(Vec<u8>),
    /// JSON control message.
    Text(String),
    /// Orderly close with an optional reason.
    Close(Option<String>),
}

/// Outbound half of a connection.
pub trait FrameSink: Send + Sync {
    /// Process-unique id, used to tell connections apart on hand-off.
    fn id(&self) -> u64;

    /// Send one frame. Fails once the sink is closed.
    fn send(&self, frame: Frame) -> Pin<Box<dyn Future<Output = TermResult<()>> + Send + '_>>;

    /// Close the connection. Idempotent. Implementations must mark the sink
    /// closed before the returned future is first polled.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Whether the sink has been closed (locally or by a failed write).
    fn is_closed(&self) -> bool;
}

/// Inbound half of a connection.
pub trait FrameSource: Send {
    /// Next frame from the peer. `Ok(None)` means the peer closed cleanly;
    /// an error means the connection failed or was closed from our side.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = TermResult<Option<Frame>>> + Send + '_>>;
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh transport id.
pub fn next_transport_id() -> u64 {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = next_transport_id();
        let b = next_transport_id();
        assert_ne!(a, b);
    }
}
