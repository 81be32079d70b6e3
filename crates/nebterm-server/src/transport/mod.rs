//! Transport layer: the WebSocket listener and frame adapters, plus an
//! in-memory pair for tests.

#[cfg(test)]
pub(crate) mod memory;
pub mod websocket;
