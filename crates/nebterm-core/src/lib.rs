//! nebterm-core: shared protocol library for persistent web terminals.
//!
//! Provides the error type, session keys, the JSON control messages carried
//! in text frames, the transport frame abstraction, and HMAC-signed access
//! tokens.

pub mod error;
pub mod key;
pub mod messages;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{TermError, TermResult};
pub use key::{SessionKey, DEFAULT_INSTANCE_ID};
pub use messages::{ClientMessage, ServerMessage};
pub use token::{create_token, generate_secret, verify_token, Claims};
pub use transport::{next_transport_id, Frame, FrameSink, FrameSource};
