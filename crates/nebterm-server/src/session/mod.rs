//! Session management: shell resolution, PTY lifecycle, attach hand-off and
//! the key → session registry.

pub mod pty;
pub mod registry;
pub mod shell;
pub mod terminal;

pub use registry::SessionRegistry;
pub use terminal::{PtyReader, TerminalSession};
