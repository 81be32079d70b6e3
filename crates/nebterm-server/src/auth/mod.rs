//! Credential validation for terminal connections.

pub mod validator;

pub use validator::{authenticate, CredentialValidator, Identity, TokenValidator, Validation};
