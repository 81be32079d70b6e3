//! Session keys: the stable identity of one logical terminal.
//!
//! A key is derived from the authenticated user and a client-chosen instance
//! identifier, so reconnects from the same browser tab land on the same shell
//! while a second tab can ask for its own.

use std::fmt;

/// Instance identifier used when the client does not supply one.
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Opaque identifier of one logical terminal (`term:<user>:<instance>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive the key for `user_id`'s terminal `instance_id`.
    ///
    /// An empty or missing instance id maps to [`DEFAULT_INSTANCE_ID`].
    pub fn for_instance(user_id: &str, instance_id: Option<&str>) -> Self {
        let instance = match instance_id {
            Some(id) if !id.is_empty() => id,
            _ => DEFAULT_INSTANCE_ID,
        };
        Self(format!("term:{user_id}:{instance}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}
