//! Typed identifiers for rows, users, and sessions.
//!
//! All ID types wrap UUIDv7 (time-ordered, globally unique). The backing store
//! assigns `RowId`s on create; the client also mints them for speculative rows
//! before the server has answered. They display as standard UUID text for
//! logging. The `short()` form (first 8 hex chars) is for human-facing UI and
//! never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A row identifier in any collection (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(uuid::Uuid);

/// A user identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(uuid::Uuid);

/// A browser-session identifier (UUIDv7). One user may hold several.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for human display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// A nil / zero ID, for sentinel values only.
            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            /// Check if this is the nil ID.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full UUID with hyphens for log readability
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(RowId, "RowId");
impl_typed_id!(UserId, "UserId");
impl_typed_id!(SessionId, "SessionId");

impl RowId {
    /// Read a row id out of a JSON value (string UUID).
    ///
    /// Returns `None` for anything that is not a parseable UUID string, which
    /// is how partial realtime payloads surface.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_str().and_then(|s| Self::parse(s).ok())
    }

    /// JSON form of this id, as stored in rows.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::String(self.0.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
