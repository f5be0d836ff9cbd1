//! Engine defaults.
//!
//! Centralizes tuning values so [`SyncConfig`](crate::SyncConfig) and the
//! tests agree on them.

use std::time::Duration;

/// Idle window before a coalesced field edit is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(750);

/// Window over which presence join/leave bursts collapse into one update.
pub const DEFAULT_PRESENCE_COALESCE: Duration = Duration::from_millis(250);

/// Capacity of the cache-event and realtime broadcast channels.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Capacity of the notice (toast) broadcast channel.
pub const DEFAULT_NOTICE_BUFFER: usize = 256;

/// Presence channel joined by every session.
pub const PRESENCE_CHANNEL: &str = "online-users";
