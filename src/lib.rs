//! # zastrow-collab — shared-cursor presence for the homepage
//!
//! Peers visiting the same page join a named room and broadcast
//! ephemeral cursor positions to each other through a relay server,
//! with CRDT document synchronization riding the same connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐                      ┌─────────────┐
//! │ PresenceSession │──┐   WebSocket       │ RelayServer │
//! │ (supervisor)    │  ├──────────────────►│ (room A)    │
//! └──────┬──────────┘  │   Binary Proto    └─────────────┘
//!        │ failover    │                   ┌─────────────┐
//!        ▼             └──────────────────►│ RelayServer │
//! ┌─────────────────┐                      │ (room A)    │
//! │ PresenceChannel │                      └─────────────┘
//! │ (one relay)     │
//! └──────┬──────────┘
//!        ▼
//! ┌─────────────────┐
//! │ CursorTable     │──► remote_cursors() projection
//! │ + yrs Doc       │
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope (bincode-encoded RelayMessage)
//! - [`presence`] — awareness records, cursor table, projection
//! - [`broadcast`] — room fan-out with backpressure
//! - [`channel`] — presence channel to a single relay
//! - [`reconnect`] — session supervisor with round-robin failover
//! - [`relay`] — WebSocket relay server
//!
//! A channel connects to exactly one relay and never retries; the
//! session supervises channels, cycling through the candidate relay
//! list with a 5s connect timeout and 500ms backoff until torn down.

pub mod broadcast;
pub mod channel;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod relay;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{ChannelEvent, ConnectionStatus, PresenceChannel};
pub use presence::{AwarenessUpdate, CursorColor, CursorTable, RemoteCursor, Vec2};
pub use protocol::{MessageType, PresenceError, RelayMessage};
pub use reconnect::{ConnectionDescriptor, PresenceSession, SessionConfig, SessionEvent};
pub use relay::{RelayConfig, RelayServer, RelayStats};
