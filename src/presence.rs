//! Awareness records and cursor projection.
//!
//! Every peer in a room owns one ephemeral awareness record
//! `{ id, x, y, color }`: created on the peer's first pointer move,
//! overwritten on every subsequent move, removed when the peer leaves.
//!
//! ## Data flow
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! CursorTable::update_local_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessUpdate::Cursor { … }
//!       │
//!       ▼   (relay broadcast)
//! Remote CursorTable::apply()
//!       │
//!       ▼
//! CursorTable::remote_cursors()  (projection, local peer excluded)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D cursor position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Both coordinates are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Derive a stable, visually distinct color from a peer id.
    ///
    /// Hues are spread by golden-angle stepping (137.5° per step) at
    /// saturation 0.6 and lightness 0.45, so nearby peer ids land far
    /// apart on the color wheel.
    pub fn from_peer(id: Uuid) -> Self {
        let step = (id.as_u128() % 256) as f32;
        let hue = (step * 137.5) % 360.0;
        let (r, g, b) = hsl_to_rgb(hue / 360.0, 0.6, 0.45);
        Self { r, g, b, a: 1.0 }
    }

    /// Create from RGBA components.
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Convert to `[f32; 4]` for rendering.
    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire records
// ───────────────────────────────────────────────────────────────────

/// Awareness record updates sent over the wire.
///
/// These are serialized inside `RelayMessage::Awareness` payloads.
/// Cursor updates are rate-limited to 30fps (33ms) by the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessUpdate {
    /// Full cursor record for one peer. Overwrites any previous record.
    Cursor {
        peer_id: Uuid,
        position: Vec2,
        color: CursorColor,
        /// Per-sender monotonic sequence for last-write-wins ordering.
        seq: u64,
    },

    /// Explicit removal of the sender's record.
    Clear { peer_id: Uuid },
}

impl AwarenessUpdate {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    /// The peer this update belongs to.
    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessUpdate::Cursor { peer_id, .. } => *peer_id,
            AwarenessUpdate::Clear { peer_id } => *peer_id,
        }
    }

    /// The sequence number, if the variant carries one.
    pub fn seq(&self) -> u64 {
        match self {
            AwarenessUpdate::Cursor { seq, .. } => *seq,
            AwarenessUpdate::Clear { .. } => 0,
        }
    }
}

/// One renderable remote cursor, as projected from the awareness map.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub peer_id: Uuid,
    pub position: Vec2,
    pub color: CursorColor,
}

/// Remote peer record tracked locally.
#[derive(Debug, Clone)]
struct RemoteEntry {
    position: Vec2,
    color: CursorColor,
    last_seq: u64,
    last_update: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Cursor table — local record + all remote records
// ───────────────────────────────────────────────────────────────────

/// Awareness map for one channel: the local peer's record plus every
/// remote record, keyed by peer id.
///
/// The remote side is fed by [`CursorTable::apply`]; the local side by
/// [`CursorTable::update_local_cursor`], which rate-limits outgoing
/// broadcasts. [`CursorTable::remote_cursors`] is the projection handed
/// to rendering: the local peer is always excluded, and entries that
/// stopped updating are filtered out.
pub struct CursorTable {
    /// Our peer identity.
    local_peer_id: Uuid,
    /// Our stable cursor color, derived from the peer id.
    local_color: CursorColor,
    /// Last published local position, if any pointer move happened yet.
    local_cursor: Option<Vec2>,
    /// Remote records, keyed by peer id.
    peers: HashMap<Uuid, RemoteEntry>,
    /// Rate limiter: last time we broadcast a cursor update.
    last_broadcast: Instant,
    /// Minimum interval between cursor broadcasts (33ms = 30fps).
    broadcast_interval: Duration,
    /// Monotonic sequence counter for outgoing records.
    seq_counter: u64,
    /// Window after which a silent remote record is considered stale.
    idle_timeout: Duration,
}

impl CursorTable {
    /// Create a table for the given local peer.
    pub fn new(local_peer_id: Uuid) -> Self {
        Self {
            local_peer_id,
            local_color: CursorColor::from_peer(local_peer_id),
            local_cursor: None,
            peers: HashMap::new(),
            last_broadcast: Instant::now() - Duration::from_secs(1), // allow immediate first broadcast
            broadcast_interval: Duration::from_millis(33),
            seq_counter: 0,
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with a custom broadcast interval (for testing).
    pub fn with_interval(local_peer_id: Uuid, interval: Duration) -> Self {
        let mut table = Self::new(local_peer_id);
        table.broadcast_interval = interval;
        table
    }

    /// Record a local pointer move and return a broadcastable record.
    ///
    /// Rate-limited to 30fps. Returns `None` when throttled.
    pub fn update_local_cursor(&mut self, position: Vec2) -> Option<AwarenessUpdate> {
        self.local_cursor = Some(position);

        if self.last_broadcast.elapsed() < self.broadcast_interval {
            return None; // Throttled
        }
        Some(self.next_local_record(position))
    }

    /// Set the local position without producing a broadcast.
    pub fn set_local_cursor(&mut self, position: Vec2) {
        self.local_cursor = Some(position);
    }

    /// Produce a broadcast for the current local record, bypassing the
    /// rate limiter. Used to re-announce the cursor after a failover.
    ///
    /// Returns `None` if no pointer move has happened yet.
    pub fn force_local_broadcast(&mut self) -> Option<AwarenessUpdate> {
        let position = self.local_cursor?;
        Some(self.next_local_record(position))
    }

    /// Drop the local record and return the removal to broadcast.
    pub fn clear_local(&mut self) -> AwarenessUpdate {
        self.local_cursor = None;
        AwarenessUpdate::Clear { peer_id: self.local_peer_id }
    }

    fn next_local_record(&mut self, position: Vec2) -> AwarenessUpdate {
        self.seq_counter += 1;
        self.last_broadcast = Instant::now();
        AwarenessUpdate::Cursor {
            peer_id: self.local_peer_id,
            position,
            color: self.local_color,
            seq: self.seq_counter,
        }
    }

    /// Ingest a remote awareness update.
    ///
    /// Returns `true` if the remote set changed. Own-id records,
    /// non-finite positions, and stale sequence numbers are dropped
    /// silently.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> bool {
        if update.peer_id() == self.local_peer_id {
            return false;
        }

        match update {
            AwarenessUpdate::Cursor { peer_id, position, color, seq } => {
                if !position.is_finite() {
                    return false;
                }
                match self.peers.get_mut(peer_id) {
                    Some(entry) => {
                        // Last write wins; reject regressions.
                        if *seq < entry.last_seq {
                            return false;
                        }
                        entry.position = *position;
                        entry.color = *color;
                        entry.last_seq = *seq;
                        entry.last_update = Instant::now();
                    }
                    None => {
                        // Record created on the peer's first move.
                        self.peers.insert(*peer_id, RemoteEntry {
                            position: *position,
                            color: *color,
                            last_seq: *seq,
                            last_update: Instant::now(),
                        });
                    }
                }
                true
            }

            AwarenessUpdate::Clear { peer_id } => self.peers.remove(peer_id).is_some(),
        }
    }

    /// Remove a peer's record (peer disconnected).
    ///
    /// Returns `true` if a record existed.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Project the remote record set into renderable cursors.
    ///
    /// The local peer never appears in the result, and records that
    /// stopped updating for longer than the idle window are skipped.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.peers
            .iter()
            .filter(|(id, _)| **id != self.local_peer_id)
            .filter(|(_, entry)| entry.last_update.elapsed() <= self.idle_timeout)
            .map(|(id, entry)| RemoteCursor {
                peer_id: *id,
                position: entry.position,
                color: entry.color,
            })
            .collect()
    }

    /// Drop records that have been idle longer than the staleness window.
    ///
    /// Returns the removed peer ids.
    pub fn sweep_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self.peers
            .iter()
            .filter(|(_, entry)| entry.last_update.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }

        stale
    }

    /// Number of tracked remote records.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The local peer id.
    pub fn local_peer_id(&self) -> Uuid {
        self.local_peer_id
    }

    /// The local cursor color.
    pub fn local_color(&self) -> CursorColor {
        self.local_color
    }

    /// Last published local position.
    pub fn local_cursor(&self) -> Option<Vec2> {
        self.local_cursor
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_vec2_distance() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_vec2_finite() {
        assert!(Vec2::new(1.0, 2.0).is_finite());
        assert!(!Vec2::new(f32::NAN, 2.0).is_finite());
        assert!(!Vec2::new(1.0, f32::INFINITY).is_finite());
    }

    // ── CursorColor tests ────────────────────────────────────────

    #[test]
    fn test_color_stable_per_peer() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_peer(id), CursorColor::from_peer(id));
    }

    #[test]
    fn test_color_in_range() {
        for _ in 0..32 {
            let c = CursorColor::from_peer(Uuid::new_v4());
            assert!(c.r >= 0.0 && c.r <= 1.0);
            assert!(c.g >= 0.0 && c.g <= 1.0);
            assert!(c.b >= 0.0 && c.b <= 1.0);
            assert_eq!(c.a, 1.0);
        }
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.5);
        assert!((r - 0.5).abs() < 0.01);
        assert!((g - 0.5).abs() < 0.01);
        assert!((b - 0.5).abs() < 0.01);
    }

    // ── AwarenessUpdate tests ────────────────────────────────────

    #[test]
    fn test_cursor_record_roundtrip() {
        let id = Uuid::new_v4();
        let update = AwarenessUpdate::Cursor {
            peer_id: id,
            position: Vec2::new(150.5, 200.3),
            color: CursorColor::from_peer(id),
            seq: 42,
        };

        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(update, decoded);
        assert_eq!(decoded.peer_id(), id);
        assert_eq!(decoded.seq(), 42);
    }

    #[test]
    fn test_clear_record_roundtrip() {
        let id = Uuid::new_v4();
        let update = AwarenessUpdate::Clear { peer_id: id };
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(update, decoded);
        assert_eq!(decoded.seq(), 0);
    }

    #[test]
    fn test_cursor_record_size_efficient() {
        let update = AwarenessUpdate::Cursor {
            peer_id: Uuid::new_v4(),
            position: Vec2::new(100.0, 200.0),
            color: CursorColor::default(),
            seq: 1,
        };
        let encoded = update.encode().unwrap();
        // 1 tag + 16 uuid + 8 position + 16 color + seq varint
        assert!(encoded.len() < 60, "Cursor record too large: {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(AwarenessUpdate::decode(&[0xFF, 0xFE]).is_err());
    }

    // ── CursorTable: local side ──────────────────────────────────

    #[test]
    fn test_first_local_update_broadcasts() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let update = table.update_local_cursor(Vec2::new(10.0, 20.0));
        assert!(update.is_some());
        assert_eq!(table.local_cursor(), Some(Vec2::new(10.0, 20.0)));
    }

    #[test]
    fn test_local_update_throttled() {
        let mut table = CursorTable::new(Uuid::new_v4());

        let first = table.update_local_cursor(Vec2::new(10.0, 20.0));
        assert!(first.is_some());

        // Immediate second update is throttled, but the position sticks.
        let second = table.update_local_cursor(Vec2::new(30.0, 40.0));
        assert!(second.is_none());
        assert_eq!(table.local_cursor(), Some(Vec2::new(30.0, 40.0)));
    }

    #[test]
    fn test_local_update_after_interval() {
        let mut table = CursorTable::with_interval(Uuid::new_v4(), Duration::from_millis(5));

        let _ = table.update_local_cursor(Vec2::new(10.0, 20.0));
        thread::sleep(Duration::from_millis(10));
        assert!(table.update_local_cursor(Vec2::new(30.0, 40.0)).is_some());
    }

    #[test]
    fn test_seq_monotonic() {
        let mut table = CursorTable::with_interval(Uuid::new_v4(), Duration::from_millis(0));

        let a = table.update_local_cursor(Vec2::new(1.0, 1.0)).unwrap();
        let b = table.update_local_cursor(Vec2::new(2.0, 2.0)).unwrap();
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn test_force_broadcast_bypasses_throttle() {
        let mut table = CursorTable::new(Uuid::new_v4());

        let _ = table.update_local_cursor(Vec2::new(10.0, 20.0));
        // Throttled right now, but force still produces a record.
        let forced = table.force_local_broadcast();
        assert!(forced.is_some());
        match forced.unwrap() {
            AwarenessUpdate::Cursor { position, .. } => {
                assert_eq!(position, Vec2::new(10.0, 20.0));
            }
            _ => panic!("Expected Cursor record"),
        }
    }

    #[test]
    fn test_force_broadcast_without_move() {
        let mut table = CursorTable::new(Uuid::new_v4());
        // No pointer move yet, nothing to announce.
        assert!(table.force_local_broadcast().is_none());
    }

    #[test]
    fn test_clear_local() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let _ = table.update_local_cursor(Vec2::new(10.0, 20.0));

        let clear = table.clear_local();
        assert!(matches!(clear, AwarenessUpdate::Clear { .. }));
        assert!(table.local_cursor().is_none());
    }

    // ── CursorTable: remote side ─────────────────────────────────

    fn cursor(peer: Uuid, x: f32, y: f32, seq: u64) -> AwarenessUpdate {
        AwarenessUpdate::Cursor {
            peer_id: peer,
            position: Vec2::new(x, y),
            color: CursorColor::from_peer(peer),
            seq,
        }
    }

    #[test]
    fn test_record_created_on_first_move() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        assert!(table.apply(&cursor(remote, 100.0, 200.0, 1)));
        assert_eq!(table.peer_count(), 1);

        let cursors = table.remote_cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].position, Vec2::new(100.0, 200.0));
    }

    #[test]
    fn test_own_record_ignored() {
        let local = Uuid::new_v4();
        let mut table = CursorTable::new(local);

        assert!(!table.apply(&cursor(local, 50.0, 50.0, 1)));
        assert_eq!(table.peer_count(), 0);
        assert!(table.remote_cursors().is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        table.apply(&cursor(remote, 10.0, 10.0, 1));
        table.apply(&cursor(remote, 20.0, 20.0, 2));

        let cursors = table.remote_cursors();
        assert_eq!(cursors[0].position, Vec2::new(20.0, 20.0));
    }

    #[test]
    fn test_stale_seq_rejected() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        table.apply(&cursor(remote, 100.0, 200.0, 5));
        assert!(!table.apply(&cursor(remote, 0.0, 0.0, 3)));

        let cursors = table.remote_cursors();
        assert_eq!(cursors[0].position, Vec2::new(100.0, 200.0));
    }

    #[test]
    fn test_malformed_position_dropped() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        assert!(!table.apply(&cursor(remote, f32::NAN, 10.0, 1)));
        assert!(!table.apply(&cursor(remote, 10.0, f32::INFINITY, 1)));
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn test_clear_removes_record() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        table.apply(&cursor(remote, 10.0, 10.0, 1));
        assert!(table.apply(&AwarenessUpdate::Clear { peer_id: remote }));
        assert_eq!(table.peer_count(), 0);

        // Clearing an absent record is not a change.
        assert!(!table.apply(&AwarenessUpdate::Clear { peer_id: remote }));
    }

    #[test]
    fn test_remove_peer() {
        let mut table = CursorTable::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        table.apply(&cursor(remote, 10.0, 10.0, 1));
        assert!(table.remove_peer(&remote));
        assert!(!table.remove_peer(&remote));
        assert!(table.remote_cursors().is_empty());
    }

    #[test]
    fn test_projection_multiple_peers() {
        let mut table = CursorTable::new(Uuid::new_v4());

        for i in 0..5 {
            let remote = Uuid::new_v4();
            table.apply(&cursor(remote, i as f32 * 10.0, i as f32 * 5.0, 1));
        }

        assert_eq!(table.remote_cursors().len(), 5);
    }

    #[test]
    fn test_sweep_idle_empty() {
        let mut table = CursorTable::new(Uuid::new_v4());
        table.apply(&cursor(Uuid::new_v4(), 1.0, 1.0, 1));
        // Fresh records survive the sweep.
        assert!(table.sweep_idle().is_empty());
        assert_eq!(table.peer_count(), 1);
    }
}
