//! Presence channel: one WebSocket to one relay, wrapping the shared doc.
//!
//! A channel is the transport-level session with a single relay server.
//! Opening it dials the relay, announces the peer, and spawns the
//! reader/writer tasks; closing it tears both tasks down. The channel
//! never retries — failover across relay candidates belongs to
//! [`crate::reconnect::PresenceSession`].
//!
//! Incoming awareness frames feed the channel's [`CursorTable`]; every
//! change re-emits the full remote-cursor projection as a
//! [`ChannelEvent::RemoteCursors`], so subscribers always hold the
//! complete current set.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

use crate::presence::{AwarenessUpdate, CursorColor, CursorTable, RemoteCursor, Vec2};
use crate::protocol::{MessageType, PresenceError, RelayMessage};

/// Transport connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by a presence channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Transport established and the peer announced
    Connected,
    /// Transport lost
    Disconnected,
    /// The full current remote-cursor set, after any record changed
    RemoteCursors(Vec<RemoteCursor>),
    /// A peer disconnected and its record was dropped
    PeerLeft(Uuid),
    /// Initial document state applied
    DocSynced,
    /// A remote CRDT delta was applied to the shared doc
    RemoteDelta { peer_id: Uuid },
}

/// A live presence channel to one relay server.
///
/// Exists only while the underlying transport is (or was) established;
/// construction performs the dial and join handshake.
pub struct PresenceChannel {
    peer_id: Uuid,
    room: String,
    server_url: String,

    /// Shared CRDT document this channel synchronizes
    doc: Arc<yrs::Doc>,

    /// Awareness map for this room
    table: Arc<Mutex<CursorTable>>,

    status: Arc<RwLock<ConnectionStatus>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Vec<u8>>,

    event_rx: Option<mpsc::Receiver<ChannelEvent>>,

    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceChannel {
    /// Dial a relay and join a room.
    ///
    /// Side effects: opens the WebSocket, sends the join announcement,
    /// and spawns the reader/writer tasks. No retry happens here; a
    /// failed dial is returned as an error for the caller to handle.
    pub async fn open(
        server_url: impl Into<String>,
        room: impl Into<String>,
        peer_id: Uuid,
    ) -> Result<Self, PresenceError> {
        let server_url = server_url.into();
        let room = room.into();

        let (mut ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str())
            .await
            .map_err(|e| {
                log::debug!("dial {server_url} failed: {e}");
                PresenceError::ConnectionClosed
            })?;

        // Announce ourselves before handing the socket to the tasks.
        let join = RelayMessage::peer_joined(peer_id, room.clone()).encode()?;
        ws_stream
            .send(tokio_tungstenite::tungstenite::Message::Binary(join.into()))
            .await
            .map_err(|_| PresenceError::ConnectionClosed)?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connected));
        let table = Arc::new(Mutex::new(CursorTable::new(peer_id)));
        let doc = Arc::new(yrs::Doc::new());

        // Writer task: forward the outgoing queue to the socket.
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                let frame = tokio_tungstenite::tungstenite::Message::Binary(data.into());
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode frames into table updates and events.
        let reader = {
            let event_tx = event_tx.clone();
            let status = status.clone();
            let table = table.clone();
            let doc = doc.clone();
            let out_tx = out_tx.clone();
            let room = room.clone();

            tokio::spawn(async move {
                let _ = event_tx.send(ChannelEvent::Connected).await;

                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            let relay_msg = match RelayMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("dropping undecodable frame: {e}");
                                    continue;
                                }
                            };

                            // Skip echoes of our own messages
                            if relay_msg.peer_id == peer_id {
                                continue;
                            }

                            Self::handle_frame(
                                relay_msg, peer_id, &room, &doc, &table, &out_tx, &event_tx,
                            )
                            .await;
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                            break;
                        }
                        _ => {}
                    }
                }

                // Transport gone
                *status.write().await = ConnectionStatus::Disconnected;
                let _ = event_tx.send(ChannelEvent::Disconnected).await;
            })
        };

        Ok(Self {
            peer_id,
            room,
            server_url,
            doc,
            table,
            status,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Process one decoded frame from the relay.
    async fn handle_frame(
        relay_msg: RelayMessage,
        peer_id: Uuid,
        room: &str,
        doc: &Arc<yrs::Doc>,
        table: &Arc<Mutex<CursorTable>>,
        out_tx: &mpsc::Sender<Vec<u8>>,
        event_tx: &mpsc::Sender<ChannelEvent>,
    ) {
        match relay_msg.msg_type {
            MessageType::SyncStep2 => {
                if let Ok(update) = yrs::Update::decode_v1(&relay_msg.payload) {
                    let mut txn = doc.transact_mut();
                    let _ = txn.apply_update(update);
                }

                // Answer with our state vector so the relay can fill
                // anything that landed between snapshot and now.
                let sv = {
                    let txn = doc.transact();
                    txn.state_vector().encode_v1()
                };
                if let Ok(encoded) = RelayMessage::sync_step1(peer_id, room, sv).encode() {
                    let _ = out_tx.send(encoded).await;
                }

                let _ = event_tx.send(ChannelEvent::DocSynced).await;
            }

            MessageType::Delta => {
                if let Ok(update) = yrs::Update::decode_v1(&relay_msg.payload) {
                    let mut txn = doc.transact_mut();
                    let _ = txn.apply_update(update);
                    let _ = event_tx
                        .send(ChannelEvent::RemoteDelta { peer_id: relay_msg.peer_id })
                        .await;
                }
            }

            MessageType::Awareness => {
                // Malformed records are dropped without surfacing errors.
                let update = match AwarenessUpdate::decode(&relay_msg.payload) {
                    Ok(u) => u,
                    Err(_) => return,
                };

                let snapshot = {
                    let mut t = table.lock().await;
                    if t.apply(&update) {
                        Some(t.remote_cursors())
                    } else {
                        None
                    }
                };
                if let Some(cursors) = snapshot {
                    let _ = event_tx.send(ChannelEvent::RemoteCursors(cursors)).await;
                }
            }

            MessageType::PeerLeft => {
                let (removed, snapshot) = {
                    let mut t = table.lock().await;
                    let removed = t.remove_peer(&relay_msg.peer_id);
                    (removed, t.remote_cursors())
                };
                let _ = event_tx.send(ChannelEvent::PeerLeft(relay_msg.peer_id)).await;
                if removed {
                    let _ = event_tx.send(ChannelEvent::RemoteCursors(snapshot)).await;
                }
            }

            MessageType::PeerJoined => {
                // Their record appears once they move the pointer.
                log::debug!("peer {} joined room {}", relay_msg.peer_id, relay_msg.room);
            }

            MessageType::Pong => {
                log::trace!("pong from relay");
            }

            _ => {
                log::debug!("unhandled message type: {:?}", relay_msg.msg_type);
            }
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Publish the local cursor position.
    ///
    /// Rate-limited to 30fps; throttled moves still update the local
    /// record. While the channel is not connected the update is
    /// silently dropped — reconnection re-announces the cursor.
    pub async fn publish_cursor(&self, x: f32, y: f32) -> Result<(), PresenceError> {
        if *self.status.read().await != ConnectionStatus::Connected {
            return Ok(());
        }

        let update = {
            let mut table = self.table.lock().await;
            table.update_local_cursor(Vec2::new(x, y))
        };
        match update {
            Some(u) => self.send_awareness(&u).await,
            None => Ok(()), // Throttled
        }
    }

    /// Publish the cursor immediately, bypassing the rate limiter.
    ///
    /// Used to re-announce presence right after a reconnect.
    pub async fn republish_cursor(&self, x: f32, y: f32) -> Result<(), PresenceError> {
        if *self.status.read().await != ConnectionStatus::Connected {
            return Ok(());
        }

        let update = {
            let mut table = self.table.lock().await;
            table.set_local_cursor(Vec2::new(x, y));
            table.force_local_broadcast()
        };
        match update {
            Some(u) => self.send_awareness(&u).await,
            None => Ok(()),
        }
    }

    /// Drop the local record and tell the room.
    pub async fn clear_cursor(&self) -> Result<(), PresenceError> {
        if *self.status.read().await != ConnectionStatus::Connected {
            return Ok(());
        }

        let update = {
            let mut table = self.table.lock().await;
            table.clear_local()
        };
        self.send_awareness(&update).await
    }

    async fn send_awareness(&self, update: &AwarenessUpdate) -> Result<(), PresenceError> {
        let payload = update
            .encode()
            .map_err(PresenceError::SerializationError)?;
        let msg = RelayMessage::awareness(self.peer_id, self.room.clone(), update.seq(), payload);
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| PresenceError::ConnectionClosed)
    }

    /// Relay a local CRDT update to the room.
    ///
    /// Silently dropped while disconnected.
    pub async fn send_update(&self, yrs_update: Vec<u8>) -> Result<(), PresenceError> {
        if *self.status.read().await != ConnectionStatus::Connected {
            return Ok(());
        }

        let msg = RelayMessage::delta(self.peer_id, self.room.clone(), yrs_update);
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| PresenceError::ConnectionClosed)
    }

    /// Send a heartbeat ping to the relay.
    pub async fn send_ping(&self) -> Result<(), PresenceError> {
        let msg = RelayMessage::ping(self.peer_id);
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| PresenceError::ConnectionClosed)
    }

    /// Current transport status.
    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Snapshot of the current remote-cursor projection.
    pub async fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.table.lock().await.remote_cursors()
    }

    /// Tear the channel down: stop both tasks and mark disconnected.
    ///
    /// A best-effort record clear is queued first so the room drops our
    /// cursor even before the relay notices the socket closing.
    pub async fn close(&self) {
        let clear = {
            let mut table = self.table.lock().await;
            table.clear_local()
        };
        if let Ok(payload) = clear.encode() {
            let msg = RelayMessage::awareness(self.peer_id, self.room.clone(), 0, payload);
            if let Ok(encoded) = msg.encode() {
                let _ = self.outgoing_tx.try_send(encoded);
            }
        }
        // Give the writer one chance to flush the clear.
        tokio::task::yield_now().await;

        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.lock().await.take() {
            handle.abort();
        }
        *self.status.write().await = ConnectionStatus::Disconnected;
    }

    /// The shared document this channel synchronizes.
    pub fn doc(&self) -> Arc<yrs::Doc> {
        self.doc.clone()
    }

    /// Our peer id.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Our stable cursor color.
    pub fn color(&self) -> CursorColor {
        CursorColor::from_peer(self.peer_id)
    }

    /// The room this channel joined.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// The relay URL this channel dialed.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A port nothing is listening on.
    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_open_refused() {
        let port = dead_port().await;
        let url = format!("ws://127.0.0.1:{port}");

        let result = PresenceChannel::open(&url, "lobby", Uuid::new_v4()).await;
        assert!(matches!(result, Err(PresenceError::ConnectionClosed)));
    }

    #[test]
    fn test_status_values() {
        assert_ne!(ConnectionStatus::Connecting, ConnectionStatus::Connected);
        assert_ne!(ConnectionStatus::Connected, ConnectionStatus::Disconnected);
    }
}
