//! WebSocket relay with name-based room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("zastrow-homepage-cursors")
//! Client B ──┘        │
//!                     ├── Yrs Doc (authority)
//!                     ├── BroadcastGroup (fan-out)
//!                     └── Awareness cache (latest record per peer)
//! ```
//!
//! Each room maintains an authoritative Yrs document, a broadcast group
//! for fan-out, and the latest awareness record per peer. Cached
//! records are replayed to late joiners so a new peer immediately sees
//! every cursor that is already in the room.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, Transact};

use crate::broadcast::BroadcastGroup;
use crate::presence::AwarenessUpdate;
use crate::protocol::{MessageType, RelayMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 32,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One room: authoritative doc + fan-out + awareness cache.
struct RelayRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    /// Latest encoded awareness frame per peer, replayed to joiners.
    awareness: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl RelayRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            awareness: HashMap::new(),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    /// Rooms, keyed by room name
    rooms: Arc<RwLock<HashMap<String, RelayRoom>>>,
    stats: Arc<RwLock<RelayStats>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a new relay with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            shutdown_tx,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start accepting WebSocket connections.
    ///
    /// Runs until [`RelayServer::shutdown`] is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("relay shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("tcp connection from {addr}");

                    let rooms = self.rooms.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    let conn_shutdown = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(
                            stream, addr, rooms, stats, config, conn_shutdown,
                        ).await {
                            log::error!("connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Stop the accept loop and every connection task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<String, RelayRoom>>>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Connection state: set once the first PeerJoined arrives.
        let mut peer_id: Option<Uuid> = None;
        let mut room_name: Option<String> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::debug!("closing connection from {addr} on shutdown");
                    break;
                }

                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let relay_msg = match RelayMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match relay_msg.msg_type {
                                MessageType::PeerJoined => {
                                    if broadcast_rx.is_some() {
                                        log::debug!("duplicate join from {addr}");
                                        continue;
                                    }

                                    let mut rooms_w = rooms.write().await;
                                    let room = rooms_w
                                        .entry(relay_msg.room.clone())
                                        .or_insert_with(|| RelayRoom::new(config.broadcast_capacity));

                                    if room.broadcast.peer_count().await >= config.max_peers_per_room {
                                        log::warn!(
                                            "room {} full, refusing peer {}",
                                            relay_msg.room,
                                            relay_msg.peer_id
                                        );
                                        break;
                                    }

                                    peer_id = Some(relay_msg.peer_id);
                                    room_name = Some(relay_msg.room.clone());

                                    let rx = room.broadcast.add_peer(relay_msg.peer_id).await;
                                    broadcast_rx = Some(rx);

                                    // Current doc state for the newcomer.
                                    // Scope the transaction so it drops before await.
                                    let state = {
                                        let txn = room.doc.transact();
                                        txn.encode_state_as_update_v1(&yrs::StateVector::default())
                                    };
                                    let cached: Vec<Arc<Vec<u8>>> =
                                        room.awareness.values().cloned().collect();
                                    let broadcast = room.broadcast.clone();
                                    let room_count = rooms_w.len();
                                    drop(rooms_w); // Release lock before await

                                    let state_msg = RelayMessage::sync_step2(
                                        Uuid::nil(),
                                        relay_msg.room.clone(),
                                        state,
                                    );
                                    let encoded = state_msg.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;

                                    // Replay the room's cursors so the newcomer
                                    // sees everyone without waiting for a move.
                                    for frame in cached {
                                        ws_sender
                                            .send(Message::Binary(frame.to_vec().into()))
                                            .await?;
                                    }

                                    let join_msg = RelayMessage::peer_joined(
                                        relay_msg.peer_id,
                                        relay_msg.room.clone(),
                                    );
                                    let _ = broadcast.send_message(&join_msg);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!(
                                        "peer {} joined room {}",
                                        relay_msg.peer_id,
                                        relay_msg.room
                                    );
                                }

                                MessageType::Awareness => {
                                    let Some(bound_room) = room_name.as_ref() else {
                                        log::warn!("awareness from {addr} before join");
                                        continue;
                                    };

                                    let update = match AwarenessUpdate::decode(&relay_msg.payload) {
                                        Ok(u) => u,
                                        Err(e) => {
                                            log::warn!("undecodable awareness from {addr}: {e}");
                                            continue;
                                        }
                                    };

                                    let frame = Arc::new(bytes);
                                    let broadcast = {
                                        let mut rooms_w = rooms.write().await;
                                        let Some(room) = rooms_w.get_mut(bound_room) else {
                                            continue;
                                        };
                                        match update {
                                            AwarenessUpdate::Cursor { .. } => {
                                                log::trace!("cursor update in room {bound_room}");
                                                room.awareness
                                                    .insert(relay_msg.peer_id, frame.clone());
                                            }
                                            AwarenessUpdate::Clear { .. } => {
                                                log::debug!(
                                                    "peer {} cleared its record in room {bound_room}",
                                                    relay_msg.peer_id
                                                );
                                                room.awareness.remove(&relay_msg.peer_id);
                                            }
                                        }
                                        room.broadcast.clone()
                                    };
                                    broadcast.send_frame(frame);
                                }

                                MessageType::Delta => {
                                    let Some(bound_room) = room_name.as_ref() else {
                                        continue;
                                    };

                                    let broadcast = {
                                        let mut rooms_w = rooms.write().await;
                                        let Some(room) = rooms_w.get_mut(bound_room) else {
                                            continue;
                                        };
                                        // Apply to the authoritative doc (sync, no await)
                                        if let Ok(update) =
                                            yrs::Update::decode_v1(&relay_msg.payload)
                                        {
                                            let mut txn = room.doc.transact_mut();
                                            let _ = txn.apply_update(update);
                                        }
                                        room.broadcast.clone()
                                    };
                                    broadcast.send_frame(Arc::new(bytes));
                                }

                                MessageType::SyncStep1 => {
                                    let Some(bound_room) = room_name.as_ref() else {
                                        continue;
                                    };

                                    let diff = {
                                        let rooms_r = rooms.read().await;
                                        rooms_r.get(bound_room).and_then(|room| {
                                            let txn = room.doc.transact();
                                            yrs::StateVector::decode_v1(&relay_msg.payload)
                                                .ok()
                                                .map(|sv| txn.encode_diff_v1(&sv))
                                        })
                                    };
                                    if let Some(diff) = diff {
                                        let response = RelayMessage::sync_step2(
                                            Uuid::nil(),
                                            bound_room.clone(),
                                            diff,
                                        );
                                        let encoded = response.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = RelayMessage::pong(relay_msg.peer_id);
                                    let encoded = pong.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                _ => {
                                    log::debug!("unhandled message type: {:?}", relay_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not in a room yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(data) => {
                            // Don't echo back to the sender
                            if let Ok(msg) = RelayMessage::decode(&data) {
                                if Some(msg.peer_id) == peer_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer {peer_id:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: detach the peer from its room.
        if let (Some(pid), Some(name), true) = (peer_id, room_name, broadcast_rx.is_some()) {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&name) {
                room.broadcast.remove_peer(&pid).await;
                room.awareness.remove(&pid);

                let leave = RelayMessage::peer_left(pid, name.clone());
                let _ = room.broadcast.send_message(&leave);

                if room.broadcast.peer_count().await == 0 {
                    rooms_w.remove(&name);
                    log::info!("room {name} removed (empty)");
                }
            }

            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms_w.len();
        } else {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        Ok(())
    }

    /// Relay statistics snapshot.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
