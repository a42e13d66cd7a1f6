//! Session supervisor: relay failover and reconnection.
//!
//! A [`PresenceSession`] owns the connection lifecycle for the whole
//! page session. It cycles round-robin through a candidate relay list:
//!
//! ```text
//! Connecting ──connected──► Connected
//!     │                         │
//!     │ 5s timeout              │ disconnect / failed poll
//!     ▼                         ▼
//! Disconnected ◄────────────────┘
//!     │ 500ms backoff, next server
//!     └──────────► Connecting (index + 1 mod N)
//! ```
//!
//! There is no terminal state: the supervisor loops until
//! [`PresenceSession::shutdown`]. Status is additionally polled every
//! second as a fallback in case a disconnect event is missed; the poll
//! tick doubles as the heartbeat ping.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::channel::{ChannelEvent, ConnectionStatus, PresenceChannel};
use crate::presence::{RemoteCursor, Vec2};
use crate::protocol::PresenceError;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Candidate relay servers, tried round-robin
    pub servers: Vec<String>,
    /// Room name scoping which peers share cursors
    pub room: String,
    /// How long a dial may take before failing over
    pub connect_timeout: Duration,
    /// Pause between failover attempts
    pub retry_backoff: Duration,
    /// Status poll / heartbeat interval while connected
    pub status_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "wss://cursors.zastrow.dev".to_string(),
                "wss://cursors-fallback.zastrow.dev".to_string(),
            ],
            room: "zastrow-homepage-cursors".to_string(),
            connect_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
            status_poll_interval: Duration::from_secs(1),
        }
    }
}

/// The single active connection, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub server_url: String,
    pub status: ConnectionStatus,
}

/// Events emitted over the session's lifetime.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state changed (also fired on every failover)
    Status(ConnectionDescriptor),
    /// The full current remote-cursor set changed
    RemoteCursors(Vec<RemoteCursor>),
    /// A peer disconnected
    PeerLeft(Uuid),
    /// The shared doc finished its initial sync
    Synced,
}

/// Shared state between the session handle and its supervisor task.
#[derive(Clone)]
struct SessionShared {
    descriptor: Arc<RwLock<ConnectionDescriptor>>,
    current: Arc<RwLock<Option<Arc<PresenceChannel>>>>,
    last_cursor: Arc<RwLock<Option<Vec2>>>,
    failovers: Arc<AtomicU64>,
    server_cursor: Arc<AtomicUsize>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionShared {
    async fn set_status(&self, url: &str, status: ConnectionStatus) {
        let descriptor = ConnectionDescriptor {
            server_url: url.to_string(),
            status,
        };
        *self.descriptor.write().await = descriptor.clone();
        let _ = self.event_tx.send(SessionEvent::Status(descriptor)).await;
    }
}

/// Owner of the multiplayer-cursor session.
///
/// Created at session start, destroyed at session end; everything it
/// spawns (supervisor, channel tasks, timers) dies with it.
pub struct PresenceSession {
    peer_id: Uuid,
    shared: SessionShared,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceSession {
    /// Start a session: spawn the supervisor and begin dialing.
    pub fn start(config: SessionConfig) -> Result<Self, PresenceError> {
        if config.servers.is_empty() {
            return Err(PresenceError::EmptyServerList);
        }

        let peer_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = SessionShared {
            descriptor: Arc::new(RwLock::new(ConnectionDescriptor {
                server_url: config.servers[0].clone(),
                status: ConnectionStatus::Connecting,
            })),
            current: Arc::new(RwLock::new(None)),
            last_cursor: Arc::new(RwLock::new(None)),
            failovers: Arc::new(AtomicU64::new(0)),
            server_cursor: Arc::new(AtomicUsize::new(0)),
            event_tx,
        };

        let supervisor = tokio::spawn(run_supervisor(
            config,
            peer_id,
            shared.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            peer_id,
            shared,
            event_rx: Some(event_rx),
            shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Start with default configuration (the homepage relay list).
    pub fn start_default() -> Result<Self, PresenceError> {
        Self::start(SessionConfig::default())
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Publish the local cursor position.
    ///
    /// The position is remembered across failovers and re-announced on
    /// reconnect. While no relay is reachable the update is silently
    /// dropped.
    pub async fn publish_cursor(&self, x: f32, y: f32) {
        *self.shared.last_cursor.write().await = Some(Vec2::new(x, y));

        let channel = self.shared.current.read().await.clone();
        if let Some(channel) = channel {
            let _ = channel.publish_cursor(x, y).await;
        }
    }

    /// Drop the local record: remote peers stop rendering our cursor.
    pub async fn clear_cursor(&self) {
        *self.shared.last_cursor.write().await = None;

        let channel = self.shared.current.read().await.clone();
        if let Some(channel) = channel {
            let _ = channel.clear_cursor().await;
        }
    }

    /// The current connection descriptor.
    pub async fn descriptor(&self) -> ConnectionDescriptor {
        self.shared.descriptor.read().await.clone()
    }

    /// The current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.shared.descriptor.read().await.status
    }

    /// Number of failovers since session start.
    pub fn failovers(&self) -> u64 {
        self.shared.failovers.load(Ordering::Relaxed)
    }

    /// Index of the relay currently being tried or used.
    pub fn server_cursor(&self) -> usize {
        self.shared.server_cursor.load(Ordering::Relaxed)
    }

    /// Our peer id.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Snapshot of the current remote cursors, if a channel is live.
    pub async fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let channel = self.shared.current.read().await.clone();
        match channel {
            Some(channel) => channel.remote_cursors().await,
            None => Vec::new(),
        }
    }

    /// End the session: stop the supervisor and close any live channel.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// The failover loop. Runs until the shutdown flag flips (or the
/// session handle is dropped, which closes the watch channel).
async fn run_supervisor(
    config: SessionConfig,
    peer_id: Uuid,
    shared: SessionShared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let server_count = config.servers.len();
    let mut index: usize = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let url = config.servers[index % server_count].clone();
        shared.server_cursor.store(index % server_count, Ordering::Relaxed);
        shared.set_status(&url, ConnectionStatus::Connecting).await;
        log::info!("connecting to relay {url}");

        let dial = tokio::select! {
            _ = shutdown_rx.changed() => break,
            dial = timeout(
                config.connect_timeout,
                PresenceChannel::open(&url, &config.room, peer_id),
            ) => dial,
        };

        match dial {
            Ok(Ok(mut channel)) => {
                let Some(mut channel_events) = channel.take_event_rx() else {
                    continue;
                };
                let channel = Arc::new(channel);
                *shared.current.write().await = Some(channel.clone());
                shared.set_status(&url, ConnectionStatus::Connected).await;
                log::info!("connected to relay {url}");

                // Re-announce our cursor so the room sees us again.
                if let Some(pos) = *shared.last_cursor.read().await {
                    let _ = channel.republish_cursor(pos.x, pos.y).await;
                }

                let mut poll = tokio::time::interval(config.status_poll_interval);
                let mut alive = true;

                while alive {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            channel.close().await;
                            *shared.current.write().await = None;
                            shared.set_status(&url, ConnectionStatus::Disconnected).await;
                            return;
                        }

                        event = channel_events.recv() => match event {
                            Some(ChannelEvent::Disconnected) | None => alive = false,
                            Some(ChannelEvent::RemoteCursors(cursors)) => {
                                let _ = shared.event_tx
                                    .send(SessionEvent::RemoteCursors(cursors)).await;
                            }
                            Some(ChannelEvent::PeerLeft(id)) => {
                                let _ = shared.event_tx.send(SessionEvent::PeerLeft(id)).await;
                            }
                            Some(ChannelEvent::DocSynced) => {
                                let _ = shared.event_tx.send(SessionEvent::Synced).await;
                            }
                            Some(_) => {}
                        },

                        // Fallback for missed events; also the heartbeat.
                        _ = poll.tick() => {
                            if channel.status().await != ConnectionStatus::Connected {
                                alive = false;
                            } else {
                                let _ = channel.send_ping().await;
                            }
                        }
                    }
                }

                log::warn!("lost connection to relay {url}");
                channel.close().await;
                *shared.current.write().await = None;
            }

            Ok(Err(e)) => {
                log::warn!("relay {url} rejected connection: {e}");
            }

            Err(_) => {
                log::warn!(
                    "relay {url} did not connect within {:?}",
                    config.connect_timeout
                );
            }
        }

        shared.set_status(&url, ConnectionStatus::Disconnected).await;
        shared.failovers.fetch_add(1, Ordering::Relaxed);
        index = (index + 1) % server_count;

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(config.retry_backoff) => {}
        }
    }

    // Shutdown during dial or backoff: nothing live to close, but be
    // thorough in case a channel was left behind.
    if let Some(channel) = shared.current.write().await.take() {
        channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.room, "zastrow-homepage-cursors");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.status_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let config = SessionConfig {
            servers: Vec::new(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            PresenceSession::start(config),
            Err(PresenceError::EmptyServerList)
        ));
    }

    #[tokio::test]
    async fn test_session_initial_descriptor() {
        let config = SessionConfig {
            servers: vec!["ws://127.0.0.1:1".to_string()],
            connect_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let session = PresenceSession::start(config).unwrap();

        let descriptor = session.descriptor().await;
        assert_eq!(descriptor.server_url, "ws://127.0.0.1:1");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let config = SessionConfig {
            servers: vec!["ws://127.0.0.1:1".to_string()],
            connect_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = PresenceSession::start(config).unwrap();

        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_without_connection_is_silent() {
        let config = SessionConfig {
            servers: vec!["ws://127.0.0.1:1".to_string()],
            connect_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = PresenceSession::start(config).unwrap();
        let _events = session.take_event_rx().unwrap();

        // No relay is reachable; publishing must not panic or error.
        session.publish_cursor(10.0, 20.0).await;
        session.clear_cursor().await;
        assert!(session.remote_cursors().await.is_empty());

        session.shutdown().await;
    }
}
