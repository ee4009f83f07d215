//! Wire messages and the WebSocket client for peer sessions.
//!
//! Peers exchange revision-tagged [`Mutation`]s and NML [`Snapshot`]s through
//! the relay server as JSON text frames.

use crate::mutation::Mutation;
use crate::protocol::{RevisionedMutation, Snapshot};
use serde::{Deserialize, Serialize};

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join an annotation session
    Join { session: String },
    /// Leave the current session
    Leave,
    /// A local mutation for the other peers
    Mutation {
        target_revision: u64,
        mutation: Mutation,
    },
    /// Full state, kept by the relay for peers that join later
    Snapshot { revision: u64, nml: String },
}

impl ClientMessage {
    pub fn from_change(change: RevisionedMutation) -> Self {
        ClientMessage::Mutation {
            target_revision: change.target_revision,
            mutation: change.mutation,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        ClientMessage::Snapshot {
            revision: snapshot.revision,
            nml: snapshot.nml,
        }
    }
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm the join with whatever state the session already has
    Joined {
        session: String,
        peer_count: usize,
        /// Latest published snapshot, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Snapshot>,
        /// Mutations relayed since that snapshot, oldest first
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        backlog: Vec<RevisionedMutation>,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    Mutation {
        from: String,
        target_revision: u64,
        mutation: Mutation,
    },
    Error { message: String },
}

impl ServerMessage {
    /// Translate a relay message into the event a client reports.
    pub fn into_event(self) -> SyncEvent {
        match self {
            ServerMessage::Joined {
                session,
                peer_count,
                snapshot,
                backlog,
            } => SyncEvent::Joined {
                session,
                peer_count,
                snapshot,
                backlog,
            },
            ServerMessage::PeerJoined { peer_id } => SyncEvent::PeerJoined { peer_id },
            ServerMessage::PeerLeft { peer_id } => SyncEvent::PeerLeft { peer_id },
            ServerMessage::Mutation {
                from,
                target_revision,
                mutation,
            } => SyncEvent::MutationReceived {
                from,
                change: RevisionedMutation {
                    target_revision,
                    mutation,
                },
            },
            ServerMessage::Error { message } => SyncEvent::Error { message },
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from the WebSocket client
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Joined {
        session: String,
        peer_count: usize,
        snapshot: Option<Snapshot>,
        backlog: Vec<RevisionedMutation>,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    MutationReceived { from: String, change: RevisionedMutation },
    /// The local store diverged from the peer's; the link was dropped
    SyncBroken { expected: u64, received: u64 },
    Error { message: String },
}

// ============================================================================
// Native WebSocket Client
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
mod native_client {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{Message, connect};
    use url::Url;

    /// Commands sent to the socket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// Relay connection on a background thread.
    ///
    /// Outgoing frames go through a command channel; incoming frames are
    /// parsed on the thread and collected with [`PeerSocket::poll_events`].
    pub struct PeerSocket {
        state: ConnectionState,
        events: Vec<SyncEvent>,
        cmd_tx: Option<Sender<WsCommand>>,
        event_rx: Option<Receiver<SyncEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl PeerSocket {
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                events: Vec::new(),
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        /// Connect to a relay at a `ws://` or `wss://` URL.
        pub fn connect(&mut self, url: &str) -> Result<(), String> {
            if self.cmd_tx.is_some() {
                return Err("Already connected".to_string());
            }

            let parsed_url = Url::parse(url).map_err(|e| format!("Invalid URL: {}", e))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(format!("Invalid WebSocket URL scheme: {}", parsed_url.scheme()));
            }

            self.state = ConnectionState::Connecting;
            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<SyncEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || run_socket(&url, cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        /// Queue a message for the relay.
        pub fn send(&self, message: &ClientMessage) -> Result<(), String> {
            let text = serde_json::to_string(message).map_err(|e| format!("Encode failed: {}", e))?;
            match self.cmd_tx {
                Some(ref tx) => tx
                    .send(WsCommand::Send(text))
                    .map_err(|e| format!("Send failed: {}", e)),
                None => Err("Not connected".to_string()),
            }
        }

        /// Collect pending events without blocking.
        pub fn poll_events(&mut self) -> Vec<SyncEvent> {
            if let Some(ref rx) = self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    match &event {
                        SyncEvent::Connected => self.state = ConnectionState::Connected,
                        SyncEvent::Disconnected => self.state = ConnectionState::Disconnected,
                        SyncEvent::Error { .. } => self.state = ConnectionState::Error,
                        _ => {}
                    }
                    self.events.push(event);
                }
            }
            std::mem::take(&mut self.events)
        }

        pub fn state(&self) -> ConnectionState {
            self.state
        }

        pub fn is_connected(&self) -> bool {
            self.state == ConnectionState::Connected
        }
    }

    impl Default for PeerSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for PeerSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    fn run_socket(url: &str, cmd_rx: Receiver<WsCommand>, event_tx: Sender<SyncEvent>) {
        log::info!("Connecting to relay at {}", url);
        let mut socket = match connect(url) {
            Ok((socket, response)) => {
                log::info!("Relay connected, status: {}", response.status());
                socket
            }
            Err(e) => {
                log::error!("Relay connection failed: {}", e);
                let _ = event_tx.send(SyncEvent::Error {
                    message: format!("Connection failed: {}", e),
                });
                return;
            }
        };
        let _ = event_tx.send(SyncEvent::Connected);

        // Short read timeout so the loop can interleave sends and reads.
        match socket.get_mut() {
            tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
                let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
            }
            #[allow(unreachable_patterns)]
            _ => log::debug!("TLS stream, relying on default timeouts"),
        }

        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(text)) => {
                    log::debug!("Relay send: {}", &text[..text.len().min(100)]);
                    if let Err(e) = socket.send(Message::Text(text)) {
                        log::error!("Relay send error: {}", e);
                        break;
                    }
                }
                Ok(WsCommand::Close) => {
                    log::info!("Relay close requested");
                    let _ = socket.close(None);
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match socket.read() {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        let _ = event_tx.send(message.into_event());
                    }
                    Err(e) => log::warn!("Failed to parse relay message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("Relay closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("Relay read error: {}", e);
                    break;
                }
            }
        }

        log::info!("Relay socket thread exiting");
        let _ = event_tx.send(SyncEvent::Disconnected);
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native_client::PeerSocket;
