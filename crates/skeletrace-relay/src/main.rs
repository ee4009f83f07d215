//! Skeletrace WebSocket Relay Server
//!
//! Forwards revision-tagged mutations between the peers of an annotation
//! session. The relay never applies mutations itself; it keeps the latest
//! published snapshot and the mutations relayed since, so a peer that joins
//! late can catch up.
//!
//! ## Protocol
//!
//! Messages are JSON text frames:
//! ```json
//! { "type": "join", "session": "cell-17" }
//! { "type": "mutation", "target_revision": 8, "mutation": { "op": "delete_node", "id": 4 } }
//! { "type": "snapshot", "revision": 7, "nml": "<things>...</things>" }
//! ```

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use skeletrace_core::{ClientMessage, RevisionedMutation, ServerMessage, Snapshot};
use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable holding the bind address.
const ADDR_ENV: &str = "SKELETRACE_RELAY_ADDR";
const DEFAULT_ADDR: &str = "0.0.0.0:3030";
/// Mutations kept per session for late joiners.
const MAX_SESSION_BACKLOG: usize = 4096;
const CHANNEL_CAPACITY: usize = 256;

/// Annotation session state
struct Session {
    /// Broadcast channel for this session
    tx: broadcast::Sender<(String, ServerMessage)>,
    peers: HashSet<String>,
    /// Latest snapshot published by a peer
    snapshot: Option<Snapshot>,
    /// Mutations relayed after `snapshot`, oldest first
    backlog: VecDeque<RevisionedMutation>,
}

impl Session {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashSet::new(),
            snapshot: None,
            backlog: VecDeque::new(),
        }
    }

    /// Revision the next recorded mutation must target, once known.
    fn next_revision(&self) -> Option<u64> {
        self.backlog
            .back()
            .map(|change| change.target_revision + 1)
            .or_else(|| self.snapshot.as_ref().map(|s| s.revision + 1))
    }

    /// Append to the backlog if the change continues it. A change racing
    /// another one for the same revision is still forwarded, so both peers
    /// notice, but only the first is kept for late joiners.
    fn record(&mut self, change: RevisionedMutation) -> bool {
        if let Some(expected) = self.next_revision() {
            if change.target_revision != expected {
                debug!(
                    "Not recording change for revision {} (next is {})",
                    change.target_revision, expected
                );
                return false;
            }
        }
        self.backlog.push_back(change);
        if self.backlog.len() > MAX_SESSION_BACKLOG {
            self.backlog.pop_front();
            warn!("Session backlog full; late joiners need a fresh snapshot");
        }
        true
    }

    /// Keep a snapshot unless it is older than the one already held.
    fn store_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if self
            .snapshot
            .as_ref()
            .is_some_and(|held| held.revision > snapshot.revision)
        {
            return false;
        }
        let revision = snapshot.revision;
        self.backlog.retain(|change| change.target_revision > revision);
        self.snapshot = Some(snapshot);
        true
    }
}

/// What a joining peer is told about the session.
struct JoinState {
    rx: broadcast::Receiver<(String, ServerMessage)>,
    peer_count: usize,
    snapshot: Option<Snapshot>,
    backlog: Vec<RevisionedMutation>,
}

/// Shared application state
struct AppState {
    sessions: DashMap<String, Session>,
}

impl AppState {
    fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Add a peer to a session, creating it if needed.
    fn join_session(&self, session_id: &str, peer_id: &str) -> JoinState {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(Session::new);
        session.peers.insert(peer_id.to_string());
        JoinState {
            rx: session.tx.subscribe(),
            peer_count: session.peers.len(),
            snapshot: session.snapshot.clone(),
            backlog: session.backlog.iter().cloned().collect(),
        }
    }

    /// Remove a peer; sessions without peers are dropped with their history.
    fn leave_session(&self, session_id: &str, peer_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.peers.remove(peer_id);
            if session.peers.is_empty() {
                drop(session);
                self.sessions.remove(session_id);
                info!("Session {} closed", session_id);
            }
        }
    }

    fn record_mutation(&self, session_id: &str, change: RevisionedMutation) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.record(change);
        }
    }

    fn store_snapshot(&self, session_id: &str, snapshot: Snapshot) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            let revision = snapshot.revision;
            if session.store_snapshot(snapshot) {
                debug!("Session {} snapshot at revision {}", session_id, revision);
            } else {
                debug!("Ignored stale snapshot at revision {}", revision);
            }
        }
    }

    /// Broadcast message to a session
    fn broadcast(&self, session_id: &str, from: &str, msg: ServerMessage) {
        if let Some(session) = self.sessions.get(session_id) {
            let _ = session.tx.send((from.to_string(), msg));
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skeletrace_relay=info,tower_http=info".into()),
        )
        .init();

    let addr = bind_address(std::env::var(ADDR_ENV).ok().as_deref())?;
    let state = Arc::new(AppState::new());

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Skeletrace relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn bind_address(configured: Option<&str>) -> std::io::Result<SocketAddr> {
    configured.unwrap_or(DEFAULT_ADDR).parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a socket address: {}", ADDR_ENV, e),
        )
    })
}

async fn index() -> &'static str {
    "Skeletrace Relay Server - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut current_session: Option<String> = None;
    let mut session_rx: Option<broadcast::Receiver<(String, ServerMessage)>> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                };
                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", peer_id, e);
                        let err = ServerMessage::Error { message: format!("Invalid message: {}", e) };
                        if let Some(reply) = encode(&err) {
                            let _ = sender.send(reply).await;
                        }
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Join { session } => {
                        if let Some(old) = current_session.take() {
                            state.leave_session(&old, &peer_id);
                            state.broadcast(&old, &peer_id, ServerMessage::PeerLeft { peer_id: peer_id.clone() });
                        }

                        let join = state.join_session(&session, &peer_id);
                        session_rx = Some(join.rx);
                        current_session = Some(session.clone());

                        let joined = ServerMessage::Joined {
                            session: session.clone(),
                            peer_count: join.peer_count,
                            snapshot: join.snapshot,
                            backlog: join.backlog,
                        };
                        if let Some(reply) = encode(&joined) {
                            if sender.send(reply).await.is_err() {
                                break;
                            }
                        }

                        state.broadcast(&session, &peer_id, ServerMessage::PeerJoined { peer_id: peer_id.clone() });
                        info!("Peer {} joined session {}", peer_id, session);
                    }
                    ClientMessage::Leave => {
                        if let Some(session) = current_session.take() {
                            state.leave_session(&session, &peer_id);
                            state.broadcast(&session, &peer_id, ServerMessage::PeerLeft { peer_id: peer_id.clone() });
                            info!("Peer {} left session {}", peer_id, session);
                        }
                        session_rx = None;
                    }
                    ClientMessage::Mutation { target_revision, mutation } => {
                        let Some(ref session) = current_session else {
                            warn!("Mutation from {} outside a session", peer_id);
                            continue;
                        };
                        debug!("Relaying {} for revision {}", mutation.name(), target_revision);
                        state.record_mutation(session, RevisionedMutation {
                            target_revision,
                            mutation: mutation.clone(),
                        });
                        state.broadcast(session, &peer_id, ServerMessage::Mutation {
                            from: peer_id.clone(),
                            target_revision,
                            mutation,
                        });
                    }
                    ClientMessage::Snapshot { revision, nml } => {
                        if let Some(ref session) = current_session {
                            state.store_snapshot(session, Snapshot { revision, nml });
                        }
                    }
                }
            }

            msg = async {
                match &mut session_rx {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending::<Option<(String, ServerMessage)>>().await,
                }
            } => {
                if let Some((from, server_msg)) = msg {
                    // Don't echo back to sender
                    if from != peer_id {
                        if let Some(frame) = encode(&server_msg) {
                            if sender.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(ref session) = current_session {
        state.leave_session(session, &peer_id);
        state.broadcast(session, &peer_id, ServerMessage::PeerLeft { peer_id: peer_id.clone() });
    }
    info!("Connection closed: {}", peer_id);
}
