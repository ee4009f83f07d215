//! Peer sessions: the bridge between the mutation protocol and the relay.
//!
//! A [`PeerSession`] turns relay messages into protocol calls (snapshot
//! adoption, remote replay) and queues the local store's resolved mutations
//! as outgoing JSON. It does not own a socket; feed it the text frames from a
//! [`PeerSocket`](crate::sync::PeerSocket) or any other transport.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{RevisionedMutation, SharedSkeleton, Snapshot};
use crate::sync::{ClientMessage, ServerMessage, SyncEvent};
use std::sync::Arc;

/// Collaboration state for one annotation session.
pub struct PeerSession {
    skeleton: Arc<SharedSkeleton>,
    /// Session ID once the relay confirmed the join.
    session: Option<String>,
    /// Set when a replay diverged; cleared by the next join.
    broken: bool,
    /// Pending outgoing messages (JSON strings).
    outgoing: Vec<String>,
}

impl PeerSession {
    pub fn new(skeleton: Arc<SharedSkeleton>) -> Self {
        Self {
            skeleton,
            session: None,
            broken: false,
            outgoing: Vec::new(),
        }
    }

    pub fn skeleton(&self) -> &Arc<SharedSkeleton> {
        &self.skeleton
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the link was dropped after the stores diverged.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    // --- Session Management ---

    /// Request to join a session. Queues the join message.
    pub fn join(&mut self, session: &str) {
        self.broken = false;
        self.queue(&ClientMessage::Join {
            session: session.to_string(),
        });
    }

    /// Leave the current session and stop queueing local mutations.
    pub fn leave(&mut self) -> ProtocolResult<()> {
        if self.session.take().is_some() {
            self.queue(&ClientMessage::Leave);
        }
        self.skeleton.set_peer_connected(false)
    }

    /// Queue the full current state for the relay to hand to later joiners.
    pub fn publish_snapshot(&mut self) -> ProtocolResult<()> {
        let snapshot = self.skeleton.snapshot()?;
        log::debug!("Publishing snapshot at revision {}", snapshot.revision);
        self.queue(&ClientMessage::from_snapshot(snapshot));
        Ok(())
    }

    /// Take pending outgoing messages, including local mutations queued by
    /// the store since the last call.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        match self.skeleton.take_outgoing() {
            Ok(changes) => {
                for change in changes {
                    self.queue(&ClientMessage::from_change(change));
                }
            }
            Err(err) => log::warn!("Could not drain local mutations: {}", err),
        }
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn queue(&mut self, message: &ClientMessage) {
        match serde_json::to_string(message) {
            Ok(json) => self.outgoing.push(json),
            Err(err) => log::error!("Failed to encode relay message: {}", err),
        }
    }

    // --- Incoming Message Handling ---

    /// Handle a text frame from the relay.
    /// Returns a SyncEvent describing what happened.
    pub fn handle_message(&mut self, json: &str) -> Option<SyncEvent> {
        match serde_json::from_str::<ServerMessage>(json) {
            Ok(message) => self.handle_event(message.into_event()),
            Err(err) => {
                log::warn!("Ignoring unparseable relay message: {}", err);
                None
            }
        }
    }

    /// Handle an event reported by a socket.
    pub fn handle_event(&mut self, event: SyncEvent) -> Option<SyncEvent> {
        match event {
            SyncEvent::Joined {
                session,
                peer_count,
                snapshot,
                backlog,
            } => self.on_joined(session, peer_count, snapshot, backlog),
            SyncEvent::PeerJoined { peer_id } => {
                log::info!("Peer {} joined", peer_id);
                if let Err(err) = self.publish_snapshot() {
                    log::warn!("Could not publish snapshot: {}", err);
                }
                Some(SyncEvent::PeerJoined { peer_id })
            }
            SyncEvent::MutationReceived { from, change } => self.on_mutation(from, change),
            SyncEvent::Disconnected => {
                self.session = None;
                if let Err(err) = self.skeleton.set_peer_connected(false) {
                    log::warn!("Could not detach peer: {}", err);
                }
                Some(SyncEvent::Disconnected)
            }
            other => Some(other),
        }
    }

    fn on_joined(
        &mut self,
        session: String,
        peer_count: usize,
        snapshot: Option<Snapshot>,
        backlog: Vec<RevisionedMutation>,
    ) -> Option<SyncEvent> {
        log::info!("Joined session {} with {} peer(s)", session, peer_count);
        self.session = Some(session.clone());

        let adopted = match &snapshot {
            Some(snapshot) => match self.skeleton.adopt_snapshot(snapshot) {
                Ok(()) => true,
                Err(err) => {
                    log::error!("Could not adopt session snapshot: {}", err);
                    return Some(self.fail(err));
                }
            },
            None => false,
        };
        if let Err(err) = self.skeleton.set_peer_connected(true) {
            return Some(self.fail(err));
        }

        let local = self.skeleton.revision().unwrap_or_default();
        for change in backlog.iter().filter(|c| c.target_revision > local) {
            if let Err(err) = self
                .skeleton
                .replay(change.target_revision, change.mutation.clone())
            {
                return Some(self.fail(err));
            }
        }
        // The first peer seeds the session for everyone after it.
        if !adopted {
            if let Err(err) = self.publish_snapshot() {
                log::warn!("Could not publish snapshot: {}", err);
            }
        }

        Some(SyncEvent::Joined {
            session,
            peer_count,
            snapshot,
            backlog,
        })
    }

    fn on_mutation(&mut self, from: String, change: RevisionedMutation) -> Option<SyncEvent> {
        if self.broken {
            return None;
        }
        match self
            .skeleton
            .replay(change.target_revision, change.mutation.clone())
        {
            Ok(_) => Some(SyncEvent::MutationReceived { from, change }),
            Err(err) => Some(self.fail(err)),
        }
    }

    /// Report a failed protocol call; divergence also tears the link down.
    fn fail(&mut self, err: ProtocolError) -> SyncEvent {
        match err {
            ProtocolError::SyncBroken { expected, received } => {
                log::error!(
                    "Synchronization broken (expected revision {}, received {}); leaving session",
                    expected,
                    received
                );
                self.broken = true;
                if let Err(err) = self.leave() {
                    log::warn!("Could not detach peer: {}", err);
                }
                SyncEvent::SyncBroken { expected, received }
            }
            other => {
                log::error!("Remote change failed: {}", other);
                SyncEvent::Error {
                    message: other.to_string(),
                }
            }
        }
    }
}
