//! The revision-gated mutation protocol.
//!
//! [`SharedSkeleton`] guards a [`Skeleton`] with one lock. Local callers
//! [`submit`](SharedSkeleton::submit) mutations without a precondition; a
//! peer's mutations are [`replay`](SharedSkeleton::replay)ed only when they
//! target exactly the next local revision. Lock acquisition is bounded by the
//! configured timeout and fails once the store is shut down.

use crate::config::SkeletonConfig;
use crate::error::{ProtocolError, ProtocolResult, SkeletonError};
use crate::history::{History, HistoryEntry};
use crate::mutation::{Effect, Mutation, UndoKind};
use crate::nml::{LoadMode, LoadSummary};
use crate::skeleton::{Skeleton, SkeletonEvent};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A resolved mutation tagged with the revision it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionedMutation {
    pub target_revision: u64,
    pub mutation: Mutation,
}

/// Full store state as an NML document, at a given revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: u64,
    pub nml: String,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote { target_revision: u64 },
}

struct Guarded {
    skeleton: Skeleton,
    history: History,
    outbox: Vec<RevisionedMutation>,
    peer_connected: bool,
}

impl Guarded {
    fn execute(&mut self, mutation: Mutation, origin: Origin) -> ProtocolResult<Effect> {
        match origin {
            Origin::Local => self.execute_local(mutation),
            Origin::Remote { target_revision } => self.execute_remote(target_revision, &mutation),
        }
    }

    fn execute_local(&mut self, mutation: Mutation) -> ProtocolResult<Effect> {
        let resolved = self.skeleton.resolve(mutation)?;
        let kind = resolved.undo_kind();
        let inverse = match kind {
            UndoKind::Reversible => self.skeleton.inverse_of(&resolved),
            _ => None,
        };
        let effect = self.skeleton.apply(&resolved)?;
        if !effect.changed() {
            return Ok(effect);
        }

        match (kind, inverse) {
            (UndoKind::Reversible, Some(inverse)) => self.history.record(HistoryEntry {
                forward: vec![resolved.clone()],
                inverse,
            }),
            (UndoKind::Transient, _) => {}
            _ => self.history.clear(),
        }
        self.broadcast(resolved);
        Ok(effect)
    }

    fn execute_remote(&mut self, target_revision: u64, mutation: &Mutation) -> ProtocolResult<Effect> {
        let expected = self.skeleton.revision() + 1;
        if target_revision != expected {
            log::warn!(
                "Rejected remote {}: expected revision {}, received {}",
                mutation.name(),
                expected,
                target_revision
            );
            return Err(ProtocolError::SyncBroken {
                expected,
                received: target_revision,
            });
        }
        let effect = self.skeleton.apply(mutation)?;
        // Inverses recorded before a peer's change may no longer apply.
        self.history.clear();
        Ok(effect)
    }

    /// Apply recorded steps as local mutations without touching the history.
    ///
    /// Steps are all-or-nothing: a multi-step entry is first run on a copy,
    /// so a failing step leaves the store and the outbox as they were.
    fn apply_steps(&mut self, steps: &[Mutation]) -> ProtocolResult<()> {
        if steps.len() > 1 {
            let mut trial = self.skeleton.clone();
            for step in steps {
                if let Err(err) = trial.apply(step) {
                    return Err(self.discard_history(step, err));
                }
            }
        }
        for step in steps {
            if let Err(err) = self.skeleton.apply(step) {
                return Err(self.discard_history(step, err));
            }
            self.broadcast(step.clone());
        }
        Ok(())
    }

    fn discard_history(&mut self, step: &Mutation, err: ProtocolError) -> ProtocolError {
        log::error!("History step {} failed: {}", step.name(), err);
        self.history.clear();
        err
    }

    fn broadcast(&mut self, mutation: Mutation) {
        if self.peer_connected {
            self.outbox.push(RevisionedMutation {
                target_revision: self.skeleton.revision(),
                mutation,
            });
        }
    }
}

/// A [`Skeleton`] behind the mutation protocol.
pub struct SharedSkeleton {
    state: Mutex<Guarded>,
    closed: AtomicBool,
    lock_timeout: Duration,
}

impl SharedSkeleton {
    pub fn new(config: SkeletonConfig) -> Self {
        Self::from_skeleton(Skeleton::new(config))
    }

    pub fn from_skeleton(skeleton: Skeleton) -> Self {
        let config = skeleton.config();
        let lock_timeout = config.lock_timeout();
        let history = History::new(config.undo_depth);
        Self {
            state: Mutex::new(Guarded {
                skeleton,
                history,
                outbox: Vec::new(),
                peer_connected: false,
            }),
            closed: AtomicBool::new(false),
            lock_timeout,
        }
    }

    fn lock(&self) -> ProtocolResult<MutexGuard<'_, Guarded>> {
        if self.is_closed() {
            return Err(ProtocolError::Unavailable);
        }
        let guard = self.state.try_lock_for(self.lock_timeout).ok_or_else(|| {
            log::warn!("Skeleton lock not acquired within {:?}", self.lock_timeout);
            ProtocolError::Unavailable
        })?;
        // Shutdown may have happened while we waited.
        if self.is_closed() {
            return Err(ProtocolError::Unavailable);
        }
        Ok(guard)
    }

    /// Apply a local mutation. On success the resolved mutation is queued for
    /// the peer, if one is connected.
    pub fn submit(&self, mutation: Mutation) -> ProtocolResult<Effect> {
        self.lock()?.execute(mutation, Origin::Local)
    }

    /// Apply a peer's mutation if it targets the next local revision.
    ///
    /// A mismatch returns [`ProtocolError::SyncBroken`] and changes nothing.
    pub fn replay(&self, target_revision: u64, mutation: Mutation) -> ProtocolResult<Effect> {
        self.lock()?
            .execute(mutation, Origin::Remote { target_revision })
    }

    /// Run a read-only query under the lock.
    pub fn with_read<R>(&self, f: impl FnOnce(&Skeleton) -> R) -> ProtocolResult<R> {
        Ok(f(&self.lock()?.skeleton))
    }

    /// Run a closure with mutable access under the lock.
    ///
    /// Intended for state outside the revision protocol, such as the comment
    /// cursor, the voxel source or the saved flag. Graph changes made here
    /// are neither recorded nor sent to the peer.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut Skeleton) -> R) -> ProtocolResult<R> {
        Ok(f(&mut self.lock()?.skeleton))
    }

    pub fn revision(&self) -> ProtocolResult<u64> {
        self.with_read(Skeleton::revision)
    }

    /// Drain the mutations queued for the peer.
    pub fn take_outgoing(&self) -> ProtocolResult<Vec<RevisionedMutation>> {
        Ok(std::mem::take(&mut self.lock()?.outbox))
    }

    /// Drain queued change notifications.
    pub fn take_events(&self) -> ProtocolResult<Vec<SkeletonEvent>> {
        self.with_locked(Skeleton::take_events)
    }

    /// Start or stop queueing local mutations for a peer.
    pub fn set_peer_connected(&self, connected: bool) -> ProtocolResult<()> {
        let mut state = self.lock()?;
        state.peer_connected = connected;
        if !connected {
            state.outbox.clear();
        }
        Ok(())
    }

    /// Refuse every further call. Callers blocked on the lock fail once they
    /// acquire it.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        log::info!("Skeleton shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Revert the most recent recorded step.
    pub fn undo(&self) -> ProtocolResult<()> {
        let mut state = self.lock()?;
        let entry = state.history.take_undo().ok_or(SkeletonError::NothingToUndo)?;
        state.apply_steps(&entry.inverse)?;
        state.history.undone(entry);
        Ok(())
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&self) -> ProtocolResult<()> {
        let mut state = self.lock()?;
        let entry = state.history.take_redo().ok_or(SkeletonError::NothingToRedo)?;
        state.apply_steps(&entry.forward)?;
        state.history.redone(entry);
        Ok(())
    }

    pub fn can_undo(&self) -> ProtocolResult<bool> {
        Ok(self.lock()?.history.can_undo())
    }

    pub fn can_redo(&self) -> ProtocolResult<bool> {
        Ok(self.lock()?.history.can_redo())
    }

    /// Load a document as a local mutation.
    pub fn load_nml(&self, nml: &str, mode: LoadMode) -> ProtocolResult<LoadSummary> {
        let effect = self.submit(Mutation::Load {
            nml: nml.to_string(),
            mode,
        })?;
        match effect {
            Effect::Loaded(summary) => Ok(summary),
            _ => Ok(LoadSummary::default()),
        }
    }

    pub fn save_nml(&self) -> ProtocolResult<String> {
        self.with_read(Skeleton::to_nml)
    }

    /// Current state for a joining peer.
    pub fn snapshot(&self) -> ProtocolResult<Snapshot> {
        self.with_read(|skeleton| Snapshot {
            revision: skeleton.revision(),
            nml: skeleton.to_nml(),
        })
    }

    /// Replace the store with a peer's snapshot and take over its revision.
    pub fn adopt_snapshot(&self, snapshot: &Snapshot) -> ProtocolResult<()> {
        let mut state = self.lock()?;
        let (loaded, summary) = state.skeleton.read_nml(&snapshot.nml, LoadMode::Replace)?;
        state.skeleton.replace_contents(loaded);
        state.skeleton.set_revision(snapshot.revision);
        state.history.clear();
        state.outbox.clear();
        log::info!(
            "Adopted snapshot at revision {} ({} nodes)",
            snapshot.revision,
            summary.nodes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coordinate;
    use crate::skeleton::NewNode;
    use std::sync::Arc;
    use std::thread;

    fn shared() -> SharedSkeleton {
        SharedSkeleton::new(SkeletonConfig::default())
    }

    fn add_node(shared: &SharedSkeleton, tree: u64, x: i32) -> u64 {
        match shared
            .submit(Mutation::AddNode {
                node: NewNode::new(tree, Coordinate::new(x, 0, 0)),
            })
            .unwrap()
        {
            Effect::NodeAdded(id) => id,
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_remote_replay_requires_next_revision() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        assert_eq!(shared.revision().unwrap(), 1);

        let err = shared
            .replay(5, Mutation::AddTree { id: 0, color: None })
            .unwrap_err();
        assert!(err.is_sync_broken());
        assert_eq!(shared.revision().unwrap(), 1);
        assert_eq!(shared.with_read(|s| s.tree_count()).unwrap(), 1);

        shared.replay(2, Mutation::AddTree { id: 7, color: None }).unwrap();
        assert_eq!(shared.revision().unwrap(), 2);
    }

    #[test]
    fn test_outbox_only_with_peer() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        assert!(shared.take_outgoing().unwrap().is_empty());

        shared.set_peer_connected(true).unwrap();
        let id = add_node(&shared, 1, 3);
        let outgoing = shared.take_outgoing().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target_revision, 2);
        let Mutation::AddNode { node } = &outgoing[0].mutation else {
            panic!("expected add_node");
        };
        assert_eq!(node.id, id);
        assert!(node.timestamp.is_some());
    }

    #[test]
    fn test_extract_noop_is_not_broadcast() {
        let shared = shared();
        shared.set_peer_connected(true).unwrap();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        let id = add_node(&shared, 1, 0);
        shared.take_outgoing().unwrap();

        let effect = shared
            .submit(Mutation::ExtractComponent { start: id, tree: 0 })
            .unwrap();
        assert_eq!(effect, Effect::Unchanged);
        assert!(shared.take_outgoing().unwrap().is_empty());
        assert_eq!(shared.revision().unwrap(), 2);
    }

    #[test]
    fn test_undo_redo() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        let a = add_node(&shared, 1, 0);
        shared
            .submit(Mutation::MoveNode { id: a, position: Coordinate::new(9, 9, 9) })
            .unwrap();

        shared.undo().unwrap();
        let position = shared.with_read(|s| s.find_node_by_id(a).unwrap().position).unwrap();
        assert_eq!(position, Coordinate::new(0, 0, 0));
        shared.undo().unwrap();
        assert!(shared.with_read(|s| s.find_node_by_id(a).is_none()).unwrap());

        shared.redo().unwrap();
        shared.redo().unwrap();
        let position = shared.with_read(|s| s.find_node_by_id(a).unwrap().position).unwrap();
        assert_eq!(position, Coordinate::new(9, 9, 9));
        assert!(matches!(
            shared.redo(),
            Err(ProtocolError::Skeleton(SkeletonError::NothingToRedo))
        ));
    }

    #[test]
    fn test_failing_history_entry_applies_nothing() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        shared.set_peer_connected(true).unwrap();
        shared.state.lock().history.record(HistoryEntry {
            forward: vec![Mutation::Clear],
            inverse: vec![
                Mutation::AddTree { id: 7, color: None },
                Mutation::DeleteNode { id: 99 },
            ],
        });

        assert!(matches!(
            shared.undo(),
            Err(ProtocolError::Skeleton(SkeletonError::NodeNotFound(99)))
        ));
        assert_eq!(shared.revision().unwrap(), 1);
        assert!(shared.with_read(|s| s.find_tree_by_id(7).is_none()).unwrap());
        assert!(shared.take_outgoing().unwrap().is_empty());
        assert!(!shared.can_undo().unwrap());
    }

    #[test]
    fn test_selection_keeps_history_structural_clears_it() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        let a = add_node(&shared, 1, 0);
        shared.submit(Mutation::SetActiveNode { id: a }).unwrap();
        assert!(shared.can_undo().unwrap());

        shared.submit(Mutation::Clear).unwrap();
        assert!(!shared.can_undo().unwrap());
    }

    #[test]
    fn test_remote_replay_clears_history() {
        let shared = shared();
        shared.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        assert!(shared.can_undo().unwrap());
        shared.replay(2, Mutation::AddTree { id: 0, color: None }).unwrap();
        assert!(!shared.can_undo().unwrap());
    }

    #[test]
    fn test_lock_times_out() {
        let config = SkeletonConfig {
            lock_timeout_ms: 20,
            ..SkeletonConfig::default()
        };
        let shared = Arc::new(SharedSkeleton::new(config));
        let holder = Arc::clone(&shared);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            holder
                .with_locked(|_| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(200));
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();
        assert!(matches!(shared.revision(), Err(ProtocolError::Unavailable)));
        handle.join().unwrap();
        assert_eq!(shared.revision().unwrap(), 0);
    }

    #[test]
    fn test_shutdown_refuses_calls() {
        let shared = shared();
        shared.shutdown();
        assert!(matches!(
            shared.submit(Mutation::Clear),
            Err(ProtocolError::Unavailable)
        ));
    }

    #[test]
    fn test_snapshot_adoption() {
        let source = shared();
        source.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        add_node(&source, 1, 4);
        let snapshot = source.snapshot().unwrap();

        let joiner = shared();
        joiner.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        joiner.adopt_snapshot(&snapshot).unwrap();
        assert_eq!(joiner.revision().unwrap(), 2);
        assert_eq!(joiner.with_read(|s| s.node_count()).unwrap(), 1);
        assert!(!joiner.can_undo().unwrap());
    }
}
