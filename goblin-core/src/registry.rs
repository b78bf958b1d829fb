//! Thread-safe goblin registry using DashMap.
//!
//! The registry exclusively owns goblins and their images. Every mutation
//! runs under the DashMap shard lock of one goblin, so it is atomic per
//! goblin. Long-running transitions additionally hold a [`TransitionGuard`]
//! so a second concurrent freeze or thaw fails fast instead of queueing.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GoblinError, GoblinResult, StateTransitionError};
use crate::image::{AttemptFailure, Image};
use crate::state::GoblinState;
use crate::types::{Generation, GoblinId, ProcessId, SequenceNumber};

/// A managed process identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goblin {
    pub id: GoblinId,
    pub state: GoblinState,
    /// Only set while `Running`.
    pub pid: Option<ProcessId>,
    pub generation: Generation,
    pub created_at: SystemTime,
    pub state_since: SystemTime,
    pub transition_count: u64,
    /// Latest successful image directory.
    pub image_dir: Option<PathBuf>,
    /// Sequence of the image the current generation was restored from.
    pub restored_from: Option<SequenceNumber>,
    pub images: Vec<Image>,
    pub next_sequence: SequenceNumber,
    pub last_failure: Option<AttemptFailure>,
    /// Launch command line, when the manager spawned the process.
    pub command: Option<Vec<String>>,
}

impl Goblin {
    pub fn new(id: GoblinId, pid: ProcessId, command: Option<Vec<String>>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            state: GoblinState::Running,
            pid: Some(pid),
            generation: Generation::ORIGINAL,
            created_at: now,
            state_since: now,
            transition_count: 0,
            image_dir: None,
            restored_from: None,
            images: Vec::new(),
            next_sequence: SequenceNumber::FIRST,
            last_failure: None,
            command,
        }
    }

    pub fn image(&self, sequence: SequenceNumber) -> Option<&Image> {
        self.images.iter().find(|i| i.sequence == sequence)
    }

    pub fn latest_image(&self) -> Option<&Image> {
        self.images.iter().max_by_key(|i| i.sequence)
    }

    pub fn latest_successful_image(&self) -> Option<&Image> {
        self.images
            .iter()
            .filter(|i| i.is_success())
            .max_by_key(|i| i.sequence)
    }

    /// The image the running generation came from, if any.
    pub fn restored_image(&self) -> Option<&Image> {
        self.restored_from.and_then(|seq| self.image(seq))
    }

    fn transition_to(&mut self, target: GoblinState) -> Result<(), StateTransitionError> {
        self.state.check_transition(&self.id, target)?;

        tracing::debug!(
            goblin_id = %self.id,
            from = self.state.name(),
            to = target.name(),
            "State transition"
        );

        self.state = target;
        self.state_since = SystemTime::now();
        self.transition_count += 1;
        if !target.has_process() {
            self.pid = None;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct GoblinEntry {
    goblin: Goblin,
    in_flight: bool,
}

/// Thread-safe registry for managing goblins.
#[derive(Debug, Default)]
pub struct GoblinRegistry {
    goblins: DashMap<GoblinId, GoblinEntry>,
}

impl GoblinRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            goblins: DashMap::new(),
        }
    }

    /// Create a registry wrapped in an Arc for sharing across threads.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a running process under a generated id.
    pub fn create(&self, pid: ProcessId, command: Option<Vec<String>>) -> GoblinResult<Goblin> {
        self.create_with_id(GoblinId::generate(), pid, command)
    }

    /// Register a running process under `id`.
    pub fn create_with_id(
        &self,
        id: GoblinId,
        pid: ProcessId,
        command: Option<Vec<String>>,
    ) -> GoblinResult<Goblin> {
        self.insert(Goblin::new(id, pid, command))
    }

    /// Insert an existing goblin record.
    /// Returns AlreadyExists if the id is taken.
    pub fn insert(&self, goblin: Goblin) -> GoblinResult<Goblin> {
        use dashmap::mapref::entry::Entry;

        match self.goblins.entry(goblin.id.clone()) {
            Entry::Occupied(_) => Err(GoblinError::AlreadyExists(goblin.id)),
            Entry::Vacant(slot) => {
                tracing::info!(goblin_id = %goblin.id, pid = ?goblin.pid, "Goblin registered");
                slot.insert(GoblinEntry {
                    goblin: goblin.clone(),
                    in_flight: false,
                });
                Ok(goblin)
            }
        }
    }

    /// Replace the whole registry content with a persisted snapshot.
    pub fn restore_from_snapshot(&self, goblins: Vec<Goblin>) {
        self.goblins.clear();
        for goblin in goblins {
            self.goblins.insert(
                goblin.id.clone(),
                GoblinEntry {
                    goblin,
                    in_flight: false,
                },
            );
        }
    }

    /// Bring the registry in line with a freshly read snapshot.
    ///
    /// Records are replaced by their persisted copies and goblins missing from
    /// the snapshot are dropped. In-flight markers of this process survive.
    pub fn merge_snapshot(&self, goblins: Vec<Goblin>) {
        use dashmap::mapref::entry::Entry;

        let persisted: HashSet<GoblinId> = goblins.iter().map(|g| g.id.clone()).collect();
        self.goblins.retain(|id, _| persisted.contains(id));
        for goblin in goblins {
            match self.goblins.entry(goblin.id.clone()) {
                Entry::Occupied(mut slot) => slot.get_mut().goblin = goblin,
                Entry::Vacant(slot) => {
                    slot.insert(GoblinEntry {
                        goblin,
                        in_flight: false,
                    });
                }
            }
        }
    }

    /// All goblins, oldest first.
    pub fn list(&self) -> Vec<Goblin> {
        let mut goblins: Vec<Goblin> = self.goblins.iter().map(|r| r.goblin.clone()).collect();
        goblins.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        goblins
    }

    pub fn get(&self, id: &GoblinId) -> GoblinResult<Goblin> {
        self.goblins
            .get(id)
            .map(|entry| entry.goblin.clone())
            .ok_or_else(|| GoblinError::NotFound(id.clone()))
    }

    pub fn get_state(&self, id: &GoblinId) -> GoblinResult<GoblinState> {
        self.goblins
            .get(id)
            .map(|entry| entry.goblin.state)
            .ok_or_else(|| GoblinError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &GoblinId) -> bool {
        self.goblins.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.goblins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goblins.is_empty()
    }

    /// Goblins in a specific state.
    pub fn goblins_in_state(&self, state: GoblinState) -> Vec<GoblinId> {
        self.goblins
            .iter()
            .filter(|r| r.goblin.state == state)
            .map(|r| r.key().clone())
            .collect()
    }

    fn with_goblin<T>(
        &self,
        id: &GoblinId,
        f: impl FnOnce(&mut Goblin) -> GoblinResult<T>,
    ) -> GoblinResult<T> {
        let mut entry = self
            .goblins
            .get_mut(id)
            .ok_or_else(|| GoblinError::NotFound(id.clone()))?;
        f(&mut entry.goblin)
    }

    /// Move a goblin to `target` if the state machine allows it.
    pub fn update_state(&self, id: &GoblinId, target: GoblinState) -> GoblinResult<Goblin> {
        self.with_goblin(id, |goblin| {
            goblin.transition_to(target)?;
            Ok(goblin.clone())
        })
    }

    /// Hand out the next image sequence number. Numbers are never reused,
    /// even when the attempt that took one never produced an image.
    pub fn allocate_sequence(&self, id: &GoblinId) -> GoblinResult<SequenceNumber> {
        self.with_goblin(id, |goblin| {
            let sequence = goblin.next_sequence;
            goblin.next_sequence = sequence.next();
            Ok(sequence)
        })
    }

    /// Attach an image without changing state.
    pub fn record_image(&self, id: &GoblinId, image: Image) -> GoblinResult<()> {
        self.with_goblin(id, |goblin| push_image(goblin, image))
    }

    /// Record a freeze image and move to `Frozen` (success) or `Failed`.
    pub fn complete_freeze(
        &self,
        id: &GoblinId,
        image: Image,
        failure: Option<AttemptFailure>,
    ) -> GoblinResult<Goblin> {
        self.with_goblin(id, |goblin| {
            let target = if image.is_success() {
                GoblinState::Frozen
            } else {
                GoblinState::Failed
            };
            goblin.state.check_transition(&goblin.id, target)?;

            let success_dir = image.is_success().then(|| image.dir.clone());
            push_image(goblin, image)?;
            goblin.transition_to(target)?;
            if let Some(dir) = success_dir {
                goblin.image_dir = Some(dir);
            }
            if failure.is_some() {
                goblin.last_failure = failure;
            }
            Ok(goblin.clone())
        })
    }

    /// A restore from `source` succeeded; the new pid is not known yet.
    pub fn mark_thawed(
        &self,
        id: &GoblinId,
        source: PathBuf,
        restored_from: Option<SequenceNumber>,
    ) -> GoblinResult<Goblin> {
        self.with_goblin(id, |goblin| {
            goblin.transition_to(GoblinState::Thawed)?;
            goblin.image_dir = Some(source);
            goblin.restored_from = restored_from;
            Ok(goblin.clone())
        })
    }

    /// Attach the restored process to a `Thawed` goblin, making it `Running`
    /// as the next generation.
    pub fn set_process(&self, id: &GoblinId, pid: ProcessId) -> GoblinResult<Goblin> {
        self.with_goblin(id, |goblin| {
            goblin.transition_to(GoblinState::Running)?;
            goblin.pid = Some(pid);
            goblin.generation = goblin.generation.next();
            Ok(goblin.clone())
        })
    }

    /// Move to `Failed` and remember why.
    pub fn record_failure(&self, id: &GoblinId, failure: AttemptFailure) -> GoblinResult<Goblin> {
        self.with_goblin(id, |goblin| {
            goblin.transition_to(GoblinState::Failed)?;
            goblin.last_failure = Some(failure);
            Ok(goblin.clone())
        })
    }

    /// Claim the per-goblin transition lock.
    ///
    /// Returns `Conflict` if another freeze or thaw is in flight. The lock is
    /// released when the guard drops.
    pub fn begin_transition(&self, id: &GoblinId) -> GoblinResult<TransitionGuard<'_>> {
        let mut entry = self
            .goblins
            .get_mut(id)
            .ok_or_else(|| GoblinError::NotFound(id.clone()))?;
        if entry.in_flight {
            return Err(StateTransitionError::TransitionInFlight {
                goblin_id: id.clone(),
            }
            .into());
        }
        entry.in_flight = true;
        Ok(TransitionGuard {
            registry: self,
            id: id.clone(),
        })
    }

    /// Remove a goblin. Refused while a transition is in flight.
    pub fn remove(&self, id: &GoblinId) -> GoblinResult<Goblin> {
        let removed = self
            .goblins
            .remove_if(id, |_, entry| !entry.in_flight)
            .map(|(_, entry)| entry.goblin);

        match removed {
            Some(goblin) => Ok(goblin),
            None if self.contains(id) => Err(StateTransitionError::TransitionInFlight {
                goblin_id: id.clone(),
            }
            .into()),
            None => Err(GoblinError::NotFound(id.clone())),
        }
    }

    fn release(&self, id: &GoblinId) {
        if let Some(mut entry) = self.goblins.get_mut(id) {
            entry.in_flight = false;
        }
    }
}

fn push_image(goblin: &mut Goblin, image: Image) -> GoblinResult<()> {
    if image.sequence >= goblin.next_sequence || goblin.image(image.sequence).is_some() {
        return Err(StateTransitionError::DuplicateImage {
            goblin_id: goblin.id.clone(),
            sequence: image.sequence,
        }
        .into());
    }
    goblin.images.push(image);
    goblin.images.sort_by_key(|i| i.sequence);
    Ok(())
}

/// Holds the per-goblin transition lock until dropped.
#[derive(Debug)]
pub struct TransitionGuard<'a> {
    registry: &'a GoblinRegistry,
    id: GoblinId,
}

impl TransitionGuard<'_> {
    pub fn goblin_id(&self) -> &GoblinId {
        &self.id
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
