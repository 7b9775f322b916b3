//! In-place execution context: the only mutation gateway during an iteration.
//!
//! Workers write straight into the shared storage. Structural changes are
//! staged per worker in a [`PendingChanges`] buffer and committed by
//! [`InPlaceExecutionContext::tear_down_iteration`] on a single thread.
//!
//! Consistency across objects is weak: an operation that inspects another
//! object's live state through [`ObjectContext::neighbor`] may see it before
//! or after that object ran this iteration. Radius queries read the grid
//! snapshot and are therefore identical for every reader of one iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::grid::{Grid, Neighbor};
use crate::identity::{Handle, RemapTable, TypeTag, Uid};
use crate::object::SimObject;
use crate::operations::Operation;
use crate::storage::{ObjectGuard, ResourceManager};

/// Names an object staged for addition until teardown issues its [`Uid`].
///
/// Ids follow the commit order: by staging object, then by staging sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StagedId {
    origin: Option<Uid>,
    sequence: u32,
}

impl StagedId {
    /// Object whose execution staged this one; `None` for direct staging.
    #[must_use]
    pub fn origin(&self) -> Option<Uid> {
        self.origin
    }

    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// An owned object waiting for teardown.
#[derive(Debug)]
pub struct StagedObject {
    id: StagedId,
    tag: TypeTag,
    object: Box<dyn SimObject>,
}

impl StagedObject {
    #[must_use]
    pub fn id(&self) -> StagedId {
        self.id
    }

    /// Object whose execution staged this one, if any.
    #[must_use]
    pub fn origin(&self) -> Option<Uid> {
        self.id.origin
    }

    #[must_use]
    pub fn object(&self) -> &dyn SimObject {
        &*self.object
    }
}

/// Additions and removals accumulated during one iteration.
#[derive(Debug, Default)]
pub struct PendingChanges {
    additions: Vec<StagedObject>,
    removals: Vec<Uid>,
}

impl PendingChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    #[must_use]
    pub fn additions(&self) -> &[StagedObject] {
        &self.additions
    }

    #[must_use]
    pub fn removals(&self) -> &[Uid] {
        &self.removals
    }

    /// Move everything staged in `other` into `self`.
    pub fn merge(&mut self, mut other: PendingChanges) {
        self.additions.append(&mut other.additions);
        self.removals.append(&mut other.removals);
    }

    /// Put staged changes in an order independent of worker scheduling.
    fn normalize(&mut self) {
        self.additions.sort_by_key(|staged| staged.id);
        self.removals.sort_unstable();
        self.removals.dedup();
    }

    fn stage(&mut self, id: StagedId, tag: TypeTag, object: Box<dyn SimObject>) -> StagedId {
        self.additions.push(StagedObject { id, tag, object });
        id
    }

    fn staged(&self, id: StagedId) -> Option<&dyn SimObject> {
        self.additions
            .iter()
            .rev()
            .find(|staged| staged.id == id)
            .map(|staged| &*staged.object)
    }

    fn staged_mut(&mut self, id: StagedId) -> Option<&mut dyn SimObject> {
        self.additions
            .iter_mut()
            .rev()
            .find(|staged| staged.id == id)
            .map(|staged| &mut *staged.object)
    }
}

/// What a teardown committed.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// UIDs issued to staged objects, in commit order.
    pub added: Vec<Uid>,
    /// Staging ids of `added`, index for index.
    pub staged: Vec<StagedId>,
    pub removed: Vec<Uid>,
    /// Element moves caused by the removals.
    pub remaps: RemapTable,
}

impl TeardownReport {
    /// UID issued to the object staged under `id`.
    #[must_use]
    pub fn uid_of(&self, id: StagedId) -> Option<Uid> {
        let position = self.staged.iter().position(|&staged| staged == id)?;
        self.added.get(position).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
}

/// Source of claim rounds. Every opened iteration of every context draws a
/// fresh round, so contexts sharing one [`ResourceManager`] never see each
/// other's claims.
static NEXT_CLAIM_ROUND: AtomicU64 = AtomicU64::new(1);

/// Per-iteration mutation boundary.
#[derive(Debug)]
pub struct InPlaceExecutionContext {
    neighbor_guard: bool,
    phase: Phase,
    iteration: u64,
    claim_round: u64,
    started: bool,
    pending: PendingChanges,
    direct_sequence: u32,
}

impl Default for InPlaceExecutionContext {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InPlaceExecutionContext {
    #[must_use]
    pub fn new(neighbor_guard: bool) -> Self {
        Self {
            neighbor_guard,
            phase: Phase::Closed,
            iteration: 0,
            claim_round: 0,
            started: false,
            pending: PendingChanges::default(),
            direct_sequence: 0,
        }
    }

    /// Whether an iteration is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// Index of the current (or last) iteration.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[must_use]
    pub fn neighbor_guard(&self) -> bool {
        self.neighbor_guard
    }

    /// Stop serializing neighborhoods.
    ///
    /// Only sound when no operation writes objects other than the one it
    /// executes for; live neighbor access is refused while disabled.
    pub fn disable_neighbor_guard(&mut self) {
        self.neighbor_guard = false;
    }

    pub fn enable_neighbor_guard(&mut self) {
        self.neighbor_guard = true;
    }

    /// Open a new iteration with empty pending sets.
    pub fn setup_iteration(&mut self) {
        if self.started {
            self.iteration += 1;
        }
        self.started = true;
        self.claim_round = NEXT_CLAIM_ROUND.fetch_add(1, Ordering::Relaxed);
        self.pending = PendingChanges::default();
        self.direct_sequence = 0;
        self.phase = Phase::Open;
    }

    /// Apply `operations` to the object at `handle`, in order.
    ///
    /// Staged additions and removals go to `staged`, which the caller hands
    /// back through [`Self::absorb`] before teardown. With the neighbor guard
    /// on, the object and every object in its surrounding boxes are locked in
    /// handle order for the duration, and executing the same object twice in
    /// one iteration is rejected.
    pub fn execute(
        &self,
        resources: &ResourceManager,
        grid: &Grid,
        handle: Handle,
        operations: &[Arc<dyn Operation>],
        staged: &mut PendingChanges,
    ) -> SimResult<()> {
        if self.phase != Phase::Open {
            return Err(SimError::InvalidState(
                "execute called outside an open iteration",
            ));
        }
        if !grid.is_current(resources) {
            return Err(SimError::InvalidState(
                "grid snapshot is stale; rebuild before executing",
            ));
        }
        let uid = resources.uid_at(handle).ok_or(SimError::InvalidState(
            "handle does not address a committed object",
        ))?;
        if self.neighbor_guard && !resources.claim(handle, self.claim_round) {
            return Err(SimError::InvalidState(
                "object already executed in this iteration",
            ));
        }

        let (own, neighborhood) = if self.neighbor_guard {
            let (own, others) = lock_neighborhood(resources, grid, handle);
            (own, Some(others))
        } else {
            (resources.lock_handle(handle), None)
        };
        let mut object = own.ok_or(SimError::InvalidState(
            "handle does not address a committed object",
        ))?;

        let mut ctx = ObjectContext {
            uid,
            handle,
            iteration: self.iteration,
            resources,
            grid,
            staged,
            sequence: 0,
            neighborhood,
        };
        for operation in operations {
            operation.run(&mut *object, &mut ctx)?;
        }
        Ok(())
    }

    /// Take over changes a worker staged during [`Self::execute`].
    pub fn absorb(&mut self, staged: PendingChanges) {
        self.pending.merge(staged);
    }

    /// Stage an addition from outside [`Self::execute`], e.g. from the
    /// driver between workers finishing and teardown.
    pub fn new_object<T: SimObject>(
        &mut self,
        resources: &ResourceManager,
        object: T,
    ) -> SimResult<StagedId> {
        self.ensure_open("new_object called outside an open iteration")?;
        let tag = resources.type_tag::<T>()?;
        let id = StagedId {
            origin: None,
            sequence: self.direct_sequence,
        };
        self.direct_sequence += 1;
        Ok(self.pending.stage(id, tag, Box::new(object)))
    }

    /// Stage a removal from outside [`Self::execute`].
    pub fn remove_from_simulation(&mut self, resources: &ResourceManager, uid: Uid) -> SimResult<()> {
        self.ensure_open("remove_from_simulation called outside an open iteration")?;
        if !resources.contains(uid) {
            return Err(SimError::NotFound { uid });
        }
        self.pending.removals.push(uid);
        Ok(())
    }

    /// Changes staged so far through [`Self::absorb`] and direct staging.
    #[must_use]
    pub fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    /// Commit the iteration: add staged objects, then apply removals by
    /// swap-and-pop, then let objects fix back-references.
    ///
    /// Every handle issued before this call is invalid afterwards.
    pub fn tear_down_iteration(
        &mut self,
        resources: &mut ResourceManager,
    ) -> SimResult<TeardownReport> {
        self.ensure_open("tear_down_iteration called without an open iteration")?;
        self.phase = Phase::Closed;
        let mut pending = std::mem::take(&mut self.pending);
        pending.normalize();

        let mut report = TeardownReport::default();
        for staged in pending.additions {
            report.added.push(resources.insert_boxed(staged.tag, staged.object)?);
            report.staged.push(staged.id);
        }
        for uid in pending.removals {
            if resources.contains(uid) {
                resources.remove_into(uid, &mut report.remaps)?;
                report.removed.push(uid);
            }
        }
        let visited = resources.apply_remaps(&report.remaps);

        debug!(
            iteration = self.iteration,
            added = report.added.len(),
            removed = report.removed.len(),
            remapped = report.remaps.len(),
            visited,
            objects = resources.len(),
            "iteration committed"
        );
        Ok(report)
    }

    fn ensure_open(&self, message: &'static str) -> SimResult<()> {
        if self.phase == Phase::Open {
            Ok(())
        } else {
            Err(SimError::InvalidState(message))
        }
    }
}

type LockedNeighborhood<'a> = (Option<ObjectGuard<'a>>, Vec<(Handle, ObjectGuard<'a>)>);

/// Lock `handle` and every candidate neighbor in ascending handle order.
///
/// All workers acquire in the same global order, so overlapping
/// neighborhoods cannot deadlock.
fn lock_neighborhood<'a>(
    resources: &'a ResourceManager,
    grid: &Grid,
    handle: Handle,
) -> LockedNeighborhood<'a> {
    let mut handles = vec![handle];
    grid.for_each_candidate(handle, |candidate| handles.push(candidate));
    handles.sort_unstable();
    handles.dedup();

    let mut own = None;
    let mut others = Vec::with_capacity(handles.len().saturating_sub(1));
    for candidate in handles {
        let Some(guard) = resources.lock_handle(candidate) else {
            continue;
        };
        if candidate == handle {
            own = Some(guard);
        } else {
            others.push((candidate, guard));
        }
    }
    (own, others)
}

/// View of the execution context handed to operations for one object.
pub struct ObjectContext<'a> {
    uid: Uid,
    handle: Handle,
    iteration: u64,
    resources: &'a ResourceManager,
    grid: &'a Grid,
    staged: &'a mut PendingChanges,
    sequence: u32,
    neighborhood: Option<Vec<(Handle, ObjectGuard<'a>)>>,
}

impl<'a> ObjectContext<'a> {
    /// UID of the executing object.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Handle of the executing object; valid until teardown.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Whether live neighbor access is available.
    #[must_use]
    pub fn neighbor_guard(&self) -> bool {
        self.neighborhood.is_some()
    }

    /// Largest diameter at the last grid rebuild.
    #[must_use]
    pub fn interaction_radius(&self) -> f64 {
        self.grid.interaction_radius()
    }

    #[must_use]
    pub fn box_length(&self) -> f64 {
        self.grid.box_length()
    }

    /// Returns true while `uid` is committed (objects marked for removal
    /// included).
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.resources.contains(uid)
    }

    /// Radius query against the snapshot built before this iteration.
    ///
    /// Objects staged this iteration are not reported; objects marked for
    /// removal still are.
    pub fn for_each_neighbor_within_radius(
        &self,
        squared_radius: f64,
        f: impl FnMut(&Neighbor),
    ) {
        self.grid
            .for_each_neighbor_within_radius(self.handle, squared_radius, f);
    }

    /// Stage `object` for addition at teardown.
    ///
    /// The returned id reaches the object through [`Self::staged_mut`] for
    /// the rest of this execution, and maps to its UID through
    /// [`TeardownReport::uid_of`] once committed.
    pub fn new_object<T: SimObject>(&mut self, object: T) -> SimResult<StagedId> {
        let tag = self.resources.type_tag::<T>()?;
        let id = StagedId {
            origin: Some(self.uid),
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(self.staged.stage(id, tag, Box::new(object)))
    }

    /// An object this execution staged.
    pub fn staged(&self, id: StagedId) -> SimResult<&dyn SimObject> {
        self.check_stager(id)?;
        self.staged
            .staged(id)
            .ok_or(SimError::InvalidState("no object staged under this id"))
    }

    /// Mutable access to an object this execution staged.
    ///
    /// Staged objects are owned by the executing worker until teardown, so
    /// no lock is involved. Objects staged by other executions are refused.
    pub fn staged_mut(&mut self, id: StagedId) -> SimResult<&mut dyn SimObject> {
        self.check_stager(id)?;
        self.staged
            .staged_mut(id)
            .ok_or(SimError::InvalidState("no object staged under this id"))
    }

    /// Snapshot record of any committed object, inside the locked
    /// neighborhood or not.
    ///
    /// Reads the grid snapshot, so it takes no locks and reports the same
    /// data to every reader of one iteration. `distance_squared` is measured
    /// from the executing object's snapshot position.
    pub fn object_snapshot(&self, uid: Uid) -> SimResult<Neighbor> {
        let handle = self.resources.handle(uid)?;
        self.grid
            .record_of(handle, self.handle)
            .ok_or(SimError::NotFound { uid })
    }

    /// Stage `uid` for removal at teardown. The object stays visible until
    /// then.
    pub fn remove_from_simulation(&mut self, uid: Uid) -> SimResult<()> {
        if !self.resources.contains(uid) {
            return Err(SimError::NotFound { uid });
        }
        self.staged.removals.push(uid);
        Ok(())
    }

    /// Live state of a neighbor locked for this execution.
    pub fn neighbor(&self, uid: Uid) -> SimResult<&dyn SimObject> {
        let position = self.locked_position(uid)?;
        let guards = self.neighborhood.as_ref().ok_or(GUARD_REQUIRED)?;
        Ok(&*guards[position].1)
    }

    /// Mutable live state of a neighbor locked for this execution.
    pub fn neighbor_mut(&mut self, uid: Uid) -> SimResult<&mut dyn SimObject> {
        let position = self.locked_position(uid)?;
        let guards = self.neighborhood.as_mut().ok_or(GUARD_REQUIRED)?;
        Ok(&mut *guards[position].1)
    }

    /// [`Self::neighbor_mut`] downcast to the concrete type `T`.
    pub fn neighbor_mut_as<T: SimObject>(&mut self, uid: Uid) -> SimResult<&mut T> {
        let object = self.neighbor_mut(uid)?;
        let found = object.type_name();
        object.downcast_mut::<T>().ok_or(SimError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found,
        })
    }

    fn check_stager(&self, id: StagedId) -> SimResult<()> {
        if id.origin == Some(self.uid) {
            Ok(())
        } else {
            Err(SimError::InvalidState(
                "object was staged by another execution",
            ))
        }
    }

    fn locked_position(&self, uid: Uid) -> SimResult<usize> {
        let guards = self.neighborhood.as_ref().ok_or(GUARD_REQUIRED)?;
        if uid == self.uid {
            return Err(SimError::InvalidState(
                "the executing object is passed to operations directly",
            ));
        }
        let handle = self.resources.handle(uid)?;
        guards
            .binary_search_by_key(&handle, |(locked, _)| *locked)
            .map_err(|_| SimError::InvalidState("object is outside the locked neighborhood"))
    }
}

const GUARD_REQUIRED: SimError =
    SimError::InvalidState("live neighbor access requires the neighbor guard");
